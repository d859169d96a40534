//! Inference artifacts and the sinks that persist them.

use crate::common::*;
use image::{GrayImage, RgbImage};

/// Characters escaped in prompt slugs.
const SLUG_ESCAPE_SET: &AsciiSet = &NON_ALPHANUMERIC.remove(b'_').remove(b'-');

/// An image produced by the inference.
#[derive(Debug, Clone)]
pub enum ArtifactImage {
    Rgb(RgbImage),
    Gray(GrayImage),
}

/// An image with the file name it is stored under.
#[derive(Debug, Clone)]
pub struct VisualArtifact {
    pub file_name: String,
    pub image: ArtifactImage,
}

impl VisualArtifact {
    pub fn original_image(seg_id: &str, image: RgbImage) -> Self {
        Self {
            file_name: format!("{}-img.jpg", seg_id),
            image: ArtifactImage::Rgb(image),
        }
    }

    pub fn ground_truth(seg_id: &str, mask: GrayImage) -> Self {
        Self {
            file_name: format!("{}-mask.png", seg_id),
            image: ArtifactImage::Gray(mask),
        }
    }

    /// `iou` is in `[0, 1]` and is written in percent.
    pub fn prediction(seg_id: &str, iou: f64, sentence: &str, mask: GrayImage) -> Self {
        Self {
            file_name: format!(
                "{}-iou={:.2}-{}.png",
                seg_id,
                iou * 100.0,
                prompt_slug(sentence)
            ),
            image: ArtifactImage::Gray(mask),
        }
    }
}

/// Turns a sentence into a file name component.
///
/// Whitespace runs become `_` and everything except ASCII alphanumerics,
/// `_` and `-` is percent-encoded.
pub fn prompt_slug(sentence: &str) -> String {
    let joined = sentence.split_whitespace().join("_");
    utf8_percent_encode(&joined, SLUG_ESCAPE_SET).to_string()
}

/// Converts a `[H, W]` mask to an 8-bit image, multiplying values by `scale`.
pub fn mask_to_image(mask: &Tensor, scale: f64) -> Result<GrayImage> {
    let (height, width) = mask.size2()?;
    let pixels = (mask.to_device(Device::Cpu).to_kind(Kind::Float) * scale)
        .f_clamp(0.0, 255.0)?
        .f_round()?
        .to_kind(Kind::Uint8)
        .reshape(&[-1]);
    let pixels = Vec::<u8>::from(&pixels);

    GrayImage::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| format_err!("unable to build a {}x{} image", height, width))
}

/// Receives inference artifacts.
pub trait ArtifactSink {
    fn write(&mut self, artifact: &VisualArtifact) -> Result<()>;
}

/// Writes artifacts as image files into a directory.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    pub fn new<P>(dir: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)
            .with_context(|| format!("unable to create directory '{}'", dir.display()))?;
        Ok(Self {
            dir: dir.to_owned(),
        })
    }
}

impl ArtifactSink for DirectorySink {
    fn write(&mut self, artifact: &VisualArtifact) -> Result<()> {
        let path = self.dir.join(&artifact.file_name);
        match &artifact.image {
            ArtifactImage::Rgb(image) => image.save(&path),
            ArtifactImage::Gray(image) => image.save(&path),
        }
        .with_context(|| format!("unable to write '{}'", path.display()))?;
        Ok(())
    }
}
