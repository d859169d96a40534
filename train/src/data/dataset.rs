use super::{choose_sentence, select_sentences, LazyStore, PromptType, SampleRecord, Tokenizer};
use crate::common::*;
use image::{imageops::FilterType, GrayImage, RgbImage};

/// The side length used when the global resize flag is set.
pub const RESIZE_SIDE: u32 = 224;

/// Per-channel mean of the normalization, also used as the letterbox border colour.
pub const PIXEL_MEAN: [f64; 3] = [0.48145466, 0.4578275, 0.40821073];
pub const PIXEL_STD: [f64; 3] = [0.26862954, 0.26130258, 0.27577711];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatasetMode {
    Train,
    Val,
    Test,
}

/// What the evaluation needs to bring a prediction back to the original image.
#[derive(Debug, Clone)]
pub struct EvalParams {
    pub mask_path: PathBuf,
    /// Maps input canvas coordinates to original image coordinates.
    pub inverse: AffineTransform<f64>,
    /// The image size before letterboxing, after the optional global resize.
    pub orig_size: HW<i64>,
}

/// One preprocessed sample.
#[derive(Debug)]
pub struct DataItem {
    /// `[3, S, S]` normalized image.
    pub image: Tensor,
    /// `[L]` token ids.
    pub text: Tensor,
    /// `[1, S, S]` mask in `[0, 1]`, only in training mode.
    pub target: Option<Tensor>,
    /// Only in validation mode.
    pub params: Option<EvalParams>,
}

/// A test sample with every candidate sentence.
#[derive(Debug)]
pub struct TestItem {
    pub image: Tensor,
    pub orig_image: RgbImage,
    pub mask_name: String,
    pub sentences: Vec<String>,
    pub params: EvalParams,
}

/// Referring segmentation samples backed by a lazily opened store.
pub struct RefDataset {
    store: LazyStore,
    tokenizer: Arc<dyn Tokenizer>,
    mask_root: PathBuf,
    mode: DatasetMode,
    input_size: i64,
    word_length: usize,
    prompt_type: PromptType,
    resize: bool,
}

impl std::fmt::Debug for RefDataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefDataset")
            .field("store", &self.store)
            .field("mode", &self.mode)
            .field("input_size", &self.input_size)
            .field("word_length", &self.word_length)
            .field("prompt_type", &self.prompt_type)
            .field("resize", &self.resize)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct RefDatasetInit {
    pub mask_root: PathBuf,
    pub mode: DatasetMode,
    pub input_size: usize,
    pub word_length: usize,
    pub prompt_type: PromptType,
    pub resize: bool,
}

impl RefDatasetInit {
    pub fn build(self, store: LazyStore, tokenizer: Arc<dyn Tokenizer>) -> Result<RefDataset> {
        let Self {
            mask_root,
            mode,
            input_size,
            word_length,
            prompt_type,
            resize,
        } = self;
        ensure!(input_size > 0, "input_size must be positive");
        ensure!(word_length >= 2, "word_length must be at least 2");

        Ok(RefDataset {
            store,
            tokenizer,
            mask_root,
            mode,
            input_size: input_size as i64,
            word_length,
            prompt_type,
            resize,
        })
    }
}

impl RefDataset {
    pub fn mode(&self) -> DatasetMode {
        self.mode
    }

    pub fn len(&self) -> Result<usize> {
        self.store.len()
    }

    pub fn is_empty(&self) -> Result<bool> {
        self.store.is_empty()
    }

    /// The side length of the square input canvas.
    pub fn input_size(&self) -> i64 {
        self.input_size
    }

    /// Whether images and masks are resized to 224x224 before letterboxing.
    pub fn resize(&self) -> bool {
        self.resize
    }

    /// Tokenizes a sentence to `[L]` ids, truncating over-long input.
    pub fn tokenize(&self, sentence: &str) -> Result<Tensor> {
        self.tokenizer.tokenize(sentence, self.word_length, true)
    }

    /// Loads the sample at `index` in training or validation mode.
    pub fn get<R>(&self, index: usize, rng: &mut R) -> Result<DataItem>
    where
        R: Rng + ?Sized,
    {
        let record = self.store.nth(index)?;
        let sentences = select_sentences(&record, &self.prompt_type, rng)?;

        match self.mode {
            DatasetMode::Train => {
                let sentence = choose_sentence(&sentences, rng)?;
                let text = self.tokenize(sentence)?;
                let (image, letterbox) = self.load_image(&record)?;
                let target = self.load_target(&record, &letterbox)?;

                Ok(DataItem {
                    image,
                    text,
                    target: Some(target),
                    params: None,
                })
            }
            DatasetMode::Val => {
                let sentence = sentences
                    .first()
                    .ok_or_else(|| format_err!("empty sentence list"))?;
                let text = self.tokenize(sentence)?;
                let (image, letterbox, orig_size) = {
                    let rgb = self.decode_image(&record)?;
                    let orig_size = image_size(rgb.height(), rgb.width())?;
                    let (image, letterbox) = self.letterbox_image(&rgb)?;
                    (image, letterbox, orig_size)
                };

                Ok(DataItem {
                    image,
                    text,
                    target: None,
                    params: Some(EvalParams {
                        mask_path: self.mask_root.join(&record.mask_name),
                        inverse: letterbox.inverse,
                        orig_size,
                    }),
                })
            }
            DatasetMode::Test => bail!("use test_item() to load test samples"),
        }
    }

    /// Loads the sample at `index` with all sentences of the selected prompt type.
    pub fn test_item<R>(&self, index: usize, rng: &mut R) -> Result<TestItem>
    where
        R: Rng + ?Sized,
    {
        ensure!(
            self.mode == DatasetMode::Test,
            "test_item() requires a dataset in test mode"
        );
        let record = self.store.nth(index)?;
        let sentences: Vec<String> = select_sentences(&record, &self.prompt_type, rng)?
            .into_iter()
            .map(|sentence| sentence.to_string())
            .collect();

        let orig_image = image::load_from_memory(&record.image_bytes)
            .with_context(|| format!("unable to decode the image of '{}'", record.mask_name))?
            .to_rgb8();
        let rgb = self.maybe_resize_rgb(&orig_image);
        let orig_size = image_size(rgb.height(), rgb.width())?;
        let (image, letterbox) = self.letterbox_image(&rgb)?;

        Ok(TestItem {
            image,
            orig_image,
            mask_name: record.mask_name.clone(),
            sentences,
            params: EvalParams {
                mask_path: self.mask_root.join(&record.mask_name),
                inverse: letterbox.inverse,
                orig_size,
            },
        })
    }

    fn decode_image(&self, record: &SampleRecord) -> Result<RgbImage> {
        let rgb = image::load_from_memory(&record.image_bytes)
            .with_context(|| format!("unable to decode the image of '{}'", record.mask_name))?
            .to_rgb8();
        Ok(self.maybe_resize_rgb(&rgb))
    }

    fn maybe_resize_rgb(&self, rgb: &RgbImage) -> RgbImage {
        if self.resize {
            image::imageops::resize(rgb, RESIZE_SIDE, RESIZE_SIDE, FilterType::Triangle)
        } else {
            rgb.clone()
        }
    }

    fn load_image(&self, record: &SampleRecord) -> Result<(Tensor, Letterbox<f64>)> {
        let rgb = self.decode_image(record)?;
        self.letterbox_image(&rgb)
    }

    fn letterbox_image(&self, rgb: &RgbImage) -> Result<(Tensor, Letterbox<f64>)> {
        let size = image_size(rgb.height(), rgb.width())?;
        let letterbox = Letterbox::new(size.cast::<f64>(), self.canvas_size()?)?;

        let image = Tensor::of_slice(rgb.as_raw())
            .view([size.h(), size.w(), 3])
            .permute(&[2, 0, 1])
            .to_kind(Kind::Float);
        let border: Vec<f64> = PIXEL_MEAN.iter().map(|mean| mean * 255.0).collect();
        let image = image.f_warp_affine(
            &letterbox.forward,
            self.input_size,
            self.input_size,
            Interpolation::Bicubic,
            Some(&border),
        )?;

        Ok((normalize(&image)?, letterbox))
    }

    fn load_target(&self, record: &SampleRecord, letterbox: &Letterbox<f64>) -> Result<Tensor> {
        let bytes = record
            .mask_bytes
            .as_ref()
            .ok_or_else(|| format_err!("the record '{}' has no mask", record.mask_name))?;
        let mask = image::load_from_memory(bytes)
            .with_context(|| format!("unable to decode the mask of '{}'", record.mask_name))?
            .to_luma8();
        let mask = if self.resize {
            image::imageops::resize(&mask, RESIZE_SIDE, RESIZE_SIDE, FilterType::Triangle)
        } else {
            mask
        };

        let size = image_size(mask.height(), mask.width())?;
        let mask = gray_to_tensor(&mask, size).f_warp_affine(
            &letterbox.forward,
            self.input_size,
            self.input_size,
            Interpolation::Bilinear,
            None,
        )?;
        Ok((mask / 255.0).unsqueeze(0))
    }

    fn canvas_size(&self) -> Result<HW<f64>> {
        HW::try_from_hw([self.input_size as f64, self.input_size as f64])
    }
}

/// Loads a ground truth mask as a `[H, W]` float tensor.
///
/// With `resize`, the mask is resized to 224x224 and scaled to `[0, 1]`.
/// Otherwise pixel values are kept as stored.
pub fn load_mask<P>(path: P, resize: bool) -> Result<Tensor>
where
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let mask = image::open(path)
        .with_context(|| format!("unable to open mask file '{}'", path.display()))?
        .to_luma8();

    let tensor = if resize {
        let mask = image::imageops::resize(&mask, RESIZE_SIDE, RESIZE_SIDE, FilterType::Triangle);
        let size = image_size(mask.height(), mask.width())?;
        gray_to_tensor(&mask, size) / 255.0
    } else {
        let size = image_size(mask.height(), mask.width())?;
        gray_to_tensor(&mask, size)
    };
    Ok(tensor)
}

fn image_size(height: u32, width: u32) -> Result<HW<i64>> {
    HW::try_from_hw([height as i64, width as i64])
        .with_context(|| format!("invalid image size {}x{}", height, width))
}

fn gray_to_tensor(mask: &GrayImage, size: HW<i64>) -> Tensor {
    Tensor::of_slice(mask.as_raw())
        .view([size.h(), size.w()])
        .to_kind(Kind::Float)
}

/// Scales a `[3, H, W]` image in `[0, 255]` and normalizes it per channel.
fn normalize(image: &Tensor) -> Result<Tensor> {
    let mean = Tensor::of_slice(&PIXEL_MEAN)
        .to_kind(Kind::Float)
        .view([3, 1, 1]);
    let std = Tensor::of_slice(&PIXEL_STD)
        .to_kind(Kind::Float)
        .view([3, 1, 1]);
    let normalized = (image / 255.0).f_sub(&mean)?.f_div(&std)?;
    Ok(normalized)
}
