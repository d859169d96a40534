use crate::{common::*, AffineTransform, HW};

/// The aspect-preserving, centered fit of an image into a fixed canvas.
///
/// `forward` maps original pixel coordinates into the canvas and
/// `inverse` maps canvas coordinates back. Both are solved from the same
/// three anchor corners of the original image.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Letterbox<T> {
    pub forward: AffineTransform<T>,
    pub inverse: AffineTransform<T>,
}

impl<T> Letterbox<T>
where
    T: Float,
{
    pub fn new(src_size: HW<T>, tgt_size: HW<T>) -> Result<Self> {
        let [src_h, src_w] = src_size.hw();
        let [tgt_h, tgt_w] = tgt_size.hw();

        let scale = (tgt_h / src_h).min(tgt_w / src_w);
        let new_h = src_h * scale;
        let new_w = src_w * scale;

        let two = T::one() + T::one();
        let bias_x = (tgt_w - new_w) / two;
        let bias_y = (tgt_h - new_h) / two;

        let src = Self::anchors(src_size);
        let dst = [
            [bias_x, bias_y],
            [new_w + bias_x, bias_y],
            [bias_x, new_h + bias_y],
        ];

        let forward = AffineTransform::from_points(src, dst)?;
        let inverse = AffineTransform::from_points(dst, src)?;

        Ok(Self { forward, inverse })
    }

    /// Top-left, top-right and bottom-left corners as `[x, y]` points.
    pub fn anchors(size: HW<T>) -> [[T; 2]; 3] {
        let zero = T::zero();
        let [h, w] = size.hw();
        [[zero, zero], [w, zero], [zero, h]]
    }
}
