use crate::common::*;

/// Pixel interpolation used when resampling images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interpolation {
    Bilinear,
    Nearest,
    Bicubic,
}

impl Interpolation {
    // See https://github.com/pytorch/pytorch/blob/f597ac6efc70431e66d945c16fa12b767989b032/aten/src/ATen/native/GridSampler.h#L10-L11
    fn grid_sampler_mode(&self) -> i64 {
        match self {
            Self::Bilinear => 0,
            Self::Nearest => 1,
            Self::Bicubic => 2,
        }
    }
}

pub trait TensorExt {
    /// Warps a `[H, W]` or `[C, H, W]` image into an `out_h × out_w` canvas.
    ///
    /// The transform maps source pixel coordinates to destination pixel
    /// coordinates, the same convention as OpenCV's `warpAffine`. Pixels
    /// that map outside the source take the per-channel `border` value, or
    /// zero if it is not given.
    fn f_warp_affine(
        &self,
        transform: &AffineTransform<f64>,
        out_h: i64,
        out_w: i64,
        interpolation: Interpolation,
        border: Option<&[f64]>,
    ) -> Result<Tensor>;

    fn warp_affine(
        &self,
        transform: &AffineTransform<f64>,
        out_h: i64,
        out_w: i64,
        interpolation: Interpolation,
        border: Option<&[f64]>,
    ) -> Tensor {
        self.f_warp_affine(transform, out_h, out_w, interpolation, border)
            .unwrap()
    }

    /// Resizes a `[H, W]`, `[C, H, W]` or `[N, C, H, W]` tensor to the
    /// exact size, without preserving aspect ratio.
    fn f_resize2d(
        &self,
        new_h: i64,
        new_w: i64,
        interpolation: Interpolation,
        align_corners: bool,
    ) -> Result<Tensor>;

    fn resize2d(
        &self,
        new_h: i64,
        new_w: i64,
        interpolation: Interpolation,
        align_corners: bool,
    ) -> Tensor {
        self.f_resize2d(new_h, new_w, interpolation, align_corners)
            .unwrap()
    }

    fn f_sum_tensors<T>(tensors: impl IntoIterator<Item = T>) -> Result<Tensor>
    where
        T: Borrow<Tensor>,
    {
        let mut iter = tensors.into_iter();
        let first = iter
            .next()
            .ok_or_else(|| format_err!("the input iterator must not be empty"))?
            .borrow()
            .shallow_clone();
        let sum = iter.try_fold(first, |lhs, rhs| lhs.f_add(rhs.borrow()))?;
        Ok(sum)
    }
}

impl TensorExt for Tensor {
    fn f_warp_affine(
        &self,
        transform: &AffineTransform<f64>,
        out_h: i64,
        out_w: i64,
        interpolation: Interpolation,
        border: Option<&[f64]>,
    ) -> Result<Tensor> {
        ensure!(
            out_h > 0 && out_w > 0,
            "output size must be positive, but get {}x{}",
            out_h,
            out_w
        );

        let (channels, in_h, in_w, is_2d) = match self.size().as_slice() {
            &[h, w] => (1, h, w, true),
            &[c, h, w] => (c, h, w, false),
            shape => bail!(
                "expect a [H, W] or [C, H, W] tensor, but get shape {:?}",
                shape
            ),
        };
        ensure!(in_h > 0 && in_w > 0, "the input image must not be empty");

        tch::no_grad(|| {
            let device = self.device();
            let orig_kind = self.kind();

            // sampling positions are computed in destination space, so the
            // transform is inverted to map each destination pixel back
            let [[a, b, c], [d, e, f]] = transform.inverse()?.matrix();

            let xs = Tensor::arange(out_w, (Kind::Double, device))
                .view([1, out_w])
                .expand(&[out_h, out_w], false);
            let ys = Tensor::arange(out_h, (Kind::Double, device))
                .view([out_h, 1])
                .expand(&[out_h, out_w], false);
            let src_x = &xs * a + &ys * b + c;
            let src_y = &xs * d + &ys * e + f;

            // normalize pixel indices to [-1, 1] with align_corners=false
            let grid_x = (src_x * 2.0 + 1.0) / in_w as f64 - 1.0;
            let grid_y = (src_y * 2.0 + 1.0) / in_h as f64 - 1.0;
            let grid = Tensor::stack(&[grid_x, grid_y], 2)
                .unsqueeze(0)
                .to_kind(Kind::Float);

            let input = self
                .to_kind(Kind::Float)
                .reshape(&[1, channels, in_h, in_w]);

            // shift the border value to zero so that zero padding fills it
            let border = border
                .map(|values| -> Result<_> {
                    ensure!(
                        values.len() as i64 == channels,
                        "expect {} border values, but get {}",
                        channels,
                        values.len()
                    );
                    let border = Tensor::of_slice(values)
                        .to_kind(Kind::Float)
                        .to_device(device)
                        .view([1, channels, 1, 1]);
                    Ok(border)
                })
                .transpose()?;
            let input = match &border {
                Some(border) => input - border,
                None => input,
            };

            let output = input.grid_sampler(&grid, interpolation.grid_sampler_mode(), 0, false);
            let output = match &border {
                Some(border) => output + border,
                None => output,
            };

            let output = if is_2d {
                output.view([out_h, out_w])
            } else {
                output.view([channels, out_h, out_w])
            };

            let output = match orig_kind {
                Kind::Float | Kind::Double | Kind::Half => output.to_kind(orig_kind),
                _ => output,
            };

            Ok(output)
        })
    }

    fn f_resize2d(
        &self,
        new_h: i64,
        new_w: i64,
        interpolation: Interpolation,
        align_corners: bool,
    ) -> Result<Tensor> {
        ensure!(
            new_h > 0 && new_w > 0,
            "output size must be positive, but get {}x{}",
            new_h,
            new_w
        );

        let orig_shape = self.size();
        let input = match orig_shape.as_slice() {
            &[h, w] => self.reshape(&[1, 1, h, w]),
            &[c, h, w] => self.reshape(&[1, c, h, w]),
            &[_n, _c, _h, _w] => self.shallow_clone(),
            shape => bail!("expect a 2, 3 or 4 dimensional tensor, but get {:?}", shape),
        };
        let input = match input.kind() {
            Kind::Float | Kind::Double | Kind::Half => input,
            _ => input.to_kind(Kind::Float),
        };

        let size = [new_h, new_w];
        let output = match interpolation {
            Interpolation::Bilinear => {
                input.upsample_bilinear2d(&size, align_corners, None::<f64>, None::<f64>)
            }
            Interpolation::Bicubic => {
                input.upsample_bicubic2d(&size, align_corners, None::<f64>, None::<f64>)
            }
            Interpolation::Nearest => input.upsample_nearest2d(&size, None::<f64>, None::<f64>),
        };

        let output = match orig_shape.len() {
            2 => output.view([new_h, new_w]),
            3 => output.view([orig_shape[0], new_h, new_w]),
            _ => output,
        };

        Ok(output)
    }
}
