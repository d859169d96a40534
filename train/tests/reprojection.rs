use anyhow::Result;
use approx::assert_abs_diff_eq;
use letterbox::{Letterbox, HW};
use refseg_train::{data::EvalParams, train::reproject_prediction};
use std::path::PathBuf;
use tch::{Device, Kind, Tensor};
use tch_goodies::{mask_iou, Interpolation, TensorExt};

fn square_mask(size: i64, offset: i64, side: i64) -> Tensor {
    let mask = Tensor::zeros(&[size, size], (Kind::Float, Device::Cpu));
    let _ = mask.narrow(0, offset, side).narrow(1, offset, side).fill_(1.0);
    mask
}

#[test]
fn square_survives_letterbox_round_trip() -> Result<()> {
    let mask = square_mask(20, 5, 10);
    let letterbox = Letterbox::new(
        HW::try_from_hw([20.0, 20.0])?,
        HW::try_from_hw([32.0, 32.0])?,
    )?;

    // the prediction equals the mask as seen by the model
    let prob = mask.f_warp_affine(&letterbox.forward, 32, 32, Interpolation::Bilinear, None)?;
    let params = EvalParams {
        mask_path: PathBuf::new(),
        inverse: letterbox.inverse,
        orig_size: HW::try_from_hw([20, 20])?,
    };

    let pred = reproject_prediction(&prob, &params, 32, 0.35)?;
    assert_eq!(pred.size(), vec![20, 20]);
    assert_abs_diff_eq!(mask_iou(&pred, &mask)?, 1.0, epsilon = 1e-3);
    Ok(())
}

#[test]
fn non_square_image_round_trip() -> Result<()> {
    // a 24x40 image with a 12x16 block, letterboxed into rows of a 32x32 canvas
    let mask = Tensor::zeros(&[24, 40], (Kind::Float, Device::Cpu));
    let _ = mask.narrow(0, 6, 12).narrow(1, 12, 16).fill_(1.0);
    let letterbox = Letterbox::new(
        HW::try_from_hw([24.0, 40.0])?,
        HW::try_from_hw([32.0, 32.0])?,
    )?;

    let prob = mask.f_warp_affine(&letterbox.forward, 32, 32, Interpolation::Bilinear, None)?;
    let params = EvalParams {
        mask_path: PathBuf::new(),
        inverse: letterbox.inverse,
        orig_size: HW::try_from_hw([24, 40])?,
    };

    let pred = reproject_prediction(&prob, &params, 32, 0.35)?;
    assert_eq!(pred.size(), vec![24, 40]);
    assert!(mask_iou(&pred, &mask)? > 0.8);
    Ok(())
}
