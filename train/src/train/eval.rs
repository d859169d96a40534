use crate::{
    common::*,
    data::{load_mask, Batch, BatchLoader, EvalParams},
    distributed::Reducer,
    metrics::{format_precision, score_stats, PrecisionTable},
    model::SegmentationModel,
};

/// Brings a `[H, W]` probability map from the input canvas back to the
/// original image and binarizes it.
///
/// The map is first resized to the `canvas_size × canvas_size` input
/// resolution if needed. Pixels outside the letterboxed region are zero.
pub fn reproject_prediction(
    prob: &Tensor,
    params: &EvalParams,
    canvas_size: i64,
    threshold: f64,
) -> Result<Tensor> {
    let (pred_h, pred_w) = prob.size2()?;
    let prob = if (pred_h, pred_w) != (canvas_size, canvas_size) {
        prob.f_resize2d(canvas_size, canvas_size, Interpolation::Bicubic, true)?
    } else {
        prob.shallow_clone()
    };

    let EvalParams {
        ref inverse,
        orig_size,
        ..
    } = *params;
    let warped = prob.f_warp_affine(
        inverse,
        orig_size.h(),
        orig_size.w(),
        Interpolation::Bicubic,
        None,
    )?;
    Ok(warped.f_gt(threshold)?)
}

/// Scores a sample by reprojecting its prediction and comparing with the
/// ground truth mask on disk.
pub fn score_prediction(
    prob: &Tensor,
    params: &EvalParams,
    canvas_size: i64,
    threshold: f64,
    resize_mask: bool,
) -> Result<(Tensor, f64)> {
    let pred = reproject_prediction(prob, params, canvas_size, threshold)?;
    let mask = load_mask(&params.mask_path, resize_mask)?;
    let iou = mask_iou(&pred, &mask)
        .with_context(|| format!("unable to score '{}'", params.mask_path.display()))?;
    Ok((pred, iou))
}

/// Runs inference over the validation shards of all ranks.
pub struct Evaluator<'a> {
    pub reducer: &'a dyn Reducer,
    pub model: &'a dyn SegmentationModel,
    pub device: Device,
    pub canvas_size: i64,
    pub threshold: f64,
    pub resize_mask: bool,
}

impl Evaluator<'_> {
    /// Computes the IoU of every sample in one batch.
    pub fn score_batch(&self, batch: &Batch) -> Result<Vec<f64>> {
        ensure!(
            batch.params.len() == batch.len(),
            "every validation sample must carry evaluation parameters"
        );

        let probs = tch::no_grad(|| -> Result<Tensor> {
            let images = batch.images.to_device(self.device);
            let texts = batch.texts.to_device(self.device);
            let logits = self.model.forward_infer(&images, &texts)?;
            Ok(logits
                .f_sigmoid()?
                .to_kind(Kind::Float)
                .to_device(Device::Cpu))
        })?;

        batch
            .params
            .iter()
            .enumerate()
            .map(|(index, params)| {
                let prob = probs.get(index as i64).get(0);
                let (_, iou) = score_prediction(
                    &prob,
                    params,
                    self.canvas_size,
                    self.threshold,
                    self.resize_mask,
                )?;
                Ok(iou)
            })
            .try_collect()
    }

    /// Scores the local shard, gathers the scores of all ranks and returns
    /// the mean IoU with the precision table.
    pub fn validate(
        &self,
        loader: BatchLoader,
        epoch: usize,
        epochs: usize,
    ) -> Result<(f64, PrecisionTable)> {
        let mut scores = vec![];
        for batch in loader {
            scores.extend(self.score_batch(&batch?)?);
        }

        let local = Tensor::of_slice(&scores);
        let gathered = Vec::<f64>::from(&self.reducer.gather_concat(&local)?);
        let (iou, precision) = score_stats(&gathered)?;

        if self.reducer.is_root() {
            info!(
                "Evaluation: Epoch=[{}/{}]  IoU={:.2}  {}",
                epoch + 1,
                epochs,
                iou * 100.0,
                format_precision(&precision)
            );
        }

        Ok((iou, precision))
    }
}
