use super::eval::reproject_prediction;
use crate::{
    common::*,
    data::{load_mask, RefDataset, TestItem},
    metrics::{format_precision, score_stats, PrecisionTable},
    model::SegmentationModel,
    visualize::{mask_to_image, ArtifactSink, VisualArtifact},
};

/// The IoU of one prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptScore {
    pub sentence: String,
    pub iou: f64,
}

/// Results and artifacts of one test sample.
#[derive(Debug, Clone)]
pub struct SampleInference {
    pub seg_id: String,
    pub scores: Vec<PromptScore>,
    /// Empty unless visualization is enabled.
    pub artifacts: Vec<VisualArtifact>,
}

/// Scores every prompt of the test samples.
pub struct Inferencer<'a> {
    pub model: &'a dyn SegmentationModel,
    pub device: Device,
    pub threshold: f64,
    pub visualize: bool,
}

impl Inferencer<'_> {
    /// Runs the model once per sentence of the item.
    pub fn infer_item(&self, dataset: &RefDataset, item: &TestItem) -> Result<SampleInference> {
        let TestItem {
            image,
            orig_image,
            mask_name,
            sentences,
            params,
        } = item;
        let seg_id = Path::new(mask_name)
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or(mask_name)
            .to_string();

        let resize = dataset.resize();
        let mask = load_mask(&params.mask_path, resize)?;
        let image = image.to_device(self.device).unsqueeze(0);

        let mut artifacts = vec![];
        if self.visualize {
            let mask_scale = if resize { 255.0 } else { 1.0 };
            artifacts.push(VisualArtifact::original_image(&seg_id, orig_image.clone()));
            artifacts.push(VisualArtifact::ground_truth(
                &seg_id,
                mask_to_image(&mask, mask_scale)?,
            ));
        }

        let mut scores = vec![];
        for sentence in sentences {
            let text = dataset.tokenize(sentence)?.to_device(self.device).unsqueeze(0);
            let prob = tch::no_grad(|| -> Result<Tensor> {
                let logits = self.model.forward_infer(&image, &text)?;
                Ok(logits
                    .f_sigmoid()?
                    .to_kind(Kind::Float)
                    .to_device(Device::Cpu)
                    .get(0)
                    .get(0))
            })?;

            let pred = reproject_prediction(&prob, params, dataset.input_size(), self.threshold)?;
            let iou = mask_iou(&pred, &mask)
                .with_context(|| format!("unable to score '{}'", params.mask_path.display()))?;
            debug!("{}: IoU={:.2} '{}'", seg_id, iou * 100.0, sentence);

            if self.visualize {
                artifacts.push(VisualArtifact::prediction(
                    &seg_id,
                    iou,
                    sentence,
                    mask_to_image(&pred, 255.0)?,
                ));
            }
            scores.push(PromptScore {
                sentence: sentence.clone(),
                iou,
            });
        }

        Ok(SampleInference {
            seg_id,
            scores,
            artifacts,
        })
    }

    /// Scores the whole test set and hands artifacts to the sink.
    ///
    /// Returns the mean IoU over all prompts with the precision table.
    pub fn run<R>(
        &self,
        dataset: &RefDataset,
        rng: &mut R,
        mut sink: Option<&mut dyn ArtifactSink>,
    ) -> Result<(f64, PrecisionTable)>
    where
        R: Rng + ?Sized,
    {
        let len = dataset.len()?;
        let mut ious = vec![];

        for index in 0..len {
            let item = dataset.test_item(index, rng)?;
            let SampleInference {
                scores, artifacts, ..
            } = self.infer_item(dataset, &item)?;

            if let Some(sink) = sink.as_mut() {
                for artifact in &artifacts {
                    sink.write(artifact)?;
                }
            }
            ious.extend(scores.into_iter().map(|score| score.iou));
        }

        let (iou, precision) = score_stats(&ious)?;
        info!(
            "Inference: {} prompts  IoU={:.2}  {}",
            ious.len(),
            iou * 100.0,
            format_precision(&precision)
        );
        Ok((iou, precision))
    }
}
