//! The model adaptor.

use crate::{
    common::*,
    config::{BaselineModelConfig, ModelConfig},
};

/// The training-mode output of a model.
#[derive(Debug)]
pub struct ModelOutput {
    /// `[N, 1, h, w]` logits.
    pub pred: Tensor,
    /// The target resized to the prediction resolution.
    pub target: Tensor,
    pub loss: Tensor,
}

/// A referring segmentation network.
pub trait SegmentationModel
where
    Self: Send + std::fmt::Debug,
{
    /// `images` is `[N, 3, H, W]`, `texts` is `[N, L]` and `targets` is `[N, 1, H, W]`.
    fn forward_train(&self, images: &Tensor, texts: &Tensor, targets: &Tensor)
        -> Result<ModelOutput>;

    /// Returns `[N, 1, h, w]` logits.
    fn forward_infer(&self, images: &Tensor, texts: &Tensor) -> Result<Tensor>;
}

/// The generic model adaptor.
#[derive(Debug)]
pub enum Model {
    Baseline(BaselineModel),
}

impl Model {
    /// Builds a model adaptor from the configuration.
    pub fn new<'a>(path: impl Borrow<nn::Path<'a>>, config: &ModelConfig) -> Result<Self> {
        match config {
            ModelConfig::Baseline(config) => Ok(Self::Baseline(BaselineModel::new(path, config)?)),
        }
    }
}

impl SegmentationModel for Model {
    fn forward_train(
        &self,
        images: &Tensor,
        texts: &Tensor,
        targets: &Tensor,
    ) -> Result<ModelOutput> {
        match self {
            Self::Baseline(model) => model.forward_train(images, texts, targets),
        }
    }

    fn forward_infer(&self, images: &Tensor, texts: &Tensor) -> Result<Tensor> {
        match self {
            Self::Baseline(model) => model.forward_infer(images, texts),
        }
    }
}

/// A convolutional image encoder modulated by a bag-of-words text embedding.
///
/// The prediction is at a quarter of the input resolution.
#[derive(Debug)]
pub struct BaselineModel {
    conv1: nn::Conv2D,
    conv2: nn::Conv2D,
    embedding: nn::Embedding,
    text_proj: nn::Linear,
    head: nn::Conv2D,
}

impl BaselineModel {
    pub fn new<'a>(path: impl Borrow<nn::Path<'a>>, config: &BaselineModelConfig) -> Result<Self> {
        let path = path.borrow();
        let BaselineModelConfig {
            vocab_size,
            embed_dim,
            hidden_channels,
        } = *config;
        let hidden = hidden_channels.get() as i64;
        let embed_dim = embed_dim.get() as i64;

        let strided = nn::ConvConfig {
            stride: 2,
            padding: 1,
            ..Default::default()
        };

        Ok(Self {
            conv1: nn::conv2d(path / "conv1", 3, hidden, 3, strided),
            conv2: nn::conv2d(path / "conv2", hidden, hidden, 3, strided),
            embedding: nn::embedding(
                path / "embedding",
                vocab_size.get() as i64,
                embed_dim,
                Default::default(),
            ),
            text_proj: nn::linear(path / "text_proj", embed_dim, hidden, Default::default()),
            head: nn::conv2d(path / "head", hidden, 1, 1, Default::default()),
        })
    }

    fn forward(&self, images: &Tensor, texts: &Tensor) -> Result<Tensor> {
        let (batch_size, _, _, _) = images.size4()?;
        let (text_batch_size, _) = texts.size2()?;
        ensure!(
            batch_size == text_batch_size,
            "batch size mismatch between images ({}) and texts ({})",
            batch_size,
            text_batch_size
        );

        let visual = images.apply(&self.conv1).relu().apply(&self.conv2).relu();

        // mean of the embeddings of non-padding tokens
        let valid = texts.ne(0i64).to_kind(Kind::Float).unsqueeze(-1);
        let words = texts.apply(&self.embedding) * &valid;
        let num_words = valid.sum_dim_intlist(&[1], false, Kind::Float).clamp_min(1.0);
        let sentence = words.sum_dim_intlist(&[1], false, Kind::Float) / num_words;
        let sentence = sentence
            .apply(&self.text_proj)
            .tanh()
            .view([batch_size, -1, 1, 1]);

        let logits = (visual * sentence).apply(&self.head);
        Ok(logits)
    }
}

impl SegmentationModel for BaselineModel {
    fn forward_train(
        &self,
        images: &Tensor,
        texts: &Tensor,
        targets: &Tensor,
    ) -> Result<ModelOutput> {
        let pred = self.forward(images, texts)?;
        let (_, _, pred_h, pred_w) = pred.size4()?;
        let (_, _, target_h, target_w) = targets.size4()?;

        let target = if (pred_h, pred_w) != (target_h, target_w) {
            targets
                .f_resize2d(pred_h, pred_w, Interpolation::Nearest, false)?
                .detach()
        } else {
            targets.shallow_clone()
        };
        let loss = pred.binary_cross_entropy_with_logits::<Tensor>(
            &target.to_kind(pred.kind()),
            None,
            None,
            Reduction::Mean,
        );

        Ok(ModelOutput { pred, target, loss })
    }

    fn forward_infer(&self, images: &Tensor, texts: &Tensor) -> Result<Tensor> {
        self.forward(images, texts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn model(vs: &nn::VarStore) -> Result<Model> {
        Model::new(
            vs.root(),
            &ModelConfig::Baseline(BaselineModelConfig {
                vocab_size: NonZeroUsize::new(50).unwrap(),
                embed_dim: NonZeroUsize::new(8).unwrap(),
                hidden_channels: NonZeroUsize::new(4).unwrap(),
            }),
        )
    }

    #[test]
    fn output_shapes() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let model = model(&vs)?;
        let images = Tensor::randn(&[2, 3, 32, 32], (Kind::Float, Device::Cpu));
        let texts = Tensor::of_slice(&[48i64, 3, 49, 0, 48, 7, 9, 49]).view([2, 4]);
        let targets = Tensor::ones(&[2, 1, 32, 32], (Kind::Float, Device::Cpu));

        let ModelOutput { pred, target, loss } = model.forward_train(&images, &texts, &targets)?;
        assert_eq!(pred.size(), vec![2, 1, 8, 8]);
        assert_eq!(target.size(), vec![2, 1, 8, 8]);
        assert_abs_diff_eq!(target.mean(Kind::Double).double_value(&[]), 1.0);
        assert!(loss.double_value(&[]).is_finite());

        let logits = model.forward_infer(&images, &texts)?;
        assert_eq!(logits.size(), vec![2, 1, 8, 8]);
        Ok(())
    }

    #[test]
    fn reject_batch_mismatch() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let model = model(&vs)?;
        let images = Tensor::randn(&[2, 3, 16, 16], (Kind::Float, Device::Cpu));
        let texts = Tensor::zeros(&[3, 4], (Kind::Int64, Device::Cpu));
        assert!(model.forward_infer(&images, &texts).is_err());
        Ok(())
    }
}
