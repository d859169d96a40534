//! Training program configuration format.

use crate::{common::*, data::PromptType};

pub use dataset::*;
pub use model::*;
pub use training::*;

/// The main training configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub model: ModelConfig,
    pub dataset: DatasetConfig,
    pub logging: LoggingConfig,
    pub training: TrainingConfig,
    #[serde(default)]
    pub evaluation: EvaluationConfig,
}

impl Config {
    pub fn open<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let text = std::fs::read_to_string(path)?;
        let config: Self = json5::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let num_devices = self.training.device_config.devices().len();
        ensure!(num_devices > 0, "at least one device must be configured");
        ensure!(
            self.training.batch_size.get() % num_devices == 0,
            "batch_size must be multiple of number of devices"
        );
        ensure!(
            self.training.batch_size_val.get() % num_devices == 0,
            "batch_size_val must be multiple of number of devices"
        );
        ensure!(
            self.training.start_epoch <= self.training.epochs,
            "start_epoch must not exceed epochs"
        );
        Ok(())
    }

    /// The directory where checkpoints and events are written.
    pub fn output_dir(&self) -> PathBuf {
        self.logging.dir.join(&self.logging.exp_name)
    }
}

mod model {
    use super::*;

    /// The model configuration.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(tag = "kind")]
    pub enum ModelConfig {
        /// A small convolutional image encoder fused with a bag-of-words text encoder.
        Baseline(BaselineModelConfig),
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct BaselineModelConfig {
        pub vocab_size: NonZeroUsize,
        pub embed_dim: NonZeroUsize,
        pub hidden_channels: NonZeroUsize,
    }

    impl ModelConfig {
        pub fn vocab_size(&self) -> usize {
            match self {
                Self::Baseline(config) => config.vocab_size.get(),
            }
        }
    }
}

/// Data logging options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub dir: PathBuf,
    pub exp_name: String,
}

mod dataset {
    use super::*;

    /// Dataset options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct DatasetConfig {
        pub train_dir: PathBuf,
        pub val_dir: PathBuf,
        pub test_dir: Option<PathBuf>,
        /// The directory holding ground truth masks for evaluation.
        pub mask_root: PathBuf,
        /// The side length of the square model input.
        pub input_size: NonZeroUsize,
        /// The token length of text inputs.
        pub word_length: NonZeroUsize,
        pub prompt_type: PromptType,
        /// If set, images and masks are resized to 224x224 before letterboxing.
        #[serde(default)]
        pub resize: bool,
        /// The number of batches buffered by the loader.
        #[serde(default = "default_prefetch")]
        pub prefetch: NonZeroUsize,
    }

    fn default_prefetch() -> NonZeroUsize {
        NonZeroUsize::new(4).unwrap()
    }
}

/// Evaluation options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationConfig {
    /// The decision threshold on sigmoid probabilities.
    #[serde(default = "default_threshold")]
    pub threshold: R64,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
        }
    }
}

fn default_threshold() -> R64 {
    r64(0.35)
}

mod training {
    use super::*;

    /// The training options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct TrainingConfig {
        pub epochs: usize,
        #[serde(default)]
        pub start_epoch: usize,
        /// The global batch size, split evenly across devices.
        pub batch_size: NonZeroUsize,
        /// The global validation batch size, split evenly across devices.
        pub batch_size_val: NonZeroUsize,
        /// Learning rate scheduling strategy.
        pub lr_schedule: LearningRateSchedule,
        /// The weight decay parameter for optimizer.
        #[serde(default = "default_weight_decay")]
        pub weight_decay: R64,
        /// If set, gradients are clipped to this global norm.
        pub max_norm: Option<R64>,
        /// Report progress per this number of batches.
        pub print_freq: NonZeroUsize,
        /// Stop after this number of consecutive epochs without improvement.
        #[serde(default = "default_patience")]
        pub patience: NonZeroUsize,
        #[serde(default)]
        pub mixed_precision: bool,
        /// The master seed. Per-device seeds are derived from it.
        pub seed: Option<u64>,
        pub resume: Option<ResumeConfig>,
        /// Training device options.
        pub device_config: DeviceConfig,
    }

    fn default_weight_decay() -> R64 {
        r64(0.0)
    }

    fn default_patience() -> NonZeroUsize {
        NonZeroUsize::new(10).unwrap()
    }

    /// Checkpoint resuming options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ResumeConfig {
        /// The checkpoint directory to resume from.
        pub file: PathBuf,
        /// Restore the optimizer state.
        #[serde(default = "default_true")]
        pub optimizer: bool,
        /// Restore the learning rate scheduler state.
        #[serde(default = "default_true")]
        pub scheduler: bool,
    }

    fn default_true() -> bool {
        true
    }

    /// Training device options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(tag = "type")]
    pub enum DeviceConfig {
        /// Use single device.
        SingleDevice {
            #[serde(with = "tch_serde::serde_device")]
            device: Device,
        },
        /// Use one worker per device.
        MultiDevice {
            #[serde(with = "serde_vec_device")]
            devices: Vec<Device>,
        },
    }

    impl DeviceConfig {
        pub fn devices(&self) -> Vec<Device> {
            match self {
                Self::SingleDevice { device } => vec![*device],
                Self::MultiDevice { devices } => devices.clone(),
            }
        }
    }

    /// The learning rate scheduling strategy.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(tag = "type")]
    pub enum LearningRateSchedule {
        /// Use constant learning rate.
        Constant { lr: R64 },
        /// Multiply the learning rate by `gamma` at each milestone epoch.
        MultiStep {
            base_lr: R64,
            milestones: Vec<usize>,
            gamma: R64,
        },
    }
}

mod serde_vec_device {
    use super::*;

    #[derive(Debug, Clone, Copy, Serialize, Deserialize)]
    struct DeviceWrapper(#[serde(with = "tch_serde::serde_device")] Device);

    pub fn serialize<S>(devices: &[Device], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let devices: Vec<_> = devices.iter().cloned().map(DeviceWrapper).collect();
        devices.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<Device>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let devices = Vec::<DeviceWrapper>::deserialize(deserializer)?;
        let devices: Vec<_> = devices
            .into_iter()
            .map(|DeviceWrapper(device)| device)
            .collect();
        Ok(devices)
    }
}
