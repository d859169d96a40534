//! Checkpoint directories.
//!
//! A checkpoint is a directory holding `model.ot`, `optimizer.ot` and
//! `meta.json`. The latest one lives in `last_model/` under the output
//! directory and the best one is copied to `best_model/`.

use crate::{
    amp::GradScalerState, common::*, metrics::PrecisionTable, optim::Adam, utils::LrScheduler,
};

pub const LAST_MODEL_DIR: &str = "last_model";
pub const BEST_MODEL_DIR: &str = "best_model";
const MODEL_FILE: &str = "model.ot";
const OPTIMIZER_FILE: &str = "optimizer.ot";
const META_FILE: &str = "meta.json";

/// The non-tensor part of a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub epoch: usize,
    pub current_iou: f64,
    pub best_iou: f64,
    pub precision: PrecisionTable,
    pub scheduler: LrScheduler,
    pub scaler: GradScalerState,
    pub saved_at: DateTime<Local>,
}

/// A checkpoint found on disk.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub dir: PathBuf,
    pub meta: CheckpointMeta,
}

impl Checkpoint {
    pub fn model_path(&self) -> PathBuf {
        self.dir.join(MODEL_FILE)
    }

    pub fn optimizer_path(&self) -> PathBuf {
        self.dir.join(OPTIMIZER_FILE)
    }
}

/// Writes the checkpoint into `<output_dir>/last_model`.
pub fn save_checkpoint(
    output_dir: &Path,
    vs: &nn::VarStore,
    optimizer: &Adam,
    meta: &CheckpointMeta,
) -> Result<PathBuf> {
    let dir = output_dir.join(LAST_MODEL_DIR);
    fs::create_dir_all(&dir)?;

    vs.save(dir.join(MODEL_FILE))?;
    optimizer.save(dir.join(OPTIMIZER_FILE))?;
    let text = serde_json::to_string_pretty(meta)?;
    fs::write(dir.join(META_FILE), text)?;

    Ok(dir)
}

/// Copies `last_model` to `best_model`.
pub fn promote_best(output_dir: &Path) -> Result<PathBuf> {
    let src = output_dir.join(LAST_MODEL_DIR);
    let dst = output_dir.join(BEST_MODEL_DIR);
    fs::create_dir_all(&dst)?;

    for name in [MODEL_FILE, OPTIMIZER_FILE, META_FILE] {
        fs::copy(src.join(name), dst.join(name))
            .with_context(|| format!("unable to copy '{}' to '{}'", name, dst.display()))?;
    }
    Ok(dst)
}

/// Opens a checkpoint directory. A missing checkpoint is an error.
pub fn load_checkpoint(dir: &Path) -> Result<Checkpoint> {
    let meta_path = dir.join(META_FILE);
    if !meta_path.is_file() || !dir.join(MODEL_FILE).is_file() {
        bail!("resume failed! no checkpoint found at '{}'", dir.display());
    }

    let text = fs::read_to_string(&meta_path)?;
    let meta: CheckpointMeta = serde_json::from_str(&text)
        .with_context(|| format!("malformed checkpoint metadata '{}'", meta_path.display()))?;

    Ok(Checkpoint {
        dir: dir.to_owned(),
        meta,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{amp::GradScaler, config::LearningRateSchedule};

    fn meta(epoch: usize, iou: f64) -> Result<CheckpointMeta> {
        let mut precision = PrecisionTable::new();
        precision.insert("Pr@50".into(), 0.5);
        Ok(CheckpointMeta {
            epoch,
            current_iou: iou,
            best_iou: iou,
            precision,
            scheduler: LrScheduler::new(&LearningRateSchedule::Constant { lr: r64(1e-4) })?,
            scaler: GradScaler::new(true).state(),
            saved_at: Local::now(),
        })
    }

    #[test]
    fn save_promote_and_load() -> Result<()> {
        let output_dir = tempfile::tempdir()?;
        let vs = nn::VarStore::new(Device::Cpu);
        let _ = vs.root().var("w", &[4], nn::Init::Const(0.5));
        let optimizer = Adam::new(&vs, 1e-4, 0.0)?;

        save_checkpoint(output_dir.path(), &vs, &optimizer, &meta(3, 0.4)?)?;
        let best = promote_best(output_dir.path())?;
        save_checkpoint(output_dir.path(), &vs, &optimizer, &meta(4, 0.2)?)?;

        let last = load_checkpoint(&output_dir.path().join(LAST_MODEL_DIR))?;
        assert_eq!(last.meta.epoch, 4);
        let best = load_checkpoint(&best)?;
        assert_eq!(best.meta.epoch, 3);
        assert!(best.model_path().is_file());
        assert!(best.optimizer_path().is_file());

        let mut restored = nn::VarStore::new(Device::Cpu);
        let w = restored.root().var("w", &[4], nn::Init::Const(0.0));
        restored.load(best.model_path())?;
        assert!(w.allclose(&Tensor::full(&[4], 0.5, (Kind::Float, Device::Cpu)), 1e-6, 1e-6, false));
        Ok(())
    }

    #[test]
    fn missing_checkpoint_is_fatal() {
        let err = load_checkpoint(Path::new("/nonexistent/last_model")).unwrap_err();
        assert!(err.to_string().starts_with("resume failed!"));
    }
}
