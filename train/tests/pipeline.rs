use anyhow::Result;
use refseg_train::{
    checkpoint::{load_checkpoint, BEST_MODEL_DIR, LAST_MODEL_DIR},
    distributed::SingleProcess,
    train::{test_worker, training_worker, EpochState},
};
use std::{fs, sync::Arc};
use tch::Device;
use tokio::sync::broadcast;

mod common;

use common::{write_config, write_dataset, NUM_SAMPLES};

#[test]
fn train_then_test() -> Result<()> {
    let root = tempfile::tempdir()?;
    let data_dir = root.path().join("data");
    write_dataset(&data_dir)?;
    let config = write_config(root.path(), &data_dir)?;
    let output_dir = Arc::new(config.output_dir());

    let (logging_tx, _logging_rx) = broadcast::channel(64);
    let outcome = training_worker(
        config.clone(),
        output_dir.clone(),
        SingleProcess,
        Device::Cpu,
        logging_tx,
    )?;

    assert_eq!(outcome.state, EpochState::Done);
    assert_eq!(outcome.last_epoch, Some(1));
    assert!((0.0..=1.0).contains(&outcome.best_iou));

    let last = load_checkpoint(&output_dir.join(LAST_MODEL_DIR))?;
    assert_eq!(last.meta.epoch, 1);
    assert_eq!(last.meta.precision.len(), 5);
    let best = load_checkpoint(&output_dir.join(BEST_MODEL_DIR))?;
    assert!(best.meta.current_iou >= last.meta.current_iou || best.meta.epoch == 1);

    let vis_dir = root.path().join("vis");
    let (iou, precision) = test_worker(config, &best.dir, Some(&vis_dir))?;
    assert!((0.0..=1.0).contains(&iou));
    assert_eq!(precision.len(), 5);

    // one image and one mask per sample, one prediction per prompt
    let num_files = fs::read_dir(&vis_dir)?.count();
    assert_eq!(num_files, NUM_SAMPLES * 4);
    assert!(vis_dir.join("0-mask-img.jpg").is_file());
    assert!(vis_dir.join("0-mask-mask.png").is_file());
    Ok(())
}

#[test]
fn resume_from_missing_checkpoint_fails() -> Result<()> {
    let root = tempfile::tempdir()?;
    let data_dir = root.path().join("data");
    write_dataset(&data_dir)?;
    let config = write_config(root.path(), &data_dir)?;

    let mut config = (*config).clone();
    config.training.resume = Some(serde_json::from_value(serde_json::json!({
        "file": root.path().join("missing").display().to_string(),
    }))?);
    let output_dir = Arc::new(config.output_dir());

    let (logging_tx, _logging_rx) = broadcast::channel(64);
    let err = training_worker(
        Arc::new(config),
        output_dir,
        SingleProcess,
        Device::Cpu,
        logging_tx,
    )
    .unwrap_err();
    assert!(err.to_string().starts_with("resume failed!"));
    Ok(())
}
