//! The training program of the referring segmentation model.

pub mod amp;
pub mod checkpoint;
pub mod common;
pub mod config;
pub mod data;
pub mod distributed;
pub mod logging;
pub mod metrics;
pub mod model;
pub mod optim;
pub mod train;
pub mod utils;
pub mod visualize;

use crate::{
    common::*,
    config::Config,
    distributed::{LocalGroup, Reducer},
};

/// The entry of the training program.
///
/// Spawns one blocking worker per configured device. A worker that fails
/// or panics aborts the group so that the others leave their barriers.
pub async fn start(config: Arc<Config>) -> Result<()> {
    let output_dir = Arc::new(config.output_dir());

    // create dirs and save config
    {
        tokio::fs::create_dir_all(&*output_dir).await?;
        let path = output_dir.join(format!(
            "config-{}.json",
            Local::now().format(utils::FILE_STRFTIME)
        ));
        let text = serde_json::to_string_pretty(&*config)?;
        tokio::fs::write(&path, text).await?;
    }

    // start logger
    let (logging_tx, logging_rx) = broadcast::channel(16);
    let logging_future = logging::logging_worker(&output_dir, logging_rx).await?;

    // training workers
    let devices = config.training.device_config.devices();
    info!("use {} device(s): {:?}", devices.len(), devices);
    let groups = LocalGroup::new(devices.len())?;

    let worker_futures: Vec<_> = izip!(devices, groups)
        .map(|(device, group)| {
            let config = config.clone();
            let output_dir = output_dir.clone();
            let logging_tx = logging_tx.clone();

            tokio::task::spawn_blocking(move || {
                let rank = group.rank();
                // aborts the group on error and on panic
                let guard = group.abort_guard();
                let result =
                    train::training_worker(config, output_dir, group, device, logging_tx);
                match &result {
                    Ok(_) => guard.disarm(),
                    Err(err) => warn!("worker {} failed: {:?}", rank, err),
                }
                result
            })
            .map(|result| Fallible::Ok(result??))
        })
        .collect();
    // the logger stops once every worker has dropped its sender
    drop(logging_tx);

    let training_future = futures::future::try_join_all(worker_futures);
    futures::try_join!(training_future, logging_future)?;

    Ok(())
}

/// The entry of the test program.
pub async fn test(
    config: Arc<Config>,
    checkpoint_dir: PathBuf,
    visualize_dir: Option<PathBuf>,
) -> Result<()> {
    tokio::task::spawn_blocking(move || {
        train::test_worker(config, &checkpoint_dir, visualize_dir.as_deref())
    })
    .await??;
    Ok(())
}
