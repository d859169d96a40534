//! Telemetry logging toolkit.

use crate::{common::*, metrics::PrecisionTable, utils::RateCounter};
use async_std::{fs::File, io::BufWriter};
use std::future::Future;

pub use logging_message::*;
pub use logging_worker::*;

mod logging_worker {
    use super::*;

    /// The telemetry logging worker.
    #[derive(Debug)]
    pub struct LoggingWorker {
        event_writer: EventWriter<BufWriter<File>>,
        rate_counter: RateCounter,
        rx: broadcast::Receiver<LoggingMessage>,
    }

    impl LoggingWorker {
        async fn new(output_dir: &Path, rx: broadcast::Receiver<LoggingMessage>) -> Result<Self> {
            let event_dir = output_dir.join("events");
            let event_path_prefix = event_dir
                .join("refseg")
                .into_os_string()
                .into_string()
                .map_err(|path| format_err!("non-UTF-8 event path {:?}", path))?;

            tokio::fs::create_dir_all(&event_dir).await?;

            let event_writer = EventWriterInit::default()
                .from_prefix_async(event_path_prefix, None)
                .await?;

            Ok(Self {
                event_writer,
                rate_counter: RateCounter::new(Duration::from_secs(60)),
                rx,
            })
        }

        async fn start(mut self) -> Result<()> {
            loop {
                let msg = match self.rx.recv().await {
                    Ok(msg) => msg,
                    Err(broadcast::error::RecvError::Lagged(count)) => {
                        warn!("the logging worker dropped {} messages", count);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                self.rate_counter.add(1.0);

                match msg {
                    LoggingMessage::TrainingProgress(msg) => {
                        self.log_training_progress(msg).await?;
                    }
                    LoggingMessage::EpochSummary(msg) => {
                        self.log_epoch_summary(msg).await?;
                    }
                }

                if let Some(rate) = self.rate_counter.rate() {
                    debug!("logged {:.2} events/s", rate);
                }
            }

            Ok(())
        }

        async fn log_training_progress(&mut self, msg: TrainingProgressLog) -> Result<()> {
            let TrainingProgressLog {
                step,
                loss,
                iou,
                prec50,
                lr,
            } = msg;
            let step = step as i64;

            self.event_writer
                .write_scalar_async("training/epoch_loss", step, loss as f32)
                .await?;
            self.event_writer
                .write_scalar_async("training/epoch_iou", step, iou as f32)
                .await?;
            self.event_writer
                .write_scalar_async("training/epoch_prec@50", step, prec50 as f32)
                .await?;
            self.event_writer
                .write_scalar_async("training/lr", step, lr as f32)
                .await?;

            Ok(())
        }

        async fn log_epoch_summary(&mut self, msg: EpochSummaryLog) -> Result<()> {
            let EpochSummaryLog {
                epoch,
                train_loss,
                train_iou,
                val_iou,
                precision,
            } = msg;
            let step = epoch as i64;

            self.event_writer
                .write_scalar_async("training/train_loss", step, train_loss as f32)
                .await?;
            self.event_writer
                .write_scalar_async("training/train_iou", step, train_iou as f32)
                .await?;
            self.event_writer
                .write_scalar_async("valid/epoch_iou", step, val_iou as f32)
                .await?;
            for (key, value) in precision {
                self.event_writer
                    .write_scalar_async(format!("valid/{}", key), step, value as f32)
                    .await?;
            }

            Ok(())
        }
    }

    /// Creates the event writer under `<output_dir>/events` and returns the
    /// future of the running worker. The worker stops when all senders are dropped.
    pub async fn logging_worker(
        output_dir: &Path,
        rx: broadcast::Receiver<LoggingMessage>,
    ) -> Result<impl Future<Output = Result<()>> + Send> {
        let worker = LoggingWorker::new(output_dir, rx).await?;
        Ok(tokio::task::spawn(worker.start()).map(|result| Fallible::Ok(result??)))
    }
}

mod logging_message {
    use super::*;

    /// The message type that is accepted by the logging worker.
    #[derive(Debug, Clone)]
    pub enum LoggingMessage {
        TrainingProgress(TrainingProgressLog),
        EpochSummary(EpochSummaryLog),
    }

    /// Running averages sent every `print_freq` batches.
    #[derive(Debug, Clone)]
    pub struct TrainingProgressLog {
        /// The global iteration count.
        pub step: usize,
        pub loss: f64,
        pub iou: f64,
        pub prec50: f64,
        pub lr: f64,
    }

    /// Per-epoch training and validation results.
    #[derive(Debug, Clone)]
    pub struct EpochSummaryLog {
        pub epoch: usize,
        pub train_loss: f64,
        pub train_iou: f64,
        pub val_iou: f64,
        pub precision: PrecisionTable,
    }
}
