use crate::{
    amp::GradScaler,
    common::*,
    data::{Batch, BatchLoader},
    distributed::{sync_gradients, Reducer},
    logging::{LoggingMessage, TrainingProgressLog},
    metrics::{train_metrics, AverageMeter},
    model::{ModelOutput, SegmentationModel},
    optim::Adam,
    utils::RateCounter,
};

/// The IoU above which a training sample counts as a hit.
const TRAIN_IOU_THRESHOLD: f64 = 0.5;

/// Fleet-averaged results of one training step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepOutput {
    pub loss: f64,
    /// Mean IoU in percent.
    pub iou: f64,
    /// Precision at IoU 0.5 in percent.
    pub prec50: f64,
    /// False if the optimizer step was skipped on overflow.
    pub stepped: bool,
}

/// Epoch averages of the training step outputs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainSummary {
    pub loss: f64,
    pub iou: f64,
    pub prec50: f64,
}

/// Everything a training step mutates or reads.
pub struct Trainer<'a> {
    pub reducer: &'a dyn Reducer,
    pub vs: &'a nn::VarStore,
    pub model: &'a dyn SegmentationModel,
    pub optimizer: &'a mut Adam,
    pub scaler: &'a mut GradScaler,
    pub device: Device,
    pub max_norm: Option<f64>,
    /// Decision threshold on the sigmoid probability.
    pub threshold: f64,
}

/// Where and how often an epoch reports progress.
#[derive(Debug, Clone)]
pub struct ProgressConfig<'a> {
    pub epoch: usize,
    pub epochs: usize,
    pub print_freq: usize,
    pub logging_tx: Option<&'a broadcast::Sender<LoggingMessage>>,
}

impl Trainer<'_> {
    /// Runs forward, scaled backward and the optimizer step on one batch.
    pub fn step(&mut self, batch: &Batch) -> Result<StepOutput> {
        let Batch {
            images,
            texts,
            targets,
            ..
        } = batch.to_device(self.device);
        let targets = targets.ok_or_else(|| format_err!("training batches must carry targets"))?;

        let enabled = self.scaler.is_enabled();
        let ModelOutput { pred, target, loss } = tch::autocast(enabled, || {
            self.model.forward_train(&images, &texts, &targets)
        })?;

        self.optimizer.zero_grad(self.vs);
        self.scaler.scale(&loss).backward();
        sync_gradients(self.reducer, self.vs)?;
        let stepped = self.scaler.step(self.vs, self.optimizer, self.max_norm)?;
        self.scaler.update();

        // metrics on the model's own target at the prediction resolution
        let (iou, prec50) = train_metrics(&pred, &target, self.threshold, TRAIN_IOU_THRESHOLD)?;
        let loss = loss.detach().to_kind(Kind::Double);

        let reducer = self.reducer;
        let loss = reducer.reduce_mean(&loss)?.double_value(&[]);
        let iou = reducer.reduce_mean(&iou)?.double_value(&[]);
        let prec50 = reducer.reduce_mean(&prec50)?.double_value(&[]);

        Ok(StepOutput {
            loss,
            iou,
            prec50,
            stepped,
        })
    }

    /// Runs a full pass over the training loader.
    pub fn train_epoch(
        &mut self,
        loader: BatchLoader,
        progress: &ProgressConfig<'_>,
    ) -> Result<TrainSummary> {
        let ProgressConfig {
            epoch,
            epochs,
            print_freq,
            logging_tx,
        } = *progress;
        let num_batches = loader.num_batches();

        let mut loss_meter = AverageMeter::new("Loss");
        let mut iou_meter = AverageMeter::new("IoU");
        let mut prec_meter = AverageMeter::new("Prec@50");
        let mut rate_counter = RateCounter::with_second_interval();
        let mut batch_rate = None;

        for (index, batch) in loader.enumerate() {
            let batch = batch?;
            let batch_size = batch.len();
            let output = self.step(&batch)?;

            loss_meter.update(output.loss, batch_size);
            iou_meter.update(output.iou, batch_size);
            prec_meter.update(output.prec50, batch_size);

            rate_counter.add(1.0);
            if let Some(rate) = rate_counter.rate() {
                batch_rate = Some(rate);
            }

            let iteration = index + 1;
            if iteration % print_freq != 0 {
                continue;
            }

            let lr = self.optimizer.lr();
            if self.reducer.is_root() {
                info!(
                    "Training: Epoch=[{}/{}] [{}/{}] {} Lr {:.6} {} {} {}",
                    epoch + 1,
                    epochs,
                    iteration,
                    num_batches,
                    batch_rate.map_or_else(String::new, |rate| format!("{:.2} batches/s", rate)),
                    lr,
                    loss_meter,
                    iou_meter,
                    prec_meter
                );
            }

            if let Some(logging_tx) = logging_tx {
                logging_tx
                    .send(LoggingMessage::TrainingProgress(TrainingProgressLog {
                        step: epoch * num_batches + iteration,
                        loss: loss_meter.avg(),
                        iou: iou_meter.avg(),
                        prec50: prec_meter.avg(),
                        lr,
                    }))
                    .map_err(|_| format_err!("cannot send message to the logger"))?;
            }
        }

        Ok(TrainSummary {
            loss: loss_meter.avg(),
            iou: iou_meter.avg(),
            prec50: prec_meter.avg(),
        })
    }
}
