use super::step::TrainSummary;
use crate::{common::*, metrics::PrecisionTable};

/// The phases an epoch goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EpochState {
    Training,
    Validating,
    Checkpointing,
    EarlyStopped,
    Done,
}

/// The outcome of one finished epoch.
#[derive(Debug, Clone)]
pub struct EpochRecord {
    pub epoch: usize,
    pub train: TrainSummary,
    pub current_iou: f64,
    /// The best IoU including this epoch.
    pub best_iou: f64,
    pub precision: PrecisionTable,
    /// Whether this epoch ties or beats every previous one.
    pub is_best: bool,
}

/// The work done in each phase of an epoch.
pub trait EpochRunner {
    fn train(&mut self, epoch: usize) -> Result<TrainSummary>;

    /// Returns the fleet-wide IoU and precision table.
    fn validate(&mut self, epoch: usize) -> Result<(f64, PrecisionTable)>;

    /// Saves the last checkpoint and promotes it if `record.is_best`.
    fn checkpoint(&mut self, record: &EpochRecord) -> Result<()>;

    /// Moves the learning rate schedule to the next epoch.
    fn advance_schedule(&mut self, next_epoch: usize) -> Result<()>;
}

/// How the epoch loop ended.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    /// Either [EpochState::EarlyStopped] or [EpochState::Done].
    pub state: EpochState,
    pub best_iou: f64,
    /// The last completed epoch, if any.
    pub last_epoch: Option<usize>,
}

/// Runs epochs `start_epoch..epochs` until they are exhausted or `patience`
/// consecutive epochs fail to reach the best IoU.
pub fn run_epochs<R>(
    runner: &mut R,
    start_epoch: usize,
    epochs: usize,
    patience: usize,
) -> Result<RunOutcome>
where
    R: EpochRunner + ?Sized,
{
    ensure!(patience > 0, "patience must be positive");

    let mut state = if start_epoch < epochs {
        EpochState::Training
    } else {
        EpochState::Done
    };
    let mut epoch = start_epoch;
    let mut last_epoch = None;
    let mut best_iou = 0.0;
    let mut num_bad_epochs = 0;
    let mut train_summary = None;
    let mut validation = None;

    loop {
        state = match state {
            EpochState::Training => {
                train_summary = Some(runner.train(epoch)?);
                EpochState::Validating
            }
            EpochState::Validating => {
                validation = Some(runner.validate(epoch)?);
                EpochState::Checkpointing
            }
            EpochState::Checkpointing => {
                let train = train_summary
                    .take()
                    .ok_or_else(|| format_err!("epoch {} was not trained", epoch))?;
                let (current_iou, precision) = validation
                    .take()
                    .ok_or_else(|| format_err!("epoch {} was not validated", epoch))?;

                // ties count as improvement
                let is_best = current_iou >= best_iou;
                if is_best {
                    best_iou = current_iou;
                    num_bad_epochs = 0;
                } else {
                    num_bad_epochs += 1;
                }

                runner.checkpoint(&EpochRecord {
                    epoch,
                    train,
                    current_iou,
                    best_iou,
                    precision,
                    is_best,
                })?;
                last_epoch = Some(epoch);

                if num_bad_epochs >= patience {
                    info!(
                        "early stop at epoch {} after {} epochs without improvement",
                        epoch + 1,
                        num_bad_epochs
                    );
                    EpochState::EarlyStopped
                } else if epoch + 1 >= epochs {
                    EpochState::Done
                } else {
                    epoch += 1;
                    runner.advance_schedule(epoch)?;
                    EpochState::Training
                }
            }
            EpochState::EarlyStopped | EpochState::Done => break,
        };
    }

    Ok(RunOutcome {
        state,
        best_iou,
        last_epoch,
    })
}
