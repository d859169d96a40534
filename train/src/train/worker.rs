use super::{
    eval::Evaluator,
    inference::Inferencer,
    orchestrator::{run_epochs, EpochRecord, EpochRunner, RunOutcome},
    step::{ProgressConfig, TrainSummary, Trainer},
};
use crate::{
    amp::GradScaler,
    checkpoint::{load_checkpoint, promote_best, save_checkpoint, CheckpointMeta},
    common::*,
    config::{Config, DatasetConfig, ResumeConfig, TrainingConfig},
    data::{
        BatchLoader, DatasetMode, DistributedSampler, HashTokenizer, LazyStore, RefDataset,
        RefDatasetInit, Tokenizer,
    },
    distributed::{broadcast_parameters, worker_seed, Reducer},
    logging::{EpochSummaryLog, LoggingMessage},
    metrics::PrecisionTable,
    model::Model,
    optim::Adam,
    utils::{self, LrScheduler},
    visualize::{ArtifactSink, DirectorySink},
};

/// The master seed used when the configuration gives none.
const DEFAULT_SEED: u64 = 0;

/// Per-worker state driven by the epoch orchestrator.
struct TrainingWorker<'a, R>
where
    R: Reducer,
{
    config: &'a Config,
    output_dir: &'a Path,
    reducer: &'a R,
    device: Device,
    seed: u64,
    vs: nn::VarStore,
    model: Model,
    optimizer: Adam,
    scheduler: LrScheduler,
    scaler: GradScaler,
    train_dataset: Arc<RefDataset>,
    val_dataset: Arc<RefDataset>,
    train_sampler: DistributedSampler,
    val_sampler: DistributedSampler,
    /// Only set on rank zero.
    logging_tx: Option<broadcast::Sender<LoggingMessage>>,
}

impl<R> TrainingWorker<'_, R>
where
    R: Reducer,
{
    fn local_batch_size(&self, global: usize) -> usize {
        global / self.reducer.world_size()
    }

    /// The loader seed differs per rank and per epoch.
    fn loader_seed(&self, epoch: usize) -> u64 {
        worker_seed(self.seed.wrapping_add(epoch as u64), self.reducer.rank())
    }
}

impl<R> EpochRunner for TrainingWorker<'_, R>
where
    R: Reducer,
{
    fn train(&mut self, epoch: usize) -> Result<TrainSummary> {
        let TrainingConfig {
            epochs,
            batch_size,
            max_norm,
            print_freq,
            ..
        } = self.config.training;

        let loader = BatchLoader::new(
            self.train_dataset.clone(),
            self.train_sampler.indices(epoch),
            self.local_batch_size(batch_size.get()),
            true,
            self.config.dataset.prefetch.get(),
            self.loader_seed(epoch),
        )?;

        let mut trainer = Trainer {
            reducer: self.reducer,
            vs: &self.vs,
            model: &self.model,
            optimizer: &mut self.optimizer,
            scaler: &mut self.scaler,
            device: self.device,
            max_norm: max_norm.map(|norm| norm.raw()),
            threshold: self.config.evaluation.threshold.raw(),
        };
        trainer.train_epoch(
            loader,
            &ProgressConfig {
                epoch,
                epochs,
                print_freq: print_freq.get(),
                logging_tx: self.logging_tx.as_ref(),
            },
        )
    }

    fn validate(&mut self, epoch: usize) -> Result<(f64, PrecisionTable)> {
        let loader = BatchLoader::new(
            self.val_dataset.clone(),
            self.val_sampler.indices(epoch),
            self.local_batch_size(self.config.training.batch_size_val.get()),
            false,
            self.config.dataset.prefetch.get(),
            self.loader_seed(epoch),
        )?;

        let evaluator = Evaluator {
            reducer: self.reducer,
            model: &self.model,
            device: self.device,
            canvas_size: self.val_dataset.input_size(),
            threshold: self.config.evaluation.threshold.raw(),
            resize_mask: self.val_dataset.resize(),
        };
        evaluator.validate(loader, epoch, self.config.training.epochs)
    }

    fn checkpoint(&mut self, record: &EpochRecord) -> Result<()> {
        if !self.reducer.is_root() {
            return Ok(());
        }

        let EpochRecord {
            epoch,
            train,
            current_iou,
            best_iou,
            ref precision,
            is_best,
        } = *record;

        let meta = CheckpointMeta {
            epoch,
            current_iou,
            best_iou,
            precision: precision.clone(),
            scheduler: self.scheduler.clone(),
            scaler: self.scaler.state(),
            saved_at: Local::now(),
        };
        let dir = save_checkpoint(self.output_dir, &self.vs, &self.optimizer, &meta)?;
        debug!("saved checkpoint at '{}'", dir.display());

        if is_best {
            promote_best(self.output_dir)?;
            info!("=> saved the best model at epoch {}", epoch + 1);
        }

        if let Some(logging_tx) = &self.logging_tx {
            logging_tx
                .send(LoggingMessage::EpochSummary(EpochSummaryLog {
                    epoch: epoch + 1,
                    train_loss: train.loss,
                    train_iou: train.iou,
                    val_iou: current_iou,
                    precision: precision.clone(),
                }))
                .map_err(|_| format_err!("cannot send message to the logger"))?;
        }

        Ok(())
    }

    fn advance_schedule(&mut self, next_epoch: usize) -> Result<()> {
        self.scheduler.step(next_epoch);
        self.optimizer.set_lr(self.scheduler.lr());
        Ok(())
    }
}

fn build_dataset(
    config: &DatasetConfig,
    dir: &Path,
    mode: DatasetMode,
    tokenizer: Arc<dyn Tokenizer>,
) -> Result<RefDataset> {
    RefDatasetInit {
        mask_root: config.mask_root.clone(),
        mode,
        input_size: config.input_size.get(),
        word_length: config.word_length.get(),
        prompt_type: config.prompt_type.clone(),
        resize: config.resize,
    }
    .build(LazyStore::json_index(dir), tokenizer)
}

/// Runs the epoch loop on one device.
///
/// Every rank must call this with a reducer of the same fleet. Only rank
/// zero writes checkpoints and passes `logging_tx` to the logger.
pub fn training_worker<R>(
    config: Arc<Config>,
    output_dir: Arc<PathBuf>,
    reducer: R,
    device: Device,
    logging_tx: broadcast::Sender<LoggingMessage>,
) -> Result<RunOutcome>
where
    R: Reducer,
{
    let start_time = Instant::now();
    let rank = reducer.rank();
    let world_size = reducer.world_size();
    let seed = config.training.seed.unwrap_or(DEFAULT_SEED);
    info!("worker {}/{} uses device {:?}", rank, world_size, device);

    tch::manual_seed(worker_seed(seed, rank) as i64);
    reducer.barrier()?;

    let Config {
        model: ref model_config,
        dataset: ref dataset_config,
        training:
            TrainingConfig {
                epochs,
                start_epoch,
                ref lr_schedule,
                weight_decay,
                patience,
                mixed_precision,
                ref resume,
                ..
            },
        ..
    } = *config;

    // init model
    let mut vs = nn::VarStore::new(device);
    let model = Model::new(vs.root(), model_config)?;
    let mut scheduler = LrScheduler::new(lr_schedule)?;
    let mut optimizer = Adam::new(&vs, scheduler.lr(), weight_decay.raw())?;
    let mut scaler = GradScaler::new(mixed_precision);

    // resume
    let start_epoch = match resume {
        Some(ResumeConfig {
            file,
            optimizer: load_optimizer,
            scheduler: load_scheduler,
        }) => {
            let checkpoint = load_checkpoint(file)?;
            vs.load(checkpoint.model_path())?;
            if *load_optimizer {
                optimizer.load(checkpoint.optimizer_path())?;
                scaler.load_state(&checkpoint.meta.scaler);
            }
            if *load_scheduler {
                scheduler = checkpoint.meta.scheduler.clone();
            }
            if reducer.is_root() {
                info!(
                    "=> loaded checkpoint '{}' (epoch {})",
                    file.display(),
                    checkpoint.meta.epoch + 1
                );
            }
            checkpoint.meta.epoch + 1
        }
        None => start_epoch,
    };
    broadcast_parameters(&reducer, &vs)?;
    scheduler.step(start_epoch);
    optimizer.set_lr(scheduler.lr());

    // datasets
    let tokenizer: Arc<dyn Tokenizer> = Arc::new(HashTokenizer::new(model_config.vocab_size())?);
    let train_dataset = build_dataset(
        dataset_config,
        &dataset_config.train_dir,
        DatasetMode::Train,
        tokenizer.clone(),
    )?;
    let val_dataset = build_dataset(
        dataset_config,
        &dataset_config.val_dir,
        DatasetMode::Val,
        tokenizer,
    )?;
    // the sampler length is the first access, so each rank opens its stores
    // here on its own thread and the loader threads reuse the open handles
    let train_sampler = DistributedSampler::new(train_dataset.len()?, world_size, rank, true, seed)?;
    let val_sampler = DistributedSampler::new(val_dataset.len()?, world_size, rank, false, seed)?;

    let mut worker = TrainingWorker {
        config: &config,
        output_dir: &output_dir,
        reducer: &reducer,
        device,
        seed,
        vs,
        model,
        optimizer,
        scheduler,
        scaler,
        train_dataset: Arc::new(train_dataset),
        val_dataset: Arc::new(val_dataset),
        train_sampler,
        val_sampler,
        logging_tx: reducer.is_root().then(|| logging_tx),
    };

    info!("start training from epoch {}", start_epoch + 1);
    let outcome = run_epochs(&mut worker, start_epoch, epochs, patience.get())?;

    if reducer.is_root() {
        info!("* Best IoU={:.2} *", outcome.best_iou * 100.0);
        info!(
            "* Training time {} *",
            utils::format_duration(start_time.elapsed())
        );
    }

    Ok(outcome)
}

/// Scores the test set with a saved checkpoint, optionally writing
/// visualizations into `visualize_dir`.
pub fn test_worker(
    config: Arc<Config>,
    checkpoint_dir: &Path,
    visualize_dir: Option<&Path>,
) -> Result<(f64, PrecisionTable)> {
    let Config {
        model: ref model_config,
        dataset: ref dataset_config,
        ..
    } = *config;
    let device = config
        .training
        .device_config
        .devices()
        .first()
        .copied()
        .ok_or_else(|| format_err!("no device is configured"))?;
    let test_dir = dataset_config
        .test_dir
        .as_ref()
        .ok_or_else(|| format_err!("dataset.test_dir is not configured"))?;

    let mut vs = nn::VarStore::new(device);
    let model = Model::new(vs.root(), model_config)?;
    let checkpoint = load_checkpoint(checkpoint_dir)?;
    vs.load(checkpoint.model_path())?;
    info!(
        "=> loaded checkpoint '{}' (epoch {})",
        checkpoint_dir.display(),
        checkpoint.meta.epoch + 1
    );

    let tokenizer = Arc::new(HashTokenizer::new(model_config.vocab_size())?);
    let dataset = build_dataset(dataset_config, test_dir, DatasetMode::Test, tokenizer)?;
    let mut sink = visualize_dir.map(DirectorySink::new).transpose()?;

    let inferencer = Inferencer {
        model: &model,
        device,
        threshold: config.evaluation.threshold.raw(),
        visualize: sink.is_some(),
    };
    let mut rng = StdRng::seed_from_u64(config.training.seed.unwrap_or(DEFAULT_SEED));
    inferencer.run(
        &dataset,
        &mut rng,
        sink.as_mut().map(|sink| sink as &mut dyn ArtifactSink),
    )
}
