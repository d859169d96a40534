use anyhow::{Context, Result};
use refseg_train::config::Config;
use std::{
    env,
    path::{Path, PathBuf},
    sync::Arc,
};
use structopt::StructOpt;
use tracing::{info_span, Instrument};
use tracing_subscriber::{filter::LevelFilter, prelude::*, EnvFilter};

#[derive(Debug, Clone, StructOpt)]
/// Train and test the referring segmentation model
enum Args {
    /// Run the training loop
    Train {
        #[structopt(long, default_value = "train.json5")]
        /// configuration file
        config_file: PathBuf,
    },
    /// Score the test set with a checkpoint
    Test {
        #[structopt(long, default_value = "train.json5")]
        /// configuration file
        config_file: PathBuf,
        #[structopt(long)]
        /// checkpoint directory, such as <output_dir>/best_model
        checkpoint: PathBuf,
        #[structopt(long)]
        /// write predictions as images into this directory
        visualize_dir: Option<PathBuf>,
    },
}

fn load_config(config_file: &Path) -> Result<Arc<Config>> {
    let config = Config::open(config_file)
        .with_context(|| format!("failed to load config file '{}'", config_file.display()))?;
    Ok(Arc::new(config))
}

#[tokio::main]
pub async fn main() -> Result<()> {
    // setup tracing
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true).compact();
    let filter_layer = {
        let filter = EnvFilter::from_default_env();
        if env::var("RUST_LOG").is_err() {
            filter.add_directive(LevelFilter::INFO.into())
        } else {
            filter
        }
    };

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();

    // parse arguments
    match Args::from_args() {
        Args::Train { config_file } => {
            let config = load_config(&config_file)?;
            refseg_train::start(config)
                .instrument(info_span!("train"))
                .await?;
        }
        Args::Test {
            config_file,
            checkpoint,
            visualize_dir,
        } => {
            let config = load_config(&config_file)?;
            refseg_train::test(config, checkpoint, visualize_dir)
                .instrument(info_span!("test"))
                .await?;
        }
    }

    Ok(())
}
