use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use voxtrain::error::TrainError;
use voxtrain::trainer::{self, TrainOptions};

/// voxtrain: multi-process speaker embedding training
///
/// Launch one process per GPU with LOCAL_RANK, WORLD_SIZE, MASTER_ADDR and
/// MASTER_PORT set; a single process needs no environment.
#[derive(Parser, Debug)]
#[command(name = "voxtrain")]
#[command(about = "Data-parallel speaker embedding training", long_about = None)]
struct Args {
    /// Path to the configuration YAML file
    #[arg(short = 'f', long = "config", default_value = "conf/config.yaml")]
    config_file: PathBuf,

    /// Show a progress bar for each epoch on rank 0
    #[arg(long)]
    progress: bool,

    /// Config overrides, e.g. `--train_configs.num_epochs=10 --exp_dir exp/run2`
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "OVERRIDES")]
    overrides: Vec<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let options = TrainOptions {
        config_file: args.config_file,
        overrides: args.overrides,
        progress: args.progress,
    };

    match trainer::train(&options) {
        Ok(()) => Ok(()),
        Err(e) => {
            if let Some(err @ TrainError::ModelDirExists(_)) = e.downcast_ref::<TrainError>() {
                println!("{}", err);
                std::process::exit(1);
            }
            Err(e)
        }
    }
}
