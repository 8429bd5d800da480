//! Training orchestration
//!
//! Every process runs the same sequence:
//!
//! ```text
//! config → process group → data → model/optimizer/schedules → epochs → checkpoints
//! ```
//!
//! Rank 0 additionally owns the experiment directory: it creates
//! `exp_dir/models`, writes `config.yaml`, prints the progress table frame,
//! saves checkpoints and writes `run.json`. Barriers keep the other ranks
//! from running ahead of those steps.

use anyhow::{Context, Result};
use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::checkpoint::{self, CheckpointMeta};
use crate::config::{TargetDevice, TrainConfig};
use crate::data::{
    read_scp, spk2id, ArkReader, DataLoader, DatasetOptions, DistributedSampler, LoaderOptions,
    SpeakerDataset,
};
use crate::distributed::{
    broadcast_parameters, build_optimizer, create_synchronizer, DistEnv, ProcessGroup,
};
use crate::error::TrainError;
use crate::executor::{format_duration, EpochStats, Executor, TABLE_HEADER, TABLE_WIDTH};
use crate::logging::{self, Table};
use crate::model::{self, SpeakerNet};
use crate::scheduler::{ExponentialDecrease, MarginScheduler};

/// Command-line inputs of a training run
#[derive(Debug, Clone)]
pub struct TrainOptions {
    pub config_file: PathBuf,
    /// `--key=value` config overrides
    pub overrides: Vec<String>,
    pub progress: bool,
}

/// Run training with the launcher environment of this process.
pub fn train(options: &TrainOptions) -> Result<()> {
    train_with_env(options, &DistEnv::from_env()?)
}

/// Run training as the rank described by `env`.
pub fn train_with_env(options: &TrainOptions, env: &DistEnv) -> Result<()> {
    let mut config = TrainConfig::load(&options.config_file, &options.overrides)
        .with_context(|| format!("loading {}", options.config_file.display()))?;
    let rank = env.rank;

    fs::create_dir_all(&config.exp_dir)
        .with_context(|| format!("creating {}", config.exp_dir.display()))?;
    logging::init(rank, Some(config.exp_dir.join("train.log").as_path()))?;

    let gpu = select_gpu(&config, rank)?;

    let group = Arc::new(ProcessGroup::init(
        env,
        Duration::from_secs(config.distributed.rendezvous_timeout_secs),
    )?);

    let model_dir = config.model_dir();
    if group.is_primary() {
        if model_dir.exists() {
            return Err(TrainError::ModelDirExists(model_dir).into());
        }
        fs::create_dir_all(&model_dir)
            .with_context(|| format!("creating {}", model_dir.display()))?;
    }
    group.barrier()?;

    let device = make_device(&config, config.seed + rank as u64)?;
    if group.world_size() > 1 {
        log::info!("training on multiple gpus, this gpu {}", gpu);
    }

    if group.is_primary() {
        log::info!("exp_dir is: {}", config.exp_dir.display());
        log::info!("<== Passed Arguments ==>");
        for line in config.to_yaml_string()?.lines() {
            log::info!("{}", line);
        }
    }

    // ---- data ----
    let feats = read_scp(&config.dataset_args.train_scp)
        .with_context(|| format!("reading {}", config.dataset_args.train_scp.display()))?;
    if group.is_primary() {
        log::info!("<== Feature ==>");
        log::info!("train feat num: {}", feats.len());
    }
    let utt2spk = read_scp(&config.dataset_args.train_label)
        .with_context(|| format!("reading {}", config.dataset_args.train_label.display()))?;
    let speakers = spk2id(&utt2spk);
    if group.is_primary() {
        log::info!("<== Labels ==>");
        log::info!("train label num: {}, spk num: {}", utt2spk.len(), speakers.len());
    }

    config.sync_model_dims();
    let dataset = SpeakerDataset::new(
        feats,
        &utt2spk,
        &speakers,
        Arc::new(ArkReader::new()),
        DatasetOptions {
            feat_dim: config.feature_args.feat_dim,
            num_frms: config.dataset_args.num_frms,
            cmvn: config.feature_args.cmvn,
            speed_perturb: config.dataset_args.speed_perturb,
            aug_prob: config.dataset_args.aug_prob,
            max_time_mask: config.feature_args.max_time_mask,
            max_freq_mask: config.feature_args.max_freq_mask,
        },
    )?;
    let num_utts = dataset.len();
    // Same shuffle on every rank; per-rank randomness comes from the loader seed
    let sampler = DistributedSampler::new(num_utts, rank, group.world_size(), true, config.seed);
    let mut loader = DataLoader::new(
        Arc::new(dataset),
        sampler,
        LoaderOptions {
            batch_size: config.dataloader_args.batch_size,
            drop_last: config.dataloader_args.drop_last,
            num_workers: config.dataloader_args.num_workers,
            prefetch: config.dataloader_args.prefetch,
            seed: config.seed + rank as u64,
        },
        device.clone(),
    );
    if loader.is_empty() {
        return Err(TrainError::EmptyEpoch { utts: num_utts }.into());
    }
    if group.is_primary() {
        log::info!("<== Dataloaders ==>");
        log::info!("train dataloaders created");
    }

    config.set_num_class(speakers.len());
    config.set_schedule(loader.len(), group.world_size());

    // ---- model ----
    log::info!("<== Model ==>");
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let mut net = SpeakerNet::new(
        &config.model,
        &config.model_args,
        &config.projection_args,
        vb,
    )?;
    match &config.model_init {
        Some(init) => {
            log::info!("Load initial model from {}", init.display());
            let report = checkpoint::load_checkpoint(&varmap, init)
                .with_context(|| format!("loading {}", init.display()))?;
            if group.is_primary() {
                report.log(init);
            }
        }
        None => log::info!("Train model from scratch..."),
    }
    broadcast_parameters(&group, &varmap)?;

    if group.is_primary() {
        log::info!(
            "{} with {} projection, {} parameters",
            net.name(),
            net.projection().name(),
            model::parameter_count(&varmap)
        );
        let config_path = config.exp_dir.join("config.yaml");
        config.save(&config_path)?;
        log::info!("saved config to {}", config_path.display());
    }
    group.barrier()?;

    // ---- loss, optimizer, schedules ----
    let synchronizer = create_synchronizer(&config.distributed, Arc::clone(&group), 0)?;
    let optimizer = build_optimizer(&config.optimizer, &config.optimizer_args, &varmap)?;
    let lr_scheduler = ExponentialDecrease::new(&config.scheduler_args);
    let margin_scheduler = MarginScheduler::new(&config.margin_update, &mut net);
    if group.is_primary() {
        log::info!("<== Loss ==>");
        log::info!("loss criterion is: {}", config.loss);
        log::info!("<== Optimizer ==>");
        log::info!("optimizer is: {}", config.optimizer);
        log::info!("<== Scheduler ==>");
        log::info!("scheduler is: {}", config.scheduler);
        log::info!("<== MarginScheduler ==>");
        log::info!("{:?}", config.margin_update);
    }

    let mut executor = Executor {
        model: net,
        varmap,
        optimizer,
        lr_scheduler: Box::new(lr_scheduler),
        margin_scheduler,
        synchronizer,
        log_batch_interval: config.train_configs.log_batch_interval,
        label_smoothing: config.loss_args.label_smoothing,
        progress: options.progress,
    };

    let table = Table::new(TABLE_HEADER.len(), TABLE_WIDTH);
    if group.is_primary() {
        log::info!("<========== Training process ==========>");
        for line in table.header(&TABLE_HEADER).lines() {
            log::info!("{}", line);
        }
    }
    group.barrier()?;

    let started = Instant::now();
    let result = run_epochs(&mut executor, &mut loader, &config, &model_dir, group.is_primary());
    let elapsed = started.elapsed().as_secs_f64();

    if group.is_primary() {
        log::info!("{}", table.bottom());
        write_run_json(&config, &device, &result, elapsed)?;
        match &result {
            Ok(_) => log::info!("Training complete in {}", format_duration(elapsed)),
            Err(e) => log::error!("Training failed after {}: {:#}", format_duration(elapsed), e),
        }
    }

    result.map(|_| ())
}

fn run_epochs(
    executor: &mut Executor,
    loader: &mut DataLoader,
    config: &TrainConfig,
    model_dir: &Path,
    is_primary: bool,
) -> Result<Vec<EpochStats>> {
    let num_epochs = config.train_configs.num_epochs;
    let mut history = Vec::with_capacity(num_epochs);

    for epoch in 1..=num_epochs {
        let stats = executor.run_epoch(loader, epoch)?;

        if is_primary
            && checkpoint::should_save(
                epoch,
                num_epochs,
                config.train_configs.save_epoch_interval,
                config.num_avg,
            )
        {
            let path = checkpoint::checkpoint_path(model_dir, epoch);
            checkpoint::save_checkpoint(&executor.varmap, &path)?;
            let meta = CheckpointMeta {
                epoch,
                model: config.model.clone(),
                loss: stats.loss,
                acc: stats.acc,
                lr: stats.lr,
                margin: stats.margin,
                timestamp: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
                checkpoint_file: path.display().to_string(),
            };
            if let Err(e) = meta.save(model_dir) {
                log::warn!("Failed to save checkpoint metadata: {}", e);
            }
            log::debug!("saved {}", path.display());
        }
        history.push(stats);
    }

    if is_primary {
        checkpoint::link_final_model(model_dir, num_epochs)?;
    }
    Ok(history)
}

/// GPU id of this rank; CUDA only sees that device from here on.
fn select_gpu(config: &TrainConfig, rank: usize) -> Result<usize> {
    let gpu = *config.gpus.get(rank).ok_or(TrainError::NoGpuForRank {
        rank,
        available: config.gpus.len(),
    })?;
    if config.target_device == TargetDevice::Gpu {
        std::env::set_var("CUDA_VISIBLE_DEVICES", gpu.to_string());
    }
    Ok(gpu)
}

fn make_device(config: &TrainConfig, seed: u64) -> Result<Device> {
    let device = match config.target_device {
        TargetDevice::Cpu => Device::Cpu,
        // only one device is visible to this process
        TargetDevice::Gpu => Device::cuda_if_available(0)?,
    };
    if !device.is_cpu() {
        device.set_seed(seed)?;
    }
    Ok(device)
}

fn write_run_json(
    config: &TrainConfig,
    device: &Device,
    result: &Result<Vec<EpochStats>>,
    elapsed_secs: f64,
) -> Result<()> {
    let run_json = serde_json::json!({
        "exp_dir": config.exp_dir,
        "model": config.model,
        "projection": config.projection_args.project_type,
        "num_class": config.projection_args.num_class,
        "num_epochs": config.train_configs.num_epochs,
        "epoch_iter": config.scheduler_args.epoch_iter,
        "world_size": config.scheduler_args.process_num,
        "device": format!("{:?}", device),
        "elapsed_secs": elapsed_secs,
        "epochs": result.as_ref().ok(),
        "status": if result.is_ok() { "completed" } else { "failed" },
        "error": result.as_ref().err().map(|e| format!("{:#}", e)),
    });
    let path = config.exp_dir.join("run.json");
    fs::write(&path, serde_json::to_string_pretty(&run_json)?)
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}
