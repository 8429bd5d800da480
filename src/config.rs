use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::model::{resnet, XVector};

// Re-export distributed config types
pub use crate::distributed::sync::DistributedConfig;

// Default value functions for serde
fn default_seed() -> u64 { 42 }
fn default_gpus() -> Vec<usize> { vec![0] }
fn default_num_avg() -> usize { 10 }
fn default_loss() -> String { "CrossEntropyLoss".to_string() }
fn default_optimizer() -> String { "SGD".to_string() }
fn default_scheduler() -> String { "ExponentialDecrease".to_string() }
fn default_true() -> bool { true }
fn default_one() -> f64 { 1.0 }

/// Full training configuration, mirrored from the YAML file.
///
/// Fields marked "derived" are filled in by the trainer before the config is
/// written to `exp_dir/config.yaml`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrainConfig {
    pub exp_dir: PathBuf,
    /// GPU id per rank: rank `r` trains on `gpus[r]`
    #[serde(default = "default_gpus")]
    pub gpus: Vec<usize>,
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Number of final epochs that are always checkpointed (for model averaging)
    #[serde(default = "default_num_avg")]
    pub num_avg: usize,

    /// Encoder architecture name (`TDNN`, `XVEC`, `ResNet18`, `ResNet34`)
    pub model: String,
    /// Checkpoint to initialize from instead of training from scratch
    #[serde(default)]
    pub model_init: Option<PathBuf>,
    pub model_args: ModelArgs,
    pub projection_args: ProjectionArgs,
    pub margin_update: MarginUpdateArgs,

    #[serde(default = "default_loss")]
    pub loss: String,
    #[serde(default)]
    pub loss_args: LossArgs,

    #[serde(default = "default_optimizer")]
    pub optimizer: String,
    #[serde(default)]
    pub optimizer_args: OptimizerArgs,

    #[serde(default = "default_scheduler")]
    pub scheduler: String,
    pub scheduler_args: SchedulerArgs,

    pub dataset_args: DatasetArgs,
    #[serde(default)]
    pub feature_args: FeatureArgs,
    #[serde(default)]
    pub dataloader_args: DataLoaderArgs,
    pub train_configs: TrainSchedule,

    #[serde(default)]
    pub target_device: TargetDevice,
    #[serde(default)]
    pub distributed: DistributedConfig,
}

/// Target device for training
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum TargetDevice {
    #[default]
    Gpu,
    Cpu,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelArgs {
    pub feat_dim: usize,
    pub embed_dim: usize,
    /// ResNet: base channel count
    #[serde(default)]
    pub m_channels: Option<usize>,
    /// ResNet: add a second embedding layer
    #[serde(default)]
    pub two_emb_layer: bool,
    /// TDNN: frame-level hidden width
    #[serde(default)]
    pub hidden_dim: Option<usize>,
    /// TDNN: width of the last frame layer before pooling
    #[serde(default)]
    pub stats_dim: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProjectionArgs {
    /// `linear`, `add_margin` or `arc_margin`
    pub project_type: String,
    #[serde(default)]
    pub scale: Option<f64>,
    #[serde(default)]
    pub easy_margin: bool,
    /// derived: `model_args.embed_dim`
    #[serde(default)]
    pub embed_dim: usize,
    /// derived: speaker count (x3 with speed perturbation)
    #[serde(default)]
    pub num_class: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MarginUpdateArgs {
    pub initial_margin: f64,
    pub final_margin: f64,
    pub increase_start_epoch: usize,
    pub fix_start_epoch: usize,
    #[serde(default = "default_true")]
    pub update_margin: bool,
    /// `exp` or `linear`
    #[serde(default)]
    pub increase_type: IncreaseType,
    /// derived: batches per epoch
    #[serde(default)]
    pub epoch_iter: usize,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum IncreaseType {
    #[default]
    Exp,
    Linear,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct LossArgs {
    #[serde(default)]
    pub label_smoothing: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OptimizerArgs {
    /// derived: `scheduler_args.initial_lr`
    #[serde(default)]
    pub lr: f64,
    #[serde(default)]
    pub momentum: f64,
    #[serde(default)]
    pub dampening: f64,
    #[serde(default)]
    pub nesterov: bool,
    #[serde(default)]
    pub weight_decay: f64,
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    #[serde(default = "default_eps")]
    pub eps: f64,
}

fn default_beta1() -> f64 { 0.9 }
fn default_beta2() -> f64 { 0.999 }
fn default_eps() -> f64 { 1e-8 }

impl Default for OptimizerArgs {
    fn default() -> Self {
        Self {
            lr: 0.1,
            momentum: 0.0,
            dampening: 0.0,
            nesterov: false,
            weight_decay: 0.0,
            beta1: default_beta1(),
            beta2: default_beta2(),
            eps: default_eps(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerArgs {
    pub initial_lr: f64,
    pub final_lr: f64,
    #[serde(default)]
    pub warm_up_epoch: usize,
    #[serde(default)]
    pub warm_from_zero: bool,
    /// Per-process learning-rate multiplier; the schedule peaks at
    /// `scale_ratio * process_num`
    #[serde(default = "default_one")]
    pub scale_ratio: f64,
    /// derived: final epoch count
    #[serde(default)]
    pub num_epochs: usize,
    /// derived: batches per epoch
    #[serde(default)]
    pub epoch_iter: usize,
    /// derived: world size
    #[serde(default)]
    pub process_num: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatasetArgs {
    pub train_scp: PathBuf,
    pub train_label: PathBuf,
    /// Frames per training chunk
    #[serde(default = "default_num_frms")]
    pub num_frms: usize,
    /// Treat 0.9x / 1.1x speed copies as extra speakers
    #[serde(default)]
    pub speed_perturb: bool,
    /// Probability of augmenting a chunk; also stretches the epoch count
    #[serde(default)]
    pub aug_prob: f64,
}

fn default_num_frms() -> usize { 200 }

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FeatureArgs {
    /// derived: `model_args.feat_dim`
    #[serde(default)]
    pub feat_dim: usize,
    /// Per-utterance mean normalisation
    #[serde(default = "default_true")]
    pub cmvn: bool,
    /// Widest time mask, in frames
    #[serde(default = "default_time_mask")]
    pub max_time_mask: usize,
    /// Widest frequency mask, in bins
    #[serde(default = "default_freq_mask")]
    pub max_freq_mask: usize,
}

fn default_time_mask() -> usize { 20 }
fn default_freq_mask() -> usize { 8 }

impl Default for FeatureArgs {
    fn default() -> Self {
        Self {
            feat_dim: 0,
            cmvn: true,
            max_time_mask: default_time_mask(),
            max_freq_mask: default_freq_mask(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DataLoaderArgs {
    pub batch_size: usize,
    /// Background loading threads (0 loads on the training thread)
    #[serde(default)]
    pub num_workers: usize,
    #[serde(default = "default_true")]
    pub drop_last: bool,
    /// Batches buffered ahead of the training loop
    #[serde(default = "default_prefetch")]
    pub prefetch: usize,
}

fn default_prefetch() -> usize { 4 }

impl Default for DataLoaderArgs {
    fn default() -> Self {
        Self {
            batch_size: 128,
            num_workers: 0,
            drop_last: true,
            prefetch: default_prefetch(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrainSchedule {
    pub num_epochs: usize,
    #[serde(default = "default_log_interval")]
    pub log_batch_interval: usize,
    #[serde(default = "default_save_interval")]
    pub save_epoch_interval: usize,
}

fn default_log_interval() -> usize { 100 }
fn default_save_interval() -> usize { 5 }

impl TrainConfig {
    /// Load configuration from a YAML file and apply `--key=value` overrides
    ///
    /// Overrides are applied to the raw YAML tree before it is deserialized,
    /// so any field (nested ones via dotted paths) can be set from the CLI.
    ///
    /// # Example
    /// ```no_run
    /// # use voxtrain::config::TrainConfig;
    /// let overrides = vec!["--exp_dir=exp/run2".to_string(), "--train_configs.num_epochs".to_string(), "10".to_string()];
    /// let config = TrainConfig::load("conf/config.yaml", &overrides)?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P, overrides: &[String]) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_yaml_str(&content, overrides)
    }

    pub fn from_yaml_str(content: &str, overrides: &[String]) -> Result<Self, ConfigError> {
        let mut root: Value = serde_yaml::from_str(content)?;
        for (key, value) in parse_overrides(overrides)? {
            apply_override(&mut root, &key, value)?;
        }
        let config: TrainConfig = serde_yaml::from_value(root)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |msg: &str| Err(ConfigError::Validation(msg.to_string()));

        if self.exp_dir.as_os_str().is_empty() {
            return fail("exp_dir must be set");
        }
        if self.gpus.is_empty() {
            return fail("gpus must list at least one device");
        }
        if self.train_configs.num_epochs == 0 {
            return fail("train_configs.num_epochs must be > 0");
        }
        if self.train_configs.log_batch_interval == 0 {
            return fail("train_configs.log_batch_interval must be > 0");
        }
        if self.train_configs.save_epoch_interval == 0 {
            return fail("train_configs.save_epoch_interval must be > 0");
        }
        if self.dataloader_args.batch_size == 0 {
            return fail("dataloader_args.batch_size must be > 0");
        }
        if self.dataset_args.num_frms == 0 {
            return fail("dataset_args.num_frms must be > 0");
        }
        self.validate_model()?;
        if !(0.0..1.0).contains(&self.dataset_args.aug_prob) {
            return fail("dataset_args.aug_prob must be in [0, 1)");
        }
        if self.scheduler_args.initial_lr <= 0.0 || self.scheduler_args.final_lr <= 0.0 {
            return fail("scheduler_args.initial_lr and final_lr must be > 0");
        }
        if self.scheduler_args.scale_ratio <= 0.0 {
            return fail("scheduler_args.scale_ratio must be > 0");
        }
        let m = &self.margin_update;
        if m.increase_start_epoch == 0 || m.fix_start_epoch < m.increase_start_epoch {
            return fail("margin_update requires 1 <= increase_start_epoch <= fix_start_epoch");
        }
        if !(0.0..1.0).contains(&self.loss_args.label_smoothing) {
            return fail("loss_args.label_smoothing must be in [0, 1)");
        }
        if self.loss != "CrossEntropyLoss" {
            return Err(ConfigError::Validation(format!(
                "unsupported loss '{}': only CrossEntropyLoss is available",
                self.loss
            )));
        }
        if self.scheduler != "ExponentialDecrease" {
            return Err(ConfigError::Validation(format!(
                "unsupported scheduler '{}': only ExponentialDecrease is available",
                self.scheduler
            )));
        }
        Ok(())
    }

    /// Model sizes, and chunks long enough to leave two pooled frames
    fn validate_model(&self) -> Result<(), ConfigError> {
        let args = &self.model_args;
        if args.feat_dim == 0 || args.embed_dim == 0 {
            return Err(ConfigError::Validation(
                "model_args.feat_dim and model_args.embed_dim must be > 0".to_string(),
            ));
        }
        if [args.m_channels, args.hidden_dim, args.stats_dim].contains(&Some(0)) {
            return Err(ConfigError::Validation(
                "model_args.m_channels, hidden_dim and stats_dim must be > 0".to_string(),
            ));
        }

        let num_frms = self.dataset_args.num_frms;
        let pooled = match self.model.as_str() {
            "TDNN" | "XVEC" => num_frms.saturating_sub(XVector::receptive_field()),
            name if resnet::stage_blocks(name).is_some() => resnet::downsampled(num_frms),
            name => {
                return Err(ConfigError::Validation(format!(
                    "unknown model '{}': expected TDNN, XVEC, ResNet18 or ResNet34",
                    name
                )));
            }
        };
        if pooled < 2 {
            return Err(ConfigError::Validation(format!(
                "dataset_args.num_frms = {} is too short for {}: {} frame(s) left for pooling, need 2",
                num_frms, self.model, pooled
            )));
        }
        Ok(())
    }

    /// Copy model dimensions into the sections that depend on them
    pub fn sync_model_dims(&mut self) {
        self.feature_args.feat_dim = self.model_args.feat_dim;
        self.projection_args.embed_dim = self.model_args.embed_dim;
        self.optimizer_args.lr = self.scheduler_args.initial_lr;
    }

    /// Set the projection's class count from the number of speakers
    pub fn set_num_class(&mut self, num_spk: usize) {
        self.projection_args.num_class = if self.dataset_args.speed_perturb {
            num_spk * 3
        } else {
            num_spk
        };
    }

    /// Stretch the epoch count for augmentation and fill in the schedule sizes.
    ///
    /// With augmentation probability `p` only `1 - p` of each epoch is clean
    /// data, so the run is lengthened to see as much clean data as requested.
    pub fn set_schedule(&mut self, epoch_iter: usize, world_size: usize) {
        let stretched =
            self.train_configs.num_epochs as f64 / (1.0 - self.dataset_args.aug_prob);
        self.train_configs.num_epochs = (stretched as usize).max(1);

        self.scheduler_args.num_epochs = self.train_configs.num_epochs;
        self.scheduler_args.epoch_iter = epoch_iter;
        self.scheduler_args.process_num = world_size;
        self.margin_update.epoch_iter = epoch_iter;
    }

    /// Write the (derived) configuration as YAML
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        fs::write(path, yaml)?;
        Ok(())
    }

    pub fn to_yaml_string(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Directory checkpoints are written to
    pub fn model_dir(&self) -> PathBuf {
        self.exp_dir.join("models")
    }
}

/// Parse `--a.b=value` / `--a.b value` pairs into (dotted key, YAML value).
pub fn parse_overrides(args: &[String]) -> Result<Vec<(String, Value)>, ConfigError> {
    let mut result = Vec::new();
    let mut iter = args.iter().peekable();

    while let Some(arg) = iter.next() {
        let body = arg
            .strip_prefix("--")
            .ok_or_else(|| ConfigError::BadOverride(arg.clone()))?;
        let (key, raw) = match body.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => match iter.peek() {
                Some(next) if !next.starts_with("--") => {
                    let v = next.to_string();
                    iter.next();
                    (body.to_string(), v)
                }
                // bare flag: `--foo` means `--foo=true`
                _ => (body.to_string(), "true".to_string()),
            },
        };
        if key.is_empty() || key.split('.').any(str::is_empty) {
            return Err(ConfigError::BadOverride(arg.clone()));
        }
        let value: Value = serde_yaml::from_str(&raw).unwrap_or(Value::String(raw));
        result.push((key, value));
    }

    Ok(result)
}

/// Set `value` at dotted `key` inside `root`, creating mappings as needed.
pub fn apply_override(root: &mut Value, key: &str, value: Value) -> Result<(), ConfigError> {
    let segments: Vec<&str> = key.split('.').collect();
    let mut node = root;

    for (i, segment) in segments.iter().enumerate() {
        if node.is_null() {
            *node = Value::Mapping(Mapping::new());
        }
        let map = match node {
            Value::Mapping(map) => map,
            _ => {
                return Err(ConfigError::OverrideTarget {
                    path: key.to_string(),
                    segment: segments[..i].join("."),
                })
            }
        };
        let k = Value::String(segment.to_string());
        if i == segments.len() - 1 {
            map.insert(k, value);
            return Ok(());
        }
        if !map.contains_key(&k) {
            map.insert(k.clone(), Value::Null);
        }
        node = map
            .get_mut(&k)
            .ok_or_else(|| ConfigError::BadOverride(key.to_string()))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) const SAMPLE: &str = r#"
exp_dir: exp/resnet34
gpus: [0, 1]
seed: 42
num_avg: 2
model: ResNet34
model_args:
  feat_dim: 80
  embed_dim: 256
projection_args:
  project_type: arc_margin
  scale: 32.0
margin_update:
  initial_margin: 0.0
  final_margin: 0.2
  increase_start_epoch: 20
  fix_start_epoch: 40
  increase_type: exp
optimizer: SGD
optimizer_args:
  momentum: 0.9
  nesterov: true
  weight_decay: 0.0001
scheduler_args:
  initial_lr: 0.1
  final_lr: 0.00005
  warm_up_epoch: 6
dataset_args:
  train_scp: data/train/feats.scp
  train_label: data/train/utt2spk
  speed_perturb: true
  aug_prob: 0.5
dataloader_args:
  batch_size: 128
  num_workers: 2
train_configs:
  num_epochs: 75
  log_batch_interval: 100
  save_epoch_interval: 5
"#;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parses_sample_with_defaults() {
        let cfg = TrainConfig::from_yaml_str(SAMPLE, &[]).unwrap();
        assert_eq!(cfg.gpus, vec![0, 1]);
        assert_eq!(cfg.loss, "CrossEntropyLoss");
        assert_eq!(cfg.scheduler, "ExponentialDecrease");
        assert_eq!(cfg.dataset_args.num_frms, 200);
        assert!(cfg.feature_args.cmvn);
        assert!(cfg.model_init.is_none());
        assert_eq!(cfg.margin_update.increase_type, IncreaseType::Exp);
        assert_eq!(cfg.target_device, TargetDevice::Gpu);
        assert_eq!(cfg.model_dir(), PathBuf::from("exp/resnet34/models"));
    }

    #[test]
    fn test_overrides_nested_and_top_level() {
        let cfg = TrainConfig::from_yaml_str(
            SAMPLE,
            &args(&[
                "--exp_dir=exp/other",
                "--train_configs.num_epochs",
                "3",
                "--gpus=[2]",
                "--model_init",
                "exp/init/models/final_model.safetensors",
            ]),
        )
        .unwrap();
        assert_eq!(cfg.exp_dir, PathBuf::from("exp/other"));
        assert_eq!(cfg.train_configs.num_epochs, 3);
        assert_eq!(cfg.gpus, vec![2]);
        assert_eq!(
            cfg.model_init,
            Some(PathBuf::from("exp/init/models/final_model.safetensors"))
        );
    }

    #[test]
    fn test_override_creates_missing_sections() {
        let cfg = TrainConfig::from_yaml_str(
            SAMPLE,
            &args(&["--loss_args.label_smoothing=0.1", "--distributed.backend=nccl"]),
        )
        .unwrap();
        assert_eq!(cfg.loss_args.label_smoothing, 0.1);
        assert_eq!(cfg.distributed.backend, crate::distributed::SyncBackend::Nccl);
    }

    #[test]
    fn test_bad_overrides() {
        assert!(matches!(
            parse_overrides(&args(&["exp_dir=x"])),
            Err(ConfigError::BadOverride(_))
        ));
        assert!(matches!(
            parse_overrides(&args(&["--a..b=1"])),
            Err(ConfigError::BadOverride(_))
        ));
        let err = TrainConfig::from_yaml_str(SAMPLE, &args(&["--seed.inner=1"])).unwrap_err();
        assert!(matches!(err, ConfigError::OverrideTarget { .. }));
    }

    #[test]
    fn test_bare_flag_is_true() {
        let parsed = parse_overrides(&args(&["--dataset_args.speed_perturb"])).unwrap();
        assert_eq!(parsed[0].1, Value::Bool(true));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let err = TrainConfig::from_yaml_str(SAMPLE, &args(&["--dataset_args.aug_prob=1.0"]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));

        let err = TrainConfig::from_yaml_str(
            SAMPLE,
            &args(&["--margin_update.fix_start_epoch=10"]),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));

        let err = TrainConfig::from_yaml_str(SAMPLE, &args(&["--loss=TripletLoss"])).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    fn rejected(overrides: &[&str]) -> bool {
        matches!(
            TrainConfig::from_yaml_str(SAMPLE, &args(overrides)),
            Err(ConfigError::Validation(_))
        )
    }

    #[test]
    fn test_validation_rejects_empty_model_dims() {
        assert!(rejected(&["--model_args.feat_dim=0"]));
        assert!(rejected(&["--model=ResNet18", "--model_args.feat_dim=0"]));
        assert!(rejected(&["--model_args.embed_dim=0"]));
        assert!(rejected(&["--model_args.m_channels=0"]));
        assert!(rejected(&["--model=TDNN", "--model_args.hidden_dim=0"]));
    }

    #[test]
    fn test_validation_tdnn_chunk_covers_receptive_field() {
        let rf = XVector::receptive_field();
        let frames = |n: usize| format!("--dataset_args.num_frms={}", n);
        // one pooled frame has no variance
        assert!(rejected(&["--model=TDNN", frames(rf).as_str()]));
        assert!(rejected(&["--model=TDNN", frames(rf + 1).as_str()]));
        assert!(!rejected(&["--model=TDNN", frames(rf + 2).as_str()]));
        assert!(rejected(&["--model=XVEC", "--dataset_args.num_frms=3"]));
    }

    #[test]
    fn test_validation_resnet_chunk_survives_downsampling() {
        assert!(rejected(&["--model=ResNet34", "--dataset_args.num_frms=8"]));
        assert!(!rejected(&["--model=ResNet34", "--dataset_args.num_frms=9"]));
        assert!(rejected(&["--model=ResNet18", "--dataset_args.num_frms=1"]));
    }

    #[test]
    fn test_validation_rejects_unknown_model() {
        assert!(rejected(&["--model=ECAPA"]));
    }

    #[test]
    fn test_derived_fields() {
        let mut cfg = TrainConfig::from_yaml_str(SAMPLE, &[]).unwrap();
        cfg.sync_model_dims();
        cfg.set_num_class(100);
        cfg.set_schedule(50, 2);

        assert_eq!(cfg.feature_args.feat_dim, 80);
        assert_eq!(cfg.projection_args.embed_dim, 256);
        assert_eq!(cfg.optimizer_args.lr, 0.1);
        // speed perturbation triples the classes
        assert_eq!(cfg.projection_args.num_class, 300);
        // aug_prob 0.5 doubles the epochs
        assert_eq!(cfg.train_configs.num_epochs, 150);
        assert_eq!(cfg.scheduler_args.num_epochs, 150);
        assert_eq!(cfg.scheduler_args.epoch_iter, 50);
        assert_eq!(cfg.scheduler_args.process_num, 2);
        assert_eq!(cfg.margin_update.epoch_iter, 50);
    }

    #[test]
    fn test_saved_config_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = TrainConfig::from_yaml_str(SAMPLE, &[]).unwrap();
        cfg.set_schedule(10, 1);
        let path = dir.path().join("config.yaml");
        cfg.save(&path).unwrap();

        let reloaded = TrainConfig::load(&path, &[]).unwrap();
        assert_eq!(reloaded.train_configs.num_epochs, cfg.train_configs.num_epochs);
        assert_eq!(reloaded.scheduler_args.epoch_iter, 10);
    }
}
