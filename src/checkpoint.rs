//! Checkpoint save/load
//!
//! Checkpoints are safetensors files of every named variable in the model's
//! `VarMap` (`models/model_<epoch>.safetensors`), each with a small JSON
//! sidecar. Loading is non-strict: variables whose name and shape match are
//! restored, everything else is reported.

use candle_core::{Device, Result};
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

pub const FINAL_MODEL: &str = "final_model.safetensors";

pub fn checkpoint_path(model_dir: &Path, epoch: usize) -> PathBuf {
    model_dir.join(format!("model_{}.safetensors", epoch))
}

/// Whether epoch `epoch` (1-based) is written to disk: every
/// `save_epoch_interval` epochs, plus the last `num_avg` epochs for averaging.
pub fn should_save(epoch: usize, num_epochs: usize, save_epoch_interval: usize, num_avg: usize) -> bool {
    epoch % save_epoch_interval == 0 || epoch >= num_epochs.saturating_sub(num_avg)
}

pub fn save_checkpoint(varmap: &VarMap, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(candle_core::Error::wrap)?;
        }
    }
    varmap.save(path)
}

/// Outcome of a non-strict load
#[derive(Debug, Default)]
pub struct LoadReport {
    pub loaded: usize,
    /// In the model but not in the file
    pub missing: Vec<String>,
    /// In the file but not in the model
    pub unexpected: Vec<String>,
    /// `(name, model shape, file shape)`
    pub mismatched: Vec<(String, Vec<usize>, Vec<usize>)>,
}

impl LoadReport {
    fn is_exact(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty() && self.mismatched.is_empty()
    }

    pub fn log(&self, path: &Path) {
        log::info!("Loaded {} tensors from {}", self.loaded, path.display());
        if self.is_exact() {
            return;
        }
        if !self.missing.is_empty() {
            log::warn!("missing tensor: {}", self.missing.join(", "));
        }
        if !self.unexpected.is_empty() {
            log::warn!("unexpected tensor: {}", self.unexpected.join(", "));
        }
        for (name, ours, theirs) in &self.mismatched {
            log::warn!("shape mismatch for {}: model {:?}, checkpoint {:?}", name, ours, theirs);
        }
    }
}

/// Copy matching tensors from a safetensors file into `varmap`.
pub fn load_checkpoint(varmap: &VarMap, path: &Path) -> Result<LoadReport> {
    let tensors = candle_core::safetensors::load(path, &Device::Cpu)?;
    let data = varmap
        .data()
        .lock()
        .map_err(|_| candle_core::Error::Msg("VarMap lock poisoned".to_string()))?;

    let mut report = LoadReport::default();
    let mut names: Vec<&String> = data.keys().collect();
    names.sort();
    for name in names {
        let var = &data[name];
        match tensors.get(name) {
            Some(t) if t.dims() == var.dims() => {
                var.set(&t.to_dtype(var.dtype())?.to_device(var.device())?)?;
                report.loaded += 1;
            }
            Some(t) => report
                .mismatched
                .push((name.clone(), var.dims().to_vec(), t.dims().to_vec())),
            None => report.missing.push(name.clone()),
        }
    }

    let ours: HashSet<&String> = data.keys().collect();
    report.unexpected = tensors
        .keys()
        .filter(|k| !ours.contains(k))
        .cloned()
        .collect();
    report.unexpected.sort();

    Ok(report)
}

/// Point `final_model.safetensors` at the last epoch's checkpoint.
pub fn link_final_model(model_dir: &Path, num_epochs: usize) -> std::io::Result<PathBuf> {
    let target = checkpoint_path(model_dir, num_epochs);
    let link = model_dir.join(FINAL_MODEL);
    if link.symlink_metadata().is_ok() {
        fs::remove_file(&link)?;
    }

    #[cfg(unix)]
    {
        let relative = target
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| target.clone());
        std::os::unix::fs::symlink(relative, &link)?;
    }
    #[cfg(not(unix))]
    {
        fs::copy(&target, &link)?;
    }

    Ok(link)
}

/// Metadata written next to each checkpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub epoch: usize,
    pub model: String,
    pub loss: f64,
    pub acc: f64,
    pub lr: f64,
    pub margin: f64,
    pub timestamp: String,
    pub checkpoint_file: String,
}

impl CheckpointMeta {
    pub fn path(model_dir: &Path, epoch: usize) -> PathBuf {
        model_dir.join(format!("model_{}.meta.json", epoch))
    }

    /// Save metadata to JSON file alongside checkpoint
    pub fn save(&self, model_dir: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(Self::path(model_dir, self.epoch), json)?;
        Ok(())
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}
