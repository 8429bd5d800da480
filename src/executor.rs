//! One epoch of training
//!
//! For every batch: step the schedules at the global iteration, forward the
//! encoder and head, cross entropy, backward, average gradients across ranks
//! and apply the optimizer update. Running loss and top-1 accuracy are
//! reported as table rows every `log_batch_interval` batches and at the end
//! of the epoch.

use candle_core::Result;
use candle_nn::VarMap;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::Instant;

use crate::data::DataLoader;
use crate::distributed::{compute_grad_norm, GradientSynchronizer, TrainOptimizer};
use crate::logging::Table;
use crate::model::{self, SpeakerNet};
use crate::scheduler::{LrScheduler, MarginScheduler};

/// Column names of the progress table
pub const TABLE_HEADER: [&str; 6] = ["Epoch", "Batch", "Lr", "Margin", "Loss", "Acc"];
pub const TABLE_WIDTH: usize = 10;

/// Running average weighted by batch size
#[derive(Debug, Default, Clone)]
pub struct AverageMeter {
    sum: f64,
    count: usize,
}

impl AverageMeter {
    pub fn update(&mut self, value: f64, n: usize) {
        self.sum += value * n as f64;
        self.count += n;
    }

    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

/// Top-1 accuracy in percent
#[derive(Debug, Default, Clone)]
pub struct AccuracyMeter {
    correct: usize,
    total: usize,
}

impl AccuracyMeter {
    pub fn update(&mut self, correct: usize, total: usize) {
        self.correct += correct;
        self.total += total;
    }

    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            100.0 * self.correct as f64 / self.total as f64
        }
    }
}

/// Summary of a finished epoch
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct EpochStats {
    pub epoch: usize,
    pub loss: f64,
    pub acc: f64,
    pub lr: f64,
    pub margin: f64,
    pub batches: usize,
    pub seconds: f64,
}

/// Everything the training loop mutates, owned in one place.
pub struct Executor {
    pub model: SpeakerNet,
    pub varmap: VarMap,
    pub optimizer: Box<dyn TrainOptimizer>,
    pub lr_scheduler: Box<dyn LrScheduler>,
    pub margin_scheduler: MarginScheduler,
    pub synchronizer: Box<dyn GradientSynchronizer>,
    pub log_batch_interval: usize,
    pub label_smoothing: f64,
    /// Show an indicatif bar on the primary rank
    pub progress: bool,
}

impl Executor {
    /// Train for one epoch (1-based) over `loader`.
    pub fn run_epoch(&mut self, loader: &mut DataLoader, epoch: usize) -> Result<EpochStats> {
        let epoch_iter = loader.len();
        let table = Table::new(TABLE_HEADER.len(), TABLE_WIDTH);
        let pb = self.progress_bar(epoch, epoch_iter)?;
        let start = Instant::now();

        let mut loss_meter = AverageMeter::default();
        let mut acc_meter = AccuracyMeter::default();

        for (i, batch) in loader.epoch(epoch).enumerate() {
            let batch = batch?;
            let cur_iter = (epoch - 1) * epoch_iter + i;
            self.lr_scheduler.step(Some(cur_iter), self.optimizer.as_mut());
            self.margin_scheduler.step(Some(cur_iter), &mut self.model);

            let logits = self.model.forward_t(&batch.feats, &batch.labels, true)?;
            let loss = model::cross_entropy(&logits, &batch.labels, self.label_smoothing)?;
            let loss_value = loss.to_scalar::<f32>()? as f64;
            if !loss_value.is_finite() {
                return Err(candle_core::Error::Msg(format!(
                    "loss became {} at epoch {} batch {}",
                    loss_value,
                    epoch,
                    i + 1
                )));
            }

            let grads = loss.backward()?;
            let synced = self.synchronizer.synchronize_gradients(&grads, &self.varmap)?;
            self.optimizer.step(&synced)?;

            let batch_size = batch.labels.dim(0)?;
            loss_meter.update(loss_value, batch_size);
            acc_meter.update(model::correct_count(&logits, &batch.labels)?, batch_size);

            pb.set_position((i + 1) as u64);
            pb.set_message(format!("loss: {:.4} | acc: {:.2}", loss_meter.avg(), acc_meter.percent()));

            if (i + 1) % self.log_batch_interval == 0 || i + 1 == epoch_iter {
                let row = table.row(&[
                    epoch.to_string(),
                    (i + 1).to_string(),
                    format!("{:.3e}", self.optimizer.learning_rate()),
                    format!("{:.4}", self.margin_scheduler.margin(&self.model)),
                    format!("{:.4}", loss_meter.avg()),
                    format!("{:.3}", acc_meter.percent()),
                ]);
                pb.suspend(|| log::info!("{}", row));
                if log::log_enabled!(log::Level::Debug) {
                    log::debug!("grad norm {:.4}", compute_grad_norm(&synced)?);
                }
            }
        }
        pb.finish_and_clear();

        Ok(EpochStats {
            epoch,
            loss: loss_meter.avg(),
            acc: acc_meter.percent(),
            lr: self.optimizer.learning_rate(),
            margin: self.margin(),
            batches: epoch_iter,
            seconds: start.elapsed().as_secs_f64(),
        })
    }

    pub fn margin(&self) -> f64 {
        self.margin_scheduler.margin(&self.model)
    }

    fn progress_bar(&self, epoch: usize, len: usize) -> Result<ProgressBar> {
        if !(self.progress && self.synchronizer.is_primary()) {
            return Ok(ProgressBar::hidden());
        }
        let sty = ProgressStyle::with_template(
            "{prefix} {bar:40.cyan/dim} {pos:>7}/{len:7} [{elapsed}<{eta}] {msg}",
        )
        .map_err(candle_core::Error::wrap)?
        .progress_chars("━━─");
        let pb = ProgressBar::with_draw_target(Some(len as u64), ProgressDrawTarget::stderr());
        pb.set_style(sty);
        pb.set_prefix(format!("epoch {}", epoch));
        Ok(pb)
    }
}

/// Format seconds into human-readable duration (e.g., "5m32s", "2h14m", "3d05h")
pub fn format_duration(secs: f64) -> String {
    let total_secs = secs.round() as u64;
    let days = total_secs / 86400;
    let hours = (total_secs % 86400) / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;

    if days > 0 {
        format!("{}d{:02}h", days, hours)
    } else if hours > 0 {
        format!("{}h{:02}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m{:02}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_average_meter_weights_by_count() {
        let mut m = AverageMeter::default();
        assert_eq!(m.avg(), 0.0);
        m.update(1.0, 1);
        m.update(4.0, 3);
        assert!((m.avg() - 3.25).abs() < 1e-12);
    }

    #[test]
    fn test_accuracy_meter() {
        let mut m = AccuracyMeter::default();
        m.update(3, 4);
        m.update(1, 4);
        assert!((m.percent() - 50.0).abs() < 1e-12);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(42.0), "42s");
        assert_eq!(format_duration(332.0), "5m32s");
        assert_eq!(format_duration(8040.0), "2h14m");
        assert_eq!(format_duration(3.0 * 86400.0 + 5.0 * 3600.0), "3d05h");
    }
}
