//! Learning-rate and margin schedules
//!
//! Both schedules are driven by the global iteration
//! `(epoch - 1) * epoch_iter + batch`, which the executor passes to `step` on
//! every batch so the schedule never drifts from the data position.

use crate::config::{IncreaseType, MarginUpdateArgs, SchedulerArgs};
use crate::distributed::TrainOptimizer;
use crate::model::MarginUpdate;

/// Trait for learning rate schedulers
pub trait LrScheduler {
    /// Learning rate at the current iteration
    fn get_lr(&self) -> f64;

    /// Jump to `current_iter` (if given), apply its learning rate to the
    /// optimizer and advance by one iteration. Returns the applied rate.
    fn step(&mut self, current_iter: Option<usize>, optimizer: &mut dyn TrainOptimizer) -> f64;
}

/// Exponential decay from `initial_lr` to `final_lr` over the whole run,
/// scaled by the number of processes after a linear warm-up.
///
/// ```text
/// lr(i) = coeff(i) * initial_lr * exp(i / max_iter * ln(final_lr / initial_lr))
/// ```
#[derive(Debug, Clone)]
pub struct ExponentialDecrease {
    initial_lr: f64,
    final_lr: f64,
    warm_up_iter: usize,
    max_iter: usize,
    warm_from_zero: bool,
    scale_ratio: f64,
    current_iter: usize,
}

impl ExponentialDecrease {
    pub fn new(args: &SchedulerArgs) -> Self {
        let epoch_iter = args.epoch_iter.max(1);
        Self {
            initial_lr: args.initial_lr,
            final_lr: args.final_lr,
            warm_up_iter: args.warm_up_epoch * epoch_iter,
            max_iter: (args.num_epochs * epoch_iter).max(1),
            warm_from_zero: args.warm_from_zero,
            scale_ratio: args.scale_ratio * args.process_num.max(1) as f64,
            current_iter: 0,
        }
    }

    /// Warm-up multiplier; `scale_ratio` once warm-up is over
    fn coeff(&self) -> f64 {
        if self.current_iter < self.warm_up_iter {
            let progress = self.current_iter as f64 / self.warm_up_iter as f64;
            if self.warm_from_zero {
                return self.scale_ratio * progress;
            }
            if self.scale_ratio > 1.0 {
                return (self.scale_ratio - 1.0) * progress + 1.0;
            }
        }
        self.scale_ratio
    }
}

impl LrScheduler for ExponentialDecrease {
    fn get_lr(&self) -> f64 {
        let progress = self.current_iter as f64 / self.max_iter as f64;
        self.coeff() * self.initial_lr * (progress * (self.final_lr / self.initial_lr).ln()).exp()
    }

    fn step(&mut self, current_iter: Option<usize>, optimizer: &mut dyn TrainOptimizer) -> f64 {
        if let Some(iter) = current_iter {
            self.current_iter = iter;
        }
        let lr = self.get_lr();
        optimizer.set_learning_rate(lr);
        self.current_iter += 1;
        lr
    }
}

/// Raises the projection margin from `initial_margin` to `final_margin`
/// between `increase_start_epoch` and `fix_start_epoch`, then freezes it.
#[derive(Debug, Clone)]
pub struct MarginScheduler {
    increase_start_iter: usize,
    fix_start_iter: usize,
    initial_margin: f64,
    final_margin: f64,
    increase_type: IncreaseType,
    update_margin: bool,
    fix_already: bool,
    current_iter: usize,
}

impl MarginScheduler {
    /// Build the schedule and set the projection to `initial_margin`.
    pub fn new(args: &MarginUpdateArgs, target: &mut dyn MarginUpdate) -> Self {
        let has_margin = target.margin().is_some();
        if has_margin {
            target.update_margin(args.initial_margin);
        }
        Self {
            increase_start_iter: args.increase_start_epoch.saturating_sub(1) * args.epoch_iter,
            fix_start_iter: args.fix_start_epoch.saturating_sub(1) * args.epoch_iter,
            initial_margin: args.initial_margin,
            final_margin: args.final_margin,
            increase_type: args.increase_type,
            update_margin: args.update_margin && has_margin,
            fix_already: false,
            current_iter: 0,
        }
    }

    fn increase_margin(&self) -> f64 {
        let span = (self.fix_start_iter - self.increase_start_iter) as f64;
        let progress = (self.current_iter - self.increase_start_iter) as f64 / span;
        let ratio = match self.increase_type {
            IncreaseType::Exp => 1.0 - (progress * (1e-3f64 / (1.0 + 1e-6)).ln()).exp(),
            IncreaseType::Linear => progress,
        };
        self.initial_margin + (self.final_margin - self.initial_margin) * ratio
    }

    pub fn step(&mut self, current_iter: Option<usize>, target: &mut dyn MarginUpdate) {
        if !self.update_margin || self.fix_already {
            return;
        }
        if let Some(iter) = current_iter {
            self.current_iter = iter;
        }

        if self.current_iter >= self.fix_start_iter {
            self.fix_already = true;
            target.update_margin(self.final_margin);
        } else if self.current_iter >= self.increase_start_iter {
            target.update_margin(self.increase_margin());
        }
        self.current_iter += 1;
    }

    /// Current margin of `target`, 0.0 for projections without one
    pub fn margin(&self, target: &dyn MarginUpdate) -> f64 {
        target.margin().unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::SyncedGradient;

    struct FakeOptimizer {
        lr: f64,
    }

    impl TrainOptimizer for FakeOptimizer {
        fn step(&mut self, _: &[SyncedGradient]) -> candle_core::Result<()> {
            Ok(())
        }
        fn learning_rate(&self) -> f64 {
            self.lr
        }
        fn set_learning_rate(&mut self, lr: f64) {
            self.lr = lr;
        }
    }

    struct FakeProjection {
        margin: Option<f64>,
    }

    impl MarginUpdate for FakeProjection {
        fn margin(&self) -> Option<f64> {
            self.margin
        }
        fn update_margin(&mut self, margin: f64) {
            if self.margin.is_some() {
                self.margin = Some(margin);
            }
        }
    }

    fn lr_args(warm_from_zero: bool, process_num: usize) -> SchedulerArgs {
        SchedulerArgs {
            initial_lr: 0.1,
            final_lr: 0.001,
            warm_up_epoch: 2,
            warm_from_zero,
            scale_ratio: 1.0,
            num_epochs: 10,
            epoch_iter: 10,
            process_num,
        }
    }

    fn margin_args(increase_type: IncreaseType) -> MarginUpdateArgs {
        MarginUpdateArgs {
            initial_margin: 0.0,
            final_margin: 0.2,
            increase_start_epoch: 2,
            fix_start_epoch: 4,
            update_margin: true,
            increase_type,
            epoch_iter: 10,
        }
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_lr_decays_to_final_at_max_iter() {
        let mut sched = ExponentialDecrease::new(&lr_args(false, 1));
        let mut opt = FakeOptimizer { lr: 0.0 };
        let first = sched.step(Some(0), &mut opt);
        assert!(close(first, 0.1));
        assert!(close(opt.lr, 0.1));
        // advanced to iteration 1
        assert!(close(sched.get_lr(), 0.1 * (0.01f64.ln() / 100.0).exp()));

        let last = sched.step(Some(100), &mut opt);
        assert!(close(last, 0.001));
    }

    #[test]
    fn test_lr_warm_up_from_zero_and_multi_process() {
        let mut opt = FakeOptimizer { lr: 0.0 };

        let mut sched = ExponentialDecrease::new(&lr_args(true, 2));
        assert!(close(sched.step(Some(0), &mut opt), 0.0));
        // halfway through warm-up: coeff = 2 * 10 / 20 = 1
        let mid = sched.step(Some(10), &mut opt);
        assert!(close(mid, 0.1 * (0.1f64 * (0.01f64).ln()).exp()));

        let mut sched = ExponentialDecrease::new(&lr_args(false, 2));
        // warm-up from 1x to 2x
        assert!(close(sched.step(Some(0), &mut opt), 0.1));
        let after = sched.step(Some(20), &mut opt);
        assert!(close(after, 2.0 * 0.1 * (0.2f64 * (0.01f64).ln()).exp()));
    }

    #[test]
    fn test_lr_step_without_iter_advances() {
        let mut sched = ExponentialDecrease::new(&lr_args(false, 1));
        let mut opt = FakeOptimizer { lr: 0.0 };
        let a = sched.step(None, &mut opt);
        let b = sched.step(None, &mut opt);
        assert!(b < a);
        assert!(close(sched.get_lr(), 0.1 * (0.02 * 0.01f64.ln()).exp()));
    }

    #[test]
    fn test_margin_schedule_exp() {
        let mut proj = FakeProjection { margin: Some(0.5) };
        let mut sched = MarginScheduler::new(&margin_args(IncreaseType::Exp), &mut proj);
        // construction resets to the initial margin
        assert_eq!(proj.margin, Some(0.0));

        sched.step(Some(5), &mut proj);
        assert_eq!(sched.margin(&proj), 0.0);

        let mut last = 0.0;
        for iter in 10..30 {
            sched.step(Some(iter), &mut proj);
            let m = sched.margin(&proj);
            assert!(m >= last);
            assert!(m < 0.2);
            last = m;
        }

        sched.step(Some(30), &mut proj);
        assert!(close(sched.margin(&proj), 0.2));

        // frozen afterwards
        proj.margin = Some(0.7);
        sched.step(Some(31), &mut proj);
        assert_eq!(proj.margin, Some(0.7));
    }

    #[test]
    fn test_margin_schedule_linear_midpoint() {
        let mut proj = FakeProjection { margin: Some(0.0) };
        let mut sched = MarginScheduler::new(&margin_args(IncreaseType::Linear), &mut proj);
        sched.step(Some(20), &mut proj);
        assert!(close(sched.margin(&proj), 0.1));
    }

    #[test]
    fn test_margin_disabled() {
        let mut proj = FakeProjection { margin: Some(0.1) };
        let mut args = margin_args(IncreaseType::Exp);
        args.update_margin = false;
        let mut sched = MarginScheduler::new(&args, &mut proj);
        sched.step(Some(100), &mut proj);
        assert_eq!(proj.margin, Some(0.0));

        let mut plain = FakeProjection { margin: None };
        let mut sched = MarginScheduler::new(&margin_args(IncreaseType::Exp), &mut plain);
        sched.step(Some(100), &mut plain);
        assert_eq!(sched.margin(&plain), 0.0);
        assert_eq!(plain.margin, None);
    }
}
