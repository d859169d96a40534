use crate::{common::*, config::LearningRateSchedule};

/// Per-epoch learning rate schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum LrScheduler {
    Constant {
        lr: f64,
    },
    MultiStep {
        lr_cache: f64,
        epoch: usize,
        base_lr: f64,
        milestones: Vec<usize>,
        gamma: f64,
    },
}

impl LrScheduler {
    pub fn new(config: &LearningRateSchedule) -> Result<Self> {
        let scheduler = match *config {
            LearningRateSchedule::Constant { lr } => {
                ensure!(lr >= 0.0, "the lr must be non-negative");
                Self::Constant { lr: lr.raw() }
            }
            LearningRateSchedule::MultiStep {
                base_lr,
                ref milestones,
                gamma,
            } => {
                ensure!(base_lr > 0.0, "base_lr must be positive");
                ensure!(gamma > 0.0, "gamma must be positive");
                ensure!(
                    milestones.iter().tuple_windows().all(|(lhs, rhs)| lhs < rhs),
                    "the milestones must be strictly increasing"
                );

                Self::MultiStep {
                    lr_cache: base_lr.raw(),
                    epoch: 0,
                    base_lr: base_lr.raw(),
                    milestones: milestones.clone(),
                    gamma: gamma.raw(),
                }
            }
        };

        Ok(scheduler)
    }

    /// Moves the schedule to the given epoch.
    pub fn step(&mut self, new_epoch: usize) {
        if let Self::MultiStep {
            lr_cache,
            epoch,
            base_lr,
            milestones,
            gamma,
        } = self
        {
            *epoch = new_epoch;
            let num_passed = milestones
                .iter()
                .take_while(|&&milestone| milestone <= new_epoch)
                .count();
            *lr_cache = *base_lr * gamma.powi(num_passed as i32);
        }
    }

    pub fn lr(&self) -> f64 {
        match self {
            Self::Constant { lr } => *lr,
            Self::MultiStep { lr_cache, .. } => *lr_cache,
        }
    }

    pub fn epoch(&self) -> Option<usize> {
        match self {
            Self::Constant { .. } => None,
            Self::MultiStep { epoch, .. } => Some(*epoch),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn multi_step_decay() -> Result<()> {
        let mut scheduler = LrScheduler::new(&LearningRateSchedule::MultiStep {
            base_lr: r64(0.1),
            milestones: vec![3, 5],
            gamma: r64(0.5),
        })?;
        assert_abs_diff_eq!(scheduler.lr(), 0.1);

        let lrs: Vec<_> = (1..=6)
            .map(|epoch| {
                scheduler.step(epoch);
                scheduler.lr()
            })
            .collect();
        let expect = [0.1, 0.1, 0.05, 0.05, 0.025, 0.025];
        lrs.iter()
            .zip(expect)
            .for_each(|(lr, expect)| assert_abs_diff_eq!(*lr, expect, epsilon = 1e-12));
        assert_eq!(scheduler.epoch(), Some(6));
        Ok(())
    }

    #[test]
    fn restore_from_state() -> Result<()> {
        let mut scheduler = LrScheduler::new(&LearningRateSchedule::MultiStep {
            base_lr: r64(1e-4),
            milestones: vec![35],
            gamma: r64(0.1),
        })?;
        scheduler.step(40);

        let text = serde_json::to_string(&scheduler)?;
        let restored: LrScheduler = serde_json::from_str(&text)?;
        assert_eq!(restored, scheduler);
        assert_abs_diff_eq!(restored.lr(), 1e-5, epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn reject_invalid_schedule() {
        assert!(LrScheduler::new(&LearningRateSchedule::MultiStep {
            base_lr: r64(0.1),
            milestones: vec![5, 3],
            gamma: r64(0.1),
        })
        .is_err());
        assert!(LrScheduler::new(&LearningRateSchedule::Constant { lr: r64(-1.0) }).is_err());
    }
}
