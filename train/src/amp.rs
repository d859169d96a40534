//! Dynamic loss scaling for mixed precision training.

use crate::{
    common::*,
    optim::{clip_grad_norm, Adam},
};

/// The checkpointed part of a [GradScaler].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GradScalerState {
    pub scale: f64,
    pub growth_tracker: usize,
}

/// Scales the loss before backward and unscales gradients before the
/// optimizer step.
///
/// A step whose gradients contain inf or NaN is skipped and the scale
/// shrinks. After `growth_interval` consecutive clean steps, the scale grows.
/// When disabled, the scaler only forwards to the optimizer.
#[derive(Debug, Clone)]
pub struct GradScaler {
    enabled: bool,
    scale: f64,
    growth_factor: f64,
    backoff_factor: f64,
    growth_interval: usize,
    growth_tracker: usize,
    found_inf: bool,
}

impl GradScaler {
    pub const INIT_SCALE: f64 = 65536.0;

    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            scale: Self::INIT_SCALE,
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
            growth_tracker: 0,
            found_inf: false,
        }
    }

    pub fn with_growth_interval(mut self, growth_interval: usize) -> Self {
        self.growth_interval = growth_interval.max(1);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// The current scale factor, or 1 if disabled.
    pub fn scale_factor(&self) -> f64 {
        if self.enabled {
            self.scale
        } else {
            1.0
        }
    }

    pub fn scale(&self, loss: &Tensor) -> Tensor {
        if self.enabled {
            loss * self.scale
        } else {
            loss.shallow_clone()
        }
    }

    /// Unscales gradients, optionally clips them, and steps the optimizer.
    ///
    /// Returns `false` if the step was skipped due to non-finite gradients.
    pub fn step(
        &mut self,
        vs: &nn::VarStore,
        optimizer: &mut Adam,
        max_norm: Option<f64>,
    ) -> Result<bool> {
        if self.enabled {
            self.found_inf = self.unscale(vs)?;
            if self.found_inf {
                debug!(
                    "non-finite gradients found, skip the step at scale {}",
                    self.scale
                );
                return Ok(false);
            }
        }

        if let Some(max_norm) = max_norm {
            if max_norm > 0.0 {
                clip_grad_norm(vs, max_norm)?;
            }
        }
        optimizer.step(vs)?;
        Ok(true)
    }

    /// Adjusts the scale for the next iteration.
    pub fn update(&mut self) {
        if !self.enabled {
            return;
        }

        if self.found_inf {
            self.scale *= self.backoff_factor;
            self.growth_tracker = 0;
        } else {
            self.growth_tracker += 1;
            if self.growth_tracker == self.growth_interval {
                self.scale *= self.growth_factor;
                self.growth_tracker = 0;
            }
        }
        self.found_inf = false;
    }

    pub fn state(&self) -> GradScalerState {
        GradScalerState {
            scale: self.scale,
            growth_tracker: self.growth_tracker,
        }
    }

    pub fn load_state(&mut self, state: &GradScalerState) {
        self.scale = state.scale;
        self.growth_tracker = state.growth_tracker;
    }

    /// Divides gradients by the scale. Returns true if any of them is non-finite.
    fn unscale(&self, vs: &nn::VarStore) -> Result<bool> {
        let inv_scale = 1.0 / self.scale;

        tch::no_grad(|| -> Result<bool> {
            let mut found_inf = false;
            for var in vs.trainable_variables() {
                let mut grad = var.grad();
                if !grad.defined() {
                    continue;
                }
                grad *= inv_scale;
                let all_finite = grad.f_isfinite()?.f_all()?.int64_value(&[]) != 0;
                found_inf |= !all_finite;
            }
            Ok(found_inf)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn setup() -> Result<(nn::VarStore, Tensor, Adam)> {
        let vs = nn::VarStore::new(Device::Cpu);
        let x = vs.root().var("x", &[3], nn::Init::Const(1.0));
        let adam = Adam::new(&vs, 0.1, 0.0)?;
        Ok((vs, x, adam))
    }

    #[test]
    fn overflow_skips_step_and_backs_off() -> Result<()> {
        let (vs, x, mut adam) = setup()?;
        let mut scaler = GradScaler::new(true);
        let before = x.detach().copy();

        adam.zero_grad(&vs);
        let loss = (&x * f64::INFINITY).sum(Kind::Float);
        scaler.scale(&loss).backward();
        let stepped = scaler.step(&vs, &mut adam, Some(1.0))?;
        scaler.update();

        assert!(!stepped);
        assert!(x.detach().equal(&before));
        assert_eq!(adam.num_steps(), 0);
        assert_abs_diff_eq!(scaler.scale_factor(), GradScaler::INIT_SCALE / 2.0);
        Ok(())
    }

    #[test]
    fn clean_steps_grow_scale() -> Result<()> {
        let (vs, x, mut adam) = setup()?;
        let mut scaler = GradScaler::new(true).with_growth_interval(3);

        for _ in 0..3 {
            adam.zero_grad(&vs);
            let loss = x.square().sum(Kind::Float);
            scaler.scale(&loss).backward();
            assert!(scaler.step(&vs, &mut adam, None)?);
            scaler.update();
        }

        assert_eq!(adam.num_steps(), 3);
        assert_abs_diff_eq!(scaler.scale_factor(), GradScaler::INIT_SCALE * 2.0);
        assert_eq!(scaler.state().growth_tracker, 0);
        Ok(())
    }

    #[test]
    fn unscaled_gradients_match_loss() -> Result<()> {
        let (vs, x, mut adam) = setup()?;
        let mut scaler = GradScaler::new(true);

        adam.zero_grad(&vs);
        let loss = x.square().sum(Kind::Float);
        scaler.scale(&loss).backward();
        // an unreachable norm keeps the gradients intact
        assert!(scaler.step(&vs, &mut adam, Some(1e9))?);

        let grad = Vec::<f64>::from(&x.grad().to_kind(Kind::Double));
        grad.iter()
            .for_each(|grad| assert_abs_diff_eq!(*grad, 2.0, epsilon = 1e-4));
        Ok(())
    }

    #[test]
    fn disabled_scaler_passes_through() -> Result<()> {
        let (vs, x, mut adam) = setup()?;
        let mut scaler = GradScaler::new(false);
        let loss = x.square().sum(Kind::Float);
        assert!(scaler.scale(&loss).equal(&loss));

        adam.zero_grad(&vs);
        scaler.scale(&loss).backward();
        assert!(scaler.step(&vs, &mut adam, None)?);
        scaler.update();
        assert_abs_diff_eq!(scaler.scale_factor(), 1.0);
        Ok(())
    }
}
