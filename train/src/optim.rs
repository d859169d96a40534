//! Adam optimizer over the trainable variables of a [VarStore](nn::VarStore).

use crate::common::*;

const BETA1: f64 = 0.9;
const BETA2: f64 = 0.999;
const EPS: f64 = 1e-8;

/// Adam with L2 weight decay.
///
/// The moment buffers follow the order of `VarStore::trainable_variables()`,
/// which is stable for a store whose variables are no longer added.
#[derive(Debug)]
pub struct Adam {
    lr: f64,
    weight_decay: f64,
    step: i64,
    exp_avg: Vec<Tensor>,
    exp_avg_sq: Vec<Tensor>,
}

impl Adam {
    pub fn new(vs: &nn::VarStore, lr: f64, weight_decay: f64) -> Result<Self> {
        ensure!(lr >= 0.0, "lr must be non-negative");
        ensure!(weight_decay >= 0.0, "weight_decay must be non-negative");

        let variables = vs.trainable_variables();
        let exp_avg = variables.iter().map(|var| var.zeros_like()).collect();
        let exp_avg_sq = variables.iter().map(|var| var.zeros_like()).collect();

        Ok(Self {
            lr,
            weight_decay,
            step: 0,
            exp_avg,
            exp_avg_sq,
        })
    }

    pub fn lr(&self) -> f64 {
        self.lr
    }

    pub fn set_lr(&mut self, lr: f64) {
        self.lr = lr;
    }

    /// The number of applied updates.
    pub fn num_steps(&self) -> i64 {
        self.step
    }

    pub fn zero_grad(&self, vs: &nn::VarStore) {
        for var in vs.trainable_variables() {
            let mut grad = var.grad();
            if grad.defined() {
                let _ = grad.detach_().zero_();
            }
        }
    }

    pub fn step(&mut self, vs: &nn::VarStore) -> Result<()> {
        let variables = vs.trainable_variables();
        ensure!(
            variables.len() == self.exp_avg.len(),
            "the variable store changed after the optimizer was created"
        );

        self.step += 1;
        let bias_correction1 = 1.0 - BETA1.powi(self.step as i32);
        let bias_correction2 = 1.0 - BETA2.powi(self.step as i32);
        let step_size = self.lr / bias_correction1;

        tch::no_grad(|| -> Result<()> {
            for (var, exp_avg, exp_avg_sq) in
                izip!(&variables, &mut self.exp_avg, &mut self.exp_avg_sq)
            {
                let grad = var.grad();
                if !grad.defined() {
                    continue;
                }
                let grad = if self.weight_decay != 0.0 {
                    grad.f_add(&(var * self.weight_decay))?
                } else {
                    grad
                };

                *exp_avg = &*exp_avg * BETA1 + &grad * (1.0 - BETA1);
                *exp_avg_sq = &*exp_avg_sq * BETA2 + grad.square() * (1.0 - BETA2);

                let denom = (exp_avg_sq.sqrt() / bias_correction2.sqrt()) + EPS;
                let update = &*exp_avg / denom * step_size;
                let mut var = var.shallow_clone();
                let _ = var.f_sub_(&update)?;
            }
            Ok(())
        })
    }

    /// Saves the moment buffers and the step count.
    pub fn save<P>(&self, path: P) -> Result<()>
    where
        P: AsRef<Path>,
    {
        let step = Tensor::from(self.step);
        let named: Vec<(String, &Tensor)> = self
            .exp_avg
            .iter()
            .enumerate()
            .map(|(index, tensor)| (format!("exp_avg.{}", index), tensor))
            .chain(
                self.exp_avg_sq
                    .iter()
                    .enumerate()
                    .map(|(index, tensor)| (format!("exp_avg_sq.{}", index), tensor)),
            )
            .chain(std::iter::once(("step".to_string(), &step)))
            .collect();
        Tensor::save_multi(&named, path)?;
        Ok(())
    }

    /// Restores the state written by [save](Adam::save).
    pub fn load<P>(&mut self, path: P) -> Result<()>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let named: IndexMap<String, Tensor> = Tensor::load_multi(path)?.into_iter().collect();
        let take = |name: String, like: &Tensor| -> Result<Tensor> {
            let tensor = named
                .get(&name)
                .ok_or_else(|| format_err!("'{}' is missing in '{}'", name, path.display()))?;
            ensure!(
                tensor.size() == like.size(),
                "shape mismatch of '{}': expect {:?}, but get {:?}",
                name,
                like.size(),
                tensor.size()
            );
            Ok(tensor.to_device(like.device()).to_kind(like.kind()))
        };

        let exp_avg: Vec<_> = self
            .exp_avg
            .iter()
            .enumerate()
            .map(|(index, like)| take(format!("exp_avg.{}", index), like))
            .try_collect()?;
        let exp_avg_sq: Vec<_> = self
            .exp_avg_sq
            .iter()
            .enumerate()
            .map(|(index, like)| take(format!("exp_avg_sq.{}", index), like))
            .try_collect()?;
        let step = named
            .get("step")
            .ok_or_else(|| format_err!("'step' is missing in '{}'", path.display()))?
            .int64_value(&[]);

        self.exp_avg = exp_avg;
        self.exp_avg_sq = exp_avg_sq;
        self.step = step;
        Ok(())
    }
}

/// Scales gradients so that their global L2 norm is at most `max_norm`.
///
/// Returns the norm before clipping.
pub fn clip_grad_norm(vs: &nn::VarStore, max_norm: f64) -> Result<f64> {
    let grads: Vec<_> = vs
        .trainable_variables()
        .iter()
        .map(|var| var.grad())
        .filter(|grad| grad.defined())
        .collect();
    if grads.is_empty() {
        return Ok(0.0);
    }

    let total_norm = tch::no_grad(|| -> Result<f64> {
        let sq_norms: Vec<_> = grads
            .iter()
            .map(|grad| grad.f_square()?.f_sum(Kind::Double))
            .try_collect()?;
        let total = Tensor::f_sum_tensors(&sq_norms)?;
        Ok(total.double_value(&[]).sqrt())
    })?;

    let clip_coef = max_norm / (total_norm + 1e-6);
    if clip_coef < 1.0 {
        tch::no_grad(|| {
            for mut grad in grads {
                grad *= clip_coef;
            }
        });
    }

    Ok(total_norm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn quadratic_store() -> (nn::VarStore, Tensor) {
        let vs = nn::VarStore::new(Device::Cpu);
        let x = vs.root().var("x", &[2], nn::Init::Const(1.0));
        (vs, x)
    }

    #[test]
    fn first_step_moves_by_lr() -> Result<()> {
        let (vs, x) = quadratic_store();
        let mut adam = Adam::new(&vs, 0.1, 0.0)?;

        adam.zero_grad(&vs);
        x.square().sum(Kind::Float).backward();
        adam.step(&vs)?;

        // the first Adam update is lr * sign(grad)
        let values = Vec::<f64>::from(&x.detach().to_kind(Kind::Double));
        values
            .iter()
            .for_each(|value| assert_abs_diff_eq!(*value, 0.9, epsilon = 1e-5));
        assert_eq!(adam.num_steps(), 1);
        Ok(())
    }

    #[test]
    fn minimize_quadratic() -> Result<()> {
        let (vs, x) = quadratic_store();
        let mut adam = Adam::new(&vs, 0.05, 0.0)?;

        for _ in 0..500 {
            adam.zero_grad(&vs);
            x.square().sum(Kind::Float).backward();
            adam.step(&vs)?;
        }

        let norm = x.norm().double_value(&[]);
        assert!(norm < 0.1, "norm {} is too large", norm);
        Ok(())
    }

    #[test]
    fn save_and_restore_state() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("optimizer.ot");
        let (vs, x) = quadratic_store();
        let mut adam = Adam::new(&vs, 0.1, 0.0)?;
        adam.zero_grad(&vs);
        x.square().sum(Kind::Float).backward();
        adam.step(&vs)?;
        adam.save(&path)?;

        let mut restored = Adam::new(&vs, 0.1, 0.0)?;
        restored.load(&path)?;
        assert_eq!(restored.num_steps(), 1);
        assert!(restored.exp_avg[0].allclose(&adam.exp_avg[0], 1e-6, 1e-6, false));
        Ok(())
    }

    #[test]
    fn clip_to_max_norm() -> Result<()> {
        let (vs, x) = quadratic_store();
        // gradient is 2x = [6, 8], with norm 10
        let _ = x.detach().copy_(&Tensor::of_slice(&[3.0f32, 4.0]));
        x.square().sum(Kind::Float).backward();

        let norm = clip_grad_norm(&vs, 5.0)?;
        assert_abs_diff_eq!(norm, 10.0, epsilon = 1e-4);
        let clipped = x.grad().norm().double_value(&[]);
        assert_abs_diff_eq!(clipped, 5.0, epsilon = 1e-3);

        // below the threshold, gradients are untouched
        let norm = clip_grad_norm(&vs, 100.0)?;
        assert_abs_diff_eq!(norm, 5.0, epsilon = 1e-3);
        Ok(())
    }
}
