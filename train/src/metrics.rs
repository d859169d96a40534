//! Segmentation metrics.

use crate::common::*;

/// IoU thresholds of the precision table.
pub const PRECISION_THRESHOLDS: [f64; 5] = [0.5, 0.6, 0.7, 0.8, 0.9];

/// Keys of the precision table, in threshold order.
pub const PRECISION_KEYS: [&str; 5] = ["Pr@50", "Pr@60", "Pr@70", "Pr@80", "Pr@90"];

/// Fractions of samples whose IoU exceeds each threshold.
pub type PrecisionTable = IndexMap<String, f64>;

/// Tracks the latest value and the count-weighted mean of a scalar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AverageMeter {
    name: String,
    val: f64,
    sum: f64,
    count: usize,
    avg: f64,
}

impl AverageMeter {
    pub fn new<S>(name: S) -> Self
    where
        S: Into<String>,
    {
        Self {
            name: name.into(),
            val: 0.0,
            sum: 0.0,
            count: 0,
            avg: 0.0,
        }
    }

    pub fn reset(&mut self) {
        self.val = 0.0;
        self.sum = 0.0;
        self.count = 0;
        self.avg = 0.0;
    }

    pub fn update(&mut self, val: f64, n: usize) {
        self.val = val;
        self.sum += val * n as f64;
        self.count += n;
        self.avg = if self.count > 0 {
            self.sum / self.count as f64
        } else {
            0.0
        };
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn val(&self) -> f64 {
        self.val
    }

    pub fn avg(&self) -> f64 {
        self.avg
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

impl std::fmt::Display for AverageMeter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {:.2} ({:.2})", self.name, self.val, self.avg)
    }
}

/// Training-time IoU and precision at `iou_threshold`, both in percent.
///
/// A pixel is foreground when its probability reaches `pred_threshold`.
///
/// `pred` holds logits and `target` binary masks, both `[N, 1, H, W]` at
/// the same resolution. Returns scalar double tensors `(iou, precision)`.
pub fn train_metrics(
    pred: &Tensor,
    target: &Tensor,
    pred_threshold: f64,
    iou_threshold: f64,
) -> Result<(Tensor, Tensor)> {
    tch::no_grad(|| {
        let pred = pred.f_sigmoid()?.f_ge(pred_threshold)?;
        let ious = batch_mask_iou(&pred, target)?;
        let iou = ious.f_mean(Kind::Double)?;
        let precision = ious.f_gt(iou_threshold)?.f_mean(Kind::Double)?;
        Ok((iou * 100.0, precision * 100.0))
    })
}

/// Computes the mean and the precision table of a score vector.
pub fn score_stats(scores: &[f64]) -> Result<(f64, PrecisionTable)> {
    ensure!(!scores.is_empty(), "cannot summarize an empty score vector");
    let num_scores = scores.len() as f64;
    let mean = scores.iter().sum::<f64>() / num_scores;

    let table = PRECISION_KEYS
        .iter()
        .zip(PRECISION_THRESHOLDS)
        .map(|(key, threshold)| {
            let count = scores.iter().filter(|&&score| score > threshold).count();
            (key.to_string(), count as f64 / num_scores)
        })
        .collect();

    Ok((mean, table))
}

/// Formats the table as `Pr@50: xx.xx  Pr@60: xx.xx ...` in percent.
pub fn format_precision(table: &PrecisionTable) -> String {
    table
        .iter()
        .map(|(key, value)| format!("{}: {:.2}", key, value * 100.0))
        .join("  ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn meter_weighted_average() {
        let mut meter = AverageMeter::new("Loss");
        meter.update(1.0, 2);
        meter.update(4.0, 1);
        assert_abs_diff_eq!(meter.val(), 4.0);
        assert_abs_diff_eq!(meter.avg(), 2.0);
        assert_eq!(meter.count(), 3);
        assert_eq!(meter.to_string(), "Loss 4.00 (2.00)");

        meter.reset();
        assert_eq!(meter.count(), 0);
        assert_abs_diff_eq!(meter.avg(), 0.0);
    }

    #[test]
    fn precision_of_five_samples() -> Result<()> {
        let (mean, table) = score_stats(&[0.9, 0.6, 0.4, 0.55, 0.2])?;
        assert_abs_diff_eq!(mean, 0.53, epsilon = 1e-9);
        assert_abs_diff_eq!(table["Pr@50"], 0.6, epsilon = 1e-12);
        assert_abs_diff_eq!(table["Pr@80"], 0.2, epsilon = 1e-12);
        assert_eq!(table.keys().collect::<Vec<_>>(), PRECISION_KEYS.to_vec());
        Ok(())
    }

    #[test]
    fn precision_is_monotonic() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(11);

        for _ in 0..100 {
            let len = rng.gen_range(1..50);
            let scores: Vec<f64> = (0..len).map(|_| rng.gen_range(0.0..=1.0)).collect();
            let (_, table) = score_stats(&scores)?;
            table
                .values()
                .tuple_windows()
                .for_each(|(lhs, rhs)| assert!(lhs >= rhs));
        }
        Ok(())
    }

    #[test]
    fn strict_threshold() -> Result<()> {
        let (_, table) = score_stats(&[0.5, 0.5])?;
        assert_abs_diff_eq!(table["Pr@50"], 0.0);
        assert!(score_stats(&[]).is_err());
        Ok(())
    }

    #[test]
    fn training_metrics_in_percent() -> Result<()> {
        // logits far from the decision boundary
        let pred = Tensor::of_slice(&[10.0f32, 10.0, -10.0, -10.0, 10.0, -10.0, -10.0, -10.0])
            .view([2, 1, 2, 2]);
        let target = Tensor::of_slice(&[1.0f32, 1.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0])
            .view([2, 1, 2, 2]);
        let (iou, precision) = train_metrics(&pred, &target, 0.35, 0.5)?;
        assert_abs_diff_eq!(iou.double_value(&[]), 62.5, epsilon = 1e-3);
        assert_abs_diff_eq!(precision.double_value(&[]), 50.0, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn probability_at_threshold_is_foreground() -> Result<()> {
        // sigmoid(0) is exactly 0.5
        let pred = Tensor::zeros(&[1, 1, 2, 2], (Kind::Float, Device::Cpu));
        let target = Tensor::ones(&[1, 1, 2, 2], (Kind::Float, Device::Cpu));
        let (iou, precision) = train_metrics(&pred, &target, 0.5, 0.5)?;
        assert_abs_diff_eq!(iou.double_value(&[]), 100.0, epsilon = 1e-3);
        assert_abs_diff_eq!(precision.double_value(&[]), 100.0, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn format_table() -> Result<()> {
        let (_, table) = score_stats(&[0.95])?;
        assert_eq!(
            format_precision(&table),
            "Pr@50: 100.00  Pr@60: 100.00  Pr@70: 100.00  Pr@80: 100.00  Pr@90: 100.00"
        );
        Ok(())
    }
}
