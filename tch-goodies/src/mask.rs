use crate::common::*;

/// Added to the union so that two empty masks score zero.
pub const IOU_EPSILON: f64 = 1e-6;

fn foreground(mask: &Tensor) -> Result<Tensor> {
    let fg = match mask.kind() {
        Kind::Bool => mask.shallow_clone(),
        _ => mask.f_ne(0.0)?,
    };
    Ok(fg)
}

/// Computes `|pred ∧ target| / (|pred ∨ target| + ε)` over two binary masks.
///
/// Any nonzero element counts as foreground.
pub fn mask_iou(pred: &Tensor, target: &Tensor) -> Result<f64> {
    ensure!(
        pred.size() == target.size(),
        "mask shape mismatch: {:?} vs {:?}",
        pred.size(),
        target.size()
    );

    let pred = foreground(pred)?;
    let target = foreground(target)?;
    let inter = pred
        .f_logical_and(&target)?
        .f_sum(Kind::Double)?
        .double_value(&[]);
    let union = pred
        .f_logical_or(&target)?
        .f_sum(Kind::Double)?
        .double_value(&[]);

    Ok(inter / (union + IOU_EPSILON))
}

/// Per-sample IoU of two `[N, ...]` mask batches, returned as a `[N]` double tensor.
pub fn batch_mask_iou(pred: &Tensor, target: &Tensor) -> Result<Tensor> {
    ensure!(
        pred.size() == target.size(),
        "mask shape mismatch: {:?} vs {:?}",
        pred.size(),
        target.size()
    );
    let batch_size = match pred.size().first() {
        Some(&n) => n,
        None => bail!("expect a batched mask with at least one dimension"),
    };

    let pred = foreground(pred)?.f_reshape(&[batch_size, -1])?;
    let target = foreground(target)?.f_reshape(&[batch_size, -1])?;

    let inter = pred
        .f_logical_and(&target)?
        .f_sum_dim_intlist(&[1], false, Kind::Double)?;
    let union = pred
        .f_logical_or(&target)?
        .f_sum_dim_intlist(&[1], false, Kind::Double)?;

    Ok(inter / (union + IOU_EPSILON))
}
