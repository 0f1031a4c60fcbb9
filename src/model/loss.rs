use candle_core::{DType, Tensor, D};

use super::masking::MaskState;
use crate::error::{DynamicsError, Result};

/// Cross-entropy over masked cells only.
///
/// `logits` `[B, T, P, K]`, `targets` `[B, T, P]` class indices. Rows whose mask bit is
/// false contribute nothing; the sum is divided by the masked count floored at 1, so an
/// all-visible batch yields a finite zero loss.
pub fn masked_cross_entropy(logits: &Tensor, targets: &Tensor, mask: &MaskState) -> Result<Tensor> {
    let (b, t, p, k) = logits.dims4()?;
    if targets.dims() != [b, t, p] {
        return Err(DynamicsError::shape("targets", &[b, t, p], targets.dims()));
    }
    if mask.dims() != (b, t, p) {
        let (mb, mt, mp) = mask.dims();
        return Err(DynamicsError::shape("loss mask", &[b, t, p], &[mb, mt, mp]));
    }
    let rows = b * t * p;
    let logits_flat = logits.reshape((rows, k))?;
    let targets_flat = targets
        .to_dtype(DType::U32)?
        .reshape((rows, 1))?
        .contiguous()?;

    let log_probs = candle_nn::ops::log_softmax(&logits_flat, D::Minus1)?;
    let nll = log_probs.gather(&targets_flat, 1)?.squeeze(1)?.neg()?;

    let weights = mask.to_weights(logits.device())?.reshape(rows)?;
    let denom = mask.count().max(1) as f64;
    Ok(((nll * weights)?.sum_all()? / denom)?)
}

/// Fraction of masked cells whose argmax class equals the target; `None` if nothing is masked.
pub fn masked_accuracy(logits: &Tensor, targets: &Tensor, mask: &MaskState) -> Result<Option<f32>> {
    let predicted: Vec<u32> = logits.argmax(D::Minus1)?.flatten_all()?.to_vec1()?;
    let targets: Vec<u32> = targets.to_dtype(DType::U32)?.flatten_all()?.to_vec1()?;
    if predicted.len() != targets.len() || targets.len() != mask.bits().len() {
        return Err(DynamicsError::shape(
            "accuracy inputs",
            &[mask.bits().len()],
            &[predicted.len(), targets.len()],
        ));
    }
    let masked = mask.count();
    if masked == 0 {
        return Ok(None);
    }
    let hits = predicted
        .iter()
        .zip(&targets)
        .zip(mask.bits())
        .filter(|((p, t), &m)| m && p == t)
        .count();
    Ok(Some(hits as f32 / masked as f32))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn logits_and_targets() -> (Tensor, Tensor) {
        let device = Device::Cpu;
        // two cells, three classes
        let logits = Tensor::from_vec(
            vec![2.0f32, 0.0, 0.0, 0.0, 0.0, 5.0],
            (1, 1, 2, 3),
            &device,
        )
        .unwrap();
        let targets = Tensor::from_vec(vec![0u32, 1], (1, 1, 2), &device).unwrap();
        (logits, targets)
    }

    fn nll(row: &[f32], target: usize) -> f32 {
        let lse = row.iter().map(|v| v.exp()).sum::<f32>().ln();
        lse - row[target]
    }

    #[test]
    fn only_masked_rows_count() {
        let (logits, targets) = logits_and_targets();
        let mask = MaskState::from_bits(1, 1, 2, vec![false, true]).unwrap();
        let loss = masked_cross_entropy(&logits, &targets, &mask)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        let expected = nll(&[0.0, 0.0, 5.0], 1);
        assert!((loss - expected).abs() < 1e-4, "{loss} vs {expected}");
    }

    #[test]
    fn averages_over_masked_count() {
        let (logits, targets) = logits_and_targets();
        let mask = MaskState::from_bits(1, 1, 2, vec![true, true]).unwrap();
        let loss = masked_cross_entropy(&logits, &targets, &mask)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        let expected = (nll(&[2.0, 0.0, 0.0], 0) + nll(&[0.0, 0.0, 5.0], 1)) / 2.0;
        assert!((loss - expected).abs() < 1e-4);
    }

    #[test]
    fn empty_mask_gives_finite_zero() {
        let (logits, targets) = logits_and_targets();
        let mask = MaskState::visible(1, 1, 2);
        let loss = masked_cross_entropy(&logits, &targets, &mask)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(loss.is_finite());
        assert_eq!(loss, 0.0);
    }

    #[test]
    fn target_shape_is_checked() {
        let (logits, _) = logits_and_targets();
        let bad = Tensor::from_vec(vec![0u32, 1, 2], (1, 1, 3), &Device::Cpu).unwrap();
        let mask = MaskState::visible(1, 1, 2);
        assert!(matches!(
            masked_cross_entropy(&logits, &bad, &mask),
            Err(DynamicsError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn accuracy_over_masked_cells() {
        let (logits, targets) = logits_and_targets();
        // cell 0 predicts class 0 (hit), cell 1 predicts class 2 (miss)
        let both = MaskState::from_bits(1, 1, 2, vec![true, true]).unwrap();
        assert_eq!(masked_accuracy(&logits, &targets, &both).unwrap(), Some(0.5));
        let first = MaskState::from_bits(1, 1, 2, vec![true, false]).unwrap();
        assert_eq!(masked_accuracy(&logits, &targets, &first).unwrap(), Some(1.0));
        let none = MaskState::visible(1, 1, 2);
        assert_eq!(masked_accuracy(&logits, &targets, &none).unwrap(), None);
    }
}
