use candle_core::{Device, Tensor};

use crate::error::{DynamicsError, Result};

/// Channels reserved for the temporal encoding at the tail of the embedding.
pub fn temporal_channels(embed_dim: usize) -> usize {
    embed_dim / 3
}

/// Write a sinusoid for `pos` into `out` (sin at even, cos at odd offsets).
fn write_sinusoid(out: &mut [f32], pos: usize) {
    let dim = out.len();
    for i in 0..dim / 2 {
        let angle = (pos as f64) / (10000f64).powf((2 * i) as f64 / dim as f64);
        out[2 * i] = angle.sin() as f32;
        out[2 * i + 1] = angle.cos() as f32;
    }
}

/// Fixed spatial encoding `[1, 1, P, E]`, P = (frame_size / patch_size)^2.
///
/// Row and column sinusoids fill the first `E - E/3` channels; the temporal tail is
/// zero so the backbone can encode time there without interference.
pub fn spatial_positional_encoding(
    frame_size: usize,
    patch_size: usize,
    embed_dim: usize,
    device: &Device,
) -> Result<Tensor> {
    if patch_size == 0 || frame_size % patch_size != 0 {
        return Err(DynamicsError::InvalidConfig(format!(
            "frame_size {frame_size} must be a positive multiple of patch_size {patch_size}"
        )));
    }
    let side = frame_size / patch_size;
    let positions = side * side;
    let spatial = embed_dim - temporal_channels(embed_dim);
    let row_dim = spatial / 2;

    let mut pe = vec![0f32; positions * embed_dim];
    for p in 0..positions {
        let (row, col) = (p / side, p % side);
        let base = p * embed_dim;
        write_sinusoid(&mut pe[base..base + row_dim], row);
        write_sinusoid(&mut pe[base + row_dim..base + spatial], col);
    }
    Ok(Tensor::from_vec(pe, (1, 1, positions, embed_dim), device)?)
}

/// Temporal encoding `[1, T, 1, E]`, nonzero only in the last `E/3` channels.
pub fn temporal_positional_encoding(
    time: usize,
    embed_dim: usize,
    device: &Device,
) -> Result<Tensor> {
    let tail = temporal_channels(embed_dim);
    let head = embed_dim - tail;
    let mut pe = vec![0f32; time * embed_dim];
    for t in 0..time {
        let base = t * embed_dim;
        write_sinusoid(&mut pe[base + head..base + embed_dim], t);
    }
    Ok(Tensor::from_vec(pe, (1, time, 1, embed_dim), device)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spatial_pe_shape_and_tail() {
        let pe = spatial_positional_encoding(16, 4, 12, &Device::Cpu).unwrap();
        assert_eq!(pe.dims(), &[1, 1, 16, 12]);
        let rows: Vec<Vec<f32>> = pe.reshape((16, 12)).unwrap().to_vec2().unwrap();
        for row in &rows {
            assert!(row[8..].iter().all(|&v| v == 0.0));
        }
        // distinct positions get distinct codes
        for a in 0..16 {
            for b in a + 1..16 {
                assert_ne!(rows[a], rows[b], "positions {a} and {b} collide");
            }
        }
    }

    #[test]
    fn temporal_pe_only_in_tail() {
        let pe = temporal_positional_encoding(5, 12, &Device::Cpu).unwrap();
        assert_eq!(pe.dims(), &[1, 5, 1, 12]);
        let rows: Vec<Vec<f32>> = pe.reshape((5, 12)).unwrap().to_vec2().unwrap();
        for row in &rows {
            assert!(row[..8].iter().all(|&v| v == 0.0));
        }
        assert_ne!(rows[1], rows[2]);
    }

    #[test]
    fn rejects_partial_patches() {
        assert!(spatial_positional_encoding(10, 4, 12, &Device::Cpu).is_err());
    }
}
