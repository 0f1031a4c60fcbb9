//! Codebook index <-> latent vector mapping.

use candle_core::{DType, Device, Tensor};

use crate::error::{DynamicsError, Result};

/// Maps codebook indices to latent vectors: `[...]` u32 -> `[..., L]` f32.
///
/// The decoding engine calls this once per distinct timestep it writes in a step.
pub trait IndexToLatents {
    fn indices_to_latents(&self, indices: &Tensor) -> Result<Tensor>;
}

impl<F> IndexToLatents for F
where
    F: Fn(&Tensor) -> Result<Tensor>,
{
    fn indices_to_latents(&self, indices: &Tensor) -> Result<Tensor> {
        self(indices)
    }
}

/// Finite scalar quantizer: every latent coordinate takes one of `num_bins` evenly
/// spaced levels in `[-1, 1]`; a joint index is the mixed-radix number of the
/// per-coordinate levels, coordinate 0 most significant.
#[derive(Debug, Clone)]
pub struct FiniteScalarQuantizer {
    num_bins: usize,
    latent_dim: usize,
    codebook_size: usize,
}

impl FiniteScalarQuantizer {
    pub fn new(num_bins: usize, latent_dim: usize) -> Result<Self> {
        if num_bins == 0 || latent_dim == 0 {
            return Err(DynamicsError::InvalidConfig(
                "num_bins and latent_dim must be positive".into(),
            ));
        }
        let codebook_size = u32::try_from(latent_dim)
            .ok()
            .and_then(|d| num_bins.checked_pow(d))
            .filter(|&s| s <= u32::MAX as usize)
            .ok_or_else(|| {
                DynamicsError::InvalidConfig(format!(
                    "codebook {num_bins}^{latent_dim} does not fit in u32 indices"
                ))
            })?;
        Ok(Self {
            num_bins,
            latent_dim,
            codebook_size,
        })
    }

    pub fn codebook_size(&self) -> usize {
        self.codebook_size
    }

    fn level_value(&self, level: usize) -> f32 {
        if self.num_bins == 1 {
            0.0
        } else {
            -1.0 + 2.0 * level as f32 / (self.num_bins - 1) as f32
        }
    }

    fn nearest_level(&self, value: f32) -> usize {
        if self.num_bins == 1 {
            return 0;
        }
        let scaled = (value.clamp(-1.0, 1.0) + 1.0) * 0.5 * (self.num_bins - 1) as f32;
        (scaled.round() as usize).min(self.num_bins - 1)
    }

    /// Latent vector of one codebook entry.
    pub fn decode_index(&self, index: u32) -> Result<Vec<f32>> {
        let mut rest = index as usize;
        if rest >= self.codebook_size {
            return Err(DynamicsError::InvalidArgument(format!(
                "index {index} outside codebook of size {}",
                self.codebook_size
            )));
        }
        let mut out = vec![0f32; self.latent_dim];
        for slot in out.iter_mut().rev() {
            *slot = self.level_value(rest % self.num_bins);
            rest /= self.num_bins;
        }
        Ok(out)
    }

    /// Codebook index of the entry nearest to `latent`.
    pub fn encode_latent(&self, latent: &[f32]) -> u32 {
        latent
            .iter()
            .fold(0usize, |acc, &v| acc * self.num_bins + self.nearest_level(v)) as u32
    }

    /// `[...]` -> `[..., L]` f32 on the same device.
    pub fn latents_from_indices(&self, indices: &Tensor) -> Result<Tensor> {
        let dims = indices.dims().to_vec();
        let flat: Vec<u32> = indices.flatten_all()?.to_dtype(DType::U32)?.to_vec1()?;
        let mut data = Vec::with_capacity(flat.len() * self.latent_dim);
        for &index in &flat {
            data.extend(self.decode_index(index)?);
        }
        let mut shape = dims;
        shape.push(self.latent_dim);
        Ok(Tensor::from_vec(data, shape, indices.device())?)
    }

    /// `[..., L]` -> `[...]` u32, snapping each coordinate to its nearest level.
    pub fn indices_from_latents(&self, latents: &Tensor) -> Result<Tensor> {
        let dims = latents.dims().to_vec();
        match dims.last() {
            Some(&l) if l == self.latent_dim => {}
            _ => {
                return Err(DynamicsError::shape(
                    "latent vectors",
                    &[self.latent_dim],
                    &dims,
                ))
            }
        }
        let flat: Vec<f32> = latents.flatten_all()?.to_dtype(DType::F32)?.to_vec1()?;
        let data: Vec<u32> = flat
            .chunks(self.latent_dim)
            .map(|v| self.encode_latent(v))
            .collect();
        Ok(Tensor::from_vec(data, &dims[..dims.len() - 1], latents.device())?)
    }

    /// Every codebook entry as a `[K, L]` tensor.
    pub fn codebook(&self, device: &Device) -> Result<Tensor> {
        let all = Tensor::arange(0u32, self.codebook_size as u32, device)?;
        self.latents_from_indices(&all)
    }
}

impl IndexToLatents for FiniteScalarQuantizer {
    fn indices_to_latents(&self, indices: &Tensor) -> Result<Tensor> {
        self.latents_from_indices(indices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_span_unit_interval() {
        let q = FiniteScalarQuantizer::new(4, 2).unwrap();
        assert_eq!(q.codebook_size(), 16);
        assert_eq!(q.decode_index(0).unwrap(), vec![-1.0, -1.0]);
        assert_eq!(q.decode_index(15).unwrap(), vec![1.0, 1.0]);
        // coordinate 0 is the most significant digit
        let v = q.decode_index(4).unwrap();
        assert!((v[0] - (-1.0 + 2.0 / 3.0)).abs() < 1e-6);
        assert_eq!(v[1], -1.0);
    }

    #[test]
    fn every_index_survives_decode_encode() {
        let q = FiniteScalarQuantizer::new(4, 5).unwrap();
        let codebook = q.codebook(&Device::Cpu).unwrap();
        assert_eq!(codebook.dims(), &[1024, 5]);
        let back: Vec<u32> = q.indices_from_latents(&codebook).unwrap().to_vec1().unwrap();
        assert_eq!(back, (0..1024u32).collect::<Vec<_>>());
    }

    #[test]
    fn snaps_off_grid_values() {
        let q = FiniteScalarQuantizer::new(3, 2).unwrap();
        // levels are -1, 0, 1
        assert_eq!(q.encode_latent(&[0.1, 0.9]), 3 + 2);
        assert_eq!(q.encode_latent(&[-5.0, 5.0]), 2);
        assert_eq!(q.encode_latent(&[0.6, -0.4]), 2 * 3 + 1);
    }

    #[test]
    fn batched_shapes() {
        let device = Device::Cpu;
        let q = FiniteScalarQuantizer::new(2, 3).unwrap();
        let idx = Tensor::from_vec(vec![0u32, 1, 2, 3, 4, 5], (1, 2, 3), &device).unwrap();
        let latents = q.latents_from_indices(&idx).unwrap();
        assert_eq!(latents.dims(), &[1, 2, 3, 3]);
        let back = q.indices_from_latents(&latents).unwrap();
        assert_eq!(back.dims(), &[1, 2, 3]);
        assert_eq!(
            back.flatten_all().unwrap().to_vec1::<u32>().unwrap(),
            vec![0, 1, 2, 3, 4, 5]
        );
    }

    #[test]
    fn out_of_range_index_is_an_error() {
        let q = FiniteScalarQuantizer::new(2, 2).unwrap();
        let idx = Tensor::from_vec(vec![4u32], (1,), &Device::Cpu).unwrap();
        assert!(q.latents_from_indices(&idx).is_err());
    }

    #[test]
    fn single_bin_collapses_to_zero() {
        let q = FiniteScalarQuantizer::new(1, 3).unwrap();
        assert_eq!(q.codebook_size(), 1);
        assert_eq!(q.decode_index(0).unwrap(), vec![0.0; 3]);
        assert_eq!(q.encode_latent(&[0.7, -0.2, 0.0]), 0);
    }

    #[test]
    fn closures_satisfy_the_seam() {
        let q = FiniteScalarQuantizer::new(2, 2).unwrap();
        let f = |idx: &Tensor| q.latents_from_indices(idx);
        let idx = Tensor::from_vec(vec![3u32], (1,), &Device::Cpu).unwrap();
        let out = f.indices_to_latents(&idx).unwrap();
        assert_eq!(out.to_vec2::<f32>().unwrap(), vec![vec![1.0, 1.0]]);
    }
}
