use candle_core::{Module, Tensor, D};
use candle_nn::{Init, VarBuilder};

/// Affine layer norm over the last dimension, built from plain tensor ops so the
/// backward pass reaches its input and its own parameters.
///
/// Parameter names (`weight`, `bias`) match `candle_nn::LayerNorm`.
#[derive(Clone, Debug)]
pub struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNorm {
    pub fn new(weight: Tensor, bias: Tensor, eps: f64) -> Self {
        Self { weight, bias, eps }
    }
}

impl Module for LayerNorm {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let dim = xs.dim(D::Minus1)? as f64;
        let mean = (xs.sum_keepdim(D::Minus1)? / dim)?;
        let centered = xs.broadcast_sub(&mean)?;
        let var = (centered.sqr()?.sum_keepdim(D::Minus1)? / dim)?;
        let normed = centered.broadcast_div(&(var + self.eps)?.sqrt()?)?;
        normed.broadcast_mul(&self.weight)?.broadcast_add(&self.bias)
    }
}

pub fn layer_norm(dim: usize, eps: f64, vb: VarBuilder<'_>) -> candle_core::Result<LayerNorm> {
    let weight = vb.get_with_hints(dim, "weight", Init::Const(1.0))?;
    let bias = vb.get_with_hints(dim, "bias", Init::Const(0.0))?;
    Ok(LayerNorm::new(weight, bias, eps))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Var};
    use candle_nn::VarMap;

    #[test]
    fn matches_candle_layer_norm() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let ours = layer_norm(6, 1e-5, vb.pp("ours")).unwrap();
        let reference = candle_nn::layer_norm(6, 1e-5, vb.pp("reference")).unwrap();
        let x = Tensor::randn(0f32, 2.0, (3, 4, 6), &device).unwrap();
        let diff = (ours.forward(&x).unwrap() - reference.forward(&x).unwrap())
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-4, "max diff {diff}");
    }

    #[test]
    fn gradients_reach_input_and_parameters() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let norm = layer_norm(4, 1e-5, vb.pp("ln")).unwrap();
        let x = Var::from_tensor(&Tensor::randn(0f32, 1.0, (2, 4), &device).unwrap()).unwrap();
        let weights = Tensor::new(&[1f32, -2.0, 3.0, 0.5], &device).unwrap();
        let loss = norm
            .forward(x.as_tensor())
            .unwrap()
            .broadcast_mul(&weights)
            .unwrap()
            .sum_all()
            .unwrap();
        let grads = loss.backward().unwrap();
        assert!(grads.get(x.as_tensor()).is_some());
        let data = varmap.data().lock().unwrap();
        for name in ["ln.weight", "ln.bias"] {
            assert!(grads.get(data[name].as_tensor()).is_some(), "{name}");
        }
    }
}
