//! Linear layer over group-quantized weights.
//!
//! This is the consumer of the codec at computation time: the packed weight is
//! dequantized for every matrix multiplication unless caching is enabled.
//!
//! # Dequantization Modes
//!
//! - **On-the-fly** (default): dequantizes during each forward pass, keeps only
//!   the packed form resident.
//! - **Cached** (opt-in via `cache_dequantized`): dequantizes once and keeps the
//!   result, trading memory for speed.

use candle_core::{Device, Module, Tensor};
use candle_nn::Linear;

use crate::checkpoint::PackedTensor;
use crate::config::PipelineConfig;
use crate::error::{GroupQuantError, Result};
use crate::quantization::{dequantize_tensor_with_dtype, quantize_tensor, ComputeDType, PackedMatrix};

/// Weight storage of a [`QuantizedLinear`].
#[derive(Debug, Clone)]
enum Weight {
    Packed(PackedMatrix),
    Dense(Tensor),
}

/// A linear layer `y = x @ Wᵀ + b` whose weight `W` is `[out_features, in_features]`.
#[derive(Debug, Clone)]
pub struct QuantizedLinear {
    weight: Weight,
    /// Dense layer over the dequantized weight (opt-in for inference speedup).
    cached: Option<Linear>,
    /// Optional bias (kept in full precision).
    bias: Option<Tensor>,
    device: Device,
    compute_dtype: ComputeDType,
}

impl QuantizedLinear {
    /// Build a layer from a full-precision weight, packing it unless the group
    /// size in `config` is `0`.
    ///
    /// # Errors
    /// Returns error if the weight is not 2-D or quantization fails.
    pub fn from_weight(
        weight: &Tensor,
        bias: Option<Tensor>,
        config: &PipelineConfig,
        device: &Device,
    ) -> Result<Self> {
        if weight.rank() != 2 {
            return Err(GroupQuantError::InvalidConfig("weight must be 2D".into()));
        }
        let weight = if config.quantization.is_disabled() {
            Weight::Dense(weight.to_device(device)?)
        } else {
            Weight::Packed(quantize_tensor(weight, &config.quantization)?.packed)
        };
        Self::build(weight, bias, config, device)
    }

    /// Build a layer from an already packed matrix.
    ///
    /// # Errors
    /// Returns error if caching is requested and dequantization fails.
    pub fn from_packed(
        packed: PackedMatrix,
        bias: Option<Tensor>,
        config: &PipelineConfig,
        device: &Device,
    ) -> Result<Self> {
        Self::build(Weight::Packed(packed), bias, config, device)
    }

    /// Build a layer from a packed-checkpoint entry.
    ///
    /// # Errors
    /// Returns error if a dense entry is not 2-D.
    pub fn from_entry(
        entry: &PackedTensor,
        bias: Option<Tensor>,
        config: &PipelineConfig,
        device: &Device,
    ) -> Result<Self> {
        match entry {
            PackedTensor::Packed(p) => Self::from_packed(p.clone(), bias, config, device),
            PackedTensor::Dense(t) => {
                if t.rank() != 2 {
                    return Err(GroupQuantError::InvalidConfig("weight must be 2D".into()));
                }
                Self::build(Weight::Dense(t.to_device(device)?), bias, config, device)
            }
        }
    }

    fn build(
        weight: Weight,
        bias: Option<Tensor>,
        config: &PipelineConfig,
        device: &Device,
    ) -> Result<Self> {
        let bias = bias
            .map(|b| b.to_device(device)?.to_dtype(config.compute_dtype.into()))
            .transpose()?;
        let mut layer = Self {
            weight,
            cached: None,
            bias,
            device: device.clone(),
            compute_dtype: config.compute_dtype,
        };
        if let Some(bias) = &layer.bias {
            let out = layer.out_features();
            if bias.dims() != [out].as_slice() {
                return Err(GroupQuantError::ShapeMismatch {
                    expected: vec![out],
                    actual: bias.dims().to_vec(),
                });
            }
        }
        if config.cache_dequantized {
            layer.enable_weight_caching()?;
        }
        Ok(layer)
    }

    /// Input width.
    #[must_use]
    pub fn in_features(&self) -> usize {
        match &self.weight {
            Weight::Packed(p) => p.columns(),
            Weight::Dense(t) => t.dims()[1],
        }
    }

    /// Output width.
    #[must_use]
    pub fn out_features(&self) -> usize {
        match &self.weight {
            Weight::Packed(p) => p.rows(),
            Weight::Dense(t) => t.dims()[0],
        }
    }

    /// `true` if the weight is stored packed.
    #[must_use]
    pub fn is_packed(&self) -> bool {
        matches!(self.weight, Weight::Packed(_))
    }

    /// The packed weight, if any.
    #[must_use]
    pub fn packed_weight(&self) -> Option<&PackedMatrix> {
        match &self.weight {
            Weight::Packed(p) => Some(p),
            Weight::Dense(_) => None,
        }
    }

    /// The weight in the compute dtype, dequantizing if needed.
    ///
    /// # Errors
    /// Returns error if dequantization or the dtype cast fails.
    pub fn weight(&self) -> Result<Tensor> {
        if let Some(cached) = &self.cached {
            return Ok(cached.weight().clone());
        }
        match &self.weight {
            Weight::Packed(p) => dequantize_tensor_with_dtype(p, &self.device, self.compute_dtype),
            Weight::Dense(t) => Ok(t.to_dtype(self.compute_dtype.into())?),
        }
    }

    /// Forward pass for `[batch, in]` or `[batch, seq, in]` inputs.
    ///
    /// The output has the compute dtype of the layer.
    ///
    /// # Errors
    /// Returns error if the input width does not match or a tensor op fails.
    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let in_features = self.in_features();
        let last = input.dims().last().copied().unwrap_or(0);
        if last != in_features {
            return Err(GroupQuantError::ShapeMismatch {
                expected: vec![in_features],
                actual: input.dims().to_vec(),
            });
        }

        let input = input.to_dtype(self.compute_dtype.into())?;
        Ok(self.dense()?.forward(&input)?)
    }

    fn dense(&self) -> Result<Linear> {
        match &self.cached {
            Some(linear) => Ok(linear.clone()),
            None => Ok(Linear::new(self.weight()?, self.bias.clone())),
        }
    }

    /// Dequantize once and keep the result for later forward passes.
    ///
    /// # Errors
    /// Returns error if dequantization fails.
    pub fn enable_weight_caching(&mut self) -> Result<()> {
        if self.cached.is_none() {
            self.cached = Some(Linear::new(self.weight()?, self.bias.clone()));
        }
        Ok(())
    }

    /// Drop the cached weight to save memory.
    pub fn disable_weight_caching(&mut self) {
        self.cached = None;
    }

    /// Check if weight caching is enabled.
    #[must_use]
    pub fn is_weight_cached(&self) -> bool {
        self.cached.is_some()
    }

    /// Resident memory in bytes: stored weight, cache and bias.
    #[must_use]
    pub fn memory_bytes(&self) -> usize {
        let size = |t: &Tensor| t.elem_count() * t.dtype().size_in_bytes();
        let weight = match &self.weight {
            Weight::Packed(p) => p.size_bytes(),
            Weight::Dense(t) => size(t),
        };
        let cached = self.cached.as_ref().map_or(0, |l| size(l.weight()));
        weight + cached + self.bias.as_ref().map_or(0, size)
    }
}

impl Module for QuantizedLinear {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        QuantizedLinear::forward(self, xs).map_err(candle_core::Error::wrap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quantization::{compress, QuantizationConfig};
    use candle_core::DType;

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    #[test]
    fn test_forward_shape_2d_and_3d() {
        let device = Device::Cpu;
        let config = PipelineConfig::preset_group(64);
        let weight = Tensor::randn(0.0f32, 0.02, (128, 256), &device).unwrap();
        let layer = QuantizedLinear::from_weight(&weight, None, &config, &device).unwrap();

        let x2 = Tensor::zeros((4, 256), DType::F32, &device).unwrap();
        assert_eq!(layer.forward(&x2).unwrap().dims(), &[4, 128]);

        let x3 = Tensor::zeros((2, 10, 256), DType::F32, &device).unwrap();
        assert_eq!(layer.forward(&x3).unwrap().dims(), &[2, 10, 128]);
    }

    #[test]
    fn test_forward_matches_dense_on_dequantized_weight() {
        let device = Device::Cpu;
        let config = PipelineConfig::preset_group(32);
        let weight = Tensor::randn(0.0f32, 1.0, (16, 64), &device).unwrap();
        let bias = Tensor::randn(0.0f32, 1.0, 16, &device).unwrap();
        let layer =
            QuantizedLinear::from_weight(&weight, Some(bias.clone()), &config, &device).unwrap();

        let x = Tensor::randn(0.0f32, 1.0, (3, 64), &device).unwrap();
        let expected = x
            .matmul(&layer.weight().unwrap().t().unwrap())
            .unwrap()
            .broadcast_add(&bias)
            .unwrap();
        let actual = layer.forward(&x).unwrap();
        assert!(max_abs_diff(&expected, &actual) < 1e-4);
    }

    #[test]
    fn test_disabled_group_size_keeps_dense_weight() {
        let device = Device::Cpu;
        let weight = Tensor::randn(0.0f32, 1.0, (8, 12), &device).unwrap();
        let layer =
            QuantizedLinear::from_weight(&weight, None, &PipelineConfig::preset_dense(), &device)
                .unwrap();
        assert!(!layer.is_packed());
        assert_eq!(max_abs_diff(&layer.weight().unwrap(), &weight), 0.0);
    }

    #[test]
    fn test_weight_caching_toggle() {
        let device = Device::Cpu;
        let packed = compress(&[0.25; 64], 4, 16, 16).unwrap();
        let mut layer =
            QuantizedLinear::from_packed(packed, None, &PipelineConfig::preset_group(16), &device)
                .unwrap();
        assert!(!layer.is_weight_cached());
        let before = layer.memory_bytes();

        layer.enable_weight_caching().unwrap();
        assert!(layer.is_weight_cached());
        assert!(layer.memory_bytes() > before);

        layer.disable_weight_caching();
        assert_eq!(layer.memory_bytes(), before);
    }

    #[test]
    fn test_inference_preset_caches_in_bf16() {
        let device = Device::Cpu;
        let weight = Tensor::randn(0.0f32, 1.0, (8, 32), &device).unwrap();
        let layer = QuantizedLinear::from_weight(
            &weight,
            None,
            &PipelineConfig::preset_inference(32),
            &device,
        )
        .unwrap();
        assert!(layer.is_weight_cached());
        let x = Tensor::ones((1, 32), DType::F32, &device).unwrap();
        assert_eq!(layer.forward(&x).unwrap().dtype(), DType::BF16);
    }

    #[test]
    fn test_rejects_wrong_input_width() {
        let device = Device::Cpu;
        let packed = compress(&[1.0; 64], 4, 16, 16).unwrap();
        let layer =
            QuantizedLinear::from_packed(packed, None, &PipelineConfig::default(), &device)
                .unwrap();
        let x = Tensor::zeros((2, 8), DType::F32, &device).unwrap();
        assert!(matches!(
            layer.forward(&x),
            Err(GroupQuantError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_rejects_bias_of_wrong_length() {
        let device = Device::Cpu;
        let packed = compress(&[1.0; 64], 4, 16, 16).unwrap();
        let bias = Tensor::zeros(5, DType::F32, &device).unwrap();
        let err = QuantizedLinear::from_packed(packed, Some(bias), &PipelineConfig::default(), &device)
            .unwrap_err();
        assert!(matches!(err, GroupQuantError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_module_trait() {
        let device = Device::Cpu;
        let weight = Tensor::randn(0.0f32, 1.0, (4, 16), &device).unwrap();
        let config = PipelineConfig {
            quantization: QuantizationConfig::with_group_size(16),
            ..Default::default()
        };
        let layer = QuantizedLinear::from_weight(&weight, None, &config, &device).unwrap();
        let x = Tensor::ones((2, 16), DType::F32, &device).unwrap();
        let y = Module::forward(&layer, &x).unwrap();
        assert_eq!(y.dims(), &[2, 4]);
    }

    #[test]
    fn test_memory_reduction() {
        let device = Device::Cpu;
        let weight = Tensor::zeros((1024, 1024), DType::F32, &device).unwrap();
        let layer =
            QuantizedLinear::from_weight(&weight, None, &PipelineConfig::default(), &device)
                .unwrap();

        let full_size = 1024 * 1024 * 4;
        #[allow(clippy::cast_precision_loss)]
        let ratio = f64::from(full_size) / layer.memory_bytes() as f64;
        assert!(ratio > 7.0, "Expected >7x reduction vs f32, got {ratio:.2}x");
    }
}
