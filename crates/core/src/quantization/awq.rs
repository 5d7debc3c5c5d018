//! AWQ (Activation-aware Weight Quantization) configuration and linear layer.
//!
//! Weights are 4-bit, packed eight per `u32` along the output dimension in
//! AWQ's interleaved order, with group-wise scales and packed zero points.

use candle_core::{DType, Device, Tensor};
use serde_json::Value;
use tracing::debug;

use crate::error::{ensure, MoeError, Result};

/// Nibble slot holding output column `j % 8` inside a packed `u32`.
const AWQ_REVERSE_ORDER: [usize; 8] = [0, 4, 1, 5, 2, 6, 3, 7];
/// Token count at which dequantize-then-matmul beats the streamed GEMM.
const DEQUANT_MATMUL_THRESHOLD: usize = 256;

/// AWQ quantization configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwqConfig {
    pub weight_bits: u32,
    pub group_size: usize,
    pub zero_point: bool,
    /// Layer name fragments that stay in full precision.
    pub modules_to_not_convert: Vec<String>,
}

impl AwqConfig {
    pub fn new(
        weight_bits: u32,
        group_size: usize,
        zero_point: bool,
        modules_to_not_convert: Vec<String>,
    ) -> Result<Self> {
        if weight_bits != 4 {
            return Err(MoeError::Configuration(format!(
                "only 4-bit AWQ weights are supported, got {weight_bits} bits"
            )));
        }
        ensure!(group_size > 0, "AWQ group size must be positive");
        Ok(Self {
            weight_bits,
            group_size,
            zero_point,
            modules_to_not_convert,
        })
    }

    /// Parse a checkpoint `quant_config.json` / `quantize_config.json`.
    /// Accepts both `w_bit`/`bits` and `q_group_size`/`group_size`.
    pub fn from_config(config: &Value) -> Result<Self> {
        let get = |keys: &[&str]| keys.iter().find_map(|k| config.get(*k));
        let weight_bits = get(&["w_bit", "bits"])
            .and_then(Value::as_u64)
            .ok_or_else(|| MoeError::Configuration("AWQ config is missing w_bit/bits".into()))?;
        let group_size = get(&["q_group_size", "group_size"])
            .and_then(Value::as_u64)
            .ok_or_else(|| {
                MoeError::Configuration("AWQ config is missing q_group_size/group_size".into())
            })?;
        let zero_point = get(&["zero_point"])
            .and_then(Value::as_bool)
            .ok_or_else(|| MoeError::Configuration("AWQ config is missing zero_point".into()))?;
        let modules_to_not_convert = get(&["modules_to_not_convert"])
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        Self::new(
            weight_bits as u32,
            group_size as usize,
            zero_point,
            modules_to_not_convert,
        )
    }

    /// File names a checkpoint may carry this config under.
    pub fn config_filenames() -> &'static [&'static str] {
        &["quant_config.json", "quantize_config.json"]
    }

    /// Values packed into one `u32`.
    pub fn pack_factor(&self) -> usize {
        32 / self.weight_bits as usize
    }

    /// Whether the layer at `prefix` is excluded from quantization.
    pub fn is_layer_skipped(&self, prefix: &str) -> bool {
        self.modules_to_not_convert
            .iter()
            .any(|m| prefix.contains(m.as_str()))
    }
}

/// AWQ quantized linear layer computing `x @ W + bias`, `W: [in, out]`.
#[derive(Debug, Clone)]
pub struct AwqLinear {
    /// `[in_features, out_features / 8]`
    qweight: Vec<u32>,
    /// `[num_groups, out_features / 8]`
    qzeros: Vec<u32>,
    /// `[num_groups, out_features]`
    scales: Vec<f32>,
    bias: Option<Vec<f32>>,
    in_features: usize,
    out_features: usize,
    group_size: usize,
}

impl AwqLinear {
    /// Build from checkpoint tensors (`qweight`/`qzeros` as `U32`).
    pub fn new(
        config: &AwqConfig,
        qweight: &Tensor,
        qzeros: &Tensor,
        scales: &Tensor,
        bias: Option<&Tensor>,
    ) -> Result<Self> {
        let pack = config.pack_factor();
        let (in_features, packed_out) = qweight.dims2()?;
        let out_features = packed_out * pack;
        ensure!(
            in_features % config.group_size == 0,
            "input size {in_features} is not aligned with group size {}",
            config.group_size
        );
        let num_groups = in_features / config.group_size;
        ensure!(
            qzeros.dims() == [num_groups, packed_out],
            "qzeros shape {:?} does not match [{num_groups}, {packed_out}]",
            qzeros.dims()
        );
        ensure!(
            scales.dims() == [num_groups, out_features],
            "scales shape {:?} does not match [{num_groups}, {out_features}]",
            scales.dims()
        );
        ensure!(
            qweight.dtype() == DType::U32 && qzeros.dtype() == DType::U32,
            "AWQ qweight and qzeros must be U32"
        );
        let bias = match bias {
            Some(b) => {
                ensure!(b.dims() == [out_features], "bias must have {out_features} elements");
                Some(b.to_dtype(DType::F32)?.to_vec1::<f32>()?)
            }
            None => None,
        };
        Ok(Self {
            qweight: qweight.flatten_all()?.to_vec1()?,
            qzeros: qzeros.flatten_all()?.to_vec1()?,
            scales: scales.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?,
            bias,
            in_features,
            out_features,
            group_size: config.group_size,
        })
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }

    #[inline]
    fn unpack(packed: &[u32], row: usize, col: usize, packed_cols: usize) -> f32 {
        let word = packed[row * packed_cols + col / 8];
        ((word >> (4 * AWQ_REVERSE_ORDER[col % 8])) & 0xF) as f32
    }

    #[inline]
    fn weight_at(&self, k: usize, n: usize) -> f32 {
        let packed_cols = self.out_features / 8;
        let group = k / self.group_size;
        let q = Self::unpack(&self.qweight, k, n, packed_cols);
        let z = Self::unpack(&self.qzeros, group, n, packed_cols);
        (q - z) * self.scales[group * self.out_features + n]
    }

    /// Dequantized weight `[in_features, out_features]`.
    pub fn dequantize(&self) -> Result<Tensor> {
        let mut w = vec![0f32; self.in_features * self.out_features];
        for k in 0..self.in_features {
            for n in 0..self.out_features {
                w[k * self.out_features + n] = self.weight_at(k, n);
            }
        }
        Ok(Tensor::from_vec(
            w,
            (self.in_features, self.out_features),
            &Device::Cpu,
        )?)
    }

    /// `x: [..., in_features]` -> `[..., out_features]`.
    ///
    /// Large batches dequantize once and use a dense matmul; small batches
    /// stream the packed weights. The product is computed exactly once.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let dims = x.dims().to_vec();
        let Some((&last, lead)) = dims.split_last() else {
            return Err(MoeError::PreconditionViolation("AWQ input must have rank >= 1".into()));
        };
        ensure!(
            last == self.in_features,
            "AWQ input width {last} does not match in_features {}",
            self.in_features
        );
        let rows: usize = lead.iter().product();
        let x2 = x.to_dtype(DType::F32)?.reshape((rows, self.in_features))?;

        let out = if rows >= DEQUANT_MATMUL_THRESHOLD {
            debug!(rows, "awq: dequantize + matmul");
            x2.matmul(&self.dequantize()?.to_device(x.device())?)?
        } else {
            debug!(rows, "awq: streamed gemm");
            let xs: Vec<f32> = x2.flatten_all()?.to_vec1()?;
            let mut out = vec![0f32; rows * self.out_features];
            for k in 0..self.in_features {
                for n in 0..self.out_features {
                    let w = self.weight_at(k, n);
                    for r in 0..rows {
                        out[r * self.out_features + n] += xs[r * self.in_features + k] * w;
                    }
                }
            }
            Tensor::from_vec(out, (rows, self.out_features), x.device())?
        };
        let out = match &self.bias {
            Some(b) => out.broadcast_add(&Tensor::new(b.as_slice(), x.device())?)?,
            None => out,
        };
        let mut out_dims = lead.to_vec();
        out_dims.push(self.out_features);
        Ok(out.reshape(out_dims)?.to_dtype(x.dtype())?)
    }
}

/// Pack `[rows, cols]` 4-bit values eight per `u32` in AWQ order.
pub fn pack_awq(values: &[u8], rows: usize, cols: usize) -> Vec<u32> {
    let packed_cols = cols / 8;
    let mut out = vec![0u32; rows * packed_cols];
    for r in 0..rows {
        for c in 0..cols {
            out[r * packed_cols + c / 8] |=
                ((values[r * cols + c] & 0xF) as u32) << (4 * AWQ_REVERSE_ORDER[c % 8]);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AwqConfig {
        AwqConfig::new(4, 8, true, vec!["lm_head".to_string()]).unwrap()
    }

    /// in = 16, out = 8, group = 8: two groups.
    fn layer() -> (AwqLinear, Vec<f32>) {
        let (k, n) = (16usize, 8usize);
        let q: Vec<u8> = (0..k * n).map(|i| (i * 7 % 16) as u8).collect();
        let z: Vec<u8> = (0..2 * n).map(|i| (i % 3 + 7) as u8).collect();
        let s: Vec<f32> = (0..2 * n).map(|i| 0.01 * (i + 1) as f32).collect();
        let mut dense = vec![0f32; k * n];
        for kk in 0..k {
            for nn in 0..n {
                let g = kk / 8;
                dense[kk * n + nn] =
                    (q[kk * n + nn] as f32 - z[g * n + nn] as f32) * s[g * n + nn];
            }
        }
        let dev = Device::Cpu;
        let qweight = Tensor::from_vec(pack_awq(&q, k, n), (k, 1), &dev).unwrap();
        let qzeros = Tensor::from_vec(pack_awq(&z, 2, n), (2, 1), &dev).unwrap();
        let scales = Tensor::from_vec(s, (2, n), &dev).unwrap();
        (
            AwqLinear::new(&config(), &qweight, &qzeros, &scales, None).unwrap(),
            dense,
        )
    }

    #[test]
    fn test_awq_config_requires_4_bits() {
        assert!(matches!(
            AwqConfig::new(8, 128, true, vec![]),
            Err(MoeError::Configuration(_))
        ));
        assert_eq!(config().pack_factor(), 8);
    }

    #[test]
    fn test_awq_config_key_aliases() {
        let cfg = AwqConfig::from_config(&serde_json::json!({
            "bits": 4, "group_size": 64, "zero_point": false
        }))
        .unwrap();
        assert_eq!(cfg.group_size, 64);
        assert!(!cfg.zero_point);

        let cfg = AwqConfig::from_config(&serde_json::json!({
            "w_bit": 4, "q_group_size": 128, "zero_point": true,
            "modules_to_not_convert": ["visual"]
        }))
        .unwrap();
        assert_eq!(cfg.group_size, 128);
        assert!(cfg.is_layer_skipped("model.visual.proj"));
        assert!(!cfg.is_layer_skipped("model.layers.0.mlp"));
    }

    #[test]
    fn test_awq_reverse_order_unpack() {
        let packed = pack_awq(&[0, 1, 2, 3, 4, 5, 6, 7], 1, 8);
        // column j lives in nibble AWQ_REVERSE_ORDER[j]
        assert_eq!(packed[0], 0x7531_6420);
    }

    #[test]
    fn test_awq_dequantize_matches_dense() {
        let (linear, dense) = layer();
        let w: Vec<f32> = linear.dequantize().unwrap().flatten_all().unwrap().to_vec1().unwrap();
        for (a, b) in w.iter().zip(&dense) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_awq_small_and_large_batches_agree() {
        let (linear, _) = layer();
        let dev = Device::Cpu;
        let x_small = Tensor::arange(0f32, 16.0, &dev).unwrap().reshape((1, 16)).unwrap();
        let x_large = x_small.broadcast_as((300, 16)).unwrap().contiguous().unwrap();
        let y_small: Vec<f32> = linear.forward(&x_small).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let y_large = linear.forward(&x_large).unwrap();
        assert_eq!(y_large.dims(), &[300, 8]);
        let last: Vec<f32> = y_large.get(299).unwrap().to_vec1().unwrap();
        for (a, b) in y_small.iter().zip(&last) {
            assert!((a - b).abs() < 1e-4, "{a} vs {b}");
        }
    }

    #[test]
    fn test_awq_forward_rejects_width_mismatch() {
        let (linear, _) = layer();
        let x = Tensor::zeros((2, 8), DType::F32, &Device::Cpu).unwrap();
        assert!(linear.forward(&x).is_err());
    }
}
