//! Stacked expert weights `(E, N, K)` in every supported storage precision.
//!
//! Weights are extracted to host buffers once at model-build time and stay
//! read-only for the lifetime of the layer, so every grouped GEMM tile can
//! read them concurrently without synchronization.

use std::ops::Range;

use candle_core::{DType, Device, Tensor};

use super::fp8::{fp8_e4m3_decode, fp8_e4m3_encode, FP8_E4M3_MAX};
use super::mode::{BlockShape, QuantMode};
use crate::error::{ensure, MoeError, Result};

const INT8_MAX: f32 = 127.0;
const SCALE_EPS: f32 = 1e-12;

/// Dense `f32` scale grid with explicit dimensions.
#[derive(Debug, Clone, PartialEq)]
pub struct ScaleTensor {
    dims: Vec<usize>,
    values: Vec<f32>,
}

impl ScaleTensor {
    pub fn new(dims: Vec<usize>, values: Vec<f32>) -> Result<Self> {
        let numel: usize = dims.iter().product();
        ensure!(
            numel == values.len(),
            "scale dims {dims:?} describe {numel} elements, got {}",
            values.len()
        );
        Ok(Self { dims, values })
    }

    pub fn scalar(value: f32) -> Self {
        Self {
            dims: vec![1],
            values: vec![value],
        }
    }

    /// Copy a candle tensor of any float dtype.
    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        let dims = tensor.dims().to_vec();
        let values = tensor
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        Self::new(dims, values)
    }

    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        Ok(Tensor::from_vec(self.values.clone(), self.dims.clone(), device)?)
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Drop trailing unit dimensions, e.g. `(E, N, 1)` -> `(E, N)`.
    fn squeeze_trailing(mut self, keep: usize) -> Self {
        while self.dims.len() > keep && self.dims.last() == Some(&1) {
            self.dims.pop();
        }
        self
    }

    #[inline]
    pub(crate) fn at1(&self, i: usize) -> f32 {
        self.values[i]
    }

    #[inline]
    pub(crate) fn at2(&self, i: usize, j: usize) -> f32 {
        self.values[i * self.dims[1] + j]
    }

    #[inline]
    pub(crate) fn at3(&self, i: usize, j: usize, k: usize) -> f32 {
        self.values[(i * self.dims[1] + j) * self.dims[2] + k]
    }
}

/// Zero points of weight-only quantized weights.
///
/// 8-bit: one byte per `(expert, n, group)`. 4-bit: two zero points per byte
/// packed along the output-channel axis, `(expert, ceil(N / 2), groups)`,
/// nibble `(byte >> 4 * (n % 2)) & 0xF`.
#[derive(Debug, Clone, PartialEq)]
pub struct ZeroPoint {
    dims: [usize; 3],
    values: Vec<u8>,
}

impl ZeroPoint {
    pub fn new(dims: [usize; 3], values: Vec<u8>) -> Result<Self> {
        let numel: usize = dims.iter().product();
        ensure!(
            numel == values.len(),
            "zero point dims {dims:?} describe {numel} elements, got {}",
            values.len()
        );
        Ok(Self { dims, values })
    }

    pub fn dims(&self) -> [usize; 3] {
        self.dims
    }

    pub fn values(&self) -> &[u8] {
        &self.values
    }

    #[inline]
    pub(crate) fn int8_at(&self, expert: usize, n: usize, group: usize) -> f32 {
        self.values[(expert * self.dims[1] + n) * self.dims[2] + group] as f32
    }

    #[inline]
    pub(crate) fn int4_at(&self, expert: usize, n: usize, group: usize) -> f32 {
        let byte = self.values[(expert * self.dims[1] + n / 2) * self.dims[2] + group];
        ((byte >> (4 * (n % 2))) & 0xF) as f32
    }
}

/// Host storage of the stacked weight values.
#[derive(Debug, Clone, PartialEq)]
pub enum WeightData {
    /// Full precision, `E * N * K` values.
    F32(Vec<f32>),
    /// FP8 E4M3 bytes, `E * N * K`.
    Fp8(Vec<u8>),
    /// Signed INT8 for weight+activation modes, `E * N * K`.
    Int8(Vec<i8>),
    /// Unsigned 8-bit weight-only values centred on 128 unless zero points
    /// are given, `E * N * K`.
    Uint8(Vec<u8>),
    /// 4-bit weight-only values, two per byte along K: `E * N * K / 2`.
    PackedInt4(Vec<u8>),
}

impl WeightData {
    fn name(&self) -> &'static str {
        match self {
            Self::F32(_) => "f32",
            Self::Fp8(_) => "fp8",
            Self::Int8(_) => "int8",
            Self::Uint8(_) => "uint8",
            Self::PackedInt4(_) => "packed int4",
        }
    }

    fn len(&self) -> usize {
        match self {
            Self::F32(v) => v.len(),
            Self::Fp8(v) | Self::Uint8(v) | Self::PackedInt4(v) => v.len(),
            Self::Int8(v) => v.len(),
        }
    }

    fn matches(&self, mode: &QuantMode) -> bool {
        match mode {
            QuantMode::Full => matches!(self, Self::F32(_)),
            QuantMode::Fp8Tensor | QuantMode::Fp8Channel | QuantMode::Fp8Block(_) => {
                matches!(self, Self::Fp8(_))
            }
            QuantMode::Int8Tensor | QuantMode::Int8Channel | QuantMode::Int8Block(_) => {
                matches!(self, Self::Int8(_))
            }
            QuantMode::Int8WeightOnly { .. } => matches!(self, Self::Uint8(_)),
            QuantMode::Int4WeightOnly { .. } => matches!(self, Self::PackedInt4(_)),
        }
    }
}

/// One stacked expert weight matrix `(E, N, K)` with its quantization state.
#[derive(Debug, Clone)]
pub struct ExpertWeights {
    data: WeightData,
    num_experts: usize,
    n: usize,
    k: usize,
    mode: QuantMode,
    scale: Option<ScaleTensor>,
    zero_point: Option<ZeroPoint>,
}

impl ExpertWeights {
    /// Build from host buffers, validating storage, scale and zero-point
    /// shapes against `mode`. `dims` is the logical `(E, N, K)` shape.
    pub fn new(
        data: WeightData,
        dims: (usize, usize, usize),
        mode: QuantMode,
        scale: Option<ScaleTensor>,
        zero_point: Option<ZeroPoint>,
    ) -> Result<Self> {
        let (e, n, k) = dims;
        ensure!(e > 0 && n > 0 && k > 0, "weight dims must be non-zero, got {dims:?}");
        if !data.matches(&mode) {
            return Err(MoeError::UnsupportedQuantization(format!(
                "{} weight storage cannot be used with {mode}",
                data.name()
            )));
        }
        let expected_len = match mode {
            QuantMode::Int4WeightOnly { .. } => {
                ensure!(k % 2 == 0, "4-bit weights need an even K, got {k}");
                e * n * k / 2
            }
            _ => e * n * k,
        };
        ensure!(
            data.len() == expected_len,
            "weight storage holds {} elements, expected {expected_len} for {dims:?} ({mode})",
            data.len()
        );

        let scale = validate_scale(mode, dims, scale)?;
        validate_zero_point(mode, dims, zero_point.as_ref())?;

        Ok(Self {
            data,
            num_experts: e,
            n,
            k,
            mode,
            scale,
            zero_point,
        })
    }

    /// Full-precision weights from a `(E, N, K)` tensor of any float dtype.
    pub fn full(weight: &Tensor) -> Result<Self> {
        let (e, n, k) = weight.dims3()?;
        let values = weight
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        Self::new(WeightData::F32(values), (e, n, k), QuantMode::Full, None, None)
    }

    /// Build from candle tensors as produced by a checkpoint loader.
    ///
    /// Storage dtypes: `U8` for FP8 bytes, 8-bit weight-only values and
    /// packed 4-bit values (shape `(E, N, K / 2)`), `I64` for signed INT8
    /// (candle has no native i8), any float dtype for full precision. Zero
    /// points are `U8`.
    pub fn from_tensors(
        weight: &Tensor,
        scale: Option<&Tensor>,
        zero_point: Option<&Tensor>,
        mode: QuantMode,
    ) -> Result<Self> {
        let (e, n, stored_k) = weight.dims3()?;
        let flat = weight.flatten_all()?;
        let (data, k) = match mode {
            QuantMode::Full => (WeightData::F32(flat.to_dtype(DType::F32)?.to_vec1()?), stored_k),
            QuantMode::Fp8Tensor | QuantMode::Fp8Channel | QuantMode::Fp8Block(_) => {
                (WeightData::Fp8(expect_u8(&flat, "fp8 weight")?), stored_k)
            }
            QuantMode::Int8Tensor | QuantMode::Int8Channel | QuantMode::Int8Block(_) => {
                ensure!(
                    flat.dtype() == DType::I64,
                    "int8 weights are stored as I64, got {:?}",
                    flat.dtype()
                );
                let values = flat
                    .to_vec1::<i64>()?
                    .into_iter()
                    .map(|v| {
                        i8::try_from(v).map_err(|_| {
                            MoeError::PreconditionViolation(format!(
                                "int8 weight value {v} out of range"
                            ))
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                (WeightData::Int8(values), stored_k)
            }
            QuantMode::Int8WeightOnly { .. } => {
                (WeightData::Uint8(expect_u8(&flat, "uint8 weight")?), stored_k)
            }
            QuantMode::Int4WeightOnly { .. } => (
                WeightData::PackedInt4(expect_u8(&flat, "packed int4 weight")?),
                stored_k * 2,
            ),
        };

        let scale = scale.map(ScaleTensor::from_tensor).transpose()?;
        let zero_point = match zero_point {
            Some(zp) => {
                let (a, b, c) = zp.dims3()?;
                Some(ZeroPoint::new([a, b, c], expect_u8(&zp.flatten_all()?, "zero point")?)?)
            }
            None => None,
        };
        Self::new(data, (e, n, k), mode, scale, zero_point)
    }

    pub fn num_experts(&self) -> usize {
        self.num_experts
    }

    /// Output width N.
    pub fn n(&self) -> usize {
        self.n
    }

    /// Logical reduction width K (unpacked).
    pub fn k(&self) -> usize {
        self.k
    }

    pub fn dims(&self) -> (usize, usize, usize) {
        (self.num_experts, self.n, self.k)
    }

    pub fn mode(&self) -> QuantMode {
        self.mode
    }

    pub fn scale(&self) -> Option<&ScaleTensor> {
        self.scale.as_ref()
    }

    pub fn zero_point(&self) -> Option<&ZeroPoint> {
        self.zero_point.as_ref()
    }

    pub fn data(&self) -> &WeightData {
        &self.data
    }

    /// Load the raw stored values of `cols` x `[k_start, k_start + k_len)`
    /// for one expert into `out`, row-major `[cols.len(), k_len]`.
    ///
    /// FP8 is decoded to its exact `f32` value, integers are widened without
    /// scaling and 4-bit values are unpacked from their nibble. With `MASKED`
    /// elements at or past K read as zero; without it the caller guarantees
    /// the range is in bounds.
    pub(crate) fn load_raw_tile<const MASKED: bool>(
        &self,
        expert: usize,
        cols: Range<usize>,
        k_start: usize,
        k_len: usize,
        out: &mut [f32],
    ) {
        let valid = if MASKED {
            self.k.saturating_sub(k_start).min(k_len)
        } else {
            debug_assert!(k_start + k_len <= self.k);
            k_len
        };
        for (row, col) in cols.enumerate() {
            let dst = &mut out[row * k_len..(row + 1) * k_len];
            let base = (expert * self.n + col) * self.k + k_start;
            match &self.data {
                WeightData::F32(v) => dst[..valid].copy_from_slice(&v[base..base + valid]),
                WeightData::Fp8(v) => {
                    for (d, &b) in dst[..valid].iter_mut().zip(&v[base..base + valid]) {
                        *d = fp8_e4m3_decode(b);
                    }
                }
                WeightData::Int8(v) => {
                    for (d, &q) in dst[..valid].iter_mut().zip(&v[base..base + valid]) {
                        *d = q as f32;
                    }
                }
                WeightData::Uint8(v) => {
                    for (d, &q) in dst[..valid].iter_mut().zip(&v[base..base + valid]) {
                        *d = q as f32;
                    }
                }
                WeightData::PackedInt4(v) => {
                    let row_base = (expert * self.n + col) * (self.k / 2);
                    for (kk, d) in dst[..valid].iter_mut().enumerate() {
                        let k = k_start + kk;
                        let byte = v[row_base + k / 2];
                        *d = ((byte >> (4 * (k % 2))) & 0xF) as f32;
                    }
                }
            }
            if MASKED {
                dst[valid..].fill(0.0);
            }
        }
    }

    /// Dequantize back to a full-precision `(E, N, K)` tensor on the CPU.
    pub fn dequantize(&self) -> Result<Tensor> {
        let (e, n, k) = self.dims();
        let mut out = vec![0f32; e * n * k];
        let mut row = vec![0f32; k];
        for expert in 0..e {
            for col in 0..n {
                self.load_raw_tile::<false>(expert, col..col + 1, 0, k, &mut row);
                let dst = &mut out[(expert * n + col) * k..(expert * n + col + 1) * k];
                for (kk, (d, &q)) in dst.iter_mut().zip(&row).enumerate() {
                    *d = self.dequantize_element(expert, col, kk, q);
                }
            }
        }
        Ok(Tensor::from_vec(out, (e, n, k), &Device::Cpu)?)
    }

    #[inline]
    fn dequantize_element(&self, expert: usize, col: usize, k: usize, q: f32) -> f32 {
        let Some(scale) = &self.scale else {
            return q;
        };
        match self.mode {
            QuantMode::Full => q,
            QuantMode::Fp8Tensor | QuantMode::Int8Tensor => q * scale.at1(expert),
            QuantMode::Fp8Channel | QuantMode::Int8Channel => q * scale.at2(expert, col),
            QuantMode::Fp8Block(s) | QuantMode::Int8Block(s) => {
                q * scale.at3(expert, col / s.block_n, k / s.block_k)
            }
            QuantMode::Int4WeightOnly { group_size } | QuantMode::Int8WeightOnly { group_size } => {
                let group = k / group_size;
                (q - self.zero_at(expert, col, group)) * scale.at3(expert, col, group)
            }
        }
    }

    /// Zero point of a weight-only group, defaulting to the unsigned centre
    /// (8 for 4-bit, 128 for 8-bit) when no zero points are stored.
    #[inline]
    pub(crate) fn zero_at(&self, expert: usize, col: usize, group: usize) -> f32 {
        match (&self.zero_point, self.mode) {
            (Some(zp), QuantMode::Int4WeightOnly { .. }) => zp.int4_at(expert, col, group),
            (Some(zp), _) => zp.int8_at(expert, col, group),
            (None, QuantMode::Int4WeightOnly { .. }) => 8.0,
            (None, _) => 128.0,
        }
    }
}

fn expect_u8(t: &Tensor, what: &str) -> Result<Vec<u8>> {
    ensure!(
        t.dtype() == DType::U8,
        "{what} must be stored as U8, got {:?}",
        t.dtype()
    );
    Ok(t.to_vec1::<u8>()?)
}

fn validate_scale(
    mode: QuantMode,
    (e, n, k): (usize, usize, usize),
    scale: Option<ScaleTensor>,
) -> Result<Option<ScaleTensor>> {
    let scale = match (mode, scale) {
        (QuantMode::Full, None) => return Ok(None),
        (QuantMode::Full, Some(_)) => {
            return Err(MoeError::UnsupportedQuantization(
                "full-precision weights do not take a scale".to_string(),
            ))
        }
        (mode, None) => {
            return Err(MoeError::UnsupportedQuantization(format!(
                "{mode} weights require a weight scale"
            )))
        }
        (_, Some(scale)) => scale,
    };

    let (scale, expected): (ScaleTensor, Vec<usize>) = match mode {
        QuantMode::Fp8Tensor | QuantMode::Int8Tensor => (scale.squeeze_trailing(1), vec![e]),
        QuantMode::Fp8Channel | QuantMode::Int8Channel => (scale.squeeze_trailing(2), vec![e, n]),
        QuantMode::Fp8Block(shape) | QuantMode::Int8Block(shape) => {
            check_block_divides(shape, n, k)?;
            let (gn, gk) = shape.grid(n, k);
            (scale, vec![e, gn, gk])
        }
        QuantMode::Int4WeightOnly { group_size } | QuantMode::Int8WeightOnly { group_size } => {
            ensure!(
                group_size > 0 && k % group_size == 0,
                "group size {group_size} must divide K = {k}"
            );
            (scale, vec![e, n, k / group_size])
        }
        QuantMode::Full => unreachable!("handled above"),
    };
    if scale.dims() != expected.as_slice() {
        return Err(MoeError::UnsupportedQuantization(format!(
            "{mode} weight scale must have shape {expected:?}, got {:?}",
            scale.dims()
        )));
    }
    Ok(Some(scale))
}

fn check_block_divides(shape: BlockShape, n: usize, k: usize) -> Result<()> {
    ensure!(
        shape.block_n > 0 && shape.block_k > 0,
        "block shape {shape} must be positive"
    );
    ensure!(
        n % shape.block_n == 0 && k % shape.block_k == 0,
        "block shape {shape} must evenly divide weight dims (N={n}, K={k})"
    );
    Ok(())
}

fn validate_zero_point(
    mode: QuantMode,
    (e, n, k): (usize, usize, usize),
    zero_point: Option<&ZeroPoint>,
) -> Result<()> {
    let Some(zp) = zero_point else {
        return Ok(());
    };
    let expected = match mode {
        QuantMode::Int4WeightOnly { group_size } => [e, n.div_ceil(2), k / group_size],
        QuantMode::Int8WeightOnly { group_size } => [e, n, k / group_size],
        _ => {
            return Err(MoeError::UnsupportedQuantization(format!(
                "zero points are only supported for weight-only modes, not {mode}"
            )))
        }
    };
    if zp.dims() != expected {
        return Err(MoeError::UnsupportedQuantization(format!(
            "{mode} zero point must have shape {expected:?}, got {:?}",
            zp.dims()
        )));
    }
    Ok(())
}

// ─── Weight quantizers ──────────────────────────────────────────────────────

/// Quantize a full-precision `(E, N, K)` weight tensor into `mode`.
///
/// Weight+activation modes use symmetric max-abs scaling at the mode's
/// granularity. Weight-only modes are group-wise; with `with_zero_point`
/// they are asymmetric (min/max) and store zero points, otherwise values
/// are centred on 8 / 128.
pub fn quantize_expert_weights(
    weight: &Tensor,
    mode: QuantMode,
    with_zero_point: bool,
) -> Result<ExpertWeights> {
    let (e, n, k) = weight.dims3()?;
    let w: Vec<f32> = weight.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
    if with_zero_point && !mode.is_weight_only() {
        return Err(MoeError::UnsupportedQuantization(format!(
            "zero points are only supported for weight-only modes, not {mode}"
        )));
    }

    match mode {
        QuantMode::Full => ExpertWeights::full(weight),
        QuantMode::Fp8Tensor | QuantMode::Int8Tensor => {
            let scales: Vec<f32> = (0..e)
                .map(|ex| absmax(&w[ex * n * k..(ex + 1) * n * k]) / qmax(mode))
                .map(|s| s.max(SCALE_EPS))
                .collect();
            let data = quantize_symmetric(&w, mode, |i| scales[i / (n * k)]);
            ExpertWeights::new(data, (e, n, k), mode, Some(ScaleTensor::new(vec![e], scales)?), None)
        }
        QuantMode::Fp8Channel | QuantMode::Int8Channel => {
            let scales: Vec<f32> = (0..e * n)
                .map(|row| (absmax(&w[row * k..(row + 1) * k]) / qmax(mode)).max(SCALE_EPS))
                .collect();
            let data = quantize_symmetric(&w, mode, |i| scales[i / k]);
            ExpertWeights::new(data, (e, n, k), mode, Some(ScaleTensor::new(vec![e, n], scales)?), None)
        }
        QuantMode::Fp8Block(shape) | QuantMode::Int8Block(shape) => {
            check_block_divides(shape, n, k)?;
            let (gn, gk) = shape.grid(n, k);
            let mut scales = vec![0f32; e * gn * gk];
            for ex in 0..e {
                for col in 0..n {
                    for kk in 0..k {
                        let idx = (ex * gn + col / shape.block_n) * gk + kk / shape.block_k;
                        scales[idx] = scales[idx].max(w[(ex * n + col) * k + kk].abs());
                    }
                }
            }
            for s in scales.iter_mut() {
                *s = (*s / qmax(mode)).max(SCALE_EPS);
            }
            let data = quantize_symmetric(&w, mode, |i| {
                let ex = i / (n * k);
                let col = (i / k) % n;
                let kk = i % k;
                scales[(ex * gn + col / shape.block_n) * gk + kk / shape.block_k]
            });
            ExpertWeights::new(
                data,
                (e, n, k),
                mode,
                Some(ScaleTensor::new(vec![e, gn, gk], scales)?),
                None,
            )
        }
        QuantMode::Int4WeightOnly { group_size } | QuantMode::Int8WeightOnly { group_size } => {
            ensure!(
                group_size > 0 && k % group_size == 0,
                "group size {group_size} must divide K = {k}"
            );
            quantize_weight_only(&w, (e, n, k), mode, group_size, with_zero_point)
        }
    }
}

fn qmax(mode: QuantMode) -> f32 {
    match mode {
        QuantMode::Fp8Tensor | QuantMode::Fp8Channel | QuantMode::Fp8Block(_) => FP8_E4M3_MAX,
        _ => INT8_MAX,
    }
}

fn absmax(values: &[f32]) -> f32 {
    values.iter().fold(0f32, |m, v| m.max(v.abs()))
}

fn quantize_symmetric(w: &[f32], mode: QuantMode, scale_of: impl Fn(usize) -> f32) -> WeightData {
    match mode {
        QuantMode::Fp8Tensor | QuantMode::Fp8Channel | QuantMode::Fp8Block(_) => WeightData::Fp8(
            w.iter()
                .enumerate()
                .map(|(i, &v)| fp8_e4m3_encode(v / scale_of(i)))
                .collect(),
        ),
        _ => WeightData::Int8(
            w.iter()
                .enumerate()
                .map(|(i, &v)| (v / scale_of(i)).round().clamp(-INT8_MAX, INT8_MAX) as i8)
                .collect(),
        ),
    }
}

fn quantize_weight_only(
    w: &[f32],
    (e, n, k): (usize, usize, usize),
    mode: QuantMode,
    group_size: usize,
    with_zero_point: bool,
) -> Result<ExpertWeights> {
    let four_bit = matches!(mode, QuantMode::Int4WeightOnly { .. });
    let levels: f32 = if four_bit { 15.0 } else { 255.0 };
    let centre: f32 = if four_bit { 8.0 } else { 128.0 };
    let groups = k / group_size;

    let mut q = vec![0u8; e * n * k];
    let mut scales = vec![0f32; e * n * groups];
    let mut zeros = vec![0u8; e * n * groups];

    for row in 0..e * n {
        for g in 0..groups {
            let start = row * k + g * group_size;
            let chunk = &w[start..start + group_size];
            let (scale, zero) = if with_zero_point {
                let lo = chunk.iter().fold(f32::INFINITY, |m, &v| m.min(v)).min(0.0);
                let hi = chunk.iter().fold(f32::NEG_INFINITY, |m, &v| m.max(v)).max(0.0);
                let scale = ((hi - lo) / levels).max(SCALE_EPS);
                (scale, (-lo / scale).round().clamp(0.0, levels))
            } else {
                // symmetric around the centre: [-(centre - 1), centre - 1] in steps of scale
                ((absmax(chunk) / (centre - 1.0)).max(SCALE_EPS), centre)
            };
            scales[row * groups + g] = scale;
            zeros[row * groups + g] = zero as u8;
            for (i, &v) in chunk.iter().enumerate() {
                q[start + i] = ((v / scale).round() + zero).clamp(0.0, levels) as u8;
            }
        }
    }

    let scale = ScaleTensor::new(vec![e, n, groups], scales)?;
    let data = if four_bit {
        WeightData::PackedInt4(pack_int4_along_k(&q, e * n, k))
    } else {
        WeightData::Uint8(q)
    };
    let zero_point = if !with_zero_point {
        None
    } else if four_bit {
        Some(ZeroPoint::new(
            [e, n.div_ceil(2), groups],
            pack_int4_zero_points(&zeros, e, n, groups),
        )?)
    } else {
        Some(ZeroPoint::new([e, n, groups], zeros)?)
    };
    ExpertWeights::new(data, (e, n, k), mode, Some(scale), zero_point)
}

/// Pack `rows x k` nibbles two per byte along K (even k in the low nibble).
pub fn pack_int4_along_k(q: &[u8], rows: usize, k: usize) -> Vec<u8> {
    let mut packed = vec![0u8; rows * k / 2];
    for row in 0..rows {
        for kk in 0..k {
            packed[row * k / 2 + kk / 2] |= (q[row * k + kk] & 0xF) << (4 * (kk % 2));
        }
    }
    packed
}

fn pack_int4_zero_points(zeros: &[u8], e: usize, n: usize, groups: usize) -> Vec<u8> {
    let half_n = n.div_ceil(2);
    let mut packed = vec![0u8; e * half_n * groups];
    for ex in 0..e {
        for col in 0..n {
            for g in 0..groups {
                let z = zeros[(ex * n + col) * groups + g] & 0xF;
                packed[(ex * half_n + col / 2) * groups + g] |= z << (4 * (col % 2));
            }
        }
    }
    packed
}
