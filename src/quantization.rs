//! 4-bit group quantization with per-group f16 scale and bias.
//!
//! Each row of a weight matrix is split into groups of `group_size` consecutive
//! columns. A group is mapped onto 16 evenly spaced levels:
//!
//! ```text
//! bias  = min(group)
//! scale = (max(group) - min(group)) / 15
//! code  = clamp(round((v - bias) / scale), 0, 15)
//! v'    = code * scale + bias
//! ```
//!
//! Codes are packed four to a `u16` (see [`crate::packing`] for the nibble order),
//! and `scale`/`bias` are stored as f16. The bias is rounded down and the scale
//! rounded up when narrowed to f16, so the stored grid always spans the group's
//! range and the reconstruction error stays within half of the *stored* scale.

use candle_core::{DType, Device, Tensor};
use half::f16;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{GroupQuantError, Result};
use crate::packing::{f16_ceil, f16_floor, pack_word, unpack_word, CODES_PER_WORD, MAX_BIN};

/// Matrices with at least this many elements are processed row-parallel.
pub const PARALLEL_THRESHOLD: usize = 1 << 16;

/// How the quantization range of each group is chosen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RangeSelection {
    /// Exact minimum and maximum of the group.
    #[default]
    MinMax,
    /// Clip the group to a percentile range before quantizing.
    ///
    /// Values outside the range are clamped and accounted for in
    /// [`QuantizationReport::clipped_outlier_loss`].
    Percentile {
        /// Lower percentile in `[0, 100)`, e.g. `0.5`
        lower: f32,
        /// Upper percentile in `(lower, 100]`, e.g. `99.5`
        upper: f32,
    },
}

/// Codec configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantizationConfig {
    /// Number of columns sharing one scale/bias pair. `0` disables quantization.
    pub group_size: usize,

    /// Range selection per group.
    #[serde(default)]
    pub range: RangeSelection,

    /// Whether large matrices are compressed row-parallel.
    #[serde(default = "default_parallel")]
    pub parallel: bool,
}

fn default_parallel() -> bool {
    true
}

impl Default for QuantizationConfig {
    fn default() -> Self {
        Self {
            group_size: 64,
            range: RangeSelection::MinMax,
            parallel: true,
        }
    }
}

impl QuantizationConfig {
    /// Configuration with the given group size and min/max ranges.
    #[must_use]
    pub fn with_group_size(group_size: usize) -> Self {
        Self {
            group_size,
            ..Default::default()
        }
    }

    /// Configuration that keeps weights in full precision.
    #[must_use]
    pub fn disabled() -> Self {
        Self::with_group_size(0)
    }

    /// `true` when the group size is `0`.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.group_size == 0
    }

    /// Check the configuration independently of any matrix shape.
    ///
    /// # Errors
    /// Returns `InvalidGroupSize` if a non-zero group size is not a multiple of 4,
    /// and `InvalidConfig` for an unusable percentile range.
    pub fn validate(&self) -> Result<()> {
        if !self.is_disabled() && self.group_size % CODES_PER_WORD != 0 {
            return Err(GroupQuantError::InvalidGroupSize {
                columns: 0,
                group_size: self.group_size,
                reason: "group size must be a multiple of 4",
            });
        }
        if let RangeSelection::Percentile { lower, upper } = self.range {
            if !(0.0..100.0).contains(&lower) || !(lower < upper && upper <= 100.0) {
                return Err(GroupQuantError::InvalidConfig(format!(
                    "percentile range must satisfy 0 <= lower < upper <= 100, got {lower}..{upper}"
                )));
            }
        }
        Ok(())
    }
}

/// Compute data type for dequantized values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputeDType {
    /// 32-bit float
    #[default]
    F32,
    /// 16-bit float
    F16,
    /// 16-bit brain float
    BF16,
}

impl From<ComputeDType> for DType {
    fn from(dtype: ComputeDType) -> Self {
        match dtype {
            ComputeDType::F32 => DType::F32,
            ComputeDType::F16 => DType::F16,
            ComputeDType::BF16 => DType::BF16,
        }
    }
}

/// Check that `group_size` can be used on a matrix with `columns` columns.
///
/// # Errors
/// Returns `InvalidGroupSize` when the group size is 0 (quantization disabled),
/// not a multiple of 4, or does not divide the column count.
pub fn validate_group_size(columns: usize, group_size: usize) -> Result<()> {
    let reason = if group_size == 0 {
        "group size 0 disables quantization"
    } else if group_size % CODES_PER_WORD != 0 {
        "group size must be a multiple of 4"
    } else if columns % group_size != 0 {
        "column count must be a multiple of the group size"
    } else {
        return Ok(());
    };
    Err(GroupQuantError::InvalidGroupSize {
        columns,
        group_size,
        reason,
    })
}

/// A row-major matrix in packed 4-bit form.
#[derive(Debug, Clone, PartialEq)]
pub struct PackedMatrix {
    codes: Vec<u16>,
    scales: Vec<f16>,
    biases: Vec<f16>,
    rows: usize,
    columns: usize,
    group_size: usize,
}

impl PackedMatrix {
    /// Assemble a packed matrix from raw parts, checking every length.
    ///
    /// # Errors
    /// Returns `InvalidGroupSize` for an unusable group size and `ShapeMismatch`
    /// if any buffer length disagrees with `rows`/`columns`.
    pub fn from_parts(
        codes: Vec<u16>,
        scales: Vec<f16>,
        biases: Vec<f16>,
        rows: usize,
        columns: usize,
        group_size: usize,
    ) -> Result<Self> {
        validate_group_size(columns, group_size)?;
        let numel = rows
            .checked_mul(columns)
            .ok_or_else(|| GroupQuantError::ShapeMismatch {
                expected: vec![rows, columns],
                actual: vec![codes.len()],
            })?;
        let words = numel / CODES_PER_WORD;
        let groups = numel / group_size;
        for (len, expected) in [
            (codes.len(), words),
            (scales.len(), groups),
            (biases.len(), groups),
        ] {
            if len != expected {
                return Err(GroupQuantError::ShapeMismatch {
                    expected: vec![expected],
                    actual: vec![len],
                });
            }
        }
        Ok(Self {
            codes,
            scales,
            biases,
            rows,
            columns,
            group_size,
        })
    }

    /// Number of rows.
    #[must_use]
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of columns.
    #[must_use]
    pub fn columns(&self) -> usize {
        self.columns
    }

    /// `[rows, columns]` of the original matrix.
    #[must_use]
    pub fn shape(&self) -> [usize; 2] {
        [self.rows, self.columns]
    }

    /// Group size used for quantization.
    #[must_use]
    pub fn group_size(&self) -> usize {
        self.group_size
    }

    /// Number of elements in the original matrix.
    #[must_use]
    pub fn numel(&self) -> usize {
        self.rows * self.columns
    }

    /// Packed words per row (`columns / 4`).
    #[must_use]
    pub fn words_per_row(&self) -> usize {
        self.columns / CODES_PER_WORD
    }

    /// Groups per row (`columns / group_size`).
    #[must_use]
    pub fn groups_per_row(&self) -> usize {
        self.columns / self.group_size
    }

    /// All packed words, row-major.
    #[must_use]
    pub fn codes(&self) -> &[u16] {
        &self.codes
    }

    /// All group scales, row-major.
    #[must_use]
    pub fn scales(&self) -> &[f16] {
        &self.scales
    }

    /// All group biases, row-major.
    #[must_use]
    pub fn biases(&self) -> &[f16] {
        &self.biases
    }

    /// Packed words of one row.
    ///
    /// # Panics
    /// Panics if `row >= rows`.
    #[must_use]
    pub fn codes_row(&self, row: usize) -> &[u16] {
        let wpr = self.words_per_row();
        &self.codes[row * wpr..(row + 1) * wpr]
    }

    /// Stored scale of a group, widened to f32.
    ///
    /// # Panics
    /// Panics if the group is out of range.
    #[must_use]
    pub fn scale(&self, row: usize, group: usize) -> f32 {
        self.scales[row * self.groups_per_row() + group].to_f32()
    }

    /// Stored bias of a group, widened to f32.
    ///
    /// # Panics
    /// Panics if the group is out of range.
    #[must_use]
    pub fn bias(&self, row: usize, group: usize) -> f32 {
        self.biases[row * self.groups_per_row() + group].to_f32()
    }

    /// Bin index stored for one element.
    ///
    /// # Panics
    /// Panics if the element is out of range.
    #[must_use]
    pub fn code(&self, row: usize, column: usize) -> u8 {
        let word = self.codes_row(row)[column / CODES_PER_WORD];
        unpack_word(word)[column % CODES_PER_WORD]
    }

    /// Memory size of codes and metadata in bytes.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        (self.codes.len() + self.scales.len() + self.biases.len()) * 2
    }

    /// Storage cost in bits: `4` per element plus `32` per group.
    #[must_use]
    pub fn storage_bits(&self) -> usize {
        self.size_bytes() * 8
    }
}

/// Counters collected while compressing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct QuantizationReport {
    /// Number of groups quantized.
    pub groups: usize,
    /// Groups with zero dynamic range, stored with a unit scale.
    pub degenerate_groups: usize,
    /// Values clamped by percentile range selection.
    pub clipped_values: usize,
    /// Mean absolute distance between each value and its clipped range,
    /// over all elements. Always `0.0` for min/max ranges.
    pub clipped_outlier_loss: f64,
}

impl QuantizationReport {
    fn absorb(&mut self, row: RowStats) {
        self.groups += row.groups;
        self.degenerate_groups += row.degenerate;
        self.clipped_values += row.clipped;
        self.clipped_outlier_loss += row.clipped_loss;
    }
}

/// A packed matrix together with its compression report.
#[derive(Debug, Clone)]
pub struct Compressed {
    /// The packed matrix.
    pub packed: PackedMatrix,
    /// What happened while packing it.
    pub report: QuantizationReport,
}

#[derive(Debug, Default, Clone, Copy)]
struct RowStats {
    groups: usize,
    degenerate: usize,
    clipped: usize,
    clipped_loss: f64,
}

/// Compress a row-major matrix with exact min/max ranges.
///
/// # Errors
/// Returns `InvalidGroupSize` before doing any work if the shape does not fit,
/// `ShapeMismatch` if `values.len() != rows * columns`, `NonFiniteValue` for NaN
/// or infinite input and `ValueOutOfRange` if group metadata overflows f16.
pub fn compress(
    values: &[f32],
    rows: usize,
    columns: usize,
    group_size: usize,
) -> Result<PackedMatrix> {
    let config = QuantizationConfig::with_group_size(group_size);
    compress_with_config(values, rows, columns, &config).map(|c| c.packed)
}

/// Compress a row-major matrix with an explicit configuration.
///
/// # Errors
/// See [`compress`]; additionally `InvalidConfig` for a bad percentile range.
pub fn compress_with_config(
    values: &[f32],
    rows: usize,
    columns: usize,
    config: &QuantizationConfig,
) -> Result<Compressed> {
    config.validate()?;
    validate_group_size(columns, config.group_size)?;
    if values.len() != rows * columns {
        return Err(GroupQuantError::ShapeMismatch {
            expected: vec![rows, columns],
            actual: vec![values.len()],
        });
    }

    let group_size = config.group_size;
    let words_per_row = columns / CODES_PER_WORD;
    let groups_per_row = columns / group_size;
    let mut codes = vec![0u16; rows * words_per_row];
    let mut scales = vec![f16::ZERO; rows * groups_per_row];
    let mut biases = vec![f16::ZERO; rows * groups_per_row];
    let mut report = QuantizationReport::default();

    if rows > 0 && columns > 0 {
        let stats: Vec<RowStats> = if config.parallel && values.len() >= PARALLEL_THRESHOLD {
            codes
                .par_chunks_mut(words_per_row)
                .zip(scales.par_chunks_mut(groups_per_row))
                .zip(biases.par_chunks_mut(groups_per_row))
                .zip(values.par_chunks(columns))
                .enumerate()
                .map(|(row, (((c, s), b), v))| compress_row(v, row, config, c, s, b))
                .collect::<Result<_>>()?
        } else {
            codes
                .chunks_mut(words_per_row)
                .zip(scales.chunks_mut(groups_per_row))
                .zip(biases.chunks_mut(groups_per_row))
                .zip(values.chunks(columns))
                .enumerate()
                .map(|(row, (((c, s), b), v))| compress_row(v, row, config, c, s, b))
                .collect::<Result<_>>()?
        };
        for row in stats {
            report.absorb(row);
        }
    }

    if !values.is_empty() {
        #[allow(clippy::cast_precision_loss)]
        let numel = values.len() as f64;
        report.clipped_outlier_loss /= numel;
    }
    if report.degenerate_groups > 0 {
        tracing::debug!(
            degenerate_groups = report.degenerate_groups,
            groups = report.groups,
            "zero-range groups stored with unit scale"
        );
    }

    Ok(Compressed {
        packed: PackedMatrix {
            codes,
            scales,
            biases,
            rows,
            columns,
            group_size,
        },
        report,
    })
}

/// Quantize one row. Scale, bias and codes of a group are all computed before
/// anything for that group is written.
fn compress_row(
    row_values: &[f32],
    row: usize,
    config: &QuantizationConfig,
    codes: &mut [u16],
    scales: &mut [f16],
    biases: &mut [f16],
) -> Result<RowStats> {
    let group_size = config.group_size;
    let words_per_group = group_size / CODES_PER_WORD;
    let mut stats = RowStats::default();
    let mut scratch = Vec::new();

    for (group, values) in row_values.chunks_exact(group_size).enumerate() {
        let (min, max) = finite_min_max(values).map_err(|offset| {
            GroupQuantError::NonFiniteValue {
                row,
                column: group * group_size + offset,
            }
        })?;

        let (lo, hi) = match config.range {
            RangeSelection::MinMax => (min, max),
            RangeSelection::Percentile { lower, upper } => {
                let (lo, hi) = percentile_range(values, lower, upper, &mut scratch);
                for &v in values {
                    let clamped = v.clamp(lo, hi);
                    if clamped != v {
                        stats.clipped += 1;
                        stats.clipped_loss += f64::from((v - clamped).abs());
                    }
                }
                (lo, hi)
            }
        };

        let (scale, bias, degenerate) = group_params(lo, hi).ok_or_else(|| {
            GroupQuantError::ValueOutOfRange(format!(
                "group {group} of row {row} spans [{lo}, {hi}], beyond f16 range"
            ))
        })?;
        stats.groups += 1;
        stats.degenerate += usize::from(degenerate);

        let (scale_f, bias_f) = (scale.to_f32(), bias.to_f32());
        let words = &mut codes[group * words_per_group..(group + 1) * words_per_group];
        if degenerate {
            // Everything collapses onto the bias, including clipped outliers.
            words.fill(0);
        } else {
            let bin = |v: f32| bin_index(v.clamp(lo, hi), scale_f, bias_f);
            for (word, quad) in words.iter_mut().zip(values.chunks_exact(CODES_PER_WORD)) {
                *word = pack_word([bin(quad[0]), bin(quad[1]), bin(quad[2]), bin(quad[3])]);
            }
        }
        scales[group] = scale;
        biases[group] = bias;
    }

    Ok(stats)
}

/// Min and max of a group, or the offset of the first non-finite value.
fn finite_min_max(values: &[f32]) -> std::result::Result<(f32, f32), usize> {
    let mut min = f32::INFINITY;
    let mut max = f32::NEG_INFINITY;
    for (i, &v) in values.iter().enumerate() {
        if !v.is_finite() {
            return Err(i);
        }
        min = min.min(v);
        max = max.max(v);
    }
    Ok((min, max))
}

#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn percentile_range(values: &[f32], lower: f32, upper: f32, scratch: &mut Vec<f32>) -> (f32, f32) {
    scratch.clear();
    scratch.extend_from_slice(values);
    scratch.sort_unstable_by(f32::total_cmp);
    let last = (scratch.len() - 1) as f32;
    let at = |p: f32| scratch[((p / 100.0) * last).round() as usize];
    (at(lower), at(upper))
}

/// Stored `(scale, bias, degenerate)` for a group spanning `[lo, hi]`.
fn group_params(lo: f32, hi: f32) -> Option<(f16, f16, bool)> {
    if hi <= lo {
        let bias = f16::from_f32(lo);
        return bias.is_finite().then_some((f16::ONE, bias, true));
    }
    let bias = f16_floor(lo)?;
    let scale = f16_ceil((hi - bias.to_f32()) / f32::from(MAX_BIN))?;
    Some((scale, bias, false))
}

#[inline]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn bin_index(value: f32, scale: f32, bias: f32) -> u8 {
    ((value - bias) / scale).round().clamp(0.0, f32::from(MAX_BIN)) as u8
}

/// Decompress a packed matrix into a new row-major buffer.
#[must_use]
pub fn decompress(packed: &PackedMatrix) -> Vec<f32> {
    let mut out = vec![0.0f32; packed.numel()];
    fill(packed, &mut out);
    out
}

/// Decompress into a caller-provided buffer of exactly `rows * columns` values.
///
/// # Errors
/// Returns `ShapeMismatch` if the buffer has the wrong length.
pub fn decompress_into(packed: &PackedMatrix, out: &mut [f32]) -> Result<()> {
    if out.len() != packed.numel() {
        return Err(GroupQuantError::ShapeMismatch {
            expected: packed.shape().to_vec(),
            actual: vec![out.len()],
        });
    }
    fill(packed, out);
    Ok(())
}

/// Decompress a single row, or `None` if `row` is out of range.
#[must_use]
pub fn decompress_row(packed: &PackedMatrix, row: usize) -> Option<Vec<f32>> {
    if row >= packed.rows {
        return None;
    }
    let mut out = vec![0.0f32; packed.columns];
    fill_row(packed, row, &mut out);
    Some(out)
}

fn fill(packed: &PackedMatrix, out: &mut [f32]) {
    if packed.columns == 0 {
        return;
    }
    if out.len() >= PARALLEL_THRESHOLD {
        out.par_chunks_mut(packed.columns)
            .enumerate()
            .for_each(|(row, dst)| fill_row(packed, row, dst));
    } else {
        out.chunks_mut(packed.columns)
            .enumerate()
            .for_each(|(row, dst)| fill_row(packed, row, dst));
    }
}

#[inline]
fn fill_row(packed: &PackedMatrix, row: usize, dst: &mut [f32]) {
    let words_per_group = packed.group_size / CODES_PER_WORD;
    let groups_per_row = packed.groups_per_row();
    let meta = row * groups_per_row;
    let groups = packed
        .codes_row(row)
        .chunks_exact(words_per_group)
        .zip(dst.chunks_exact_mut(packed.group_size))
        .zip(&packed.scales[meta..meta + groups_per_row])
        .zip(&packed.biases[meta..meta + groups_per_row]);

    for (((words, out), scale), bias) in groups {
        let (scale, bias) = (scale.to_f32(), bias.to_f32());
        for (&word, quad) in words.iter().zip(out.chunks_exact_mut(CODES_PER_WORD)) {
            let c = unpack_word(word);
            quad[0] = f32::from(c[0]) * scale + bias;
            quad[1] = f32::from(c[1]) * scale + bias;
            quad[2] = f32::from(c[2]) * scale + bias;
            quad[3] = f32::from(c[3]) * scale + bias;
        }
    }
}

/// Quantize a 2-D tensor. Non-f32 tensors are converted to f32 first.
///
/// # Errors
/// Returns `InvalidConfig` for tensors that are not 2-D, plus any error from
/// [`compress_with_config`].
pub fn quantize_tensor(tensor: &Tensor, config: &QuantizationConfig) -> Result<Compressed> {
    let dims = tensor.dims();
    if dims.len() != 2 {
        return Err(GroupQuantError::InvalidConfig(format!(
            "only 2-D weights can be quantized, got shape {dims:?}"
        )));
    }
    let (rows, columns) = (dims[0], dims[1]);
    let flat = tensor
        .to_dtype(DType::F32)?
        .flatten_all()?
        .to_vec1::<f32>()?;
    compress_with_config(&flat, rows, columns, config)
}

/// Dequantize to an f32 tensor of the original shape.
///
/// # Errors
/// Returns error if the tensor cannot be created on `device`.
pub fn dequantize_tensor(packed: &PackedMatrix, device: &Device) -> Result<Tensor> {
    let tensor = Tensor::from_vec(decompress(packed), (packed.rows, packed.columns), device)?;
    Ok(tensor)
}

/// Dequantize and cast to the given compute dtype.
///
/// # Errors
/// Returns error if tensor creation or the cast fails.
pub fn dequantize_tensor_with_dtype(
    packed: &PackedMatrix,
    device: &Device,
    dtype: ComputeDType,
) -> Result<Tensor> {
    let tensor = dequantize_tensor(packed, device)?;
    match dtype {
        ComputeDType::F32 => Ok(tensor),
        other => Ok(tensor.to_dtype(other.into())?),
    }
}
