//! Storage cost and accuracy trade-offs across group sizes.
//!
//! Smaller groups follow the local value distribution more closely but pay 32
//! bits of metadata per group; the metadata-to-payload ratio for group size `n`
//! is `32 : 4n`, i.e. an overhead fraction of `8 / n`.

use serde::{Deserialize, Serialize};

use crate::error::{GroupQuantError, Result};
use crate::quantization::{compress_with_config, decompress, validate_group_size, QuantizationConfig};

/// Bits per element for the packed codes.
pub const CODE_BITS: usize = 4;

/// Bits of metadata per group (f16 scale + f16 bias).
pub const GROUP_METADATA_BITS: usize = 32;

/// Bits per element of the uncompressed (f16) weights.
pub const DENSE_BITS: usize = 16;

/// Packed size in bits of a `rows x columns` matrix at group size `n`.
///
/// # Errors
/// Returns `InvalidGroupSize` if `n` cannot be used with `columns`.
pub fn storage_bits(rows: usize, columns: usize, group_size: usize) -> Result<usize> {
    validate_group_size(columns, group_size)?;
    let groups = rows * columns / group_size;
    Ok(rows * columns * CODE_BITS + groups * GROUP_METADATA_BITS)
}

/// Uncompressed f16 size in bits.
#[must_use]
pub fn dense_bits(rows: usize, columns: usize) -> usize {
    rows * columns * DENSE_BITS
}

/// Metadata bits relative to payload bits: `8 / n`.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn overhead_fraction(group_size: usize) -> f64 {
    (GROUP_METADATA_BITS as f64) / (CODE_BITS * group_size) as f64
}

/// Dense-over-packed size ratio; approaches 4 as the group size grows.
///
/// # Errors
/// Returns `InvalidGroupSize` if `n` cannot be used with `columns`.
#[allow(clippy::cast_precision_loss)]
pub fn compression_ratio(rows: usize, columns: usize, group_size: usize) -> Result<f64> {
    let packed = storage_bits(rows, columns, group_size)?;
    if packed == 0 {
        return Ok(1.0);
    }
    Ok(dense_bits(rows, columns) as f64 / packed as f64)
}

/// Reconstruction error between two equally long buffers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorMetrics {
    /// Largest absolute error.
    pub max_abs: f32,
    /// Mean absolute error.
    pub mean_abs: f64,
    /// Root mean square error.
    pub rmse: f64,
    /// Signal-to-noise ratio in dB; infinite for an exact reconstruction.
    pub snr_db: f64,
}

impl ErrorMetrics {
    /// Compare `original` with `restored`.
    ///
    /// # Errors
    /// Returns `ShapeMismatch` if the lengths differ.
    #[allow(clippy::cast_precision_loss)]
    pub fn between(original: &[f32], restored: &[f32]) -> Result<Self> {
        if original.len() != restored.len() {
            return Err(GroupQuantError::ShapeMismatch {
                expected: vec![original.len()],
                actual: vec![restored.len()],
            });
        }
        if original.is_empty() {
            return Ok(Self::default());
        }

        let mut max_abs = 0.0f32;
        let mut sum_abs = 0.0f64;
        let mut sum_sq = 0.0f64;
        let mut signal = 0.0f64;
        for (&o, &r) in original.iter().zip(restored) {
            let err = (o - r).abs();
            max_abs = max_abs.max(err);
            sum_abs += f64::from(err);
            sum_sq += f64::from(err) * f64::from(err);
            signal += f64::from(o) * f64::from(o);
        }
        let n = original.len() as f64;
        let mse = sum_sq / n;
        let snr_db = if mse == 0.0 {
            f64::INFINITY
        } else {
            10.0 * ((signal / n) / mse).log10()
        };

        Ok(Self {
            max_abs,
            mean_abs: sum_abs / n,
            rmse: mse.sqrt(),
            snr_db,
        })
    }
}

/// One point of the size/accuracy curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TradeoffPoint {
    /// Group size.
    pub group_size: usize,
    /// Packed size in bits.
    pub storage_bits: usize,
    /// Average bits per weight including metadata.
    pub bits_per_weight: f64,
    /// Dense f16 size over packed size.
    pub compression_ratio: f64,
    /// Metadata over payload, `8 / n`.
    pub overhead_fraction: f64,
    /// Reconstruction error at this group size.
    pub error: ErrorMetrics,
}

/// Quantize `values` at each group size and measure size and error.
///
/// Points are returned in the order of `group_sizes`.
///
/// # Errors
/// Fails on the first group size that cannot be used with `columns`, or if
/// compression itself fails.
#[allow(clippy::cast_precision_loss)]
pub fn sweep_group_sizes(
    values: &[f32],
    rows: usize,
    columns: usize,
    group_sizes: &[usize],
) -> Result<Vec<TradeoffPoint>> {
    let mut points = Vec::with_capacity(group_sizes.len());
    for &group_size in group_sizes {
        let compressed = compress_with_config(
            values,
            rows,
            columns,
            &QuantizationConfig::with_group_size(group_size),
        )?;
        let restored = decompress(&compressed.packed);
        let bits = compressed.packed.storage_bits();
        let numel = (rows * columns).max(1) as f64;
        let point = TradeoffPoint {
            group_size,
            storage_bits: bits,
            bits_per_weight: bits as f64 / numel,
            compression_ratio: compression_ratio(rows, columns, group_size)?,
            overhead_fraction: overhead_fraction(group_size),
            error: ErrorMetrics::between(values, &restored)?,
        };
        tracing::debug!(
            group_size,
            bits_per_weight = point.bits_per_weight,
            rmse = point.error.rmse,
            "measured group size"
        );
        points.push(point);
    }
    Ok(points)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_overhead_fraction_values() {
        assert_relative_eq!(overhead_fraction(16), 0.5);
        assert_relative_eq!(overhead_fraction(64), 0.125);
        assert_relative_eq!(overhead_fraction(256), 0.031_25);
    }

    #[test]
    fn test_storage_bits_per_group() {
        // one group of n: 4n + 32 bits
        assert_eq!(storage_bits(1, 64, 64).unwrap(), 4 * 64 + 32);
        assert_eq!(storage_bits(3, 128, 32).unwrap(), 3 * (4 * 128 + 4 * 32));
    }

    #[test]
    fn test_storage_strictly_decreases_with_group_size() {
        let sizes = [4, 8, 16, 32, 64, 128, 256, 512, 1024];
        let bits: Vec<usize> = sizes
            .iter()
            .map(|&n| storage_bits(16, 1024, n).unwrap())
            .collect();
        for pair in bits.windows(2) {
            assert!(pair[1] < pair[0], "{bits:?}");
        }
    }

    #[test]
    fn test_compression_ratio_approaches_four() {
        let small = compression_ratio(8, 1024, 16).unwrap();
        let large = compression_ratio(8, 1024, 1024).unwrap();
        assert!(small < large);
        assert!(large < 4.0);
        assert!(large > 3.9);
    }

    #[test]
    fn test_storage_bits_rejects_invalid() {
        assert!(storage_bits(1, 100, 8).is_err());
        assert!(storage_bits(1, 96, 0).is_err());
    }

    #[test]
    fn test_error_metrics_exact() {
        let m = ErrorMetrics::between(&[1.0, 2.0], &[1.0, 2.0]).unwrap();
        assert_eq!(m.max_abs, 0.0);
        assert!(m.snr_db.is_infinite());
    }

    #[test]
    fn test_error_metrics_values() {
        let m = ErrorMetrics::between(&[1.0, -1.0], &[1.5, -1.0]).unwrap();
        assert_relative_eq!(m.max_abs, 0.5);
        assert_relative_eq!(m.mean_abs, 0.25);
        assert_relative_eq!(m.rmse, (0.125f64).sqrt());
        assert!(ErrorMetrics::between(&[1.0], &[]).is_err());
    }

    #[test]
    fn test_sweep_smaller_groups_are_more_accurate() {
        let rows = 16;
        let columns = 256;
        let values: Vec<f32> = (0..rows * columns)
            .map(|i| {
                let x = i as f32;
                (x * 0.013).sin() * (1.0 + (x * 0.0007).cos() * 4.0)
            })
            .collect();
        let points = sweep_group_sizes(&values, rows, columns, &[16, 256]).unwrap();

        assert_eq!(points.len(), 2);
        assert!(points[0].error.rmse < points[1].error.rmse);
        assert!(points[0].storage_bits > points[1].storage_bits);
        assert_relative_eq!(points[0].bits_per_weight, 6.0);
        assert_relative_eq!(points[1].bits_per_weight, 4.125);
    }

    #[test]
    fn test_sweep_fails_on_invalid_size() {
        let values = vec![0.0f32; 96];
        assert!(sweep_group_sizes(&values, 1, 96, &[32, 64]).is_err());
    }
}
