//! Group-wise 4-bit GPU kernels using CubeCL.
//!
//! Layout matches the CPU codec: the code for column `4w + i` of a row lives in
//! bits `4i..4i+4` of word `w`. GPU buffers hold one 16-bit word per `u32`
//! element (upper half zero). Scale and bias are carried as `F`; the host
//! narrows them to `f16` with directed rounding before storing.

use cubecl::prelude::*;

/// Largest 4-bit code.
pub const GROUP4_MAX_BIN: f32 = 15.0;

/// Codes per packed word.
pub const GROUP4_CODES_PER_WORD: u32 = 4;

/// Per-group minimum and maximum. One unit per group.
#[cube(launch)]
pub fn group4_minmax_kernel<F: Float + CubeElement>(
    input: &Array<F>,
    mins: &mut Array<F>,
    maxs: &mut Array<F>,
    #[comptime] group_size: u32,
    #[comptime] num_groups: u32,
) {
    let group_idx = ABSOLUTE_POS;

    if group_idx >= num_groups as usize {
        terminate!();
    }

    let start = group_idx * (group_size as usize);
    let end = start + (group_size as usize);

    let mut min_val = input[start];
    let mut max_val = input[start];
    for i in start..end {
        let val = input[i];
        if val < min_val {
            min_val = val;
        }
        if val > max_val {
            max_val = val;
        }
    }

    mins[group_idx] = min_val;
    maxs[group_idx] = max_val;
}

/// Pack one word (four codes) per unit against precomputed scale and bias.
#[cube(launch)]
pub fn group4_quantize_kernel<F: Float + CubeElement>(
    input: &Array<F>,
    scales: &Array<F>,
    biases: &Array<F>,
    output: &mut Array<u32>,
    #[comptime] group_size: u32,
    #[comptime] num_elements: u32,
) {
    let word_idx = ABSOLUTE_POS;
    let in_base = word_idx * 4usize;

    if in_base >= num_elements as usize {
        terminate!();
    }

    let group_idx = in_base / (group_size as usize);
    let scale = scales[group_idx];
    let bias = biases[group_idx];
    let max_bin = F::new(15.0);

    let mut packed: u32 = 0u32;

    #[unroll]
    for i in 0usize..4usize {
        let normalized = (input[in_base + i] - bias) / scale;
        let clamped = if normalized < F::new(0.0) {
            F::new(0.0)
        } else if normalized > max_bin {
            max_bin
        } else {
            normalized
        };
        // Non-negative, so truncation after +0.5 rounds to nearest.
        let code = u32::cast_from(clamped + F::new(0.5));
        packed = packed | ((code & 0xFu32) << ((i * 4usize) as u32));
    }

    output[word_idx] = packed;
}

/// Reconstruct one value per unit as `bias + code * scale`.
#[cube(launch)]
pub fn group4_dequantize_kernel<F: Float + CubeElement>(
    input: &Array<u32>,
    scales: &Array<F>,
    biases: &Array<F>,
    output: &mut Array<F>,
    #[comptime] group_size: u32,
    #[comptime] num_elements: u32,
) {
    let idx = ABSOLUTE_POS;

    if idx >= num_elements as usize {
        terminate!();
    }

    let word = input[idx / 4usize];
    let sub_idx = idx % 4usize;
    let code = (word >> ((sub_idx * 4usize) as u32)) & 0xFu32;

    let group_idx = idx / (group_size as usize);
    output[idx] = biases[group_idx] + F::cast_from(code) * scales[group_idx];
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packing::{CODES_PER_WORD, MAX_BIN};

    #[test]
    fn test_constants_match_cpu_codec() {
        assert_eq!(GROUP4_CODES_PER_WORD as usize, CODES_PER_WORD);
        assert!((GROUP4_MAX_BIN - f32::from(MAX_BIN)).abs() < f32::EPSILON);
    }
}
