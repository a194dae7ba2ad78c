//! GPU kernels for group-wise 4-bit quantization using CubeCL.
//!
//! Available with the `cuda` feature. The kernels produce the same packed word
//! layout as the CPU codec in [`crate::quantization`]; the host computes the
//! `f16` scale and bias from the per-group range returned by
//! `group4_minmax_kernel`.
//!
//! # Example
//!
//! ```ignore
//! use groupq_rs::kernels::group4_dequantize_kernel;
//! use cubecl::prelude::*;
//!
//! unsafe {
//!     group4_dequantize_kernel::launch_unchecked::<f32, CudaRuntime>(
//!         &client,
//!         cube_count,
//!         cube_dim,
//!         words_arg,
//!         scales_arg,
//!         biases_arg,
//!         output_arg,
//!         group_size,   // comptime
//!         num_elements, // comptime
//!     );
//! }
//! ```

#[cfg(feature = "cuda")]
pub mod group4;

#[cfg(feature = "cuda")]
pub use group4::{group4_dequantize_kernel, group4_minmax_kernel, group4_quantize_kernel};

/// Units per cube when launching the group kernels.
pub const DEFAULT_CUBE_DIM: u32 = 256;

/// Number of cubes needed to cover `units` work items.
#[must_use]
pub fn cube_count_for(units: u32) -> u32 {
    units.div_ceil(DEFAULT_CUBE_DIM)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cube_count_rounds_up() {
        assert_eq!(cube_count_for(0), 0);
        assert_eq!(cube_count_for(1), 1);
        assert_eq!(cube_count_for(256), 1);
        assert_eq!(cube_count_for(257), 2);
    }
}
