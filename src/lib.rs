//! # groupq-rs
//!
//! 4-bit group quantization for LLM weight checkpoints.
//!
//! This crate provides:
//! - A group-wise 4-bit codec with per-group f16 scale and bias
//! - Storage and error analysis for choosing a group size
//! - Checkpoint packing, caching and a native on-disk format
//! - A quantized linear layer and a scoped inference session on candle
//!
//! ## Quick Start
//!
//! ```rust
//! use groupq_rs::{compress, decompress};
//!
//! let values: Vec<f32> = (0..64).map(|i| i as f32 / 63.0).collect();
//! let packed = compress(&values, 1, 64, 64)?;
//! let restored = decompress(&packed);
//!
//! let bound = packed.scale(0, 0) / 2.0 + 1e-6;
//! assert!(values.iter().zip(&restored).all(|(a, b)| (a - b).abs() <= bound));
//! # Ok::<(), groupq_rs::GroupQuantError>(())
//! ```
//!
//! ## Storage
//!
//! Every value costs 4 bits, and every group of `n` values adds 32 bits of
//! scale and bias, so a weight costs `4 + 32 / n` bits. Smaller groups track
//! local ranges more closely at the price of more metadata.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod analysis;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod kernels;
pub mod linear;
pub mod native;
pub mod packing;
pub mod quantization;
pub mod session;

pub use analysis::{sweep_group_sizes, ErrorMetrics, TradeoffPoint};
pub use checkpoint::{
    pack_checkpoint, Checkpoint, PackedCheckpoint, PackedCheckpointCache, PackedTensor,
};
pub use config::PipelineConfig;
pub use error::{GroupQuantError, Result};
pub use linear::QuantizedLinear;
pub use native::{read_packed_checkpoint, write_packed_checkpoint};
pub use quantization::{
    compress, compress_with_config, decompress, decompress_into, decompress_row,
    dequantize_tensor, dequantize_tensor_with_dtype, quantize_tensor, validate_group_size,
    ComputeDType, Compressed, PackedMatrix, QuantizationConfig, QuantizationReport,
    RangeSelection,
};
pub use session::{InferenceSession, SessionSummary};
