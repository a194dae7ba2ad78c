//! Packing whole checkpoints.
//!
//! A [`Checkpoint`] is an ordered set of named full-precision tensors. Packing
//! turns every selected 2-D weight into a [`PackedMatrix`] and keeps everything
//! else (biases, norms, embeddings outside `target_modules`) dense.

use std::collections::HashMap;
use std::sync::Arc;

use candle_core::Tensor;

use crate::config::PipelineConfig;
use crate::error::{GroupQuantError, Result};
use crate::quantization::{
    quantize_tensor, validate_group_size, ComputeDType, PackedMatrix, QuantizationReport,
};

/// Named full-precision tensors, in insertion order.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    id: String,
    tensors: Vec<(String, Tensor)>,
}

impl Checkpoint {
    /// Create an empty checkpoint. `id` identifies it in caches.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tensors: Vec::new(),
        }
    }

    /// Checkpoint identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Add or replace a tensor.
    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) {
        let name = name.into();
        match self.tensors.iter_mut().find(|(n, _)| *n == name) {
            Some((_, slot)) => *slot = tensor,
            None => self.tensors.push((name, tensor)),
        }
    }

    /// Builder form of [`Self::insert`].
    #[must_use]
    pub fn with_tensor(mut self, name: impl Into<String>, tensor: Tensor) -> Self {
        self.insert(name, tensor);
        self
    }

    /// Look up a tensor by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.iter().find(|(n, _)| n == name).map(|(_, t)| t)
    }

    /// Iterate over `(name, tensor)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.tensors.iter().map(|(n, t)| (n.as_str(), t))
    }

    /// Number of tensors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    /// `true` if the checkpoint holds no tensors.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }
}

/// One entry of a packed checkpoint.
#[derive(Debug, Clone)]
pub enum PackedTensor {
    /// Group-quantized 2-D weight.
    Packed(PackedMatrix),
    /// Tensor kept in full precision.
    Dense(Tensor),
}

impl PackedTensor {
    /// Shape of the tensor this entry represents.
    #[must_use]
    pub fn dims(&self) -> Vec<usize> {
        match self {
            Self::Packed(p) => p.shape().to_vec(),
            Self::Dense(t) => t.dims().to_vec(),
        }
    }

    /// The packed matrix, if this entry is packed.
    #[must_use]
    pub fn as_packed(&self) -> Option<&PackedMatrix> {
        match self {
            Self::Packed(p) => Some(p),
            Self::Dense(_) => None,
        }
    }

    /// Memory size in bytes (dense entries counted at their element size).
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        match self {
            Self::Packed(p) => p.size_bytes(),
            Self::Dense(t) => t.elem_count() * t.dtype().size_in_bytes(),
        }
    }
}

/// A checkpoint after packing.
#[derive(Debug, Clone)]
pub struct PackedCheckpoint {
    /// Identifier of the source checkpoint.
    pub id: String,
    /// Model name from the pipeline configuration.
    pub model_name: String,
    /// Group size used, `0` if nothing was packed.
    pub group_size: usize,
    /// Compute dtype consumers should dequantize to.
    pub compute_dtype: ComputeDType,
    /// Entries in source order.
    pub entries: Vec<(String, PackedTensor)>,
    /// Counters accumulated over all packed tensors.
    pub report: QuantizationReport,
}

impl PackedCheckpoint {
    /// Look up an entry by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&PackedTensor> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, t)| t)
    }

    /// Look up an entry by name, failing if absent.
    ///
    /// # Errors
    /// Returns `MissingTensor` if no entry has this name.
    pub fn require(&self, name: &str) -> Result<&PackedTensor> {
        self.get(name)
            .ok_or_else(|| GroupQuantError::MissingTensor(name.to_string()))
    }

    /// Number of packed (as opposed to dense) entries.
    #[must_use]
    pub fn packed_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|(_, t)| matches!(t, PackedTensor::Packed(_)))
            .count()
    }

    /// Total size of all entries in bytes.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.entries.iter().map(|(_, t)| t.size_bytes()).sum()
    }
}

/// Pack every selected 2-D tensor of `checkpoint`.
///
/// All selected tensors are checked against the group size before any of them
/// is quantized, so an incompatible shape fails the call without partial work.
/// A group size of `0` returns the checkpoint with every entry dense.
///
/// # Errors
/// Returns `InvalidGroupSize` for an incompatible weight, or any codec error.
pub fn pack_checkpoint(checkpoint: &Checkpoint, config: &PipelineConfig) -> Result<PackedCheckpoint> {
    config.validate()?;
    let group_size = config.group_size();
    let selected = |name: &str, tensor: &Tensor| {
        group_size != 0 && tensor.rank() == 2 && config.is_target(name)
    };

    for (name, tensor) in checkpoint.iter() {
        if selected(name, tensor) {
            validate_group_size(tensor.dims()[1], group_size).inspect_err(|e| {
                tracing::error!(tensor = name, error = %e, "weight cannot be packed");
            })?;
        }
    }

    let mut report = QuantizationReport::default();
    let mut packed_numel = 0usize;
    let mut entries = Vec::with_capacity(checkpoint.len());
    for (name, tensor) in checkpoint.iter() {
        let entry = if selected(name, tensor) {
            let compressed = quantize_tensor(tensor, &config.quantization)?;
            if compressed.report.degenerate_groups > 0 {
                tracing::warn!(
                    tensor = name,
                    degenerate_groups = compressed.report.degenerate_groups,
                    "zero-range groups in weight"
                );
            }
            tracing::debug!(
                tensor = name,
                shape = ?tensor.dims(),
                bytes = compressed.packed.size_bytes(),
                "packed weight"
            );
            merge_report(&mut report, &compressed.report, tensor.elem_count());
            packed_numel += tensor.elem_count();
            PackedTensor::Packed(compressed.packed)
        } else {
            PackedTensor::Dense(tensor.clone())
        };
        entries.push((name.to_string(), entry));
    }
    if packed_numel > 0 {
        #[allow(clippy::cast_precision_loss)]
        let numel = packed_numel as f64;
        report.clipped_outlier_loss /= numel;
    }

    let packed = PackedCheckpoint {
        id: checkpoint.id().to_string(),
        model_name: config.model_name.clone(),
        group_size,
        compute_dtype: config.compute_dtype,
        entries,
        report,
    };
    tracing::info!(
        checkpoint = %packed.id,
        group_size,
        packed = packed.packed_count(),
        total = packed.entries.len(),
        bytes = packed.size_bytes(),
        "packed checkpoint"
    );
    Ok(packed)
}

// Per-tensor losses are means; weight them by element count so the checkpoint
// figure is a mean over all packed elements.
#[allow(clippy::cast_precision_loss)]
fn merge_report(total: &mut QuantizationReport, part: &QuantizationReport, numel: usize) {
    total.groups += part.groups;
    total.degenerate_groups += part.degenerate_groups;
    total.clipped_values += part.clipped_values;
    total.clipped_outlier_loss += part.clipped_outlier_loss * numel as f64;
}

// Everything recorded in a `PackedCheckpoint` must match for a cache hit;
// `cache_dequantized` only affects sessions.
fn packs_identically(a: &PipelineConfig, b: &PipelineConfig) -> bool {
    a.quantization == b.quantization
        && a.target_modules == b.target_modules
        && a.compute_dtype == b.compute_dtype
        && a.model_name == b.model_name
}

/// Packed checkpoints memoised by `(checkpoint id, group size)`.
///
/// A hit is only served if the rest of the quantization settings match the ones
/// the entry was packed with; otherwise the entry is repacked and replaced.
#[derive(Debug, Default)]
pub struct PackedCheckpointCache {
    entries: HashMap<(String, usize), (PipelineConfig, Arc<PackedCheckpoint>)>,
}

impl PackedCheckpointCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached packed checkpoint or pack and insert it.
    ///
    /// # Errors
    /// Returns any error from [`pack_checkpoint`]; nothing is cached on error.
    pub fn get_or_pack(
        &mut self,
        checkpoint: &Checkpoint,
        config: &PipelineConfig,
    ) -> Result<Arc<PackedCheckpoint>> {
        let key = (checkpoint.id().to_string(), config.group_size());
        if let Some((packed_with, packed)) = self.entries.get(&key) {
            if packs_identically(packed_with, config) {
                tracing::debug!(checkpoint = %key.0, group_size = key.1, "packed checkpoint cache hit");
                return Ok(Arc::clone(packed));
            }
            tracing::debug!(checkpoint = %key.0, group_size = key.1, "settings changed, repacking");
        }
        let packed = Arc::new(pack_checkpoint(checkpoint, config)?);
        self.entries
            .insert(key, (config.clone(), Arc::clone(&packed)));
        Ok(packed)
    }

    /// Whether an entry exists for this key.
    #[must_use]
    pub fn contains(&self, checkpoint_id: &str, group_size: usize) -> bool {
        self.entries
            .contains_key(&(checkpoint_id.to_string(), group_size))
    }

    /// Drop every entry for a checkpoint; returns how many were removed.
    pub fn evict(&mut self, checkpoint_id: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(id, _), _| id != checkpoint_id);
        before - self.entries.len()
    }

    /// Number of cached packed checkpoints.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` if nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
