//! Scoped inference session over a packed checkpoint.
//!
//! Attaching a session acquires the device and builds one [`QuantizedLinear`]
//! per 2-D weight (materializing dequantized caches when the configuration asks
//! for it). Resources are released by [`InferenceSession::detach`] or, failing
//! that, when the session goes out of scope.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use candle_core::{Device, Tensor};

use crate::checkpoint::{PackedCheckpoint, PackedTensor};
use crate::config::PipelineConfig;
use crate::error::{GroupQuantError, Result};
use crate::linear::QuantizedLinear;

/// What a session did before it was released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSummary {
    /// Number of layers the session held.
    pub layers: usize,
    /// Forward calls served.
    pub forward_calls: u64,
    /// Bytes held by the layers at release.
    pub released_bytes: usize,
    /// Time between attach and release.
    pub lifetime: Duration,
}

/// Layers of a packed checkpoint bound to a device.
#[derive(Debug)]
pub struct InferenceSession {
    model_name: String,
    device: Device,
    layers: Vec<(String, QuantizedLinear)>,
    forward_calls: AtomicU64,
    attached_at: Instant,
    released: bool,
}

impl InferenceSession {
    /// Attach to `device` and build every layer of `checkpoint`.
    ///
    /// A 2-D entry named `<prefix>.weight` becomes layer `<prefix>` and picks up
    /// a dense 1-D `<prefix>.bias` if present. Other 2-D entries become layers
    /// under their own name. Everything else is ignored.
    ///
    /// # Errors
    /// Returns `InvalidConfig` if the checkpoint was packed with a different
    /// group size than `config` names, or any error from building a layer.
    pub fn attach(
        checkpoint: &PackedCheckpoint,
        config: &PipelineConfig,
        device: &Device,
    ) -> Result<Self> {
        config.validate()?;
        if checkpoint.group_size != config.group_size() {
            return Err(GroupQuantError::InvalidConfig(format!(
                "checkpoint {} was packed with group size {}, config asks for {}",
                checkpoint.id,
                checkpoint.group_size,
                config.group_size()
            )));
        }

        let mut layers = Vec::new();
        for (name, entry) in &checkpoint.entries {
            if entry.dims().len() != 2 {
                continue;
            }
            let layer_name = name.strip_suffix(".weight").unwrap_or(name);
            let bias = match checkpoint.get(&format!("{layer_name}.bias")) {
                Some(PackedTensor::Dense(b)) if b.rank() == 1 => Some(b.clone()),
                _ => None,
            };
            let layer = QuantizedLinear::from_entry(entry, bias, config, device)?;
            layers.push((layer_name.to_string(), layer));
        }

        let session = Self {
            model_name: checkpoint.model_name.clone(),
            device: device.clone(),
            layers,
            forward_calls: AtomicU64::new(0),
            attached_at: Instant::now(),
            released: false,
        };
        tracing::info!(
            model = %session.model_name,
            layers = session.layers.len(),
            bytes = session.memory_bytes(),
            cached = config.cache_dequantized,
            "attached inference session"
        );
        Ok(session)
    }

    /// Run one layer.
    ///
    /// # Errors
    /// Returns `MissingTensor` for an unknown layer, or any forward error.
    pub fn forward(&self, layer: &str, input: &Tensor) -> Result<Tensor> {
        let linear = self
            .layer(layer)
            .ok_or_else(|| GroupQuantError::MissingTensor(layer.to_string()))?;
        let output = linear.forward(input)?;
        self.forward_calls.fetch_add(1, Ordering::Relaxed);
        Ok(output)
    }

    /// Look up a layer.
    #[must_use]
    pub fn layer(&self, name: &str) -> Option<&QuantizedLinear> {
        self.layers.iter().find(|(n, _)| n == name).map(|(_, l)| l)
    }

    /// Layer names in checkpoint order.
    pub fn layer_names(&self) -> impl Iterator<Item = &str> {
        self.layers.iter().map(|(n, _)| n.as_str())
    }

    /// Device the session is attached to.
    #[must_use]
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Bytes currently held by all layers.
    #[must_use]
    pub fn memory_bytes(&self) -> usize {
        self.layers.iter().map(|(_, l)| l.memory_bytes()).sum()
    }

    /// Release all layers and report what the session did.
    #[must_use = "the summary is the only record of the session"]
    pub fn detach(mut self) -> SessionSummary {
        self.release()
    }

    fn release(&mut self) -> SessionSummary {
        let summary = SessionSummary {
            layers: self.layers.len(),
            forward_calls: self.forward_calls.load(Ordering::Relaxed),
            released_bytes: self.memory_bytes(),
            lifetime: self.attached_at.elapsed(),
        };
        self.layers.clear();
        self.released = true;
        tracing::info!(
            model = %self.model_name,
            layers = summary.layers,
            forward_calls = summary.forward_calls,
            released_bytes = summary.released_bytes,
            "released inference session"
        );
        summary
    }
}

impl Drop for InferenceSession {
    fn drop(&mut self) {
        if !self.released {
            tracing::debug!(model = %self.model_name, "session dropped without detach");
            let _ = self.release();
        }
    }
}
