//! # Group Size Sweep
//!
//! Quantizes a synthetic weight matrix at several group sizes and prints the
//! storage cost next to the reconstruction error, then packs a small checkpoint
//! and serves one layer from it.
//!
//! Run with `RUST_LOG=groupq_rs=debug` to see per-step logging.

use anyhow::Result;
use candle_core::{Device, Tensor};
use groupq_rs::{
    pack_checkpoint, sweep_group_sizes, Checkpoint, InferenceSession, PipelineConfig,
};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let device = Device::Cpu;
    let (rows, columns) = (256, 1024);

    // Normal weights with a handful of large outliers, as seen in attention projections.
    let weight = Tensor::randn(0.0f32, 0.02, (rows, columns), &device)?;
    let mut values = weight.flatten_all()?.to_vec1::<f32>()?;
    for v in values.iter_mut().step_by(4093) {
        *v *= 50.0;
    }

    println!("=== Group size trade-off ({rows}x{columns}) ===\n");
    println!(
        "{:>6} {:>10} {:>8} {:>9} {:>12} {:>12} {:>8}",
        "n", "bits/wt", "ratio", "overhead", "max_abs", "rmse", "snr_db"
    );
    let points = sweep_group_sizes(&values, rows, columns, &[16, 32, 64, 128, 256, 1024])?;
    for p in &points {
        println!(
            "{:>6} {:>10.3} {:>7.2}x {:>8.1}% {:>12.6} {:>12.6} {:>8.2}",
            p.group_size,
            p.bits_per_weight,
            p.compression_ratio,
            p.overhead_fraction * 100.0,
            p.error.max_abs,
            p.error.rmse,
            p.error.snr_db,
        );
    }

    println!("\n=== Serving a packed layer ===\n");
    let weight = Tensor::from_vec(values, (rows, columns), &device)?;
    let checkpoint = Checkpoint::new("demo").with_tensor("proj.weight", weight.clone());
    let config = PipelineConfig::preset_group(64);
    let packed = pack_checkpoint(&checkpoint, &config)?;
    println!(
        "Packed {} tensor(s): {} bytes (dense f32: {} bytes)",
        packed.packed_count(),
        packed.size_bytes(),
        rows * columns * 4
    );

    let session = InferenceSession::attach(&packed, &config, &device)?;
    let x = Tensor::randn(0.0f32, 1.0, (8, columns), &device)?;
    let y = session.forward("proj", &x)?;
    let reference = x.matmul(&weight.t()?)?;
    let err = (&y - &reference)?.abs()?.mean_all()?.to_scalar::<f32>()?;
    println!("Output shape {:?}, mean abs error vs dense {err:.6}", y.dims());

    let summary = session.detach();
    println!(
        "Released {} layer(s) after {} forward call(s)",
        summary.layers, summary.forward_calls
    );
    Ok(())
}
