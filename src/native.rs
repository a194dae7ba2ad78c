//! Native packed-checkpoint format.
//!
//! The packed checkpoint is the long-lived artifact: it is produced once per
//! (checkpoint, group size) and loaded on every start. All integers are
//! little-endian.
//!
//! File structure:
//! ```text
//! Header (32 bytes)
//!   - Magic: "GQ4N" (4 bytes)
//!   - Version: u32 (4 bytes)
//!   - Format flags: u32 (4 bytes)
//!   - Metadata size: u64 (8 bytes)
//!   - Tensor count: u32 (4 bytes)
//!   - Reserved: u32 (4 bytes)
//!
//! Metadata section (metadata size bytes)
//!   - Model name (length-prefixed string)
//!   - Checkpoint id (length-prefixed string)
//!   - Compute dtype (1 byte)
//!   - Group size: u32
//!
//! Tensor headers (one per tensor)
//!   - Name (length-prefixed string)
//!   - Kind: u8 (0 = packed, 1 = dense f32)
//!   - Shape (u32 rank, then u64 dims)
//!   - Group size: u32 (0 for dense)
//!   - Offset: u64 (from the start of the data section)
//!   - Length: u64 (bytes)
//!
//! Tensor data
//!   - Packed: codes (u16 per 4 values), scales (f16 bits), biases (f16 bits)
//!   - Dense: f32 values
//! ```

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use half::f16;

use crate::checkpoint::{PackedCheckpoint, PackedTensor};
use crate::error::{GroupQuantError, Result};
use crate::packing::CODES_PER_WORD;
use crate::quantization::{validate_group_size, ComputeDType, PackedMatrix, QuantizationReport};

/// Magic bytes for the native packed format.
const MAGIC: &[u8; 4] = b"GQ4N";

/// Version of the native format.
const VERSION: u32 = 1;

/// Format flags (reserved for future extensions).
const FORMAT_FLAGS: u32 = 0;

const KIND_PACKED: u8 = 0;
const KIND_DENSE: u8 = 1;

/// Longest string accepted when reading.
const MAX_STRING_LEN: usize = 1 << 16;

/// Highest tensor rank accepted when reading.
const MAX_RANK: usize = 8;

fn format_err(what: &str, e: impl std::fmt::Display) -> GroupQuantError {
    GroupQuantError::NativeFormat(format!("{what}: {e}"))
}

/// Payload of one tensor, serialized ahead of time so offsets are exact.
struct TensorPayload<'a> {
    name: &'a str,
    kind: u8,
    shape: Vec<usize>,
    group_size: usize,
    bytes: Vec<u8>,
}

/// Write a packed checkpoint to `output_path`.
///
/// # Errors
/// Returns `NativeFormat` if the file cannot be written or a field does not fit
/// the format's integer widths.
pub fn write_packed_checkpoint<P: AsRef<Path>>(
    checkpoint: &PackedCheckpoint,
    output_path: P,
) -> Result<()> {
    let file = File::create(output_path.as_ref())
        .map_err(|e| format_err("failed to create output file", e))?;
    let mut writer = BufWriter::new(file);

    let payloads = checkpoint
        .entries
        .iter()
        .map(|(name, tensor)| encode_tensor(name, tensor))
        .collect::<Result<Vec<_>>>()?;

    let mut metadata = Vec::new();
    write_metadata(&mut metadata, checkpoint)?;

    write_header(&mut writer, metadata.len(), payloads.len())?;
    writer
        .write_all(&metadata)
        .map_err(|e| format_err("failed to write metadata", e))?;
    write_tensor_headers(&mut writer, &payloads)?;
    for payload in &payloads {
        writer
            .write_all(&payload.bytes)
            .map_err(|e| format_err("failed to write tensor data", e))?;
    }
    writer
        .flush()
        .map_err(|e| format_err("failed to flush output", e))?;

    tracing::info!(
        path = %output_path.as_ref().display(),
        tensors = payloads.len(),
        "wrote packed checkpoint"
    );
    Ok(())
}

fn write_header<W: Write>(writer: &mut W, metadata_len: usize, tensor_count: usize) -> Result<()> {
    let count = u32::try_from(tensor_count)
        .map_err(|_| GroupQuantError::NativeFormat("too many tensors".into()))?;
    let mut header = Vec::with_capacity(32);
    header.extend_from_slice(MAGIC);
    header.extend_from_slice(&VERSION.to_le_bytes());
    header.extend_from_slice(&FORMAT_FLAGS.to_le_bytes());
    header.extend_from_slice(&(metadata_len as u64).to_le_bytes());
    header.extend_from_slice(&count.to_le_bytes());
    header.extend_from_slice(&0u32.to_le_bytes());
    writer
        .write_all(&header)
        .map_err(|e| format_err("failed to write header", e))
}

fn write_metadata(buf: &mut Vec<u8>, checkpoint: &PackedCheckpoint) -> Result<()> {
    write_string(buf, &checkpoint.model_name)?;
    write_string(buf, &checkpoint.id)?;
    buf.push(match checkpoint.compute_dtype {
        ComputeDType::F32 => 0u8,
        ComputeDType::F16 => 1u8,
        ComputeDType::BF16 => 2u8,
    });
    buf.extend_from_slice(&to_u32(checkpoint.group_size, "group size")?.to_le_bytes());
    Ok(())
}

fn write_tensor_headers<W: Write>(writer: &mut W, payloads: &[TensorPayload<'_>]) -> Result<()> {
    let mut buf = Vec::new();
    let mut offset = 0u64;
    for payload in payloads {
        write_string(&mut buf, payload.name)?;
        buf.push(payload.kind);
        buf.extend_from_slice(&to_u32(payload.shape.len(), "tensor rank")?.to_le_bytes());
        for &dim in &payload.shape {
            buf.extend_from_slice(&(dim as u64).to_le_bytes());
        }
        buf.extend_from_slice(&to_u32(payload.group_size, "group size")?.to_le_bytes());
        buf.extend_from_slice(&offset.to_le_bytes());
        let len = payload.bytes.len() as u64;
        buf.extend_from_slice(&len.to_le_bytes());
        offset += len;
    }
    writer
        .write_all(&buf)
        .map_err(|e| format_err("failed to write tensor headers", e))
}

fn encode_tensor<'a>(name: &'a str, tensor: &PackedTensor) -> Result<TensorPayload<'a>> {
    match tensor {
        PackedTensor::Packed(p) => {
            let mut bytes = Vec::with_capacity(p.size_bytes());
            for &word in p.codes() {
                bytes.extend_from_slice(&word.to_le_bytes());
            }
            for v in p.scales().iter().chain(p.biases()) {
                bytes.extend_from_slice(&v.to_bits().to_le_bytes());
            }
            Ok(TensorPayload {
                name,
                kind: KIND_PACKED,
                shape: p.shape().to_vec(),
                group_size: p.group_size(),
                bytes,
            })
        }
        PackedTensor::Dense(t) => {
            let values = t.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
            let mut bytes = Vec::with_capacity(values.len() * 4);
            for v in values {
                bytes.extend_from_slice(&v.to_le_bytes());
            }
            Ok(TensorPayload {
                name,
                kind: KIND_DENSE,
                shape: t.dims().to_vec(),
                group_size: 0,
                bytes,
            })
        }
    }
}

fn write_string(buf: &mut Vec<u8>, s: &str) -> Result<()> {
    let len = to_u32(s.len(), "string length")?;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

fn to_u32(value: usize, what: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| GroupQuantError::NativeFormat(format!("{what} too large")))
}

/// Read a packed checkpoint written by [`write_packed_checkpoint`].
///
/// Dense tensors are created on `device` as f32. The returned report is empty;
/// compression statistics are not persisted.
///
/// # Errors
/// Returns `NativeFormat` for a truncated or malformed file and `Io` if the
/// file cannot be opened.
pub fn read_packed_checkpoint<P: AsRef<Path>>(path: P, device: &Device) -> Result<PackedCheckpoint> {
    let file = File::open(path.as_ref())?;
    let mut r = FieldReader::new(BufReader::new(file));

    let mut magic = [0u8; 4];
    r.fill(&mut magic, "magic")?;
    if &magic != MAGIC {
        return Err(GroupQuantError::NativeFormat(format!(
            "bad magic {magic:?}, not a packed checkpoint"
        )));
    }
    let version = r.u32("version")?;
    if version != VERSION {
        return Err(GroupQuantError::NativeFormat(format!(
            "unsupported version {version}"
        )));
    }
    let _flags = r.u32("format flags")?;
    let metadata_len = r.u64("metadata size")?;
    let tensor_count = r.u32("tensor count")? as usize;
    let _reserved = r.u32("reserved")?;

    let metadata_start = r.position;
    let model_name = r.string("model name")?;
    let id = r.string("checkpoint id")?;
    let compute_dtype = match r.u8("compute dtype")? {
        0 => ComputeDType::F32,
        1 => ComputeDType::F16,
        2 => ComputeDType::BF16,
        other => {
            return Err(GroupQuantError::NativeFormat(format!(
                "unknown compute dtype {other}"
            )))
        }
    };
    let group_size = r.u32("group size")? as usize;
    if r.position - metadata_start != metadata_len {
        return Err(GroupQuantError::NativeFormat(
            "metadata size does not match its contents".into(),
        ));
    }

    let mut headers = Vec::with_capacity(tensor_count.min(1024));
    for _ in 0..tensor_count {
        headers.push(r.tensor_header()?);
    }

    let mut entries = Vec::with_capacity(headers.len());
    let mut offset = 0u64;
    for header in headers {
        if header.offset != offset {
            return Err(GroupQuantError::NativeFormat(format!(
                "tensor {} at offset {}, expected {offset}",
                header.name, header.offset
            )));
        }
        let expected = payload_len(&header)?;
        if header.len != expected {
            return Err(GroupQuantError::NativeFormat(format!(
                "tensor {} declares {} bytes, its shape needs {expected}",
                header.name, header.len
            )));
        }
        let bytes = r.bytes(header.len, "tensor data")?;
        offset += header.len;

        let tensor = decode_tensor(&header, &bytes, device)?;
        entries.push((header.name, tensor));
    }

    tracing::info!(
        path = %path.as_ref().display(),
        tensors = entries.len(),
        "read packed checkpoint"
    );
    Ok(PackedCheckpoint {
        id,
        model_name,
        group_size,
        compute_dtype,
        entries,
        report: QuantizationReport::default(),
    })
}

struct TensorHeader {
    name: String,
    kind: u8,
    shape: Vec<usize>,
    group_size: usize,
    offset: u64,
    len: u64,
}

fn malformed(header: &TensorHeader, what: &str) -> GroupQuantError {
    GroupQuantError::NativeFormat(format!("tensor {}: {what}", header.name))
}

fn checked_numel(header: &TensorHeader) -> Result<usize> {
    header
        .shape
        .iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d))
        .ok_or_else(|| malformed(header, "element count overflows"))
}

/// Payload size implied by a tensor header, checked before anything is read.
fn payload_len(header: &TensorHeader) -> Result<u64> {
    let numel = checked_numel(header)?;
    let bytes = match header.kind {
        KIND_PACKED => {
            let [_, columns] = header.shape[..] else {
                return Err(malformed(header, "packed tensor must be 2-D"));
            };
            validate_group_size(columns, header.group_size)
                .map_err(|e| format_err(&format!("tensor {}", header.name), e))?;
            let words = numel / CODES_PER_WORD + 2 * (numel / header.group_size);
            words.checked_mul(2)
        }
        KIND_DENSE => numel.checked_mul(4),
        other => return Err(malformed(header, &format!("unknown tensor kind {other}"))),
    };
    bytes
        .map(|b| b as u64)
        .ok_or_else(|| malformed(header, "payload size overflows"))
}

/// Decode a payload whose length already matches [`payload_len`].
fn decode_tensor(header: &TensorHeader, bytes: &[u8], device: &Device) -> Result<PackedTensor> {
    if header.kind == KIND_DENSE {
        let values: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        return Ok(PackedTensor::Dense(Tensor::from_vec(
            values,
            header.shape.clone(),
            device,
        )?));
    }

    let [rows, columns] = header.shape[..] else {
        return Err(malformed(header, "packed tensor must be 2-D"));
    };
    let words: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .collect();
    let n_codes = rows * columns / CODES_PER_WORD;
    let n_groups = rows * columns / header.group_size;
    let codes = words[..n_codes].to_vec();
    let scales = words[n_codes..n_codes + n_groups]
        .iter()
        .map(|&b| f16::from_bits(b))
        .collect();
    let biases = words[n_codes + n_groups..]
        .iter()
        .map(|&b| f16::from_bits(b))
        .collect();
    let packed = PackedMatrix::from_parts(codes, scales, biases, rows, columns, header.group_size)
        .map_err(|e| format_err(&format!("invalid packed tensor {}", header.name), e))?;
    Ok(PackedTensor::Packed(packed))
}

/// Reads little-endian fields, turning short reads into format errors.
struct FieldReader<R> {
    inner: R,
    position: u64,
}

impl<R: Read> FieldReader<R> {
    fn new(inner: R) -> Self {
        Self { inner, position: 0 }
    }

    fn fill(&mut self, buf: &mut [u8], what: &str) -> Result<()> {
        self.inner
            .read_exact(buf)
            .map_err(|e| format_err(&format!("failed to read {what}"), e))?;
        self.position += buf.len() as u64;
        Ok(())
    }

    /// Read exactly `len` bytes, growing the buffer only as data arrives.
    fn bytes(&mut self, len: u64, what: &str) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        (&mut self.inner)
            .take(len)
            .read_to_end(&mut buf)
            .map_err(|e| format_err(&format!("failed to read {what}"), e))?;
        if buf.len() as u64 != len {
            return Err(GroupQuantError::NativeFormat(format!(
                "failed to read {what}: got {} of {len} bytes",
                buf.len()
            )));
        }
        self.position += len;
        Ok(buf)
    }

    fn u8(&mut self, what: &str) -> Result<u8> {
        let mut b = [0u8; 1];
        self.fill(&mut b, what)?;
        Ok(b[0])
    }

    fn u32(&mut self, what: &str) -> Result<u32> {
        let mut b = [0u8; 4];
        self.fill(&mut b, what)?;
        Ok(u32::from_le_bytes(b))
    }

    fn u64(&mut self, what: &str) -> Result<u64> {
        let mut b = [0u8; 8];
        self.fill(&mut b, what)?;
        Ok(u64::from_le_bytes(b))
    }

    fn string(&mut self, what: &str) -> Result<String> {
        let len = self.u32(what)? as usize;
        if len > MAX_STRING_LEN {
            return Err(GroupQuantError::NativeFormat(format!(
                "{what} length {len} exceeds limit"
            )));
        }
        let mut bytes = vec![0u8; len];
        self.fill(&mut bytes, what)?;
        String::from_utf8(bytes).map_err(|e| format_err(what, e))
    }

    fn tensor_header(&mut self) -> Result<TensorHeader> {
        let name = self.string("tensor name")?;
        let kind = self.u8("tensor kind")?;
        let rank = self.u32("tensor rank")? as usize;
        if rank > MAX_RANK {
            return Err(GroupQuantError::NativeFormat(format!(
                "tensor {name} has rank {rank}"
            )));
        }
        let mut shape = Vec::with_capacity(rank);
        for _ in 0..rank {
            let dim = usize::try_from(self.u64("dimension")?)
                .map_err(|_| GroupQuantError::NativeFormat("dimension too large".into()))?;
            shape.push(dim);
        }
        let group_size = self.u32("group size")? as usize;
        let offset = self.u64("offset")?;
        let len = self.u64("length")?;
        Ok(TensorHeader {
            name,
            kind,
            shape,
            group_size,
            offset,
            len,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{pack_checkpoint, Checkpoint};
    use crate::config::PipelineConfig;

    fn packed_toy(group_size: usize) -> PackedCheckpoint {
        let device = Device::Cpu;
        let ckpt = Checkpoint::new("toy")
            .with_tensor("w1", Tensor::randn(0.0f32, 1.0, (8, 64), &device).unwrap())
            .with_tensor("b1", Tensor::randn(0.0f32, 1.0, 8, &device).unwrap());
        let config = PipelineConfig {
            model_name: "toy-model".into(),
            ..PipelineConfig::preset_group(group_size)
        };
        pack_checkpoint(&ckpt, &config).unwrap()
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("toy.gq4n");
        let packed = packed_toy(16);
        write_packed_checkpoint(&packed, &path).unwrap();

        let loaded = read_packed_checkpoint(&path, &Device::Cpu).unwrap();
        assert_eq!(loaded.id, "toy");
        assert_eq!(loaded.model_name, "toy-model");
        assert_eq!(loaded.group_size, 16);
        assert_eq!(loaded.entries.len(), 2);
        assert_eq!(
            loaded.get("w1").unwrap().as_packed(),
            packed.get("w1").unwrap().as_packed()
        );

        let (PackedTensor::Dense(a), PackedTensor::Dense(b)) =
            (loaded.get("b1").unwrap(), packed.get("b1").unwrap())
        else {
            panic!("bias should stay dense");
        };
        assert_eq!(a.to_vec1::<f32>().unwrap(), b.to_vec1::<f32>().unwrap());
    }

    #[test]
    fn test_magic_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("magic.gq4n");
        write_packed_checkpoint(&packed_toy(64), &path).unwrap();

        let mut file = File::open(&path).unwrap();
        let mut magic = [0u8; 4];
        file.read_exact(&mut magic).unwrap();
        assert_eq!(&magic, MAGIC);
    }

    #[test]
    fn test_rejects_wrong_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.gq4n");
        std::fs::write(&path, b"GGUF\x03\x00\x00\x00").unwrap();
        let err = read_packed_checkpoint(&path, &Device::Cpu).unwrap_err();
        assert!(matches!(err, GroupQuantError::NativeFormat(_)));
    }

    #[test]
    fn test_rejects_truncated_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.gq4n");
        write_packed_checkpoint(&packed_toy(32), &path).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();

        let err = read_packed_checkpoint(&path, &Device::Cpu).unwrap_err();
        assert!(matches!(err, GroupQuantError::NativeFormat(_)));
    }

    #[test]
    fn test_packed_payload_size() {
        let packed = packed_toy(16);
        let payload = encode_tensor("w1", packed.get("w1").unwrap()).unwrap();
        // 8 rows x 64 columns: 128 code words + 32 scales + 32 biases, 2 bytes each
        assert_eq!(payload.bytes.len(), (128 + 32 + 32) * 2);
    }

    /// Tensor header fields as written to disk: name, kind, dims, group size,
    /// offset, length.
    type RawHeader = (&'static str, u8, Vec<u64>, u32, u64, u64);

    fn raw_file(headers: &[RawHeader], data: &[u8]) -> Vec<u8> {
        let mut metadata = Vec::new();
        write_string(&mut metadata, "raw").unwrap();
        write_string(&mut metadata, "raw-id").unwrap();
        metadata.push(0);
        metadata.extend_from_slice(&16u32.to_le_bytes());

        let mut out = Vec::new();
        write_header(&mut out, metadata.len(), headers.len()).unwrap();
        out.extend_from_slice(&metadata);
        for (name, kind, dims, group_size, offset, len) in headers {
            write_string(&mut out, name).unwrap();
            out.push(*kind);
            out.extend_from_slice(&u32::try_from(dims.len()).unwrap().to_le_bytes());
            for d in dims {
                out.extend_from_slice(&d.to_le_bytes());
            }
            out.extend_from_slice(&group_size.to_le_bytes());
            out.extend_from_slice(&offset.to_le_bytes());
            out.extend_from_slice(&len.to_le_bytes());
        }
        out.extend_from_slice(data);
        out
    }

    fn read_raw(bytes: &[u8]) -> Result<PackedCheckpoint> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raw.gq4n");
        std::fs::write(&path, bytes).unwrap();
        read_packed_checkpoint(&path, &Device::Cpu)
    }

    fn assert_format_error(bytes: &[u8], needle: &str) {
        match read_raw(bytes) {
            Err(GroupQuantError::NativeFormat(msg)) => {
                assert!(msg.contains(needle), "{msg:?} does not mention {needle:?}");
            }
            other => panic!("expected a format error mentioning {needle:?}, got {other:?}"),
        }
    }

    #[test]
    fn test_raw_file_is_readable() {
        // [4, 16] at group size 16: 16 code words + 4 scales + 4 biases.
        let bytes = raw_file(&[("w", KIND_PACKED, vec![4, 16], 16, 0, 48)], &[0u8; 48]);
        let loaded = read_raw(&bytes).unwrap();
        assert_eq!(loaded.get("w").unwrap().dims(), vec![4, 16]);
    }

    #[test]
    fn test_rejects_oversized_length() {
        let bytes = raw_file(&[("w", KIND_PACKED, vec![4, 16], 16, 0, 1 << 62)], &[0u8; 48]);
        assert_format_error(&bytes, "declares");
    }

    #[test]
    fn test_rejects_overflowing_dims() {
        let big = 1u64 << 32;
        let bytes = raw_file(&[("w", KIND_DENSE, vec![big, big, big], 0, 0, 0)], &[]);
        assert_format_error(&bytes, "overflows");
    }

    #[test]
    fn test_rejects_overflowing_payload_size() {
        let bytes = raw_file(&[("w", KIND_DENSE, vec![1 << 62, 2], 0, 0, 0)], &[]);
        assert_format_error(&bytes, "overflows");
    }

    #[test]
    fn test_large_consistent_header_fails_without_data() {
        // 2^20 x 2^20 at group size 64 claims ~576 GiB that the file does not hold.
        let side = 1u64 << 20;
        let len = (side * side / 4 + 2 * (side * side / 64)) * 2;
        let bytes = raw_file(&[("w", KIND_PACKED, vec![side, side], 64, 0, len)], &[]);
        assert_format_error(&bytes, "tensor data");
    }

    #[test]
    fn test_rejects_unknown_kind() {
        let bytes = raw_file(&[("w", 7, vec![4], 0, 0, 16)], &[0u8; 16]);
        assert_format_error(&bytes, "unknown tensor kind 7");
    }

    #[test]
    fn test_rejects_packed_tensor_of_wrong_rank() {
        let bytes = raw_file(&[("w", KIND_PACKED, vec![64], 16, 0, 48)], &[0u8; 48]);
        assert_format_error(&bytes, "2-D");
    }

    #[test]
    fn test_rejects_packed_tensor_with_bad_group_size() {
        let bytes = raw_file(&[("w", KIND_PACKED, vec![4, 16], 0, 0, 48)], &[0u8; 48]);
        assert_format_error(&bytes, "group size");
    }

    #[test]
    fn test_rejects_offset_mismatch() {
        let bytes = raw_file(
            &[
                ("a", KIND_DENSE, vec![2], 0, 0, 8),
                ("b", KIND_DENSE, vec![2], 0, 4, 8),
            ],
            &[0u8; 16],
        );
        assert_format_error(&bytes, "offset");
    }

    #[test]
    fn test_rejects_wrong_metadata_size() {
        let mut bytes = raw_file(&[], &[]);
        let declared = u64::from_le_bytes(bytes[12..20].try_into().unwrap());
        bytes[12..20].copy_from_slice(&(declared + 1).to_le_bytes());
        assert_format_error(&bytes, "metadata size");
    }

    #[test]
    fn test_rejects_unsupported_version() {
        let mut bytes = raw_file(&[], &[]);
        bytes[4..8].copy_from_slice(&9u32.to_le_bytes());
        assert_format_error(&bytes, "unsupported version 9");
    }

    #[test]
    fn test_rejects_unknown_compute_dtype() {
        let mut bytes = raw_file(&[], &[]);
        // Header, then "raw" and "raw-id" with their u32 length prefixes.
        let dtype_at = 32 + 4 + 3 + 4 + 6;
        bytes[dtype_at] = 9;
        assert_format_error(&bytes, "unknown compute dtype 9");
    }

    #[test]
    fn test_rejects_excessive_rank() {
        let dims = [1u64; MAX_RANK + 1];
        let bytes = raw_file(&[("w", KIND_DENSE, dims.to_vec(), 0, 0, 4)], &[0u8; 4]);
        assert_format_error(&bytes, "rank");
    }

    #[test]
    fn test_rejects_oversized_string() {
        let mut bytes = raw_file(&[], &[]);
        bytes[32..36].copy_from_slice(&u32::MAX.to_le_bytes());
        assert_format_error(&bytes, "exceeds limit");
    }
}
