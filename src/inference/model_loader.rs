//! GGUF model probing.
//!
//! Reads the GGUF header and metadata key/value section to validate the file
//! before it is handed to the engine, and to find the context length the model
//! was trained with. Tensor data is never touched.

use std::fs::File;
use std::io::{BufReader, Read, Seek};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

const GGUF_MAGIC: [u8; 4] = *b"GGUF";

// Upper bound for a single metadata string; larger values mean a corrupt file.
const MAX_STRING_LEN: u64 = 64 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum ModelLoaderError {
    #[error("Model file not found: {0}")]
    FileNotFound(String),

    #[error("Invalid GGUF format: {0}")]
    InvalidFormat(String),

    #[error("Unsupported GGUF version {0}")]
    UnsupportedVersion(u32),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Metadata extracted from a GGUF model file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// GGUF format version.
    pub version: u32,

    /// Model architecture name (e.g., "llama", "qwen2").
    pub architecture: Option<String>,

    /// Human-readable model name.
    pub name: Option<String>,

    /// Context length the model was trained with.
    pub context_length: Option<u64>,

    /// Whether the file embeds a chat template.
    pub has_chat_template: bool,

    /// Number of tensors declared in the header.
    pub tensor_count: u64,

    /// File size in bytes.
    pub file_size: u64,
}

/// A scalar metadata value we care about. Everything else is skipped.
enum Value {
    Uint(u64),
    Str(String),
    Other,
}

struct Reader<R> {
    inner: R,
    /// Bytes consumed so far.
    pos: u64,
    /// Total file length. Seeking never reports running past it, so skips
    /// are checked against it.
    len: u64,
}

impl<R: Read + Seek> Reader<R> {
    fn new(inner: R, len: u64) -> Self {
        Self { inner, pos: 0, len }
    }

    fn bytes<const N: usize>(&mut self) -> Result<[u8; N], ModelLoaderError> {
        let mut buf = [0u8; N];
        self.inner.read_exact(&mut buf).map_err(truncated)?;
        self.pos += N as u64;
        Ok(buf)
    }

    fn u32(&mut self) -> Result<u32, ModelLoaderError> {
        Ok(u32::from_le_bytes(self.bytes()?))
    }

    fn u64(&mut self) -> Result<u64, ModelLoaderError> {
        Ok(u64::from_le_bytes(self.bytes()?))
    }

    fn ensure_remaining(&self, n: u64) -> Result<(), ModelLoaderError> {
        if n > self.len.saturating_sub(self.pos) {
            return Err(ModelLoaderError::InvalidFormat("file is truncated".into()));
        }
        Ok(())
    }

    fn skip(&mut self, n: u64) -> Result<(), ModelLoaderError> {
        self.ensure_remaining(n)?;
        let offset = i64::try_from(n)
            .map_err(|_| ModelLoaderError::InvalidFormat("skip length overflow".into()))?;
        self.inner.seek_relative(offset)?;
        self.pos += n;
        Ok(())
    }

    fn string(&mut self) -> Result<String, ModelLoaderError> {
        let len = self.u64()?;
        if len > MAX_STRING_LEN {
            return Err(ModelLoaderError::InvalidFormat(format!(
                "string of {len} bytes"
            )));
        }
        self.ensure_remaining(len)?;
        let mut buf = vec![0u8; len as usize];
        self.inner.read_exact(&mut buf).map_err(truncated)?;
        self.pos += len;
        String::from_utf8(buf)
            .map_err(|_| ModelLoaderError::InvalidFormat("metadata string is not UTF-8".into()))
    }

    fn skip_string(&mut self) -> Result<(), ModelLoaderError> {
        let len = self.u64()?;
        if len > MAX_STRING_LEN {
            return Err(ModelLoaderError::InvalidFormat(format!(
                "string of {len} bytes"
            )));
        }
        self.skip(len)
    }

    fn value(&mut self, value_type: u32) -> Result<Value, ModelLoaderError> {
        match value_type {
            // uint8, int8
            0 | 1 => Ok(Value::Uint(u64::from(self.bytes::<1>()?[0]))),
            // uint16, int16
            2 | 3 => Ok(Value::Uint(u64::from(u16::from_le_bytes(self.bytes()?)))),
            // uint32, int32
            4 | 5 => Ok(Value::Uint(u64::from(self.u32()?))),
            // float32
            6 => self.skip(4).map(|_| Value::Other),
            // bool
            7 => self.skip(1).map(|_| Value::Other),
            8 => self.string().map(Value::Str),
            9 => {
                let item_type = self.u32()?;
                let count = self.u64()?;
                self.skip_array(item_type, count)?;
                Ok(Value::Other)
            }
            // uint64, int64
            10 | 11 => Ok(Value::Uint(self.u64()?)),
            // float64
            12 => self.skip(8).map(|_| Value::Other),
            other => Err(ModelLoaderError::InvalidFormat(format!(
                "unknown metadata value type {other}"
            ))),
        }
    }

    fn skip_array(&mut self, item_type: u32, count: u64) -> Result<(), ModelLoaderError> {
        let width = match item_type {
            0 | 1 | 7 => 1,
            2 | 3 => 2,
            4 | 5 | 6 => 4,
            10..=12 => 8,
            8 => {
                for _ in 0..count {
                    self.skip_string()?;
                }
                return Ok(());
            }
            9 => {
                return Err(ModelLoaderError::InvalidFormat(
                    "nested arrays are not supported".into(),
                ))
            }
            other => {
                return Err(ModelLoaderError::InvalidFormat(format!(
                    "unknown array item type {other}"
                )))
            }
        };
        let bytes = count
            .checked_mul(width)
            .ok_or_else(|| ModelLoaderError::InvalidFormat("array length overflow".into()))?;
        self.skip(bytes)
    }
}

fn truncated(e: std::io::Error) -> ModelLoaderError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        ModelLoaderError::InvalidFormat("file is truncated".into())
    } else {
        ModelLoaderError::IoError(e)
    }
}

/// Load model metadata from a GGUF file.
pub fn load_metadata(path: &Path) -> Result<ModelMetadata, ModelLoaderError> {
    if !path.exists() {
        return Err(ModelLoaderError::FileNotFound(path.display().to_string()));
    }

    let file = File::open(path)?;
    let file_size = file.metadata()?.len();
    let mut reader = Reader::new(BufReader::new(file), file_size);

    let magic: [u8; 4] = reader.bytes()?;
    if magic != GGUF_MAGIC {
        return Err(ModelLoaderError::InvalidFormat("missing GGUF magic".into()));
    }
    let version = reader.u32()?;
    if !(2..=3).contains(&version) {
        return Err(ModelLoaderError::UnsupportedVersion(version));
    }
    let tensor_count = reader.u64()?;
    let kv_count = reader.u64()?;

    let mut metadata = ModelMetadata {
        version,
        tensor_count,
        file_size,
        ..Default::default()
    };
    // Context length keys are namespaced by architecture, which may appear later.
    let mut context_lengths: Vec<(String, u64)> = Vec::new();

    for _ in 0..kv_count {
        let key = reader.string()?;
        let value_type = reader.u32()?;
        match (key.as_str(), reader.value(value_type)?) {
            ("general.architecture", Value::Str(arch)) => metadata.architecture = Some(arch),
            ("general.name", Value::Str(name)) => metadata.name = Some(name),
            ("tokenizer.chat_template", Value::Str(_)) => metadata.has_chat_template = true,
            (k, Value::Uint(n)) if k.ends_with(".context_length") => {
                context_lengths.push((key.clone(), n))
            }
            _ => {}
        }
    }

    metadata.context_length = match &metadata.architecture {
        Some(arch) => {
            let wanted = format!("{arch}.context_length");
            context_lengths
                .iter()
                .find(|(k, _)| *k == wanted)
                .or(context_lengths.first())
                .map(|(_, n)| *n)
        }
        None => context_lengths.first().map(|(_, n)| *n),
    };

    info!(
        version,
        arch = metadata.architecture.as_deref().unwrap_or("unknown"),
        name = metadata.name.as_deref().unwrap_or(""),
        context_length = metadata.context_length,
        tensors = tensor_count,
        file_size,
        "Loaded model metadata"
    );

    Ok(metadata)
}
