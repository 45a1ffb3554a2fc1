//! Codec pipeline: serialize then conditionally compress
//!
//! Values pass through two ordered stages on write: serialization
//! (`none`, `json`, `msgpack`) followed by compression (`none`, `gzip`,
//! `zlib`, `zstd`) when the serialized payload meets the configured size
//! threshold. Reads invert the stages, branching on the `compressed` flag
//! persisted with the entry rather than on the pool's current defaults.
//!
//! The `msgpack` and `zstd` methods are gated behind cargo features of the
//! same name. A method whose feature is compiled out is still a valid name;
//! encoding with it fails open (the payload passes through unchanged and
//! the `compressed` flag stays false), so the read path never attempts to
//! reverse a stage that was not applied.

use std::borrow::Cow;
use std::io::{Read, Write};

use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use serde::{Deserialize, Serialize};

use crate::entry::CacheValue;

/// zstd level 3 is a good balance of speed and ratio
#[cfg(feature = "zstd")]
const ZSTD_LEVEL: i32 = 3;

/// Compression method applied after serialization
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionMethod {
  #[default]
  None,
  Gzip,
  Zlib,
  Zstd,
}

impl std::str::FromStr for CompressionMethod {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "none" => Ok(CompressionMethod::None),
      "gzip" => Ok(CompressionMethod::Gzip),
      "zlib" => Ok(CompressionMethod::Zlib),
      "zstd" => Ok(CompressionMethod::Zstd),
      _ => Err(format!("Unknown compression method: {}", s)),
    }
  }
}

impl std::fmt::Display for CompressionMethod {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      CompressionMethod::None => write!(f, "none"),
      CompressionMethod::Gzip => write!(f, "gzip"),
      CompressionMethod::Zlib => write!(f, "zlib"),
      CompressionMethod::Zstd => write!(f, "zstd"),
    }
  }
}

/// Serialization method applied to the value before compression
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerializationMethod {
  #[default]
  None,
  Json,
  MsgPack,
}

impl std::str::FromStr for SerializationMethod {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "none" => Ok(SerializationMethod::None),
      "json" => Ok(SerializationMethod::Json),
      "msgpack" => Ok(SerializationMethod::MsgPack),
      _ => Err(format!("Unknown serialization method: {}", s)),
    }
  }
}

impl std::fmt::Display for SerializationMethod {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      SerializationMethod::None => write!(f, "none"),
      SerializationMethod::Json => write!(f, "json"),
      SerializationMethod::MsgPack => write!(f, "msgpack"),
    }
  }
}

/// Codec configuration persisted with each entry, as the `config` field of
/// the meta hash.
///
/// Decoding branches on these persisted values, never on the pool's current
/// defaults: the defaults may have changed since the entry was written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecConfig {
  #[serde(default)]
  pub compressed: bool,
  #[serde(default)]
  pub compression: CompressionMethod,
  #[serde(default)]
  pub serialization: SerializationMethod,
}

/// Serialize a value to its stored byte form.
///
/// Failures and unsupported methods fail open to the raw string form.
pub fn serialize_value(value: &CacheValue, method: SerializationMethod) -> Vec<u8> {
  match method {
    SerializationMethod::None => value.to_raw_string().into_bytes(),
    SerializationMethod::Json => {
      serde_json::to_vec(value).unwrap_or_else(|_| value.to_raw_string().into_bytes())
    }
    SerializationMethod::MsgPack => serialize_msgpack(value),
  }
}

#[cfg(feature = "msgpack")]
fn serialize_msgpack(value: &CacheValue) -> Vec<u8> {
  rmp_serde::to_vec(value).unwrap_or_else(|_| value.to_raw_string().into_bytes())
}

#[cfg(not(feature = "msgpack"))]
fn serialize_msgpack(value: &CacheValue) -> Vec<u8> {
  value.to_raw_string().into_bytes()
}

/// Deserialize stored bytes back into a value.
///
/// Failures and unsupported methods fail open to the raw string form.
pub fn deserialize_value(bytes: &[u8], method: SerializationMethod) -> CacheValue {
  match method {
    SerializationMethod::None => CacheValue::from_raw(bytes),
    SerializationMethod::Json => {
      serde_json::from_slice::<CacheValue>(bytes).unwrap_or_else(|_| CacheValue::from_raw(bytes))
    }
    SerializationMethod::MsgPack => deserialize_msgpack(bytes),
  }
}

#[cfg(feature = "msgpack")]
fn deserialize_msgpack(bytes: &[u8]) -> CacheValue {
  rmp_serde::from_slice::<CacheValue>(bytes).unwrap_or_else(|_| CacheValue::from_raw(bytes))
}

#[cfg(not(feature = "msgpack"))]
fn deserialize_msgpack(bytes: &[u8]) -> CacheValue {
  CacheValue::from_raw(bytes)
}

/// Compress bytes with the given method.
///
/// Returns `None` when the method is `none`, unsupported in this build, or
/// the compressor fails; callers keep the original bytes and must not set
/// the `compressed` flag.
pub fn compress(data: &[u8], method: CompressionMethod) -> Option<Vec<u8>> {
  match method {
    CompressionMethod::None => None,
    CompressionMethod::Gzip => {
      let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
      encoder.write_all(data).ok()?;
      encoder.finish().ok()
    }
    CompressionMethod::Zlib => {
      let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
      encoder.write_all(data).ok()?;
      encoder.finish().ok()
    }
    CompressionMethod::Zstd => compress_zstd(data),
  }
}

#[cfg(feature = "zstd")]
fn compress_zstd(data: &[u8]) -> Option<Vec<u8>> {
  zstd::encode_all(data, ZSTD_LEVEL).ok()
}

#[cfg(not(feature = "zstd"))]
fn compress_zstd(_data: &[u8]) -> Option<Vec<u8>> {
  None
}

/// Decompress bytes with the given method.
///
/// Returns `None` when the method is `none`, unsupported in this build, or
/// the decompressor fails; callers fall back to the stored bytes.
pub fn decompress(data: &[u8], method: CompressionMethod) -> Option<Vec<u8>> {
  match method {
    CompressionMethod::None => None,
    CompressionMethod::Gzip => {
      let mut decoder = GzDecoder::new(data);
      let mut out = Vec::new();
      decoder.read_to_end(&mut out).ok()?;
      Some(out)
    }
    CompressionMethod::Zlib => {
      let mut decoder = ZlibDecoder::new(data);
      let mut out = Vec::new();
      decoder.read_to_end(&mut out).ok()?;
      Some(out)
    }
    CompressionMethod::Zstd => decompress_zstd(data),
  }
}

#[cfg(feature = "zstd")]
fn decompress_zstd(data: &[u8]) -> Option<Vec<u8>> {
  zstd::decode_all(data).ok()
}

#[cfg(not(feature = "zstd"))]
fn decompress_zstd(_data: &[u8]) -> Option<Vec<u8>> {
  None
}

/// Run the full write pipeline: serialize, then compress when the payload
/// meets the size threshold.
///
/// Returns the stored bytes together with the codec config to persist.
pub fn encode_value(
  value: &CacheValue,
  serialization: SerializationMethod,
  compression: CompressionMethod,
  min_bytes: usize,
) -> (Vec<u8>, CodecConfig) {
  let mut data = serialize_value(value, serialization);
  let mut config = CodecConfig {
    compressed: false,
    compression,
    serialization,
  };

  if compression != CompressionMethod::None && data.len() >= min_bytes {
    if let Some(packed) = compress(&data, compression) {
      data = packed;
      config.compressed = true;
    }
  }

  (data, config)
}

/// Run the full read pipeline: decompress when the persisted flag says the
/// payload was compressed, then deserialize.
pub fn decode_value(bytes: &[u8], config: &CodecConfig) -> CacheValue {
  let data: Cow<'_, [u8]> = if config.compressed {
    decompress(bytes, config.compression)
      .map(Cow::Owned)
      .unwrap_or(Cow::Borrowed(bytes))
  } else {
    Cow::Borrowed(bytes)
  };

  deserialize_value(&data, config.serialization)
}
