//! Codecs and the codec registry.
//!
//! A [`Codec`] turns a typed value into node bytes and back. The
//! [`CodecRegistry`] maps explicit string keys to codecs so callers can pick
//! one by name or by the extension of a path (`app.json` uses `json`).

use crate::core::error::{KeelError, KeelResult};
use bytes::Bytes;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::marker::PhantomData;
use std::sync::Arc;

/// Encoder/decoder pair for one value type.
pub trait Codec<T>: Send + Sync {
    /// Encode a value.
    fn encode(&self, value: &T) -> KeelResult<Bytes>;

    /// Decode a value.
    fn decode(&self, bytes: &[u8]) -> KeelResult<T>;
}

/// Bytes passed through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

impl Codec<Bytes> for RawCodec {
    fn encode(&self, value: &Bytes) -> KeelResult<Bytes> {
        Ok(value.clone())
    }

    fn decode(&self, bytes: &[u8]) -> KeelResult<Bytes> {
        Ok(Bytes::copy_from_slice(bytes))
    }
}

/// UTF-8 text.
#[derive(Debug, Clone, Copy, Default)]
pub struct Utf8Codec;

impl Codec<String> for Utf8Codec {
    fn encode(&self, value: &String) -> KeelResult<Bytes> {
        Ok(Bytes::copy_from_slice(value.as_bytes()))
    }

    fn decode(&self, bytes: &[u8]) -> KeelResult<String> {
        String::from_utf8(bytes.to_vec())
            .map_err(|e| KeelError::serialization(format!("invalid UTF-8: {}", e)))
    }
}

/// JSON via serde.
pub struct JsonCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Codec<T> for JsonCodec<T>
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, value: &T) -> KeelResult<Bytes> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|e| KeelError::serialization(format!("json encode: {}", e)))
    }

    fn decode(&self, bytes: &[u8]) -> KeelResult<T> {
        serde_json::from_slice(bytes)
            .map_err(|e| KeelError::serialization(format!("json decode: {}", e)))
    }
}

/// `key=value` lines. Blank lines and lines starting with `#` or `!` are
/// skipped on decode; keys are emitted in sorted order.
#[derive(Debug, Clone, Copy, Default)]
pub struct PropertiesCodec;

impl Codec<BTreeMap<String, String>> for PropertiesCodec {
    fn encode(&self, value: &BTreeMap<String, String>) -> KeelResult<Bytes> {
        let mut out = String::new();
        for (key, val) in value {
            if key.is_empty() || key.contains(|c| c == '=' || c == '\n') {
                return Err(KeelError::serialization(format!(
                    "invalid properties key: '{}'",
                    key
                )));
            }
            if val.contains('\n') {
                return Err(KeelError::serialization(format!(
                    "properties value for '{}' spans lines",
                    key
                )));
            }
            out.push_str(key);
            out.push('=');
            out.push_str(val);
            out.push('\n');
        }
        Ok(Bytes::from(out))
    }

    fn decode(&self, bytes: &[u8]) -> KeelResult<BTreeMap<String, String>> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| KeelError::serialization(format!("invalid UTF-8: {}", e)))?;
        let mut map = BTreeMap::new();
        for (n, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }
            let (key, val) = line.split_once('=').ok_or_else(|| {
                KeelError::serialization(format!("line {}: expected key=value", n + 1))
            })?;
            map.insert(key.trim().to_string(), val.trim().to_string());
        }
        Ok(map)
    }
}

macro_rules! be_codec {
    ($name:ident, $ty:ty) => {
        #[doc = concat!("Big-endian `", stringify!($ty), "`.")]
        #[derive(Debug, Clone, Copy, Default)]
        pub struct $name;

        impl Codec<$ty> for $name {
            fn encode(&self, value: &$ty) -> KeelResult<Bytes> {
                Ok(Bytes::copy_from_slice(&value.to_be_bytes()))
            }

            fn decode(&self, bytes: &[u8]) -> KeelResult<$ty> {
                let raw: [u8; std::mem::size_of::<$ty>()] = bytes.try_into().map_err(|_| {
                    KeelError::serialization(format!(
                        "expected {} bytes for {}, got {}",
                        std::mem::size_of::<$ty>(),
                        stringify!($ty),
                        bytes.len()
                    ))
                })?;
                Ok(<$ty>::from_be_bytes(raw))
            }
        }
    };
}

be_codec!(I16Codec, i16);
be_codec!(I32Codec, i32);
be_codec!(I64Codec, i64);
be_codec!(F32Codec, f32);
be_codec!(F64Codec, f64);

/// Registry of codecs keyed by name.
///
/// A key maps to exactly one value type; looking a key up with a different
/// type than it was registered with reports [`KeelError::CodecNotFound`].
#[derive(Default)]
pub struct CodecRegistry {
    codecs: RwLock<HashMap<String, Arc<dyn Any + Send + Sync>>>,
}

impl CodecRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding the built-in codecs.
    ///
    /// | key | type |
    /// |-----|------|
    /// | `bin`, `raw` | `Bytes` |
    /// | `txt`, `utf8` | `String` |
    /// | `json`, `js` | `serde_json::Value` |
    /// | `properties`, `props` | `BTreeMap<String, String>` |
    /// | `i16`, `i32`, `i64`, `f32`, `f64` | big-endian numbers |
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        let raw: Arc<dyn Codec<Bytes>> = Arc::new(RawCodec);
        let text: Arc<dyn Codec<String>> = Arc::new(Utf8Codec);
        let json: Arc<dyn Codec<serde_json::Value>> = Arc::new(JsonCodec::new());
        let props: Arc<dyn Codec<BTreeMap<String, String>>> = Arc::new(PropertiesCodec);

        for key in ["bin", "raw"] {
            registry.register(key, raw.clone());
        }
        for key in ["txt", "utf8"] {
            registry.register(key, text.clone());
        }
        for key in ["json", "js"] {
            registry.register(key, json.clone());
        }
        for key in ["properties", "props"] {
            registry.register(key, props.clone());
        }
        registry.register::<i16>("i16", Arc::new(I16Codec));
        registry.register::<i32>("i32", Arc::new(I32Codec));
        registry.register::<i64>("i64", Arc::new(I64Codec));
        registry.register::<f32>("f32", Arc::new(F32Codec));
        registry.register::<f64>("f64", Arc::new(F64Codec));
        registry
    }

    /// Register a codec under `key`, replacing any previous one.
    pub fn register<T: 'static>(&self, key: &str, codec: Arc<dyn Codec<T>>) {
        tracing::debug!(key = %key, "codec registered");
        self.codecs.write().insert(key.to_string(), Arc::new(codec));
    }

    /// Look up the codec registered under `key` for type `T`.
    pub fn get<T: 'static>(&self, key: &str) -> KeelResult<Arc<dyn Codec<T>>> {
        self.codecs
            .read()
            .get(key)
            .and_then(|entry| entry.downcast_ref::<Arc<dyn Codec<T>>>())
            .cloned()
            .ok_or_else(|| KeelError::CodecNotFound {
                key: key.to_string(),
            })
    }

    /// Look up a codec by the extension of the last path token.
    pub fn for_path<T: 'static>(&self, path: &str) -> KeelResult<Arc<dyn Codec<T>>> {
        match Self::extension(path) {
            Some(ext) => self.get(ext),
            None => Err(KeelError::CodecNotFound {
                key: format!("(no extension in '{}')", path),
            }),
        }
    }

    /// Check if any codec is registered under `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.codecs.read().contains_key(key)
    }

    fn extension(path: &str) -> Option<&str> {
        let leaf = path.rsplit('/').next()?;
        match leaf.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => Some(ext),
            _ => None,
        }
    }
}
