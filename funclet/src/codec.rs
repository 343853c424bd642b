//! Pluggable codec for call arguments and return values.
//!
//! Both sides of the wire (the handle's clients and the bootstrap server)
//! share one `PayloadCodec`. The shipped default is `JsonCodec`, a versioned
//! JSON envelope; the HTTP body provides the framing.

use serde::{Deserialize, Serialize};

/// Envelope version accepted by `JsonCodec`.
pub const CODEC_VERSION: u8 = 1;

/// Positional and named arguments for one remote call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallArgs {
    pub args: Vec<serde_json::Value>,
    pub kwargs: serde_json::Map<String, serde_json::Value>,
}

impl CallArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Positional arguments only.
    pub fn positional<I>(args: I) -> Self
    where
        I: IntoIterator<Item = serde_json::Value>,
    {
        Self {
            args: args.into_iter().collect(),
            kwargs: serde_json::Map::new(),
        }
    }

    /// Add a named argument.
    pub fn kwarg(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.kwargs.insert(key.into(), value);
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("encode failed: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("decode failed: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("unsupported payload version {0}")]
    Version(u8),
}

/// Encoder/decoder both the orchestrating side and the service artifact agree on.
pub trait PayloadCodec: Send + Sync + 'static {
    /// Content type advertised on the wire.
    fn content_type(&self) -> &'static str;

    fn encode_call(&self, call: &CallArgs) -> Result<Vec<u8>, CodecError>;
    fn decode_call(&self, bytes: &[u8]) -> Result<CallArgs, CodecError>;

    fn encode_value(&self, value: &serde_json::Value) -> Result<Vec<u8>, CodecError>;
    fn decode_value(&self, bytes: &[u8]) -> Result<serde_json::Value, CodecError>;
}

#[derive(Serialize, Deserialize)]
struct CallEnvelope {
    v: u8,
    args: Vec<serde_json::Value>,
    kwargs: serde_json::Map<String, serde_json::Value>,
}

#[derive(Serialize, Deserialize)]
struct ValueEnvelope {
    v: u8,
    value: serde_json::Value,
}

/// Versioned JSON envelope codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl PayloadCodec for JsonCodec {
    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn encode_call(&self, call: &CallArgs) -> Result<Vec<u8>, CodecError> {
        let envelope = CallEnvelope {
            v: CODEC_VERSION,
            args: call.args.clone(),
            kwargs: call.kwargs.clone(),
        };
        serde_json::to_vec(&envelope).map_err(CodecError::Encode)
    }

    fn decode_call(&self, bytes: &[u8]) -> Result<CallArgs, CodecError> {
        let envelope: CallEnvelope = serde_json::from_slice(bytes).map_err(CodecError::Decode)?;
        if envelope.v != CODEC_VERSION {
            return Err(CodecError::Version(envelope.v));
        }
        Ok(CallArgs {
            args: envelope.args,
            kwargs: envelope.kwargs,
        })
    }

    fn encode_value(&self, value: &serde_json::Value) -> Result<Vec<u8>, CodecError> {
        let envelope = ValueEnvelope {
            v: CODEC_VERSION,
            value: value.clone(),
        };
        serde_json::to_vec(&envelope).map_err(CodecError::Encode)
    }

    fn decode_value(&self, bytes: &[u8]) -> Result<serde_json::Value, CodecError> {
        let envelope: ValueEnvelope = serde_json::from_slice(bytes).map_err(CodecError::Decode)?;
        if envelope.v != CODEC_VERSION {
            return Err(CodecError::Version(envelope.v));
        }
        Ok(envelope.value)
    }
}
