//! Message wrapper -- two-layer framing of payloads stored on a swarm.
//!
//! Inner layer: an `Envelope` (type, timestamp, optional legacy source,
//! source device, opaque content). Outer layer, used by the default and
//! legacy-group namespaces: a websocket request frame with empty verb and
//! path, id 0 and the serialized envelope as body.
//!
//! Whether the outer layer is present is always decided by the caller.
//! Unwrapping never sniffs the bytes.

use crate::account::AccountId;
use crate::namespace::Namespace;
use crate::proto::{put_bytes, put_uint, FieldReader, Value};
use crate::MAX_MESSAGE_BYTES;

pub use crate::proto::DecodeError;

// Envelope fields.
const ENVELOPE_TYPE: u32 = 1;
const ENVELOPE_SOURCE: u32 = 2;
const ENVELOPE_TIMESTAMP: u32 = 5;
const ENVELOPE_SOURCE_DEVICE: u32 = 7;
const ENVELOPE_CONTENT: u32 = 8;
const ENVELOPE_SERVER_TIMESTAMP: u32 = 10;

// WebSocketMessage fields.
const WS_TYPE: u32 = 1;
const WS_REQUEST: u32 = 2;
const WS_TYPE_REQUEST: u64 = 1;

// WebSocketRequestMessage fields.
const WS_REQUEST_VERB: u32 = 1;
const WS_REQUEST_PATH: u32 = 2;
const WS_REQUEST_BODY: u32 = 3;
const WS_REQUEST_ID: u32 = 4;

/// The only device id the network uses.
pub const SOURCE_DEVICE: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeType {
    SessionMessage,
    ClosedGroupMessage,
}

impl EnvelopeType {
    pub fn code(self) -> u64 {
        match self {
            EnvelopeType::SessionMessage => 6,
            EnvelopeType::ClosedGroupMessage => 7,
        }
    }

    pub fn from_code(code: u64) -> Result<Self, DecodeError> {
        match code {
            6 => Ok(EnvelopeType::SessionMessage),
            7 => Ok(EnvelopeType::ClosedGroupMessage),
            other => Err(DecodeError::UnknownEnvelopeType(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub kind: EnvelopeType,
    /// Legacy sender id; `None` when the sender authenticates inside the content.
    pub source: Option<String>,
    pub source_device: u32,
    pub timestamp_ms: u64,
    pub content: Vec<u8>,
    pub server_timestamp_ms: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
pub enum WrapperError {
    #[error("failed to wrap message in envelope: {0}")]
    FailedToWrapMessageInEnvelope(String),
    #[error("failed to wrap envelope in websocket message: {0}")]
    FailedToWrapEnvelopeInWebSocketMessage(String),
    #[error("failed to unwrap message in namespace {namespace}: {source}")]
    FailedToUnwrap {
        namespace: Namespace,
        #[source]
        source: DecodeError,
    },
}

impl Envelope {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.content.len() + 96);
        put_uint(&mut buf, ENVELOPE_TYPE, self.kind.code());
        if let Some(source) = self.source.as_deref().filter(|s| !s.is_empty()) {
            put_bytes(&mut buf, ENVELOPE_SOURCE, source.as_bytes());
        }
        put_uint(&mut buf, ENVELOPE_TIMESTAMP, self.timestamp_ms);
        put_uint(&mut buf, ENVELOPE_SOURCE_DEVICE, self.source_device as u64);
        put_bytes(&mut buf, ENVELOPE_CONTENT, &self.content);
        if let Some(ts) = self.server_timestamp_ms {
            put_uint(&mut buf, ENVELOPE_SERVER_TIMESTAMP, ts);
        }
        buf
    }

    fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let mut kind = None;
        let mut source = None;
        let mut timestamp_ms = None;
        let mut source_device = SOURCE_DEVICE;
        let mut content = None;
        let mut server_timestamp_ms = None;

        let mut reader = FieldReader::new(data);
        while let Some((field, value)) = reader.next_field()? {
            match (field, value) {
                (ENVELOPE_TYPE, Value::Varint(v)) => kind = Some(EnvelopeType::from_code(v)?),
                (ENVELOPE_SOURCE, Value::Bytes(b)) => {
                    let s = std::str::from_utf8(b).map_err(|_| DecodeError::InvalidUtf8("source"))?;
                    if !s.is_empty() {
                        source = Some(s.to_string());
                    }
                }
                (ENVELOPE_TIMESTAMP, Value::Varint(v)) => timestamp_ms = Some(v),
                (ENVELOPE_SOURCE_DEVICE, Value::Varint(v)) => {
                    source_device = u32::try_from(v)
                        .map_err(|_| DecodeError::OutOfRange("source_device"))?;
                }
                (ENVELOPE_CONTENT, Value::Bytes(b)) => content = Some(b.to_vec()),
                (ENVELOPE_SERVER_TIMESTAMP, Value::Varint(v)) => server_timestamp_ms = Some(v),
                _ => {}
            }
        }

        Ok(Self {
            kind: kind.ok_or(DecodeError::MissingField("type"))?,
            source,
            source_device,
            timestamp_ms: timestamp_ms.ok_or(DecodeError::MissingField("timestamp"))?,
            content: content.ok_or(DecodeError::MissingField("content"))?,
            server_timestamp_ms,
        })
    }
}

fn encode_websocket_request(body: &[u8]) -> Vec<u8> {
    let mut request = Vec::with_capacity(body.len() + 16);
    put_bytes(&mut request, WS_REQUEST_VERB, b"");
    put_bytes(&mut request, WS_REQUEST_PATH, b"");
    put_bytes(&mut request, WS_REQUEST_BODY, body);
    put_uint(&mut request, WS_REQUEST_ID, 0);

    let mut frame = Vec::with_capacity(request.len() + 8);
    put_uint(&mut frame, WS_TYPE, WS_TYPE_REQUEST);
    put_bytes(&mut frame, WS_REQUEST, &request);
    frame
}

fn decode_websocket_request(data: &[u8]) -> Result<&[u8], DecodeError> {
    let mut frame_type = None;
    let mut request = None;
    let mut reader = FieldReader::new(data);
    while let Some((field, value)) = reader.next_field()? {
        match (field, value) {
            (WS_TYPE, Value::Varint(v)) => frame_type = Some(v),
            (WS_REQUEST, Value::Bytes(b)) => request = Some(b),
            _ => {}
        }
    }
    if frame_type != Some(WS_TYPE_REQUEST) {
        return Err(DecodeError::NotARequest);
    }
    let request = request.ok_or(DecodeError::MissingField("request"))?;

    let mut reader = FieldReader::new(request);
    while let Some((field, value)) = reader.next_field()? {
        if let (WS_REQUEST_BODY, Value::Bytes(b)) = (field, value) {
            return Ok(b);
        }
    }
    Err(DecodeError::MissingField("body"))
}

/// Frame `content` for storage on a swarm.
///
/// `sender_public_key` is the legacy source id and may be empty. When
/// non-empty it must be a valid account id.
pub fn wrap(
    kind: EnvelopeType,
    timestamp_ms: u64,
    sender_public_key: &str,
    content: &[u8],
    wrap_in_websocket_message: bool,
) -> Result<Vec<u8>, WrapperError> {
    if !sender_public_key.is_empty() {
        AccountId::parse(sender_public_key)
            .map_err(|e| WrapperError::FailedToWrapMessageInEnvelope(e.to_string()))?;
    }

    let envelope = Envelope {
        kind,
        source: Some(sender_public_key.to_string()).filter(|s| !s.is_empty()),
        source_device: SOURCE_DEVICE,
        timestamp_ms,
        content: content.to_vec(),
        server_timestamp_ms: None,
    };
    let encoded = envelope.encode();
    if encoded.len() > MAX_MESSAGE_BYTES {
        return Err(WrapperError::FailedToWrapMessageInEnvelope(format!(
            "envelope is {} bytes, limit {MAX_MESSAGE_BYTES}",
            encoded.len()
        )));
    }

    if !wrap_in_websocket_message {
        return Ok(encoded);
    }

    let framed = encode_websocket_request(&encoded);
    if framed.len() > MAX_MESSAGE_BYTES {
        return Err(WrapperError::FailedToWrapEnvelopeInWebSocketMessage(format!(
            "frame is {} bytes, limit {MAX_MESSAGE_BYTES}",
            framed.len()
        )));
    }
    Ok(framed)
}

/// Decode a payload retrieved from `namespace`.
pub fn unwrap(
    data: &[u8],
    namespace: Namespace,
    includes_websocket_message: bool,
) -> Result<Envelope, WrapperError> {
    let decode = || -> Result<Envelope, DecodeError> {
        let envelope_bytes = if includes_websocket_message {
            decode_websocket_request(data)?
        } else {
            data
        };
        Envelope::decode(envelope_bytes)
    };
    decode().map_err(|source| WrapperError::FailedToUnwrap { namespace, source })
}
