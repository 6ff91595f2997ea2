//! Wire protocol for the sync surface.
//!
//! One TCP connection carries one call. Every frame is a 4-byte
//! little-endian length prefix followed by a bincode-encoded message.
//! The client opens with a [`CallEnvelope`]; for uploads it then sends
//! [`ClientFrame::Chunk`] frames and half-closes its write side, for
//! downloads the server streams [`Reply::Chunk`] frames and half-closes.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::model::{format_timestamp, parse_timestamp, DataItem, DataKind};
use crate::{Error, Result};

/// Protocol version spoken by this build.
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum payload of a single file chunk. The server rejects larger
/// chunks instead of buffering them.
pub const MAX_CHUNK_SIZE: usize = 32 * 1024;

/// Maximum size of one frame body.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length of the frame header (little-endian u32).
pub const FRAME_HEADER_LEN: usize = 4;

/// Metadata key carrying the bearer token.
pub const AUTHORIZATION_KEY: &str = "authorization";

/// A record as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    /// Numeric [`DataKind`] code.
    pub kind: i32,
    pub content: String,
    pub meta: String,
    /// RFC3339, whole-second resolution.
    pub updated_at: String,
}

impl Record {
    /// Wire form of a domain record. Ownership never crosses the wire;
    /// the receiving side assigns `user_id` itself.
    pub fn from_item(item: &DataItem) -> Self {
        Self {
            id: item.id.clone(),
            kind: item.kind.code(),
            content: item.content.clone(),
            meta: item.meta.clone(),
            updated_at: format_timestamp(item.updated_at),
        }
    }

    /// Domain form; the caller supplies the owning user.
    pub fn into_item(self, user_id: &str) -> Result<DataItem> {
        Ok(DataItem {
            kind: DataKind::from_code(self.kind)?,
            updated_at: parse_timestamp(&self.updated_at)?,
            id: self.id,
            content: self.content,
            meta: self.meta,
            user_id: user_id.to_string(),
        })
    }
}

/// Convert a slice of domain records to wire form.
pub fn records_from_items(items: &[DataItem]) -> Vec<Record> {
    items.iter().map(Record::from_item).collect()
}

/// Convert wire records to domain form, tagging each with `user_id`.
pub fn items_from_records(records: Vec<Record>, user_id: &str) -> Result<Vec<DataItem>> {
    records
        .into_iter()
        .map(|r| r.into_item(user_id))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRecordsRequest {
    pub items: Vec<Record>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRecordsResponse {
    pub merged: Vec<Record>,
    pub upload_list: Vec<Record>,
    pub download_list: Vec<Record>,
}

/// One slice of a streamed file. Every chunk of a transfer carries the
/// same record id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadRequest {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadResult {
    pub id: String,
    pub success: bool,
    pub message: String,
}

/// Wire code of the error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthenticated,
    MalformedInput,
    NotFound,
    Conflict,
    Transient,
    Cancelled,
    Internal,
}

/// Error reply carried on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub code: ErrorCode,
    pub message: String,
}

/// Body of the opening frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CallBody {
    SyncRecords(SyncRecordsRequest),
    /// Announces a client-streaming upload; [`ClientFrame::Chunk`]
    /// frames follow until the client half-closes its write side.
    UploadFile,
    DownloadFile(DownloadRequest),
}

/// First frame of every call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallEnvelope {
    pub version: u8,
    /// Transport metadata; the bearer token lives under
    /// [`AUTHORIZATION_KEY`] as `Bearer <token>`.
    pub metadata: BTreeMap<String, String>,
    pub body: CallBody,
}

impl CallEnvelope {
    /// Envelope carrying `body` authenticated with `token`.
    pub fn new(body: CallBody, token: &str) -> Self {
        let mut metadata = BTreeMap::new();
        metadata.insert(AUTHORIZATION_KEY.to_string(), format!("Bearer {token}"));
        Self {
            version: PROTOCOL_VERSION,
            metadata,
            body,
        }
    }

    /// The authorization metadata value, if present.
    pub fn authorization(&self) -> Option<&str> {
        self.metadata.get(AUTHORIZATION_KEY).map(String::as_str)
    }
}

/// Frames the client may send after the envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientFrame {
    Chunk(Chunk),
}

/// Frames the server sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Reply {
    SyncRecords(SyncRecordsResponse),
    UploadResult(UploadResult),
    Chunk(Chunk),
    Error(Status),
}

/// Length-prefixed bincode codec.
pub struct Codec;

impl Codec {
    /// Encode a message with its length prefix.
    pub fn encode<T: Serialize>(msg: &T) -> Result<Bytes> {
        let payload = bincode::serialize(msg)
            .map_err(|e| Error::Internal(format!("frame serialization failed: {e}")))?;
        if payload.len() > MAX_FRAME_SIZE {
            return Err(Error::Internal(format!(
                "frame of {} bytes exceeds the {} byte limit",
                payload.len(),
                MAX_FRAME_SIZE
            )));
        }

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
        buf.put_u32_le(payload.len() as u32);
        buf.put_slice(&payload);
        Ok(buf.freeze())
    }

    /// Decode one message from `buf`.
    ///
    /// Returns `Ok(None)` when more data is needed; the buffer is only
    /// consumed on a successful decode.
    pub fn decode<T: DeserializeOwned>(buf: &mut BytesMut) -> Result<Option<T>> {
        if buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(Error::MalformedInput(format!(
                "frame length {len} exceeds the {MAX_FRAME_SIZE} byte limit"
            )));
        }
        if buf.len() < FRAME_HEADER_LEN + len {
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_LEN);
        let payload = buf.split_to(len);
        let msg = bincode::deserialize(&payload)
            .map_err(|e| Error::MalformedInput(format!("frame deserialization failed: {e}")))?;
        Ok(Some(msg))
    }
}

/// Write one framed message to a stream.
pub async fn write_message<W, T>(writer: &mut W, msg: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = Codec::encode(msg)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one framed message from a stream.
///
/// Returns `Ok(None)` on a clean EOF at a frame boundary (the peer
/// half-closed); EOF inside a frame is an error.
pub async fn read_message<R, T>(reader: &mut R, buf: &mut BytesMut) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    loop {
        if let Some(msg) = Codec::decode(buf)? {
            return Ok(Some(msg));
        }
        let n = reader.read_buf(buf).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(Error::MalformedInput(
                "connection closed mid-frame".into(),
            ));
        }
    }
}
