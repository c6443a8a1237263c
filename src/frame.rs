//! A small length-prefixed binary framing used by demos and tests.
//!
//! Wire layout: `[u32 header_len][bincode header][u32 payload_len][payload]`
//! with both length fields big-endian. The header block carries message
//! type, request/stream ids and the ordered header list.

use anyhow::{anyhow, Result};
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::codec::{Codec, CodecFactory, DecodeStatus};
use crate::error::Error;
use crate::metadata::{Metadata, MessageType, Mutation};

/// Upper bound on a single encoded header block.
const MAX_HEADER_BLOCK: usize = 1024 * 1024;
/// Upper bound on a single frame payload.
const MAX_PAYLOAD: usize = 100 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FrameHeader {
    message_type: MessageType,
    request_id: u64,
    stream_id: u64,
    headers: Vec<(String, String)>,
}

/// Decoded view of one frame.
#[derive(Debug, Clone)]
pub struct RpcFrame {
    pub message_type: MessageType,
    pub request_id: u64,
    pub stream_id: u64,
    pub headers: Vec<(String, String)>,
    pub payload: Vec<u8>,
}

impl RpcFrame {
    pub fn new(message_type: MessageType, request_id: u64, stream_id: u64) -> Self {
        Self {
            message_type,
            request_id,
            stream_id,
            headers: Vec::new(),
            payload: Vec::new(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Encode the frame to wire bytes.
    pub fn encode(&self) -> Result<BytesMut> {
        let header = FrameHeader {
            message_type: self.message_type,
            request_id: self.request_id,
            stream_id: self.stream_id,
            headers: self.headers.clone(),
        };
        let header_bytes = bincode::serialize(&header)?;
        let mut buf = BytesMut::with_capacity(8 + header_bytes.len() + self.payload.len());
        buf.put_u32(header_bytes.len() as u32);
        buf.put_slice(&header_bytes);
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        Ok(buf)
    }

    /// Decode a complete frame from wire bytes.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(anyhow!("frame too short: {} bytes", data.len()));
        }
        let mut buf = data;
        let header_len = buf.get_u32() as usize;
        if header_len > MAX_HEADER_BLOCK {
            return Err(anyhow!("header block too large: {} bytes", header_len));
        }
        if buf.len() < header_len + 4 {
            return Err(anyhow!("truncated frame header"));
        }
        let header: FrameHeader = bincode::deserialize(&buf[..header_len])?;
        buf.advance(header_len);
        let payload_len = buf.get_u32() as usize;
        if buf.len() < payload_len {
            return Err(anyhow!(
                "incomplete frame: expected {} payload bytes, got {}",
                payload_len,
                buf.len()
            ));
        }
        Ok(Self {
            message_type: header.message_type,
            request_id: header.request_id,
            stream_id: header.stream_id,
            headers: header.headers,
            payload: buf[..payload_len].to_vec(),
        })
    }
}

/// [`Codec`] implementation for the frame format above.
#[derive(Debug, Default)]
pub struct RpcFrameCodec;

impl RpcFrameCodec {
    /// Total size of the frame at the head of `buffer`, if the length
    /// fields are fully readable.
    fn frame_len(buffer: &BytesMut) -> Result<Option<usize>> {
        if buffer.len() < 4 {
            return Ok(None);
        }
        let header_len = (&buffer[..4]).get_u32() as usize;
        if header_len > MAX_HEADER_BLOCK {
            return Err(anyhow!("header block too large: {} bytes", header_len));
        }
        if buffer.len() < 4 + header_len + 4 {
            return Ok(None);
        }
        let payload_len = (&buffer[4 + header_len..4 + header_len + 4]).get_u32() as usize;
        if payload_len > MAX_PAYLOAD {
            return Err(anyhow!("frame payload too large: {} bytes", payload_len));
        }
        Ok(Some(4 + header_len + 4 + payload_len))
    }
}

impl Codec for RpcFrameCodec {
    fn decode(&mut self, buffer: &mut BytesMut, metadata: &mut Metadata) -> Result<DecodeStatus> {
        let total = match Self::frame_len(buffer)? {
            Some(total) => total,
            None => return Ok(DecodeStatus::Waiting),
        };
        if buffer.len() < total {
            return Ok(DecodeStatus::Waiting);
        }

        let raw = buffer.split_to(total);
        let frame = RpcFrame::decode(&raw)?;

        metadata.set_message_type(frame.message_type);
        metadata.set_request_id(frame.request_id);
        metadata.set_stream_id(frame.stream_id);
        for (key, value) in frame.headers {
            metadata.put_string(key, value);
        }
        metadata.set_origin_message(raw);
        Ok(DecodeStatus::Done)
    }

    fn encode(
        &mut self,
        metadata: &Metadata,
        mutation: &Mutation,
        buffer: &mut BytesMut,
    ) -> Result<()> {
        // The payload travels inside the original frame; headers are
        // re-serialized from metadata with the mutation spliced on top.
        let payload = if buffer.is_empty() {
            Vec::new()
        } else {
            RpcFrame::decode(buffer)?.payload
        };

        let mut headers = metadata.headers().to_vec();
        for (key, value) in mutation.entries() {
            headers.retain(|(k, _)| k != key);
            headers.push((key.clone(), value.clone()));
        }

        let frame = RpcFrame {
            message_type: metadata.message_type(),
            request_id: metadata.request_id(),
            stream_id: metadata.stream_id(),
            headers,
            payload,
        };
        let encoded = frame.encode()?;
        buffer.clear();
        buffer.extend_from_slice(&encoded);
        Ok(())
    }

    fn on_error(&mut self, metadata: &Metadata, error: &Error, buffer: &mut BytesMut) {
        let frame = RpcFrame::new(
            MessageType::Response,
            metadata.request_id(),
            metadata.stream_id(),
        )
        .with_header("error-type", error.error_type.as_str())
        .with_header("error-message", error.message.clone())
        .with_payload(error.message.as_bytes().to_vec());

        buffer.clear();
        match frame.encode() {
            Ok(encoded) => buffer.extend_from_slice(&encoded),
            Err(e) => {
                // An unencodable exception leaves the buffer empty; the
                // stream will be reset by the caller.
                tracing::error!(error = %e, "failed to encode exception frame");
            }
        }
    }
}

/// Factory handing out fresh [`RpcFrameCodec`] instances.
#[derive(Debug, Default)]
pub struct RpcFrameCodecFactory;

impl CodecFactory for RpcFrameCodecFactory {
    fn create_codec(&self) -> Box<dyn Codec> {
        Box::new(RpcFrameCodec)
    }
}
