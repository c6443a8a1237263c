use anyhow::Result;
use bytes::BytesMut;

use crate::error::Error;
use crate::metadata::{Metadata, Mutation};

/// Outcome of feeding inbound bytes to a codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStatus {
    /// A full frame is not yet available; unread bytes stay in the buffer.
    Waiting,
    /// One frame was consumed and the metadata filled in.
    Done,
}

/// Outcome of handing upstream response bytes to the response decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamResponseStatus {
    MoreDataRequired,
    Complete,
    /// The response stream is unusable; the upstream connection must be
    /// reset.
    Reset,
    /// Discard the partial response state and decode from scratch on the
    /// next data event.
    Retry,
}

/// What kind of reply a direct response encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseType {
    /// A reply message carrying a success payload.
    SuccessReply,
    /// A reply message carrying an error payload.
    ErrorReply,
    /// A protocol-level exception message.
    Exception,
}

/// A wire codec for one meta protocol. One instance decodes or encodes a
/// single direction of a single stream; instances are created per use via
/// [`CodecFactory`].
pub trait Codec: Send {
    /// Parse at most one frame out of `buffer` into `metadata`. Returns
    /// `Waiting` when more bytes are needed; unread bytes must be left in
    /// the buffer.
    fn decode(&mut self, buffer: &mut BytesMut, metadata: &mut Metadata) -> Result<DecodeStatus>;

    /// Serialize one frame. `buffer` holds the original encoded message
    /// (possibly empty) and is replaced with the outgoing bytes, with
    /// `mutation` spliced into the headers.
    fn encode(&mut self, metadata: &Metadata, mutation: &Mutation, buffer: &mut BytesMut)
        -> Result<()>;

    /// Encode a protocol exception describing `error`, used for locally
    /// generated replies.
    fn on_error(&mut self, metadata: &Metadata, error: &Error, buffer: &mut BytesMut);
}

pub trait CodecFactory: Send + Sync {
    fn create_codec(&self) -> Box<dyn Codec>;
}

/// A locally generated reply that bypasses the upstream path.
pub trait DirectResponse: Send {
    /// Encode this response for the request described by `metadata`.
    fn encode(
        &self,
        metadata: &mut Metadata,
        codec: &mut dyn Codec,
        buffer: &mut BytesMut,
    ) -> Result<ResponseType>;
}

/// Direct response wrapping a proxy-level [`Error`], encoded as a
/// protocol exception.
#[derive(Debug, Clone)]
pub struct AppException {
    pub error: Error,
}

impl AppException {
    pub fn new(error: Error) -> Self {
        Self { error }
    }
}

impl DirectResponse for AppException {
    fn encode(
        &self,
        metadata: &mut Metadata,
        codec: &mut dyn Codec,
        buffer: &mut BytesMut,
    ) -> Result<ResponseType> {
        codec.on_error(metadata, &self.error, buffer);
        Ok(ResponseType::Exception)
    }
}
