use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// Well-known metadata keys the proxy itself writes.
pub mod reserved {
    /// Address of the upstream host that actually served the request.
    pub const REAL_SERVER_ADDRESS: &str = "x-real-server-address";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    Request,
    Response,
    Oneway,
    StreamInit,
    StreamData,
    StreamClose,
    Heartbeat,
}

/// Per-message metadata produced by the codec on decode, mutated by
/// filters, and read back by the router and the encoder.
///
/// Headers keep insertion order; lookup is last-write-wins so a later
/// `put` shadows an earlier value without disturbing the original entry.
#[derive(Debug, Clone)]
pub struct Metadata {
    message_type: MessageType,
    request_id: u64,
    stream_id: u64,
    headers: Vec<(String, String)>,
    origin_message: BytesMut,
}

impl Metadata {
    pub fn new(message_type: MessageType) -> Self {
        Self {
            message_type,
            request_id: 0,
            stream_id: 0,
            headers: Vec::new(),
            origin_message: BytesMut::new(),
        }
    }

    /// Build response metadata for a request: ids carry over, headers
    /// start from the request's so reserved keys survive into the reply.
    pub fn response_for(request: &Metadata) -> Self {
        Self {
            message_type: MessageType::Response,
            request_id: request.request_id,
            stream_id: request.stream_id,
            headers: request.headers.clone(),
            origin_message: BytesMut::new(),
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn set_message_type(&mut self, message_type: MessageType) {
        self.message_type = message_type;
    }

    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    pub fn set_request_id(&mut self, request_id: u64) {
        self.request_id = request_id;
    }

    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }

    pub fn set_stream_id(&mut self, stream_id: u64) {
        self.stream_id = stream_id;
    }

    pub fn put_string(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers.push((key.into(), value.into()));
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn set_headers(&mut self, headers: Vec<(String, String)>) {
        self.headers = headers;
    }

    /// The original inbound frame as received from the wire.
    pub fn origin_message(&self) -> &BytesMut {
        &self.origin_message
    }

    pub fn set_origin_message(&mut self, message: BytesMut) {
        self.origin_message = message;
    }

    /// Move the original frame out, leaving the metadata without a body.
    /// The upstream request takes ownership of the bytes it forwards.
    pub fn take_origin_message(&mut self) -> BytesMut {
        std::mem::take(&mut self.origin_message)
    }
}

/// Append-only set of header entries a filter defers to encode time.
/// The codec splices these into the outgoing frame, overriding any
/// header with the same key.
#[derive(Debug, Clone, Default)]
pub struct Mutation {
    entries: Vec<(String, String)>,
}

impl Mutation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.push((key.into(), value.into()));
    }

    pub fn extend_from(&mut self, entries: &[(String, String)]) {
        self.entries.extend(entries.iter().cloned());
    }

    pub fn entries(&self) -> &[(String, String)] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub type SharedMetadata = Arc<Mutex<Metadata>>;
pub type SharedMutation = Arc<Mutex<Mutation>>;

pub fn shared_metadata(metadata: Metadata) -> SharedMetadata {
    Arc::new(Mutex::new(metadata))
}

pub fn shared_mutation(mutation: Mutation) -> SharedMutation {
    Arc::new(Mutex::new(mutation))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_lookup_is_last_write_wins() {
        let mut md = Metadata::new(MessageType::Request);
        md.put_string("env", "prod");
        md.put_string("env", "stage");
        assert_eq!(md.get_string("env"), Some("stage"));
        assert_eq!(md.headers().len(), 2);
    }

    #[test]
    fn test_take_origin_message_leaves_empty_body() {
        let mut md = Metadata::new(MessageType::Request);
        md.set_origin_message(BytesMut::from(&b"payload"[..]));
        let taken = md.take_origin_message();
        assert_eq!(&taken[..], b"payload");
        assert!(md.origin_message().is_empty());
    }

    #[test]
    fn test_response_for_carries_ids_and_headers() {
        let mut md = Metadata::new(MessageType::Request);
        md.set_request_id(42);
        md.set_stream_id(7);
        md.put_string(reserved::REAL_SERVER_ADDRESS, "10.0.0.1:9000");

        let resp = Metadata::response_for(&md);
        assert_eq!(resp.message_type(), MessageType::Response);
        assert_eq!(resp.request_id(), 42);
        assert_eq!(resp.stream_id(), 7);
        assert_eq!(
            resp.get_string(reserved::REAL_SERVER_ADDRESS),
            Some("10.0.0.1:9000")
        );
    }
}
