//! Filter abstractions for the per-request chain. A filter participates
//! in decoding (downstream to upstream), encoding (upstream to
//! downstream), or both; the chain holds the two ordered sequences and
//! tracks shared entries.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::metadata::{SharedMetadata, SharedMutation};
use crate::stream::StreamHandle;

/// Result of one filter invocation, steering the chain driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterStatus {
    /// Hand the message to the next filter.
    ContinueIteration,
    /// Hold the chain at this filter until it calls
    /// `continue_decoding`/`continue_encoding`.
    PauseIteration,
    /// End processing for this message without a reply.
    StopIteration,
    /// Restart the chain at the head with the same metadata.
    Retry,
}

/// Ingress-side filter.
pub trait DecoderFilter: Send {
    /// Called once before any message is delivered. Callbacks must not be
    /// used after `on_destroy`.
    fn set_decoder_callbacks(&mut self, callbacks: StreamHandle);

    fn on_message_decoded(
        &mut self,
        metadata: &SharedMetadata,
        mutation: &SharedMutation,
    ) -> FilterStatus;

    /// Cleanup fence: no callback may be issued after this returns.
    fn on_destroy(&mut self) {}
}

/// Egress-side filter.
pub trait EncoderFilter: Send {
    fn set_encoder_callbacks(&mut self, callbacks: StreamHandle);

    fn on_message_encoded(
        &mut self,
        metadata: &SharedMetadata,
        mutation: &SharedMutation,
    ) -> FilterStatus;

    fn on_destroy(&mut self) {}
}

/// A filter participating in both directions. Installed once, it appears
/// in both chain sequences as a shared entry.
pub trait CodecFilter: Send {
    fn set_decoder_callbacks(&mut self, callbacks: StreamHandle);
    fn set_encoder_callbacks(&mut self, callbacks: StreamHandle);
    fn on_message_decoded(
        &mut self,
        metadata: &SharedMetadata,
        mutation: &SharedMutation,
    ) -> FilterStatus;
    fn on_message_encoded(
        &mut self,
        metadata: &SharedMetadata,
        mutation: &SharedMutation,
    ) -> FilterStatus;
    fn on_destroy(&mut self) {}
}

/// Sink handed to a [`FilterChainFactory`] for installing filters in
/// order.
pub trait FilterChainFactoryCallbacks {
    fn add_decoder_filter(&mut self, filter: Box<dyn DecoderFilter>);
    fn add_encoder_filter(&mut self, filter: Box<dyn EncoderFilter>);
    fn add_filter(&mut self, filter: Box<dyn CodecFilter>);
}

/// Creates the application filter chain for each new request stream. The
/// stream itself pins the router as the terminal decoder filter; factories
/// install everything before it.
pub trait FilterChainFactory: Send + Sync {
    fn create_filter_chain(&self, callbacks: &mut dyn FilterChainFactoryCallbacks);
}

/// Factory installing no custom filters.
#[derive(Debug, Default)]
pub struct EmptyFilterChainFactory;

impl FilterChainFactory for EmptyFilterChainFactory {
    fn create_filter_chain(&self, _callbacks: &mut dyn FilterChainFactoryCallbacks) {}
}

/// Shared entry wrapper: one [`CodecFilter`] instance surfaced to both
/// chain sequences, with a single-shot destroy guard.
#[derive(Clone)]
struct SharedCodecFilter {
    inner: Arc<Mutex<Box<dyn CodecFilter>>>,
    destroyed: Arc<AtomicBool>,
}

impl SharedCodecFilter {
    fn new(filter: Box<dyn CodecFilter>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(filter)),
            destroyed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn destroy(&self) {
        if !self.destroyed.swap(true, Ordering::SeqCst) {
            self.inner.lock().expect("codec filter mutex poisoned").on_destroy();
        }
    }
}

struct CodecDecoderHalf(SharedCodecFilter);

impl DecoderFilter for CodecDecoderHalf {
    fn set_decoder_callbacks(&mut self, callbacks: StreamHandle) {
        self.0
            .inner
            .lock()
            .expect("codec filter mutex poisoned")
            .set_decoder_callbacks(callbacks);
    }

    fn on_message_decoded(
        &mut self,
        metadata: &SharedMetadata,
        mutation: &SharedMutation,
    ) -> FilterStatus {
        self.0
            .inner
            .lock()
            .expect("codec filter mutex poisoned")
            .on_message_decoded(metadata, mutation)
    }

    fn on_destroy(&mut self) {
        self.0.destroy();
    }
}

struct CodecEncoderHalf(SharedCodecFilter);

impl EncoderFilter for CodecEncoderHalf {
    fn set_encoder_callbacks(&mut self, callbacks: StreamHandle) {
        self.0
            .inner
            .lock()
            .expect("codec filter mutex poisoned")
            .set_encoder_callbacks(callbacks);
    }

    fn on_message_encoded(
        &mut self,
        metadata: &SharedMetadata,
        mutation: &SharedMutation,
    ) -> FilterStatus {
        self.0
            .inner
            .lock()
            .expect("codec filter mutex poisoned")
            .on_message_encoded(metadata, mutation)
    }

    fn on_destroy(&mut self) {
        self.0.destroy();
    }
}

/// Collector used by the stream while running a factory.
#[derive(Default)]
pub(crate) struct FilterChainBuilder {
    pub decoders: Vec<Box<dyn DecoderFilter>>,
    pub encoders: Vec<Box<dyn EncoderFilter>>,
}

impl FilterChainFactoryCallbacks for FilterChainBuilder {
    fn add_decoder_filter(&mut self, filter: Box<dyn DecoderFilter>) {
        self.decoders.push(filter);
    }

    fn add_encoder_filter(&mut self, filter: Box<dyn EncoderFilter>) {
        self.encoders.push(filter);
    }

    fn add_filter(&mut self, filter: Box<dyn CodecFilter>) {
        let shared = SharedCodecFilter::new(filter);
        self.decoders.push(Box::new(CodecDecoderHalf(shared.clone())));
        self.encoders.push(Box::new(CodecEncoderHalf(shared)));
    }
}
