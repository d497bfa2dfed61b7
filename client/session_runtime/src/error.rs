use std::io;
use thiserror::Error;

/// Failure to apply a delta to the element tree.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TreeError {
    #[error("delta path is empty")]
    EmptyPath,
    #[error("index {index} out of bounds at {path:?} (len={len})")]
    IndexOutOfBounds {
        path: Vec<u32>,
        index: u32,
        len: usize,
    },
    #[error("node at {path:?} is not a block")]
    NotABlock { path: Vec<u32> },
    #[error("node at {path:?} is not an element")]
    NotAnElement { path: Vec<u32> },
    #[error("no node at {path:?}")]
    MissingNode { path: Vec<u32> },
}

/// Errors raised while decoding and routing an inbound envelope.
///
/// All of these are non-fatal: the session surfaces them as a warning and
/// keeps processing the stream.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown forward message variant: {}", .0.as_deref().unwrap_or("<none>"))]
    UnknownVariant(Option<String>),
    #[error("forward message carries more than one variant: {0:?}")]
    AmbiguousEnvelope(Vec<String>),
    #[error("forward message is not a JSON object")]
    NotAnObject,
    #[error("malformed '{variant}' payload: {source}")]
    MalformedPayload {
        variant: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("delta missing metadata.deltaPath")]
    MissingDeltaPath,
    #[error("invalid delta: {0}")]
    InvalidDelta(#[from] TreeError),
    #[error("failed to decode forward message: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("not connected to the server; outbound message dropped")]
    Disconnected,
    #[error("form '{form_id}' has {count} upload(s) in progress")]
    UploadsInProgress { form_id: String, count: u32 },
    #[error("app has no pages to fall back to")]
    NoAppPages,
    #[error("unknown page script hash '{0}'")]
    UnknownPage(String),
    #[error("debug control is disabled")]
    DebugDisabled,
}

#[derive(Debug, Error)]
pub enum HostError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("logging initialization failed: {0}")]
    Logging(String),
    #[error("session requires a reload: {0}")]
    ReloadRequired(String),
}
