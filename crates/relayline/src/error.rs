use thiserror::Error;

/// Errors raised by the relay and the correlator.
#[derive(Error, Debug)]
pub enum RelayError {
    /// A frame or an inner payload is not valid JSON of the expected shape.
    #[error("decode failed ({context}): {source}")]
    Decode {
        context: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("encode failed: {0}")]
    Encode(#[source] serde_json::Error),

    /// The transport refused the request; no response sequence exists.
    #[error("delivery failed for {id} seq {seq}")]
    DeliveryFailed { id: String, seq: u64 },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[source] Box<tokio_tungstenite::tungstenite::Error>),

    #[error("channel closed")]
    Closed,
}

impl RelayError {
    pub fn decode(context: &'static str, source: serde_json::Error) -> Self {
        Self::Decode { context, source }
    }

    pub fn is_decode(&self) -> bool {
        matches!(self, Self::Decode { .. })
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for RelayError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(err))
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
