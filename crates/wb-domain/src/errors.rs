//! Domain error types

/// Envelope encode/decode errors
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("Missing transport header: {name}")]
    MissingHeader { name: String },

    #[error("Encode error: {message}")]
    Encode { message: String },

    #[error("Decode error: {message}")]
    Decode { message: String },
}

impl EnvelopeError {
    pub fn encode<E: std::fmt::Display>(e: E) -> Self {
        EnvelopeError::Encode {
            message: e.to_string(),
        }
    }

    pub fn decode<E: std::fmt::Display>(e: E) -> Self {
        EnvelopeError::Decode {
            message: e.to_string(),
        }
    }
}
