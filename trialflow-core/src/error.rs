use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failures raised by loops, staircases and attribute updates.
///
/// Every variant is attributable to a single call and is returned to that
/// caller; nothing here is retried internally.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed construction parameters, e.g. a QUEST condition without `startValSd`.
    #[error("invalid configuration for {origin}: {reason}")]
    Configuration { origin: String, reason: String },

    #[error("invalid response {value} for {origin}: the response must be either 0 or 1")]
    InvalidResponse { origin: String, value: i64 },

    /// A response arrived after the procedure had already finished.
    #[error("{origin} has finished and takes no further responses")]
    Finished { origin: String },

    #[error("unsupported \"{operator}\" operation on attribute {attribute}")]
    UnsupportedOperation { attribute: String, operator: String },

    #[error(
        "cannot update attribute {attribute}: the current value ({current} elements) and the operand ({operand} elements) should have the same size"
    )]
    SizeMismatch {
        attribute: String,
        current: usize,
        operand: usize,
    },

    #[error("attribute {attribute} holds a non-numeric value")]
    NotNumeric { attribute: String },

    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn configuration(origin: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Configuration {
            origin: origin.into(),
            reason: reason.into(),
        }
    }
}

/// Checks that a staircase response is one of the two accepted values.
pub fn ensure_binary_response(origin: &str, response: i64) -> Result<bool> {
    match response {
        0 => Ok(false),
        1 => Ok(true),
        value => Err(Error::InvalidResponse {
            origin: origin.to_string(),
            value,
        }),
    }
}
