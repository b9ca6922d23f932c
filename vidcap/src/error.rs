/// Errors specific to the captioning model.
///
/// These are surfaced through `candle::Result` by wrapping them into a `candle::Error`, so every
/// fallible function in the crate keeps the usual candle signature.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Inconsistent model or decoding configuration, detected when building a module.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Inputs whose shape does not line up with the configuration.
    #[error("shape mismatch in {op}: {msg}")]
    Shape { op: &'static str, msg: String },

    /// A numeric state that has no defined result, e.g. a mask summing to zero.
    #[error("invariant violated in {op}: {msg}")]
    Invariant { op: &'static str, msg: String },

    /// Scoring inputs that cannot be matched, e.g. a hypothesis without references.
    #[error("scorer error: {0}")]
    Scorer(String),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn shape(op: &'static str, msg: impl Into<String>) -> Self {
        Self::Shape {
            op,
            msg: msg.into(),
        }
    }

    pub fn invariant(op: &'static str, msg: impl Into<String>) -> Self {
        Self::Invariant {
            op,
            msg: msg.into(),
        }
    }

    pub fn scorer(msg: impl Into<String>) -> Self {
        Self::Scorer(msg.into())
    }
}

impl From<Error> for candle::Error {
    fn from(err: Error) -> Self {
        candle::Error::wrap(err)
    }
}
