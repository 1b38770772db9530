use thiserror::Error;

#[derive(Error, Debug)]
pub enum DataError {
    #[error("invalid keyword: {0:?}")]
    InvalidKeyword(String),

    #[error("record decode failed: {0}")]
    Decode(String),

    #[error("record encode failed: {0}")]
    Encode(String),

    #[error("unexpected value kind: expected {expected}, got {got}")]
    UnexpectedKind {
        expected: &'static str,
        got: &'static str,
    },

    #[error("unknown value kind code {0}")]
    UnknownKind(u64),
}

pub type Result<T> = std::result::Result<T, DataError>;
