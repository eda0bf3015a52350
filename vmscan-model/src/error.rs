use std::fmt::{self, Display};

/// Errors produced by model constructors and parsers.
#[derive(Debug)]
pub enum ModelError {
    InvalidId(uuid::Error),
    InvalidState(String),
}

impl Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::InvalidId(err) => write!(f, "invalid id: {err}"),
            ModelError::InvalidState(raw) => {
                write!(f, "invalid state: {raw}")
            }
        }
    }
}

impl std::error::Error for ModelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ModelError::InvalidId(err) => Some(err),
            ModelError::InvalidState(_) => None,
        }
    }
}

impl From<uuid::Error> for ModelError {
    fn from(err: uuid::Error) -> Self {
        ModelError::InvalidId(err)
    }
}

pub type Result<T> = std::result::Result<T, ModelError>;
