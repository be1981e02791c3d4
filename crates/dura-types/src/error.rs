use thiserror::Error;

/// Errors produced by type operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid durable id: {0}")]
    InvalidId(String),

    #[error("inverted sequence range: lowest {lowest} > highest {highest}")]
    InvertedRange { lowest: u64, highest: u64 },
}
