//! Error types for LoRaWAN primitives.

use thiserror::Error;

/// Errors produced when constructing or serializing LoRaWAN primitives.
#[derive(Debug, Error, PartialEq)]
pub enum LorawanError {
    #[error("Exactly {expected} bytes expected, got {got}")]
    InvalidLength { expected: usize, got: usize },

    #[error("Invalid hex encoding: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("Unknown MType value: {0}")]
    UnknownMType(u8),

    #[error("Frame too short: {0} bytes")]
    FrameTooShort(usize),

    #[error("FPort is required when FRMPayload is set")]
    MissingFPort,
}
