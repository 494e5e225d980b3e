use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid hierarchy level {level} (depth {depth})")]
    InvalidLevel { level: u8, depth: u8 },

    #[error("Address component {value} out of range for level {level}")]
    AddressOutOfRange { level: u8, value: u32 },

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Unknown message kind: {0}")]
    UnknownMessageKind(String),
}
