use crate::packet::CorrelationKey;
use std::io;
use thiserror::Error;

/// The primary error type for the `rootbot` library.
#[derive(Error, Debug)]
pub enum RobotError {
    #[error("Invalid frame length: expected 20 bytes, got {0}")]
    Framing(usize),

    #[error("Checksum mismatch: frame carries {stored:#04x}, computed {computed:#04x}")]
    Checksum { stored: u8, computed: u8 },

    #[error("Payload of {0} bytes exceeds the 16 byte limit")]
    PayloadTooLong(usize),

    #[error("Invalid note name: {0:?}")]
    InvalidNote(String),

    #[error("Robot is not running")]
    NotRunning,

    #[error("Timeout waiting for reply: {0}")]
    Timeout(#[from] tokio::time::error::Elapsed),

    #[error("Request {0} was abandoned before a reply arrived")]
    Abandoned(CorrelationKey),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RobotError>;
