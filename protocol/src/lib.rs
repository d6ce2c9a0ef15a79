//! Stratum wire protocols for Orepool
//!
//! This crate implements everything that touches raw bytes on a miner
//! connection: detection of the protocol variant from the first bytes of a
//! stream, the Stratum V1 line-delimited JSON-RPC shapes, the Stratum V2
//! binary frame and message codec, and the Noise-encrypted channel V2
//! traffic runs over.

use thiserror::Error;

pub mod detect;
pub mod noise;
pub mod v1;
pub mod v2;

pub use detect::{detect, Detected};
pub use noise::{NoiseKeypair, NoiseReceiver, NoiseRole, NoiseSender, NoiseSession, NoiseTransport};
pub use v2::frame::{Frame, FrameCodec, FrameHeader};
pub use v2::Message;

/// Protocol layer errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Unknown message type: {0:#04x}")]
    UnknownMessageType(u8),

    #[error("Field out of bounds: {0}")]
    FieldOutOfBounds(String),

    #[error("Noise handshake failed: {0}")]
    Handshake(String),

    #[error("Noise transport failure: {0}")]
    Transport(String),

    #[error("Nonce space exhausted")]
    NonceExhausted,

    #[error("Frame exceeds maximum size: {0} bytes")]
    OversizedFrame(usize),

    #[error("Protocol detection timed out")]
    DetectTimeout,
}

impl From<snow::Error> for ProtocolError {
    fn from(err: snow::Error) -> Self {
        ProtocolError::Transport(err.to_string())
    }
}
