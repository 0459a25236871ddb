//! Error types for the firmware core

use thiserror::Error;

/// Main error type for the firmware
#[derive(Error, Debug)]
pub enum Error {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Upgrade error: {0}")]
    Ota(#[from] OtaError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Audio driver errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Buffer overflow")]
    BufferOverflow,

    #[error("Driver not started")]
    NotStarted,
}

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Encoder initialization failed: {0}")]
    EncoderInit(String),

    #[error("Decoder initialization failed: {0}")]
    DecoderInit(String),

    #[error("Resampler initialization failed: {0}")]
    ResamplerInit(String),

    #[error("Encoding failed: {0}")]
    EncodingFailed(String),

    #[error("Decoding failed: {0}")]
    DecodingFailed(String),

    #[error("Resampling failed: {0}")]
    ResamplingFailed(String),

    #[error("Invalid frame size: {0}")]
    InvalidFrameSize(usize),
}

/// Protocol session errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Audio channel open failed: {0}")]
    ChannelOpenFailed(String),

    #[error("Audio channel is not open")]
    ChannelClosed,

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Malformed server message: {0}")]
    MalformedMessage(String),
}

/// Firmware upgrade errors
#[derive(Error, Debug)]
pub enum OtaError {
    #[error("Version check failed: {0}")]
    CheckFailed(String),

    #[error("Download failed: {0}")]
    DownloadFailed(String),

    #[error("Flash write failed: {0}")]
    FlashFailed(String),

    #[error("Invalid firmware image: {0}")]
    InvalidImage(String),
}

/// Result type alias for the firmware
pub type Result<T> = std::result::Result<T, Error>;
