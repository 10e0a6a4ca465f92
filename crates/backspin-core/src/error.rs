// crates/backspin-core/src/error.rs

use thiserror::Error;

/// Engine-level failures. Fatal open errors end the playback loop with an
/// `Event::Error`; everything else is recoverable at its call site.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("failed to open input: {0}")]
    Open(String),
    #[error("no audio or video stream in media")]
    NoStreams,
    #[error("decoder setup failed: {0}")]
    DecoderSetup(String),
    /// Transient demuxer read failure; the reader backs off and retries.
    #[error("read error: {0}")]
    Read(String),
    #[error("end of input")]
    Eof,
    #[error("seek failed: {0}")]
    Seek(String),
    #[error("resampler failure: {0}")]
    Resample(String),
    #[error("audio device unavailable: {0}")]
    SinkUnavailable(String),
    /// A queue abort cut the operation short.
    #[error("operation cancelled")]
    Cancelled,
}

/// Codec pump results for the send/receive seam.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The codec needs the other half of the send/receive cycle first.
    #[error("decoder needs more input")]
    Again,
    /// Internal buffers fully drained after a null packet.
    #[error("decoder drained")]
    Eof,
    #[error("decode failed: {0}")]
    Fatal(String),
}
