// crates/backspin-media/src/lib.rs
//
// Production adapters: ffmpeg behind the engine's demuxer/codec/resampler
// seams, cpal behind the audio sink. Everything ffmpeg-specific stays in
// this crate.

mod decode;
mod demux;
mod resample;
mod sink;
mod yuv;

use std::sync::OnceLock;

use backspin_core::{
    AudioParams, MediaError, PlayerOptions, StreamDesc, StreamKind,
};
use backspin_engine::traits::{
    AudioSink, Demuxer, FrameDecoder, MediaBackend, Resampler, SubtitleDecoder,
};

pub use sink::CpalSink;

/// One-time libav global setup.
fn ensure_init() {
    static INIT: OnceLock<()> = OnceLock::new();
    INIT.get_or_init(|| {
        if let Err(e) = ffmpeg_the_third::init() {
            tracing::error!(error = %e, "ffmpeg init failed");
        }
    });
}

/// ffmpeg-backed implementation of the engine's collaborator factory.
pub struct FfmpegBackend;

impl MediaBackend for FfmpegBackend {
    fn open(&self, url: &str, options: &PlayerOptions) -> Result<Box<dyn Demuxer>, MediaError> {
        ensure_init();
        let demuxer = demux::FfmpegDemuxer::open(url, options)
            .map_err(|e| MediaError::Open(e.to_string()))?;
        Ok(Box::new(demuxer))
    }

    fn new_decoder(
        &self,
        stream: &StreamDesc,
        options: &PlayerOptions,
    ) -> Result<Box<dyn FrameDecoder>, MediaError> {
        ensure_init();
        match stream.kind {
            StreamKind::Video => Ok(Box::new(decode::VideoDecoder::open(stream, options)?)),
            StreamKind::Audio => Ok(Box::new(decode::AudioDecoder::open(stream, options)?)),
            _ => Err(MediaError::DecoderSetup(
                "send/receive decoding is for audio and video streams".into(),
            )),
        }
    }

    fn new_subtitle_decoder(
        &self,
        stream: &StreamDesc,
        options: &PlayerOptions,
    ) -> Result<Box<dyn SubtitleDecoder>, MediaError> {
        ensure_init();
        Ok(Box::new(decode::FfmpegSubtitleDecoder::open(
            stream, options,
        )?))
    }

    fn new_resampler(
        &self,
        src: &AudioParams,
        dst: &AudioParams,
    ) -> Result<Box<dyn Resampler>, MediaError> {
        ensure_init();
        Ok(Box::new(resample::SwrResampler::new(src, dst)?))
    }
}

/// The default pull-based sink for desktop hosts.
pub fn default_sink() -> Box<dyn AudioSink> {
    Box::new(CpalSink::new())
}
