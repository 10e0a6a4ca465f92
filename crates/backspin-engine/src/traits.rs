// crates/backspin-engine/src/traits.rs
//
// Seams to the outside world. The engine owns the orchestration; containers,
// codecs, resamplers, and sound devices are capabilities plugged in here.
// backspin-media implements these over ffmpeg and cpal; the test suite
// implements them over scripted synthetic media.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use backspin_core::{
    AudioFrame, AudioParams, Chapter, DecodeError, FramePayload, MediaError, PacketData,
    PlayerOptions, StreamDesc, StreamKind, SubtitleFrame,
};

/// A demuxed container. One instance per playback, owned by the reader thread.
pub trait Demuxer: Send {
    fn streams(&self) -> &[StreamDesc];
    fn chapters(&self) -> &[Chapter];

    /// Container duration in microseconds, when known.
    fn duration(&self) -> Option<i64>;
    /// Container start time in microseconds, when known.
    fn start_time(&self) -> Option<i64>;
    fn bit_rate(&self) -> i64;
    fn format_name(&self) -> &str;
    /// rtp/rtsp/sdp/udp inputs: buffering gates are bypassed for these.
    fn is_realtime(&self) -> bool;
    /// Timestamp-discontinuous formats prefer byte seeking.
    fn ts_discontinuous(&self) -> bool;
    /// False for containers without reliable random access; decode pumps
    /// then fabricate timestamps from the stream start.
    fn seekable(&self) -> bool {
        true
    }
    /// Human-readable container summary for the meta event.
    fn info_string(&self) -> String {
        String::new()
    }

    /// Pick a stream of `kind`, honoring a user specifier and a related
    /// already-chosen stream (audio prefers the program of the video stream).
    fn find_best_stream(
        &self,
        kind: StreamKind,
        wanted: Option<&str>,
        related: Option<usize>,
    ) -> Option<usize>;

    /// Blocking packet read. `Err(MediaError::Eof)` at end of input,
    /// `Err(MediaError::Read(_))` for transient failures the reader may retry.
    fn read_packet(&mut self) -> Result<PacketData, MediaError>;

    /// Seek by container time (microseconds) within `[min_us, max_us]`.
    fn seek_time(&mut self, target_us: i64, min_us: i64, max_us: i64) -> Result<(), MediaError>;
    /// Seek by byte offset within `[min, max]`.
    fn seek_bytes(&mut self, target: i64, min: i64, max: i64) -> Result<(), MediaError>;
    /// Land on the nearest keyframe at or before `target_us`. Rewind windows
    /// are built from here.
    fn seek_backward_keyframe(&mut self, target_us: i64) -> Result<(), MediaError>;

    fn read_pause(&mut self);
    fn read_play(&mut self);

    /// The demuxer must poll this flag during blocking I/O and give up when
    /// it goes true.
    fn set_interrupt(&mut self, flag: Arc<AtomicBool>);

    /// The attached picture of a cover-art stream, if that stream has one.
    fn attached_picture(&self, stream: usize) -> Option<PacketData>;
}

/// Send/receive codec for audio and video streams. One per stream.
pub trait FrameDecoder: Send {
    fn send_packet(&mut self, pkt: &PacketData) -> Result<(), DecodeError>;
    /// Enter drain mode; subsequent receives flush out buffered frames and
    /// then return `DecodeError::Eof`.
    fn send_eof(&mut self) -> Result<(), DecodeError>;
    fn receive_frame(&mut self) -> Result<FramePayload, DecodeError>;
    fn flush(&mut self);
}

/// Single-shot subtitle codec.
pub trait SubtitleDecoder: Send {
    fn decode(&mut self, pkt: &PacketData) -> Result<Option<SubtitleFrame>, DecodeError>;
    fn flush(&mut self);
}

/// Sample-format/rate converter with playout compensation.
pub trait Resampler: Send {
    /// Convert `frame` into the target format, appending interleaved bytes to
    /// `out` (which is cleared first). Returns the number of output samples.
    fn convert(&mut self, frame: &AudioFrame, out: &mut Vec<u8>) -> Result<usize, MediaError>;
    /// Distribute a `delta` sample correction across the next `window`
    /// output samples.
    fn set_compensation(&mut self, delta: i32, window: i32) -> Result<(), MediaError>;
}

/// Hardware format negotiated with the audio device. Samples are signed
/// 16-bit native-endian; only rate, channel count, and period size vary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AudioSpec {
    pub freq: u32,
    pub channels: u16,
    /// Samples per device period.
    pub samples: u16,
}

impl AudioSpec {
    /// Device period size in bytes.
    pub fn buffer_bytes(&self) -> usize {
        self.samples as usize * self.channels as usize * 2
    }
}

pub type AudioCallback = Box<dyn FnMut(&mut [u8]) + Send>;

/// Pull-based audio device.
pub trait AudioSink: Send {
    /// Negotiate a device format near `wanted`. Adapters walk the candidate
    /// rate/channel ladder ({44100, 48000, 96000, 192000} × {1, 2, 4, 6})
    /// before giving up.
    fn open(&mut self, wanted: &AudioSpec) -> Result<AudioSpec, MediaError>;
    /// Register the pull callback. The device stays paused until `pause(false)`.
    fn start(&mut self, callback: AudioCallback) -> Result<(), MediaError>;
    fn pause(&mut self, paused: bool);
    fn close(&mut self);
}

/// Optional post-processing graph. The engine reconfigures it whenever the
/// input format changes and pumps frames through push/pull.
pub trait FilterGraph: Send {
    fn reconfigure(&mut self, description: &str, input: &FramePayload) -> Result<(), MediaError>;
    fn push(&mut self, frame: FramePayload) -> Result<(), MediaError>;
    fn pull(&mut self) -> Result<Option<FramePayload>, MediaError>;
}

/// Factory bundling everything the engine cannot build itself.
pub trait MediaBackend: Send + Sync {
    fn open(&self, url: &str, options: &PlayerOptions) -> Result<Box<dyn Demuxer>, MediaError>;

    fn new_decoder(
        &self,
        stream: &StreamDesc,
        options: &PlayerOptions,
    ) -> Result<Box<dyn FrameDecoder>, MediaError>;

    fn new_subtitle_decoder(
        &self,
        stream: &StreamDesc,
        options: &PlayerOptions,
    ) -> Result<Box<dyn SubtitleDecoder>, MediaError>;

    fn new_resampler(
        &self,
        src: &AudioParams,
        dst: &AudioParams,
    ) -> Result<Box<dyn Resampler>, MediaError>;

    /// Optional capability; `None` disables the filter insertion points.
    fn new_filter_graph(&self, _options: &PlayerOptions) -> Option<Box<dyn FilterGraph>> {
        None
    }
}
