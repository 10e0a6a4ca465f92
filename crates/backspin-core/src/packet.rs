// crates/backspin-core/src/packet.rs
//
// Demuxed packet model, stream descriptors, and timebase math.

use serde::{Deserialize, Serialize};

/// Generation counter invalidating pre-seek data for a stream. Every packet,
/// frame, and clock reading carries the serial of the seek epoch it belongs to.
pub type Serial = i32;

/// Serial assigned to packets queued between a seek landing point and the seek
/// target: decoders consume them to prime the codec, then discard the frames.
pub const SERIAL_DISCARD: Serial = 999_999;

/// A stream's rational time unit. `pts * num / den` is seconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeBase {
    pub num: i32,
    pub den: i32,
}

impl TimeBase {
    /// Container-level positions are expressed in microseconds.
    pub const MICROS: TimeBase = TimeBase { num: 1, den: 1_000_000 };

    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    pub fn to_secs(self, ts: i64) -> f64 {
        ts as f64 * self.num as f64 / self.den as f64
    }

    pub fn from_secs(self, secs: f64) -> i64 {
        (secs * self.den as f64 / self.num as f64) as i64
    }

    /// Rescale a timestamp from `self` into `to`, rounding toward zero.
    /// Widened to i128 internally: 90 kHz timebases overflow i64 fast.
    pub fn rescale(self, ts: i64, to: TimeBase) -> i64 {
        let num = ts as i128 * self.num as i128 * to.den as i128;
        let den = self.den as i128 * to.num as i128;
        if den == 0 {
            return 0;
        }
        (num / den) as i64
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamKind {
    Audio,
    Video,
    Subtitle,
    Data,
}

/// Everything the engine needs to know about a demuxed stream.
/// Mirrors the demuxer's codec parameters, flattened: video fields are zero
/// for audio streams and vice versa.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StreamDesc {
    pub index: usize,
    pub kind: StreamKind,
    pub time_base: TimeBase,
    pub start_time: Option<i64>,
    pub duration: Option<i64>,
    pub codec: String,
    /// Out-of-band codec configuration (SPS/PPS and friends).
    pub extradata: Vec<u8>,
    /// Average and container-declared frame rates as (num, den).
    pub avg_frame_rate: Option<(i32, i32)>,
    pub real_frame_rate: Option<(i32, i32)>,
    pub width: u32,
    pub height: u32,
    pub sar: (i32, i32),
    pub sample_rate: u32,
    pub channels: u16,
    /// Cover-art streams: one picture, queued once, never read again.
    pub attached_pic: bool,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Chapter {
    pub start: i64,
    pub end: i64,
    pub time_base: TimeBase,
}

impl Chapter {
    pub fn start_secs(&self) -> f64 {
        self.time_base.to_secs(self.start)
    }

    pub fn end_secs(&self) -> f64 {
        self.time_base.to_secs(self.end)
    }
}

/// One encoded unit as handed out by the demuxer.
#[derive(Clone, Debug, Default)]
pub struct PacketData {
    pub stream: usize,
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    pub duration: i64,
    /// Byte position in the input, -1 when unknown.
    pub pos: i64,
    pub keyframe: bool,
    pub payload: Vec<u8>,
}

impl PacketData {
    /// pts, falling back to dts the way play-range filtering wants it.
    pub fn best_ts(&self) -> Option<i64> {
        self.pts.or(self.dts)
    }
}

/// Queue entry. `Flush` advances the queue serial and tells the decoder to
/// drop its internal buffers; `Null` drains the decoder at end of stream.
#[derive(Clone, Debug)]
pub enum Packet {
    Data(PacketData),
    Flush,
    Null { stream: usize },
}

impl Packet {
    pub fn size(&self) -> usize {
        match self {
            Packet::Data(p) => p.payload.len(),
            _ => 0,
        }
    }

    pub fn duration(&self) -> i64 {
        match self {
            Packet::Data(p) => p.duration,
            _ => 0,
        }
    }

    pub fn is_flush(&self) -> bool {
        matches!(self, Packet::Flush)
    }
}

/// Negotiated or source audio format. Sample format is part of the params
/// because a resampler is keyed on the full (rate, channels, format) triple.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AudioParams {
    pub freq: u32,
    pub channels: u16,
    pub format: crate::frame::SampleFormat,
}

impl AudioParams {
    /// Bytes per interleaved sample frame (all channels).
    pub fn frame_size(&self) -> usize {
        self.channels as usize * self.format.bytes_per_sample()
    }

    pub fn bytes_per_sec(&self) -> usize {
        self.freq as usize * self.frame_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timebase_roundtrip() {
        let tb = TimeBase::new(1, 90_000);
        let ts = tb.from_secs(2.5);
        assert_eq!(ts, 225_000);
        assert!((tb.to_secs(ts) - 2.5).abs() < 1e-9);
    }

    #[test]
    fn rescale_micros_to_stream() {
        let micros = TimeBase::MICROS;
        let tb = TimeBase::new(1, 25);
        // 2 seconds in µs is 50 ticks at 25 Hz.
        assert_eq!(micros.rescale(2_000_000, tb), 50);
        // And back.
        assert_eq!(tb.rescale(50, micros), 2_000_000);
    }

    #[test]
    fn rescale_survives_large_timestamps() {
        let tb = TimeBase::new(1, 90_000);
        // ~27 hours at 90 kHz; naive i64 math would overflow on the way to µs.
        let ts = 9_000_000_000i64;
        assert_eq!(tb.rescale(ts, TimeBase::MICROS), 100_000_000_000);
    }

    #[test]
    fn audio_params_sizes() {
        let p = AudioParams {
            freq: 48_000,
            channels: 2,
            format: crate::frame::SampleFormat::S16,
        };
        assert_eq!(p.frame_size(), 4);
        assert_eq!(p.bytes_per_sec(), 192_000);
    }
}
