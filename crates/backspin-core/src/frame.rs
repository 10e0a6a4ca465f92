// crates/backspin-core/src/frame.rs
//
// Decoded frame payloads.
//
// Video pictures use the packed YUV420P layout:
//   [0 .. w*h]                      — Y plane, stride-free
//   [w*h .. w*h + uv_w*uv_h]        — U plane
//   [w*h + uv_w*uv_h .. end]        — V plane
// Adapters strip any stride padding before handing pictures to the engine.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleFormat {
    /// Interleaved signed 16-bit.
    S16,
    /// Interleaved 32-bit float.
    F32,
    /// One plane per channel, signed 16-bit.
    S16Planar,
    /// One plane per channel, 32-bit float.
    F32Planar,
}

impl SampleFormat {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::S16 | SampleFormat::S16Planar => 2,
            SampleFormat::F32 | SampleFormat::F32Planar => 4,
        }
    }

    pub fn is_planar(self) -> bool {
        matches!(self, SampleFormat::S16Planar | SampleFormat::F32Planar)
    }
}

/// Decoded audio. `pts` is in `1/sample_rate` ticks once the decode pump has
/// rewritten it; straight out of an adapter it is in the stream timebase.
#[derive(Clone, Debug)]
pub struct AudioFrame {
    pub pts: Option<i64>,
    pub sample_rate: u32,
    pub channels: u16,
    pub format: SampleFormat,
    pub nb_samples: usize,
    /// One plane for interleaved formats, `channels` planes for planar.
    pub planes: Vec<Vec<u8>>,
    pub pos: i64,
}

impl AudioFrame {
    pub fn params(&self) -> crate::packet::AudioParams {
        crate::packet::AudioParams {
            freq: self.sample_rate,
            channels: self.channels,
            format: self.format,
        }
    }

    /// Total payload size in bytes across planes.
    pub fn data_size(&self) -> usize {
        self.planes.iter().map(Vec::len).sum()
    }
}

/// Decoded video picture, packed YUV420P.
#[derive(Clone, Debug)]
pub struct VideoPicture {
    /// In the stream timebase.
    pub pts: Option<i64>,
    pub width: u32,
    pub height: u32,
    pub sar: (i32, i32),
    pub data: Vec<u8>,
    pub pos: i64,
}

impl VideoPicture {
    pub fn uv_width(&self) -> usize {
        (self.width as usize).div_ceil(2)
    }

    pub fn uv_height(&self) -> usize {
        (self.height as usize).div_ceil(2)
    }

    pub fn y(&self) -> &[u8] {
        &self.data[..self.width as usize * self.height as usize]
    }

    pub fn u(&self) -> &[u8] {
        let y = self.width as usize * self.height as usize;
        let uv = self.uv_width() * self.uv_height();
        &self.data[y..y + uv]
    }

    pub fn v(&self) -> &[u8] {
        let y = self.width as usize * self.height as usize;
        let uv = self.uv_width() * self.uv_height();
        &self.data[y + uv..y + 2 * uv]
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubtitleRect {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
    /// Text subtitles carry the line; bitmap rects leave it empty.
    pub text: Option<String>,
}

#[derive(Clone, Debug)]
pub struct SubtitleFrame {
    /// In microseconds, as subtitle codecs report it.
    pub pts: Option<i64>,
    pub start_display_ms: u32,
    pub end_display_ms: u32,
    pub rects: Vec<SubtitleRect>,
}

/// Pictures are `Arc`-shared: the frame queue, the reverse-playback buffer,
/// and the host event all reference the same allocation.
#[derive(Clone, Debug)]
pub enum FramePayload {
    Audio(AudioFrame),
    Video(Arc<VideoPicture>),
    Subtitle(SubtitleFrame),
}

impl FramePayload {
    pub fn as_video(&self) -> Option<&VideoPicture> {
        match self {
            FramePayload::Video(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_audio(&self) -> Option<&AudioFrame> {
        match self {
            FramePayload::Audio(a) => Some(a),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packed_yuv_plane_offsets() {
        let (w, h) = (4u32, 4u32);
        let mut data = vec![0u8; 16 + 4 + 4];
        data[0] = 1; // first Y byte
        data[16] = 2; // first U byte
        data[20] = 3; // first V byte
        let pic = VideoPicture {
            pts: Some(0),
            width: w,
            height: h,
            sar: (1, 1),
            data,
            pos: -1,
        };
        assert_eq!(pic.y().len(), 16);
        assert_eq!(pic.u().len(), 4);
        assert_eq!(pic.v().len(), 4);
        assert_eq!(pic.y()[0], 1);
        assert_eq!(pic.u()[0], 2);
        assert_eq!(pic.v()[0], 3);
    }

    #[test]
    fn odd_dimensions_round_up_chroma() {
        let pic = VideoPicture {
            pts: None,
            width: 5,
            height: 3,
            sar: (1, 1),
            data: vec![0; 15 + 2 * 6],
            pos: -1,
        };
        assert_eq!(pic.uv_width(), 3);
        assert_eq!(pic.uv_height(), 2);
    }
}
