// crates/backspin-core/src/options.rs
//
// Every tunable the engine honors, in one struct a host fills in before open.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMaster {
    Audio,
    Video,
    External,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameDropMode {
    /// Drop late frames whenever video is not the master clock.
    Auto,
    Off,
    On,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlayerOptions {
    pub audio_disable: bool,
    pub subtitle_disable: bool,
    pub data_disable: bool,

    /// Stream specifiers per kind, matched by the demuxer.
    pub wanted_audio: Option<String>,
    pub wanted_video: Option<String>,
    pub wanted_subtitle: Option<String>,
    pub wanted_data: Option<String>,

    /// Seconds into the container to start at.
    pub start_time: Option<f64>,
    /// Play-range length in seconds; packets beyond it are discarded.
    pub duration: Option<f64>,

    /// `None` defers to the container (byte seeking for ts-discontinuous
    /// formats except ogg).
    pub seek_by_bytes: Option<bool>,
    /// Default magnitude, in seconds, hosts use for relative seek commands.
    pub seek_interval: f64,

    /// Initial volume, 0..=100.
    pub audio_volume: i32,

    pub input_format: Option<String>,
    pub fast: bool,
    pub genpts: bool,
    pub lowres: u8,
    /// `None`: trust the codec's best-effort timestamps.
    pub decoder_reorder_pts: Option<bool>,

    pub sync_master: SyncMaster,
    pub framedrop: FrameDropMode,
    /// `None` turns infinite buffering on for realtime sources only.
    pub infinite_buffer: Option<bool>,

    pub video_filters: Vec<String>,
    pub audio_filters: Option<String>,
    pub filter_threads: usize,

    pub audio_codec_name: Option<String>,
    pub video_codec_name: Option<String>,
    pub subtitle_codec_name: Option<String>,

    /// Emit a periodic status line over the log event.
    pub show_status: bool,
}

impl Default for PlayerOptions {
    fn default() -> Self {
        Self {
            audio_disable: false,
            subtitle_disable: false,
            data_disable: false,
            wanted_audio: None,
            wanted_video: None,
            wanted_subtitle: None,
            wanted_data: None,
            start_time: None,
            duration: None,
            seek_by_bytes: None,
            seek_interval: 10.0,
            audio_volume: 100,
            input_format: None,
            fast: false,
            genpts: false,
            lowres: 0,
            decoder_reorder_pts: None,
            sync_master: SyncMaster::Audio,
            framedrop: FrameDropMode::Auto,
            infinite_buffer: None,
            video_filters: Vec::new(),
            audio_filters: None,
            filter_threads: 0,
            audio_codec_name: None,
            video_codec_name: None,
            subtitle_codec_name: None,
            show_status: false,
        }
    }
}

impl PlayerOptions {
    pub fn wanted_spec(&self, kind: crate::packet::StreamKind) -> Option<&str> {
        use crate::packet::StreamKind::*;
        match kind {
            Audio => self.wanted_audio.as_deref(),
            Video => self.wanted_video.as_deref(),
            Subtitle => self.wanted_subtitle.as_deref(),
            Data => self.wanted_data.as_deref(),
        }
    }
}
