// crates/backspin-core/src/event.rs

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::frame::VideoPicture;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Error,
    Warning,
    Info,
    Debug,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Start,
    Paused,
    Resumed,
    RewindEnd,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetaInfo {
    pub start_time: f64,
    pub duration: f64,
    pub width: u32,
    pub height: u32,
    /// Human-readable container/stream summary.
    pub info: String,
}

/// Video stream timing facts, as hosts expect them from a probe line.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct VideoStats {
    pub fps: f64,
    pub tbr: f64,
    pub tbn: f64,
    pub tbc: f64,
}

/// Events the engine emits to its host. Pictures travel by `Arc` — the
/// channel never copies pixel data.
#[derive(Clone, Debug)]
pub enum Event {
    Log { level: LogLevel, message: String },
    /// Master clock position in seconds, at most every 30 ms.
    Time(f64),
    Status(Status),
    Meta(MetaInfo),
    Statics(VideoStats),
    /// A picture due for presentation.
    Yuv {
        picture: Arc<VideoPicture>,
        pts: f64,
        frame_id: i64,
    },
    Error(String),
    End,
}
