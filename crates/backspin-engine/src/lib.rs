// crates/backspin-engine/src/lib.rs
//
// Clock-driven synchronized playback engine: one reader, per-stream decode
// workers, bounded packet/frame queues, three-way master clock, a pull-based
// audio path, a wall-clock video refresh loop, and a reverse-playback window.
//
// Everything that touches a container, a codec, or a sound card lives behind
// the traits in `traits` — see backspin-media for the production adapters.

pub mod clock;
pub mod frame_queue;
pub mod packet_queue;
pub mod traits;

mod audio;
mod decoder;
mod player;
mod reader;
mod rewind;
mod video;

pub use player::{Player, PlayerControls};

/// Cadence of the controller's refresh tick, seconds.
pub(crate) const REFRESH_RATE: f64 = 0.01;
/// No AV correction is attempted past this clock divergence, seconds.
pub(crate) const AV_NOSYNC_THRESHOLD: f64 = 10.0;
pub(crate) const AV_SYNC_THRESHOLD_MIN: f64 = 0.04;
pub(crate) const AV_SYNC_THRESHOLD_MAX: f64 = 0.1;
/// Above this delay a frame is duplicated rather than stretched.
pub(crate) const AV_SYNC_FRAMEDUP_THRESHOLD: f64 = 0.1;

pub(crate) const MAX_QUEUE_SIZE: usize = 15 * 1024 * 1024;
pub(crate) const MIN_FRAMES: usize = 25;

pub(crate) const EXTERNAL_CLOCK_MIN_FRAMES: usize = 2;
pub(crate) const EXTERNAL_CLOCK_MAX_FRAMES: usize = 10;
pub(crate) const EXTERNAL_CLOCK_SPEED_MIN: f64 = 0.900;
pub(crate) const EXTERNAL_CLOCK_SPEED_MAX: f64 = 1.010;
pub(crate) const EXTERNAL_CLOCK_SPEED_STEP: f64 = 0.001;

/// Maximum sample-count correction applied by audio drift compensation, percent.
pub(crate) const SAMPLE_CORRECTION_PERCENT_MAX: i32 = 10;
pub(crate) const AUDIO_DIFF_AVG_NB: u32 = 20;

pub(crate) const VIDEO_PICTURE_QUEUE_SIZE: usize = 3;
pub(crate) const SUBPICTURE_QUEUE_SIZE: usize = 16;
pub(crate) const SAMPLE_QUEUE_SIZE: usize = 9;

pub(crate) const VOLUME_MAX: i32 = 128;
/// Volume steps follow a 0.75 dB law.
pub(crate) const VOLUME_STEP_DB: f64 = 0.75;
