// crates/backspin-core/src/command.rs

use serde::{Deserialize, Serialize};

/// Commands a host sends into the controller's event loop.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum Command {
    Quit,
    /// Toggle pause. Restores the pre-stepping speed first if one was saved.
    Pause,
    /// `mode` 0 toggles mute, ±1 steps the level, anything else sets it to
    /// `value` in `[0.0, 1.0]`.
    Volume { mode: i32, value: f64 },
    NextFrame,
    PrevFrame,
    /// Playback rate; negative enters rewind mode.
    Speed(f64),
    /// Step ±1 through the chapter table; falls back to ±600 s seeks when the
    /// container has at most one chapter.
    Chapter(i32),
    /// `mode` 0: absolute pts seconds, 1: relative seconds, 2: frame id.
    Seek { mode: i32, value: f64 },
}
