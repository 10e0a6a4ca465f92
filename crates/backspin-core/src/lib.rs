// crates/backspin-core/src/lib.rs
//
// Types that flow between the engine, its adapters, and the host.
// No ffmpeg, no device code — just plain data.

pub mod command;
pub mod error;
pub mod event;
pub mod frame;
pub mod options;
pub mod packet;

pub use command::Command;
pub use error::{DecodeError, MediaError};
pub use event::{Event, LogLevel, MetaInfo, Status, VideoStats};
pub use frame::{AudioFrame, FramePayload, SampleFormat, SubtitleFrame, SubtitleRect, VideoPicture};
pub use options::{FrameDropMode, PlayerOptions, SyncMaster};
pub use packet::{
    AudioParams, Chapter, Packet, PacketData, Serial, StreamDesc, StreamKind, TimeBase,
    SERIAL_DISCARD,
};
