// crates/backspin-engine/src/player.rs
//
// Controller: owns the command/event surfaces, the refresh cadence, master
// clock selection, and the lifecycle of every worker thread.
//
// Locking model: small shared scalars are atomics; everything the seek/step
// machinery mutates together lives in `Control` under one mutex, which also
// backs the reader's wait condvar. Clocks carry their own internal locks.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};

use backspin_core::{
    Chapter, Command, Event, FramePayload, LogLevel, MediaError, MetaInfo, PacketData, Packet,
    PlayerOptions, Serial, Status, StreamDesc, StreamKind, SyncMaster, TimeBase, VideoStats,
    SERIAL_DISCARD,
};

use crate::audio::{step_volume, AudioRenderer};
use crate::clock::{wall_time, Clock};
use crate::decoder::{DecodeOutcome, DecodePump, SubtitlePump};
use crate::frame_queue::{Frame, FrameQueue};
use crate::packet_queue::PacketQueue;
use crate::reader;
use crate::rewind::ReverseBuffer;
use crate::traits::{AudioSink, AudioSpec, Demuxer, FilterGraph, MediaBackend};
use crate::video::{compute_target_delay, vp_duration};
use crate::{
    AV_NOSYNC_THRESHOLD, AV_SYNC_THRESHOLD_MAX, EXTERNAL_CLOCK_MAX_FRAMES,
    EXTERNAL_CLOCK_MIN_FRAMES, EXTERNAL_CLOCK_SPEED_MAX, EXTERNAL_CLOCK_SPEED_MIN,
    EXTERNAL_CLOCK_SPEED_STEP, REFRESH_RATE, SAMPLE_QUEUE_SIZE, SUBPICTURE_QUEUE_SIZE,
    VIDEO_PICTURE_QUEUE_SIZE, VOLUME_MAX,
};

/// Interval between `Event::Time` emissions, seconds.
const TIME_EVENT_INTERVAL: f64 = 0.03;

#[derive(Clone, Copy, Debug)]
pub(crate) enum SeekRequest {
    /// Seek by container time, microseconds.
    Pos { target_us: i64, rel_us: i64 },
    /// Seek by byte offset.
    Bytes { target: i64, rel: i64 },
    /// Open a reverse-playback window ending just before `target_pts`
    /// (video stream timebase).
    Rewind { target_pts: i64 },
    /// Slide the reverse window further back.
    RewindContinue { target_us: i64 },
}

/// Mutable playback state the controller, reader, and refresh loop share.
pub(crate) struct Control {
    pub stepping: bool,
    /// Speed to restore on the next pause toggle after frame stepping.
    pub prev_speed: f64,
    pub seek: Option<SeekRequest>,
    /// Last requested seek target, the fallback when the master clock is NaN.
    pub seek_pos_us: i64,
    pub eof: bool,
    pub frame_timer: f64,
    pub force_refresh: bool,
    pub queue_attachments: bool,
    /// Pictures below this pts are skipped after a seek lands on a keyframe.
    pub sync_video_pts: Option<i64>,
    /// Upper pts bound of the current reverse window, video timebase.
    pub rewind_target: i64,
    /// Set when the reverse window hit the container start.
    pub rewind_eof_pts: i64,
    /// Reader discards non-key video packets until the next keyframe.
    pub drop_frame_mode: bool,
    pub frame_drops_early: u32,
    pub frame_drops_late: u32,
}

impl Control {
    fn new() -> Self {
        Self {
            stepping: false,
            prev_speed: 0.0,
            seek: None,
            seek_pos_us: 0,
            eof: false,
            frame_timer: 0.0,
            force_refresh: false,
            queue_attachments: true,
            sync_video_pts: None,
            rewind_target: 0,
            rewind_eof_pts: 0,
            drop_frame_mode: false,
            frame_drops_early: 0,
            frame_drops_late: 0,
        }
    }
}

/// Per-stream queue bundle.
pub(crate) struct StreamSlot {
    pub desc: StreamDesc,
    pub packets: Arc<PacketQueue>,
    pub frames: Option<Arc<FrameQueue>>,
    /// Serial the decoder last drained; the reader's natural-end check.
    pub dec_finished: Arc<AtomicI32>,
}

impl StreamSlot {
    fn new(desc: StreamDesc, frame_queue: Option<(usize, bool)>) -> Self {
        Self {
            desc,
            packets: Arc::new(PacketQueue::new()),
            frames: frame_queue.map(|(cap, keep_last)| Arc::new(FrameQueue::new(cap, keep_last))),
            dec_finished: Arc::new(AtomicI32::new(0)),
        }
    }

    pub(crate) fn decoder_done(&self) -> bool {
        let drained = self.dec_finished.load(Ordering::Acquire) == self.packets.serial();
        let empty = self
            .frames
            .as_ref()
            .map(|f| f.nb_remaining() == 0)
            .unwrap_or(true);
        drained && empty
    }
}

pub(crate) struct PlayerCore {
    pub opts: PlayerOptions,
    pub backend: Arc<dyn MediaBackend>,
    pub url: String,

    pub audclk: Clock,
    pub vidclk: Clock,
    pub extclk: Clock,

    pub audio: Option<StreamSlot>,
    pub video: Option<StreamSlot>,
    pub subtitle: Option<StreamSlot>,
    pub data: Option<StreamSlot>,

    pub ctl: Mutex<Control>,
    /// Reader wakeups; paired with `ctl`.
    pub wait: Condvar,

    pub abort_reading: Arc<AtomicBool>,
    pub paused: AtomicBool,
    pub rewind: AtomicBool,
    speed_bits: AtomicU64,
    pub volume: AtomicI32,
    pub muted: AtomicBool,
    /// Byte position of the last packet read, for byte-mode relative seeks.
    pub read_pos: AtomicI64,
    /// Frames currently parked in the reverse window buffer.
    pub rewind_buffered: Arc<AtomicUsize>,

    pub events: Sender<Event>,
    pub cmd_tx: Sender<Command>,

    pub duration_us: Option<i64>,
    pub start_time_us: i64,
    pub bit_rate: i64,
    pub realtime: bool,
    pub format_name: String,
    pub seek_by_bytes: bool,
    pub infinite_buffer: bool,
    pub max_frame_duration: f64,
    pub chapters: Vec<Chapter>,
    pub video_time_base: TimeBase,
    /// Nominal seconds per video frame; 0 when the rate is unknown.
    pub frame_duration: f64,
}

impl PlayerCore {
    pub fn speed(&self) -> f64 {
        f64::from_bits(self.speed_bits.load(Ordering::Acquire))
    }

    fn store_speed(&self, speed: f64) {
        self.speed_bits.store(speed.to_bits(), Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn rewind_mode(&self) -> bool {
        self.rewind.load(Ordering::Acquire)
    }

    pub fn wake_reader(&self) {
        self.wait.notify_one();
    }

    pub fn emit(&self, event: Event) {
        let _ = self.events.send(event);
    }

    pub fn log(&self, level: LogLevel, message: String) {
        match level {
            LogLevel::Error => tracing::error!("{message}"),
            LogLevel::Warning => tracing::warn!("{message}"),
            LogLevel::Info => tracing::info!("{message}"),
            LogLevel::Debug => tracing::debug!("{message}"),
        }
        self.emit(Event::Log { level, message });
    }

    pub fn master_sync_type(&self) -> SyncMaster {
        if self.speed() != 1.0 {
            return SyncMaster::External;
        }
        match self.opts.sync_master {
            SyncMaster::Video => {
                if self.video.is_some() {
                    SyncMaster::Video
                } else {
                    SyncMaster::Audio
                }
            }
            SyncMaster::Audio => {
                if self.audio.is_some() {
                    SyncMaster::Audio
                } else {
                    SyncMaster::External
                }
            }
            SyncMaster::External => SyncMaster::External,
        }
    }

    pub fn master_clock_ref(&self) -> &Clock {
        match self.master_sync_type() {
            SyncMaster::Video => &self.vidclk,
            SyncMaster::Audio => &self.audclk,
            SyncMaster::External => &self.extclk,
        }
    }

    pub fn master_clock(&self) -> f64 {
        self.master_clock_ref().get()
    }

    pub fn pts_to_frame_id(&self, pts: f64) -> i64 {
        let dur = if self.frame_duration == 0.0 {
            60.0
        } else {
            self.frame_duration
        };
        (pts / dur) as i64
    }

    pub fn frame_id_to_pts(&self, id: i64) -> f64 {
        let dur = if self.frame_duration == 0.0 {
            60.0
        } else {
            self.frame_duration
        };
        id as f64 * dur
    }

    pub(crate) fn stream_time_base(&self, stream: usize) -> Option<TimeBase> {
        self.slot_for(stream).map(|s| s.desc.time_base)
    }

    pub(crate) fn slot_for(&self, stream: usize) -> Option<&StreamSlot> {
        [&self.audio, &self.video, &self.subtitle, &self.data]
            .into_iter()
            .flatten()
            .find(|s| s.desc.index == stream)
    }

    pub(crate) fn push_packet(&self, pkt: PacketData, serial: Option<Serial>) -> bool {
        match self.slot_for(pkt.stream) {
            Some(slot) => slot.packets.put_with_serial(Packet::Data(pkt), serial),
            None => false,
        }
    }

    pub(crate) fn new_serial(&self) {
        for slot in [&self.audio, &self.video, &self.subtitle, &self.data]
            .into_iter()
            .flatten()
        {
            slot.packets.next_serial();
        }
    }

    pub(crate) fn send_seek_request(&self, req: SeekRequest) {
        let mut ctl = self.ctl.lock().unwrap();
        if ctl.seek.is_none() {
            if let SeekRequest::Pos { target_us, .. } = req {
                ctl.seek_pos_us = target_us;
            }
            ctl.seek = Some(req);
            drop(ctl);
            self.wake_reader();
        }
    }

    // ── Pause / speed / stepping ─────────────────────────────────────────────

    pub(crate) fn stream_toggle_pause(&self) {
        let was_paused = self.is_paused();
        if was_paused {
            // Fold the pause gap into the frame timer so the next frame is
            // not considered hours late.
            let mut ctl = self.ctl.lock().unwrap();
            ctl.frame_timer += self.vidclk.time_passed();
            drop(ctl);
            self.vidclk.set_paused(false);
            self.vidclk.touch();
        }
        self.extclk.touch();
        let now_paused = !was_paused;
        self.paused.store(now_paused, Ordering::Release);
        self.audclk.set_paused(now_paused);
        self.vidclk.set_paused(now_paused);
        self.extclk.set_paused(now_paused);
        self.emit(Event::Status(if now_paused {
            Status::Paused
        } else {
            Status::Resumed
        }));
        self.wake_reader();
    }

    pub(crate) fn toggle_pause(&self) {
        let prev_speed = {
            let mut ctl = self.ctl.lock().unwrap();
            let s = ctl.prev_speed;
            ctl.prev_speed = 0.0;
            s
        };
        if prev_speed != 0.0 {
            self.change_speed(prev_speed);
        }
        self.stream_toggle_pause();
        self.ctl.lock().unwrap().stepping = false;
    }

    pub(crate) fn change_speed(&self, speed: f64) {
        // Rewind is driven by the video stream; without one there is nothing
        // to play backward.
        if speed <= 0.0 && self.video.is_none() {
            return;
        }

        let prev_paused = self.is_paused();
        if !prev_paused {
            self.stream_toggle_pause();
        }

        let prev_rewind = self.rewind_mode();
        let prev_master_reading = self.master_clock();
        let prev_master_serial = self.master_clock_ref().serial();

        self.store_speed(speed);
        self.extclk.set_speed(speed);
        if !prev_master_reading.is_nan() {
            self.extclk.set(prev_master_reading, prev_master_serial);
        }
        let sign = if speed < 0.0 { -1.0 } else { 1.0 };
        self.audclk.set_speed(sign);
        self.vidclk.set_speed(sign);

        if speed < 0.0 {
            let pending = self.ctl.lock().unwrap().seek.is_some();
            if !pending {
                let target_pts = self
                    .video
                    .as_ref()
                    .and_then(|v| v.frames.as_ref().unwrap().peek())
                    .map(|vp| vp.ts)
                    .unwrap_or_else(|| {
                        let pts = self.vidclk.last_pts();
                        if pts.is_nan() {
                            0
                        } else {
                            self.video_time_base.from_secs(pts)
                        }
                    });
                self.ctl.lock().unwrap().rewind_target = target_pts;
                self.send_seek_request(SeekRequest::Rewind { target_pts });
            }
        } else if prev_rewind {
            self.rewind.store(false, Ordering::Release);
            let target_us = self
                .video
                .as_ref()
                .and_then(|v| v.frames.as_ref().unwrap().peek())
                .map(|vp| self.video_time_base.rescale(vp.ts, TimeBase::MICROS))
                .unwrap_or(self.start_time_us);
            self.send_seek_request(SeekRequest::Pos {
                target_us,
                rel_us: 0,
            });
        }

        if !prev_paused {
            self.stream_toggle_pause();
        }
    }

    pub(crate) fn step_to_next_frame(&self) {
        if self.speed() != 1.0 {
            {
                let mut ctl = self.ctl.lock().unwrap();
                if ctl.prev_speed == 0.0 {
                    ctl.prev_speed = self.speed();
                }
            }
            self.change_speed(1.0);
        }
        if self.is_paused() {
            self.stream_toggle_pause();
        }
        self.ctl.lock().unwrap().stepping = true;
    }

    pub(crate) fn step_to_prev_frame(&self) {
        if self.speed() != -1.0 {
            {
                let mut ctl = self.ctl.lock().unwrap();
                if ctl.prev_speed == 0.0 {
                    ctl.prev_speed = self.speed();
                }
            }
            self.change_speed(-1.0);
        }
        if self.is_paused() {
            self.stream_toggle_pause();
        }
        self.ctl.lock().unwrap().stepping = true;
    }

    // ── Seeking ──────────────────────────────────────────────────────────────

    pub(crate) fn seek_chapter(&self, incr: i32) {
        if self.chapters.is_empty() {
            return;
        }
        let pos_us = (self.master_clock() * 1_000_000.0) as i64;
        let mut i = self.chapters.len() as i32;
        for (idx, ch) in self.chapters.iter().enumerate() {
            let start_us = ch.time_base.rescale(ch.start, TimeBase::MICROS);
            if pos_us < start_us {
                i = idx as i32 - 1;
                break;
            }
        }
        i += incr;
        i = i.max(0);
        if i as usize >= self.chapters.len() {
            return;
        }
        let ch = &self.chapters[i as usize];
        tracing::debug!(chapter = i, "seeking to chapter");
        self.send_seek_request(SeekRequest::Pos {
            target_us: ch.time_base.rescale(ch.start, TimeBase::MICROS),
            rel_us: 0,
        });
    }

    fn relative_seek(&self, incr: f64) {
        if self.seek_by_bytes {
            let mut pos = -1.0f64;
            if let Some(video) = &self.video {
                if let Some(p) = video
                    .frames
                    .as_ref()
                    .unwrap()
                    .last_shown_position(video.packets.serial())
                {
                    pos = p as f64;
                }
            }
            if pos < 0.0 {
                if let Some(audio) = &self.audio {
                    if let Some(p) = audio
                        .frames
                        .as_ref()
                        .unwrap()
                        .last_shown_position(audio.packets.serial())
                    {
                        pos = p as f64;
                    }
                }
            }
            if pos < 0.0 {
                pos = self.read_pos.load(Ordering::Acquire) as f64;
            }
            let incr_bytes = if self.bit_rate != 0 {
                incr * self.bit_rate as f64 / 8.0
            } else {
                incr * 180_000.0
            };
            pos += incr_bytes;
            self.send_seek_request(SeekRequest::Bytes {
                target: pos as i64,
                rel: incr_bytes as i64,
            });
        } else {
            let mut pos = self.master_clock();
            if pos.is_nan() {
                pos = self.ctl.lock().unwrap().seek_pos_us as f64 / 1_000_000.0;
            }
            pos += incr;
            let start = self.start_time_us as f64 / 1_000_000.0;
            if pos < start {
                pos = start;
            }
            self.send_seek_request(SeekRequest::Pos {
                target_us: (pos * 1_000_000.0) as i64,
                rel_us: (incr * 1_000_000.0) as i64,
            });
        }
    }

    // ── Volume ───────────────────────────────────────────────────────────────

    pub(crate) fn update_volume(&self, sign: i32) {
        let current = self.volume.load(Ordering::Acquire);
        self.volume
            .store(step_volume(current, sign), Ordering::Release);
    }

    pub(crate) fn set_volume_fraction(&self, fraction: f64) {
        let v = ((fraction * VOLUME_MAX as f64) as i32).clamp(0, VOLUME_MAX);
        self.volume.store(v, Ordering::Release);
    }

    // ── External clock regulation ────────────────────────────────────────────

    /// Nudge the external clock so realtime queues neither drain nor grow.
    pub(crate) fn check_external_clock_speed(&self) {
        if self.master_sync_type() != SyncMaster::External || self.speed() != 1.0 {
            return;
        }
        let video_low = self
            .video
            .as_ref()
            .map(|v| v.packets.nb_packets() <= EXTERNAL_CLOCK_MIN_FRAMES)
            .unwrap_or(false);
        let audio_low = self
            .audio
            .as_ref()
            .map(|a| a.packets.nb_packets() <= EXTERNAL_CLOCK_MIN_FRAMES)
            .unwrap_or(false);
        let video_high = self
            .video
            .as_ref()
            .map(|v| v.packets.nb_packets() > EXTERNAL_CLOCK_MAX_FRAMES)
            .unwrap_or(true);
        let audio_high = self
            .audio
            .as_ref()
            .map(|a| a.packets.nb_packets() > EXTERNAL_CLOCK_MAX_FRAMES)
            .unwrap_or(true);

        let speed = self.extclk.speed();
        if video_low || audio_low {
            self.extclk
                .set_speed((speed - EXTERNAL_CLOCK_SPEED_STEP).max(EXTERNAL_CLOCK_SPEED_MIN));
        } else if video_high && audio_high {
            self.extclk
                .set_speed((speed + EXTERNAL_CLOCK_SPEED_STEP).min(EXTERNAL_CLOCK_SPEED_MAX));
        } else if speed != 1.0 {
            self.extclk
                .set_speed(speed + EXTERNAL_CLOCK_SPEED_STEP * (1.0 - speed) / (1.0 - speed).abs());
        }
    }

    // ── Video refresh (forward) ──────────────────────────────────────────────

    pub(crate) fn video_refresh(&self, remaining_time: &mut f64) {
        if self.rewind_mode() {
            self.video_refresh_rewind(remaining_time);
            return;
        }
        let Some(video) = &self.video else { return };
        let frames = video.frames.as_ref().unwrap();

        loop {
            if frames.nb_remaining() == 0 {
                return;
            }

            let vp = match frames.peek() {
                Some(vp) => vp,
                None => return,
            };
            if vp.serial != video.packets.serial() {
                frames.next();
                continue;
            }

            // Burn through pictures before the seek target.
            {
                let mut ctl = self.ctl.lock().unwrap();
                if let Some(sync_pts) = ctl.sync_video_pts {
                    if vp.ts < sync_pts {
                        drop(ctl);
                        frames.next();
                        continue;
                    }
                    ctl.sync_video_pts = None;
                }
            }

            let lastvp = frames.peek_last();
            if lastvp.map(|l| l.serial != vp.serial).unwrap_or(true) {
                self.ctl.lock().unwrap().frame_timer = wall_time();
            }

            if self.is_paused() {
                return;
            }

            let last_duration = lastvp
                .map(|l| vp_duration(&l, &vp, self.max_frame_duration))
                .unwrap_or(0.0);
            let diff = if self.master_sync_type() != SyncMaster::Video {
                self.vidclk.get() - self.master_clock()
            } else {
                f64::NAN
            };
            let delay = compute_target_delay(last_duration, diff, self.max_frame_duration);

            let time = wall_time();
            let frame_timer = self.ctl.lock().unwrap().frame_timer;
            if time < frame_timer + delay {
                *remaining_time = (frame_timer + delay - time).min(*remaining_time);
                return;
            }

            {
                let mut ctl = self.ctl.lock().unwrap();
                ctl.frame_timer += delay;
                if delay > 0.0 && time - ctl.frame_timer > AV_SYNC_THRESHOLD_MAX {
                    ctl.frame_timer = time;
                }
            }

            if !vp.pts.is_nan() {
                self.vidclk.set(vp.pts, vp.serial);
                self.extclk.sync_to_default(&self.vidclk);
            }

            // Late-frame drop: already past the moment the next picture is due.
            if frames.nb_remaining() > 1 {
                if let Some(nextvp) = frames.peek_next() {
                    let duration = vp_duration(&vp, &nextvp, self.max_frame_duration);
                    let stepping = self.ctl.lock().unwrap().stepping;
                    let frame_timer = self.ctl.lock().unwrap().frame_timer;
                    if !stepping
                        && self.framedrop_allowed()
                        && time > frame_timer + duration
                    {
                        self.ctl.lock().unwrap().frame_drops_late += 1;
                        frames.next();
                        continue;
                    }
                }
            }

            frames.next();
            self.ctl.lock().unwrap().force_refresh = true;

            let stepping = self.ctl.lock().unwrap().stepping;
            if stepping && !self.is_paused() {
                self.stream_toggle_pause();
            }
            return;
        }
    }

    pub(crate) fn framedrop_allowed(&self) -> bool {
        use backspin_core::FrameDropMode::*;
        match self.opts.framedrop {
            On => true,
            Off => false,
            Auto => self.master_sync_type() != SyncMaster::Video,
        }
    }

    /// Hand the current picture to the host, once, and retire due subtitles.
    pub(crate) fn display_picture(&self) {
        let Some(video) = &self.video else { return };
        let frames = video.frames.as_ref().unwrap();
        let Some(frame) = frames.display_last() else {
            return;
        };
        if let FramePayload::Video(pic) = &*frame.payload {
            self.emit(Event::Yuv {
                picture: pic.clone(),
                pts: frame.pts,
                frame_id: self.pts_to_frame_id(frame.pts),
            });
        }

        // Subtitles are decoded and queued but not rendered; retire the ones
        // whose display window the video has passed.
        if let Some(sub) = &self.subtitle {
            let sq = sub.frames.as_ref().unwrap();
            while let Some(sp) = sq.peek() {
                let stale = sp.serial != sub.packets.serial();
                let expired = !frame.pts.is_nan() && frame.pts > sp.pts + sp.duration;
                if stale || expired {
                    sq.next();
                } else {
                    break;
                }
            }
        }
    }

    /// Emit `time` (and the optional status line) at most every 30 ms.
    pub(crate) fn status_tick(&self, last_time: &mut f64) {
        let now = wall_time();
        if *last_time != 0.0 && now - *last_time < TIME_EVENT_INTERVAL {
            return;
        }
        *last_time = now;

        let master = self.master_clock();
        if master.is_finite() {
            self.emit(Event::Time(master));
        }

        if self.opts.show_status {
            let drops = {
                let ctl = self.ctl.lock().unwrap();
                ctl.frame_drops_early + ctl.frame_drops_late
            };
            let aq = self.audio.as_ref().map(|a| a.packets.size()).unwrap_or(0);
            let vq = self.video.as_ref().map(|v| v.packets.size()).unwrap_or(0);
            let av_diff = match (&self.audio, &self.video) {
                (Some(_), Some(_)) => self.audclk.get() - self.vidclk.get(),
                (None, Some(_)) => master - self.vidclk.get(),
                (Some(_), None) => master - self.audclk.get(),
                _ => 0.0,
            };
            let label = match (&self.audio, &self.video) {
                (Some(_), Some(_)) => "A-V",
                (None, Some(_)) => "M-V",
                (Some(_), None) => "M-A",
                _ => "   ",
            };
            self.emit(Event::Log {
                level: LogLevel::Info,
                message: format!(
                    "{master:7.2} {label}:{av_diff:7.3} fd={drops:4} aq={:5}KB vq={:5}KB",
                    aq / 1024,
                    vq / 1024
                ),
            });
        }
    }

    // ── Command dispatch ─────────────────────────────────────────────────────

    /// Returns true when the loop should quit.
    pub(crate) fn handle_command(&self, cmd: Command) -> bool {
        match cmd {
            Command::Quit => return true,
            Command::Pause => self.toggle_pause(),
            Command::Volume { mode, value } => match mode {
                0 => {
                    let m = self.muted.load(Ordering::Acquire);
                    self.muted.store(!m, Ordering::Release);
                }
                1 => self.update_volume(1),
                -1 => self.update_volume(-1),
                _ => self.set_volume_fraction(value),
            },
            Command::NextFrame => self.step_to_next_frame(),
            Command::PrevFrame => self.step_to_prev_frame(),
            Command::Speed(v) => self.change_speed(v),
            Command::Chapter(incr) => {
                if self.chapters.len() <= 1 {
                    self.relative_seek(if incr > 0 { 600.0 } else { -600.0 });
                } else {
                    self.seek_chapter(incr);
                }
            }
            Command::Seek { mode, value } => match mode {
                0 | 2 => {
                    let target_pts = if mode == 2 {
                        self.frame_id_to_pts(value as i64)
                    } else {
                        value
                    };
                    if !self.seek_by_bytes {
                        self.send_seek_request(SeekRequest::Pos {
                            target_us: (target_pts * 1_000_000.0) as i64,
                            rel_us: 0,
                        });
                    }
                }
                _ => self.relative_seek(value),
            },
        }
        false
    }
}

/// Cloneable command endpoint for hosts.
#[derive(Clone)]
pub struct PlayerControls {
    tx: Sender<Command>,
}

impl PlayerControls {
    pub fn send(&self, cmd: Command) {
        let _ = self.tx.send(cmd);
    }

    pub fn quit(&self) {
        self.send(Command::Quit);
    }

    pub fn toggle_pause(&self) {
        self.send(Command::Pause);
    }

    pub fn seek_to(&self, seconds: f64) {
        self.send(Command::Seek {
            mode: 0,
            value: seconds,
        });
    }

    pub fn seek_by(&self, delta: f64) {
        self.send(Command::Seek {
            mode: 1,
            value: delta,
        });
    }

    pub fn set_speed(&self, speed: f64) {
        self.send(Command::Speed(speed));
    }
}

pub struct Player {
    core: Arc<PlayerCore>,
    cmd_rx: Receiver<Command>,
    cmd_tx: Sender<Command>,
    reader: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
    sink: Option<Box<dyn AudioSink>>,
}

impl Player {
    /// Probe `url`, pick streams, spin up queues, decoders, the audio path,
    /// and the reader. Fatal failures (bad input, no streams, no decoder)
    /// surface here; everything after `open` returns is driven by `run`.
    pub fn open(
        backend: Arc<dyn MediaBackend>,
        mut sink: Box<dyn AudioSink>,
        url: &str,
        opts: PlayerOptions,
    ) -> Result<(Player, Receiver<Event>), MediaError> {
        let (cmd_tx, cmd_rx) = unbounded::<Command>();
        let (ev_tx, ev_rx) = bounded::<Event>(256);

        let mut demuxer = backend.open(url, &opts)?;
        let abort_reading = Arc::new(AtomicBool::new(false));
        demuxer.set_interrupt(abort_reading.clone());

        let format_name = demuxer.format_name().to_string();
        let realtime = demuxer.is_realtime();
        let duration_us = demuxer.duration();
        let start_time_us = demuxer.start_time().unwrap_or(0);
        let bit_rate = demuxer.bit_rate();
        let max_frame_duration = if demuxer.ts_discontinuous() { 10.0 } else { 3600.0 };
        let seek_by_bytes = opts
            .seek_by_bytes
            .unwrap_or(demuxer.ts_discontinuous() && format_name != "ogg");
        let chapters = demuxer.chapters().to_vec();

        if let Some(start) = opts.start_time {
            let target = (start * 1_000_000.0) as i64 + start_time_us;
            if let Err(e) = demuxer.seek_time(target, i64::MIN, i64::MAX) {
                tracing::warn!(error = %e, "could not seek to requested start position");
            }
        }

        // Stream selection: video first, audio relative to it, subtitles
        // relative to both, data on its own.
        let video_idx =
            demuxer.find_best_stream(StreamKind::Video, opts.wanted_spec(StreamKind::Video), None);
        let audio_idx = if !opts.audio_disable {
            demuxer.find_best_stream(
                StreamKind::Audio,
                opts.wanted_spec(StreamKind::Audio),
                video_idx,
            )
        } else {
            None
        };
        let subtitle_idx = if !opts.subtitle_disable {
            demuxer.find_best_stream(
                StreamKind::Subtitle,
                opts.wanted_spec(StreamKind::Subtitle),
                audio_idx.or(video_idx),
            )
        } else {
            None
        };
        let data_idx = if !opts.data_disable {
            demuxer.find_best_stream(StreamKind::Data, opts.wanted_spec(StreamKind::Data), None)
        } else {
            None
        };

        if video_idx.is_none() && audio_idx.is_none() {
            return Err(MediaError::NoStreams);
        }

        let desc_of = |idx: usize| demuxer.streams()[idx].clone();

        let video_slot = video_idx.map(|i| {
            StreamSlot::new(desc_of(i), Some((VIDEO_PICTURE_QUEUE_SIZE, true)))
        });
        let subtitle_slot =
            subtitle_idx.map(|i| StreamSlot::new(desc_of(i), Some((SUBPICTURE_QUEUE_SIZE, false))));
        let data_slot = data_idx.map(|i| StreamSlot::new(desc_of(i), None));

        // Negotiate the audio device up front: a dead sink downgrades to
        // video-only playback instead of failing the open.
        let mut audio_slot = None;
        let mut negotiated: Option<AudioSpec> = None;
        if let Some(i) = audio_idx {
            let desc = desc_of(i);
            let wanted = AudioSpec {
                freq: desc.sample_rate,
                channels: desc.channels,
                samples: 0,
            };
            match sink.open(&wanted) {
                Ok(spec) => {
                    negotiated = Some(spec);
                    audio_slot = Some(StreamSlot::new(desc, Some((SAMPLE_QUEUE_SIZE, true))));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "audio sink unavailable, continuing without audio");
                }
            }
        }
        if video_idx.is_none() && audio_slot.is_none() {
            return Err(MediaError::NoStreams);
        }

        let (video_time_base, frame_duration, stats, meta_dims) = match &video_slot {
            Some(v) => {
                let rate = v.desc.avg_frame_rate.or(v.desc.real_frame_rate);
                let frame_duration = rate
                    .filter(|(n, d)| *n != 0 && *d != 0)
                    .map(|(n, d)| d as f64 / n as f64)
                    .unwrap_or(0.0);
                let q2d = |r: Option<(i32, i32)>| {
                    r.filter(|(n, d)| *n != 0 && *d != 0)
                        .map(|(n, d)| n as f64 / d as f64)
                        .unwrap_or(0.0)
                };
                let tb = v.desc.time_base;
                let stats = VideoStats {
                    fps: q2d(v.desc.avg_frame_rate),
                    tbr: q2d(v.desc.real_frame_rate),
                    tbn: if tb.num != 0 {
                        tb.den as f64 / tb.num as f64
                    } else {
                        0.0
                    },
                    tbc: 0.0,
                };
                (tb, frame_duration, stats, (v.desc.width, v.desc.height))
            }
            None => (
                TimeBase::MICROS,
                0.0,
                VideoStats {
                    fps: 0.0,
                    tbr: 0.0,
                    tbn: 0.0,
                    tbc: 0.0,
                },
                (0, 0),
            ),
        };

        let audclk = Clock::new(
            audio_slot
                .as_ref()
                .map(|s| s.packets.serial_handle())
                .unwrap_or_else(|| Arc::new(AtomicI32::new(0))),
        );
        let vidclk = Clock::new(
            video_slot
                .as_ref()
                .map(|s| s.packets.serial_handle())
                .unwrap_or_else(|| Arc::new(AtomicI32::new(0))),
        );
        let extclk = Clock::detached();

        let volume = (VOLUME_MAX * opts.audio_volume.clamp(0, 100) / 100).clamp(0, VOLUME_MAX);
        let infinite_buffer = opts.infinite_buffer.unwrap_or(realtime);
        let info = demuxer.info_string();

        let core = Arc::new(PlayerCore {
            opts,
            backend: backend.clone(),
            url: url.to_string(),
            audclk,
            vidclk,
            extclk,
            audio: audio_slot,
            video: video_slot,
            subtitle: subtitle_slot,
            data: data_slot,
            ctl: Mutex::new(Control::new()),
            wait: Condvar::new(),
            abort_reading,
            paused: AtomicBool::new(false),
            rewind: AtomicBool::new(false),
            speed_bits: AtomicU64::new(1.0f64.to_bits()),
            volume: AtomicI32::new(volume),
            muted: AtomicBool::new(false),
            read_pos: AtomicI64::new(0),
            rewind_buffered: Arc::new(AtomicUsize::new(0)),
            events: ev_tx,
            cmd_tx: cmd_tx.clone(),
            duration_us,
            start_time_us,
            bit_rate,
            realtime,
            format_name,
            seek_by_bytes,
            infinite_buffer,
            max_frame_duration,
            chapters,
            video_time_base,
            frame_duration,
        });

        let mut workers = Vec::new();

        if let Some(video) = &core.video {
            let codec = backend.new_decoder(&video.desc, &core.opts)?;
            let mut pump = DecodePump::new(
                codec,
                video.packets.serial_handle(),
                video.dec_finished.clone(),
                video.desc.time_base,
            );
            if !demuxer.seekable() {
                pump.set_start_pts(video.desc.start_time.unwrap_or(0), video.desc.time_base);
            }
            video.packets.start();
            let core2 = core.clone();
            workers.push(std::thread::spawn(move || video_worker(core2, pump)));
        }

        if let Some(audio) = &core.audio {
            let spec = negotiated.unwrap();
            let codec = backend.new_decoder(&audio.desc, &core.opts)?;
            let mut pump = DecodePump::new(
                codec,
                audio.packets.serial_handle(),
                audio.dec_finished.clone(),
                audio.desc.time_base,
            );
            if !demuxer.seekable() {
                pump.set_start_pts(audio.desc.start_time.unwrap_or(0), audio.desc.time_base);
            }
            audio.packets.start();

            let mut renderer = AudioRenderer::new(core.clone(), spec);
            sink.start(Box::new(move |out| renderer.fill(out)))?;

            let core2 = core.clone();
            workers.push(std::thread::spawn(move || audio_worker(core2, pump)));
            sink.pause(false);
        }

        if let Some(subtitle) = &core.subtitle {
            let codec = backend.new_subtitle_decoder(&subtitle.desc, &core.opts)?;
            let pump = SubtitlePump::new(
                codec,
                subtitle.packets.serial_handle(),
                subtitle.dec_finished.clone(),
            );
            subtitle.packets.start();
            let core2 = core.clone();
            workers.push(std::thread::spawn(move || subtitle_worker(core2, pump)));
        }

        if let Some(data) = &core.data {
            data.packets.start();
            let core2 = core.clone();
            workers.push(std::thread::spawn(move || data_worker(core2)));
        }

        core.emit(Event::Meta(MetaInfo {
            start_time: start_time_us as f64 / 1_000_000.0,
            duration: duration_us.map(|d| d as f64 / 1_000_000.0).unwrap_or(0.0),
            width: meta_dims.0,
            height: meta_dims.1,
            info,
        }));
        core.emit(Event::Statics(stats));
        core.emit(Event::Status(Status::Start));

        let reader_core = core.clone();
        let reader = std::thread::spawn(move || reader::run_reader(reader_core, demuxer));

        Ok((
            Player {
                core,
                cmd_rx,
                cmd_tx,
                reader: Some(reader),
                workers,
                sink: Some(sink),
            },
            ev_rx,
        ))
    }

    pub fn controls(&self) -> PlayerControls {
        PlayerControls {
            tx: self.cmd_tx.clone(),
        }
    }

    /// The controller loop: alternate between command dispatch and the video
    /// refresh tick until quit, then tear everything down and emit `End`.
    pub fn run(mut self) {
        let mut remaining = 0.0f64;
        let mut last_time_event = 0.0f64;

        loop {
            match self
                .cmd_rx
                .recv_timeout(Duration::from_secs_f64(remaining.max(0.0)))
            {
                Ok(cmd) => {
                    remaining = 0.0;
                    if self.core.handle_command(cmd) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    remaining = REFRESH_RATE;
                    let paused = self.core.is_paused();
                    let force = self.core.ctl.lock().unwrap().force_refresh;
                    if !paused || force {
                        if !paused && self.core.realtime {
                            self.core.check_external_clock_speed();
                        }
                        if self.core.video.is_some() {
                            self.core.video_refresh(&mut remaining);
                            let show = {
                                let ctl = self.core.ctl.lock().unwrap();
                                ctl.force_refresh
                            };
                            if show {
                                self.core.display_picture();
                            }
                            self.core.ctl.lock().unwrap().force_refresh = false;
                        }
                        self.core.status_tick(&mut last_time_event);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        // Final position report: snap to the container duration when the
        // loop ended within a second of it.
        if let Some(dur_us) = self.core.duration_us {
            let duration = dur_us as f64 / 1_000_000.0;
            let mut end = self.core.master_clock();
            if end.is_nan() || (end - duration).abs() < 1.0 {
                end = duration;
            }
            self.core.emit(Event::Time(end));
        }

        self.shutdown();
        let _ = self.core.events.send(Event::End);
    }

    /// Single teardown path: stop the reader, abort every queue, join every
    /// worker, close the device.
    fn shutdown(&mut self) {
        self.core.abort_reading.store(true, Ordering::Release);
        self.core.wake_reader();
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }

        for slot in [
            &self.core.audio,
            &self.core.video,
            &self.core.subtitle,
            &self.core.data,
        ]
        .into_iter()
        .flatten()
        {
            slot.packets.abort();
            if let Some(frames) = &slot.frames {
                frames.abort();
            }
        }

        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }

        if let Some(mut sink) = self.sink.take() {
            sink.pause(true);
            sink.close();
        }
    }
}

/// Commit a decoded picture to the frame queue. Frames decoded under the
/// discard serial were only priming the codec.
pub(crate) fn queue_picture(frames: &FrameQueue, frame: Frame) -> bool {
    if frame.serial == SERIAL_DISCARD {
        return true;
    }
    frames.push(frame)
}

/// Post-processing hook between a decode worker and its frame queue. Holds
/// the optional filter graph, reconfiguring it whenever the input format
/// changes. A graph failure disables filtering for the rest of the session
/// rather than killing the worker.
struct FilterStage {
    graph: Option<Box<dyn FilterGraph>>,
    description: String,
    /// Format key of the last successful configure.
    configured: Option<String>,
}

impl FilterStage {
    fn new(core: &PlayerCore, description: Option<&str>) -> Self {
        let description = description.unwrap_or("").to_string();
        let graph = if description.is_empty() {
            None
        } else {
            core.backend.new_filter_graph(&core.opts)
        };
        Self {
            graph,
            description,
            configured: None,
        }
    }

    fn format_key(payload: &FramePayload) -> String {
        match payload {
            FramePayload::Video(pic) => format!("v:{}x{}", pic.width, pic.height),
            FramePayload::Audio(af) => {
                format!("a:{}:{}:{:?}", af.sample_rate, af.channels, af.format)
            }
            FramePayload::Subtitle(_) => "s".into(),
        }
    }

    /// Run one frame through the graph. Without a graph this is the identity.
    fn process(&mut self, payload: FramePayload) -> Vec<FramePayload> {
        let Some(graph) = &mut self.graph else {
            return vec![payload];
        };

        let key = Self::format_key(&payload);
        if self.configured.as_deref() != Some(&key) {
            if let Err(e) = graph.reconfigure(&self.description, &payload) {
                tracing::warn!(error = %e, filter = %self.description, "filter graph setup failed, disabling");
                self.graph = None;
                return vec![payload];
            }
            self.configured = Some(key);
        }

        if let Err(e) = graph.push(payload) {
            tracing::warn!(error = %e, "filter graph rejected a frame, disabling");
            self.graph = None;
            return Vec::new();
        }
        let mut out = Vec::new();
        loop {
            match graph.pull() {
                Ok(Some(filtered)) => out.push(filtered),
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "filter graph pull failed, disabling");
                    self.graph = None;
                    break;
                }
            }
        }
        out
    }
}

fn video_worker(core: Arc<PlayerCore>, mut pump: DecodePump) {
    let (packets, frames, time_base) = {
        let video = core.video.as_ref().unwrap();
        (
            video.packets.clone(),
            video.frames.as_ref().unwrap().clone(),
            video.desc.time_base,
        )
    };
    let mut reverse = ReverseBuffer::new(core.rewind_buffered.clone());
    let first_filter = core.opts.video_filters.first().cloned();
    let mut filter = FilterStage::new(&core, first_filter.as_deref());

    'worker: loop {
        let outcome = {
            let core = core.clone();
            let packets_fetch = packets.clone();
            let mut fetch = move || {
                if packets_fetch.is_empty() {
                    core.wake_reader();
                }
                packets_fetch.get()
            };
            pump.decode_frame(&mut fetch)
        };

        match outcome {
            DecodeOutcome::Aborted => break,
            DecodeOutcome::Drained => continue,
            DecodeOutcome::Failed(msg) => {
                core.log(LogLevel::Error, format!("video decode failed: {msg}"));
                break;
            }
            DecodeOutcome::Frame(payload) => {
                let serial = pump.pkt_serial();

                // Reverse mode intercepts raw decoder output; filters only
                // apply to forward playback.
                if core.rewind_mode() {
                    let FramePayload::Video(pic) = payload else {
                        continue;
                    };
                    let ts = pic.pts.unwrap_or(0);
                    let pts = pic.pts.map(|p| time_base.to_secs(p)).unwrap_or(f64::NAN);
                    let pos = pic.pos;
                    let frame = Frame {
                        payload: Arc::new(FramePayload::Video(pic)),
                        serial,
                        pts,
                        duration: core.frame_duration,
                        pos,
                        ts,
                    };
                    if !reverse.on_frame(&core, &frames, frame) {
                        break;
                    }
                    continue;
                }

                for payload in filter.process(payload) {
                    let FramePayload::Video(pic) = payload else {
                        continue;
                    };
                    let ts = pic.pts.unwrap_or(0);
                    let pts = pic.pts.map(|p| time_base.to_secs(p)).unwrap_or(f64::NAN);

                    // Early drop: the frame is already behind the master
                    // clock and more input is waiting.
                    if core.framedrop_allowed() && !pts.is_nan() {
                        let diff = pts - core.master_clock();
                        if !diff.is_nan()
                            && diff.abs() < AV_NOSYNC_THRESHOLD
                            && diff < 0.0
                            && serial == core.vidclk.serial()
                            && !packets.is_empty()
                        {
                            let mut ctl = core.ctl.lock().unwrap();
                            ctl.frame_drops_early += 1;
                            if core.speed().abs() > 1.0 {
                                ctl.drop_frame_mode = true;
                            }
                            continue;
                        }
                    }

                    let pos = pic.pos;
                    let frame = Frame {
                        payload: Arc::new(FramePayload::Video(pic)),
                        serial,
                        pts,
                        duration: core.frame_duration,
                        pos,
                        ts,
                    };
                    if !queue_picture(&frames, frame) {
                        break 'worker;
                    }
                }
            }
        }
    }
}

fn audio_worker(core: Arc<PlayerCore>, mut pump: DecodePump) {
    let (packets, frames) = {
        let audio = core.audio.as_ref().unwrap();
        (
            audio.packets.clone(),
            audio.frames.as_ref().unwrap().clone(),
        )
    };
    let audio_filters = core.opts.audio_filters.clone();
    let mut filter = FilterStage::new(&core, audio_filters.as_deref());

    'worker: loop {
        let outcome = {
            let core = core.clone();
            let packets_fetch = packets.clone();
            let mut fetch = move || {
                if packets_fetch.is_empty() {
                    core.wake_reader();
                }
                packets_fetch.get()
            };
            pump.decode_frame(&mut fetch)
        };

        match outcome {
            DecodeOutcome::Aborted => break,
            DecodeOutcome::Drained => continue,
            DecodeOutcome::Failed(msg) => {
                core.log(LogLevel::Error, format!("audio decode failed: {msg}"));
                break;
            }
            DecodeOutcome::Frame(payload) => {
                let serial = pump.pkt_serial();
                for payload in filter.process(payload) {
                    let FramePayload::Audio(af) = payload else {
                        continue;
                    };
                    let rate = af.sample_rate.max(1);
                    let pts = af
                        .pts
                        .map(|p| p as f64 / rate as f64)
                        .unwrap_or(f64::NAN);
                    let duration = af.nb_samples as f64 / rate as f64;
                    let ts = af.pts.unwrap_or(0);
                    let pos = af.pos;
                    let frame = Frame {
                        payload: Arc::new(FramePayload::Audio(af)),
                        serial,
                        pts,
                        duration,
                        pos,
                        ts,
                    };
                    if !frames.push(frame) {
                        break 'worker;
                    }
                }
            }
        }
    }
}

fn subtitle_worker(core: Arc<PlayerCore>, mut pump: SubtitlePump) {
    let (packets, frames) = {
        let subtitle = core.subtitle.as_ref().unwrap();
        (
            subtitle.packets.clone(),
            subtitle.frames.as_ref().unwrap().clone(),
        )
    };

    loop {
        let sub = {
            let core = core.clone();
            let packets_fetch = packets.clone();
            let mut fetch = move || {
                if packets_fetch.is_empty() {
                    core.wake_reader();
                }
                packets_fetch.get()
            };
            pump.decode(&mut fetch)
        };
        let Some(sub) = sub else { break };

        let pts = sub
            .pts
            .map(|p| p as f64 / 1_000_000.0)
            .unwrap_or(0.0);
        let duration = (sub.end_display_ms.saturating_sub(sub.start_display_ms)) as f64 / 1000.0;
        let serial = pump.pkt_serial();
        let ts = sub.pts.unwrap_or(0);
        let frame = Frame {
            payload: Arc::new(FramePayload::Subtitle(sub)),
            serial,
            pts,
            duration,
            pos: -1,
            ts,
        };
        if !frames.push(frame) {
            break;
        }
    }
}

/// Data packets are drained with serial discipline and surfaced to tracing;
/// interpreting the payload is a host concern.
fn data_worker(core: Arc<PlayerCore>) {
    let packets = core.data.as_ref().unwrap().packets.clone();
    loop {
        if packets.is_empty() {
            core.wake_reader();
        }
        let Some((serial, pkt)) = packets.get() else {
            break;
        };
        if serial != packets.serial() && serial != SERIAL_DISCARD {
            continue;
        }
        if let Packet::Data(data) = pkt {
            tracing::trace!(
                stream = data.stream,
                bytes = data.payload.len(),
                pts = ?data.pts,
                "data packet"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{Demuxer, FrameDecoder, Resampler, SubtitleDecoder};
    use backspin_core::{AudioParams, PacketData};

    struct StubBackend;

    impl MediaBackend for StubBackend {
        fn open(&self, _url: &str, _o: &PlayerOptions) -> Result<Box<dyn Demuxer>, MediaError> {
            Err(MediaError::Open("stub".into()))
        }

        fn new_decoder(
            &self,
            _s: &StreamDesc,
            _o: &PlayerOptions,
        ) -> Result<Box<dyn FrameDecoder>, MediaError> {
            Err(MediaError::DecoderSetup("stub".into()))
        }

        fn new_subtitle_decoder(
            &self,
            _s: &StreamDesc,
            _o: &PlayerOptions,
        ) -> Result<Box<dyn SubtitleDecoder>, MediaError> {
            Err(MediaError::DecoderSetup("stub".into()))
        }

        fn new_resampler(
            &self,
            _src: &AudioParams,
            _dst: &AudioParams,
        ) -> Result<Box<dyn Resampler>, MediaError> {
            Err(MediaError::Resample("stub".into()))
        }
    }

    fn desc(kind: StreamKind, index: usize) -> StreamDesc {
        StreamDesc {
            index,
            kind,
            time_base: TimeBase::new(1, 25),
            start_time: Some(0),
            duration: None,
            codec: "test".into(),
            extradata: Vec::new(),
            avg_frame_rate: Some((25, 1)),
            real_frame_rate: Some((25, 1)),
            width: 4,
            height: 4,
            sar: (1, 1),
            sample_rate: 8_000,
            channels: 1,
            attached_pic: false,
        }
    }

    fn test_core(
        opts: PlayerOptions,
        audio: bool,
        video: bool,
    ) -> (PlayerCore, Receiver<Event>, Receiver<Command>) {
        let (ev_tx, ev_rx) = bounded(1024);
        let (cmd_tx, cmd_rx) = unbounded();
        let audio_slot =
            audio.then(|| StreamSlot::new(desc(StreamKind::Audio, 1), Some((SAMPLE_QUEUE_SIZE, true))));
        let video_slot = video.then(|| {
            StreamSlot::new(desc(StreamKind::Video, 0), Some((VIDEO_PICTURE_QUEUE_SIZE, true)))
        });
        let audclk = Clock::new(
            audio_slot
                .as_ref()
                .map(|s| s.packets.serial_handle())
                .unwrap_or_else(|| Arc::new(AtomicI32::new(0))),
        );
        let vidclk = Clock::new(
            video_slot
                .as_ref()
                .map(|s| s.packets.serial_handle())
                .unwrap_or_else(|| Arc::new(AtomicI32::new(0))),
        );
        let core = PlayerCore {
            opts,
            backend: Arc::new(StubBackend),
            url: "test://".into(),
            audclk,
            vidclk,
            extclk: Clock::detached(),
            audio: audio_slot,
            video: video_slot,
            subtitle: None,
            data: None,
            ctl: Mutex::new(Control::new()),
            wait: Condvar::new(),
            abort_reading: Arc::new(AtomicBool::new(false)),
            paused: AtomicBool::new(false),
            rewind: AtomicBool::new(false),
            speed_bits: AtomicU64::new(1.0f64.to_bits()),
            volume: AtomicI32::new(VOLUME_MAX),
            muted: AtomicBool::new(false),
            read_pos: AtomicI64::new(0),
            rewind_buffered: Arc::new(AtomicUsize::new(0)),
            events: ev_tx,
            cmd_tx,
            duration_us: Some(10_000_000),
            start_time_us: 0,
            bit_rate: 0,
            realtime: false,
            format_name: "test".into(),
            seek_by_bytes: false,
            infinite_buffer: false,
            max_frame_duration: 3600.0,
            chapters: Vec::new(),
            video_time_base: TimeBase::new(1, 25),
            frame_duration: 0.04,
        };
        (core, ev_rx, cmd_rx)
    }

    #[test]
    fn master_prefers_audio_then_falls_back_to_external() {
        let (core, _ev, _cmd) = test_core(PlayerOptions::default(), true, true);
        assert_eq!(core.master_sync_type(), SyncMaster::Audio);

        let (core, _ev, _cmd) = test_core(PlayerOptions::default(), false, true);
        assert_eq!(core.master_sync_type(), SyncMaster::External);
    }

    #[test]
    fn video_master_falls_back_to_audio() {
        let mut opts = PlayerOptions::default();
        opts.sync_master = SyncMaster::Video;
        let (core, _ev, _cmd) = test_core(opts.clone(), true, false);
        assert_eq!(core.master_sync_type(), SyncMaster::Audio);

        let (core, _ev, _cmd) = test_core(opts, true, true);
        assert_eq!(core.master_sync_type(), SyncMaster::Video);
    }

    #[test]
    fn non_unity_speed_forces_external_master() {
        let (core, _ev, _cmd) = test_core(PlayerOptions::default(), true, true);
        core.store_speed(2.0);
        assert_eq!(core.master_sync_type(), SyncMaster::External);
        core.store_speed(-1.0);
        assert_eq!(core.master_sync_type(), SyncMaster::External);
    }

    #[test]
    fn frame_id_mapping_uses_the_frame_duration() {
        let (core, _ev, _cmd) = test_core(PlayerOptions::default(), true, true);
        assert_eq!(core.pts_to_frame_id(1.0), 25);
        assert!((core.frame_id_to_pts(25) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn unknown_frame_rate_maps_ids_in_minutes() {
        let (mut core, _ev, _cmd) = test_core(PlayerOptions::default(), true, true);
        core.frame_duration = 0.0;
        assert_eq!(core.pts_to_frame_id(120.0), 2);
        assert!((core.frame_id_to_pts(2) - 120.0).abs() < 1e-9);
    }

    #[test]
    fn chapter_stepping_finds_the_containing_chapter() {
        let mut opts = PlayerOptions::default();
        opts.sync_master = SyncMaster::External;
        let (mut core, _ev, _cmd) = test_core(opts, false, true);
        let tb = TimeBase::new(1, 1);
        core.chapters = vec![
            Chapter { start: 0, end: 10, time_base: tb },
            Chapter { start: 10, end: 20, time_base: tb },
            Chapter { start: 20, end: 30, time_base: tb },
            Chapter { start: 30, end: 40, time_base: tb },
        ];
        // Master (external) clock sits inside chapter 2.
        core.extclk.set(25.0, 0);

        core.seek_chapter(1);
        match core.ctl.lock().unwrap().seek {
            Some(SeekRequest::Pos { target_us, .. }) => assert_eq!(target_us, 30_000_000),
            other => panic!("expected a chapter seek, got {other:?}"),
        };
    }

    #[test]
    fn chapter_step_past_the_end_is_ignored() {
        let mut opts = PlayerOptions::default();
        opts.sync_master = SyncMaster::External;
        let (mut core, _ev, _cmd) = test_core(opts, false, true);
        let tb = TimeBase::new(1, 1);
        core.chapters = vec![Chapter { start: 0, end: 10, time_base: tb }];
        core.extclk.set(5.0, 0);
        core.seek_chapter(1);
        assert!(core.ctl.lock().unwrap().seek.is_none());
    }

    #[test]
    fn external_clock_speed_stays_inside_its_band() {
        let mut opts = PlayerOptions::default();
        opts.sync_master = SyncMaster::External;
        let (core, _ev, _cmd) = test_core(opts, false, true);
        let video = core.video.as_ref().unwrap();
        video.packets.start();

        // Starved queue: speed decays but never below the floor.
        for _ in 0..500 {
            core.check_external_clock_speed();
        }
        assert!((core.extclk.speed() - EXTERNAL_CLOCK_SPEED_MIN).abs() < 1e-9);

        // Overfull queue: speed climbs but never above the cap.
        for i in 0..(EXTERNAL_CLOCK_MAX_FRAMES + 2) {
            video.packets.put(Packet::Data(PacketData {
                stream: 0,
                pts: Some(i as i64),
                dts: None,
                duration: 1,
                pos: -1,
                keyframe: false,
                payload: vec![0; 4],
            }));
        }
        for _ in 0..500 {
            core.check_external_clock_speed();
        }
        assert!((core.extclk.speed() - EXTERNAL_CLOCK_SPEED_MAX).abs() < 1e-9);
    }

    #[test]
    fn relative_seek_clamps_at_the_container_start() {
        let (core, _ev, _cmd) = test_core(PlayerOptions::default(), true, true);
        // Master clock has never been set: NaN, so the last seek target (0)
        // is the base position.
        core.relative_seek(-5.0);
        match core.ctl.lock().unwrap().seek {
            Some(SeekRequest::Pos { target_us, .. }) => assert_eq!(target_us, 0),
            other => panic!("expected a clamped seek, got {other:?}"),
        };
    }

    #[test]
    fn seek_requests_do_not_overwrite_a_pending_one() {
        let (core, _ev, _cmd) = test_core(PlayerOptions::default(), true, true);
        core.send_seek_request(SeekRequest::Pos { target_us: 1_000_000, rel_us: 0 });
        core.send_seek_request(SeekRequest::Pos { target_us: 9_000_000, rel_us: 0 });
        match core.ctl.lock().unwrap().seek {
            Some(SeekRequest::Pos { target_us, .. }) => assert_eq!(target_us, 1_000_000),
            other => panic!("expected the first request to stick, got {other:?}"),
        };
    }

    #[test]
    fn pause_toggle_flips_all_clocks_and_reports_status() {
        let (core, ev, _cmd) = test_core(PlayerOptions::default(), true, true);
        core.stream_toggle_pause();
        assert!(core.is_paused());
        assert!(core.audclk.paused() && core.vidclk.paused() && core.extclk.paused());
        core.stream_toggle_pause();
        assert!(!core.is_paused());
        assert!(!core.vidclk.paused());

        let statuses: Vec<_> = ev.try_iter().collect();
        assert!(matches!(statuses[0], Event::Status(Status::Paused)));
        assert!(matches!(statuses[1], Event::Status(Status::Resumed)));
    }

    #[test]
    fn mute_toggle_and_volume_set() {
        let (core, _ev, _cmd) = test_core(PlayerOptions::default(), true, true);
        assert!(!core.handle_command(Command::Volume { mode: 0, value: 0.0 }));
        assert!(core.muted.load(Ordering::Acquire));
        assert!(!core.handle_command(Command::Volume { mode: 2, value: 0.5 }));
        assert_eq!(core.volume.load(Ordering::Acquire), VOLUME_MAX / 2);
        assert!(core.handle_command(Command::Quit));
    }
}
