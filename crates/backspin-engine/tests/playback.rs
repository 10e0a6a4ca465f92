// crates/backspin-engine/tests/playback.rs
//
// End-to-end scenarios against scripted synthetic media: a demuxer with a
// precomputed packet schedule, a one-packet-one-frame codec, and a sink that
// pulls in real time. No container or codec libraries involved.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use backspin_core::{
    AudioFrame, AudioParams, Chapter, Command, DecodeError, Event, FrameDropMode, FramePayload,
    MediaError, PacketData, PlayerOptions, SampleFormat, Status, StreamDesc, StreamKind,
    SubtitleFrame, TimeBase, VideoPicture,
};
use backspin_engine::traits::{
    AudioCallback, AudioSink, AudioSpec, Demuxer, FrameDecoder, MediaBackend, Resampler,
    SubtitleDecoder,
};
use backspin_engine::Player;

const FPS: i64 = 25;
const VIDEO_TB: TimeBase = TimeBase { num: 1, den: 25 };
const AUDIO_RATE: u32 = 8_000;
const AUDIO_TB: TimeBase = TimeBase { num: 1, den: 8_000 };
/// Samples per synthetic audio packet (0.1 s).
const AUDIO_CHUNK: i64 = 800;
const KEYFRAME_INTERVAL: i64 = 5;

// ── Synthetic demuxer ─────────────────────────────────────────────────────────

#[derive(Clone, Copy)]
struct MediaSpec {
    video_frames: i64,
    with_audio: bool,
}

impl MediaSpec {
    fn duration_us(&self) -> i64 {
        self.video_frames * 1_000_000 / FPS
    }
}

struct Scheduled {
    time_us: i64,
    pkt: PacketData,
}

struct SyntheticDemuxer {
    spec: MediaSpec,
    streams: Vec<StreamDesc>,
    schedule: Vec<Scheduled>,
    cursor: usize,
    interrupt: Option<Arc<AtomicBool>>,
}

impl SyntheticDemuxer {
    fn new(spec: MediaSpec) -> Self {
        let mut streams = vec![StreamDesc {
            index: 0,
            kind: StreamKind::Video,
            time_base: VIDEO_TB,
            start_time: Some(0),
            duration: Some(spec.video_frames),
            codec: "rawvideo".into(),
            extradata: Vec::new(),
            avg_frame_rate: Some((FPS as i32, 1)),
            real_frame_rate: Some((FPS as i32, 1)),
            width: 4,
            height: 4,
            sar: (1, 1),
            sample_rate: 0,
            channels: 0,
            attached_pic: false,
        }];
        if spec.with_audio {
            streams.push(StreamDesc {
                index: 1,
                kind: StreamKind::Audio,
                time_base: AUDIO_TB,
                start_time: Some(0),
                duration: Some(spec.duration_us() * AUDIO_RATE as i64 / 1_000_000),
                codec: "pcm_s16le".into(),
                extradata: Vec::new(),
                avg_frame_rate: None,
                real_frame_rate: None,
                width: 0,
                height: 0,
                sar: (0, 1),
                sample_rate: AUDIO_RATE,
                channels: 1,
                attached_pic: false,
            });
        }

        let mut schedule = Vec::new();
        for n in 0..spec.video_frames {
            schedule.push(Scheduled {
                time_us: VIDEO_TB.rescale(n, TimeBase::MICROS),
                pkt: PacketData {
                    stream: 0,
                    pts: Some(n),
                    dts: Some(n),
                    duration: 1,
                    pos: n * 1000,
                    keyframe: n % KEYFRAME_INTERVAL == 0,
                    payload: vec![n as u8; 8],
                },
            });
        }
        if spec.with_audio {
            let chunks = spec.duration_us() / 100_000;
            for k in 0..chunks {
                schedule.push(Scheduled {
                    time_us: AUDIO_TB.rescale(k * AUDIO_CHUNK, TimeBase::MICROS),
                    pkt: PacketData {
                        stream: 1,
                        pts: Some(k * AUDIO_CHUNK),
                        dts: Some(k * AUDIO_CHUNK),
                        duration: AUDIO_CHUNK,
                        pos: -1,
                        keyframe: true,
                        payload: vec![0u8; 16],
                    },
                });
            }
        }
        schedule.sort_by_key(|s| s.time_us);

        Self {
            spec,
            streams,
            schedule,
            cursor: 0,
            interrupt: None,
        }
    }

    /// Schedule position of the latest video keyframe at or before `target_us`.
    fn keyframe_position(&self, target_us: i64) -> usize {
        let mut best = 0;
        for (i, s) in self.schedule.iter().enumerate() {
            if s.pkt.stream == 0 && s.pkt.keyframe && s.time_us <= target_us {
                best = i;
            }
            if s.time_us > target_us {
                break;
            }
        }
        best
    }
}

impl Demuxer for SyntheticDemuxer {
    fn streams(&self) -> &[StreamDesc] {
        &self.streams
    }

    fn chapters(&self) -> &[Chapter] {
        &[]
    }

    fn duration(&self) -> Option<i64> {
        Some(self.spec.duration_us())
    }

    fn start_time(&self) -> Option<i64> {
        Some(0)
    }

    fn bit_rate(&self) -> i64 {
        0
    }

    fn format_name(&self) -> &str {
        "synthetic"
    }

    fn is_realtime(&self) -> bool {
        false
    }

    fn ts_discontinuous(&self) -> bool {
        false
    }

    fn find_best_stream(
        &self,
        kind: StreamKind,
        _wanted: Option<&str>,
        _related: Option<usize>,
    ) -> Option<usize> {
        self.streams.iter().find(|s| s.kind == kind).map(|s| s.index)
    }

    fn read_packet(&mut self) -> Result<PacketData, MediaError> {
        if let Some(flag) = &self.interrupt {
            if flag.load(Ordering::Acquire) {
                return Err(MediaError::Cancelled);
            }
        }
        match self.schedule.get(self.cursor) {
            Some(s) => {
                self.cursor += 1;
                Ok(s.pkt.clone())
            }
            None => Err(MediaError::Eof),
        }
    }

    fn seek_time(&mut self, target_us: i64, _min: i64, _max: i64) -> Result<(), MediaError> {
        self.cursor = self.keyframe_position(target_us);
        Ok(())
    }

    fn seek_bytes(&mut self, _target: i64, _min: i64, _max: i64) -> Result<(), MediaError> {
        Err(MediaError::Seek("no byte seeking in synthetic media".into()))
    }

    fn seek_backward_keyframe(&mut self, target_us: i64) -> Result<(), MediaError> {
        self.cursor = self.keyframe_position(target_us.max(0));
        Ok(())
    }

    fn read_pause(&mut self) {}

    fn read_play(&mut self) {}

    fn set_interrupt(&mut self, flag: Arc<AtomicBool>) {
        self.interrupt = Some(flag);
    }

    fn attached_picture(&self, _stream: usize) -> Option<PacketData> {
        None
    }
}

// ── Synthetic codecs ──────────────────────────────────────────────────────────

/// One queued frame per sent packet; pts passed straight through.
struct OneToOneDecoder {
    kind: StreamKind,
    ready: VecDeque<FramePayload>,
    draining: bool,
}

impl FrameDecoder for OneToOneDecoder {
    fn send_packet(&mut self, pkt: &PacketData) -> Result<(), DecodeError> {
        let payload = match self.kind {
            StreamKind::Video => FramePayload::Video(Arc::new(VideoPicture {
                pts: pkt.pts,
                width: 4,
                height: 4,
                sar: (1, 1),
                data: vec![0u8; 16 + 4 + 4],
                pos: pkt.pos,
            })),
            _ => FramePayload::Audio(AudioFrame {
                pts: pkt.pts,
                sample_rate: AUDIO_RATE,
                channels: 1,
                format: SampleFormat::S16,
                nb_samples: pkt.duration as usize,
                planes: vec![vec![0u8; pkt.duration as usize * 2]],
                pos: pkt.pos,
            }),
        };
        self.ready.push_back(payload);
        Ok(())
    }

    fn send_eof(&mut self) -> Result<(), DecodeError> {
        self.draining = true;
        Ok(())
    }

    fn receive_frame(&mut self) -> Result<FramePayload, DecodeError> {
        match self.ready.pop_front() {
            Some(f) => Ok(f),
            None if self.draining => Err(DecodeError::Eof),
            None => Err(DecodeError::Again),
        }
    }

    fn flush(&mut self) {
        self.ready.clear();
        self.draining = false;
    }
}

struct NoSubtitles;

impl SubtitleDecoder for NoSubtitles {
    fn decode(&mut self, _pkt: &PacketData) -> Result<Option<SubtitleFrame>, DecodeError> {
        Ok(None)
    }

    fn flush(&mut self) {}
}

struct PassthroughResampler;

impl Resampler for PassthroughResampler {
    fn convert(&mut self, frame: &AudioFrame, out: &mut Vec<u8>) -> Result<usize, MediaError> {
        out.clear();
        out.extend_from_slice(&frame.planes[0]);
        Ok(frame.nb_samples)
    }

    fn set_compensation(&mut self, _delta: i32, _window: i32) -> Result<(), MediaError> {
        Ok(())
    }
}

struct SyntheticBackend {
    spec: MediaSpec,
}

impl MediaBackend for SyntheticBackend {
    fn open(&self, _url: &str, _options: &PlayerOptions) -> Result<Box<dyn Demuxer>, MediaError> {
        Ok(Box::new(SyntheticDemuxer::new(self.spec)))
    }

    fn new_decoder(
        &self,
        stream: &StreamDesc,
        _options: &PlayerOptions,
    ) -> Result<Box<dyn FrameDecoder>, MediaError> {
        Ok(Box::new(OneToOneDecoder {
            kind: stream.kind,
            ready: VecDeque::new(),
            draining: false,
        }))
    }

    fn new_subtitle_decoder(
        &self,
        _stream: &StreamDesc,
        _options: &PlayerOptions,
    ) -> Result<Box<dyn SubtitleDecoder>, MediaError> {
        Ok(Box::new(NoSubtitles))
    }

    fn new_resampler(
        &self,
        _src: &AudioParams,
        _dst: &AudioParams,
    ) -> Result<Box<dyn Resampler>, MediaError> {
        Ok(Box::new(PassthroughResampler))
    }
}

// ── Synthetic sink ────────────────────────────────────────────────────────────

/// Pulls one device period at the real-time rate from its own thread.
struct PullSink {
    paused: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    callback: Arc<Mutex<Option<AudioCallback>>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl PullSink {
    fn new() -> Self {
        Self {
            paused: Arc::new(AtomicBool::new(true)),
            stop: Arc::new(AtomicBool::new(false)),
            callback: Arc::new(Mutex::new(None)),
            thread: None,
        }
    }
}

impl AudioSink for PullSink {
    fn open(&mut self, wanted: &AudioSpec) -> Result<AudioSpec, MediaError> {
        Ok(AudioSpec {
            freq: if wanted.freq > 0 { wanted.freq } else { 8_000 },
            channels: if wanted.channels > 0 {
                wanted.channels
            } else {
                1
            },
            samples: 512,
        })
    }

    fn start(&mut self, callback: AudioCallback) -> Result<(), MediaError> {
        *self.callback.lock().unwrap() = Some(callback);
        let paused = self.paused.clone();
        let stop = self.stop.clone();
        let cb = self.callback.clone();
        self.thread = Some(std::thread::spawn(move || {
            let period = Duration::from_secs_f64(512.0 / AUDIO_RATE as f64);
            let mut buf = vec![0u8; 512 * 2];
            while !stop.load(Ordering::Acquire) {
                if !paused.load(Ordering::Acquire) {
                    if let Some(cb) = cb.lock().unwrap().as_mut() {
                        cb(&mut buf);
                    }
                }
                std::thread::sleep(period);
            }
        }));
        Ok(())
    }

    fn pause(&mut self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }

    fn close(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

// ── Harness ───────────────────────────────────────────────────────────────────

struct Session {
    controls: backspin_engine::PlayerControls,
    events: crossbeam_channel::Receiver<Event>,
    thread: Option<std::thread::JoinHandle<()>>,
}

fn start(spec: MediaSpec, mut opts: PlayerOptions) -> Session {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    // Deterministic frame accounting unless a test opts back in.
    if matches!(opts.framedrop, FrameDropMode::Auto) {
        opts.framedrop = FrameDropMode::Off;
    }
    let backend = Arc::new(SyntheticBackend { spec });
    let (player, events) =
        Player::open(backend, Box::new(PullSink::new()), "synthetic://clip", opts)
            .expect("open synthetic media");
    let controls = player.controls();
    let thread = std::thread::spawn(move || player.run());
    Session {
        controls,
        events,
        thread: Some(thread),
    }
}

impl Session {
    /// Collect events until `done` says stop or the deadline passes.
    fn collect_until(&self, timeout: Duration, mut done: impl FnMut(&Event) -> bool) -> Vec<Event> {
        let deadline = Instant::now() + timeout;
        let mut events = Vec::new();
        while Instant::now() < deadline {
            match self.events.recv_timeout(Duration::from_millis(50)) {
                Ok(ev) => {
                    let stop = done(&ev);
                    events.push(ev);
                    if stop {
                        break;
                    }
                }
                Err(_) => {
                    if self.thread.as_ref().map(|t| t.is_finished()).unwrap_or(true) {
                        break;
                    }
                }
            }
        }
        events
    }

    fn finish(mut self) -> Vec<Event> {
        self.controls.quit();
        let tail = self.collect_until(Duration::from_secs(5), |ev| matches!(ev, Event::End));
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
        tail
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.controls.quit();
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

fn yuv_pts(events: &[Event]) -> Vec<f64> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::Yuv { pts, .. } => Some(*pts),
            _ => None,
        })
        .collect()
}

// ── Scenarios ─────────────────────────────────────────────────────────────────

#[test]
fn forward_playback_presents_every_frame_in_order() {
    let spec = MediaSpec {
        video_frames: 50, // 2 s at 25 fps
        with_audio: true,
    };
    let session = start(spec, PlayerOptions::default());
    let events = session.collect_until(Duration::from_secs(15), |ev| matches!(ev, Event::End));

    assert!(
        events.iter().any(|e| matches!(e, Event::End)),
        "playback should end on its own"
    );
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::Status(Status::Start))));

    let pts = yuv_pts(&events);
    assert_eq!(pts.len(), 50, "every frame is presented exactly once");
    for pair in pts.windows(2) {
        assert!(pair[1] >= pair[0], "pts must be non-decreasing: {pair:?}");
    }

    // The final position snaps to the container duration.
    let last_time = events
        .iter()
        .rev()
        .find_map(|e| match e {
            Event::Time(t) => Some(*t),
            _ => None,
        })
        .expect("time events present");
    assert!(
        (last_time - 2.0).abs() < 0.05,
        "final position {last_time} should be ~2.0"
    );
}

#[test]
fn meta_and_statics_describe_the_container() {
    let spec = MediaSpec {
        video_frames: 25,
        with_audio: true,
    };
    let session = start(spec, PlayerOptions::default());
    let events = session.collect_until(Duration::from_secs(5), |ev| {
        matches!(ev, Event::Statics(_))
    });
    drop(session);

    let meta = events
        .iter()
        .find_map(|e| match e {
            Event::Meta(m) => Some(m.clone()),
            _ => None,
        })
        .expect("meta event after open");
    assert_eq!(meta.width, 4);
    assert_eq!(meta.height, 4);
    assert!((meta.duration - 1.0).abs() < 0.01);

    let stats = events
        .iter()
        .find_map(|e| match e {
            Event::Statics(s) => Some(*s),
            _ => None,
        })
        .expect("statics event after open");
    assert!((stats.fps - 25.0).abs() < 0.01);
}

#[test]
fn absolute_seek_jumps_without_presenting_the_gap() {
    let spec = MediaSpec {
        video_frames: 100, // 4 s
        with_audio: true,
    };
    let session = start(spec, PlayerOptions::default());

    // Let it play a little, then jump to 3.0 s.
    std::thread::sleep(Duration::from_millis(200));
    session.controls.seek_to(3.0);

    let events = session.collect_until(Duration::from_secs(15), |ev| matches!(ev, Event::End));
    let pts = yuv_pts(&events);

    let landing = pts
        .iter()
        .position(|&p| p >= 3.0)
        .expect("a frame at or past the seek target is presented");
    // Nothing from the skipped-over middle of the file is ever shown.
    assert!(
        pts.iter().all(|&p| !(1.5..3.0).contains(&p)),
        "no frame from the seek gap may be presented: {pts:?}"
    );
    // After landing, playback continues monotonically to the end.
    for pair in pts[landing..].windows(2) {
        assert!(pair[1] >= pair[0]);
    }
    assert!(pts.last().copied().unwrap_or(0.0) >= 3.9 - 0.05);
}

#[test]
fn pause_and_resume_stall_and_recover_without_losing_frames() {
    let spec = MediaSpec {
        video_frames: 40, // 1.6 s
        with_audio: true,
    };
    let session = start(spec, PlayerOptions::default());

    std::thread::sleep(Duration::from_millis(300));
    session.controls.toggle_pause();

    // Wait for the pause to take effect, then measure the stall.
    let pre = session.collect_until(Duration::from_secs(2), |ev| {
        matches!(ev, Event::Status(Status::Paused))
    });
    assert!(pre
        .iter()
        .any(|e| matches!(e, Event::Status(Status::Paused))));

    let during = session.collect_until(Duration::from_millis(400), |_| false);
    assert_eq!(
        yuv_pts(&during).len(),
        0,
        "no frames are presented while paused"
    );

    session.controls.toggle_pause();
    let rest = session.collect_until(Duration::from_secs(15), |ev| matches!(ev, Event::End));
    assert!(rest
        .iter()
        .any(|e| matches!(e, Event::Status(Status::Resumed))));
    assert!(rest.iter().any(|e| matches!(e, Event::End)));

    let mut all = Vec::new();
    all.extend(yuv_pts(&pre));
    all.extend(yuv_pts(&rest));
    assert_eq!(all.len(), 40, "no frames are lost across a pause");
}

#[test]
fn reverse_playback_runs_back_to_the_start_and_ends() {
    let spec = MediaSpec {
        video_frames: 30, // 1.2 s
        with_audio: false,
    };
    let session = start(spec, PlayerOptions::default());

    // Let roughly 0.5 s play forward, then reverse.
    std::thread::sleep(Duration::from_millis(500));
    session.controls.set_speed(-1.0);

    let events = session.collect_until(Duration::from_secs(20), |ev| {
        matches!(ev, Event::Status(Status::RewindEnd))
    });
    assert!(
        events
            .iter()
            .any(|e| matches!(e, Event::Status(Status::RewindEnd))),
        "reverse playback must terminate with rewind_end"
    );

    let pts = yuv_pts(&events);
    let peak = pts
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
        .map(|(i, _)| i)
        .unwrap();
    let reverse_run = &pts[peak..];
    assert!(
        reverse_run.len() >= 3,
        "expected several reverse frames, got {reverse_run:?}"
    );
    for pair in reverse_run.windows(2) {
        assert!(
            pair[1] < pair[0],
            "reverse pts must strictly decrease: {reverse_run:?}"
        );
    }
    assert!(
        reverse_run.last().copied().unwrap() <= 0.04 + 1e-9,
        "rewind should reach the container start"
    );

    drop(session);
}

#[test]
fn frame_stepping_advances_one_picture_at_a_time_while_paused() {
    let spec = MediaSpec {
        video_frames: 50,
        with_audio: true,
    };
    let session = start(spec, PlayerOptions::default());

    std::thread::sleep(Duration::from_millis(200));
    session.controls.toggle_pause();
    let _ = session.collect_until(Duration::from_secs(2), |ev| {
        matches!(ev, Event::Status(Status::Paused))
    });

    let mut stepped_pts = Vec::new();
    for _ in 0..3 {
        session.controls.send(Command::NextFrame);
        // Each step presents exactly one frame and re-pauses.
        let step = session.collect_until(Duration::from_secs(3), |ev| {
            matches!(ev, Event::Status(Status::Paused))
        });
        let frames = yuv_pts(&step);
        assert_eq!(frames.len(), 1, "one frame per step, got {frames:?}");
        assert!(
            step.iter()
                .any(|e| matches!(e, Event::Status(Status::Paused))),
            "the engine re-pauses after a step"
        );
        stepped_pts.extend(frames);
    }
    for pair in stepped_pts.windows(2) {
        assert!(pair[1] > pair[0], "steps advance: {stepped_pts:?}");
    }

    drop(session);
}

#[test]
fn quitting_mid_playback_tears_down_cleanly() {
    let spec = MediaSpec {
        video_frames: 250, // 10 s: playback must not finish on its own
        with_audio: true,
    };
    let session = start(spec, PlayerOptions::default());
    std::thread::sleep(Duration::from_millis(300));
    let tail = session.finish();
    assert!(tail.iter().any(|e| matches!(e, Event::End)));
}

#[test]
fn video_only_playback_with_audio_disabled() {
    let spec = MediaSpec {
        video_frames: 25,
        with_audio: true,
    };
    let mut opts = PlayerOptions::default();
    opts.audio_disable = true;
    let session = start(spec, opts);
    let events = session.collect_until(Duration::from_secs(15), |ev| matches!(ev, Event::End));
    assert!(events.iter().any(|e| matches!(e, Event::End)));
    // The audio stream was never opened, so every video frame still shows.
    assert_eq!(yuv_pts(&events).len(), 25);
}
