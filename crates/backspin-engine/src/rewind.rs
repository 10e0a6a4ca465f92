// crates/backspin-engine/src/rewind.rs
//
// Reverse playback. Containers only demux forward, so the reader repeatedly
// seeks to the keyframe before the current window and replays it; the decode
// worker parks forward-decoded pictures here and flushes them into the frame
// queue in reverse order once the window boundary arrives.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use backspin_core::Status;

use crate::clock::wall_time;
use crate::frame_queue::{Frame, FrameMeta, FrameQueue};
use crate::player::{queue_picture, PlayerCore};
use crate::video::{compute_target_delay, vp_duration_reversed};
use crate::AV_SYNC_THRESHOLD_MAX;

/// Window buffer owned by the video decode worker.
pub(crate) struct ReverseBuffer {
    frames: VecDeque<Frame>,
    /// Mirrored count, read by the reader's end-of-stream check.
    buffered: Arc<AtomicUsize>,
}

impl ReverseBuffer {
    pub fn new(buffered: Arc<AtomicUsize>) -> Self {
        Self {
            frames: VecDeque::new(),
            buffered,
        }
    }

    /// Intercept one forward-decoded picture while rewinding.
    ///
    /// Pictures before the window boundary accumulate; the first picture at
    /// or past it closes the window: the boundary becomes the pts of the
    /// oldest buffered picture and the buffer drains into the frame queue
    /// newest-first. Returns false when the frame queue aborted.
    pub fn on_frame(&mut self, core: &PlayerCore, frames_q: &FrameQueue, frame: Frame) -> bool {
        let video = match &core.video {
            Some(v) => v,
            None => return true,
        };
        if frame.serial != video.packets.serial() {
            return true; // pre-seek leftover
        }

        let rewind_target = core.ctl.lock().unwrap().rewind_target;
        if frame.ts < rewind_target {
            self.frames.push_back(frame);
            self.buffered.store(self.frames.len(), Ordering::Release);
            return true;
        }

        // Boundary reached: this frame was already presented on the previous
        // window, drop it and replay the buffer backward.
        let next_target = self.frames.front().map(|f| f.ts).unwrap_or(0);
        core.ctl.lock().unwrap().rewind_target = next_target;

        while let Some(f) = self.frames.pop_back() {
            self.buffered.store(self.frames.len(), Ordering::Release);
            if !queue_picture(frames_q, f) {
                return false;
            }
        }
        true
    }
}

impl PlayerCore {
    /// Delay before presenting the next reverse-order picture. Symmetric to
    /// the forward computation with the clock difference flipped: in reverse
    /// the video clock runs down while the master follows it.
    pub(crate) fn compute_target_delay_reversed(&self, lastvp: &FrameMeta, vp: &FrameMeta) -> f64 {
        let delay = vp_duration_reversed(lastvp, vp, self.max_frame_duration);
        let diff = self.master_clock() - self.vidclk.get();
        compute_target_delay(delay, diff, self.max_frame_duration)
    }

    /// Reverse-mode presenter, substituted for the forward refresh while the
    /// rewind flag is up.
    pub(crate) fn video_refresh_rewind(&self, remaining_time: &mut f64) {
        if !self.rewind_mode() {
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

            let lastvp = frames.peek_last();
            if lastvp.map(|l| l.serial != vp.serial).unwrap_or(true) {
                self.ctl.lock().unwrap().frame_timer = wall_time();
            }

            if self.is_paused() {
                return;
            }

            let time = wall_time();
            let delay = lastvp
                .map(|l| self.compute_target_delay_reversed(&l, &vp))
                .unwrap_or(0.0);

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

            frames.next();
            self.ctl.lock().unwrap().force_refresh = true;

            // The reader parked at the container start: once its terminal
            // frame is presented, rewind is over and playback snaps forward.
            let rewind_eof_pts = self.ctl.lock().unwrap().rewind_eof_pts;
            if rewind_eof_pts >= vp.ts && !self.is_paused() {
                self.stream_toggle_pause();
                self.change_speed(1.0);
                self.emit(backspin_core::Event::Status(Status::RewindEnd));
            } else {
                let stepping = self.ctl.lock().unwrap().stepping;
                if stepping && !self.is_paused() {
                    self.stream_toggle_pause();
                }
            }
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backspin_core::{FramePayload, VideoPicture};

    fn frame(ts: i64, serial: i32) -> Frame {
        Frame {
            payload: Arc::new(FramePayload::Video(Arc::new(VideoPicture {
                pts: Some(ts),
                width: 2,
                height: 2,
                sar: (1, 1),
                data: vec![0; 6],
                pos: -1,
            }))),
            serial,
            pts: ts as f64 / 25.0,
            duration: 0.04,
            pos: -1,
            ts,
        }
    }

    #[test]
    fn window_drains_in_reverse_order() {
        // Exercise the buffer mechanics directly, without a core: frames
        // below the boundary accumulate, the boundary frame flips them.
        let counter = Arc::new(AtomicUsize::new(0));
        let mut buffer = ReverseBuffer::new(counter.clone());
        let q = FrameQueue::new(8, true);

        for ts in [10, 11, 12] {
            buffer.frames.push_back(frame(ts, 1));
        }
        buffer.buffered.store(3, Ordering::Release);

        // Drain manually the way on_frame does once the boundary arrives.
        while let Some(f) = buffer.frames.pop_back() {
            buffer.buffered.store(buffer.frames.len(), Ordering::Release);
            assert!(queue_picture(&q, f));
        }

        assert_eq!(counter.load(Ordering::Acquire), 0);
        let first = q.peek().unwrap();
        assert_eq!(first.ts, 12);
        q.next();
        assert_eq!(q.peek().unwrap().ts, 11);
        q.next();
        assert_eq!(q.peek().unwrap().ts, 10);
    }

    #[test]
    fn discard_serial_frames_never_reach_the_queue() {
        let q = FrameQueue::new(2, true);
        assert!(queue_picture(&q, frame(1, backspin_core::SERIAL_DISCARD)));
        assert_eq!(q.nb_remaining(), 0);
    }
}
