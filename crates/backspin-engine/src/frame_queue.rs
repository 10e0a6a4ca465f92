// crates/backspin-engine/src/frame_queue.rs
//
// Fixed-capacity ring of decoded frames between one decode worker and one
// consumer (the audio callback or the video refresh loop).
//
// keep_last mode: the most recently displayed frame stays addressable at the
// read index until overwritten, so refresh timing can measure the distance
// between the last shown picture and the next one.

use std::sync::{Arc, Condvar, Mutex};

use backspin_core::{FramePayload, Serial};

pub const FRAME_QUEUE_MAX: usize = 16;

/// A decoded frame plus the bookkeeping the queues and clocks need.
/// The payload is shared, never copied: reverse playback re-queues the same
/// allocation it buffered.
#[derive(Clone)]
pub struct Frame {
    pub payload: Arc<FramePayload>,
    pub serial: Serial,
    /// Seconds; NaN when the codec provided no timestamp.
    pub pts: f64,
    /// Estimated seconds this frame covers.
    pub duration: f64,
    /// Byte position in the input, -1 when unknown.
    pub pos: i64,
    /// Presentation timestamp in the stream's own timebase.
    pub ts: i64,
}

/// Copyable slice of a frame's scheduling fields.
#[derive(Clone, Copy, Debug)]
pub struct FrameMeta {
    pub serial: Serial,
    pub pts: f64,
    pub duration: f64,
    pub pos: i64,
    pub ts: i64,
}

impl Frame {
    fn meta(&self) -> FrameMeta {
        FrameMeta {
            serial: self.serial,
            pts: self.pts,
            duration: self.duration,
            pos: self.pos,
            ts: self.ts,
        }
    }
}

struct Slot {
    frame: Frame,
    /// Set once the picture has been handed to the host.
    shown: bool,
}

struct Inner {
    slots: Vec<Option<Slot>>,
    rindex: usize,
    windex: usize,
    size: usize,
    rindex_shown: usize,
    abort: bool,
}

pub struct FrameQueue {
    inner: Mutex<Inner>,
    cond: Condvar,
    max_size: usize,
    keep_last: bool,
}

impl FrameQueue {
    pub fn new(max_size: usize, keep_last: bool) -> Self {
        let max_size = max_size.min(FRAME_QUEUE_MAX);
        Self {
            inner: Mutex::new(Inner {
                slots: (0..max_size).map(|_| None).collect(),
                rindex: 0,
                windex: 0,
                size: 0,
                rindex_shown: 0,
                abort: false,
            }),
            cond: Condvar::new(),
            max_size,
            keep_last,
        }
    }

    pub fn abort(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.abort = true;
        drop(inner);
        self.cond.notify_all();
    }

    /// Undisplayed frame count.
    pub fn nb_remaining(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.size - inner.rindex_shown
    }

    /// Block until a slot is free, then commit `frame`. False on abort.
    pub fn push(&self, frame: Frame) -> bool {
        let mut inner = self.inner.lock().unwrap();
        while inner.size >= self.max_size && !inner.abort {
            inner = self.cond.wait(inner).unwrap();
        }
        if inner.abort {
            return false;
        }
        let windex = inner.windex;
        inner.slots[windex] = Some(Slot { frame, shown: false });
        inner.windex = (windex + 1) % self.max_size;
        inner.size += 1;
        drop(inner);
        self.cond.notify_one();
        true
    }

    /// Block until a frame is readable; returns a handle to it (payload
    /// shared, not copied). `None` on abort.
    pub fn peek_readable(&self) -> Option<Frame> {
        let mut inner = self.inner.lock().unwrap();
        while inner.size - inner.rindex_shown == 0 && !inner.abort {
            inner = self.cond.wait(inner).unwrap();
        }
        if inner.abort {
            return None;
        }
        let idx = (inner.rindex + inner.rindex_shown) % self.max_size;
        inner.slots[idx].as_ref().map(|s| s.frame.clone())
    }

    /// Scheduling fields of the current unread frame, if any.
    pub fn peek(&self) -> Option<FrameMeta> {
        let inner = self.inner.lock().unwrap();
        if inner.size - inner.rindex_shown == 0 {
            return None;
        }
        let idx = (inner.rindex + inner.rindex_shown) % self.max_size;
        inner.slots[idx].as_ref().map(|s| s.frame.meta())
    }

    /// The frame after the current one.
    pub fn peek_next(&self) -> Option<FrameMeta> {
        let inner = self.inner.lock().unwrap();
        if inner.size - inner.rindex_shown < 2 {
            return None;
        }
        let idx = (inner.rindex + inner.rindex_shown + 1) % self.max_size;
        inner.slots[idx].as_ref().map(|s| s.frame.meta())
    }

    /// The last shown frame. Meaningful only in keep_last mode once a frame
    /// has been displayed.
    pub fn peek_last(&self) -> Option<FrameMeta> {
        let inner = self.inner.lock().unwrap();
        inner.slots[inner.rindex].as_ref().map(|s| s.frame.meta())
    }

    /// Release the read slot. The first call after a display only flips
    /// `rindex_shown` in keep_last mode; later calls actually advance.
    pub fn next(&self) {
        let mut inner = self.inner.lock().unwrap();
        if self.keep_last && inner.rindex_shown == 0 {
            inner.rindex_shown = 1;
            return;
        }
        let rindex = inner.rindex;
        inner.slots[rindex] = None;
        inner.rindex = (rindex + 1) % self.max_size;
        inner.size -= 1;
        drop(inner);
        self.cond.notify_one();
    }

    /// Hand the last-shown frame to the host exactly once: returns `None`
    /// until a frame is at the shown position, and again after it was taken.
    pub fn display_last(&self) -> Option<Frame> {
        let mut inner = self.inner.lock().unwrap();
        if inner.rindex_shown == 0 {
            return None;
        }
        let rindex = inner.rindex;
        let slot = inner.slots[rindex].as_mut()?;
        if slot.shown {
            return None;
        }
        slot.shown = true;
        Some(slot.frame.clone())
    }

    /// Whether a displayed frame occupies the read position.
    pub fn rindex_shown(&self) -> bool {
        self.inner.lock().unwrap().rindex_shown != 0
    }

    /// Byte position of the last shown frame when it belongs to `serial`.
    pub fn last_shown_position(&self, serial: Serial) -> Option<i64> {
        let inner = self.inner.lock().unwrap();
        if inner.rindex_shown == 0 {
            return None;
        }
        inner.slots[inner.rindex]
            .as_ref()
            .filter(|s| s.frame.serial == serial)
            .map(|s| s.frame.pos)
    }
}
