// crates/backspin-engine/src/packet_queue.rs
//
// Bounded-by-policy FIFO of demuxed packets, each tagged with the serial it
// was queued under. The reader fills it, one decode worker drains it.
//
// The queue owns the stream's authoritative serial: queueing a Flush packet
// pre-increments it, which logically fences everything queued before.

use std::collections::VecDeque;
use std::mem;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use backspin_core::{Packet, Serial, TimeBase};

use crate::MIN_FRAMES;

struct Inner {
    packets: VecDeque<(Serial, Packet)>,
    nb_packets: usize,
    /// Payload bytes plus a fixed per-entry overhead.
    size: usize,
    /// Accumulated packet duration, stream timebase units.
    duration: i64,
    abort: bool,
}

pub struct PacketQueue {
    inner: Mutex<Inner>,
    cond: Condvar,
    serial: Arc<AtomicI32>,
}

const ENTRY_OVERHEAD: usize = mem::size_of::<(Serial, Packet)>();

impl PacketQueue {
    /// Starts aborted; `start()` arms it and queues the first flush.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                packets: VecDeque::new(),
                nb_packets: 0,
                size: 0,
                duration: 0,
                abort: true,
            }),
            cond: Condvar::new(),
            serial: Arc::new(AtomicI32::new(0)),
        }
    }

    /// Handle for clocks and decoders that must observe the current serial.
    pub fn serial_handle(&self) -> Arc<AtomicI32> {
        self.serial.clone()
    }

    pub fn serial(&self) -> Serial {
        self.serial.load(Ordering::Acquire)
    }

    /// Enqueue under the queue's current serial.
    pub fn put(&self, pkt: Packet) -> bool {
        self.put_with_serial(pkt, None)
    }

    /// Enqueue under `serial`, or the current one when `None`. A Flush packet
    /// advances the authoritative serial before being tagged. Returns false
    /// (dropping the packet) when the queue is aborted.
    pub fn put_with_serial(&self, pkt: Packet, serial: Option<Serial>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.abort {
            return false;
        }
        if pkt.is_flush() {
            self.serial.fetch_add(1, Ordering::AcqRel);
        }
        let tag = serial.unwrap_or_else(|| self.serial.load(Ordering::Acquire));
        inner.size += pkt.size() + ENTRY_OVERHEAD;
        inner.duration += pkt.duration();
        inner.nb_packets += 1;
        inner.packets.push_back((tag, pkt));
        drop(inner);
        self.cond.notify_one();
        true
    }

    /// Queue the drain marker for `stream`'s decoder.
    pub fn put_null(&self, stream: usize) -> bool {
        self.put(Packet::Null { stream })
    }

    /// Blocking pop. `None` means the queue was aborted.
    pub fn get(&self) -> Option<(Serial, Packet)> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.abort {
                return None;
            }
            if let Some((serial, pkt)) = inner.packets.pop_front() {
                inner.nb_packets -= 1;
                inner.size -= pkt.size() + ENTRY_OVERHEAD;
                inner.duration -= pkt.duration();
                return Some((serial, pkt));
            }
            inner = self.cond.wait(inner).unwrap();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().nb_packets == 0
    }

    pub fn nb_packets(&self) -> usize {
        self.inner.lock().unwrap().nb_packets
    }

    pub fn size(&self) -> usize {
        self.inner.lock().unwrap().size
    }

    pub fn duration(&self) -> i64 {
        self.inner.lock().unwrap().duration
    }

    /// Clear the abort flag and queue a flush so the decoder resets.
    pub fn start(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.abort = false;
        }
        self.put(Packet::Flush);
    }

    /// Drop all contents and begin the next serial epoch. Used after seeks.
    pub fn next_serial(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.abort {
                return;
            }
            Self::flush_locked(&mut inner);
        }
        self.put(Packet::Flush);
    }

    /// Reject further puts, wake all waiters, drain contents.
    pub fn abort(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.abort = true;
        Self::flush_locked(&mut inner);
        drop(inner);
        self.cond.notify_all();
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.lock().unwrap().abort
    }

    /// Enough buffered to stop reading ahead: a healthy packet count and, when
    /// the container provides durations, more than a second of material.
    pub fn has_enough_packets(&self, time_base: TimeBase) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.abort
            || (inner.nb_packets > MIN_FRAMES
                && (inner.duration == 0 || time_base.to_secs(inner.duration) > 1.0))
    }

    fn flush_locked(inner: &mut Inner) {
        inner.packets.clear();
        inner.nb_packets = 0;
        inner.size = 0;
        inner.duration = 0;
    }
}

impl Default for PacketQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backspin_core::PacketData;

    fn data_packet(stream: usize, payload_len: usize, duration: i64) -> Packet {
        Packet::Data(PacketData {
            stream,
            pts: Some(0),
            dts: Some(0),
            duration,
            pos: -1,
            keyframe: false,
            payload: vec![0u8; payload_len],
        })
    }

    #[test]
    fn rejects_puts_until_started() {
        let q = PacketQueue::new();
        assert!(!q.put(data_packet(0, 8, 1)));
        q.start();
        assert!(q.put(data_packet(0, 8, 1)));
    }

    #[test]
    fn start_queues_a_flush_and_bumps_serial() {
        let q = PacketQueue::new();
        q.start();
        assert_eq!(q.serial(), 1);
        let (serial, pkt) = q.get().unwrap();
        assert_eq!(serial, 1);
        assert!(pkt.is_flush());
    }

    #[test]
    fn accounting_matches_contents() {
        let q = PacketQueue::new();
        q.start();
        let _ = q.get(); // discard the flush
        q.put(data_packet(0, 100, 10));
        q.put(data_packet(0, 50, 5));
        assert_eq!(q.nb_packets(), 2);
        assert_eq!(q.size(), 150 + 2 * ENTRY_OVERHEAD);
        assert_eq!(q.duration(), 15);
        let _ = q.get().unwrap();
        assert_eq!(q.nb_packets(), 1);
        assert_eq!(q.size(), 50 + ENTRY_OVERHEAD);
        assert_eq!(q.duration(), 5);
        let _ = q.get().unwrap();
        assert_eq!(q.nb_packets(), 0);
        assert_eq!(q.size(), 0);
        assert_eq!(q.duration(), 0);
    }

    #[test]
    fn explicit_serial_overrides_current() {
        let q = PacketQueue::new();
        q.start();
        let _ = q.get();
        q.put_with_serial(data_packet(0, 1, 0), Some(backspin_core::SERIAL_DISCARD));
        let (serial, _) = q.get().unwrap();
        assert_eq!(serial, backspin_core::SERIAL_DISCARD);
    }

    #[test]
    fn next_serial_flushes_and_advances() {
        let q = PacketQueue::new();
        q.start();
        q.put(data_packet(0, 8, 1));
        q.put(data_packet(0, 8, 1));
        q.next_serial();
        assert_eq!(q.serial(), 2);
        // Only the new flush survives.
        let (serial, pkt) = q.get().unwrap();
        assert_eq!(serial, 2);
        assert!(pkt.is_flush());
        assert!(q.is_empty());
    }

    #[test]
    fn abort_wakes_blocked_getter() {
        let q = Arc::new(PacketQueue::new());
        q.start();
        let _ = q.get();
        let q2 = q.clone();
        let t = std::thread::spawn(move || q2.get());
        std::thread::sleep(std::time::Duration::from_millis(20));
        q.abort();
        assert!(t.join().unwrap().is_none());
        assert!(!q.put(data_packet(0, 1, 0)));
    }

    #[test]
    fn has_enough_packets_needs_count_and_duration() {
        let tb = TimeBase::new(1, 25);
        let q = PacketQueue::new();
        q.start();
        let _ = q.get();
        for _ in 0..MIN_FRAMES {
            q.put(data_packet(0, 1, 1));
        }
        // 25 packets is not strictly more than MIN_FRAMES.
        assert!(!q.has_enough_packets(tb));
        q.put(data_packet(0, 1, 1));
        // 26 packets, 26 ticks at 1/25 s each: over a second buffered.
        assert!(q.has_enough_packets(tb));
    }

    #[test]
    fn aborted_queue_reports_enough() {
        let q = PacketQueue::new();
        assert!(q.has_enough_packets(TimeBase::new(1, 25)));
    }
}
