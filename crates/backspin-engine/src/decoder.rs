// crates/backspin-engine/src/decoder.rs
//
// Per-stream decode pump: pulls serial-tagged packets, drives the codec's
// send/receive cycle, and hands decoded frames to the worker loop.
//
// Serial discipline: packets whose serial differs from the stream's
// authoritative one are dropped unread, except the discard serial, which is
// decoded to prime the codec after a seek (the worker throws the frame away).

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use backspin_core::{
    DecodeError, FramePayload, Packet, PacketData, Serial, TimeBase, SERIAL_DISCARD,
};

use crate::traits::{FrameDecoder, SubtitleDecoder};

pub(crate) enum DecodeOutcome {
    Frame(FramePayload),
    /// The codec finished draining the current serial; no frame, no error.
    Drained,
    /// The packet queue was aborted.
    Aborted,
    Failed(String),
}

pub(crate) struct DecodePump {
    codec: Box<dyn FrameDecoder>,
    queue_serial: Arc<AtomicI32>,
    /// Serial the decoder had fully drained, observed by the reader's EOF check.
    finished: Arc<AtomicI32>,
    pending: Option<PacketData>,
    pkt_serial: Serial,
    pkt_time_base: TimeBase,
    start_pts: Option<i64>,
    start_pts_tb: TimeBase,
    next_pts: Option<i64>,
    next_pts_tb: TimeBase,
}

impl DecodePump {
    pub fn new(
        codec: Box<dyn FrameDecoder>,
        queue_serial: Arc<AtomicI32>,
        finished: Arc<AtomicI32>,
        pkt_time_base: TimeBase,
    ) -> Self {
        Self {
            codec,
            queue_serial,
            finished,
            pending: None,
            pkt_serial: -1,
            pkt_time_base,
            start_pts: None,
            start_pts_tb: pkt_time_base,
            next_pts: None,
            next_pts_tb: pkt_time_base,
        }
    }

    /// Containers without reliable seeking anchor the first fabricated pts here.
    pub fn set_start_pts(&mut self, pts: i64, tb: TimeBase) {
        self.start_pts = Some(pts);
        self.start_pts_tb = tb;
    }

    pub fn pkt_serial(&self) -> Serial {
        self.pkt_serial
    }

    /// One decode step. `fetch` blocks on the packet queue and returns `None`
    /// when it is aborted.
    pub fn decode_frame(
        &mut self,
        fetch: &mut dyn FnMut() -> Option<(Serial, Packet)>,
    ) -> DecodeOutcome {
        loop {
            // Drain the codec while our packet serial is current.
            let authoritative = self.queue_serial.load(Ordering::Acquire);
            if self.pkt_serial == authoritative || self.pkt_serial == SERIAL_DISCARD {
                loop {
                    match self.codec.receive_frame() {
                        Ok(mut payload) => {
                            if let FramePayload::Audio(af) = &mut payload {
                                self.rewrite_audio_pts(af);
                            }
                            return DecodeOutcome::Frame(payload);
                        }
                        Err(DecodeError::Again) => break,
                        Err(DecodeError::Eof) => {
                            self.finished.store(self.pkt_serial, Ordering::Release);
                            self.codec.flush();
                            return DecodeOutcome::Drained;
                        }
                        Err(DecodeError::Fatal(msg)) => return DecodeOutcome::Failed(msg),
                    }
                }
            }

            // Fetch the next current-serial packet.
            let (serial, pkt) = loop {
                let entry = match self.pending.take() {
                    Some(pkt) => (self.pkt_serial, Packet::Data(pkt)),
                    None => match fetch() {
                        Some(entry) => entry,
                        None => return DecodeOutcome::Aborted,
                    },
                };
                let authoritative = self.queue_serial.load(Ordering::Acquire);
                if entry.0 == authoritative || entry.0 == SERIAL_DISCARD {
                    break entry;
                }
                tracing::trace!(serial = entry.0, authoritative, "dropping stale packet");
            };
            self.pkt_serial = serial;

            match pkt {
                Packet::Flush => {
                    self.codec.flush();
                    self.finished.store(0, Ordering::Release);
                    self.next_pts = self.start_pts;
                    self.next_pts_tb = self.start_pts_tb;
                }
                Packet::Null { .. } => {
                    if let Err(DecodeError::Fatal(msg)) = self.codec.send_eof() {
                        return DecodeOutcome::Failed(msg);
                    }
                }
                Packet::Data(data) => match self.codec.send_packet(&data) {
                    Ok(()) => {}
                    Err(DecodeError::Again) => {
                        // Receive and send both starving is a codec API
                        // violation; stash and retry after the next receive.
                        tracing::error!("codec returned Again on both send and receive");
                        self.pending = Some(data);
                    }
                    Err(DecodeError::Eof) => {}
                    Err(DecodeError::Fatal(msg)) => return DecodeOutcome::Failed(msg),
                },
            }
        }
    }

    /// Audio frames leave the codec with pts in the packet timebase; rewrite
    /// into the frame's own 1/sample_rate base, fabricating from a running
    /// counter when the codec provides none.
    fn rewrite_audio_pts(&mut self, af: &mut backspin_core::AudioFrame) {
        let tb = TimeBase::new(1, af.sample_rate as i32);
        af.pts = match af.pts {
            Some(pts) => Some(self.pkt_time_base.rescale(pts, tb)),
            None => self.next_pts.map(|np| self.next_pts_tb.rescale(np, tb)),
        };
        if let Some(pts) = af.pts {
            self.next_pts = Some(pts + af.nb_samples as i64);
            self.next_pts_tb = tb;
        }
    }
}

/// Subtitle streams use the codec's single-shot decode instead of
/// send/receive; same serial discipline.
pub(crate) struct SubtitlePump {
    codec: Box<dyn SubtitleDecoder>,
    queue_serial: Arc<AtomicI32>,
    finished: Arc<AtomicI32>,
    pkt_serial: Serial,
}

impl SubtitlePump {
    pub fn new(
        codec: Box<dyn SubtitleDecoder>,
        queue_serial: Arc<AtomicI32>,
        finished: Arc<AtomicI32>,
    ) -> Self {
        Self {
            codec,
            queue_serial,
            finished,
            pkt_serial: -1,
        }
    }

    pub fn pkt_serial(&self) -> Serial {
        self.pkt_serial
    }

    /// Decode until a subtitle comes out or the queue aborts.
    pub fn decode(
        &mut self,
        fetch: &mut dyn FnMut() -> Option<(Serial, Packet)>,
    ) -> Option<backspin_core::SubtitleFrame> {
        loop {
            let (serial, pkt) = loop {
                let entry = fetch()?;
                let authoritative = self.queue_serial.load(Ordering::Acquire);
                if entry.0 == authoritative || entry.0 == SERIAL_DISCARD {
                    break entry;
                }
            };
            self.pkt_serial = serial;

            match pkt {
                Packet::Flush => {
                    self.codec.flush();
                    self.finished.store(0, Ordering::Release);
                }
                Packet::Null { .. } => {
                    self.finished.store(serial, Ordering::Release);
                }
                Packet::Data(data) => match self.codec.decode(&data) {
                    Ok(Some(sub)) => return Some(sub),
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "subtitle decode failed");
                    }
                },
            }
        }
    }
}
