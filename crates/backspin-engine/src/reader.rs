// crates/backspin-engine/src/reader.rs
//
// The demuxer driver: one thread that reconciles pause state with the
// container, services seek requests, keeps the packet queues bounded, routes
// packets by stream, and detects end of stream.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use backspin_core::{Command, MediaError, Serial, TimeBase, SERIAL_DISCARD};

use crate::player::{PlayerCore, SeekRequest, StreamSlot};
use crate::traits::Demuxer;
use crate::MAX_QUEUE_SIZE;

const READER_WAIT: Duration = Duration::from_millis(10);

pub(crate) fn run_reader(core: Arc<PlayerCore>, mut demuxer: Box<dyn Demuxer>) {
    let mut last_paused = false;
    // Reverse-window bookkeeping, only meaningful while the rewind flag is up.
    let mut rewind_start_pts: i64 = 0;
    let mut rewind_end_pts: i64 = 0;

    let container_start_pts = TimeBase::MICROS.rescale(core.start_time_us, core.video_time_base);

    while !core.abort_reading.load(Ordering::Acquire) {
        // Reconcile pause with the container (matters for network protocols).
        let paused = core.is_paused();
        if paused != last_paused {
            last_paused = paused;
            if paused {
                demuxer.read_pause();
            } else {
                demuxer.read_play();
            }
        }
        if paused && (core.format_name == "rtsp" || core.url.starts_with("mmsh:")) {
            // Reading while paused would drain the server's buffer.
            std::thread::sleep(READER_WAIT);
            continue;
        }

        // ── Seek servicing ───────────────────────────────────────────────────
        let request = core.ctl.lock().unwrap().seek.take();
        if let Some(request) = request {
            match request {
                SeekRequest::Pos { target_us, .. } => {
                    let target_pts = TimeBase::MICROS.rescale(target_us, core.video_time_base);
                    if core.rewind_mode() {
                        // Seeking while rewinding restarts the reverse window
                        // at the new position.
                        core.ctl.lock().unwrap().rewind_target = target_pts;
                        rewind_end_pts = target_pts;
                        service_rewind_seek(
                            &core,
                            demuxer.as_mut(),
                            target_pts,
                            &mut rewind_start_pts,
                        );
                    } else {
                        core.ctl.lock().unwrap().sync_video_pts = Some(target_pts);
                        match demuxer.seek_time(target_us, i64::MIN, i64::MAX) {
                            Err(e) => {
                                tracing::warn!(url = %core.url, error = %e, "error while seeking");
                            }
                            Ok(()) => {
                                core.new_serial();
                                core.extclk.set(target_us as f64 / 1_000_000.0, 0);
                            }
                        }
                        drain_until_target(&core, demuxer.as_mut(), target_us);
                        finish_user_seek(&core);
                    }
                }
                SeekRequest::Bytes { target, rel } => {
                    if core.rewind_mode() {
                        // Byte positions have no order relation to the reverse
                        // window; drop the request.
                        tracing::debug!("discarding byte seek during rewind");
                    } else {
                        let min = if rel > 0 { target - rel + 2 } else { i64::MIN };
                        let max = if rel < 0 { target - rel - 2 } else { i64::MAX };
                        match demuxer.seek_bytes(target, min, max) {
                            Err(e) => {
                                tracing::warn!(url = %core.url, error = %e, "error while seeking");
                            }
                            Ok(()) => {
                                core.new_serial();
                                core.extclk.set(f64::NAN, 0);
                            }
                        }
                        drain_until_target(&core, demuxer.as_mut(), target);
                        finish_user_seek(&core);
                    }
                }
                SeekRequest::Rewind { target_pts } => {
                    rewind_end_pts = target_pts;
                    service_rewind_seek(&core, demuxer.as_mut(), target_pts, &mut rewind_start_pts);
                }
                SeekRequest::RewindContinue { target_us } => {
                    match demuxer.seek_backward_keyframe(target_us) {
                        Err(e) => {
                            tracing::warn!(url = %core.url, error = %e, "error while seeking");
                        }
                        Ok(()) => {
                            prime_until_video_packet(&core, demuxer.as_mut(), &mut rewind_start_pts);
                        }
                    }
                    let mut ctl = core.ctl.lock().unwrap();
                    ctl.queue_attachments = true;
                    ctl.eof = false;
                }
            }
        }

        // Cover-art streams queue their single picture, then EOF the decoder.
        let queue_attachments = {
            let mut ctl = core.ctl.lock().unwrap();
            std::mem::replace(&mut ctl.queue_attachments, false)
        };
        if queue_attachments {
            if let Some(video) = &core.video {
                if video.desc.attached_pic {
                    if let Some(pic) = demuxer.attached_picture(video.desc.index) {
                        video.packets.put(backspin_core::Packet::Data(pic));
                        video.packets.put_null(video.desc.index);
                    }
                }
            }
        }

        // ── Buffering gate ───────────────────────────────────────────────────
        if !core.infinite_buffer && queues_are_full(&core) {
            let ctl = core.ctl.lock().unwrap();
            let _ = core.wait.wait_timeout(ctl, READER_WAIT).unwrap();
            continue;
        }

        // ── Natural end of playback ──────────────────────────────────────────
        if !core.is_paused() && playback_drained(&core) {
            let _ = core.cmd_tx.send(Command::Quit);
            break;
        }

        // ── One packet ───────────────────────────────────────────────────────
        let pkt = match demuxer.read_packet() {
            Ok(pkt) => pkt,
            Err(MediaError::Eof) => {
                let already_eof = {
                    let mut ctl = core.ctl.lock().unwrap();
                    std::mem::replace(&mut ctl.eof, true)
                };
                if !already_eof {
                    for slot in active_slots(&core) {
                        slot.packets.put_null(slot.desc.index);
                    }
                }
                let ctl = core.ctl.lock().unwrap();
                let _ = core.wait.wait_timeout(ctl, READER_WAIT).unwrap();
                continue;
            }
            Err(MediaError::Read(msg)) => {
                tracing::warn!(url = %core.url, "transient read error: {msg}");
                let ctl = core.ctl.lock().unwrap();
                let _ = core.wait.wait_timeout(ctl, READER_WAIT).unwrap();
                continue;
            }
            Err(e) => {
                tracing::error!(url = %core.url, error = %e, "fatal read error");
                let _ = core.cmd_tx.send(Command::Quit);
                break;
            }
        };
        core.ctl.lock().unwrap().eof = false;
        if pkt.pos >= 0 {
            core.read_pos.store(pkt.pos, Ordering::Release);
        }

        // ── Play-range filter and routing ────────────────────────────────────
        let in_range = packet_in_play_range(&core, &pkt);
        let stream = pkt.stream;

        if is_stream(&core.audio, stream) && in_range {
            core.push_packet(pkt, None);
        } else if is_stream(&core.video, stream)
            && in_range
            && !core.video.as_ref().unwrap().desc.attached_pic
        {
            {
                let mut ctl = core.ctl.lock().unwrap();
                if ctl.drop_frame_mode && pkt.keyframe {
                    ctl.drop_frame_mode = false;
                }
            }

            if core.rewind_mode() && pkt.pts.unwrap_or(i64::MIN) >= rewind_end_pts {
                if rewind_start_pts <= container_start_pts {
                    // The window hit the head of the file: mark the terminal
                    // frame, drain the decoder, and park until rewind ends.
                    core.push_packet(pkt, None);
                    if let Some(video) = &core.video {
                        video.packets.put_null(video.desc.index);
                    }
                    core.ctl.lock().unwrap().rewind_eof_pts = rewind_start_pts;

                    demuxer.read_pause();
                    while core.rewind_mode() && !core.abort_reading.load(Ordering::Acquire) {
                        let ctl = core.ctl.lock().unwrap();
                        let _ = core.wait.wait_timeout(ctl, READER_WAIT).unwrap();
                    }
                    demuxer.read_play();
                    continue;
                }

                // Slide the window back: the current window start becomes the
                // next boundary, and this packet is queued as its marker.
                rewind_end_pts = rewind_start_pts;
                let pos_us = core
                    .video_time_base
                    .rescale(rewind_end_pts - 1, TimeBase::MICROS);
                core.ctl.lock().unwrap().seek = Some(SeekRequest::RewindContinue {
                    target_us: pos_us,
                });
                core.push_packet(pkt, None);
                continue;
            }

            let drop = core.ctl.lock().unwrap().drop_frame_mode;
            if !drop {
                core.push_packet(pkt, None);
            }
        } else if is_stream(&core.subtitle, stream) && in_range {
            core.push_packet(pkt, None);
        } else if is_stream(&core.data, stream) {
            core.push_packet(pkt, None);
        }
        // Anything else is simply dropped.
    }
}

fn is_stream(slot: &Option<StreamSlot>, stream: usize) -> bool {
    slot.as_ref().map(|s| s.desc.index == stream).unwrap_or(false)
}

fn active_slots(core: &PlayerCore) -> impl Iterator<Item = &StreamSlot> {
    [&core.audio, &core.video, &core.subtitle, &core.data]
        .into_iter()
        .flatten()
}

/// User-configured `[start_time, start_time + duration]` window, measured
/// against the packet's stream-relative timestamp.
fn packet_in_play_range(core: &PlayerCore, pkt: &backspin_core::PacketData) -> bool {
    let Some(duration) = core.opts.duration else {
        return true;
    };
    let Some(tb) = core.stream_time_base(pkt.stream) else {
        return true;
    };
    let stream_start = core
        .slot_for(pkt.stream)
        .and_then(|s| s.desc.start_time)
        .unwrap_or(0);
    match pkt.best_ts() {
        Some(ts) => {
            tb.to_secs(ts - stream_start) - core.opts.start_time.unwrap_or(0.0) <= duration
        }
        None => true,
    }
}

fn queues_are_full(core: &PlayerCore) -> bool {
    let total: usize = active_slots(core)
        .filter(|s| s.desc.kind != backspin_core::StreamKind::Data)
        .map(|s| s.packets.size())
        .sum();
    if total > MAX_QUEUE_SIZE {
        return true;
    }
    let enough = |slot: &Option<StreamSlot>| {
        slot.as_ref()
            .map(|s| s.desc.attached_pic || s.packets.has_enough_packets(s.desc.time_base))
            .unwrap_or(true)
    };
    enough(&core.audio) && enough(&core.video) && enough(&core.subtitle)
}

/// All decoders drained and every frame queue empty (and, while rewinding,
/// no pictures parked in the reverse window).
fn playback_drained(core: &PlayerCore) -> bool {
    let rewinding = core.rewind_mode();
    let audio_done = core
        .audio
        .as_ref()
        .map(|a| !rewinding && a.decoder_done())
        .unwrap_or(true);
    let video_done = core
        .video
        .as_ref()
        .map(|v| {
            v.decoder_done()
                && (!rewinding || core.rewind_buffered.load(Ordering::Acquire) == 0)
        })
        .unwrap_or(true);
    audio_done && video_done
}

/// After a user seek: drain packets until each active A/V stream has queued
/// one at or past the target; earlier packets go in under the discard serial
/// so decoders prime-and-drop them.
fn drain_until_target(core: &Arc<PlayerCore>, demuxer: &mut dyn Demuxer, target_us: i64) {
    let mut audio_synced = core.audio.is_none();
    let mut video_synced = core.video.is_none();

    while !(audio_synced && video_synced) && !core.abort_reading.load(Ordering::Acquire) {
        let pkt = match demuxer.read_packet() {
            Ok(pkt) => pkt,
            Err(_) => break,
        };
        let pos_us = core
            .stream_time_base(pkt.stream)
            .zip(pkt.pts)
            .map(|(tb, pts)| tb.rescale(pts, TimeBase::MICROS));

        let serial: Option<Serial> = if pos_us.unwrap_or(i64::MIN) >= target_us {
            if is_stream(&core.audio, pkt.stream) {
                audio_synced = true;
            } else if is_stream(&core.video, pkt.stream) {
                video_synced = true;
            }
            None
        } else {
            Some(SERIAL_DISCARD)
        };
        core.push_packet(pkt, serial);
    }
}

/// Shared tail of the POS/BYTES seek paths.
fn finish_user_seek(core: &PlayerCore) {
    {
        let mut ctl = core.ctl.lock().unwrap();
        ctl.queue_attachments = true;
        ctl.eof = false;
    }
    // A paused player still shows the sought-to frame: unpause for exactly
    // one picture.
    if core.is_paused() {
        core.stream_toggle_pause();
        core.ctl.lock().unwrap().stepping = true;
    }
}

/// Backward keyframe seek that opens (or restarts) the reverse window.
fn service_rewind_seek(
    core: &Arc<PlayerCore>,
    demuxer: &mut dyn Demuxer,
    target_pts: i64,
    rewind_start_pts: &mut i64,
) {
    let pos_us = core
        .video_time_base
        .rescale(target_pts - 1, TimeBase::MICROS);
    match demuxer.seek_backward_keyframe(pos_us) {
        Err(e) => {
            tracing::warn!(url = %core.url, error = %e, "error while seeking");
        }
        Ok(()) => {
            core.new_serial();
            core.rewind.store(true, Ordering::Release);
            core.ctl.lock().unwrap().rewind_eof_pts = 0;
            core.extclk.set(pos_us as f64 / 1_000_000.0, 0);
            prime_until_video_packet(core, demuxer, rewind_start_pts);
        }
    }
    let mut ctl = core.ctl.lock().unwrap();
    ctl.queue_attachments = true;
    ctl.eof = false;
}

/// Push packets until the first video packet after a backward seek; its pts
/// is where the new reverse window starts.
fn prime_until_video_packet(
    core: &Arc<PlayerCore>,
    demuxer: &mut dyn Demuxer,
    rewind_start_pts: &mut i64,
) {
    while !core.abort_reading.load(Ordering::Acquire) {
        let pkt = match demuxer.read_packet() {
            Ok(pkt) => pkt,
            Err(_) => break,
        };
        let is_video = is_stream(&core.video, pkt.stream);
        let pts = pkt.pts;
        core.push_packet(pkt, None);
        if is_video {
            if let Some(pts) = pts {
                *rewind_start_pts = pts;
            }
            break;
        }
    }
}
