// crates/backspin-engine/src/audio.rs
//
// Pull path: the audio device asks for N bytes, the renderer decodes frames
// off the sample queue, resamples to the negotiated format, applies volume,
// and advances the audio clock from the amount of data actually buffered.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use backspin_core::{AudioParams, FramePayload, SampleFormat, Serial, SyncMaster};

use crate::clock::wall_time;
use crate::frame_queue::FrameQueue;
use crate::packet_queue::PacketQueue;
use crate::player::PlayerCore;
use crate::traits::{AudioSpec, MediaBackend, Resampler};
use crate::{
    AUDIO_DIFF_AVG_NB, AV_NOSYNC_THRESHOLD, SAMPLE_CORRECTION_PERCENT_MAX, VOLUME_MAX,
    VOLUME_STEP_DB,
};

/// Smallest silence block handed to the device when decode fails, bytes.
const AUDIO_MIN_BUFFER_SIZE: usize = 512;

/// Exponential A-V difference estimator. Kept separate from the renderer so
/// the correction law is testable without a device or a core.
pub(crate) struct DriftState {
    cum: f64,
    avg_coef: f64,
    avg_count: u32,
    /// Corrections below this are noise from the device FIFO, seconds.
    threshold: f64,
}

impl DriftState {
    pub fn new(threshold: f64) -> Self {
        Self {
            cum: 0.0,
            // Weight such that the oldest of AUDIO_DIFF_AVG_NB samples
            // contributes one percent.
            avg_coef: 0.01f64.powf(1.0 / AUDIO_DIFF_AVG_NB as f64),
            avg_count: 0,
            threshold,
        }
    }

    /// Fold in one measured diff. Returns the corrected sample count,
    /// clamped to ±10 % of `nb_samples`, or `None` while no correction is
    /// warranted (estimator warming up, or the average below threshold).
    pub fn correct(&mut self, nb_samples: usize, diff: f64, freq: u32) -> Option<usize> {
        if diff.is_nan() || diff.abs() >= AV_NOSYNC_THRESHOLD {
            // Likely initial pts garbage; restart the estimator.
            self.cum = 0.0;
            self.avg_count = 0;
            return None;
        }
        self.cum = diff + self.avg_coef * self.cum;
        if self.avg_count < AUDIO_DIFF_AVG_NB {
            self.avg_count += 1;
            return None;
        }
        let avg_diff = self.cum * (1.0 - self.avg_coef);
        if avg_diff.abs() < self.threshold {
            return None;
        }
        let wanted = nb_samples as i64 + (diff * freq as f64) as i64;
        let min = nb_samples as i64 * (100 - SAMPLE_CORRECTION_PERCENT_MAX) as i64 / 100;
        let max = nb_samples as i64 * (100 + SAMPLE_CORRECTION_PERCENT_MAX) as i64 / 100;
        Some(wanted.clamp(min, max) as usize)
    }
}

pub(crate) struct AudioRenderer {
    core: Arc<PlayerCore>,
    frames: Arc<FrameQueue>,
    packets: Arc<PacketQueue>,
    tgt: AudioParams,
    src: AudioParams,
    hw_buf_size: usize,
    resampler: Option<Box<dyn Resampler>>,
    buf: Vec<u8>,
    buf_index: usize,
    /// Current buffer is silence (decode failed or paused); never mixed.
    silent: bool,
    /// End-of-buffer pts of the last decoded frame, seconds.
    audio_clock: f64,
    audio_clock_serial: Serial,
    drift: DriftState,
}

impl AudioRenderer {
    pub fn new(core: Arc<PlayerCore>, spec: AudioSpec) -> Self {
        let audio = core.audio.as_ref().expect("audio stream open");
        let frames = audio.frames.as_ref().unwrap().clone();
        let packets = audio.packets.clone();
        let tgt = AudioParams {
            freq: spec.freq,
            channels: spec.channels,
            format: SampleFormat::S16,
        };
        let hw_buf_size = spec.buffer_bytes();
        let threshold = hw_buf_size as f64 / tgt.bytes_per_sec() as f64;
        Self {
            core,
            frames,
            packets,
            tgt,
            src: tgt,
            hw_buf_size,
            resampler: None,
            buf: Vec::new(),
            buf_index: 0,
            silent: true,
            audio_clock: f64::NAN,
            audio_clock_serial: -1,
            drift: DriftState::new(threshold),
        }
    }

    /// Device callback body.
    pub fn fill(&mut self, out: &mut [u8]) {
        let callback_time = wall_time();
        let mut offset = 0;

        while offset < out.len() {
            if self.buf_index >= self.buf.len() {
                match self.decode_frame() {
                    Some(size) => {
                        self.buf.truncate(size);
                        self.silent = false;
                    }
                    None => {
                        // Error or starvation: a short block of silence keeps
                        // the device fed without running the clock forward.
                        let size = (AUDIO_MIN_BUFFER_SIZE / self.tgt.frame_size()).max(1)
                            * self.tgt.frame_size();
                        self.buf.clear();
                        self.buf.resize(size, 0);
                        self.silent = true;
                    }
                }
                self.buf_index = 0;
            }

            let len = (self.buf.len() - self.buf_index).min(out.len() - offset);
            let volume = self.core.volume.load(Ordering::Acquire);
            let muted = self.core.muted.load(Ordering::Acquire);
            let dst = &mut out[offset..offset + len];
            if self.silent || muted || volume <= 0 {
                dst.fill(0);
            } else if volume >= VOLUME_MAX {
                dst.copy_from_slice(&self.buf[self.buf_index..self.buf_index + len]);
            } else {
                mix_s16(dst, &self.buf[self.buf_index..self.buf_index + len], volume);
            }
            offset += len;
            self.buf_index += len;
        }

        // Assume the device holds two full periods beyond what we just wrote.
        let write_buf_size = self.buf.len() - self.buf_index;
        if !self.audio_clock.is_nan() && self.core.speed() > 0.0 {
            let latency =
                (2 * self.hw_buf_size + write_buf_size) as f64 / self.tgt.bytes_per_sec() as f64;
            self.core.audclk.set_at(
                self.audio_clock - latency,
                self.audio_clock_serial,
                callback_time,
            );
            self.core.extclk.sync_to_default(&self.core.audclk);
        }
    }

    /// Decode one frame off the sample queue into `self.buf`, resampling as
    /// needed. Returns the byte size, or `None` to silence this segment.
    fn decode_frame(&mut self) -> Option<usize> {
        if self.core.is_paused() || self.core.speed() < 0.0 {
            return None;
        }

        let frame = loop {
            let f = self.frames.peek_readable()?;
            self.frames.next();
            if f.serial == self.packets.serial() {
                break f;
            }
        };
        let FramePayload::Audio(af) = &*frame.payload else {
            return None;
        };

        let wanted_nb_samples = self.synchronize_audio(af.nb_samples);

        let src_params = af.params();
        if src_params != self.src
            || (wanted_nb_samples != af.nb_samples && self.resampler.is_none())
        {
            self.resampler = None;
            match self.core.backend.new_resampler(&src_params, &self.tgt) {
                Ok(rs) => self.resampler = Some(rs),
                Err(e) => {
                    tracing::error!(error = %e, "cannot create sample rate converter");
                    return None;
                }
            }
            self.src = src_params;
        }

        let size = if let Some(resampler) = &mut self.resampler {
            if wanted_nb_samples != af.nb_samples {
                let delta = (wanted_nb_samples as i64 - af.nb_samples as i64)
                    * self.tgt.freq as i64
                    / af.sample_rate as i64;
                let window =
                    wanted_nb_samples as i64 * self.tgt.freq as i64 / af.sample_rate as i64;
                if let Err(e) = resampler.set_compensation(delta as i32, window as i32) {
                    tracing::error!(error = %e, "set_compensation failed");
                    return None;
                }
            }
            match resampler.convert(af, &mut self.buf) {
                Ok(samples) => samples * self.tgt.frame_size(),
                Err(e) => {
                    tracing::warn!(error = %e, "resample failed, dropping frame");
                    return None;
                }
            }
        } else {
            // Formats already match: straight copy of the interleaved plane.
            self.buf.clear();
            self.buf.extend_from_slice(&af.planes[0]);
            af.data_size()
        };

        self.audio_clock = if frame.pts.is_nan() {
            f64::NAN
        } else {
            frame.pts + af.nb_samples as f64 / af.sample_rate as f64
        };
        self.audio_clock_serial = frame.serial;
        Some(size)
    }

    /// Wanted output sample count for one frame: scaled for fast playback,
    /// or drift-corrected when audio is not the master. The two adjustments
    /// are independent — a firing drift correction is relative to the raw
    /// frame size and supersedes the speed scaling.
    fn synchronize_audio(&mut self, nb_samples: usize) -> usize {
        let speed = self.core.speed();
        let mut wanted = nb_samples;
        if speed > 0.0 && speed != 1.0 {
            wanted = (nb_samples as f64 / speed) as usize;
        }
        if self.core.master_sync_type() != SyncMaster::Audio {
            let diff = self.core.audclk.get() - self.core.master_clock();
            if let Some(corrected) = self.drift.correct(nb_samples, diff, self.src.freq) {
                wanted = corrected;
            }
        }
        wanted
    }
}

/// One 0.75 dB step up or down on the logarithmic volume scale, with a ±1
/// nudge so repeated steps never get stuck on a rounding plateau.
pub(crate) fn step_volume(volume: i32, sign: i32) -> i32 {
    let level = if volume > 0 {
        20.0 * (volume as f64 / VOLUME_MAX as f64).log10()
    } else {
        -1000.0
    };
    let stepped =
        (VOLUME_MAX as f64 * 10f64.powf((level + sign as f64 * VOLUME_STEP_DB) / 20.0)).round()
            as i32;
    let new = if stepped == volume {
        volume + sign
    } else {
        stepped
    };
    new.clamp(0, VOLUME_MAX)
}

/// Write `src` into `dst` scaled by `volume` (0..=VOLUME_MAX), saturating.
pub(crate) fn mix_s16(dst: &mut [u8], src: &[u8], volume: i32) {
    for (d, s) in dst.chunks_exact_mut(2).zip(src.chunks_exact(2)) {
        let sample = i16::from_ne_bytes([s[0], s[1]]) as i32;
        let scaled = (sample * volume / VOLUME_MAX as i32).clamp(i16::MIN as i32, i16::MAX as i32);
        d.copy_from_slice(&(scaled as i16).to_ne_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_steps_round_trip() {
        let start = 64;
        let mut v = start;
        for _ in 0..10 {
            v = step_volume(v, 1);
        }
        assert!(v > start);
        for _ in 0..10 {
            v = step_volume(v, -1);
        }
        assert!((v - start).abs() <= 1, "ended at {v}, started at {start}");
    }

    #[test]
    fn volume_step_is_roughly_three_quarters_db() {
        let v = step_volume(VOLUME_MAX, -1);
        let db = 20.0 * (v as f64 / VOLUME_MAX as f64).log10();
        assert!((db + VOLUME_STEP_DB).abs() < 0.1, "one step down was {db} dB");
    }

    #[test]
    fn volume_clamps_at_bounds() {
        assert_eq!(step_volume(VOLUME_MAX, 1), VOLUME_MAX);
        assert_eq!(step_volume(0, -1), 0);
        // From zero a step up must leave zero.
        assert!(step_volume(0, 1) > 0);
    }

    #[test]
    fn mix_at_half_volume_halves_samples() {
        let src = 1000i16.to_ne_bytes();
        let mut dst = [0u8; 2];
        mix_s16(&mut dst, &src, VOLUME_MAX / 2);
        assert_eq!(i16::from_ne_bytes(dst), 500);
    }

    #[test]
    fn mix_saturates() {
        let src = i16::MAX.to_ne_bytes();
        let mut dst = [0u8; 2];
        mix_s16(&mut dst, &src, VOLUME_MAX);
        assert_eq!(i16::from_ne_bytes(dst), i16::MAX);
    }

    #[test]
    fn drift_correction_is_clamped_to_ten_percent() {
        let mut drift = DriftState::new(0.01);
        // Saturate the averaging window with a large steady diff.
        let mut wanted = None;
        for _ in 0..=AUDIO_DIFF_AVG_NB {
            wanted = drift.correct(1000, 0.5, 48_000);
        }
        assert_eq!(wanted, Some(1100)); // +10 % cap, not +24000 samples
        for _ in 0..=AUDIO_DIFF_AVG_NB {
            wanted = drift.correct(1000, -0.5, 48_000);
        }
        assert_eq!(wanted, Some(900));
    }

    #[test]
    fn drift_estimator_resets_on_huge_diffs() {
        let mut drift = DriftState::new(0.01);
        for _ in 0..=AUDIO_DIFF_AVG_NB {
            drift.correct(1000, 0.5, 48_000);
        }
        // A beyond-threshold diff means pts garbage: no correction, restart.
        assert_eq!(drift.correct(1000, AV_NOSYNC_THRESHOLD + 1.0, 48_000), None);
        assert_eq!(drift.correct(1000, 0.5, 48_000), None); // warming up again
    }

    #[test]
    fn small_diffs_below_threshold_never_correct() {
        let mut drift = DriftState::new(1.0);
        for _ in 0..=AUDIO_DIFF_AVG_NB * 2 {
            assert_eq!(drift.correct(1000, 0.001, 48_000), None);
        }
    }
}
