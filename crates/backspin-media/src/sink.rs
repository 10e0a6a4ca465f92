// crates/backspin-media/src/sink.rs
//
// cpal audio sink adapter. The engine's contract is SDL-shaped: signed-16
// interleaved samples pulled by a device callback. cpal streams are not Send,
// so a dedicated thread owns the stream and takes pause/close commands over
// a channel.

use std::sync::mpsc;
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

use backspin_core::MediaError;
use backspin_engine::traits::{AudioCallback, AudioSink, AudioSpec};

/// Rate/channel ladder tried when the device rejects the wanted format.
const CANDIDATE_RATES: [u32; 4] = [44_100, 48_000, 96_000, 192_000];
const CANDIDATE_CHANNELS: [u16; 4] = [1, 2, 4, 6];
const MIN_BUFFER_SAMPLES: u16 = 512;
const MAX_CALLBACKS_PER_SEC: u32 = 30;

enum SinkCmd {
    Pause(bool),
    Close,
}

pub struct CpalSink {
    spec: Option<AudioSpec>,
    cmd: Option<mpsc::Sender<SinkCmd>>,
    thread: Option<JoinHandle<()>>,
}

impl CpalSink {
    pub fn new() -> Self {
        Self {
            spec: None,
            cmd: None,
            thread: None,
        }
    }
}

impl Default for CpalSink {
    fn default() -> Self {
        Self::new()
    }
}

/// Device period: the smallest power of two above `rate / 30`, at least 512
/// samples.
fn period_for(rate: u32) -> u16 {
    ((rate / MAX_CALLBACKS_PER_SEC).next_power_of_two() as u16).max(MIN_BUFFER_SAMPLES)
}

/// Pick a supported (rate, channels) pair: the wanted pair when the device
/// takes it, otherwise the first candidate-ladder combination it supports.
fn negotiate(
    supported: &[(u32, u32, u16)], // (min_rate, max_rate, channels)
    wanted_rate: u32,
    wanted_channels: u16,
) -> Option<(u32, u16)> {
    let supports = |rate: u32, channels: u16| {
        supported
            .iter()
            .any(|(min, max, ch)| *ch == channels && rate >= *min && rate <= *max)
    };
    if supports(wanted_rate, wanted_channels) {
        return Some((wanted_rate, wanted_channels));
    }
    for &rate in CANDIDATE_RATES.iter().rev() {
        if rate > wanted_rate && wanted_rate >= CANDIDATE_RATES[0] {
            continue;
        }
        for &channels in &CANDIDATE_CHANNELS {
            if supports(rate, channels) {
                return Some((rate, channels));
            }
        }
    }
    // Last resort: whatever the device offers, clamped to its range.
    supported.first().map(|(min, max, ch)| {
        let rate = wanted_rate.clamp(*min, *max);
        (rate, *ch)
    })
}

impl AudioSink for CpalSink {
    fn open(&mut self, wanted: &AudioSpec) -> Result<AudioSpec, MediaError> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| MediaError::SinkUnavailable("no default output device".into()))?;

        let ranges: Vec<(u32, u32, u16)> = device
            .supported_output_configs()
            .map_err(|e| MediaError::SinkUnavailable(e.to_string()))?
            .map(|r| (r.min_sample_rate().0, r.max_sample_rate().0, r.channels()))
            .collect();
        if ranges.is_empty() {
            return Err(MediaError::SinkUnavailable(
                "no supported output configs".into(),
            ));
        }

        let wanted_rate = if wanted.freq > 0 { wanted.freq } else { 44_100 };
        let wanted_channels = if wanted.channels > 0 {
            wanted.channels
        } else {
            2
        };
        let (freq, channels) = negotiate(&ranges, wanted_rate, wanted_channels).ok_or_else(
            || MediaError::SinkUnavailable("no usable rate/channel combination".into()),
        )?;

        let spec = AudioSpec {
            freq,
            channels,
            samples: period_for(freq),
        };
        tracing::info!(
            rate = spec.freq,
            channels = spec.channels,
            period = spec.samples,
            "audio device negotiated"
        );
        self.spec = Some(spec);
        Ok(spec)
    }

    fn start(&mut self, mut callback: AudioCallback) -> Result<(), MediaError> {
        let spec = self
            .spec
            .ok_or_else(|| MediaError::SinkUnavailable("sink not opened".into()))?;
        let (cmd_tx, cmd_rx) = mpsc::channel::<SinkCmd>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), MediaError>>();

        // The stream lives on its own thread: cpal streams are not Send.
        let thread = std::thread::spawn(move || {
            let host = cpal::default_host();
            let Some(device) = host.default_output_device() else {
                let _ = ready_tx.send(Err(MediaError::SinkUnavailable(
                    "output device disappeared".into(),
                )));
                return;
            };
            let config = cpal::StreamConfig {
                channels: spec.channels,
                sample_rate: cpal::SampleRate(spec.freq),
                buffer_size: cpal::BufferSize::Fixed(spec.samples as u32),
            };
            let mut byte_buf: Vec<u8> = Vec::new();
            let stream = device.build_output_stream(
                &config,
                move |out: &mut [i16], _info: &cpal::OutputCallbackInfo| {
                    byte_buf.resize(out.len() * 2, 0);
                    callback(&mut byte_buf);
                    for (sample, bytes) in out.iter_mut().zip(byte_buf.chunks_exact(2)) {
                        *sample = i16::from_ne_bytes([bytes[0], bytes[1]]);
                    }
                },
                |e| tracing::error!(error = %e, "audio stream error"),
                None,
            );
            let stream = match stream {
                Ok(s) => s,
                Err(e) => {
                    let _ = ready_tx.send(Err(MediaError::SinkUnavailable(e.to_string())));
                    return;
                }
            };
            // Start paused; the engine unpauses once its decode side is up.
            let _ = ready_tx.send(Ok(()));
            loop {
                match cmd_rx.recv() {
                    Ok(SinkCmd::Pause(true)) => {
                        let _ = stream.pause();
                    }
                    Ok(SinkCmd::Pause(false)) => {
                        if let Err(e) = stream.play() {
                            tracing::error!(error = %e, "cannot start audio stream");
                        }
                    }
                    Ok(SinkCmd::Close) | Err(_) => break,
                }
            }
        });

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.cmd = Some(cmd_tx);
                self.thread = Some(thread);
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(MediaError::SinkUnavailable(
                    "audio thread died during setup".into(),
                ))
            }
        }
    }

    fn pause(&mut self, paused: bool) {
        if let Some(cmd) = &self.cmd {
            let _ = cmd.send(SinkCmd::Pause(paused));
        }
    }

    fn close(&mut self) {
        if let Some(cmd) = self.cmd.take() {
            let _ = cmd.send(SinkCmd::Close);
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn period_is_a_power_of_two_above_rate_over_30() {
        assert_eq!(period_for(48_000), 2048); // 48000/30 = 1600 → 2048
        assert_eq!(period_for(44_100), 2048); // 1470 → 2048
        assert_eq!(period_for(8_000), 512); // 266 → 512 floor
    }

    #[test]
    fn negotiate_prefers_the_wanted_format() {
        let ranges = [(8_000, 192_000, 2u16), (8_000, 192_000, 6u16)];
        assert_eq!(negotiate(&ranges, 48_000, 2), Some((48_000, 2)));
    }

    #[test]
    fn negotiate_walks_the_ladder_on_mismatch() {
        // Device only does stereo at 44.1 kHz.
        let ranges = [(44_100, 44_100, 2u16)];
        assert_eq!(negotiate(&ranges, 48_000, 6), Some((44_100, 2)));
    }

    #[test]
    fn negotiate_clamps_as_a_last_resort() {
        let ranges = [(22_050, 32_000, 8u16)];
        assert_eq!(negotiate(&ranges, 48_000, 2), Some((32_000, 8)));
    }
}
