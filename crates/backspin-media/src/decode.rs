// crates/backspin-media/src/decode.rs
//
// ffmpeg codec adapters behind the engine's send/receive seam. Video frames
// are scaled to YUV420P (when they are not already) and de-strided into the
// engine's packed picture layout; audio frames cross the seam in their
// decoded format and the resampler takes it from there.

use std::sync::Arc;

use ffmpeg_the_third as ffmpeg;
use ffmpeg::codec;
use ffmpeg::codec::subtitle;
use ffmpeg::format::{sample, Pixel, Sample};
use ffmpeg::software::scaling::{context::Context as SwsContext, flag::Flags};
use ffmpeg::util::frame;

use backspin_core::{
    AudioFrame, DecodeError, FramePayload, MediaError, PacketData, PlayerOptions, SampleFormat,
    StreamDesc, SubtitleFrame, SubtitleRect, VideoPicture,
};
use backspin_engine::traits::{FrameDecoder, SubtitleDecoder};

use crate::yuv::pack_planes;

fn map_send_err(e: ffmpeg::Error) -> DecodeError {
    match e {
        ffmpeg::Error::Other { errno } if errno == ffmpeg::util::error::EAGAIN => {
            DecodeError::Again
        }
        ffmpeg::Error::Eof => DecodeError::Eof,
        other => DecodeError::Fatal(other.to_string()),
    }
}

fn build_packet(pkt: &PacketData) -> ffmpeg::Packet {
    let mut packet = ffmpeg::Packet::copy(&pkt.payload);
    packet.set_pts(pkt.pts);
    packet.set_dts(pkt.dts);
    packet.set_duration(pkt.duration);
    packet
}

fn open_context(
    stream: &StreamDesc,
    options: &PlayerOptions,
) -> Result<codec::context::Context, MediaError> {
    let forced = match stream.kind {
        backspin_core::StreamKind::Audio => options.audio_codec_name.as_deref(),
        backspin_core::StreamKind::Video => options.video_codec_name.as_deref(),
        backspin_core::StreamKind::Subtitle => options.subtitle_codec_name.as_deref(),
        _ => None,
    };
    let codec = match forced {
        Some(name) => ffmpeg::decoder::find_by_name(name)
            .ok_or_else(|| MediaError::DecoderSetup(format!("no codec named {name}")))?,
        None => ffmpeg::decoder::find(codec_id_for(stream))
            .ok_or_else(|| MediaError::DecoderSetup(format!("no decoder for {}", stream.codec)))?,
    };
    let mut ctx = codec::context::Context::new_with_codec(codec);
    apply_params(&mut ctx, stream)?;
    unsafe {
        let p = ctx.as_mut_ptr();
        (*p).thread_count = 0; // auto
        if options.fast {
            (*p).flags2 |= ffmpeg::ffi::AV_CODEC_FLAG2_FAST as i32;
        }
        if options.lowres > 0 {
            let max = (*codec.as_ptr()).max_lowres as u8;
            if options.lowres > max {
                tracing::warn!(max, "lowres clamped to the decoder maximum");
            }
            (*p).lowres = options.lowres.min(max) as i32;
        }
    }
    Ok(ctx)
}

// The engine's stream descriptors do not carry AVCodecParameters; the codec
// is re-resolved by name. This keeps ffmpeg types out of backspin-core at
// the price of a lookup here.
fn codec_id_for(stream: &StreamDesc) -> codec::Id {
    ffmpeg::decoder::find_by_name(&stream.codec)
        .map(|c| c.id())
        .unwrap_or(codec::Id::None)
}

fn apply_params(ctx: &mut codec::context::Context, stream: &StreamDesc) -> Result<(), MediaError> {
    unsafe {
        let p = ctx.as_mut_ptr();
        (*p).pkt_timebase = ffmpeg::ffi::AVRational {
            num: stream.time_base.num,
            den: stream.time_base.den,
        };
        (*p).width = stream.width as i32;
        (*p).height = stream.height as i32;
        (*p).sample_rate = stream.sample_rate as i32;
        if stream.channels > 0 {
            ffmpeg::ffi::av_channel_layout_default(&mut (*p).ch_layout, stream.channels as i32);
        }
        if !stream.extradata.is_empty() {
            // The codec frees extradata itself, so it must come from av_malloc,
            // padded per the avcodec contract.
            let size = stream.extradata.len();
            let buf = ffmpeg::ffi::av_mallocz(size + ffmpeg::ffi::AV_INPUT_BUFFER_PADDING_SIZE as usize)
                as *mut u8;
            if buf.is_null() {
                return Err(MediaError::DecoderSetup("extradata allocation failed".into()));
            }
            std::ptr::copy_nonoverlapping(stream.extradata.as_ptr(), buf, size);
            (*p).extradata = buf;
            (*p).extradata_size = size as i32;
        }
    }
    Ok(())
}

// ── Video ─────────────────────────────────────────────────────────────────────

pub struct VideoDecoder {
    decoder: ffmpeg::decoder::Video,
    scaler: Option<SwsContext>,
    scaler_input: (Pixel, u32, u32),
    /// `None`: best-effort timestamps; `Some(false)`: decode-order dts.
    reorder_pts: Option<bool>,
}

impl VideoDecoder {
    pub fn open(stream: &StreamDesc, options: &PlayerOptions) -> Result<Self, MediaError> {
        let ctx = open_context(stream, options)?;
        let decoder = ctx
            .decoder()
            .video()
            .map_err(|e| MediaError::DecoderSetup(e.to_string()))?;
        Ok(Self {
            decoder,
            scaler: None,
            scaler_input: (Pixel::None, 0, 0),
            reorder_pts: options.decoder_reorder_pts,
        })
    }

    fn to_picture(&mut self, decoded: &frame::video::Video) -> Result<VideoPicture, DecodeError> {
        let (w, h) = (decoded.width() as usize, decoded.height() as usize);
        let (uv_w, uv_h) = (w.div_ceil(2), h.div_ceil(2));

        let data = if decoded.format() == Pixel::YUV420P {
            pack_planes(decoded, w, h, uv_w, uv_h)
        } else {
            let input = (decoded.format(), decoded.width(), decoded.height());
            if self.scaler.is_none() || self.scaler_input != input {
                self.scaler = Some(
                    SwsContext::get(
                        decoded.format(),
                        decoded.width(),
                        decoded.height(),
                        Pixel::YUV420P,
                        decoded.width(),
                        decoded.height(),
                        Flags::BILINEAR,
                    )
                    .map_err(|e| DecodeError::Fatal(e.to_string()))?,
                );
                self.scaler_input = input;
            }
            let mut yuv = frame::video::Video::empty();
            self.scaler
                .as_mut()
                .unwrap()
                .run(decoded, &mut yuv)
                .map_err(|e| DecodeError::Fatal(e.to_string()))?;
            pack_planes(&yuv, w, h, uv_w, uv_h)
        };

        let sar = decoded.aspect_ratio();
        let pts = match self.reorder_pts {
            None => decoded.timestamp(),
            Some(true) => decoded.pts(),
            // Decode-order timestamps: the dts the codec saw for this frame.
            Some(false) => unsafe {
                let dts = (*decoded.as_ptr()).pkt_dts;
                if dts == ffmpeg::ffi::AV_NOPTS_VALUE {
                    None
                } else {
                    Some(dts)
                }
            },
        };
        Ok(VideoPicture {
            pts,
            width: decoded.width(),
            height: decoded.height(),
            sar: (sar.numerator(), sar.denominator()),
            data,
            pos: -1,
        })
    }
}

impl FrameDecoder for VideoDecoder {
    fn send_packet(&mut self, pkt: &PacketData) -> Result<(), DecodeError> {
        self.decoder
            .send_packet(&build_packet(pkt))
            .map_err(map_send_err)
    }

    fn send_eof(&mut self) -> Result<(), DecodeError> {
        self.decoder.send_eof().map_err(map_send_err)
    }

    fn receive_frame(&mut self) -> Result<FramePayload, DecodeError> {
        let mut decoded = frame::video::Video::empty();
        self.decoder
            .receive_frame(&mut decoded)
            .map_err(map_send_err)?;
        let picture = self.to_picture(&decoded)?;
        Ok(FramePayload::Video(Arc::new(picture)))
    }

    fn flush(&mut self) {
        self.decoder.flush();
    }
}

// ── Audio ─────────────────────────────────────────────────────────────────────

pub struct AudioDecoder {
    decoder: ffmpeg::decoder::Audio,
}

impl AudioDecoder {
    pub fn open(stream: &StreamDesc, options: &PlayerOptions) -> Result<Self, MediaError> {
        let ctx = open_context(stream, options)?;
        let decoder = ctx
            .decoder()
            .audio()
            .map_err(|e| MediaError::DecoderSetup(e.to_string()))?;
        Ok(Self { decoder })
    }
}

fn map_sample_format(sample: Sample) -> Option<SampleFormat> {
    match sample {
        Sample::I16(sample::Type::Packed) => Some(SampleFormat::S16),
        Sample::I16(sample::Type::Planar) => Some(SampleFormat::S16Planar),
        Sample::F32(sample::Type::Packed) => Some(SampleFormat::F32),
        Sample::F32(sample::Type::Planar) => Some(SampleFormat::F32Planar),
        _ => None,
    }
}

impl FrameDecoder for AudioDecoder {
    fn send_packet(&mut self, pkt: &PacketData) -> Result<(), DecodeError> {
        self.decoder
            .send_packet(&build_packet(pkt))
            .map_err(map_send_err)
    }

    fn send_eof(&mut self) -> Result<(), DecodeError> {
        self.decoder.send_eof().map_err(map_send_err)
    }

    fn receive_frame(&mut self) -> Result<FramePayload, DecodeError> {
        let mut decoded = frame::audio::Audio::empty();
        self.decoder
            .receive_frame(&mut decoded)
            .map_err(map_send_err)?;

        let format = map_sample_format(decoded.format()).ok_or_else(|| {
            DecodeError::Fatal(format!("unsupported sample format {:?}", decoded.format()))
        })?;
        let nb_samples = decoded.samples();
        let channels = decoded.channels();
        let bps = format.bytes_per_sample();
        let planes = if format.is_planar() {
            (0..channels as usize)
                .map(|i| decoded.data(i)[..nb_samples * bps].to_vec())
                .collect()
        } else {
            vec![decoded.data(0)[..nb_samples * channels as usize * bps].to_vec()]
        };

        Ok(FramePayload::Audio(AudioFrame {
            pts: decoded.pts(),
            sample_rate: decoded.rate(),
            channels,
            format,
            nb_samples,
            planes,
            pos: -1,
        }))
    }

    fn flush(&mut self) {
        self.decoder.flush();
    }
}

// ── Subtitles ─────────────────────────────────────────────────────────────────

pub struct FfmpegSubtitleDecoder {
    decoder: ffmpeg::decoder::subtitle::Subtitle,
}

impl FfmpegSubtitleDecoder {
    pub fn open(stream: &StreamDesc, options: &PlayerOptions) -> Result<Self, MediaError> {
        let ctx = open_context(stream, options)?;
        let decoder = ctx
            .decoder()
            .subtitle()
            .map_err(|e| MediaError::DecoderSetup(e.to_string()))?;
        Ok(Self { decoder })
    }
}

impl SubtitleDecoder for FfmpegSubtitleDecoder {
    fn decode(&mut self, pkt: &PacketData) -> Result<Option<SubtitleFrame>, DecodeError> {
        let packet = build_packet(pkt);
        let mut sub = subtitle::Subtitle::new();
        let got = self
            .decoder
            .decode(&packet, &mut sub)
            .map_err(map_send_err)?;
        if !got {
            return Ok(None);
        }

        let rects = sub
            .rects()
            .filter_map(|rect| match rect {
                subtitle::Rect::Bitmap(b) => Some(SubtitleRect {
                    x: b.x() as u32,
                    y: b.y() as u32,
                    w: b.width() as u32,
                    h: b.height() as u32,
                    text: None,
                }),
                subtitle::Rect::Text(t) => Some(SubtitleRect {
                    x: 0,
                    y: 0,
                    w: 0,
                    h: 0,
                    text: Some(t.get().to_string()),
                }),
                subtitle::Rect::Ass(a) => Some(SubtitleRect {
                    x: 0,
                    y: 0,
                    w: 0,
                    h: 0,
                    text: Some(a.get().to_string()),
                }),
                _ => None,
            })
            .collect();

        Ok(Some(SubtitleFrame {
            pts: sub.pts(),
            start_display_ms: sub.start(),
            end_display_ms: sub.end(),
            rects,
        }))
    }

    fn flush(&mut self) {
        unsafe {
            ffmpeg::ffi::avcodec_flush_buffers(self.decoder.as_mut_ptr());
        }
    }
}
