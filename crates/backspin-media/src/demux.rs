// crates/backspin-media/src/demux.rs
//
// ffmpeg demuxer adapter: open + probe, the packet pump, and the three seek
// flavors. Drops to the ffi where the safe wrapper ends (interrupt callback,
// byte/keyframe seeks, attached pictures).

use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};

use ffmpeg_the_third as ffmpeg;
use ffmpeg::ffi;
use ffmpeg::format::input;
use ffmpeg::media::Type;

use backspin_core::{Chapter, MediaError, PacketData, PlayerOptions, StreamDesc, StreamKind, TimeBase};
use backspin_engine::traits::Demuxer;

pub struct FfmpegDemuxer {
    ictx: ffmpeg::format::context::Input,
    streams: Vec<StreamDesc>,
    chapters: Vec<Chapter>,
    format_name: String,
    url: String,
    // Kept alive for the ffi interrupt callback's opaque pointer.
    interrupt: Option<Arc<AtomicBool>>,
}

unsafe extern "C" fn interrupt_cb(opaque: *mut c_void) -> i32 {
    if opaque.is_null() {
        return 0;
    }
    let flag = &*(opaque as *const AtomicBool);
    flag.load(Ordering::Acquire) as i32
}

fn media_kind(medium: Type) -> Option<StreamKind> {
    match medium {
        Type::Audio => Some(StreamKind::Audio),
        Type::Video => Some(StreamKind::Video),
        Type::Subtitle => Some(StreamKind::Subtitle),
        Type::Data => Some(StreamKind::Data),
        _ => None,
    }
}

impl FfmpegDemuxer {
    pub fn open(url: &str, options: &PlayerOptions) -> Result<Self> {
        if let Some(fmt) = &options.input_format {
            // Probing handles every format this adapter plays; the hint only
            // matters for headerless inputs, which it does not support.
            tracing::debug!(format = %fmt, "input format hint ignored, relying on probing");
        }
        let mut ictx = input(url).map_err(|e| anyhow!("{e}"))?;
        if options.genpts {
            unsafe {
                (*ictx.as_mut_ptr()).flags |= ffi::AVFMT_FLAG_GENPTS;
            }
        }

        let mut streams = Vec::new();
        for stream in ictx.streams() {
            let params = stream.parameters();
            let Some(kind) = media_kind(params.medium()) else {
                continue;
            };
            let tb = stream.time_base();
            let (width, height, sar, sample_rate, channels, codec, extradata) = unsafe {
                let p = params.as_ptr();
                let extradata = if (*p).extradata.is_null() || (*p).extradata_size <= 0 {
                    Vec::new()
                } else {
                    std::slice::from_raw_parts((*p).extradata, (*p).extradata_size as usize)
                        .to_vec()
                };
                (
                    (*p).width.max(0) as u32,
                    (*p).height.max(0) as u32,
                    ((*p).sample_aspect_ratio.num, (*p).sample_aspect_ratio.den),
                    (*p).sample_rate.max(0) as u32,
                    (*p).ch_layout.nb_channels.max(0) as u16,
                    format!("{:?}", params.id()).to_lowercase(),
                    extradata,
                )
            };
            let rational = |r: ffmpeg::Rational| {
                if r.numerator() != 0 && r.denominator() != 0 {
                    Some((r.numerator(), r.denominator()))
                } else {
                    None
                }
            };
            let nopts = |v: i64| {
                if v == ffi::AV_NOPTS_VALUE {
                    None
                } else {
                    Some(v)
                }
            };
            streams.push(StreamDesc {
                index: stream.index(),
                kind,
                time_base: TimeBase::new(tb.numerator(), tb.denominator()),
                start_time: nopts(stream.start_time()),
                duration: nopts(stream.duration()),
                codec,
                extradata,
                avg_frame_rate: rational(stream.avg_frame_rate()),
                real_frame_rate: rational(stream.rate()),
                width,
                height,
                sar,
                sample_rate,
                channels,
                attached_pic: stream
                    .disposition()
                    .contains(ffmpeg::format::stream::Disposition::ATTACHED_PIC),
            });
        }

        let chapters = ictx
            .chapters()
            .map(|ch| {
                let tb = ch.time_base();
                Chapter {
                    start: ch.start(),
                    end: ch.end(),
                    time_base: TimeBase::new(tb.numerator(), tb.denominator()),
                }
            })
            .collect();

        let format_name = ictx.format().name().to_string();

        Ok(Self {
            ictx,
            streams,
            chapters,
            format_name,
            url: url.to_string(),
            interrupt: None,
        })
    }

    fn fmt_flags(&self) -> i32 {
        unsafe {
            let ctx = self.ictx.as_ptr();
            let iformat = (*ctx).iformat;
            if iformat.is_null() {
                0
            } else {
                (*iformat).flags
            }
        }
    }
}

impl Demuxer for FfmpegDemuxer {
    fn streams(&self) -> &[StreamDesc] {
        &self.streams
    }

    fn chapters(&self) -> &[Chapter] {
        &self.chapters
    }

    fn duration(&self) -> Option<i64> {
        let d = self.ictx.duration();
        if d == ffi::AV_NOPTS_VALUE || d <= 0 {
            None
        } else {
            Some(d)
        }
    }

    fn start_time(&self) -> Option<i64> {
        let st = unsafe { (*self.ictx.as_ptr()).start_time };
        if st == ffi::AV_NOPTS_VALUE {
            None
        } else {
            Some(st)
        }
    }

    fn bit_rate(&self) -> i64 {
        unsafe { (*self.ictx.as_ptr()).bit_rate }
    }

    fn format_name(&self) -> &str {
        &self.format_name
    }

    fn is_realtime(&self) -> bool {
        matches!(self.format_name.as_str(), "rtp" | "rtsp" | "sdp")
            || self.url.starts_with("rtp:")
            || self.url.starts_with("udp:")
    }

    fn ts_discontinuous(&self) -> bool {
        self.fmt_flags() & ffi::AVFMT_TS_DISCONT != 0
    }

    fn seekable(&self) -> bool {
        self.fmt_flags() & (ffi::AVFMT_NOBINSEARCH | ffi::AVFMT_NOGENSEARCH | ffi::AVFMT_NO_BYTE_SEEK)
            == 0
    }

    fn info_string(&self) -> String {
        let mut info = format!("Input, {}, from '{}'\n", self.format_name, self.url);
        if let Some(d) = Demuxer::duration(self) {
            info.push_str(&format!("  Duration: {:.2} s", d as f64 / 1_000_000.0));
        } else {
            info.push_str("  Duration: N/A");
        }
        let bit_rate = self.bit_rate();
        if bit_rate > 0 {
            info.push_str(&format!(", bitrate: {} kb/s\n", bit_rate / 1000));
        } else {
            info.push_str(", bitrate: N/A\n");
        }
        for s in &self.streams {
            match s.kind {
                StreamKind::Video => info.push_str(&format!(
                    "    Stream #{}: video, {}, {}x{}\n",
                    s.index, s.codec, s.width, s.height
                )),
                StreamKind::Audio => info.push_str(&format!(
                    "    Stream #{}: audio, {}, {} Hz, {} ch\n",
                    s.index, s.codec, s.sample_rate, s.channels
                )),
                StreamKind::Subtitle => {
                    info.push_str(&format!("    Stream #{}: subtitle, {}\n", s.index, s.codec))
                }
                StreamKind::Data => {
                    info.push_str(&format!("    Stream #{}: data\n", s.index))
                }
            }
        }
        info
    }

    fn find_best_stream(
        &self,
        kind: StreamKind,
        wanted: Option<&str>,
        _related: Option<usize>,
    ) -> Option<usize> {
        // Explicit index specifier wins when it names a stream of this kind.
        if let Some(spec) = wanted {
            if let Ok(idx) = spec.parse::<usize>() {
                if self
                    .streams
                    .iter()
                    .any(|s| s.index == idx && s.kind == kind)
                {
                    return Some(idx);
                }
                tracing::warn!(spec, ?kind, "stream specifier does not match any stream");
            }
        }
        // Otherwise the first properly-parameterized stream of the kind,
        // preferring real video over attached cover art.
        let candidates = self.streams.iter().filter(|s| s.kind == kind);
        match kind {
            StreamKind::Video => self
                .streams
                .iter()
                .find(|s| s.kind == kind && !s.attached_pic && s.width > 0)
                .or_else(|| self.streams.iter().find(|s| s.kind == kind))
                .map(|s| s.index),
            StreamKind::Audio => self
                .streams
                .iter()
                .find(|s| s.kind == kind && s.sample_rate > 0)
                .map(|s| s.index),
            _ => candidates.map(|s| s.index).next(),
        }
    }

    fn read_packet(&mut self) -> Result<PacketData, MediaError> {
        match self.ictx.packets().next() {
            Some(Ok((stream, packet))) => {
                let payload = packet.data().map(|d| d.to_vec()).unwrap_or_default();
                Ok(PacketData {
                    stream: stream.index(),
                    pts: packet.pts(),
                    dts: packet.dts(),
                    duration: packet.duration(),
                    pos: packet.position() as i64,
                    keyframe: packet.is_key(),
                    payload,
                })
            }
            Some(Err(ffmpeg::Error::Eof)) | None => Err(MediaError::Eof),
            Some(Err(e)) => Err(MediaError::Read(e.to_string())),
        }
    }

    fn seek_time(&mut self, target_us: i64, min_us: i64, max_us: i64) -> Result<(), MediaError> {
        self.ictx
            .seek(target_us, min_us..=max_us)
            .map_err(|e| MediaError::Seek(e.to_string()))
    }

    fn seek_bytes(&mut self, target: i64, min: i64, max: i64) -> Result<(), MediaError> {
        let ret = unsafe {
            ffi::avformat_seek_file(
                self.ictx.as_mut_ptr(),
                -1,
                min,
                target,
                max,
                ffi::AVSEEK_FLAG_BYTE,
            )
        };
        if ret < 0 {
            Err(MediaError::Seek(format!("byte seek failed ({ret})")))
        } else {
            Ok(())
        }
    }

    fn seek_backward_keyframe(&mut self, target_us: i64) -> Result<(), MediaError> {
        let ret = unsafe {
            ffi::av_seek_frame(
                self.ictx.as_mut_ptr(),
                -1,
                target_us,
                ffi::AVSEEK_FLAG_FRAME | ffi::AVSEEK_FLAG_BACKWARD,
            )
        };
        if ret < 0 {
            Err(MediaError::Seek(format!("backward seek failed ({ret})")))
        } else {
            Ok(())
        }
    }

    fn read_pause(&mut self) {
        unsafe {
            ffi::av_read_pause(self.ictx.as_mut_ptr());
        }
    }

    fn read_play(&mut self) {
        unsafe {
            ffi::av_read_play(self.ictx.as_mut_ptr());
        }
    }

    fn set_interrupt(&mut self, flag: Arc<AtomicBool>) {
        self.interrupt = Some(flag);
        let opaque = Arc::as_ptr(self.interrupt.as_ref().unwrap()) as *mut c_void;
        unsafe {
            let ctx = self.ictx.as_mut_ptr();
            (*ctx).interrupt_callback.callback = Some(interrupt_cb);
            (*ctx).interrupt_callback.opaque = opaque;
        }
    }

    fn attached_picture(&self, stream: usize) -> Option<PacketData> {
        unsafe {
            let ctx = self.ictx.as_ptr();
            if stream >= (*ctx).nb_streams as usize {
                return None;
            }
            let st = *(*ctx).streams.add(stream);
            let pkt = &(*st).attached_pic;
            if pkt.data.is_null() || pkt.size <= 0 {
                return None;
            }
            let payload = std::slice::from_raw_parts(pkt.data, pkt.size as usize).to_vec();
            Some(PacketData {
                stream,
                pts: if pkt.pts == ffi::AV_NOPTS_VALUE {
                    None
                } else {
                    Some(pkt.pts)
                },
                dts: None,
                duration: pkt.duration,
                pos: -1,
                keyframe: true,
                payload,
            })
        }
    }
}
