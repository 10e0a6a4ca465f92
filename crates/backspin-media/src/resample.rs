// crates/backspin-media/src/resample.rs
//
// swresample adapter. The safe wrapper covers allocation; conversion and
// playout compensation go through the ffi because the engine works on raw
// interleaved byte buffers, not ffmpeg frames.

use ffmpeg_the_third as ffmpeg;
use ffmpeg::ffi;
use ffmpeg::format::{sample, Sample};
use ffmpeg::software::resampling::context::Context as SwrContext;
use ffmpeg::ChannelLayout;

use backspin_core::{AudioFrame, AudioParams, MediaError, SampleFormat};
use backspin_engine::traits::Resampler;

fn to_ffmpeg_sample(fmt: SampleFormat) -> Sample {
    match fmt {
        SampleFormat::S16 => Sample::I16(sample::Type::Packed),
        SampleFormat::S16Planar => Sample::I16(sample::Type::Planar),
        SampleFormat::F32 => Sample::F32(sample::Type::Packed),
        SampleFormat::F32Planar => Sample::F32(sample::Type::Planar),
    }
}

pub struct SwrResampler {
    ctx: SwrContext,
    src: AudioParams,
    dst: AudioParams,
}

// SwrContext carries raw pointers; all access goes through &mut self and the
// engine uses exactly one resampler per audio path.
unsafe impl Send for SwrResampler {}

impl SwrResampler {
    pub fn new(src: &AudioParams, dst: &AudioParams) -> Result<Self, MediaError> {
        let ctx = SwrContext::get(
            to_ffmpeg_sample(src.format),
            ChannelLayout::default(src.channels as i32),
            src.freq,
            to_ffmpeg_sample(dst.format),
            ChannelLayout::default(dst.channels as i32),
            dst.freq,
        )
        .map_err(|e| MediaError::Resample(e.to_string()))?;
        Ok(Self {
            ctx,
            src: *src,
            dst: *dst,
        })
    }
}

impl Resampler for SwrResampler {
    fn convert(&mut self, frame: &AudioFrame, out: &mut Vec<u8>) -> Result<usize, MediaError> {
        // Headroom for compensation plus swr's internal delay.
        let out_capacity =
            frame.nb_samples as i64 * self.dst.freq as i64 / self.src.freq.max(1) as i64 + 256;
        out.clear();
        out.resize(out_capacity as usize * self.dst.frame_size(), 0);

        let mut in_planes: [*const u8; 8] = [std::ptr::null(); 8];
        for (i, plane) in frame.planes.iter().take(8).enumerate() {
            in_planes[i] = plane.as_ptr();
        }
        let mut out_planes: [*mut u8; 1] = [out.as_mut_ptr()];

        let converted = unsafe {
            ffi::swr_convert(
                self.ctx.as_mut_ptr(),
                out_planes.as_mut_ptr(),
                out_capacity as i32,
                in_planes.as_ptr() as *mut *const u8,
                frame.nb_samples as i32,
            )
        };
        if converted < 0 {
            return Err(MediaError::Resample(format!(
                "swr_convert failed ({converted})"
            )));
        }
        if converted as i64 == out_capacity {
            tracing::warn!("audio buffer is probably too small");
        }
        out.truncate(converted as usize * self.dst.frame_size());
        Ok(converted as usize)
    }

    fn set_compensation(&mut self, delta: i32, window: i32) -> Result<(), MediaError> {
        let ret = unsafe { ffi::swr_set_compensation(self.ctx.as_mut_ptr(), delta, window) };
        if ret < 0 {
            Err(MediaError::Resample(format!(
                "swr_set_compensation failed ({ret})"
            )))
        } else {
            Ok(())
        }
    }
}
