// crates/backspin-media/src/yuv.rs
//
// Repack a decoded YUV420P frame into the stride-free buffer that
// `backspin_core::VideoPicture` expects: the three planes concatenated, each
// row exactly as wide as the plane. `VideoPicture::y()/u()/v()` slice that
// buffer back apart, so the offsets here and there must agree.

use ffmpeg_the_third::util::frame::video::Video as VideoFrame;

/// Copy the visible pixels of each plane, dropping libav's per-row padding.
pub fn pack_planes(frame: &VideoFrame, w: usize, h: usize, uv_w: usize, uv_h: usize) -> Vec<u8> {
    let mut packed = Vec::with_capacity(w * h + 2 * uv_w * uv_h);
    // Luma first, then both chroma planes at quarter resolution.
    for (plane, cols, rows) in [(0, w, h), (1, uv_w, uv_h), (2, uv_w, uv_h)] {
        let stride = frame.stride(plane);
        for row in frame.data(plane).chunks(stride).take(rows) {
            packed.extend_from_slice(&row[..cols]);
        }
    }
    packed
}
