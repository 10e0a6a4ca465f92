// crates/backspin-engine/src/video.rs
//
// Frame scheduling math for the refresh loop: how long the frame on screen
// should stay up, and how that delay is bent toward the master clock.

use crate::frame_queue::FrameMeta;
use crate::{AV_SYNC_FRAMEDUP_THRESHOLD, AV_SYNC_THRESHOLD_MAX, AV_SYNC_THRESHOLD_MIN};

/// Nominal time between two queued frames. Falls back to the first frame's
/// own duration across serial boundaries or on nonsense pts deltas.
pub(crate) fn vp_duration(vp: &FrameMeta, nextvp: &FrameMeta, max_frame_duration: f64) -> f64 {
    if vp.serial == nextvp.serial {
        let duration = nextvp.pts - vp.pts;
        if duration.is_nan() || duration <= 0.0 || duration > max_frame_duration {
            vp.duration
        } else {
            duration
        }
    } else {
        0.0
    }
}

/// Reverse-mode counterpart: pts decreases, so the subtraction flips.
pub(crate) fn vp_duration_reversed(
    vp: &FrameMeta,
    nextvp: &FrameMeta,
    max_frame_duration: f64,
) -> f64 {
    if vp.serial == nextvp.serial {
        let duration = vp.pts - nextvp.pts;
        if duration.is_nan() || duration <= 0.0 || duration > max_frame_duration {
            vp.duration
        } else {
            duration
        }
    } else {
        0.0
    }
}

/// Bend `delay` toward the master clock. `diff` is video clock minus master;
/// when video itself is the master, pass NaN (no correction).
///
/// Late video shrinks the delay; early video either stretches it (when the
/// nominal delay is long enough to absorb the diff) or doubles it to
/// duplicate the current frame.
pub(crate) fn compute_target_delay(delay: f64, diff: f64, max_frame_duration: f64) -> f64 {
    let mut delay = delay;
    let sync_threshold = delay.clamp(AV_SYNC_THRESHOLD_MIN, AV_SYNC_THRESHOLD_MAX);
    if !diff.is_nan() && diff.abs() < max_frame_duration {
        if diff <= -sync_threshold {
            delay = (delay + diff).max(0.0);
        } else if diff >= sync_threshold && delay > AV_SYNC_FRAMEDUP_THRESHOLD {
            delay += diff;
        } else if diff >= sync_threshold {
            delay *= 2.0;
        }
    }
    tracing::trace!(delay, a_v = -diff, "video target delay");
    delay
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(pts: f64, duration: f64, serial: i32) -> FrameMeta {
        FrameMeta {
            serial,
            pts,
            duration,
            pos: -1,
            ts: 0,
        }
    }

    const MAX_DUR: f64 = 3600.0;

    #[test]
    fn duration_is_pts_delta_within_a_serial() {
        let a = meta(1.0, 0.04, 0);
        let b = meta(1.05, 0.04, 0);
        assert!((vp_duration(&a, &b, MAX_DUR) - 0.05).abs() < 1e-9);
    }

    #[test]
    fn duration_falls_back_across_serials_and_bad_deltas() {
        let a = meta(1.0, 0.04, 0);
        let b_other_serial = meta(1.05, 0.04, 1);
        assert_eq!(vp_duration(&a, &b_other_serial, MAX_DUR), 0.0);

        let b_backwards = meta(0.5, 0.04, 0);
        assert_eq!(vp_duration(&a, &b_backwards, MAX_DUR), 0.04);

        let b_nan = meta(f64::NAN, 0.04, 0);
        assert_eq!(vp_duration(&a, &b_nan, MAX_DUR), 0.04);

        let b_jump = meta(1.0 + MAX_DUR * 2.0, 0.04, 0);
        assert_eq!(vp_duration(&a, &b_jump, MAX_DUR), 0.04);
    }

    #[test]
    fn reversed_duration_flips_the_subtraction() {
        let vp = meta(2.0, 0.04, 0);
        let next = meta(1.96, 0.04, 0);
        assert!((vp_duration_reversed(&vp, &next, MAX_DUR) - 0.04).abs() < 1e-9);
        // Forward-looking pair makes no sense in reverse: fall back.
        assert_eq!(vp_duration_reversed(&next, &vp, MAX_DUR), 0.04);
    }

    #[test]
    fn video_master_leaves_delay_unchanged() {
        assert_eq!(compute_target_delay(0.04, f64::NAN, MAX_DUR), 0.04);
    }

    #[test]
    fn late_video_shrinks_delay() {
        // Video 80 ms behind the master with a 40 ms nominal delay: show the
        // next frame immediately.
        let d = compute_target_delay(0.04, -0.08, MAX_DUR);
        assert_eq!(d, 0.0);
        // Mildly late: shrink but stay positive.
        let d = compute_target_delay(0.2, -0.12, MAX_DUR);
        assert!((d - 0.08).abs() < 1e-9);
    }

    #[test]
    fn early_video_with_long_frames_stretches_delay() {
        // last_duration > 0.1 so the diff is absorbed, not doubled.
        let d = compute_target_delay(0.2, 0.15, MAX_DUR);
        assert!((d - 0.35).abs() < 1e-9);
    }

    #[test]
    fn early_video_with_short_frames_duplicates() {
        // last_duration <= 0.1: the doubling branch runs.
        let d = compute_target_delay(0.04, 0.08, MAX_DUR);
        assert!((d - 0.08).abs() < 1e-9);
    }

    #[test]
    fn huge_divergence_is_left_to_a_seek() {
        // Past max_frame_duration the diff is a timestamp discontinuity, not
        // something frame pacing should chase.
        let d = compute_target_delay(0.04, 100.0, 10.0);
        assert_eq!(d, 0.04);
    }

    #[test]
    fn small_diff_inside_threshold_is_ignored() {
        let d = compute_target_delay(0.04, 0.01, MAX_DUR);
        assert_eq!(d, 0.04);
    }
}
