// crates/backspin-engine/src/clock.rs
//
// A pausable, rate-scaled timeline. Three of these (audio, video, external)
// drive every synchronization decision in the engine.
//
// Each clock watches an authoritative serial owned by its packet queue; a
// reading whose recorded serial no longer matches is from a pre-seek epoch
// and comes back as NaN.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;

use backspin_core::Serial;

use crate::AV_NOSYNC_THRESHOLD;

/// Monotonic wall time in seconds, against a process-wide epoch.
pub fn wall_time() -> f64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_secs_f64()
}

#[derive(Clone, Copy, Debug)]
struct Inner {
    pts: f64,
    /// pts minus the wall moment it was stamped; reading is drift + now.
    pts_drift: f64,
    last_updated: f64,
    speed: f64,
    paused: bool,
    serial: Serial,
}

pub struct Clock {
    inner: Mutex<Inner>,
    queue_serial: Arc<AtomicI32>,
    /// External clock: nothing invalidates it, so it tracks its own serial.
    own_serial: bool,
}

impl Clock {
    /// A clock fenced by a packet queue's serial.
    pub fn new(queue_serial: Arc<AtomicI32>) -> Self {
        let clock = Self {
            inner: Mutex::new(Inner {
                pts: f64::NAN,
                pts_drift: f64::NAN,
                last_updated: wall_time(),
                speed: 1.0,
                paused: false,
                serial: -1,
            }),
            queue_serial,
            own_serial: false,
        };
        clock.set(f64::NAN, -1);
        clock
    }

    /// A free-running clock whose readings are never serial-invalidated.
    pub fn detached() -> Self {
        let mut clock = Self::new(Arc::new(AtomicI32::new(-1)));
        clock.own_serial = true;
        clock
    }

    pub fn get(&self) -> f64 {
        self.get_at(wall_time())
    }

    pub fn get_at(&self, now: f64) -> f64 {
        let inner = self.inner.lock().unwrap();
        if self.queue_serial.load(Ordering::Acquire) != inner.serial {
            return f64::NAN;
        }
        if inner.paused {
            inner.pts
        } else {
            inner.pts_drift + now - (now - inner.last_updated) * (1.0 - inner.speed)
        }
    }

    pub fn set(&self, pts: f64, serial: Serial) {
        self.set_at(pts, serial, wall_time());
    }

    pub fn set_at(&self, pts: f64, serial: Serial, now: f64) {
        let mut inner = self.inner.lock().unwrap();
        inner.pts = pts;
        inner.last_updated = now;
        inner.pts_drift = pts - now;
        inner.serial = serial;
        if self.own_serial {
            self.queue_serial.store(serial, Ordering::Release);
        }
    }

    /// Wall-clock seconds elapsed since the last set, scaled by speed.
    pub fn time_passed(&self) -> f64 {
        let inner = self.inner.lock().unwrap();
        (wall_time() - inner.last_updated) * inner.speed
    }

    /// Re-stamp `last_updated` and drift without moving the pts.
    pub fn touch(&self) {
        let now = wall_time();
        let mut inner = self.inner.lock().unwrap();
        inner.last_updated = now;
        inner.pts_drift = inner.pts - now;
    }

    /// Re-anchor at the current reading, then change rate.
    pub fn set_speed(&self, speed: f64) {
        let (reading, serial) = {
            let now = wall_time();
            (self.get_at(now), self.serial())
        };
        self.set(reading, serial);
        self.inner.lock().unwrap().speed = speed;
    }

    pub fn speed(&self) -> f64 {
        self.inner.lock().unwrap().speed
    }

    pub fn serial(&self) -> Serial {
        self.inner.lock().unwrap().serial
    }

    /// The pts last assigned, without wall-clock extrapolation.
    pub fn last_pts(&self) -> f64 {
        self.inner.lock().unwrap().pts
    }

    pub fn paused(&self) -> bool {
        self.inner.lock().unwrap().paused
    }

    pub fn set_paused(&self, paused: bool) {
        self.inner.lock().unwrap().paused = paused;
    }

    /// Adopt `slave`'s reading when ours is stale, running backward, or more
    /// than `threshold` seconds away.
    pub fn sync_to(&self, slave: &Clock, threshold: f64) {
        let clock = self.get();
        let slave_clock = slave.get();
        if !slave_clock.is_nan()
            && (clock.is_nan() || self.speed() < 0.0 || (clock - slave_clock).abs() > threshold)
        {
            self.set(slave_clock, slave.serial());
        }
    }

    pub fn sync_to_default(&self, slave: &Clock) {
        self.sync_to(slave, AV_NOSYNC_THRESHOLD);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fenced() -> (Clock, Arc<AtomicI32>) {
        let serial = Arc::new(AtomicI32::new(0));
        (Clock::new(serial.clone()), serial)
    }

    #[test]
    fn fresh_clock_reads_nan() {
        let (clock, _serial) = fenced();
        assert!(clock.get().is_nan());
    }

    #[test]
    fn stale_serial_reads_nan() {
        let (clock, serial) = fenced();
        clock.set(3.0, 0);
        assert!(!clock.get().is_nan());
        serial.store(1, Ordering::Release);
        assert!(clock.get().is_nan());
        clock.set(3.0, 1);
        assert!(!clock.get().is_nan());
    }

    #[test]
    fn reading_advances_with_wall_time() {
        let (clock, _serial) = fenced();
        let now = wall_time();
        clock.set_at(5.0, 0, now);
        let later = clock.get_at(now + 0.5);
        assert!((later - 5.5).abs() < 1e-9);
    }

    #[test]
    fn paused_clock_holds_its_pts() {
        let (clock, _serial) = fenced();
        let now = wall_time();
        clock.set_at(2.0, 0, now);
        clock.set_paused(true);
        assert!((clock.get_at(now + 10.0) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn speed_scales_elapsed_time() {
        let (clock, _serial) = fenced();
        clock.set(0.0, 0);
        clock.set_speed(2.0);
        let now = wall_time();
        clock.set_at(0.0, 0, now);
        let read = clock.get_at(now + 1.0);
        assert!((read - 2.0).abs() < 1e-9);
    }

    #[test]
    fn negative_speed_runs_backward() {
        let (clock, _serial) = fenced();
        clock.set(10.0, 0);
        clock.set_speed(-1.0);
        let now = wall_time();
        clock.set_at(10.0, 0, now);
        let read = clock.get_at(now + 1.0);
        assert!((read - 9.0).abs() < 1e-9);
    }

    #[test]
    fn sync_adopts_when_far_apart() {
        let (master, _s1) = fenced();
        let (slave, _s2) = fenced();
        master.set(0.0, 0);
        slave.set(42.0, 0);
        master.sync_to(&slave, 10.0);
        assert!((master.get() - 42.0).abs() < 0.01);
    }

    #[test]
    fn sync_leaves_small_offsets_alone() {
        let (master, _s1) = fenced();
        let (slave, _s2) = fenced();
        master.set(1.0, 0);
        slave.set(1.5, 0);
        master.sync_to(&slave, 10.0);
        assert!((master.get() - 1.0).abs() < 0.01);
    }

    #[test]
    fn detached_clock_never_goes_stale() {
        let clock = Clock::detached();
        clock.set(7.0, 3);
        assert!(!clock.get().is_nan());
        clock.set(8.0, 0);
        assert!(!clock.get().is_nan());
    }
}
