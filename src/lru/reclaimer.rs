//! The reclaimer background task and its adaptive sleep (spec §4.4, plus
//! the §14 supplement hoisting `lru_thread`'s sleep arithmetic into a pure,
//! independently-testable function).

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::backend::Backend;
use crate::config::CacheConfig;
use crate::lru::LruEngine;

/// How long the reclaimer should sleep before its next pass, given the
/// current open-descriptor count, its recent rate of change, and the
/// configured watermarks. Pure function: same inputs, same `Duration`,
/// independent of wall-clock state (spec §9 Design Notes: "compute the
/// adaptive sleep once per wake, as a function of current state").
///
/// Below `lowat` there is no urgency: sleep the full `base_interval`. Above
/// it, the sleep shrinks towards a floor as occupancy climbs toward
/// `hiwat`, and is further capped by how fast descriptors are accumulating
/// (a high `rate_per_sec` shortens the nap regardless of where `open_fds`
/// currently sits, since watermark pressure is coming either way).
pub fn adaptive_sleep(
    open_fds: u64,
    rate_per_sec: f64,
    lowat: u64,
    hiwat: u64,
    base_interval: Duration,
) -> Duration {
    const FLOOR: Duration = Duration::from_millis(50);

    if open_fds <= lowat || hiwat <= lowat {
        return base_interval;
    }

    let span = (hiwat - lowat) as f64;
    let over = (open_fds - lowat) as f64;
    let urgency = (over / span).min(1.0);
    let by_urgency = base_interval.mul_f64((1.0 - urgency).max(0.05));

    let by_rate = if rate_per_sec > 0.0 {
        Duration::from_secs_f64((1.0 / rate_per_sec).max(0.05))
    } else {
        by_urgency
    };

    by_urgency.min(by_rate).max(FLOOR)
}

struct Sample {
    at: Instant,
    open_fds: u64,
}

/// Owns the descriptor budget and drives periodic reclaimer passes over an
/// [`LruEngine`] (spec §4.4 "Reclaimer thread").
pub struct Reclaimer {
    lru: Arc<LruEngine>,
    backend: Arc<dyn Backend>,
    config: CacheConfig,
    fd_limit: u64,
    open_fds: AtomicU64,
    futility: AtomicU32,
    fd_caching_enabled: AtomicBool,
    last_sample: Mutex<Sample>,
    shutting_down: AtomicBool,
    wake: Notify,
}

impl Reclaimer {
    pub fn new(lru: Arc<LruEngine>, backend: Arc<dyn Backend>, config: CacheConfig, fd_limit: u64) -> Self {
        Self {
            lru,
            backend,
            fd_caching_enabled: AtomicBool::new(config.use_fd_cache),
            config,
            fd_limit,
            open_fds: AtomicU64::new(0),
            futility: AtomicU32::new(0),
            last_sample: Mutex::new(Sample { at: Instant::now(), open_fds: 0 }),
            shutting_down: AtomicBool::new(false),
            wake: Notify::new(),
        }
    }

    /// Wake the reclaimer immediately and tell its next wake-up to be its
    /// last (spec §5: "the reclaimer's sleep is interruptible").
    pub fn signal_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    pub fn open_fd_count(&self) -> u64 {
        self.open_fds.load(Ordering::SeqCst)
    }

    pub fn note_descriptor_opened(&self) {
        self.open_fds.fetch_add(1, Ordering::SeqCst);
    }

    pub fn note_descriptor_closed(&self) {
        self.open_fds.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn entry_hwmark_exceeded(&self, live_entries: usize) -> bool {
        live_entries as u64 >= self.config.entries_hwmark
    }

    pub fn fd_caching_enabled(&self) -> bool {
        self.fd_caching_enabled.load(Ordering::SeqCst)
    }

    fn lowat(&self) -> u64 {
        (self.fd_limit as f64 * self.config.fd_lwmark_percent as f64) as u64
    }

    fn hiwat(&self) -> u64 {
        (self.fd_limit as f64 * self.config.fd_hwmark_percent as f64) as u64
    }

    /// Duration to sleep before the next pass, sampling the descriptor
    /// growth rate since the last call.
    pub fn next_sleep(&self) -> Duration {
        let now = Instant::now();
        let current = self.open_fds.load(Ordering::SeqCst);
        let rate = {
            let mut last = self.last_sample.lock();
            let elapsed = now.saturating_duration_since(last.at).as_secs_f64().max(0.001);
            let rate = (current as f64 - last.open_fds as f64) / elapsed;
            *last = Sample { at: now, open_fds: current };
            rate.max(0.0)
        };
        adaptive_sleep(
            current,
            rate,
            self.lowat(),
            self.hiwat(),
            Duration::from_secs(self.config.lru_run_interval_secs),
        )
    }

    /// Run one reclaimer pass (spec §4.4). `signaled` distinguishes a
    /// forced wake (e.g. from a miss at the entry-count high-water mark)
    /// from a plain timed wake, which resets the futility counter.
    pub async fn pass(&self, signaled: bool) {
        if !signaled {
            self.futility.store(0, Ordering::SeqCst);
        }

        let lowat = self.lowat();
        let hiwat = self.hiwat();

        if self.open_fds.load(Ordering::SeqCst) < lowat {
            if !self.fd_caching_enabled.load(Ordering::SeqCst) {
                self.fd_caching_enabled.store(true, Ordering::SeqCst);
                tracing::info!("fd caching re-enabled: open descriptors back below low water");
            }
            return;
        }

        let mut total_scanned = 0u32;
        let mut total_closed = 0u32;
        loop {
            for lane_idx in 0..self.lru.lane_count() {
                let (scanned, closed) = self
                    .lru
                    .reclaim_lane_descriptors(
                        lane_idx,
                        self.config.reaper_work,
                        self.backend.as_ref(),
                        &self.open_fds,
                    )
                    .await;
                total_scanned += scanned;
                total_closed += closed;
                if total_scanned >= self.config.biggest_window {
                    break;
                }
            }
            if self.open_fds.load(Ordering::SeqCst) <= hiwat || total_scanned >= self.config.biggest_window {
                break;
            }
        }

        tracing::debug!(
            scanned = total_scanned,
            closed = total_closed,
            open_fds = self.open_fds.load(Ordering::SeqCst),
            "reclaimer pass complete"
        );

        let required = ((total_scanned * self.config.required_progress) / 100).max(1);
        if total_closed < required && total_scanned > 0 {
            let count = self.futility.fetch_add(1, Ordering::SeqCst) + 1;
            if count >= self.config.futility_count
                && self.fd_caching_enabled.swap(false, Ordering::SeqCst)
            {
                tracing::warn!(
                    futile_passes = count,
                    "disabling descriptor caching after repeated futile reclaimer passes"
                );
            }
        } else {
            self.futility.store(0, Ordering::SeqCst);
        }
    }

    /// Drive `pass()` forever on an adaptive sleep cadence. Intended to be
    /// spawned as a single long-lived `tokio` task per `Cache` instance;
    /// exits once [`Reclaimer::signal_shutdown`] has been called.
    pub async fn run_forever(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.next_sleep()) => {}
                _ = self.wake.notified() => {}
            }
            if self.shutting_down.load(Ordering::SeqCst) {
                break;
            }
            self.pass(false).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn below_low_water_sleeps_the_full_base_interval() {
        let base = Duration::from_secs(90);
        let d = adaptive_sleep(10, 0.0, 100, 200, base);
        assert_eq!(d, base);
    }

    #[test]
    fn at_high_water_sleeps_near_the_floor() {
        let base = Duration::from_secs(90);
        let d = adaptive_sleep(200, 0.0, 100, 200, base);
        assert!(d < base);
        assert!(d >= Duration::from_millis(50));
    }

    #[test]
    fn fast_growth_shortens_sleep_even_mid_band() {
        let base = Duration::from_secs(90);
        let calm = adaptive_sleep(150, 0.0, 100, 200, base);
        let fast = adaptive_sleep(150, 50.0, 100, 200, base);
        assert!(fast < calm);
    }

    #[test]
    fn degenerate_watermarks_fall_back_to_base_interval() {
        let base = Duration::from_secs(90);
        assert_eq!(adaptive_sleep(500, 10.0, 100, 100, base), base);
    }
}
