//! timer.rs — statistics-keeping start/stop timer
//!
//! Keeps the last 64 (start, stop) pairs in a ring plus a total event
//! counter, and derives min/avg/stdev/max of both the period (start to
//! start) and the run time (start to stop), the resulting frequency and
//! the duty cycle. Used for bus-cycle and transaction latency
//! diagnostics everywhere in the core.

use std::fmt;

/// Number of events kept in the ring.
pub const TIMER_EVENTS: usize = 64;

#[derive(Debug, Clone)]
pub struct Timer {
    starts: [i64; TIMER_EVENTS],
    stops: [i64; TIMER_EVENTS],
    /// Completed (start, stop) pairs since the last reset.
    count: u64,
    running: bool,
}

impl Default for Timer {
    fn default() -> Self {
        Timer {
            starts: [0; TIMER_EVENTS],
            stops: [0; TIMER_EVENTS],
            count: 0,
            running: false,
        }
    }
}

impl Timer {
    pub fn new() -> Self {
        Timer::default()
    }

    /// Record a start (`start == true`) or stop at `now_us`. Repeated
    /// starts or stops update the current event in place. Returns the
    /// microseconds elapsed since the most recent start.
    pub fn tick(&mut self, now_us: i64, start: bool) -> i64 {
        let last_start = if self.running {
            self.starts[(self.count % TIMER_EVENTS as u64) as usize]
        } else if self.count > 0 {
            self.starts[((self.count - 1) % TIMER_EVENTS as u64) as usize]
        } else {
            now_us
        };

        if start {
            let slot = (self.count % TIMER_EVENTS as u64) as usize;
            self.starts[slot] = now_us;
            self.running = true;
        } else if self.running {
            let slot = (self.count % TIMER_EVENTS as u64) as usize;
            self.stops[slot] = now_us;
            self.count += 1;
            self.running = false;
        } else if self.count > 0 {
            self.stops[((self.count - 1) % TIMER_EVENTS as u64) as usize] = now_us;
        }

        now_us - last_start
    }

    pub fn running(&self) -> bool {
        self.running
    }

    /// Start time of the event in progress, if any.
    pub fn started(&self) -> Option<i64> {
        self.running
            .then(|| self.starts[(self.count % TIMER_EVENTS as u64) as usize])
    }

    /// Stop time of the last completed event, unless running.
    pub fn stopped(&self) -> Option<i64> {
        (!self.running && self.count > 0)
            .then(|| self.stops[((self.count - 1) % TIMER_EVENTS as u64) as usize])
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn reset(&mut self) {
        *self = Timer::default();
    }

    /// Statistics over the ring. Undefined while the timer is running or
    /// with fewer than two completed events.
    pub fn stats(&self) -> Option<TimerStats> {
        if self.running || self.count < 2 {
            return None;
        }
        let nn = self.count.min(TIMER_EVENTS as u64) as usize;
        let slot = |g: u64| (g % TIMER_EVENTS as u64) as usize;
        let first = self.count - nn as u64;

        // average period spans the whole window
        let pavg = (self.starts[slot(self.count - 1)] - self.starts[slot(first)]) as f64
            / (nn - 1) as f64;

        let mut rmin = f64::INFINITY;
        let mut rmax = f64::NEG_INFINITY;
        let mut rsum = 0.0;
        for g in first..self.count {
            let x = (self.stops[slot(g)] - self.starts[slot(g)]) as f64;
            rmin = rmin.min(x);
            rmax = rmax.max(x);
            rsum += x;
        }
        let ravg = rsum / nn as f64;
        let mut rssq = 0.0;
        for g in first..self.count {
            let x = (self.stops[slot(g)] - self.starts[slot(g)]) as f64 - ravg;
            rssq += x * x;
        }
        let rdev = (rssq / nn as f64).sqrt();

        let mut pmin = f64::INFINITY;
        let mut pmax = f64::NEG_INFINITY;
        let mut pssq = 0.0;
        for g in first..self.count - 1 {
            let x = (self.starts[slot(g + 1)] - self.starts[slot(g)]) as f64;
            pmin = pmin.min(x);
            pmax = pmax.max(x);
            let d = x - pavg;
            pssq += d * d;
        }
        let pdev = (pssq / (nn - 1) as f64).sqrt();

        Some(TimerStats {
            count: self.count,
            pmin,
            pavg,
            pdev,
            pmax,
            rmin,
            ravg,
            rdev,
            rmax,
            f: if pavg == 0.0 { 0.0 } else { 1e6 / pavg },
            davg: if pavg == 0.0 { 1.0 } else { ravg / pavg },
        })
    }
}

/// All durations in microseconds; `f` in Hz, `davg` a 0..1 ratio.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimerStats {
    pub count: u64,
    pub pmin: f64,
    pub pavg: f64,
    pub pdev: f64,
    pub pmax: f64,
    pub rmin: f64,
    pub ravg: f64,
    pub rdev: f64,
    pub rmax: f64,
    pub f: f64,
    pub davg: f64,
}

impl fmt::Display for TimerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "count:{} f(Hz): {:.3} dc(%): {:.1} \
             period(ms): {:.3} / {:.3} (±{:.3}) / {:.3} \
             run(ms): {:.3} / {:.3} (±{:.3}) / {:.3}",
            self.count,
            self.f,
            self.davg * 100.0,
            self.pmin / 1000.0,
            self.pavg / 1000.0,
            self.pdev / 1000.0,
            self.pmax / 1000.0,
            self.rmin / 1000.0,
            self.ravg / 1000.0,
            self.rdev / 1000.0,
            self.rmax / 1000.0,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn too_few_events_or_running_yields_none() {
        let mut t = Timer::new();
        assert!(t.stats().is_none());
        t.tick(0, true);
        assert!(t.stats().is_none()); // running
        t.tick(2_000, false);
        assert!(t.stats().is_none()); // one completed event
        t.tick(10_000, true);
        t.tick(12_000, false);
        assert!(t.stats().is_some());
    }

    #[test]
    fn regular_cadence_statistics() {
        let mut t = Timer::new();
        for i in 0..10i64 {
            t.tick(i * 10_000, true);
            t.tick(i * 10_000 + 2_000, false);
        }
        let s = t.stats().unwrap();
        assert_eq!(s.count, 10);
        assert!((s.pavg - 10_000.0).abs() < 1e-9);
        assert!((s.pmin - 10_000.0).abs() < 1e-9);
        assert!((s.pmax - 10_000.0).abs() < 1e-9);
        assert!(s.pdev.abs() < 1e-9);
        assert!((s.ravg - 2_000.0).abs() < 1e-9);
        assert!(s.rdev.abs() < 1e-9);
        assert!((s.f - 100.0).abs() < 1e-9);
        assert!((s.davg - 0.2).abs() < 1e-9);
    }

    #[test]
    fn ring_wraps_past_capacity() {
        let mut t = Timer::new();
        for i in 0..200i64 {
            t.tick(i * 1_000, true);
            t.tick(i * 1_000 + 100, false);
        }
        let s = t.stats().unwrap();
        assert_eq!(s.count, 200);
        assert!((s.pavg - 1_000.0).abs() < 1e-9);
        assert!((s.ravg - 100.0).abs() < 1e-9);
    }

    #[test]
    fn tick_reports_time_since_last_start() {
        let mut t = Timer::new();
        t.tick(1_000, true);
        assert_eq!(t.tick(1_500, false), 500);
        assert_eq!(t.tick(3_000, true), 2_000);
        assert!(t.running());
        assert_eq!(t.started(), Some(3_000));
        assert_eq!(t.stopped(), None);
    }

    #[test]
    fn repeated_stops_update_in_place() {
        let mut t = Timer::new();
        t.tick(0, true);
        t.tick(100, false);
        t.tick(200, false); // updates the same stop
        assert_eq!(t.count(), 1);
        assert_eq!(t.stopped(), Some(200));
    }
}
