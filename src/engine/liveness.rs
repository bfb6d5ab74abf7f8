use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Progress {
    Ok,
    Stalled { tick: u64, idle: Duration },
}

#[derive(Clone, Copy, Debug)]
struct TickRecord {
    tick: u64,
    changed_at: Instant,
}

/// Watches each lobby's tick counter and reports when it stops moving.
#[derive(Debug)]
pub struct LivenessMonitor {
    threshold: Duration,
    lobbies: HashMap<String, TickRecord>,
}

impl LivenessMonitor {
    pub fn new(threshold: Duration) -> Self {
        Self {
            threshold,
            lobbies: HashMap::new(),
        }
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    pub fn check(&mut self, lobby_id: &str, tick: u64, now: Instant) -> Progress {
        let Some(record) = self.lobbies.get_mut(lobby_id) else {
            self.lobbies.insert(
                lobby_id.to_string(),
                TickRecord {
                    tick,
                    changed_at: now,
                },
            );
            return Progress::Ok;
        };
        if record.tick != tick {
            record.tick = tick;
            record.changed_at = now;
            return Progress::Ok;
        }
        let idle = now.saturating_duration_since(record.changed_at);
        if idle > self.threshold {
            Progress::Stalled { tick, idle }
        } else {
            Progress::Ok
        }
    }

    pub fn forget(&mut self, lobby_id: &str) {
        self.lobbies.remove(lobby_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const THRESHOLD: Duration = Duration::from_secs(3);

    #[test]
    fn first_observation_is_always_ok() {
        let mut monitor = LivenessMonitor::new(THRESHOLD);
        assert_eq!(monitor.check("l1", 0, Instant::now()), Progress::Ok);
    }

    #[test]
    fn unchanged_tick_stalls_only_strictly_after_threshold() {
        let mut monitor = LivenessMonitor::new(THRESHOLD);
        let start = Instant::now();
        monitor.check("l1", 5, start);
        assert_eq!(monitor.check("l1", 5, start + THRESHOLD), Progress::Ok);
        assert_eq!(
            monitor.check("l1", 5, start + THRESHOLD + Duration::from_millis(1)),
            Progress::Stalled {
                tick: 5,
                idle: THRESHOLD + Duration::from_millis(1)
            }
        );
    }

    #[test]
    fn advancing_tick_resets_the_idle_clock() {
        let mut monitor = LivenessMonitor::new(THRESHOLD);
        let start = Instant::now();
        monitor.check("l1", 1, start);
        assert_eq!(
            monitor.check("l1", 2, start + Duration::from_secs(10)),
            Progress::Ok
        );
        assert_eq!(
            monitor.check("l1", 2, start + Duration::from_secs(12)),
            Progress::Ok
        );
    }

    #[test]
    fn frozen_tick_over_ten_polls_is_reported_by_the_tenth() {
        let mut monitor = LivenessMonitor::new(THRESHOLD);
        let start = Instant::now();
        let step = Duration::from_millis(400);
        let mut stalled_at = None;
        for poll in 0..10u32 {
            if let Progress::Stalled { .. } = monitor.check("l1", 77, start + step * poll) {
                stalled_at = Some(poll);
                break;
            }
        }
        assert_eq!(stalled_at, Some(8));
    }

    #[test]
    fn lobbies_are_tracked_independently_and_can_be_forgotten() {
        let mut monitor = LivenessMonitor::new(THRESHOLD);
        let start = Instant::now();
        monitor.check("a", 1, start);
        monitor.check("b", 1, start);
        let late = start + Duration::from_secs(5);
        assert_eq!(monitor.check("a", 2, late), Progress::Ok);
        assert!(matches!(monitor.check("b", 1, late), Progress::Stalled { .. }));
        monitor.forget("b");
        assert_eq!(monitor.check("b", 1, late), Progress::Ok);
    }
}
