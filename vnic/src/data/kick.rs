//! Kick pacing for the transmit side: counts frames and bytes written since
//! the last kick and arms a timer for the remainder.

use std::time::Duration;

use tokio::time::Instant;

use crate::protocol::PoolParams;

/// Decides when the sender must kick the receiver.
///
/// A kick is due once the frames sent since the last kick reach
/// `kick_entries`, their bytes reach `kick_bytes` (when non-zero), or
/// `kick_timeout` has passed since the first of them. Each accumulated batch
/// produces exactly one kick.
#[derive(Debug)]
pub struct KickTracker {
    entries_threshold: u32,
    bytes_threshold: u64,
    timeout: Duration,
    count: u32,
    bytes: u64,
    deadline: Option<Instant>,
}

impl KickTracker {
    /// Tracker using the receiving pool's thresholds.
    pub fn new(peer: &PoolParams) -> Self {
        Self {
            entries_threshold: peer.kick_entries.max(1),
            bytes_threshold: peer.kick_bytes as u64,
            timeout: Duration::from_micros(peer.kick_timeout_us as u64),
            count: 0,
            bytes: 0,
            deadline: None,
        }
    }

    /// Account for one send. Returns true if this send completes the batch
    /// and must carry the kick; otherwise the timer is armed on the first
    /// send of a batch.
    pub fn record(&mut self, bytes: usize, now: Instant) -> bool {
        self.count += 1;
        self.bytes += bytes as u64;
        let by_count = self.count >= self.entries_threshold;
        let by_bytes = self.bytes_threshold > 0 && self.bytes >= self.bytes_threshold;
        if by_count || by_bytes {
            self.reset();
            return true;
        }
        if self.deadline.is_none() {
            self.deadline = Some(now + self.timeout);
        }
        false
    }

    /// Called when the timer fires. Returns true if a kick is due.
    pub fn expire(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(d) if now >= d && self.count > 0 => {
                self.reset();
                true
            }
            _ => false,
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Sends not yet covered by a kick.
    pub fn pending(&self) -> u32 {
        self.count
    }

    fn reset(&mut self) {
        self.count = 0;
        self.bytes = 0;
        self.deadline = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(entries: u32, bytes: u32, timeout_us: u32) -> KickTracker {
        KickTracker::new(&PoolParams {
            kick_entries: entries,
            kick_bytes: bytes,
            kick_timeout_us: timeout_us,
            ..Default::default()
        })
    }

    #[test]
    fn test_kick_on_count() {
        let mut k = tracker(4, 0, 100);
        let now = Instant::now();
        let kicks: Vec<bool> = (0..12).map(|_| k.record(60, now)).collect();
        let at: Vec<usize> = kicks
            .iter()
            .enumerate()
            .filter(|(_, k)| **k)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(at, vec![3, 7, 11]);
        assert_eq!(k.pending(), 0);
        assert!(k.deadline().is_none());
    }

    #[test]
    fn test_kick_on_bytes() {
        let mut k = tracker(64, 1000, 100);
        let now = Instant::now();
        assert!(!k.record(400, now));
        assert!(!k.record(400, now));
        assert!(k.record(400, now));
        assert!(!k.record(999, now));
        assert!(k.record(1, now));
    }

    #[test]
    fn test_zero_byte_threshold_disabled() {
        let mut k = tracker(3, 0, 100);
        let now = Instant::now();
        assert!(!k.record(1 << 20, now));
        assert!(!k.record(1 << 20, now));
        assert!(k.record(1, now));
    }

    #[test]
    fn test_timer_started_by_first_send() {
        let mut k = tracker(16, 0, 100);
        let t0 = Instant::now();
        assert!(k.deadline().is_none());
        k.record(10, t0);
        let d = k.deadline().unwrap();
        assert_eq!(d, t0 + Duration::from_micros(100));
        // later sends do not push the deadline out
        k.record(10, t0 + Duration::from_micros(50));
        assert_eq!(k.deadline(), Some(d));

        assert!(!k.expire(t0 + Duration::from_micros(99)));
        assert!(k.expire(d));
        // once per batch
        assert!(!k.expire(d + Duration::from_micros(500)));
        assert!(k.deadline().is_none());
    }

    #[test]
    fn test_threshold_kick_cancels_timer() {
        let mut k = tracker(2, 0, 100);
        let t0 = Instant::now();
        k.record(10, t0);
        assert!(k.record(10, t0));
        assert!(!k.expire(t0 + Duration::from_secs(1)));
    }

    #[test]
    fn test_exactly_one_kick_per_batch() {
        let mut k = tracker(5, 300, 1000);
        let t0 = Instant::now();
        let sizes = [100usize, 50, 200, 10, 10, 10, 10, 10, 500, 5, 5];
        let mut since_kick = (0u32, 0u64);
        for (i, s) in sizes.iter().enumerate() {
            since_kick.0 += 1;
            since_kick.1 += *s as u64;
            let expect = since_kick.0 >= 5 || since_kick.1 >= 300;
            assert_eq!(k.record(*s, t0), expect, "send {i}");
            if expect {
                since_kick = (0, 0);
            }
        }
    }
}
