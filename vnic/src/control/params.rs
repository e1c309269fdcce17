//! Bounds checking and normalization of the ring-pool tunables negotiated by
//! configure-data-path.

use crate::error::{Result, VnicError};
use crate::protocol::{Command, PoolParams};

/// Inclusive `[min, max]` range for one tunable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamBounds {
    pub min: u32,
    pub max: u32,
}

impl ParamBounds {
    pub const fn new(min: u32, max: u32) -> Self {
        Self { min, max }
    }

    pub const fn contains(&self, v: u32) -> bool {
        v >= self.min && v <= self.max
    }
}

/// Bounds for all six tunables of one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolBounds {
    pub entry_size: ParamBounds,
    pub entry_count: ParamBounds,
    pub kick_timeout_us: ParamBounds,
    pub kick_entries: ParamBounds,
    pub kick_bytes: ParamBounds,
    pub free_per_update: ParamBounds,
}

/// Largest power of two not above `v`; 0 for 0.
pub const fn prev_power_of_two(v: u32) -> u32 {
    if v == 0 { 0 } else { 1 << (31 - v.leading_zeros()) }
}

/// Bring one proposed value inside `bounds`: clamp to the nearest bound,
/// then, for count tunables, round down to a power of two. If rounding
/// leaves the value below `min`, the next power of two is used when it is
/// still within `max`.
pub fn normalize_value(
    name: &'static str,
    value: u32,
    bounds: ParamBounds,
    power_of_two: bool,
) -> Result<u32> {
    let out_of_range = || VnicError::ParameterOutOfRange {
        name,
        value: value as u64,
        min: bounds.min as u64,
        max: bounds.max as u64,
    };
    if bounds.min > bounds.max {
        return Err(out_of_range());
    }
    let clamped = value.clamp(bounds.min, bounds.max);
    if !power_of_two {
        return Ok(clamped);
    }
    let down = prev_power_of_two(clamped);
    if down >= bounds.min && down != 0 {
        return Ok(down);
    }
    match bounds.min.max(1).checked_next_power_of_two() {
        Some(up) if up <= bounds.max => Ok(up),
        _ => Err(out_of_range()),
    }
}

impl PoolBounds {
    fn fields(&self, p: &PoolParams) -> [(&'static str, u32, ParamBounds, bool); 6] {
        [
            ("entry_size", p.entry_size, self.entry_size, false),
            ("entry_count", p.entry_count, self.entry_count, true),
            ("kick_timeout_us", p.kick_timeout_us, self.kick_timeout_us, false),
            ("kick_entries", p.kick_entries, self.kick_entries, false),
            ("kick_bytes", p.kick_bytes, self.kick_bytes, false),
            ("free_per_update", p.free_per_update, self.free_per_update, true),
        ]
    }

    /// Reject inverted ranges and power-of-two ranges that contain none.
    pub fn validate(&self, pool: &str) -> Result<()> {
        for (name, _, b, pow2) in self.fields(&PoolParams::default()) {
            if b.min > b.max {
                return Err(VnicError::Config(format!(
                    "{pool} pool: {name} bounds [{}, {}] inverted",
                    b.min, b.max
                )));
            }
            if pow2 && normalize_value(name, b.max, b, true).is_err() {
                return Err(VnicError::Config(format!(
                    "{pool} pool: {name} bounds [{}, {}] contain no power of two",
                    b.min, b.max
                )));
            }
        }
        Ok(())
    }

    /// Normalize a local proposal field by field.
    pub fn normalize(&self, p: PoolParams) -> Result<PoolParams> {
        let [size, count, timeout, entries, bytes, free] = self.fields(&p);
        let norm = |(name, v, b, pow2): (&'static str, u32, ParamBounds, bool)| {
            normalize_value(name, v, b, pow2)
        };
        let mut out = PoolParams {
            entry_size: norm(size)?,
            entry_count: norm(count)?,
            kick_timeout_us: norm(timeout)?,
            kick_entries: norm(entries)?,
            kick_bytes: norm(bytes)?,
            free_per_update: norm(free)?,
        };
        if out.free_per_update > out.entry_count {
            out.free_per_update = out.entry_count;
        }
        Ok(out)
    }

    /// Strictly check values granted by the peer.
    pub fn check(&self, p: &PoolParams) -> Result<()> {
        for (name, v, b, pow2) in self.fields(p) {
            if !b.contains(v) {
                return Err(VnicError::ParameterOutOfRange {
                    name,
                    value: v as u64,
                    min: b.min as u64,
                    max: b.max as u64,
                });
            }
            if pow2 && !v.is_power_of_two() {
                return Err(VnicError::InvalidResponse {
                    command: Command::ConfigDataPath,
                    reason: format!("{name} = {v} is not a power of two"),
                });
            }
        }
        if p.free_per_update > p.entry_count {
            return Err(VnicError::InvalidResponse {
                command: Command::ConfigDataPath,
                reason: format!(
                    "free_per_update {} exceeds entry_count {}",
                    p.free_per_update, p.entry_count
                ),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bounds() -> PoolBounds {
        PoolBounds {
            entry_size: ParamBounds::new(256, 9056),
            entry_count: ParamBounds::new(16, 4096),
            kick_timeout_us: ParamBounds::new(10, 1000),
            kick_entries: ParamBounds::new(1, 64),
            kick_bytes: ParamBounds::new(0, 1 << 20),
            free_per_update: ParamBounds::new(1, 64),
        }
    }

    #[test]
    fn test_in_range_power_of_two_unchanged() {
        let b = ParamBounds::new(16, 4096);
        for v in [16u32, 32, 64, 1024, 4096] {
            assert_eq!(normalize_value("n", v, b, true).unwrap(), v);
        }
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let b = ParamBounds::new(3, 3000);
        for v in 0..5000u32 {
            let once = normalize_value("n", v, b, true).unwrap();
            assert!(once.is_power_of_two());
            assert!(b.contains(once));
            assert_eq!(normalize_value("n", once, b, true).unwrap(), once);
        }
    }

    #[test]
    fn test_out_of_range_clamped() {
        let b = ParamBounds::new(10, 1000);
        assert_eq!(normalize_value("t", 5, b, false).unwrap(), 10);
        assert_eq!(normalize_value("t", 5000, b, false).unwrap(), 1000);
        assert_eq!(normalize_value("t", 333, b, false).unwrap(), 333);
    }

    #[test]
    fn test_non_power_of_two_rounded_down() {
        let b = ParamBounds::new(16, 4096);
        assert_eq!(normalize_value("n", 1000, b, true).unwrap(), 512);
        assert_eq!(normalize_value("n", 5000, b, true).unwrap(), 4096);
        // clamps to 3000, rounds down to 2048
        assert_eq!(
            normalize_value("n", 9999, ParamBounds::new(16, 3000), true).unwrap(),
            2048
        );
    }

    #[test]
    fn test_round_up_when_below_min() {
        // 48 clamps to 48, rounds down to 32 < 40, so 64 is used
        let b = ParamBounds::new(40, 100);
        assert_eq!(normalize_value("n", 48, b, true).unwrap(), 64);
        assert!(normalize_value("n", 48, ParamBounds::new(40, 60), true).is_err());
    }

    #[test]
    fn test_normalize_pool() {
        let p = PoolParams {
            entry_size: 100,
            entry_count: 700,
            kick_timeout_us: 5,
            kick_entries: 200,
            kick_bytes: 4096,
            free_per_update: 12,
        };
        let n = bounds().normalize(p).unwrap();
        assert_eq!(n.entry_size, 256);
        assert_eq!(n.entry_count, 512);
        assert_eq!(n.kick_timeout_us, 10);
        assert_eq!(n.kick_entries, 64);
        assert_eq!(n.kick_bytes, 4096);
        assert_eq!(n.free_per_update, 8);
        assert_eq!(bounds().normalize(n).unwrap(), n);
        bounds().check(&n).unwrap();
    }

    #[test]
    fn test_check_is_strict() {
        let mut p = bounds().normalize(PoolParams::default()).unwrap();
        bounds().check(&p).unwrap();
        p.entry_count = 8192;
        assert!(matches!(
            bounds().check(&p),
            Err(VnicError::ParameterOutOfRange {
                name: "entry_count",
                ..
            })
        ));
        p.entry_count = 100;
        assert!(matches!(
            bounds().check(&p),
            Err(VnicError::InvalidResponse { .. })
        ));
    }

    #[test]
    fn test_prev_power_of_two() {
        assert_eq!(prev_power_of_two(0), 0);
        assert_eq!(prev_power_of_two(1), 1);
        assert_eq!(prev_power_of_two(3), 2);
        assert_eq!(prev_power_of_two(u32::MAX), 1 << 31);
    }
}
