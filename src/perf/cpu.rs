//! CPU utilisation sampling.
//! The Linux implementation reads aggregate jiffies from /proc/stat and reports
//! the busy share between two consecutive readings.

use std::time::Duration;

use parking_lot::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum CpuSampleError {
    #[error("cpu statistics unavailable: {0}")]
    Unavailable(String),
    #[error("malformed cpu statistics: {0}")]
    Malformed(String),
}

/// Source of system-wide CPU utilisation in percent (0-100).
pub trait CpuSampler: Send {
    fn sample(&self) -> Result<f32, CpuSampleError>;
}

/// Aggregate jiffy counters from the `cpu` line of /proc/stat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuTimes {
    pub busy: u64,
    pub total: u64,
}

impl CpuTimes {
    /// Parse the first (`cpu `) line of /proc/stat.
    pub fn parse(stat: &str) -> Result<Self, CpuSampleError> {
        let line = stat
            .lines()
            .find(|l| l.starts_with("cpu "))
            .ok_or_else(|| CpuSampleError::Malformed("no aggregate cpu line".into()))?;

        let fields = line
            .split_whitespace()
            .skip(1)
            .map(|f| {
                f.parse::<u64>()
                    .map_err(|e| CpuSampleError::Malformed(format!("{f:?}: {e}")))
            })
            .collect::<Result<Vec<u64>, _>>()?;

        if fields.len() < 4 {
            return Err(CpuSampleError::Malformed(format!(
                "expected at least 4 counters, got {}",
                fields.len()
            )));
        }

        // user nice system idle iowait irq softirq steal (guest counters are
        // already folded into user/nice)
        let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
        let total: u64 = fields.iter().take(8).sum();
        Ok(Self {
            busy: total.saturating_sub(idle),
            total,
        })
    }

    /// Busy percentage between an earlier reading and this one.
    pub fn percent_since(&self, earlier: &CpuTimes) -> f32 {
        let total = self.total.saturating_sub(earlier.total);
        if total == 0 {
            return 0.0;
        }
        let busy = self.busy.saturating_sub(earlier.busy);
        ((busy as f64 / total as f64) * 100.0).clamp(0.0, 100.0) as f32
    }
}

/// /proc/stat based sampler. Keeps the previous reading so each call reports
/// utilisation since the last call.
pub struct ProcStatSampler {
    path: &'static str,
    previous: Mutex<Option<CpuTimes>>,
    warmup: Duration,
}

impl ProcStatSampler {
    pub fn new() -> Self {
        Self {
            path: "/proc/stat",
            previous: Mutex::new(None),
            warmup: Duration::from_millis(50),
        }
    }

    fn read(&self) -> Result<CpuTimes, CpuSampleError> {
        let raw = std::fs::read_to_string(self.path)
            .map_err(|e| CpuSampleError::Unavailable(format!("{}: {e}", self.path)))?;
        CpuTimes::parse(&raw)
    }
}

impl Default for ProcStatSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuSampler for ProcStatSampler {
    fn sample(&self) -> Result<f32, CpuSampleError> {
        let mut previous = self.previous.lock();
        let earlier = match *previous {
            Some(times) => times,
            None => {
                let first = self.read()?;
                std::thread::sleep(self.warmup);
                first
            }
        };
        let now = self.read()?;
        *previous = Some(now);
        Ok(now.percent_since(&earlier))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAT_A: &str = "cpu  100 0 100 800 0 0 0 0 0 0\ncpu0 50 0 50 400 0 0 0 0 0 0\n";
    const STAT_B: &str = "cpu  160 0 140 900 0 0 0 0 0 0\ncpu0 80 0 70 450 0 0 0 0 0 0\n";

    #[test]
    fn parses_aggregate_line() {
        let t = CpuTimes::parse(STAT_A).unwrap();
        assert_eq!(t.total, 1000);
        assert_eq!(t.busy, 200);
    }

    #[test]
    fn percent_between_readings() {
        let a = CpuTimes::parse(STAT_A).unwrap();
        let b = CpuTimes::parse(STAT_B).unwrap();
        // busy +100 of total +200
        assert!((b.percent_since(&a) - 50.0).abs() < f32::EPSILON);
        assert_eq!(a.percent_since(&a), 0.0);
    }

    #[test]
    fn rejects_garbage() {
        assert!(CpuTimes::parse("intr 1 2 3").is_err());
        assert!(CpuTimes::parse("cpu  1 x 3 4").is_err());
        assert!(CpuTimes::parse("cpu  1 2").is_err());
    }
}
