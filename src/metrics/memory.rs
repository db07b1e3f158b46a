use std::fs;

use super::MetricsRecord;

/// Memory use as a percentage of capacity.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MemoryUsage {
    pub active: f64,
    pub allocated: f64,
    pub reserved: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MemorySample {
    pub current: MemoryUsage,
    pub peak: MemoryUsage,
}

impl MemorySample {
    /// Adds the `memory_current/*` and `memory_peak/*` keys to `record`.
    pub fn write_into(&self, record: &mut MetricsRecord) {
        for (prefix, usage) in [("memory_current", self.current), ("memory_peak", self.peak)] {
            record.insert(format!("{prefix}/active(%)"), usage.active);
            record.insert(format!("{prefix}/allocated(%)"), usage.allocated);
            record.insert(format!("{prefix}/reserved(%)"), usage.reserved);
        }
    }
}

pub trait MemoryMonitor: Send {
    fn sample(&mut self) -> MemorySample;

    /// Forgets the peaks seen so far.
    fn reset_peak(&mut self);
}

/// Reads this process's memory from `/proc`, relative to physical memory.
///
/// Active is the resident set, allocated the anonymous resident memory and reserved the
/// virtual size. Readings that are unavailable on the platform are reported as zero.
#[derive(Debug, Default)]
pub struct ProcessMemoryMonitor {
    peak: MemoryUsage,
}

impl ProcessMemoryMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    fn read() -> MemoryUsage {
        let status = fs::read_to_string("/proc/self/status").unwrap_or_default();
        let meminfo = fs::read_to_string("/proc/meminfo").unwrap_or_default();
        usage_from_proc(&status, &meminfo)
    }
}

impl MemoryMonitor for ProcessMemoryMonitor {
    fn sample(&mut self) -> MemorySample {
        let current = Self::read();
        let peak = &mut self.peak;
        peak.active = peak.active.max(current.active);
        peak.allocated = peak.allocated.max(current.allocated);
        peak.reserved = peak.reserved.max(current.reserved);

        MemorySample {
            current,
            peak: *peak,
        }
    }

    fn reset_peak(&mut self) {
        self.peak = MemoryUsage::default();
    }
}

/// Value of a `Key:   1234 kB` line, in kB.
fn field_kb(text: &str, key: &str) -> Option<f64> {
    text.lines()
        .find_map(|line| line.strip_prefix(key)?.strip_prefix(':'))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|v| v.parse().ok())
}

fn usage_from_proc(status: &str, meminfo: &str) -> MemoryUsage {
    let Some(total) = field_kb(meminfo, "MemTotal").filter(|t| *t > 0.0) else {
        return MemoryUsage::default();
    };

    let pct = |key| field_kb(status, key).map_or(0.0, |kb| 100.0 * kb / total);
    MemoryUsage {
        active: pct("VmRSS"),
        allocated: pct("RssAnon"),
        reserved: pct("VmSize"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATUS: &str = "Name:\tmesh-train\nVmSize:\t  400000 kB\nVmRSS:\t  100000 kB\nRssAnon:\t   50000 kB\n";
    const MEMINFO: &str = "MemTotal:        1000000 kB\nMemFree:  1 kB\n";

    #[test]
    fn percentages_of_physical_memory() {
        let usage = usage_from_proc(STATUS, MEMINFO);
        assert_eq!(
            usage,
            MemoryUsage {
                active: 10.0,
                allocated: 5.0,
                reserved: 40.0
            }
        );
    }

    #[test]
    fn missing_readings_are_zero() {
        assert_eq!(usage_from_proc(STATUS, ""), MemoryUsage::default());
        let usage = usage_from_proc("VmRSS: 10 kB\n", MEMINFO);
        assert_eq!(usage.active, 0.001);
        assert_eq!(usage.reserved, 0.0);
    }

    #[test]
    fn sample_writes_all_six_keys() {
        let sample = MemorySample {
            current: MemoryUsage {
                active: 1.0,
                allocated: 2.0,
                reserved: 3.0,
            },
            peak: MemoryUsage {
                active: 4.0,
                allocated: 5.0,
                reserved: 6.0,
            },
        };
        let mut record = MetricsRecord::new();
        sample.write_into(&mut record);

        assert_eq!(record.len(), 6);
        assert_eq!(record.get("memory_current/allocated(%)"), Some(2.0));
        assert_eq!(record.get("memory_peak/reserved(%)"), Some(6.0));
    }

    #[test]
    fn peaks_never_decrease_until_reset() {
        let mut monitor = ProcessMemoryMonitor::new();
        let first = monitor.sample();
        let second = monitor.sample();
        assert!(second.peak.active >= first.peak.active);

        monitor.reset_peak();
        assert_eq!(monitor.peak, MemoryUsage::default());
    }
}
