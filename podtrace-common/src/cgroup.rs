//! Cgroup resource-utilization accounting: usage/limit ratios and the
//! three-tier alert classification built on top of them.

/// The resources tracked per cgroup for alerting purposes.
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub enum ResourceType {
    Memory = 0,
    Cpu = 1,
    Pids = 2,
    Io = 3,
}

/// Alert severity tiers, ordered by increasing urgency.
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub enum AlertLevel {
    Ok = 0,
    Warn = 1,
    Crit = 2,
    Emerg = 3,
}

/// A usage/limit pair read from a cgroup's controller files at evaluation
/// time. `limit == 0` means "unlimited" and never alerts.
#[derive(Copy, Clone, Debug, Default)]
pub struct CgroupLimit {
    pub usage: u64,
    pub limit: u64,
}

impl CgroupLimit {
    pub const fn new(usage: u64, limit: u64) -> Self {
        Self { usage, limit }
    }
}

/// Usage as a percentage of limit, `0` when unlimited or when usage is
/// itself `0`, clamped to `100` when usage exceeds limit (common during
/// reclaim, briefly, right before the kernel enforces the limit).
pub fn utilization_pct(limit: CgroupLimit) -> u32 {
    if limit.limit == 0 {
        return 0;
    }
    let pct = (limit.usage as u128 * 100) / limit.limit as u128;
    core::cmp::min(pct, 100) as u32
}

/// Classifies a utilization percentage against the three configured
/// thresholds, re-read every evaluation rather than compiled in so an
/// operator can retune them without restarting.
pub fn alert_level(pct: u32, warn: u32, crit: u32, emerg: u32) -> AlertLevel {
    if pct >= emerg {
        AlertLevel::Emerg
    } else if pct >= crit {
        AlertLevel::Crit
    } else if pct >= warn {
        AlertLevel::Warn
    } else {
        AlertLevel::Ok
    }
}

/// Builds the `"<resource>=<usage>/<limit> (<pct>%)"` details string used in
/// `Event::details` for `ResourceLimit` events.
pub fn resource_details(resource: ResourceType, limit: CgroupLimit, dst: &mut [u8]) -> usize {
    let name: &[u8] = match resource {
        ResourceType::Memory => b"memory",
        ResourceType::Cpu => b"cpu",
        ResourceType::Pids => b"pids",
        ResourceType::Io => b"io",
    };
    let pct = utilization_pct(limit);

    use crate::format::{write_str, write_u64};

    let mut idx = write_str(dst, name);
    idx += write_str(&mut dst[idx..], b"=");
    idx += write_u64(&mut dst[idx..], limit.usage);
    idx += write_str(&mut dst[idx..], b"/");
    idx += write_u64(&mut dst[idx..], limit.limit);
    idx += write_str(&mut dst[idx..], b" (");
    idx += write_u64(&mut dst[idx..], pct as u64);
    idx += write_str(&mut dst[idx..], b"%)");
    idx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_never_alerts() {
        let limit = CgroupLimit::new(1_000_000, 0);
        assert_eq!(utilization_pct(limit), 0);
        assert_eq!(alert_level(0, 80, 90, 95), AlertLevel::Ok);
    }

    #[test]
    fn utilization_is_percentage_of_limit() {
        let limit = CgroupLimit::new(850, 1000);
        assert_eq!(utilization_pct(limit), 85);
    }

    #[test]
    fn utilization_clamps_to_100_over_limit() {
        let limit = CgroupLimit::new(950, 500);
        assert_eq!(utilization_pct(limit), 100);
    }

    #[test]
    fn alert_tiers_respect_default_thresholds() {
        assert_eq!(alert_level(79, 80, 90, 95), AlertLevel::Ok);
        assert_eq!(alert_level(80, 80, 90, 95), AlertLevel::Warn);
        assert_eq!(alert_level(90, 80, 90, 95), AlertLevel::Crit);
        assert_eq!(alert_level(95, 80, 90, 95), AlertLevel::Emerg);
    }

    #[test]
    fn alert_tiers_respect_custom_thresholds() {
        assert_eq!(alert_level(50, 40, 60, 70), AlertLevel::Warn);
        assert_eq!(alert_level(65, 40, 60, 70), AlertLevel::Crit);
    }

    #[test]
    fn resource_details_formats_memory_line() {
        let mut buf = [0u8; 64];
        let n = resource_details(ResourceType::Memory, CgroupLimit::new(850, 1000), &mut buf);
        assert_eq!(&buf[..n], b"memory=850/1000 (85%)");
    }
}
