//! Runtime-tunable thresholds shared between the loader's config loading and
//! the probes that read them back out of a BPF config map.

/// Default gRPC/HTTP2 port used to pre-seed the port-filter map; overridable
/// via configuration.
pub const DEFAULT_GRPC_PORT: u16 = 50051;

/// The three cgroup alert thresholds, as percentages of a resource's limit.
/// Re-read from the config map on every evaluation rather than compiled in,
/// so an operator can retune without restarting the tracer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct AlertThresholds {
    pub warn_pct: u32,
    pub crit_pct: u32,
    pub emerg_pct: u32,
}

impl AlertThresholds {
    pub const DEFAULT: Self = Self {
        warn_pct: 80,
        crit_pct: 90,
        emerg_pct: 95,
    };
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_tiers() {
        let t = AlertThresholds::default();
        assert_eq!(t.warn_pct, 80);
        assert_eq!(t.crit_pct, 90);
        assert_eq!(t.emerg_pct, 95);
    }
}
