#![cfg_attr(all(feature = "bpf", not(feature = "user")), no_std)]

//! Wire types and pure decode/format helpers shared between the kernel-side
//! probes (`podtrace-ebpf`) and the userspace loader (`podtrace`).
//!
//! Everything in here operates on plain integers and byte slices so it can
//! be unit tested on the host without the BPF toolchain; nothing allocates.

pub mod cgroup;
pub mod config;
pub mod decode;
pub mod event;
pub mod format;
pub mod key;
pub mod pool;

pub use cgroup::{alert_level, utilization_pct, CgroupLimit, ResourceType};
pub use config::{AlertThresholds, DEFAULT_GRPC_PORT};
pub use event::{Event, EventType};
pub use key::make_key;
pub use pool::{DbType, PoolState};

/// Maximum length (including NUL) of any fixed string field copied into an
/// event or a correlation-table value.
pub const MAX_STRING_LEN: usize = 128;

/// Byte counts at or above this are treated as garbage (a signed negative
/// return value re-cast to a huge unsigned) and clamped to 0.
pub const MAX_BYTES_THRESHOLD: u64 = 10 * 1024 * 1024;

/// Minimum latency, in nanoseconds, before a read/write/fsync/off-CPU/lock
/// event is emitted rather than suppressed.
pub const MIN_LATENCY_NS: u64 = 1_000_000;

/// Minimum pool-acquire wait, in nanoseconds, before an exhaustion event is
/// emitted.
pub const POOL_EXHAUSTION_MIN_NS: u64 = 10_000_000;

/// Maximum bytes scanned per FastCGI PARAMS record.
pub const FASTCGI_SCAN_LEN: usize = 200;

/// Maximum bytes inspected per candidate HTTP/2 HEADERS frame.
pub const GRPC_INSPECT_LEN: usize = 50;
