//! The fixed-layout wire event record. This is the byte-for-byte contract
//! carried across the ring buffer; nothing here may move without breaking
//! every consumer.

use bytemuck::{Pod, Zeroable};

/// `event.type` ordinals. Stable: append only, never reorder or reuse.
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub enum EventType {
    Dns = 0,
    Connect = 1,
    TcpSend = 2,
    TcpRecv = 3,
    Write = 4,
    Read = 5,
    Fsync = 6,
    SchedSwitch = 7,
    TcpState = 8,
    PageFault = 9,
    OomKill = 10,
    UdpSend = 11,
    UdpRecv = 12,
    HttpReq = 13,
    HttpResp = 14,
    LockContention = 15,
    TcpRetrans = 16,
    NetDevError = 17,
    DbQuery = 18,
    Exec = 19,
    Fork = 20,
    Open = 21,
    Close = 22,
    TlsHandshake = 23,
    TlsError = 24,
    ResourceLimit = 25,
    PoolAcquire = 26,
    PoolRelease = 27,
    PoolExhausted = 28,
    Unlink = 29,
    Rename = 30,
    FastcgiRequest = 31,
    FastcgiResponse = 32,
    RedisCmd = 33,
    MemcachedCmd = 34,
    KafkaProduce = 35,
    KafkaFetch = 36,
    GrpcMethod = 37,
}

impl EventType {
    /// Total number of defined event kinds; kept in sync with the variant
    /// list above so range checks in `TryFrom` don't drift.
    pub const COUNT: u32 = 38;
}

impl TryFrom<u32> for EventType {
    type Error = ();

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        if value >= Self::COUNT {
            return Err(());
        }
        // SAFETY: `EventType` is `repr(u32)` with contiguous discriminants
        // 0..COUNT, checked above.
        Ok(unsafe { core::mem::transmute::<u32, EventType>(value) })
    }
}

/// The wire event record, 344 bytes, 8-byte aligned, `repr(C)`. Explicit pad
/// fields stand in for what the compiler would otherwise insert implicitly,
/// so `Pod` has no hidden bytes to worry about.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct Event {
    pub timestamp: u64,
    pub pid: u32,
    pub event_type: u32,
    pub latency_ns: u64,
    pub error: i32,
    pub _pad_error: u32,
    pub bytes: u64,
    pub tcp_state: u32,
    pub _pad_tcp_state: u32,
    pub stack_key: u64,
    pub cgroup_id: u64,
    pub comm: [u8; 16],
    pub target: [u8; 128],
    pub details: [u8; 128],
    pub net_ns_id: u32,
    pub _pad: u32,
}

impl Event {
    /// A zeroed event record with the given type already set; callers fill
    /// in the remaining fields before submission.
    pub const fn zeroed_of_type(event_type: EventType) -> Self {
        Self {
            timestamp: 0,
            pid: 0,
            event_type: event_type as u32,
            latency_ns: 0,
            error: 0,
            _pad_error: 0,
            bytes: 0,
            tcp_state: 0,
            _pad_tcp_state: 0,
            stack_key: 0,
            cgroup_id: 0,
            comm: [0; 16],
            target: [0; 128],
            details: [0; 128],
            net_ns_id: 0,
            _pad: 0,
        }
    }

    /// Copies `src` into `target`, NUL-terminating and NUL-padding the rest.
    pub fn set_target(&mut self, src: &[u8]) {
        copy_into_fixed(&mut self.target, src);
    }

    /// Copies `src` into `details`, NUL-terminating and NUL-padding the rest.
    pub fn set_details(&mut self, src: &[u8]) {
        copy_into_fixed(&mut self.details, src);
    }

    /// Copies `src` into `comm`, NUL-terminating and NUL-padding the rest.
    pub fn set_comm(&mut self, src: &[u8]) {
        copy_into_fixed(&mut self.comm, src);
    }
}

/// Copies as many bytes of `src` as fit in `dst`, leaving room for (and
/// writing) a trailing NUL, and zero-pads whatever remains. Used for every
/// fixed string field in the event and the correlation-table values.
pub fn copy_into_fixed(dst: &mut [u8], src: &[u8]) {
    let max = dst.len().saturating_sub(1);
    let n = core::cmp::min(max, src.len());
    dst[..n].copy_from_slice(&src[..n]);
    for b in dst[n..].iter_mut() {
        *b = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::size_of;

    #[test]
    fn layout_is_8_byte_aligned() {
        assert_eq!(size_of::<Event>() % 8, 0, "wire format must be 8-byte aligned");
        assert_eq!(size_of::<Event>(), 344);
    }

    #[test]
    fn event_type_roundtrips_through_u32() {
        for raw in 0..EventType::COUNT {
            let kind = EventType::try_from(raw).expect("valid ordinal");
            assert_eq!(kind as u32, raw);
        }
        assert!(EventType::try_from(EventType::COUNT).is_err());
    }

    #[test]
    fn set_target_nul_terminates_and_pads() {
        let mut e = Event::zeroed_of_type(EventType::Connect);
        e.set_target(b"010.000.000.001:00443");
        assert_eq!(&e.target[..21], b"010.000.000.001:00443");
        assert_eq!(e.target[21], 0);
        assert!(e.target[22..].iter().all(|&b| b == 0));
    }

    #[test]
    fn set_target_truncates_oversized_input() {
        let mut e = Event::zeroed_of_type(EventType::Read);
        let long = [b'a'; 200];
        e.set_target(&long);
        assert_eq!(e.target.len(), 128);
        assert!(e.target[..127].iter().all(|&b| b == b'a'));
        assert_eq!(e.target[127], 0);
    }

    #[cfg(feature = "user")]
    #[test]
    fn event_serde_roundtrip() {
        let mut e = Event::zeroed_of_type(EventType::Read);
        e.pid = 42;
        e.bytes = 4096;
        e.set_target(b"/var/log/a.log");
        let json = serde_json::to_string(&e).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back.pid, 42);
        assert_eq!(back.bytes, 4096);
        assert_eq!(&back.target[..14], b"/var/log/a.log");
    }
}
