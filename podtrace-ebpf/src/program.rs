use aya_ebpf::{
    helpers::{
        bpf_get_current_cgroup_id, bpf_get_current_pid_tgid, bpf_ktime_get_ns, bpf_probe_read,
        bpf_probe_read_user,
    },
    macros::{kprobe, kretprobe, map, perf_event, tracepoint, uprobe, uretprobe},
    maps::{Array, HashMap, RingBuf, StackTrace},
    programs::{PerfEventContext, ProbeContext, TracePointContext},
    EbpfContext,
};
use aya_log_ebpf::warn;
use podtrace_common::{
    cgroup::{alert_level, utilization_pct, CgroupLimit},
    config::AlertThresholds,
    decode::{fastcgi, grpc, kafka, memcached, redis},
    key::{calc_latency, make_key},
    pool::{DbType, PoolState},
    Event, EventType, MAX_STRING_LEN,
};

// =============================================================================
// Maps
// =============================================================================

/// The single event egress path. 2 MiB, lossy under sustained overload —
/// callers treat a failed `.output()` as a dropped event, never as a reason
/// to retry or block.
#[map(name = "EVENTS")]
static mut EVENTS: RingBuf = RingBuf::with_byte_size(2 * 1024 * 1024, 0);

#[map(name = "STACK_TRACES")]
static mut STACK_TRACES: StackTrace = StackTrace::with_max_entries(4096, 0);

/// VFS read/write/fsync entry timestamps, keyed by `(pid, tid)`.
#[map(name = "VFS_ENTRY")]
static mut VFS_ENTRY: HashMap<u64, VfsEntry> = HashMap::with_max_entries(65_536, 0);

/// TCP/UDP connect and send/recv entry state, keyed by `(pid, tid)`.
#[map(name = "NET_ENTRY")]
static mut NET_ENTRY: HashMap<u64, NetEntry> = HashMap::with_max_entries(65_536, 0);

/// Off-CPU tracking for `sched_switch`, keyed by the outgoing thread's tid.
#[map(name = "SCHED_ENTRY")]
static mut SCHED_ENTRY: HashMap<u32, u64> = HashMap::with_max_entries(65_536, 0);

/// Futex/mutex contention entry timestamps, keyed by `(pid, tid)`.
#[map(name = "LOCK_ENTRY")]
static mut LOCK_ENTRY: HashMap<u64, LockEntry> = HashMap::with_max_entries(65_536, 0);

/// `do_sys_openat2`/`vfs_unlink`/`vfs_rename`/`__close_fd` entry state.
#[map(name = "FS_ENTRY")]
static mut FS_ENTRY: HashMap<u64, FsEntry> = HashMap::with_max_entries(65_536, 0);

/// Generic per-thread entry timestamp, reused across every kprobe/kretprobe
/// or uprobe/uretprobe pair that just needs "when did the call start":
/// DNS, generic HTTP, DB query, pool acquire-wait, Redis, Memcached, Kafka,
/// and the TCP/UDP send/recv paths. Mirrors the single `start_times` table
/// the probes were originally modeled on.
#[map(name = "START_TIMES")]
static mut START_TIMES: HashMap<u64, u64> = HashMap::with_max_entries(65_536, 0);

/// Last-known `ip:port` for a thread's socket, written on a successful
/// `tcp_v4_connect`/`tcp_v6_connect` and read (never removed) by any later
/// send/recv/protocol probe on that thread that wants a `target` string.
#[map(name = "SOCKET_CONNS")]
static mut SOCKET_CONNS: HashMap<u64, [u8; MAX_STRING_LEN]> = HashMap::with_max_entries(65_536, 0);

/// Hostname argument captured at `getaddrinfo` entry, consumed at its
/// uretprobe.
#[map(name = "DNS_TARGETS")]
static mut DNS_TARGETS: HashMap<u64, [u8; MAX_STRING_LEN]> = HashMap::with_max_entries(65_536, 0);

/// URL argument captured at `http_request` entry, consumed at its
/// uretprobe.
#[map(name = "HTTP_TARGETS")]
static mut HTTP_TARGETS: HashMap<u64, [u8; MAX_STRING_LEN]> = HashMap::with_max_entries(65_536, 0);

/// SQL text's leading verb, captured at `pq_exec`/`mysql_real_query` entry
/// and consumed at exit.
#[map(name = "DB_QUERIES")]
static mut DB_QUERIES: HashMap<u64, [u8; MAX_STRING_LEN]> = HashMap::with_max_entries(65_536, 0);

/// `msghdr*` handed off from `unix_stream_recvmsg`'s kprobe to its
/// kretprobe, since the PARAMS record is only fully written into the
/// iovec once the call has actually copied it in.
#[map(name = "RECVMSG_ARGS")]
static mut RECVMSG_ARGS: HashMap<u64, u64> = HashMap::with_max_entries(65_536, 0);

/// In-flight FastCGI requests, keyed by `(pid, tid) ^ request_id` so the
/// PARAMS record received on one call correlates with the END_REQUEST
/// record sent on a later, unrelated call on the same connection.
#[map(name = "FASTCGI_REQS")]
static mut FASTCGI_REQS: HashMap<u64, FastcgiReqEntry> = HashMap::with_max_entries(4096, 0);

/// gRPC method path scraped off an HTTP/2 HEADERS frame by the dedicated
/// `tcp_sendmsg` scanner, consumed by the generic `tcp_sendmsg` kretprobe
/// so a gRPC call emits both `EVENT_TCP_SEND` and `EVENT_GRPC_METHOD`.
#[map(name = "GRPC_METHODS")]
static mut GRPC_METHODS: HashMap<u64, GrpcMethodEntry> = HashMap::with_max_entries(65_536, 0);

/// Redis command name, captured at `redisCommand`/`redisCommandArgv` entry.
#[map(name = "REDIS_CMDS")]
static mut REDIS_CMDS: HashMap<u64, [u8; 32]> = HashMap::with_max_entries(65_536, 0);

/// Memcached `"<op> <key>"` string, captured at entry of `memcached_get`/
/// `_set`/`_delete`.
#[map(name = "MEMCACHED_OPS")]
static mut MEMCACHED_OPS: HashMap<u64, [u8; MAX_STRING_LEN]> = HashMap::with_max_entries(65_536, 0);

/// Side-channel byte count for calls whose size argument is only known at
/// entry but whose event is emitted at exit: Memcached `set`'s value
/// length, Kafka `produce`'s payload length.
#[map(name = "PROTO_BYTES")]
static mut PROTO_BYTES: HashMap<u64, u64> = HashMap::with_max_entries(65_536, 0);

/// Database client-library query entry timestamps, keyed by `(pid, tid)`.
#[map(name = "DB_ENTRY")]
static mut DB_ENTRY: HashMap<u64, u64> = HashMap::with_max_entries(65_536, 0);

/// Connection-pool acquire/release state, keyed by `(pid, tid)`. A thread
/// only ever holds one pooled connection at a time in the libraries we
/// instrument, so this table never needs more than one entry per thread.
#[map(name = "POOL_STATE")]
static mut POOL_STATE: HashMap<u64, PoolState> = HashMap::with_max_entries(65_536, 0);

/// Acquire timestamp recorded by `try_pool_acquire`, read by a separate
/// query/step probe to measure how long that query actually had to wait
/// for its turn on a pool-wide-exhausted connection.
#[map(name = "POOL_ACQUIRE_TIMES")]
static mut POOL_ACQUIRE_TIMES: HashMap<u64, u64> = HashMap::with_max_entries(65_536, 0);

/// `rd_kafka_topic_t*` to topic-name lookup, populated by
/// `rd_kafka_topic_new` and read by every later produce/poll call on that
/// handle. Independent of the generic correlation tables because the key
/// space here is a pointer, not a thread id, and the mapping outlives any
/// single call.
#[map(name = "KAFKA_TOPICS")]
static mut KAFKA_TOPICS: HashMap<u64, [u8; 64]> = HashMap::with_max_entries(4096, 0);

/// Single-element config array: `[grpc_port]`. Populated by the loader at
/// startup; probes re-read it on every packet rather than hardcoding the
/// port, so an operator can retarget without rebuilding.
#[map(name = "CONFIG")]
static mut CONFIG: Array<u32> = Array::with_max_entries(1, 0);

/// Per-cgroup memory usage/limit pairs, written by the loader from periodic
/// `/sys/fs/cgroup` reads and evaluated here on every sample tick.
///
/// Split from CPU into its own map (rather than one `CGROUP_LIMITS` table
/// keyed by cgroup id alone) because a cgroup can have both a `memory.max`
/// and a `cpu.max` quota configured at once; a single-slot-per-cgroup table
/// would have the CPU write silently clobber the memory entry (or vice
/// versa) every tick, permanently hiding whichever resource lost the race.
#[map(name = "CGROUP_LIMITS_MEM")]
static mut CGROUP_LIMITS_MEM: HashMap<u64, CgroupLimitEntry> = HashMap::with_max_entries(4096, 0);

/// Per-cgroup CPU usage/limit pairs. See `CGROUP_LIMITS_MEM`.
#[map(name = "CGROUP_LIMITS_CPU")]
static mut CGROUP_LIMITS_CPU: HashMap<u64, CgroupLimitEntry> = HashMap::with_max_entries(4096, 0);

/// Last alert level emitted per `(cgroup_id, resource)` pair, keyed by
/// `(cgroup_id << 2) | resource_wire` so memory and CPU alerts for the same
/// cgroup don't overwrite each other; cleared when utilization drops back to
/// 0 so a quiet resource doesn't linger in the map forever.
#[map(name = "CGROUP_ALERTS")]
static mut CGROUP_ALERTS: HashMap<u64, u32> = HashMap::with_max_entries(8192, 0);

/// `[warn_pct, crit_pct, emerg_pct]`, re-read on every evaluation so the
/// loader can retune thresholds without a reload.
#[map(name = "ALERT_THRESHOLDS")]
static mut ALERT_THRESHOLDS: Array<u32> = Array::with_max_entries(3, 0);

#[repr(C)]
#[derive(Copy, Clone)]
struct CgroupLimitEntry {
    usage: u64,
    limit: u64,
}

#[repr(C)]
#[derive(Copy, Clone)]
struct FastcgiReqEntry {
    start_ns: u64,
    uri: [u8; MAX_STRING_LEN],
    uri_len: u32,
    method: [u8; 16],
    method_len: u32,
}

#[repr(C)]
#[derive(Copy, Clone)]
struct GrpcMethodEntry {
    path: [u8; MAX_STRING_LEN],
    len: u32,
}

#[repr(C)]
#[derive(Copy, Clone)]
struct VfsEntry {
    start: u64,
    op: u32,
}

#[repr(C)]
#[derive(Copy, Clone)]
struct NetEntry {
    start: u64,
    addr_v4: u32,
    addr_v6: [u8; 16],
    port: u16,
    is_v6: u8,
}

#[repr(C)]
#[derive(Copy, Clone)]
struct LockEntry {
    start: u64,
    identity: u64,
}

#[repr(C)]
#[derive(Copy, Clone)]
struct FsEntry {
    start: u64,
    path: [u8; MAX_STRING_LEN],
    path_len: u32,
}

// =============================================================================
// Shared helpers
// =============================================================================

#[inline(always)]
fn current_key() -> u64 {
    let pid_tgid = unsafe { bpf_get_current_pid_tgid() };
    make_key((pid_tgid >> 32) as u32, pid_tgid as u32)
}

#[inline(always)]
fn current_pid() -> u32 {
    (unsafe { bpf_get_current_pid_tgid() } >> 32) as u32
}

#[inline(always)]
fn now() -> u64 {
    unsafe { bpf_ktime_get_ns() }
}

fn submit(event: &Event) {
    let ring = unsafe { &mut EVENTS };
    // Ring buffer full: drop the event. No per-event logging on this path —
    // it's the hottest path in the whole program and under the load that
    // causes drops, the log ring would just become the next thing to drop.
    let _ = ring.output(event, 0);
}

/// Captures the user-space call stack for `ctx` and returns the value to
/// stash in `Event::stack_key`: the `STACK_TRACES` stack id plus one, so 0
/// unambiguously means "no stack captured" (a raw id of 0 is valid).
fn capture_stack<C: EbpfContext>(ctx: &C, _key: u64, _ts: u64) -> u64 {
    const BPF_F_USER_STACK: u64 = 0x100;
    let stack_id = unsafe { STACK_TRACES.get_stackid(ctx, BPF_F_USER_STACK) };
    match stack_id {
        Ok(id) if id >= 0 => (id as u64) + 1,
        _ => 0,
    }
}

fn fill_comm<C: EbpfContext>(ctx: &C, event: &mut Event) {
    if let Ok(name) = ctx.command() {
        event.set_comm(&name);
    }
}

fn configured_grpc_port() -> u16 {
    unsafe { CONFIG.get(0).copied().unwrap_or(podtrace_common::config::DEFAULT_GRPC_PORT as u32) as u16 }
}

// `struct msghdr` (include/linux/socket.h): `msg_iter` (a `struct iov_iter`)
// sits at offset 40 on x86_64; the iterator's `__iov` member (`const struct
// iovec *`) sits at offset 16 within it. `struct iovec` is `{ iov_base,
// iov_len }`, two back-to-back 8-byte fields. Same raw-offset approach as
// `try_connect_entry` above: read defensively, bail on anything that
// doesn't look like a real pointer.
const MSGHDR_MSG_ITER_OFFSET: usize = 40;
const IOV_ITER_IOV_OFFSET: usize = 16;
const IOVEC_BASE_OFFSET: usize = 0;
const IOVEC_LEN_OFFSET: usize = 8;

/// Dereferences a kernel `struct msghdr *` down to the user-space payload
/// pointer and length of its first iovec segment.
fn read_msghdr_iovec(msg: *const u8) -> Option<(*const u8, usize)> {
    if msg.is_null() {
        return None;
    }
    let iter = unsafe { msg.add(MSGHDR_MSG_ITER_OFFSET) };
    let iov_ptr: u64 = unsafe { bpf_probe_read(iter.add(IOV_ITER_IOV_OFFSET) as *const u64) }.ok()?;
    if iov_ptr == 0 {
        return None;
    }
    let iov = iov_ptr as *const u8;
    let iov_base: u64 = unsafe { bpf_probe_read(iov.add(IOVEC_BASE_OFFSET) as *const u64) }.ok()?;
    let iov_len: u64 = unsafe { bpf_probe_read(iov.add(IOVEC_LEN_OFFSET) as *const u64) }.ok()?;
    if iov_base == 0 || iov_len == 0 {
        return None;
    }
    Some((iov_base as *const u8, iov_len as usize))
}

// =============================================================================
// Filesystem: vfs_read / vfs_write / vfs_fsync
// =============================================================================

#[kprobe]
pub fn vfs_read(ctx: ProbeContext) -> u32 {
    try_vfs_entry(&ctx, 0).map_or(1, |_| 0)
}

#[kprobe]
pub fn vfs_write(ctx: ProbeContext) -> u32 {
    try_vfs_entry(&ctx, 1).map_or(1, |_| 0)
}

#[kprobe]
pub fn vfs_fsync(ctx: ProbeContext) -> u32 {
    try_vfs_entry(&ctx, 2).map_or(1, |_| 0)
}

fn try_vfs_entry(ctx: &ProbeContext, op: u32) -> Result<(), i64> {
    let key = current_key();
    let entry = VfsEntry { start: now(), op };
    unsafe { VFS_ENTRY.insert(&key, &entry, 0) }.map_err(|_| 1i64)
}

#[kretprobe]
pub fn vfs_read_ret(ctx: ProbeContext) -> u32 {
    try_vfs_exit(&ctx, EventType::Read).map_or(1, |_| 0)
}

#[kretprobe]
pub fn vfs_write_ret(ctx: ProbeContext) -> u32 {
    try_vfs_exit(&ctx, EventType::Write).map_or(1, |_| 0)
}

#[kretprobe]
pub fn vfs_fsync_ret(ctx: ProbeContext) -> u32 {
    try_vfs_exit(&ctx, EventType::Fsync).map_or(1, |_| 0)
}

/// Shared by read/write/fsync exits. Always removes the table entry, even
/// when the latency falls below `MIN_LATENCY_NS` and no event is emitted,
/// so a thread that never crosses the threshold never leaks an entry.
fn try_vfs_exit(ctx: &ProbeContext, event_type: EventType) -> Result<(), i64> {
    let key = current_key();
    let entry = unsafe { VFS_ENTRY.get(&key).copied() };
    unsafe { VFS_ENTRY.remove(&key) }.ok();

    let Some(entry) = entry else {
        return Ok(());
    };

    let ts = now();
    let latency = calc_latency(ts, entry.start);
    if latency < podtrace_common::MIN_LATENCY_NS {
        return Ok(());
    }

    let ret: i64 = ctx.ret().unwrap_or(0);
    let bytes = if ret > 0 { ret as u64 } else { 0 };
    let error = if ret < 0 { ret as i32 } else { 0 };

    let mut event = Event::zeroed_of_type(event_type);
    event.timestamp = ts;
    event.pid = current_pid();
    event.latency_ns = latency;
    event.bytes = core::cmp::min(bytes, podtrace_common::MAX_BYTES_THRESHOLD);
    event.error = error;
    event.stack_key = capture_stack(ctx, key, ts);
    fill_comm(ctx, &mut event);
    submit(&event);
    Ok(())
}

// =============================================================================
// Filesystem: open / close / unlink / rename
// =============================================================================

// `struct filename` (fs/internal.h): `name` (the resolved, already kernel-
// copied path) is its first word.
const FILENAME_NAME_OFFSET: usize = 0;

// `struct dentry`: `d_name` (a `struct qstr`) at offset 24 on modern (5.x+)
// x86_64 kernels; `qstr.name` (the actual `const unsigned char *`) is the
// second word of the qstr, offset 8 in.
const DENTRY_D_NAME_OFFSET: usize = 24;
const QSTR_NAME_OFFSET: usize = 8;

// `struct renamedata` (fs/namei.c, kernels >= 5.12): `old_dentry` is the
// third word, after `old_mnt_idmap` and `old_dir`.
const RENAMEDATA_OLD_DENTRY_OFFSET: usize = 16;

/// Reads the NUL-terminated path string a kernel `struct filename *`
/// points to.
fn read_filename_path(filename_ptr: *const u8) -> Option<[u8; MAX_STRING_LEN]> {
    if filename_ptr.is_null() {
        return None;
    }
    let name_ptr: u64 =
        unsafe { bpf_probe_read(filename_ptr.add(FILENAME_NAME_OFFSET) as *const u64) }.ok()?;
    if name_ptr == 0 {
        return None;
    }
    unsafe { bpf_probe_read(name_ptr as *const [u8; MAX_STRING_LEN]) }.ok()
}

/// Reads a `struct dentry *`'s `d_name`, the file/directory's basename
/// (not a full path — the vfs layer doesn't carry one at this point).
fn read_dentry_name(dentry_ptr: *const u8) -> Option<[u8; MAX_STRING_LEN]> {
    if dentry_ptr.is_null() {
        return None;
    }
    let qstr = unsafe { dentry_ptr.add(DENTRY_D_NAME_OFFSET) };
    let name_ptr: u64 = unsafe { bpf_probe_read(qstr.add(QSTR_NAME_OFFSET) as *const u64) }.ok()?;
    if name_ptr == 0 {
        return None;
    }
    unsafe { bpf_probe_read(name_ptr as *const [u8; MAX_STRING_LEN]) }.ok()
}

#[kprobe]
pub fn do_sys_openat2(ctx: ProbeContext) -> u32 {
    let filename_ptr: *const u8 = ctx.arg(1).unwrap_or(core::ptr::null());
    try_fs_entry(&ctx, read_filename_path(filename_ptr)).map_or(1, |_| 0)
}

#[kprobe]
pub fn vfs_unlink(ctx: ProbeContext) -> u32 {
    let dentry_ptr: *const u8 = ctx.arg(1).unwrap_or(core::ptr::null());
    try_fs_entry(&ctx, read_dentry_name(dentry_ptr)).map_or(1, |_| 0)
}

#[kprobe]
pub fn vfs_rename(ctx: ProbeContext) -> u32 {
    let rd_ptr: *const u8 = ctx.arg(0).unwrap_or(core::ptr::null());
    let old_dentry_ptr: u64 = if rd_ptr.is_null() {
        0
    } else {
        unsafe { bpf_probe_read(rd_ptr.add(RENAMEDATA_OLD_DENTRY_OFFSET) as *const u64) }
            .unwrap_or(0)
    };
    try_fs_entry(&ctx, read_dentry_name(old_dentry_ptr as *const u8)).map_or(1, |_| 0)
}

fn try_fs_entry(ctx: &ProbeContext, path: Option<[u8; MAX_STRING_LEN]>) -> Result<(), i64> {
    let key = current_key();
    let (path, path_len) = match path {
        Some(p) => {
            let len = podtrace_common::format::cstr_len(&p) as u32;
            (p, len)
        }
        None => ([0u8; MAX_STRING_LEN], 0),
    };
    let entry = FsEntry {
        start: now(),
        path,
        path_len,
    };
    unsafe { FS_ENTRY.insert(&key, &entry, 0) }.map_err(|_| 1i64)
}

/// `__close_fd` is kprobe-only: the fd being closed is an argument, not a
/// return value, so there's nothing a kretprobe would add here.
#[kprobe(name = "__close_fd")]
pub fn close_fd(ctx: ProbeContext) -> u32 {
    let fd: u32 = ctx.arg(1).unwrap_or(0);
    let mut event = Event::zeroed_of_type(EventType::Close);
    event.timestamp = now();
    event.pid = current_pid();
    event.bytes = fd as u64;
    fill_comm(&ctx, &mut event);
    submit(&event);
    0
}

#[kretprobe]
pub fn do_sys_openat2_ret(ctx: ProbeContext) -> u32 {
    try_fs_exit(&ctx, EventType::Open).map_or(1, |_| 0)
}

#[kretprobe]
pub fn vfs_unlink_ret(ctx: ProbeContext) -> u32 {
    try_fs_exit(&ctx, EventType::Unlink).map_or(1, |_| 0)
}

#[kretprobe]
pub fn vfs_rename_ret(ctx: ProbeContext) -> u32 {
    try_fs_exit(&ctx, EventType::Rename).map_or(1, |_| 0)
}

fn try_fs_exit(ctx: &ProbeContext, event_type: EventType) -> Result<(), i64> {
    let key = current_key();
    let entry = unsafe { FS_ENTRY.get(&key).copied() };
    unsafe { FS_ENTRY.remove(&key) }.ok();

    let Some(entry) = entry else {
        return Ok(());
    };

    let ts = now();
    let ret: i64 = ctx.ret().unwrap_or(0);

    let mut event = Event::zeroed_of_type(event_type);
    event.timestamp = ts;
    event.pid = current_pid();
    event.latency_ns = calc_latency(ts, entry.start);
    event.error = if ret < 0 { ret as i32 } else { 0 };
    if event_type == EventType::Open && ret >= 0 {
        event.bytes = ret as u64;
    }
    if entry.path_len > 0 {
        event.set_target(&entry.path[..entry.path_len as usize]);
    }
    fill_comm(ctx, &mut event);
    submit(&event);
    Ok(())
}

// =============================================================================
// Process lifecycle: exec / fork
// =============================================================================

#[kprobe]
pub fn do_execveat_common(ctx: ProbeContext) -> u32 {
    let mut event = Event::zeroed_of_type(EventType::Exec);
    event.timestamp = now();
    event.pid = current_pid();
    fill_comm(&ctx, &mut event);
    if ctx.command().is_err() {
        warn!(&ctx, "exec probe: could not read comm");
    }
    submit(&event);
    0
}

#[tracepoint]
pub fn sched_process_fork(ctx: TracePointContext) -> u32 {
    try_sched_process_fork(&ctx).map_or(1, |_| 0)
}

fn try_sched_process_fork(ctx: &TracePointContext) -> Result<(), i64> {
    // `sched_process_fork` tracepoint layout: parent_pid@24, child_pid@44
    // (after the 8-byte common header + comm fields); read defensively.
    let child_pid: i32 = unsafe { ctx.read_at(44).map_err(|_| 1i64)? };

    let mut event = Event::zeroed_of_type(EventType::Fork);
    event.timestamp = now();
    event.pid = child_pid as u32;
    submit(&event);
    Ok(())
}

// =============================================================================
// Scheduling: sched_switch / futex / pthread mutex contention
// =============================================================================

#[tracepoint]
pub fn sched_switch(ctx: TracePointContext) -> u32 {
    try_sched_switch(&ctx).map_or(1, |_| 0)
}

fn try_sched_switch(ctx: &TracePointContext) -> Result<(), i64> {
    // `sched/sched_switch` layout: prev_pid@24, next_pid@52 in the common
    // tracing format; see `sched_process_fork` above for the same pattern.
    let prev_pid: i32 = unsafe { ctx.read_at(24).map_err(|_| 1i64)? };
    let next_pid: i32 = unsafe { ctx.read_at(52).map_err(|_| 1i64)? };
    let ts = now();

    unsafe { SCHED_ENTRY.insert(&(prev_pid as u32), &ts, 0) }.ok();

    let off_start = unsafe { SCHED_ENTRY.get(&(next_pid as u32)).copied() };
    if let Some(start) = off_start {
        unsafe { SCHED_ENTRY.remove(&(next_pid as u32)) }.ok();
        let latency = calc_latency(ts, start);
        if latency >= podtrace_common::MIN_LATENCY_NS {
            let mut event = Event::zeroed_of_type(EventType::SchedSwitch);
            event.timestamp = ts;
            event.pid = next_pid as u32;
            event.latency_ns = latency;
            submit(&event);
        }
    }
    Ok(())
}

#[kprobe]
pub fn do_futex(ctx: ProbeContext) -> u32 {
    try_lock_entry(&ctx, 0).map_or(1, |_| 0)
}

#[kprobe]
pub fn pthread_mutex_lock(ctx: ProbeContext) -> u32 {
    try_lock_entry(&ctx, 1).map_or(1, |_| 0)
}

fn try_lock_entry(ctx: &ProbeContext, arg_index: u32) -> Result<(), i64> {
    let identity: u64 = ctx.arg(arg_index as usize).unwrap_or(0);
    let key = current_key();
    let entry = LockEntry {
        start: now(),
        identity,
    };
    unsafe { LOCK_ENTRY.insert(&key, &entry, 0) }.map_err(|_| 1i64)
}

#[kretprobe]
pub fn do_futex_ret(ctx: ProbeContext) -> u32 {
    try_lock_exit(&ctx, false).map_or(1, |_| 0)
}

#[kretprobe]
pub fn pthread_mutex_lock_ret(ctx: ProbeContext) -> u32 {
    try_lock_exit(&ctx, true).map_or(1, |_| 0)
}

fn try_lock_exit(ctx: &ProbeContext, is_mutex: bool) -> Result<(), i64> {
    let key = current_key();
    let entry = unsafe { LOCK_ENTRY.get(&key).copied() };
    unsafe { LOCK_ENTRY.remove(&key) }.ok();

    let Some(entry) = entry else {
        return Ok(());
    };

    let ts = now();
    let latency = calc_latency(ts, entry.start);
    if latency < podtrace_common::MIN_LATENCY_NS {
        return Ok(());
    }

    let mut event = Event::zeroed_of_type(EventType::LockContention);
    event.timestamp = ts;
    event.pid = current_pid();
    event.latency_ns = latency;

    let mut identity_buf = [0u8; 32];
    let n = if is_mutex {
        podtrace_common::format::format_mutex_identity(entry.identity, &mut identity_buf)
    } else {
        podtrace_common::format::format_futex_identity(entry.identity, &mut identity_buf)
    };
    event.set_target(&identity_buf[..n]);
    event.stack_key = capture_stack(ctx, key, ts);
    submit(&event);
    Ok(())
}

// =============================================================================
// Memory: page faults / OOM kill
// =============================================================================

#[tracepoint]
pub fn page_fault_user(ctx: TracePointContext) -> u32 {
    let mut event = Event::zeroed_of_type(EventType::PageFault);
    event.timestamp = now();
    event.pid = current_pid();
    event.error = 0;
    submit(&event);
    0
}

#[kprobe]
pub fn oom_kill_process(ctx: ProbeContext) -> u32 {
    let mut event = Event::zeroed_of_type(EventType::OomKill);
    event.timestamp = now();
    event.pid = current_pid();
    fill_comm(&ctx, &mut event);
    submit(&event);
    0
}

// =============================================================================
// Network: connect / send / recv / state / retransmit / net_dev
// =============================================================================

#[kprobe]
pub fn tcp_v4_connect(ctx: ProbeContext) -> u32 {
    try_connect_entry(&ctx, false).map_or(1, |_| 0)
}

#[kprobe]
pub fn tcp_v6_connect(ctx: ProbeContext) -> u32 {
    try_connect_entry(&ctx, true).map_or(1, |_| 0)
}

fn try_connect_entry(ctx: &ProbeContext, is_v6: bool) -> Result<(), i64> {
    // arg1 is `struct sock *`; `sk_common.skc_daddr`/`skc_dport` live at
    // well-known offsets for v4, `skc_v6_daddr` for v6. Offsets are read
    // defensively; a failed read just skips population of that field.
    let sk: *const u8 = ctx.arg(0).ok_or(1i64)?;
    let mut entry = NetEntry {
        start: now(),
        addr_v4: 0,
        addr_v6: [0; 16],
        port: 0,
        is_v6: is_v6 as u8,
    };

    if is_v6 {
        if let Ok(addr) = unsafe { bpf_probe_read(sk.add(SKC_V6_DADDR_OFFSET) as *const [u8; 16]) } {
            entry.addr_v6 = addr;
        }
    } else if let Ok(addr) = unsafe { bpf_probe_read(sk.add(SKC_DADDR_OFFSET) as *const u32) } {
        entry.addr_v4 = addr;
    }
    if let Ok(port) = unsafe { bpf_probe_read(sk.add(SKC_DPORT_OFFSET) as *const u16) } {
        entry.port = u16::from_be(port);
    }

    let key = current_key();
    unsafe { NET_ENTRY.insert(&key, &entry, 0) }.map_err(|_| 1i64)
}

const SKC_DADDR_OFFSET: usize = 4;
const SKC_V6_DADDR_OFFSET: usize = 24;
const SKC_DPORT_OFFSET: usize = 12;

#[kretprobe]
pub fn tcp_v4_connect_ret(ctx: ProbeContext) -> u32 {
    try_connect_exit(&ctx).map_or(1, |_| 0)
}

#[kretprobe]
pub fn tcp_v6_connect_ret(ctx: ProbeContext) -> u32 {
    try_connect_exit(&ctx).map_or(1, |_| 0)
}

fn try_connect_exit(ctx: &ProbeContext) -> Result<(), i64> {
    let key = current_key();
    let entry = unsafe { NET_ENTRY.get(&key).copied() };
    unsafe { NET_ENTRY.remove(&key) }.ok();

    let Some(entry) = entry else {
        return Ok(());
    };

    let ts = now();
    let ret: i64 = ctx.ret().unwrap_or(0);

    let mut event = Event::zeroed_of_type(EventType::Connect);
    event.timestamp = ts;
    event.pid = current_pid();
    event.latency_ns = calc_latency(ts, entry.start);
    event.error = if ret < 0 { ret as i32 } else { 0 };

    let mut target = [0u8; MAX_STRING_LEN];
    let n = if entry.is_v6 != 0 {
        podtrace_common::format::format_ipv6_port(&entry.addr_v6, entry.port, &mut target)
    } else {
        podtrace_common::format::format_ipv4_port(entry.addr_v4, entry.port, &mut target)
    };
    event.set_target(&target[..n]);
    if ret == 0 {
        unsafe { SOCKET_CONNS.insert(&key, &target, 0) }.ok();
    }
    fill_comm(ctx, &mut event);
    submit(&event);
    Ok(())
}

#[kprobe]
pub fn tcp_sendmsg(ctx: ProbeContext) -> u32 {
    try_net_io_entry(&ctx).map_or(1, |_| 0)
}

#[kprobe]
pub fn tcp_recvmsg(ctx: ProbeContext) -> u32 {
    try_net_io_entry(&ctx).map_or(1, |_| 0)
}

#[kprobe]
pub fn udp_sendmsg(ctx: ProbeContext) -> u32 {
    try_net_io_entry(&ctx).map_or(1, |_| 0)
}

#[kprobe]
pub fn udp_recvmsg(ctx: ProbeContext) -> u32 {
    try_net_io_entry(&ctx).map_or(1, |_| 0)
}

/// Shared entry half for the four send/recv probes: just arms the timer.
/// The size actually transferred is only known at return (a `sendmsg`/
/// `recvmsg` requested length and its return value routinely differ).
fn try_net_io_entry(ctx: &ProbeContext) -> Result<(), i64> {
    let _ = ctx;
    let key = current_key();
    unsafe { START_TIMES.insert(&key, &now(), 0) }.map_err(|_| 1i64)
}

#[kretprobe]
pub fn tcp_sendmsg_ret(ctx: ProbeContext) -> u32 {
    try_net_io_exit(&ctx, EventType::TcpSend, true).map_or(1, |_| 0)
}

#[kretprobe]
pub fn tcp_recvmsg_ret(ctx: ProbeContext) -> u32 {
    try_net_io_exit(&ctx, EventType::TcpRecv, true).map_or(1, |_| 0)
}

#[kretprobe]
pub fn udp_sendmsg_ret(ctx: ProbeContext) -> u32 {
    try_net_io_exit(&ctx, EventType::UdpSend, false).map_or(1, |_| 0)
}

#[kretprobe]
pub fn udp_recvmsg_ret(ctx: ProbeContext) -> u32 {
    try_net_io_exit(&ctx, EventType::UdpRecv, false).map_or(1, |_| 0)
}

/// Shared exit half. `with_target` is only set for TCP: UDP is
/// connectionless, so there's no `SOCKET_CONNS` entry worth looking up.
fn try_net_io_exit(ctx: &ProbeContext, event_type: EventType, with_target: bool) -> Result<(), i64> {
    let key = current_key();
    let start = unsafe { START_TIMES.get(&key).copied() };
    unsafe { START_TIMES.remove(&key) }.ok();

    let Some(start) = start else {
        return Ok(());
    };

    let ts = now();
    let ret: i64 = ctx.ret().unwrap_or(0);
    let bytes = if ret > 0 { ret as u64 } else { 0 };

    let mut event = Event::zeroed_of_type(event_type);
    event.timestamp = ts;
    event.pid = current_pid();
    event.latency_ns = calc_latency(ts, start);
    event.bytes = core::cmp::min(bytes, podtrace_common::MAX_BYTES_THRESHOLD);
    event.error = if ret < 0 { ret as i32 } else { 0 };
    if with_target {
        if let Some(target) = unsafe { SOCKET_CONNS.get(&key).copied() } {
            let n = podtrace_common::format::cstr_len(&target);
            event.set_target(&target[..n]);
        }
    }
    fill_comm(ctx, &mut event);
    submit(&event);

    if event_type == EventType::TcpSend {
        if let Some(method) = unsafe { GRPC_METHODS.get(&key).copied() } {
            unsafe { GRPC_METHODS.remove(&key) }.ok();
            let mut grpc_event = Event::zeroed_of_type(EventType::GrpcMethod);
            grpc_event.timestamp = ts;
            grpc_event.pid = current_pid();
            grpc_event.set_target(&method.path[..method.len as usize]);
            fill_comm(ctx, &mut grpc_event);
            submit(&grpc_event);
        }
    }
    Ok(())
}

#[kprobe]
pub fn tcp_set_state(ctx: ProbeContext) -> u32 {
    let state: u32 = ctx.arg(1).unwrap_or(0);
    let mut event = Event::zeroed_of_type(EventType::TcpState);
    event.timestamp = now();
    event.pid = current_pid();
    event.tcp_state = state;
    submit(&event);
    0
}

#[kprobe]
pub fn tcp_retransmit_skb(ctx: ProbeContext) -> u32 {
    let mut event = Event::zeroed_of_type(EventType::TcpRetrans);
    event.timestamp = now();
    event.pid = current_pid();
    submit(&event);
    0
}

#[tracepoint]
pub fn net_dev_xmit(ctx: TracePointContext) -> u32 {
    // `net/net_dev_xmit`: `rc` (the driver return code) indicates failure
    // when non-zero; only emitted on that path, per the attachment table.
    let rc: i32 = unsafe { ctx.read_at(32).unwrap_or(0) };
    if rc == 0 {
        return 0;
    }
    let mut event = Event::zeroed_of_type(EventType::NetDevError);
    event.timestamp = now();
    event.error = rc;
    submit(&event);
    0
}

#[uprobe]
pub fn getaddrinfo(ctx: ProbeContext) -> u32 {
    let key = current_key();
    unsafe { DB_ENTRY.insert(&key, &now(), 0) }.ok();

    let host_ptr: *const u8 = ctx.arg(0).unwrap_or(core::ptr::null());
    if !host_ptr.is_null() {
        if let Ok(host) = unsafe { bpf_probe_read_user::<[u8; MAX_STRING_LEN]>(host_ptr as *const _) } {
            unsafe { DNS_TARGETS.insert(&key, &host, 0) }.ok();
        }
    }
    0
}

#[uretprobe]
pub fn getaddrinfo_ret(ctx: ProbeContext) -> u32 {
    let key = current_key();
    let start = unsafe { DB_ENTRY.get(&key).copied() };
    unsafe { DB_ENTRY.remove(&key) }.ok();

    let Some(start) = start else {
        return 0;
    };
    let ts = now();
    let ret: i64 = ctx.ret().unwrap_or(0);

    let mut event = Event::zeroed_of_type(EventType::Dns);
    event.timestamp = ts;
    event.pid = current_pid();
    event.latency_ns = calc_latency(ts, start);
    event.error = if ret != 0 { ret as i32 } else { 0 };
    if let Some(host) = unsafe { DNS_TARGETS.get(&key).copied() } {
        unsafe { DNS_TARGETS.remove(&key) }.ok();
        let n = podtrace_common::format::cstr_len(&host);
        event.set_target(&host[..n]);
    }
    submit(&event);
    0
}

// =============================================================================
// HTTP request/response (generic, header-line based) and gRPC-over-HTTP/2
// =============================================================================

#[uprobe]
pub fn http_request(ctx: ProbeContext) -> u32 {
    try_http_request_entry(&ctx).map_or(1, |_| 0)
}

fn try_http_request_entry(ctx: &ProbeContext) -> Result<(), i64> {
    let key = current_key();
    unsafe { START_TIMES.insert(&key, &now(), 0) }.ok();

    let url_ptr: *const u8 = ctx.arg(0).unwrap_or(core::ptr::null());
    if !url_ptr.is_null() {
        if let Ok(url) = unsafe { bpf_probe_read_user::<[u8; MAX_STRING_LEN]>(url_ptr as *const _) } {
            unsafe { HTTP_TARGETS.insert(&key, &url, 0) }.ok();
        }
    }
    Ok(())
}

#[uretprobe]
pub fn http_request_ret(ctx: ProbeContext) -> u32 {
    try_http_request_exit(&ctx).map_or(1, |_| 0)
}

fn try_http_request_exit(ctx: &ProbeContext) -> Result<(), i64> {
    let key = current_key();
    let start = unsafe { START_TIMES.get(&key).copied() };
    unsafe { START_TIMES.remove(&key) }.ok();
    let Some(start) = start else {
        return Ok(());
    };

    let ts = now();
    let mut event = Event::zeroed_of_type(EventType::HttpReq);
    event.timestamp = ts;
    event.pid = current_pid();
    event.latency_ns = calc_latency(ts, start);

    if let Some(url) = unsafe { HTTP_TARGETS.get(&key).copied() } {
        unsafe { HTTP_TARGETS.remove(&key) }.ok();
        let n = podtrace_common::format::cstr_len(&url);
        event.set_target(&url[..n]);
    }
    fill_comm(ctx, &mut event);
    submit(&event);
    Ok(())
}

#[uprobe]
pub fn http_response(ctx: ProbeContext) -> u32 {
    let key = current_key();
    unsafe { START_TIMES.insert(&key, &now(), 0) }.ok();
    0
}

#[uretprobe]
pub fn http_response_ret(ctx: ProbeContext) -> u32 {
    let key = current_key();
    let start = unsafe { START_TIMES.get(&key).copied() };
    unsafe { START_TIMES.remove(&key) }.ok();
    let Some(start) = start else {
        return 0;
    };

    let ts = now();
    let ret: i64 = ctx.ret().unwrap_or(0);
    let bytes = if ret > 0 { ret as u64 } else { 0 };

    let mut event = Event::zeroed_of_type(EventType::HttpResp);
    event.timestamp = ts;
    event.pid = current_pid();
    event.latency_ns = calc_latency(ts, start);
    event.bytes = core::cmp::min(bytes, podtrace_common::MAX_BYTES_THRESHOLD);
    event.error = if ret < 0 { ret as i32 } else { 0 };
    fill_comm(&ctx, &mut event);
    submit(&event);
    0
}

/// A second, non-emitting probe on `tcp_sendmsg`: only populates
/// `GRPC_METHODS` for the thread to consume when the generic `tcp_sendmsg`
/// kretprobe emits `EVENT_TCP_SEND`. Keeping the scan out of the generic
/// entry probe means non-gRPC traffic never pays for the iovec dereference.
#[kprobe]
pub fn tcp_sendmsg_grpc(ctx: ProbeContext) -> u32 {
    try_grpc_scan(&ctx).map_or(1, |_| 0)
}

fn try_grpc_scan(ctx: &ProbeContext) -> Result<(), i64> {
    let dport = configured_grpc_port();
    let sk: *const u8 = ctx.arg(0).ok_or(1i64)?;
    let port: u16 = unsafe {
        bpf_probe_read(sk.add(SKC_DPORT_OFFSET) as *const u16)
            .map(u16::from_be)
            .unwrap_or(0)
    };
    if port != dport {
        return Ok(());
    }

    let msg: *const u8 = ctx.arg(1).unwrap_or(core::ptr::null());
    let Some((iov_base, iov_len)) = read_msghdr_iovec(msg) else {
        return Ok(());
    };
    if iov_len < 9 {
        return Ok(());
    }

    let window: [u8; podtrace_common::GRPC_INSPECT_LEN + 9] =
        match unsafe { bpf_probe_read_user(iov_base as *const _) } {
            Ok(buf) => buf,
            Err(_) => return Ok(()),
        };

    let Some(header) = grpc::parse_frame_header(&window) else {
        return Ok(());
    };
    if !grpc::is_headers_frame(&header) {
        return Ok(());
    }

    let mut path = [0u8; MAX_STRING_LEN];
    let n = grpc::extract_grpc_path(&window[9..], &mut path);
    if n == 0 {
        return Ok(());
    }

    let key = current_key();
    let entry = GrpcMethodEntry {
        path,
        len: n as u32,
    };
    unsafe { GRPC_METHODS.insert(&key, &entry, 0) }.ok();
    Ok(())
}

// =============================================================================
// Database client libraries and connection pools
// =============================================================================

#[uprobe]
pub fn pq_exec(ctx: ProbeContext) -> u32 {
    try_db_entry(&ctx).map_or(1, |_| 0)
}

#[uprobe]
pub fn mysql_real_query(ctx: ProbeContext) -> u32 {
    try_db_entry(&ctx).map_or(1, |_| 0)
}

fn try_db_entry(ctx: &ProbeContext) -> Result<(), i64> {
    let key = current_key();
    unsafe { DB_ENTRY.insert(&key, &now(), 0) }.map_err(|_| 1i64)?;

    let query_ptr: *const u8 = ctx.arg(1).unwrap_or(core::ptr::null());
    if !query_ptr.is_null() {
        if let Ok(window) = unsafe { bpf_probe_read_user::<[u8; MAX_STRING_LEN]>(query_ptr as *const _) } {
            let mut verb = [0u8; MAX_STRING_LEN];
            let n = redis::extract_command_name(&window, &mut verb);
            if n > 0 {
                unsafe { DB_QUERIES.insert(&key, &verb, 0) }.ok();
            }
        }
    }
    Ok(())
}

#[uretprobe]
pub fn pq_exec_ret(ctx: ProbeContext) -> u32 {
    try_db_exit(&ctx).map_or(1, |_| 0)
}

#[uretprobe]
pub fn mysql_real_query_ret(ctx: ProbeContext) -> u32 {
    try_db_exit(&ctx).map_or(1, |_| 0)
}

fn try_db_exit(ctx: &ProbeContext) -> Result<(), i64> {
    let key = current_key();
    let start = unsafe { DB_ENTRY.get(&key).copied() };
    unsafe { DB_ENTRY.remove(&key) }.ok();

    let Some(start) = start else {
        return Ok(());
    };
    let verb = unsafe { DB_QUERIES.get(&key).copied() };
    unsafe { DB_QUERIES.remove(&key) }.ok();

    let ts = now();
    let ret: i64 = ctx.ret().unwrap_or(0);

    let mut event = Event::zeroed_of_type(EventType::DbQuery);
    event.timestamp = ts;
    event.pid = current_pid();
    event.latency_ns = calc_latency(ts, start);
    event.error = if ret < 0 { ret as i32 } else { 0 };
    if let Some(verb) = verb {
        let n = podtrace_common::format::cstr_len(&verb);
        event.set_target(&verb[..n]);
    }
    submit(&event);
    Ok(())
}

#[uprobe]
pub fn sqlite3_prepare_v2(ctx: ProbeContext) -> u32 {
    try_pool_acquire(&ctx, DbType::Sqlite)
}

#[uprobe]
pub fn pq_connect_start(ctx: ProbeContext) -> u32 {
    try_pool_acquire(&ctx, DbType::Postgres)
}

#[uprobe]
pub fn mysql_real_connect(ctx: ProbeContext) -> u32 {
    try_pool_acquire(&ctx, DbType::Mysql)
}

/// Acquiring a connection (opening it, in the libraries instrumented here)
/// is itself the event of interest, emitted immediately with
/// `latency_ns=0` — it is not an entry/exit span. Real exhaustion wait is
/// measured separately, between this acquire and the connection's first
/// actual use, by `try_pool_first_use`.
fn try_pool_acquire(ctx: &ProbeContext, db_type: DbType) -> u32 {
    let _ = ctx;
    let key = current_key();
    let ts = now();
    let mut state = unsafe { POOL_STATE.get(&key).copied() }.unwrap_or(PoolState::new(db_type, ts));

    if !state.begin_acquire(ts) {
        unsafe { POOL_STATE.insert(&key, &state, 0) }.ok();
        return 0;
    }
    state.mark_in_use();
    unsafe { POOL_STATE.insert(&key, &state, 0) }.ok();
    unsafe { POOL_ACQUIRE_TIMES.insert(&key, &ts, 0) }.ok();

    let mut event = Event::zeroed_of_type(EventType::PoolAcquire);
    event.timestamp = ts;
    event.pid = current_pid();
    event.latency_ns = 0;
    event.set_target(db_type.as_str().as_bytes());
    submit(&event);
    0
}

/// First query/step issued on a connection after it was acquired: the gap
/// between acquire and here is how long the caller actually waited before
/// it could do anything with the connection. A pool that handed out the
/// connection instantly has `wait` near zero; a pool under contention
/// shows it directly.
#[uprobe]
pub fn sqlite3_step(ctx: ProbeContext) -> u32 {
    try_pool_first_use(&ctx).map_or(1, |_| 0)
}

#[uprobe]
pub fn pq_exec_pool(ctx: ProbeContext) -> u32 {
    try_pool_first_use(&ctx).map_or(1, |_| 0)
}

#[uprobe]
pub fn mysql_real_query_pool(ctx: ProbeContext) -> u32 {
    try_pool_first_use(&ctx).map_or(1, |_| 0)
}

fn try_pool_first_use(_ctx: &ProbeContext) -> Result<(), i64> {
    let key = current_key();
    let Some(acquired_at) = (unsafe { POOL_ACQUIRE_TIMES.get(&key).copied() }) else {
        return Ok(());
    };
    let ts = now();
    let wait = calc_latency(ts, acquired_at);
    if wait < podtrace_common::POOL_EXHAUSTION_MIN_NS {
        return Ok(());
    }
    let Some(state) = (unsafe { POOL_STATE.get(&key).copied() }) else {
        return Ok(());
    };

    let mut event = Event::zeroed_of_type(EventType::PoolExhausted);
    event.timestamp = ts;
    event.pid = current_pid();
    event.latency_ns = wait;
    event.set_target(state.db_type.as_str().as_bytes());
    submit(&event);
    Ok(())
}

#[uretprobe]
pub fn sqlite3_step_ret(ctx: ProbeContext) -> u32 {
    try_pool_first_use_done(&ctx).map_or(1, |_| 0)
}

#[uretprobe]
pub fn pq_exec_pool_ret(ctx: ProbeContext) -> u32 {
    try_pool_first_use_done(&ctx).map_or(1, |_| 0)
}

#[uretprobe]
pub fn mysql_real_query_pool_ret(ctx: ProbeContext) -> u32 {
    try_pool_first_use_done(&ctx).map_or(1, |_| 0)
}

/// Clears the acquire timestamp once the connection's first post-acquire
/// call has completed, so later queries on the same still-held connection
/// don't re-trigger an exhaustion check every time.
fn try_pool_first_use_done(_ctx: &ProbeContext) -> Result<(), i64> {
    let key = current_key();
    unsafe { POOL_ACQUIRE_TIMES.remove(&key) }.ok();
    Ok(())
}

#[uprobe]
pub fn sqlite3_finalize(ctx: ProbeContext) -> u32 {
    try_pool_release(&ctx)
}

#[uprobe]
pub fn pq_finish(ctx: ProbeContext) -> u32 {
    try_pool_release(&ctx)
}

#[uprobe]
pub fn mysql_close(ctx: ProbeContext) -> u32 {
    try_pool_release(&ctx)
}

fn try_pool_release(ctx: &ProbeContext) -> u32 {
    let key = current_key();
    let Some(mut state) = (unsafe { POOL_STATE.get(&key).copied() }) else {
        return 0;
    };
    if !state.release() {
        return 0;
    }
    unsafe { POOL_STATE.insert(&key, &state, 0) }.ok();

    let mut event = Event::zeroed_of_type(EventType::PoolRelease);
    event.timestamp = now();
    event.pid = current_pid();
    event.set_target(state.db_type.as_str().as_bytes());
    submit(&event);
    0
}

// =============================================================================
// Protocol decoders: FastCGI / Redis / Memcached / Kafka
// =============================================================================

/// `unix_stream_recvmsg` is a bare kernel symbol, not a FastCGI-target
/// uprobe: php-fpm receives the PARAMS record over the FastCGI unix socket
/// before the data is resolved to any particular target binary, and the
/// iovec it lands in is only populated once the call returns.
#[kprobe]
pub fn unix_stream_recvmsg(ctx: ProbeContext) -> u32 {
    try_fastcgi_recvmsg_entry(&ctx).map_or(1, |_| 0)
}

fn try_fastcgi_recvmsg_entry(ctx: &ProbeContext) -> Result<(), i64> {
    let msg_ptr: *const u8 = ctx.arg(1).ok_or(1i64)?;
    let key = current_key();
    unsafe { RECVMSG_ARGS.insert(&key, &(msg_ptr as u64), 0) }.map_err(|_| 1i64)
}

#[kretprobe]
pub fn unix_stream_recvmsg_ret(ctx: ProbeContext) -> u32 {
    try_fastcgi_recvmsg_exit(&ctx).map_or(1, |_| 0)
}

fn try_fastcgi_recvmsg_exit(ctx: &ProbeContext) -> Result<(), i64> {
    let key = current_key();
    let msg = unsafe { RECVMSG_ARGS.get(&key).copied() };
    unsafe { RECVMSG_ARGS.remove(&key) }.ok();
    let Some(msg) = msg else {
        return Ok(());
    };

    let ret: i64 = ctx.ret().unwrap_or(0);
    if ret <= 0 {
        return Ok(());
    }

    let Some((iov_base, iov_len)) = read_msghdr_iovec(msg as *const u8) else {
        return Ok(());
    };
    if iov_len < 8 {
        return Ok(());
    }

    let window: [u8; podtrace_common::FASTCGI_SCAN_LEN + 8] =
        unsafe { bpf_probe_read_user(iov_base as *const _) }.map_err(|_| 1i64)?;

    let Some(header) = fastcgi::parse_header(&window) else {
        return Ok(());
    };
    if !fastcgi::is_params(&header) {
        return Ok(());
    }

    let info = fastcgi::parse_params(&window[8..]);
    if info.uri_len == 0 {
        return Ok(());
    }

    let start_ns = now();
    let mut entry = FastcgiReqEntry {
        start_ns,
        uri: [0u8; MAX_STRING_LEN],
        uri_len: info.uri_len as u32,
        method: [0u8; 16],
        method_len: info.method_len as u32,
    };
    entry.uri[..info.uri_len].copy_from_slice(&info.uri[..info.uri_len]);
    entry.method[..info.method_len].copy_from_slice(&info.method[..info.method_len]);
    let req_key = key ^ header.request_id as u64;
    unsafe { FASTCGI_REQS.insert(&req_key, &entry, 0) }.ok();

    let mut event = Event::zeroed_of_type(EventType::FastcgiRequest);
    event.timestamp = start_ns;
    event.pid = current_pid();
    event.set_target(&info.uri[..info.uri_len]);
    event.set_details(&info.method[..info.method_len]);
    submit(&event);
    Ok(())
}

/// `unix_stream_sendmsg` is likewise a bare kernel symbol. The END_REQUEST
/// record's bytes are already fully written by the caller by the time this
/// kprobe fires, so there's no need for a paired kretprobe here.
#[kprobe]
pub fn unix_stream_sendmsg(ctx: ProbeContext) -> u32 {
    try_fastcgi_sendmsg(&ctx).map_or(1, |_| 0)
}

fn try_fastcgi_sendmsg(ctx: &ProbeContext) -> Result<(), i64> {
    let msg_ptr: *const u8 = ctx.arg(1).ok_or(1i64)?;
    let Some((iov_base, iov_len)) = read_msghdr_iovec(msg_ptr) else {
        return Ok(());
    };
    if iov_len < 8 {
        return Ok(());
    }

    let window: [u8; podtrace_common::FASTCGI_SCAN_LEN + 8] =
        unsafe { bpf_probe_read_user(iov_base as *const _) }.map_err(|_| 1i64)?;

    let Some(header) = fastcgi::parse_header(&window) else {
        return Ok(());
    };
    if !fastcgi::is_end_request(&header) {
        return Ok(());
    }
    let Some((app_status, _proto)) = fastcgi::parse_end_request(&window[8..]) else {
        return Ok(());
    };

    let key = current_key();
    let req_key = key ^ header.request_id as u64;
    let req = unsafe { FASTCGI_REQS.get(&req_key).copied() };
    unsafe { FASTCGI_REQS.remove(&req_key) }.ok();

    let ts = now();
    let mut event = Event::zeroed_of_type(EventType::FastcgiResponse);
    event.timestamp = ts;
    event.pid = current_pid();
    event.error = app_status;
    if let Some(req) = req {
        event.latency_ns = calc_latency(ts, req.start_ns);
        event.set_target(&req.uri[..req.uri_len as usize]);
        event.set_details(&req.method[..req.method_len as usize]);
    }
    submit(&event);
    Ok(())
}

#[uprobe]
pub fn redis_command(ctx: ProbeContext) -> u32 {
    try_redis_entry(&ctx, false).map_or(1, |_| 0)
}

/// `redisCommandArgv(context, argc, argv, argvlen)`: PARM3 is `argv`, an
/// array of `char *`, not a string itself — `argv[0]` has to be
/// dereferenced a second time to reach the command name.
#[uprobe]
pub fn redis_command_argv(ctx: ProbeContext) -> u32 {
    try_redis_entry(&ctx, true).map_or(1, |_| 0)
}

fn try_redis_entry(ctx: &ProbeContext, is_argv: bool) -> Result<(), i64> {
    let key = current_key();
    unsafe { START_TIMES.insert(&key, &now(), 0) }.map_err(|_| 1i64)?;

    let cmd_ptr: *const u8 = if is_argv {
        let argv: *const u64 = ctx.arg(2).ok_or(1i64)?;
        let argv0: u64 = unsafe { bpf_probe_read_user(argv) }.map_err(|_| 1i64)?;
        if argv0 == 0 {
            return Ok(());
        }
        argv0 as *const u8
    } else {
        ctx.arg(1).ok_or(1i64)?
    };

    if let Ok(window) = unsafe { bpf_probe_read_user::<[u8; 32]>(cmd_ptr as *const _) } {
        let mut cmd = [0u8; 32];
        let n = redis::extract_command_name(&window, &mut cmd);
        if n > 0 {
            unsafe { REDIS_CMDS.insert(&key, &cmd, 0) }.ok();
        }
    }
    Ok(())
}

#[uretprobe]
pub fn redis_command_ret(ctx: ProbeContext) -> u32 {
    try_redis_exit(&ctx).map_or(1, |_| 0)
}

#[uretprobe]
pub fn redis_command_argv_ret(ctx: ProbeContext) -> u32 {
    try_redis_exit(&ctx).map_or(1, |_| 0)
}

fn try_redis_exit(ctx: &ProbeContext) -> Result<(), i64> {
    let key = current_key();
    let start = unsafe { START_TIMES.get(&key).copied() };
    unsafe { START_TIMES.remove(&key) }.ok();
    let cmd = unsafe { REDIS_CMDS.get(&key).copied() };
    unsafe { REDIS_CMDS.remove(&key) }.ok();

    let Some(start) = start else {
        return Ok(());
    };
    let reply: u64 = ctx.ret().unwrap_or(0);
    let ts = now();

    let mut event = Event::zeroed_of_type(EventType::RedisCmd);
    event.timestamp = ts;
    event.pid = current_pid();
    event.latency_ns = calc_latency(ts, start);
    event.error = if reply == 0 { -1 } else { 0 };
    if let Some(cmd) = cmd {
        let n = podtrace_common::format::cstr_len(&cmd);
        event.set_details(&cmd[..n]);
    }
    submit(&event);
    Ok(())
}

#[uprobe]
pub fn memcached_get(ctx: ProbeContext) -> u32 {
    try_memcached_entry(&ctx, memcached::MemcachedOp::Get).map_or(1, |_| 0)
}

#[uprobe]
pub fn memcached_set(ctx: ProbeContext) -> u32 {
    try_memcached_entry(&ctx, memcached::MemcachedOp::Set).map_or(1, |_| 0)
}

#[uprobe]
pub fn memcached_delete(ctx: ProbeContext) -> u32 {
    try_memcached_entry(&ctx, memcached::MemcachedOp::Delete).map_or(1, |_| 0)
}

fn try_memcached_entry(ctx: &ProbeContext, op: memcached::MemcachedOp) -> Result<(), i64> {
    let key = current_key();
    unsafe { START_TIMES.insert(&key, &now(), 0) }.map_err(|_| 1i64)?;

    let key_ptr: *const u8 = ctx.arg(1).ok_or(1i64)?;
    let key_buf: [u8; 64] = unsafe { bpf_probe_read_user(key_ptr as *const _) }.map_err(|_| 1i64)?;
    let key_len = podtrace_common::format::cstr_len(&key_buf);

    let mut details = [0u8; MAX_STRING_LEN];
    let n = memcached::build_op_string(op, &key_buf[..key_len], &mut details);
    if n > 0 {
        unsafe { MEMCACHED_OPS.insert(&key, &details, 0) }.ok();
    }

    if op == memcached::MemcachedOp::Set {
        let value_len: u64 = ctx.arg(4).unwrap_or(0);
        unsafe { PROTO_BYTES.insert(&key, &value_len, 0) }.ok();
    }
    Ok(())
}

#[uretprobe]
pub fn memcached_get_ret(ctx: ProbeContext) -> u32 {
    try_memcached_exit(&ctx).map_or(1, |_| 0)
}

#[uretprobe]
pub fn memcached_set_ret(ctx: ProbeContext) -> u32 {
    try_memcached_exit(&ctx).map_or(1, |_| 0)
}

#[uretprobe]
pub fn memcached_delete_ret(ctx: ProbeContext) -> u32 {
    try_memcached_exit(&ctx).map_or(1, |_| 0)
}

fn try_memcached_exit(ctx: &ProbeContext) -> Result<(), i64> {
    let key = current_key();
    let start = unsafe { START_TIMES.get(&key).copied() };
    unsafe { START_TIMES.remove(&key) }.ok();
    let details = unsafe { MEMCACHED_OPS.get(&key).copied() };
    unsafe { MEMCACHED_OPS.remove(&key) }.ok();
    let bytes = unsafe { PROTO_BYTES.get(&key).copied() };
    unsafe { PROTO_BYTES.remove(&key) }.ok();

    let Some(start) = start else {
        return Ok(());
    };
    let ret: i64 = ctx.ret().unwrap_or(0);
    let ts = now();

    let mut event = Event::zeroed_of_type(EventType::MemcachedCmd);
    event.timestamp = ts;
    event.pid = current_pid();
    event.latency_ns = calc_latency(ts, start);
    event.error = ret as i32;
    if let Some(bytes) = bytes {
        event.bytes = bytes;
    }
    if let Some(details) = details {
        let n = podtrace_common::format::cstr_len(&details);
        event.set_details(&details[..n]);
    }
    submit(&event);
    Ok(())
}

#[uprobe]
pub fn rd_kafka_topic_new(_ctx: ProbeContext) -> u32 {
    0 // topic handle not yet available before the call returns
}

#[uretprobe]
pub fn rd_kafka_topic_new_ret(ctx: ProbeContext) -> u32 {
    let handle: u64 = ctx.ret().unwrap_or(0);
    if handle == 0 {
        return 0;
    }
    let name_ptr: *const u8 = ctx.arg(1).unwrap_or(core::ptr::null());
    if name_ptr.is_null() {
        return 0;
    }
    if let Ok(name) = unsafe { bpf_probe_read_user::<[u8; 64]>(name_ptr as *const _) } {
        unsafe { KAFKA_TOPICS.insert(&handle, &name, 0) }.ok();
    }
    0
}

/// `rd_kafka_produce(rkt, partition, msgflags, payload, len, key, keylen,
/// msg_opaque)`: PARM1 is the topic handle, PARM5 the payload length —
/// both available synchronously at entry, so this stays a single uprobe.
#[uprobe]
pub fn rd_kafka_produce(ctx: ProbeContext) -> u32 {
    try_kafka_produce(&ctx).map_or(1, |_| 0)
}

fn try_kafka_produce(ctx: &ProbeContext) -> Result<(), i64> {
    let handle: u64 = ctx.arg(0).ok_or(1i64)?;
    let name = unsafe { KAFKA_TOPICS.get(&handle).copied() }.unwrap_or([0u8; 64]);
    let name_len = podtrace_common::format::cstr_len(&name);
    if name_len == 0 {
        return Ok(());
    }

    let partition: i32 = ctx.arg(1).unwrap_or(-1);
    let len: u64 = ctx.arg(4).unwrap_or(0);
    let mut details = [0u8; 96];
    let n = kafka::build_topic_details(&name[..name_len], partition, &mut details);

    let mut event = Event::zeroed_of_type(EventType::KafkaProduce);
    event.timestamp = now();
    event.pid = current_pid();
    event.bytes = len;
    event.set_details(&details[..n]);
    submit(&event);
    Ok(())
}

/// `rd_kafka_consumer_poll(rk, timeout_ms)`: PARM1 is the *client* handle,
/// not a topic handle, so no topic lookup is possible at entry. The
/// returned `rd_kafka_message_t*` carries `err`/`rkt`/`len` directly, read
/// here once the call returns.
#[uprobe]
pub fn rd_kafka_consumer_poll(ctx: ProbeContext) -> u32 {
    try_kafka_poll_entry(&ctx).map_or(1, |_| 0)
}

fn try_kafka_poll_entry(_ctx: &ProbeContext) -> Result<(), i64> {
    let key = current_key();
    unsafe { START_TIMES.insert(&key, &now(), 0) }.map_err(|_| 1i64)
}

#[uretprobe]
pub fn rd_kafka_consumer_poll_ret(ctx: ProbeContext) -> u32 {
    try_kafka_poll_exit(&ctx).map_or(1, |_| 0)
}

/// Offsets into `rd_kafka_message_t`: `err` at 0, `rkt` (topic handle) at
/// 8, `len` at 32 (`partition` and `payload` sit between `rkt` and `len`
/// but aren't needed here).
const KAFKA_MSG_ERR_OFFSET: usize = 0;
const KAFKA_MSG_RKT_OFFSET: usize = 8;
const KAFKA_MSG_LEN_OFFSET: usize = 32;

fn try_kafka_poll_exit(ctx: &ProbeContext) -> Result<(), i64> {
    let key = current_key();
    let start = unsafe { START_TIMES.get(&key).copied() };
    unsafe { START_TIMES.remove(&key) }.ok();
    let Some(start) = start else {
        return Ok(());
    };

    let msg_addr: u64 = ctx.ret().unwrap_or(0);
    if msg_addr == 0 {
        return Ok(());
    }
    let msg_ptr = msg_addr as *const u8;

    let err: i32 =
        unsafe { bpf_probe_read_user(msg_ptr.add(KAFKA_MSG_ERR_OFFSET) as *const i32) }.unwrap_or(0);
    let rkt: u64 =
        unsafe { bpf_probe_read_user(msg_ptr.add(KAFKA_MSG_RKT_OFFSET) as *const u64) }.unwrap_or(0);
    let len: u64 =
        unsafe { bpf_probe_read_user(msg_ptr.add(KAFKA_MSG_LEN_OFFSET) as *const u64) }.unwrap_or(0);

    let name = unsafe { KAFKA_TOPICS.get(&rkt).copied() }.unwrap_or([0u8; 64]);
    let name_len = podtrace_common::format::cstr_len(&name);

    let ts = now();
    let mut event = Event::zeroed_of_type(EventType::KafkaFetch);
    event.timestamp = ts;
    event.pid = current_pid();
    event.latency_ns = calc_latency(ts, start);
    event.error = err;
    event.bytes = len;
    if name_len > 0 {
        let mut details = [0u8; 96];
        let n = kafka::build_topic_details(&name[..name_len], -1, &mut details);
        event.set_details(&details[..n]);
    }
    submit(&event);
    Ok(())
}

// =============================================================================
// Cgroup utilization engine
// =============================================================================

/// Fires on a low-frequency software CPU-clock sample, one program instance
/// per CPU. Evaluates whatever cgroup happens to be running at sample time
/// against the limits the loader last wrote for it; the sampling itself
/// supplies the cadence the computation needs, so no dedicated timer map or
/// userspace-triggered probe is required.
#[perf_event]
pub fn cgroup_utilization_sample(ctx: PerfEventContext) -> u32 {
    try_cgroup_utilization_sample(&ctx).map_or(1, |_| 0)
}

fn try_cgroup_utilization_sample(_ctx: &PerfEventContext) -> Result<(), i64> {
    let cgroup_id = unsafe { bpf_get_current_cgroup_id() };

    let thresholds = AlertThresholds {
        warn_pct: unsafe { ALERT_THRESHOLDS.get(0).copied() }
            .unwrap_or(AlertThresholds::DEFAULT.warn_pct),
        crit_pct: unsafe { ALERT_THRESHOLDS.get(1).copied() }
            .unwrap_or(AlertThresholds::DEFAULT.crit_pct),
        emerg_pct: unsafe { ALERT_THRESHOLDS.get(2).copied() }
            .unwrap_or(AlertThresholds::DEFAULT.emerg_pct),
    };

    if let Some(entry) = unsafe { CGROUP_LIMITS_MEM.get(&cgroup_id).copied() } {
        evaluate_cgroup_resource(cgroup_id, 1, entry, &thresholds);
    }
    if let Some(entry) = unsafe { CGROUP_LIMITS_CPU.get(&cgroup_id).copied() } {
        evaluate_cgroup_resource(cgroup_id, 0, entry, &thresholds);
    }
    Ok(())
}

/// Evaluates one resource's usage/limit pair for `cgroup_id` and emits a
/// `ResourceLimit` event. `resource_wire` follows the loader's encoding
/// (`CPU=0, MEM=1, IO=2`); the alert-dedup key folds it in so memory and CPU
/// no longer clobber each other's entry in `CGROUP_ALERTS`.
fn evaluate_cgroup_resource(
    cgroup_id: u64,
    resource_wire: u32,
    entry: CgroupLimitEntry,
    thresholds: &AlertThresholds,
) {
    let alert_key = (cgroup_id << 2) | resource_wire as u64;

    let pct = utilization_pct(CgroupLimit::new(entry.usage, entry.limit));
    let level = alert_level(
        pct,
        thresholds.warn_pct,
        thresholds.crit_pct,
        thresholds.emerg_pct,
    ) as u32;

    if level == 0 {
        unsafe { CGROUP_ALERTS.remove(&alert_key) }.ok();
    } else {
        unsafe { CGROUP_ALERTS.insert(&alert_key, &level, 0) }.ok();
    }

    let mut event = Event::zeroed_of_type(EventType::ResourceLimit);
    event.timestamp = now();
    event.pid = current_pid();
    event.error = pct as i32;
    event.bytes = entry.usage;
    event.tcp_state = resource_wire;
    event.cgroup_id = cgroup_id;

    let mut details = [0u8; 32];
    let n = podtrace_common::cgroup::resource_details(
        resource_type_from_u32(resource_wire),
        CgroupLimit::new(entry.usage, entry.limit),
        &mut details,
    );
    event.set_details(&details[..n]);
    submit(&event);
}

/// Wire encoding written by the loader: `CPU=0, MEM=1, IO=2`, distinct from
/// `ResourceType`'s own discriminants.
fn resource_type_from_u32(v: u32) -> podtrace_common::cgroup::ResourceType {
    use podtrace_common::cgroup::ResourceType;
    match v {
        0 => ResourceType::Cpu,
        2 => ResourceType::Io,
        _ => ResourceType::Memory,
    }
}
