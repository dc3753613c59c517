//! Loader entry point. Loads the compiled core, seeds its config maps,
//! attaches every probe, and relays decoded events to the configured sink.
//! Deliberately thin: no CLI beyond a config-path override, no symbol
//! resolution, no aggregation. Those are left to downstream tools.

use anyhow::Context;
use aya::maps::{Array, MapData, RingBuf, StackTraceMap};
use aya::{Ebpf, EbpfLoader};
use aya_log::EbpfLogger;
use clap::Parser;
use log::{info, warn};

mod attach;
mod cgroup_poller;
mod config;
mod output;

use config::Config;
use output::{EventRecord, EventSink};
use podtrace_common::Event;

/// Cadence, in Hz, of the kernel-side cgroup-utilization sampler. One sample
/// per CPU per tick is all the alert engine needs; the loader's own
/// `cgroup_poller` tick (configured separately) decides how fresh the
/// underlying usage/limit data is.
const CGROUP_SAMPLE_HZ: u64 = 1;

#[derive(Parser, Debug)]
#[command(name = "podtrace", about = "Container-aware eBPF tracer")]
struct Args {
    /// Overrides PODTRACE_CONFIG for this run.
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args = Args::parse();
    if let Some(path) = &args.config {
        // SAFETY: single-threaded at this point, before any spawned task
        // reads the environment.
        unsafe { std::env::set_var("PODTRACE_CONFIG", path) };
    }
    let cfg = Config::load();

    let (bpf_bytes, object_path) = read_bpf_bytes().context("locating podtrace-ebpf object")?;
    info!("loading eBPF object from {object_path}");
    let mut loader = EbpfLoader::new();
    let mut bpf = loader.load(&bpf_bytes).context("loading podtrace-ebpf")?;

    match EbpfLogger::init(&mut bpf) {
        Ok(_logger) => info!("ebpf logger initialized"),
        Err(err) => warn!("ebpf logger not active: {err}"),
    }

    seed_config(&mut bpf, &cfg)?;
    attach_probes(&mut bpf, &cfg);

    let cgroup_limits_mem = bpf.take_map("CGROUP_LIMITS_MEM").context("CGROUP_LIMITS_MEM map not found")?;
    let cgroup_limits_mem = aya::maps::HashMap::try_from(cgroup_limits_mem)?;
    let cgroup_limits_cpu = bpf.take_map("CGROUP_LIMITS_CPU").context("CGROUP_LIMITS_CPU map not found")?;
    let cgroup_limits_cpu = aya::maps::HashMap::try_from(cgroup_limits_cpu)?;
    let cgroup_task = tokio::spawn(cgroup_poller::run(
        cgroup_limits_mem,
        cgroup_limits_cpu,
        cfg.cgroup.root.clone(),
        cfg.cgroup.poll_interval_ms,
    ));

    let mut ring_buf = RingBuf::try_from(bpf.take_map("EVENTS").context("EVENTS map not found")?)?;
    let stack_traces: StackTraceMap<_> =
        StackTraceMap::try_from(bpf.take_map("STACK_TRACES").context("STACK_TRACES map not found")?)?;

    let mut sink = EventSink::open(cfg.logging.events_file.as_deref()).await?;

    info!("podtrace running, writing events to {:?}", cfg.logging.events_file);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        while let Some(item) = ring_buf.next() {
            let bytes: &[u8] = &item;
            if bytes.len() < std::mem::size_of::<Event>() {
                warn!("short event, dropping ({} bytes)", bytes.len());
                continue;
            }
            // SAFETY: length checked above; the core only ever writes a
            // fully-populated `Event` into this ring buffer.
            let event = unsafe { std::ptr::read_unaligned(bytes.as_ptr().cast::<Event>()) };

            let frames: Option<Vec<u64>> = if event.stack_key != 0 {
                let stack_id = (event.stack_key - 1) as u32;
                stack_traces
                    .get(&stack_id, 0)
                    .ok()
                    .map(|trace| trace.frames().iter().map(|f| f.ip).collect())
            } else {
                None
            };

            let record = EventRecord {
                event: &event,
                stack: frames.as_deref(),
            };
            sink.write_record(&record).await;
        }

        tokio::select! {
            () = tokio::time::sleep(std::time::Duration::from_millis(50)) => {}
            _ = &mut ctrl_c => {
                info!("shutting down");
                break;
            }
        }
    }

    cgroup_task.abort();
    Ok(())
}

/// Locates the compiled core object: `PODTRACE_BPF_PATH` wins if set,
/// otherwise the usual install and build-tree locations are tried in turn.
fn read_bpf_bytes() -> anyhow::Result<(Vec<u8>, String)> {
    const CANDIDATES: [&str; 6] = [
        "/usr/local/share/podtrace/podtrace-ebpf",
        "target/bpfel-unknown-none/release/podtrace-ebpf",
        "./target/bpfel-unknown-none/release/podtrace-ebpf",
        "../target/bpfel-unknown-none/release/podtrace-ebpf",
        "target/bpfel-unknown-none/debug/podtrace-ebpf",
        "../target/bpfel-unknown-none/debug/podtrace-ebpf",
    ];

    if let Ok(path) = std::env::var("PODTRACE_BPF_PATH") {
        let data = std::fs::read(&path)?;
        return Ok((data, path));
    }

    for candidate in CANDIDATES {
        if std::path::Path::new(candidate).exists() {
            return Ok((std::fs::read(candidate)?, candidate.to_string()));
        }
    }

    anyhow::bail!("podtrace-ebpf object not found. Set PODTRACE_BPF_PATH or run `cargo xtask build-ebpf`.")
}

/// Writes the pieces of [`Config`] the core reads out of maps rather than
/// through its `#[map] CONFIG` array's static defaults: the gRPC port it
/// scans for and the alert thresholds the cgroup engine classifies against.
fn seed_config(bpf: &mut Ebpf, cfg: &Config) -> anyhow::Result<()> {
    {
        let map = bpf.map_mut("CONFIG").context("CONFIG map not found")?;
        let mut config_array: Array<&mut MapData, u32> = Array::try_from(map)?;
        config_array.set(0, cfg.protocols.grpc_port as u32, 0)?;
    }
    {
        let map = bpf.map_mut("ALERT_THRESHOLDS").context("ALERT_THRESHOLDS map not found")?;
        let mut thresholds: Array<&mut MapData, u32> = Array::try_from(map)?;
        let t = cfg.thresholds();
        thresholds.set(0, t.warn_pct, 0)?;
        thresholds.set(1, t.crit_pct, 0)?;
        thresholds.set(2, t.emerg_pct, 0)?;
    }
    Ok(())
}

fn attach_probes(bpf: &mut Ebpf, cfg: &Config) {
    use attach::{attach_kprobe, attach_kretprobe, attach_perf_event_sampler, attach_tracepoint, attach_uprobe, attach_uretprobe};

    // File I/O
    attach_kprobe(bpf, "vfs_read", "vfs_read");
    attach_kprobe(bpf, "vfs_write", "vfs_write");
    attach_kprobe(bpf, "vfs_fsync", "vfs_fsync");
    attach_kretprobe(bpf, "vfs_read_ret", "vfs_read");
    attach_kretprobe(bpf, "vfs_write_ret", "vfs_write");
    attach_kretprobe(bpf, "vfs_fsync_ret", "vfs_fsync");

    // Filesystem lifecycle
    attach_kprobe(bpf, "do_sys_openat2", "do_sys_openat2");
    attach_kprobe(bpf, "vfs_unlink", "vfs_unlink");
    attach_kprobe(bpf, "vfs_rename", "vfs_rename");
    attach_kprobe(bpf, "close_fd", "__close_fd");
    attach_kretprobe(bpf, "do_sys_openat2_ret", "do_sys_openat2");
    attach_kretprobe(bpf, "vfs_unlink_ret", "vfs_unlink");
    attach_kretprobe(bpf, "vfs_rename_ret", "vfs_rename");

    // Process lifecycle
    attach_kprobe(bpf, "do_execveat_common", "do_execveat_common");
    attach_tracepoint(bpf, "sched_process_fork", "sched", "sched_process_fork");
    attach_tracepoint(bpf, "sched_switch", "sched", "sched_switch");

    // Locking
    attach_kprobe(bpf, "do_futex", "do_futex");
    attach_kprobe(bpf, "pthread_mutex_lock", "pthread_mutex_lock");
    attach_kretprobe(bpf, "do_futex_ret", "do_futex");
    attach_kretprobe(bpf, "pthread_mutex_lock_ret", "pthread_mutex_lock");

    // Memory
    attach_tracepoint(bpf, "page_fault_user", "exceptions", "page_fault_user");
    attach_kprobe(bpf, "oom_kill_process", "oom_kill_process");

    // Network
    attach_kprobe(bpf, "tcp_v4_connect", "tcp_v4_connect");
    attach_kprobe(bpf, "tcp_v6_connect", "tcp_v6_connect");
    attach_kretprobe(bpf, "tcp_v4_connect_ret", "tcp_v4_connect");
    attach_kretprobe(bpf, "tcp_v6_connect_ret", "tcp_v6_connect");
    attach_kprobe(bpf, "tcp_sendmsg", "tcp_sendmsg");
    attach_kprobe(bpf, "tcp_recvmsg", "tcp_recvmsg");
    attach_kprobe(bpf, "udp_sendmsg", "udp_sendmsg");
    attach_kprobe(bpf, "udp_recvmsg", "udp_recvmsg");
    attach_kretprobe(bpf, "tcp_sendmsg_ret", "tcp_sendmsg");
    attach_kretprobe(bpf, "tcp_recvmsg_ret", "tcp_recvmsg");
    attach_kretprobe(bpf, "udp_sendmsg_ret", "udp_sendmsg");
    attach_kretprobe(bpf, "udp_recvmsg_ret", "udp_recvmsg");
    attach_kprobe(bpf, "tcp_set_state", "tcp_set_state");
    attach_kprobe(bpf, "tcp_retransmit_skb", "tcp_retransmit_skb");
    attach_tracepoint(bpf, "net_dev_xmit", "net", "net_dev_xmit");
    attach_kprobe(bpf, "tcp_sendmsg_grpc", "tcp_sendmsg");

    // DNS + generic HTTP, both resolved against libc / the FastCGI target
    attach_uprobe(bpf, "getaddrinfo", "getaddrinfo", cfg.targets.libc.as_deref());
    attach_uretprobe(bpf, "getaddrinfo_ret", "getaddrinfo", cfg.targets.libc.as_deref());
    attach_uprobe(bpf, "http_request", "fastcgi_finish_request", cfg.targets.fastcgi_target.as_deref());
    attach_uretprobe(bpf, "http_request_ret", "fastcgi_finish_request", cfg.targets.fastcgi_target.as_deref());
    attach_uprobe(bpf, "http_response", "php_fastcgi_flush", cfg.targets.fastcgi_target.as_deref());
    attach_uretprobe(bpf, "http_response_ret", "php_fastcgi_flush", cfg.targets.fastcgi_target.as_deref());

    // Connection pools: Postgres, MySQL, SQLite
    attach_uprobe(bpf, "pq_exec", "PQexec", cfg.targets.libpq.as_deref());
    attach_uprobe(bpf, "mysql_real_query", "mysql_real_query", cfg.targets.libmysqlclient.as_deref());
    attach_uretprobe(bpf, "pq_exec_ret", "PQexec", cfg.targets.libpq.as_deref());
    attach_uretprobe(bpf, "mysql_real_query_ret", "mysql_real_query", cfg.targets.libmysqlclient.as_deref());
    attach_uprobe(bpf, "sqlite3_prepare_v2", "sqlite3_prepare_v2", cfg.targets.libsqlite3.as_deref());
    attach_uprobe(bpf, "pq_connect_start", "PQconnectStart", cfg.targets.libpq.as_deref());
    attach_uprobe(bpf, "mysql_real_connect", "mysql_real_connect", cfg.targets.libmysqlclient.as_deref());
    attach_uprobe(bpf, "sqlite3_finalize", "sqlite3_finalize", cfg.targets.libsqlite3.as_deref());
    attach_uprobe(bpf, "pq_finish", "PQfinish", cfg.targets.libpq.as_deref());
    attach_uprobe(bpf, "mysql_close", "mysql_close", cfg.targets.libmysqlclient.as_deref());

    // Connection-pool exhaustion: first query/step issued after an acquire,
    // attached to the same symbols as the query-timing probes above under
    // distinct program names.
    attach_uprobe(bpf, "sqlite3_step", "sqlite3_step", cfg.targets.libsqlite3.as_deref());
    attach_uprobe(bpf, "pq_exec_pool", "PQexec", cfg.targets.libpq.as_deref());
    attach_uprobe(bpf, "mysql_real_query_pool", "mysql_real_query", cfg.targets.libmysqlclient.as_deref());
    attach_uretprobe(bpf, "sqlite3_step_ret", "sqlite3_step", cfg.targets.libsqlite3.as_deref());
    attach_uretprobe(bpf, "pq_exec_pool_ret", "PQexec", cfg.targets.libpq.as_deref());
    attach_uretprobe(bpf, "mysql_real_query_pool_ret", "mysql_real_query", cfg.targets.libmysqlclient.as_deref());

    // FastCGI, on the bare unix-domain-socket kernel path php-fpm's requests
    // and responses travel over — not resolved against any userspace target.
    attach_kprobe(bpf, "unix_stream_recvmsg", "unix_stream_recvmsg");
    attach_kretprobe(bpf, "unix_stream_recvmsg_ret", "unix_stream_recvmsg");
    attach_kprobe(bpf, "unix_stream_sendmsg", "unix_stream_sendmsg");

    // Redis / Memcached / Kafka clients
    attach_uprobe(bpf, "redis_command", "redisCommand", cfg.targets.libhiredis.as_deref());
    attach_uprobe(bpf, "redis_command_argv", "redisCommandArgv", cfg.targets.libhiredis.as_deref());
    attach_uretprobe(bpf, "redis_command_ret", "redisCommand", cfg.targets.libhiredis.as_deref());
    attach_uretprobe(bpf, "redis_command_argv_ret", "redisCommandArgv", cfg.targets.libhiredis.as_deref());
    attach_uprobe(bpf, "memcached_get", "memcached_get", cfg.targets.libmemcached.as_deref());
    attach_uprobe(bpf, "memcached_set", "memcached_set", cfg.targets.libmemcached.as_deref());
    attach_uprobe(bpf, "memcached_delete", "memcached_delete", cfg.targets.libmemcached.as_deref());
    attach_uretprobe(bpf, "memcached_get_ret", "memcached_get", cfg.targets.libmemcached.as_deref());
    attach_uretprobe(bpf, "memcached_set_ret", "memcached_set", cfg.targets.libmemcached.as_deref());
    attach_uretprobe(bpf, "memcached_delete_ret", "memcached_delete", cfg.targets.libmemcached.as_deref());
    attach_uprobe(bpf, "rd_kafka_topic_new", "rd_kafka_topic_new", cfg.targets.librdkafka.as_deref());
    attach_uretprobe(bpf, "rd_kafka_topic_new_ret", "rd_kafka_topic_new", cfg.targets.librdkafka.as_deref());
    attach_uprobe(bpf, "rd_kafka_produce", "rd_kafka_produce", cfg.targets.librdkafka.as_deref());
    attach_uprobe(bpf, "rd_kafka_consumer_poll", "rd_kafka_consumer_poll", cfg.targets.librdkafka.as_deref());
    attach_uretprobe(bpf, "rd_kafka_consumer_poll_ret", "rd_kafka_consumer_poll", cfg.targets.librdkafka.as_deref());

    // Cgroup utilization engine cadence
    attach_perf_event_sampler(bpf, "cgroup_utilization_sample", CGROUP_SAMPLE_HZ);
}
