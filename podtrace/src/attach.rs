//! Load+attach helpers for every probe kind the core programs use. Each
//! wraps the fallible aya calls and, on failure, warns and returns rather
//! than propagating — a single unavailable symbol (a library built without
//! debug info, a kernel missing a tracepoint) should never take down the
//! rest of the tracer.

use aya::programs::{KProbe, PerfEvent, TracePoint, UProbe};
use aya::Ebpf;
use log::warn;

pub fn attach_kprobe(bpf: &mut Ebpf, program: &str, symbol: &str) {
    let result = (|| -> anyhow::Result<()> {
        let probe: &mut KProbe = bpf
            .program_mut(program)
            .ok_or_else(|| anyhow::anyhow!("{program} program not found"))?
            .try_into()?;
        probe.load()?;
        probe.attach(symbol, 0)?;
        Ok(())
    })();
    if let Err(err) = result {
        warn!("kprobe {symbol} ({program}) not attached: {err:?}");
    }
}

pub fn attach_kretprobe(bpf: &mut Ebpf, program: &str, symbol: &str) {
    let result = (|| -> anyhow::Result<()> {
        let probe: &mut KProbe = bpf
            .program_mut(program)
            .ok_or_else(|| anyhow::anyhow!("{program} program not found"))?
            .try_into()?;
        probe.load()?;
        probe.attach(symbol, 0)?;
        Ok(())
    })();
    if let Err(err) = result {
        warn!("kretprobe {symbol} ({program}) not attached: {err:?}");
    }
}

pub fn attach_tracepoint(bpf: &mut Ebpf, program: &str, category: &str, name: &str) {
    let result = (|| -> anyhow::Result<()> {
        let tp: &mut TracePoint = bpf
            .program_mut(program)
            .ok_or_else(|| anyhow::anyhow!("{program} program not found"))?
            .try_into()?;
        tp.load()?;
        tp.attach(category, name)?;
        Ok(())
    })();
    if let Err(err) = result {
        warn!("tracepoint {category}:{name} ({program}) not attached: {err:?}");
    }
}

/// Attaches a uprobe at the entry of `symbol` in `target_path`. `target_path`
/// being absent (library not installed on this host) is reported once and
/// otherwise ignored, since most deployments only run a subset of the
/// instrumented client libraries.
pub fn attach_uprobe(bpf: &mut Ebpf, program: &str, symbol: &str, target_path: Option<&str>) {
    let Some(target_path) = target_path else {
        return;
    };
    if !std::path::Path::new(target_path).exists() {
        warn!("uprobe target {target_path} for {symbol} ({program}) not found, skipping");
        return;
    }
    let result = (|| -> anyhow::Result<()> {
        let probe: &mut UProbe = bpf
            .program_mut(program)
            .ok_or_else(|| anyhow::anyhow!("{program} program not found"))?
            .try_into()?;
        probe.load()?;
        probe.attach(Some(symbol), 0, target_path, None)?;
        Ok(())
    })();
    if let Err(err) = result {
        warn!("uprobe {symbol} ({program}) not attached: {err:?}");
    }
}

pub fn attach_uretprobe(bpf: &mut Ebpf, program: &str, symbol: &str, target_path: Option<&str>) {
    let Some(target_path) = target_path else {
        return;
    };
    if !std::path::Path::new(target_path).exists() {
        return;
    }
    let result = (|| -> anyhow::Result<()> {
        let probe: &mut UProbe = bpf
            .program_mut(program)
            .ok_or_else(|| anyhow::anyhow!("{program} program not found"))?
            .try_into()?;
        probe.load()?;
        probe.attach(Some(symbol), 0, target_path, None)?;
        Ok(())
    })();
    if let Err(err) = result {
        warn!("uretprobe {symbol} ({program}) not attached: {err:?}");
    }
}

/// Attaches the cgroup-utilization sampler on every online CPU at a
/// low-frequency software CPU-clock event; one sample is all the alerting
/// computation needs per cadence tick.
pub fn attach_perf_event_sampler(bpf: &mut Ebpf, program: &str, frequency: u64) {
    let result = (|| -> anyhow::Result<()> {
        let perf: &mut PerfEvent = bpf
            .program_mut(program)
            .ok_or_else(|| anyhow::anyhow!("{program} program not found"))?
            .try_into()?;
        perf.load()?;
        for cpu in aya::util::online_cpus().map_err(|(_, e)| e)? {
            perf.attach(
                aya::programs::perf_event::PerfTypeId::Software,
                aya::programs::perf_event::perf_sw_ids::PERF_COUNT_SW_CPU_CLOCK as u64,
                aya::programs::perf_event::PerfEventScope::AllProcessesOneCpu { cpu },
                aya::programs::perf_event::SamplePolicy::Frequency(frequency),
                true,
            )?;
        }
        Ok(())
    })();
    if let Err(err) = result {
        warn!("perf_event sampler ({program}) not attached: {err:?}");
    }
}
