use metacoord::{Sampler, Usage};

/// Reads host load from procfs. Reports zero where procfs is unavailable.
#[derive(Copy, Clone, Debug, Default)]
pub struct Proc;

fn percent(value: f64) -> u8 {
    (value * 100.0).round().clamp(0.0, 100.0) as u8
}

fn cpu() -> Option<f64> {
    let loadavg = std::fs::read_to_string("/proc/loadavg").ok()?;
    let load = loadavg.split_whitespace().next()?.parse::<f64>().ok()?;
    let cpus = std::thread::available_parallelism().map(|count| count.get()).unwrap_or(1);
    Some(load / cpus as f64)
}

fn field(meminfo: &str, name: &str) -> Option<f64> {
    meminfo.lines()
        .find(|line| line.starts_with(name))?
        .split_whitespace()
        .nth(1)?
        .parse()
        .ok()
}

fn mem() -> Option<f64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    let total = field(&meminfo, "MemTotal:")?;
    let available = field(&meminfo, "MemAvailable:")?;
    if total == 0.0 {
        return None
    }
    Some((total - available) / total)
}

impl Sampler for Proc {
    fn sample(&self) -> Usage {
        Usage {
            cpu_percent: cpu().map_or(0, percent),
            mem_percent: mem().map_or(0, percent),
        }
    }
}
