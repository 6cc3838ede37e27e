use crate::store::{disk_usage, DiskUsage};
use std::fs;
use std::path::{Path, PathBuf};

const ELEVATED_TEMP_C: f64 = 60.0;
const HIGH_TEMP_C: f64 = 70.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TempWarning {
    Elevated,
    High,
}

impl TempWarning {
    /// `None` at or below 60 °C.
    pub fn classify(celsius: f64) -> Option<Self> {
        if celsius > HIGH_TEMP_C {
            Some(TempWarning::High)
        } else if celsius > ELEVATED_TEMP_C {
            Some(TempWarning::Elevated)
        } else {
            None
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TempWarning::Elevated => "ELEVATED_TEMP",
            TempWarning::High => "HIGH_TEMP",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryUsage {
    pub total_kb: u64,
    pub free_kb: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadAverage {
    pub one: f64,
    pub five: f64,
    pub fifteen: f64,
}

/// One sample of host health. Fields the host could not provide are `None`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostReport {
    pub hostname: Option<String>,
    pub cpu_temp_c: Option<f64>,
    pub memory: Option<MemoryUsage>,
    pub disk: Option<DiskUsage>,
    pub uptime_secs: Option<f64>,
    pub load: Option<LoadAverage>,
}

impl HostReport {
    pub fn cpu_warning(&self) -> Option<TempWarning> {
        self.cpu_temp_c.and_then(TempWarning::classify)
    }

    pub fn health(&self) -> &'static str {
        self.cpu_warning().map_or("OK", TempWarning::as_str)
    }
}

/// Reads host health from procfs and sysfs.
#[derive(Debug, Clone)]
pub struct HostMonitor {
    proc_root: PathBuf,
    sys_root: PathBuf,
    disk_path: PathBuf,
}

impl HostMonitor {
    /// Disk figures are for the filesystem holding `disk_path`.
    pub fn new(disk_path: &Path) -> Self {
        Self::with_roots(Path::new("/proc"), Path::new("/sys"), disk_path)
    }

    pub fn with_roots(proc_root: &Path, sys_root: &Path, disk_path: &Path) -> Self {
        Self {
            proc_root: proc_root.to_path_buf(),
            sys_root: sys_root.to_path_buf(),
            disk_path: disk_path.to_path_buf(),
        }
    }

    pub fn collect(&self) -> HostReport {
        let disk = match disk_usage(&self.disk_path) {
            Ok(disk) => Some(disk),
            Err(err) => {
                tracing::debug!(error = %err, path = %self.disk_path.display(), "disk usage unavailable");
                None
            }
        };
        HostReport {
            hostname: self
                .read("hostname", self.proc_root.join("sys/kernel/hostname"))
                .map(|raw| raw.trim().to_string())
                .filter(|name| !name.is_empty()),
            cpu_temp_c: self
                .read("cpu temperature", self.sys_root.join("class/thermal/thermal_zone0/temp"))
                .and_then(|raw| parse_millidegrees(&raw)),
            memory: self
                .read("meminfo", self.proc_root.join("meminfo"))
                .and_then(|raw| parse_meminfo(&raw)),
            disk,
            uptime_secs: self
                .read("uptime", self.proc_root.join("uptime"))
                .and_then(|raw| parse_uptime(&raw)),
            load: self
                .read("loadavg", self.proc_root.join("loadavg"))
                .and_then(|raw| parse_loadavg(&raw)),
        }
    }

    fn read(&self, what: &str, path: PathBuf) -> Option<String> {
        match fs::read_to_string(&path) {
            Ok(raw) => Some(raw),
            Err(err) => {
                tracing::debug!(error = %err, path = %path.display(), "{what} unavailable");
                None
            }
        }
    }
}

fn parse_millidegrees(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().map(|milli| milli / 1000.0)
}

fn parse_meminfo(raw: &str) -> Option<MemoryUsage> {
    let field = |name: &str| {
        raw.lines()
            .find_map(|line| line.strip_prefix(name)?.strip_prefix(':'))
            .and_then(|rest| rest.split_whitespace().next()?.parse::<u64>().ok())
    };
    Some(MemoryUsage {
        total_kb: field("MemTotal")?,
        free_kb: field("MemFree")?,
    })
}

fn parse_uptime(raw: &str) -> Option<f64> {
    raw.split_whitespace().next()?.parse().ok()
}

fn parse_loadavg(raw: &str) -> Option<LoadAverage> {
    let mut fields = raw.split_whitespace().map(str::parse::<f64>);
    Some(LoadAverage {
        one: fields.next()?.ok()?,
        five: fields.next()?.ok()?,
        fifteen: fields.next()?.ok()?,
    })
}
