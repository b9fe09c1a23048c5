//! Host telemetry sources
//!
//! Reads resident memory from procfs and CPU temperature from sysfs thermal
//! zones. Sampling is a pure read; the monitor decides what a failure means.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

/// Millidegree readings below this are treated as already in degrees
const MILLIDEGREE_FLOOR: f64 = 1000.0;

/// Source of host telemetry
#[async_trait]
pub trait MetricsSampler: Send + Sync {
    /// Resident memory of this process in bytes
    async fn resident_memory_bytes(&self) -> Result<u64>;

    /// CPU temperature in degrees Celsius, `None` when no sensor is present
    async fn cpu_temperature_c(&self) -> Result<Option<f64>>;
}

/// Sampler backed by `/proc/self/status` and sysfs thermal zones
pub struct ProcSampler {
    status_path: PathBuf,
    thermal_paths: Vec<PathBuf>,
}

impl Default for ProcSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcSampler {
    pub fn new() -> Self {
        Self {
            status_path: PathBuf::from("/proc/self/status"),
            thermal_paths: vec![
                PathBuf::from("/sys/class/thermal/thermal_zone0/temp"),
                PathBuf::from("/sys/class/thermal/thermal_zone1/temp"),
                PathBuf::from("/sys/devices/virtual/thermal/thermal_zone0/temp"),
            ],
        }
    }

    /// Create a sampler reading from custom locations
    pub fn with_paths(status_path: impl Into<PathBuf>, thermal_paths: Vec<PathBuf>) -> Self {
        Self {
            status_path: status_path.into(),
            thermal_paths,
        }
    }

    /// Parse the `VmRSS` line of a procfs status file into bytes
    pub fn parse_vm_rss(content: &str) -> Result<u64> {
        let line = content
            .lines()
            .find(|line| line.starts_with("VmRSS:"))
            .context("VmRSS not present in status file")?;

        let mut parts = line.split_whitespace().skip(1);
        let value: u64 = parts
            .next()
            .context("VmRSS has no value")?
            .parse()
            .context("Failed to parse VmRSS value")?;

        let multiplier = match parts.next() {
            Some("kB") | Some("KB") | None => 1024,
            Some("mB") | Some("MB") => 1024 * 1024,
            Some(unit) => anyhow::bail!("Unknown VmRSS unit: {}", unit),
        };

        Ok(value * multiplier)
    }

    /// Parse a thermal zone reading. Sysfs reports millidegrees.
    pub fn parse_thermal_zone(content: &str) -> Result<f64> {
        let raw: f64 = content
            .trim()
            .parse()
            .context("Failed to parse thermal zone reading")?;

        if raw.abs() >= MILLIDEGREE_FLOOR {
            Ok(raw / 1000.0)
        } else {
            Ok(raw)
        }
    }
}

#[async_trait]
impl MetricsSampler for ProcSampler {
    async fn resident_memory_bytes(&self) -> Result<u64> {
        let content = tokio::fs::read_to_string(&self.status_path)
            .await
            .with_context(|| format!("Failed to read {}", self.status_path.display()))?;
        Self::parse_vm_rss(&content)
    }

    async fn cpu_temperature_c(&self) -> Result<Option<f64>> {
        for path in &self.thermal_paths {
            let Ok(content) = tokio::fs::read_to_string(path).await else {
                continue;
            };
            return Self::parse_thermal_zone(&content)
                .with_context(|| format!("Bad reading in {}", path.display()))
                .map(Some);
        }
        Ok(None)
    }
}

/// Sampler returning fixed readings that can be changed at runtime
///
/// Useful where procfs is unavailable and for driving the control loops
/// with known telemetry.
#[derive(Debug, Default)]
pub struct StaticSampler {
    readings: Mutex<(u64, Option<f64>)>,
}

impl StaticSampler {
    pub fn new(memory_bytes: u64, temperature_c: Option<f64>) -> Self {
        Self {
            readings: Mutex::new((memory_bytes, temperature_c)),
        }
    }

    /// Replace both readings
    pub fn set(&self, memory_bytes: u64, temperature_c: Option<f64>) {
        *self.readings.lock().unwrap_or_else(PoisonError::into_inner) =
            (memory_bytes, temperature_c);
    }

    fn readings(&self) -> (u64, Option<f64>) {
        *self.readings.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl MetricsSampler for StaticSampler {
    async fn resident_memory_bytes(&self) -> Result<u64> {
        Ok(self.readings().0)
    }

    async fn cpu_temperature_c(&self) -> Result<Option<f64>> {
        Ok(self.readings().1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_vm_rss() {
        let content = "Name:\trecon\nVmPeak:\t  204800 kB\nVmRSS:\t  102400 kB\nThreads:\t8\n";
        assert_eq!(ProcSampler::parse_vm_rss(content).unwrap(), 100 * 1024 * 1024);
    }

    #[test]
    fn test_parse_vm_rss_missing() {
        assert!(ProcSampler::parse_vm_rss("Name:\trecon\n").is_err());
    }

    #[test]
    fn test_parse_thermal_zone() {
        assert_eq!(ProcSampler::parse_thermal_zone("54000\n").unwrap(), 54.0);
        assert_eq!(ProcSampler::parse_thermal_zone("61500").unwrap(), 61.5);
        assert!(ProcSampler::parse_thermal_zone("hot").is_err());
    }

    #[tokio::test]
    async fn test_reads_first_available_zone() {
        let dir = tempfile::tempdir().unwrap();
        let status = dir.path().join("status");
        let zone = dir.path().join("zone1");
        std::fs::write(&status, "VmRSS:\t2048 kB\n").unwrap();
        std::fs::write(&zone, "47000\n").unwrap();

        let sampler = ProcSampler::with_paths(&status, vec![dir.path().join("zone0"), zone]);

        assert_eq!(sampler.resident_memory_bytes().await.unwrap(), 2048 * 1024);
        assert_eq!(sampler.cpu_temperature_c().await.unwrap(), Some(47.0));
    }

    #[tokio::test]
    async fn test_no_sensor_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let sampler = ProcSampler::with_paths(dir.path().join("status"), vec![dir.path().join("missing")]);

        assert!(sampler.resident_memory_bytes().await.is_err());
        assert_eq!(sampler.cpu_temperature_c().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_static_sampler_updates() {
        let sampler = StaticSampler::new(1024, None);
        assert_eq!(sampler.cpu_temperature_c().await.unwrap(), None);

        sampler.set(4096, Some(65.0));
        assert_eq!(sampler.resident_memory_bytes().await.unwrap(), 4096);
        assert_eq!(sampler.cpu_temperature_c().await.unwrap(), Some(65.0));
    }
}
