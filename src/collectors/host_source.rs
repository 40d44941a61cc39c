use crate::error::SourceError;
use crate::events::{metric, HostInfo, Sample};
use chrono::Utc;
use log::{debug, info, warn};
use nvml_wrapper::enum_wrappers::device::TemperatureSensor;
use nvml_wrapper::Nvml;
use std::fs;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};
use sysinfo::{Components, System};

/// Where Linux exposes cumulative kernel activity counters
const PROC_STAT_PATH: &str = "/proc/stat";

/// Requested sleep used to probe kernel timer latency
const LATENCY_PROBE: Duration = Duration::from_millis(1);

/// Sensor labels that identify a CPU package temperature
const CPU_SENSOR_HINTS: [&str; 5] = ["package", "tctl", "tdie", "coretemp", "cpu"];

/// Uniform access to host counters
///
/// Implementations read whatever the host exposes and return it as a
/// [`Sample`]. A counter that cannot be read is simply left out of the sample;
/// `read` fails only when nothing at all could be read.
#[cfg_attr(test, mockall::automock)]
pub trait MetricSource: Send {
    /// Read one sample of every available metric
    fn read(&mut self) -> Result<Sample, SourceError>;

    /// Static description of the host
    fn host_info(&self) -> HostInfo;
}

/// Cumulative activity counters from `/proc/stat`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KernelCounters {
    pub context_switches: u64,
    pub interrupts: u64,
    pub softirqs: u64,
}

impl KernelCounters {
    /// Per-second rates against an earlier reading
    ///
    /// # Returns
    ///
    /// `None` when no time has passed or any counter went backwards (a
    /// counter reset), since no meaningful rate exists then
    pub fn rates_since(&self, earlier: &KernelCounters, elapsed: Duration) -> Option<KernelRates> {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return None;
        }
        let delta = |now: u64, before: u64| now.checked_sub(before).map(|d| d as f64 / secs);
        Some(KernelRates {
            context_switches: delta(self.context_switches, earlier.context_switches)?,
            interrupts: delta(self.interrupts, earlier.interrupts)?,
            softirqs: delta(self.softirqs, earlier.softirqs)?,
        })
    }
}

/// Per-second kernel activity
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KernelRates {
    pub context_switches: f64,
    pub interrupts: f64,
    pub softirqs: f64,
}

/// Parse the `ctxt`, `intr` and `softirq` totals out of `/proc/stat` content
///
/// # Arguments
///
/// * `content` - Full text of `/proc/stat`
///
/// # Returns
///
/// The counters, or `None` if any of the three lines is missing or malformed
pub fn parse_proc_stat(content: &str) -> Option<KernelCounters> {
    let mut context_switches = None;
    let mut interrupts = None;
    let mut softirqs = None;

    for line in content.lines() {
        let mut fields = line.split_whitespace();
        let key = fields.next();
        // The first number after the key is the total; per-source columns follow
        let total = fields.next().and_then(|v| v.parse::<u64>().ok());
        match key {
            Some("ctxt") => context_switches = total,
            Some("intr") => interrupts = total,
            Some("softirq") => softirqs = total,
            _ => {}
        }
    }

    Some(KernelCounters {
        context_switches: context_switches?,
        interrupts: interrupts?,
        softirqs: softirqs?,
    })
}

/// Metric source backed by the local host
///
/// CPU, memory, frequency, process count and temperatures come from
/// `sysinfo`. Kernel activity rates come from `/proc/stat` where it exists.
/// GPU load and temperature come from NVML when an NVIDIA driver is present.
pub struct HostMetricSource {
    system: System,
    nvml: Option<Nvml>,
    proc_stat_path: PathBuf,
    previous_counters: Option<(Instant, KernelCounters)>,
}

impl HostMetricSource {
    pub fn new() -> Self {
        Self::with_proc_stat(PathBuf::from(PROC_STAT_PATH))
    }

    /// Create a source reading kernel counters from a custom path
    pub fn with_proc_stat(proc_stat_path: PathBuf) -> Self {
        let mut system = System::new();
        // CPU usage is a delta between two refreshes; prime the first one
        system.refresh_cpu();

        let nvml = match Nvml::init() {
            Ok(nvml) => {
                info!("NVML initialized, GPU metrics enabled");
                Some(nvml)
            }
            Err(e) => {
                info!("NVML unavailable ({}), GPU metrics disabled", e);
                None
            }
        };

        Self {
            system,
            nvml,
            proc_stat_path,
            previous_counters: None,
        }
    }

    fn read_cpu(&mut self, sample: &mut Sample) -> Result<(), SourceError> {
        self.system.refresh_cpu();
        let cpus = self.system.cpus();
        if cpus.is_empty() {
            return Err(SourceError::unavailable(metric::CPU_USAGE, "no CPUs reported"));
        }

        sample.insert(
            metric::CPU_USAGE,
            f64::from(self.system.global_cpu_info().cpu_usage()),
        );

        let mut total_freq = 0u64;
        for (index, cpu) in cpus.iter().enumerate() {
            total_freq += cpu.frequency();
            sample.insert(metric::core_freq(index), cpu.frequency() as f64);
        }
        sample.insert(metric::CPU_FREQ_MHZ, total_freq as f64 / cpus.len() as f64);
        Ok(())
    }

    fn read_memory(&mut self, sample: &mut Sample) -> Result<(), SourceError> {
        self.system.refresh_memory();
        let total = self.system.total_memory();
        if total == 0 {
            return Err(SourceError::unavailable(
                metric::MEMORY_USAGE,
                "total memory reported as zero",
            ));
        }
        let used = self.system.used_memory();
        sample.insert(metric::MEMORY_USAGE, used as f64 / total as f64 * 100.0);
        Ok(())
    }

    fn read_processes(&mut self, sample: &mut Sample) -> Result<(), SourceError> {
        self.system.refresh_processes();
        let count = self.system.processes().len();
        if count == 0 {
            return Err(SourceError::unavailable(
                metric::PROCESS_COUNT,
                "process table is empty",
            ));
        }
        sample.insert(metric::PROCESS_COUNT, count as f64);
        Ok(())
    }

    fn read_cpu_temperature(&self, sample: &mut Sample) -> Result<(), SourceError> {
        let components = Components::new_with_refreshed_list();
        let reading = components
            .iter()
            .find(|component| {
                let label = component.label().to_lowercase();
                CPU_SENSOR_HINTS.iter().any(|hint| label.contains(hint))
            })
            .map(|component| component.temperature())
            .filter(|temperature| temperature.is_finite());

        match reading {
            Some(temperature) => {
                sample.insert(metric::CPU_TEMP, f64::from(temperature));
                Ok(())
            }
            None => Err(SourceError::unavailable(
                metric::CPU_TEMP,
                "no CPU temperature sensor found",
            )),
        }
    }

    fn read_kernel_rates(&mut self, sample: &mut Sample) -> Result<(), SourceError> {
        let content = fs::read_to_string(&self.proc_stat_path)
            .map_err(|e| SourceError::unavailable(metric::CONTEXT_SWITCH_RATE, e))?;
        let counters = parse_proc_stat(&content).ok_or_else(|| {
            SourceError::unavailable(metric::CONTEXT_SWITCH_RATE, "malformed /proc/stat")
        })?;

        let now = Instant::now();
        let previous = self.previous_counters.replace((now, counters));
        let Some((then, earlier)) = previous else {
            // First read only establishes the baseline
            return Ok(());
        };

        match counters.rates_since(&earlier, now.duration_since(then)) {
            Some(rates) => {
                sample.insert(metric::CONTEXT_SWITCH_RATE, rates.context_switches);
                sample.insert(metric::INTERRUPT_RATE, rates.interrupts);
                sample.insert(metric::SOFTIRQ_RATE, rates.softirqs);
                Ok(())
            }
            None => Err(SourceError::unavailable(
                metric::SOFTIRQ_RATE,
                "kernel counters reset",
            )),
        }
    }

    fn read_gpu(&self, sample: &mut Sample) -> Result<(), SourceError> {
        let Some(nvml) = self.nvml.as_ref() else {
            return Ok(());
        };

        let device = nvml
            .device_by_index(0)
            .map_err(|e| SourceError::unavailable(metric::GPU_USAGE, e))?;

        match device.utilization_rates() {
            Ok(utilization) => sample.insert(metric::GPU_USAGE, f64::from(utilization.gpu)),
            Err(e) => debug!("{}", SourceError::unavailable(metric::GPU_USAGE, e)),
        }
        match device.temperature(TemperatureSensor::Gpu) {
            Ok(temperature) => sample.insert(metric::GPU_TEMP, f64::from(temperature)),
            Err(e) => debug!("{}", SourceError::unavailable(metric::GPU_TEMP, e)),
        }
        Ok(())
    }
}

impl Default for HostMetricSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Overshoot of a short timer sleep, in microseconds
///
/// A busy or stalled kernel wakes the sleeping thread late; the overshoot is a
/// portable proxy for scheduling and deferred-work latency.
pub fn probe_timer_latency(requested: Duration) -> f64 {
    let start = Instant::now();
    thread::sleep(requested);
    let overshoot = start.elapsed().saturating_sub(requested);
    overshoot.as_secs_f64() * 1_000_000.0
}

/// Add the timer latency reading to a sample of host counters
///
/// The latency reading measures this process rather than a host counter, so it
/// only rides along with a sample that already holds at least one counter.
///
/// # Returns
///
/// `SourceError::Degraded` if no host counter could be read
pub fn complete_sample(mut sample: Sample, latency_us: f64) -> Result<Sample, SourceError> {
    if sample.is_empty() {
        warn!("No host metric could be read");
        return Err(SourceError::Degraded("no host counter could be read".to_string()));
    }
    sample.insert(metric::KERNEL_LATENCY_US, latency_us);
    Ok(sample)
}

impl MetricSource for HostMetricSource {
    fn read(&mut self) -> Result<Sample, SourceError> {
        let mut sample = Sample::new(Utc::now());

        let results = [
            self.read_cpu(&mut sample),
            self.read_memory(&mut sample),
            self.read_processes(&mut sample),
            self.read_cpu_temperature(&mut sample),
            self.read_kernel_rates(&mut sample),
            self.read_gpu(&mut sample),
        ];
        for err in results.into_iter().filter_map(Result::err) {
            debug!("{}", err);
        }

        complete_sample(sample, probe_timer_latency(LATENCY_PROBE))
    }

    fn host_info(&self) -> HostInfo {
        let unknown = || "unknown".to_string();
        let os = match (System::name(), System::os_version()) {
            (Some(name), Some(version)) => format!("{} {}", name, version),
            (Some(name), None) => name,
            _ => unknown(),
        };

        HostInfo {
            host_name: System::host_name().unwrap_or_else(unknown),
            os,
            kernel_version: System::kernel_version().unwrap_or_else(unknown),
            cpu_brand: self
                .system
                .cpus()
                .first()
                .map(|cpu| cpu.brand().trim().to_string())
                .unwrap_or_else(unknown),
            core_count: self.system.cpus().len(),
            total_memory_gb: self.system.total_memory() as f64 / 1024.0 / 1024.0 / 1024.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const PROC_STAT: &str = "\
cpu  4705 356 584 3699 23 23 0 0 0 0
cpu0 1393280 32966 572056 13343292 6130 0 17875 0 23933 0
intr 114930548 113199788 3 0 5 263 0 4 [... lots more numbers ...]
ctxt 1990473
btime 1062191376
processes 2915
procs_running 1
procs_blocked 0
softirq 183433 0 21755 12 39 1137 231 21459 2263
";

    #[test]
    fn test_parse_proc_stat() {
        let counters = parse_proc_stat(PROC_STAT).unwrap();
        assert_eq!(counters.context_switches, 1_990_473);
        assert_eq!(counters.interrupts, 114_930_548);
        assert_eq!(counters.softirqs, 183_433);
    }

    #[test]
    fn test_parse_proc_stat_missing_line() {
        let content = "cpu 1 2 3\nctxt 10\nintr 20 1 2\n";
        assert_eq!(parse_proc_stat(content), None);
        assert_eq!(parse_proc_stat(""), None);
        assert_eq!(parse_proc_stat("ctxt x\nintr 1\nsoftirq 1\n"), None);
    }

    #[test]
    fn test_rates_since() {
        let earlier = KernelCounters {
            context_switches: 1_000,
            interrupts: 500,
            softirqs: 100,
        };
        let later = KernelCounters {
            context_switches: 5_000,
            interrupts: 1_500,
            softirqs: 300,
        };
        let rates = later.rates_since(&earlier, Duration::from_secs(2)).unwrap();
        assert_eq!(rates.context_switches, 2_000.0);
        assert_eq!(rates.interrupts, 500.0);
        assert_eq!(rates.softirqs, 100.0);
    }

    #[test]
    fn test_rates_since_counter_reset_or_no_time() {
        let earlier = KernelCounters {
            context_switches: 5_000,
            interrupts: 5_000,
            softirqs: 5_000,
        };
        let reset = KernelCounters::default();
        assert_eq!(reset.rates_since(&earlier, Duration::from_secs(1)), None);
        assert_eq!(earlier.rates_since(&earlier, Duration::ZERO), None);
    }

    #[test]
    fn test_probe_timer_latency_is_non_negative() {
        let latency = probe_timer_latency(Duration::from_millis(1));
        assert!(latency >= 0.0);
        assert!(latency.is_finite());
    }

    #[test]
    fn test_kernel_rates_need_two_reads() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", PROC_STAT).unwrap();
        let mut source = HostMetricSource::with_proc_stat(file.path().to_path_buf());

        let mut first = Sample::new(Utc::now());
        source.read_kernel_rates(&mut first).unwrap();
        assert_eq!(first.get(metric::SOFTIRQ_RATE), None);

        std::thread::sleep(Duration::from_millis(10));
        let mut second = Sample::new(Utc::now());
        source.read_kernel_rates(&mut second).unwrap();
        // Unchanged counters give a zero rate, not a missing one
        assert_eq!(second.get(metric::SOFTIRQ_RATE), Some(0.0));
        assert_eq!(second.get(metric::CONTEXT_SWITCH_RATE), Some(0.0));
    }

    #[test]
    fn test_missing_proc_stat_omits_kernel_rates() {
        let mut source = HostMetricSource::with_proc_stat(PathBuf::from("/nonexistent/stat"));
        let mut sample = Sample::new(Utc::now());
        let result = source.read_kernel_rates(&mut sample);
        assert!(matches!(result, Err(SourceError::Unavailable { .. })));
        assert!(sample.is_empty());
    }

    #[test]
    fn test_sample_without_counters_is_degraded() {
        let empty = Sample::new(Utc::now());
        assert!(matches!(
            complete_sample(empty, 12.0),
            Err(SourceError::Degraded(_))
        ));

        let sample = Sample::new(Utc::now()).with(metric::MEMORY_USAGE, 40.0);
        let sample = complete_sample(sample, 12.0).unwrap();
        assert_eq!(sample.get(metric::KERNEL_LATENCY_US), Some(12.0));
        assert_eq!(sample.get(metric::MEMORY_USAGE), Some(40.0));
    }

    #[test]
    fn test_host_read_produces_some_metrics() {
        let mut source = HostMetricSource::new();
        let sample = source.read().unwrap();
        assert!(!sample.degraded);
        // The latency probe works everywhere
        assert!(sample.get(metric::KERNEL_LATENCY_US).is_some());
        assert!(!source.host_info().host_name.is_empty());
    }
}
