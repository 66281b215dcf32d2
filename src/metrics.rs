use crate::state::{HostSnapshot, SnapshotOutcome, State};
use prometheus::core::Collector;
use prometheus::{opts, Counter, CounterVec, Encoder, Gauge, GaugeVec, Registry, TextEncoder};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub gpumon_uptime_seconds: Gauge,
    pub gpumon_hosts_configured: Gauge,
    pub gpumon_host_up: GaugeVec,
    pub gpumon_last_poll_timestamp_seconds: GaugeVec,
    pub gpumon_poll_cycles_total: CounterVec,
    pub gpumon_poll_errors_total: CounterVec,
    pub gpumon_gpu_utilization_percent: GaugeVec,
    pub gpumon_gpu_memory_used_mib: GaugeVec,
    pub gpumon_gpu_memory_total_mib: GaugeVec,
    pub gpumon_gpu_count: GaugeVec,
    pub gpumon_gpu_process_count: GaugeVec,
    pub gpumon_scrape_count_total: Counter,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let gpumon_uptime_seconds = Gauge::with_opts(opts!(
            "gpumon_uptime_seconds",
            "Seconds since the monitor started"
        ))?;
        let gpumon_hosts_configured = Gauge::with_opts(opts!(
            "gpumon_hosts_configured",
            "Number of hosts in the polling set"
        ))?;
        let gpumon_host_up = GaugeVec::new(
            opts!(
                "gpumon_host_up",
                "1 if the last poll of the host succeeded, 0 otherwise"
            ),
            &["host"],
        )?;
        let gpumon_last_poll_timestamp_seconds = GaugeVec::new(
            opts!(
                "gpumon_last_poll_timestamp_seconds",
                "Unix timestamp of the last poll cycle by host"
            ),
            &["host"],
        )?;
        let gpumon_poll_cycles_total = CounterVec::new(
            opts!("gpumon_poll_cycles_total", "Completed poll cycles by host"),
            &["host"],
        )?;
        let gpumon_poll_errors_total = CounterVec::new(
            opts!(
                "gpumon_poll_errors_total",
                "Poll cycles that ended with an error snapshot by host"
            ),
            &["host"],
        )?;
        let gpumon_gpu_utilization_percent = GaugeVec::new(
            opts!(
                "gpumon_gpu_utilization_percent",
                "GPU utilization in percent by host and device index"
            ),
            &["host", "gpu"],
        )?;
        let gpumon_gpu_memory_used_mib = GaugeVec::new(
            opts!(
                "gpumon_gpu_memory_used_mib",
                "GPU memory used in MiB by host and device index"
            ),
            &["host", "gpu"],
        )?;
        let gpumon_gpu_memory_total_mib = GaugeVec::new(
            opts!(
                "gpumon_gpu_memory_total_mib",
                "GPU memory total in MiB by host and device index"
            ),
            &["host", "gpu"],
        )?;
        let gpumon_gpu_count = GaugeVec::new(
            opts!("gpumon_gpu_count", "Devices in the last snapshot by host"),
            &["host"],
        )?;
        let gpumon_gpu_process_count = GaugeVec::new(
            opts!(
                "gpumon_gpu_process_count",
                "Compute processes in the last snapshot by host"
            ),
            &["host"],
        )?;
        let gpumon_scrape_count_total = Counter::with_opts(opts!(
            "gpumon_scrape_count_total",
            "Prometheus scrapes served"
        ))?;

        register(&registry, &gpumon_uptime_seconds)?;
        register(&registry, &gpumon_hosts_configured)?;
        register(&registry, &gpumon_host_up)?;
        register(&registry, &gpumon_last_poll_timestamp_seconds)?;
        register(&registry, &gpumon_poll_cycles_total)?;
        register(&registry, &gpumon_poll_errors_total)?;
        register(&registry, &gpumon_gpu_utilization_percent)?;
        register(&registry, &gpumon_gpu_memory_used_mib)?;
        register(&registry, &gpumon_gpu_memory_total_mib)?;
        register(&registry, &gpumon_gpu_count)?;
        register(&registry, &gpumon_gpu_process_count)?;
        register(&registry, &gpumon_scrape_count_total)?;

        Ok(Arc::new(Self {
            registry,
            gpumon_uptime_seconds,
            gpumon_hosts_configured,
            gpumon_host_up,
            gpumon_last_poll_timestamp_seconds,
            gpumon_poll_cycles_total,
            gpumon_poll_errors_total,
            gpumon_gpu_utilization_percent,
            gpumon_gpu_memory_used_mib,
            gpumon_gpu_memory_total_mib,
            gpumon_gpu_count,
            gpumon_gpu_process_count,
            gpumon_scrape_count_total,
        }))
    }

    pub fn set_hosts_configured(&self, count: usize) {
        self.gpumon_hosts_configured.set(count as f64);
    }

    pub fn observe_poll(&self, snapshot: &HostSnapshot) {
        let host = snapshot.host_alias.as_str();
        self.gpumon_poll_cycles_total.with_label_values(&[host]).inc();
        self.gpumon_last_poll_timestamp_seconds
            .with_label_values(&[host])
            .set(snapshot.timestamp as f64);

        match &snapshot.outcome {
            SnapshotOutcome::Collected { gpus, users } => {
                self.gpumon_host_up.with_label_values(&[host]).set(1.0);
                self.gpumon_gpu_count
                    .with_label_values(&[host])
                    .set(gpus.len() as f64);
                self.gpumon_gpu_process_count
                    .with_label_values(&[host])
                    .set(users.len() as f64);
                for gpu in gpus {
                    let index = gpu.index.to_string();
                    self.gpumon_gpu_utilization_percent
                        .with_label_values(&[host, &index])
                        .set(gpu.utilization_gpu as f64);
                    self.gpumon_gpu_memory_used_mib
                        .with_label_values(&[host, &index])
                        .set(gpu.memory_used_mib as f64);
                    self.gpumon_gpu_memory_total_mib
                        .with_label_values(&[host, &index])
                        .set(gpu.memory_total_mib as f64);
                }
            }
            SnapshotOutcome::Failed { .. } => {
                self.gpumon_poll_errors_total
                    .with_label_values(&[host])
                    .inc();
                self.gpumon_host_up.with_label_values(&[host]).set(0.0);
            }
        }
    }

    pub fn update_runtime(&self, state: &State) {
        self.gpumon_uptime_seconds
            .set(now_unix().saturating_sub(state.started_at_unix) as f64);
    }

    pub fn inc_scrape_count(&self) {
        self.gpumon_scrape_count_total.inc();
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
