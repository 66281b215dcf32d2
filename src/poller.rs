use crate::collectors::{nvidia, remote, HostReport};
use crate::config::Config;
use crate::metrics::Metrics;
use crate::state::{HostSnapshot, SnapshotOutcome, State};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{watch, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub type SharedState = Arc<RwLock<State>>;

pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Бесконечный цикл опроса одного хоста. Циклы строго последовательны:
/// следующий tick не начнётся, пока не дописан снапшот текущего.
pub async fn poll_host(
    host: String,
    cfg: Arc<Config>,
    state: SharedState,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(cfg.interval_secs));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!(host = %host, interval_secs = cfg.interval_secs, "запущен опрос хоста");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!(host = %host, "опрос хоста остановлен");
                break;
            }
            _ = ticker.tick() => {
                let snapshot = run_cycle(&host, &cfg).await;
                metrics.observe_poll(&snapshot);
                state.write().await.replace(snapshot);
            }
        }
    }
}

async fn run_cycle(host: &str, cfg: &Config) -> HostSnapshot {
    let started = now_unix();

    match remote::query_host(host, &cfg.ssh).await {
        Ok(raw) => {
            let mut report = nvidia::parse_report(&raw);
            resolve_report_users(host, cfg, &mut report).await;
            debug!(
                host,
                gpus = report.gpus.len(),
                processes = report.processes.len(),
                "цикл опроса завершён"
            );
            collected_snapshot(host, started, report)
        }
        Err(err) => {
            warn!(host, error = %err, "цикл опроса завершился ошибкой");
            failed_snapshot(host, started, &err)
        }
    }
}

async fn resolve_report_users(host: &str, cfg: &Config, report: &mut HostReport) {
    if report.processes.is_empty() {
        return;
    }
    let pids: Vec<u32> = report.processes.iter().map(|p| p.pid).collect();
    let users = remote::resolve_users(host, &pids, &cfg.ssh).await;
    nvidia::apply_users(&mut report.processes, &users);
}

fn collected_snapshot(host: &str, timestamp: i64, report: HostReport) -> HostSnapshot {
    HostSnapshot {
        host_alias: host.to_string(),
        timestamp,
        outcome: SnapshotOutcome::Collected {
            gpus: report.gpus,
            users: report.processes,
        },
    }
}

fn failed_snapshot(host: &str, timestamp: i64, err: &remote::QueryError) -> HostSnapshot {
    HostSnapshot {
        host_alias: host.to_string(),
        timestamp,
        outcome: SnapshotOutcome::Failed {
            error: err.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::remote::QueryError;

    #[test]
    fn failed_snapshot_carries_tagged_reason() {
        let err = QueryError::Timeout {
            host: "node-a".to_string(),
            timeout_secs: 15,
        };
        let snapshot = failed_snapshot("node-a", 100, &err);

        assert_eq!(snapshot.host_alias, "node-a");
        assert_eq!(snapshot.timestamp, 100);
        let json = serde_json::to_value(&snapshot).unwrap();
        assert!(json["error"].as_str().unwrap().starts_with("timeout:"));
        assert!(json.get("gpus").is_none());
    }

    #[test]
    fn collected_snapshot_keeps_report_order() {
        let report = nvidia::parse_report(
            "1, TeslaY, 0000:02:00.0, 7, 16384, 2048\n0, TeslaX, 0000:01:00.0, 42, 16384, 1024\n",
        );
        let snapshot = collected_snapshot("node-a", 200, report);

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["gpus"][0]["index"], 1);
        assert_eq!(json["gpus"][1]["index"], 0);
        assert_eq!(json["users"].as_array().unwrap().len(), 0);
    }
}
