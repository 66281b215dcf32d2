use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
pub struct State {
    pub started_at_unix: i64,
    hosts: HashMap<String, HostSnapshot>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct GpuStat {
    pub index: u32,
    pub name: String,
    pub bus_id: String,
    pub utilization_gpu: u32,
    pub memory_total_mib: u64,
    pub memory_used_mib: u64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct GpuProcessStat {
    pub gpu_id: u32,
    pub pid: u32,
    pub user: String,
    pub command: String,
    pub memory_used_mib: u64,
    pub gpu_memory_total_mib: u64,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(untagged)]
pub enum SnapshotOutcome {
    Collected {
        gpus: Vec<GpuStat>,
        users: Vec<GpuProcessStat>,
    },
    Failed {
        error: String,
    },
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct HostSnapshot {
    pub host_alias: String,
    pub timestamp: i64,
    #[serde(flatten)]
    pub outcome: SnapshotOutcome,
}

impl HostSnapshot {
    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, SnapshotOutcome::Failed { .. })
    }
}

impl State {
    pub fn new(now_unix: i64) -> Self {
        Self {
            started_at_unix: now_unix,
            ..Self::default()
        }
    }

    pub fn replace(&mut self, snapshot: HostSnapshot) {
        self.hosts.insert(snapshot.host_alias.clone(), snapshot);
    }

    pub fn get(&self, host_alias: &str) -> Option<&HostSnapshot> {
        self.hosts.get(host_alias)
    }

    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }

    pub fn snapshots(&self) -> Vec<HostSnapshot> {
        let mut out: Vec<HostSnapshot> = self.hosts.values().cloned().collect();
        out.sort_by(|a, b| a.host_alias.cmp(&b.host_alias));
        out
    }
}
