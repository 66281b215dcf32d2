pub mod nvidia;
pub mod remote;

use crate::state::{GpuProcessStat, GpuStat};

#[derive(Debug, Clone, Default)]
pub struct HostReport {
    pub gpus: Vec<GpuStat>,
    pub processes: Vec<GpuProcessStat>,
}
