use crate::collectors::HostReport;
use crate::state::{GpuProcessStat, GpuStat};
use std::collections::HashMap;
use tracing::debug;

pub const SECTION_SEPARATOR: &str = "---";
pub const USER_PLACEHOLDER: &str = "process";
pub const USER_UNKNOWN: &str = "unknown";

const NOT_SUPPORTED: &str = "[Not Supported]";

pub fn parse_report(raw: &str) -> HostReport {
    let mut gpu_lines = Vec::new();
    let mut process_lines = Vec::new();
    let mut in_process_section = false;

    for line in raw.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if line == SECTION_SEPARATOR {
            in_process_section = true;
            continue;
        }
        if in_process_section {
            process_lines.push(line);
        } else {
            gpu_lines.push(line);
        }
    }

    let gpus: Vec<GpuStat> = gpu_lines.iter().filter_map(|l| parse_gpu_line(l)).collect();

    // первый GpuStat выигрывает при повторе bus_id
    let mut by_bus_id: HashMap<&str, &GpuStat> = HashMap::new();
    for gpu in &gpus {
        by_bus_id.entry(gpu.bus_id.as_str()).or_insert(gpu);
    }

    let processes: Vec<GpuProcessStat> = process_lines
        .iter()
        .filter_map(|l| parse_process_line(l, &by_bus_id))
        .collect();

    HostReport { gpus, processes }
}

fn parse_gpu_line(line: &str) -> Option<GpuStat> {
    let parts: Vec<&str> = line.split(',').map(str::trim).collect();
    if parts.len() < 6 {
        debug!(line, "строка устройства отброшена: меньше 6 полей");
        return None;
    }

    let stat = GpuStat {
        index: parts[0].parse().ok()?,
        name: parts[1].to_string(),
        bus_id: parts[2].to_string(),
        utilization_gpu: parts[3].parse().ok()?,
        memory_total_mib: parts[4].parse().ok()?,
        memory_used_mib: parts[5].parse().ok()?,
    };
    Some(stat)
}

fn parse_process_line(line: &str, by_bus_id: &HashMap<&str, &GpuStat>) -> Option<GpuProcessStat> {
    let parts: Vec<&str> = line.split(',').map(str::trim).collect();
    if parts.len() < 4 {
        debug!(line, "строка процесса отброшена: меньше 4 полей");
        return None;
    }

    let gpu = by_bus_id.get(parts[0])?;
    let pid: u32 = parts[1].parse().ok().filter(|pid| *pid > 0)?;
    let memory_used_mib = parse_process_memory(parts[3])?;

    Some(GpuProcessStat {
        gpu_id: gpu.index,
        pid,
        user: USER_PLACEHOLDER.to_string(),
        command: parts[2].to_string(),
        memory_used_mib,
        gpu_memory_total_mib: gpu.memory_total_mib,
    })
}

fn parse_process_memory(field: &str) -> Option<u64> {
    if field.is_empty() || field == NOT_SUPPORTED {
        return Some(0);
    }
    field.parse().ok()
}

pub fn parse_ps_users(raw: &str) -> HashMap<u32, String> {
    let mut users = HashMap::new();
    for line in raw.lines() {
        let mut fields = line.split_whitespace();
        let (Some(pid), Some(user)) = (fields.next(), fields.next()) else {
            continue;
        };
        let Ok(pid) = pid.parse::<u32>() else {
            continue;
        };
        users.insert(pid, user.to_string());
    }
    users
}

pub fn apply_users(processes: &mut [GpuProcessStat], users: &HashMap<u32, String>) {
    for process in processes {
        process.user = users
            .get(&process.pid)
            .cloned()
            .unwrap_or_else(|| USER_UNKNOWN.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_REPORT: &str = "\
0, TeslaX, 0000:01:00.0, 42, 16384, 1024
---
0000:01:00.0, 555, train.py, 512
";

    #[test]
    fn full_report_round_trips() {
        let report = parse_report(FULL_REPORT);

        assert_eq!(report.gpus.len(), 1);
        let gpu = &report.gpus[0];
        assert_eq!(gpu.index, 0);
        assert_eq!(gpu.name, "TeslaX");
        assert_eq!(gpu.bus_id, "0000:01:00.0");
        assert_eq!(gpu.utilization_gpu, 42);
        assert_eq!(gpu.memory_total_mib, 16384);
        assert_eq!(gpu.memory_used_mib, 1024);

        assert_eq!(report.processes.len(), 1);
        let process = &report.processes[0];
        assert_eq!(process.gpu_id, 0);
        assert_eq!(process.pid, 555);
        assert_eq!(process.user, USER_PLACEHOLDER);
        assert_eq!(process.command, "train.py");
        assert_eq!(process.memory_used_mib, 512);
        assert_eq!(process.gpu_memory_total_mib, 16384);
    }

    #[test]
    fn parsing_is_idempotent() {
        let first = parse_report(FULL_REPORT);
        let second = parse_report(FULL_REPORT);
        assert_eq!(
            serde_json::to_value(&first.gpus).unwrap(),
            serde_json::to_value(&second.gpus).unwrap()
        );
        assert_eq!(
            serde_json::to_value(&first.processes).unwrap(),
            serde_json::to_value(&second.processes).unwrap()
        );
    }

    #[test]
    fn short_gpu_line_is_dropped() {
        let report = parse_report("0, TeslaX, 0000:01:00.0, 42, 16384\n");
        assert!(report.gpus.is_empty());
    }

    #[test]
    fn non_numeric_gpu_field_drops_line() {
        let report = parse_report(
            "0, TeslaX, 0000:01:00.0, N/A, 16384, 1024\n1, TeslaY, 0000:02:00.0, 7, 16384, 2048\n",
        );
        assert_eq!(report.gpus.len(), 1);
        assert_eq!(report.gpus[0].index, 1);
    }

    #[test]
    fn missing_separator_means_devices_only() {
        let report = parse_report("0, TeslaX, 0000:01:00.0, 42, 16384, 1024\n");
        assert_eq!(report.gpus.len(), 1);
        assert!(report.processes.is_empty());
    }

    #[test]
    fn device_order_is_preserved() {
        let report = parse_report(
            "1, TeslaY, 0000:02:00.0, 7, 16384, 2048\n0, TeslaX, 0000:01:00.0, 42, 16384, 1024\n",
        );
        let indexes: Vec<u32> = report.gpus.iter().map(|g| g.index).collect();
        assert_eq!(indexes, vec![1, 0]);
    }

    #[test]
    fn short_process_line_is_dropped() {
        let report = parse_report("0, TeslaX, 0000:01:00.0, 42, 16384, 1024\n---\n0000:01:00.0, 555, train.py\n");
        assert!(report.processes.is_empty());
    }

    #[test]
    fn process_with_unknown_bus_id_is_dropped() {
        let report = parse_report("0, TeslaX, 0000:01:00.0, 42, 16384, 1024\n---\n0000:09:00.0, 555, train.py, 512\n");
        assert!(report.processes.is_empty());
    }

    #[test]
    fn process_with_bad_pid_is_dropped() {
        let report = parse_report("0, TeslaX, 0000:01:00.0, 42, 16384, 1024\n---\n0000:01:00.0, abc, train.py, 512\n");
        assert!(report.processes.is_empty());
    }

    #[test]
    fn unsupported_process_memory_maps_to_zero() {
        let report = parse_report(
            "0, TeslaX, 0000:01:00.0, 42, 16384, 1024\n---\n0000:01:00.0, 555, train.py, [Not Supported]\n0000:01:00.0, 556, eval.py,\n",
        );
        assert_eq!(report.processes.len(), 2);
        assert_eq!(report.processes[0].memory_used_mib, 0);
        assert_eq!(report.processes[1].memory_used_mib, 0);
    }

    #[test]
    fn duplicate_bus_id_first_device_wins() {
        let report = parse_report(
            "0, TeslaX, 0000:01:00.0, 42, 16384, 1024\n1, TeslaY, 0000:01:00.0, 7, 32768, 2048\n---\n0000:01:00.0, 555, train.py, 512\n",
        );
        assert_eq!(report.gpus.len(), 2);
        assert_eq!(report.processes.len(), 1);
        assert_eq!(report.processes[0].gpu_id, 0);
        assert_eq!(report.processes[0].gpu_memory_total_mib, 16384);
    }

    #[test]
    fn ps_users_parses_pairs_and_last_pid_wins() {
        let users = parse_ps_users("  111 alice\n222 bob\nmangled\n222 carol\n");
        assert_eq!(users.len(), 2);
        assert_eq!(users[&111], "alice");
        assert_eq!(users[&222], "carol");
    }

    #[test]
    fn apply_users_maps_known_and_defaults_unknown() {
        let mut report = parse_report(
            "0, TeslaX, 0000:01:00.0, 42, 16384, 1024\n---\n0000:01:00.0, 111, train.py, 512\n0000:01:00.0, 222, eval.py, 128\n",
        );

        let users = parse_ps_users("111 alice\n");
        apply_users(&mut report.processes, &users);
        assert_eq!(report.processes[0].user, "alice");
        assert_eq!(report.processes[1].user, USER_UNKNOWN);

        let users = parse_ps_users("111 alice\n222 bob\n");
        apply_users(&mut report.processes, &users);
        assert_eq!(report.processes[0].user, "alice");
        assert_eq!(report.processes[1].user, "bob");
    }

    #[test]
    fn apply_users_with_empty_lookup_defaults_all_to_unknown() {
        let mut report = parse_report("0, TeslaX, 0000:01:00.0, 42, 16384, 1024\n---\n0000:01:00.0, 111, train.py, 512\n");
        apply_users(&mut report.processes, &HashMap::new());
        assert_eq!(report.processes[0].user, USER_UNKNOWN);
    }
}
