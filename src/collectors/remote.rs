use crate::collectors::nvidia::{self, SECTION_SEPARATOR};
use crate::config::SshConfig;
use std::collections::HashMap;
use std::process::{ExitStatus, Output, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

pub const DEVICE_QUERY: &str = "nvidia-smi --query-gpu=index,name,pci.bus_id,utilization.gpu,memory.total,memory.used --format=csv,noheader,nounits";
pub const PROCESS_QUERY: &str = "nvidia-smi --query-compute-apps=gpu_bus_id,pid,process_name,used_memory --format=csv,noheader,nounits";

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("timeout: ssh to '{host}' did not complete within {timeout_secs}s")]
    Timeout { host: String, timeout_secs: u64 },
    #[error("failed to spawn ssh: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("remote command failed: {0}")]
    Remote(String),
}

pub fn inventory_command() -> String {
    format!("{DEVICE_QUERY} && echo '{SECTION_SEPARATOR}' && {PROCESS_QUERY}")
}

pub fn ps_command(pids: &[u32]) -> String {
    let list = pids
        .iter()
        .map(|pid| pid.to_string())
        .collect::<Vec<_>>()
        .join(",");
    format!("ps -o pid,user --no-headers -p {list} 2>/dev/null || true")
}

fn ssh_args(host: &str, remote_cmd: &str, connect_timeout_secs: u64) -> Vec<String> {
    vec![
        "-o".to_string(),
        "BatchMode=yes".to_string(),
        "-o".to_string(),
        format!("ConnectTimeout={connect_timeout_secs}"),
        host.to_string(),
        remote_cmd.to_string(),
    ]
}

async fn run_ssh(host: &str, remote_cmd: &str, ssh: &SshConfig) -> Result<Output, QueryError> {
    let child = Command::new("ssh")
        .args(ssh_args(host, remote_cmd, ssh.connect_timeout_secs))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    // при таймауте future дропается, kill_on_drop добивает процесс ssh
    match tokio::time::timeout(
        Duration::from_secs(ssh.command_timeout_secs),
        child.wait_with_output(),
    )
    .await
    {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(err)) => Err(QueryError::Spawn(err)),
        Err(_elapsed) => Err(QueryError::Timeout {
            host: host.to_string(),
            timeout_secs: ssh.command_timeout_secs,
        }),
    }
}

pub async fn query_host(host: &str, ssh: &SshConfig) -> Result<String, QueryError> {
    let output = run_ssh(host, &inventory_command(), ssh).await?;
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();

    if !output.status.success() {
        if stdout.is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(QueryError::Remote(format!(
                "{}: {stderr}",
                describe_exit(&output.status)
            )));
        }
        // ненулевой код выхода, но stdout не пуст: частичный вывод лучше, чем никакого
        debug!(
            host,
            status = %output.status,
            "ssh завершился с ошибкой, разбираем полученный stdout"
        );
    }

    Ok(stdout)
}

pub async fn resolve_users(host: &str, pids: &[u32], ssh: &SshConfig) -> HashMap<u32, String> {
    if pids.is_empty() {
        return HashMap::new();
    }

    match run_ssh(host, &ps_command(pids), ssh).await {
        Ok(output) if output.status.success() => {
            nvidia::parse_ps_users(&String::from_utf8_lossy(&output.stdout))
        }
        Ok(output) => {
            warn!(host, status = %output.status, "не удалось определить владельцев процессов");
            HashMap::new()
        }
        Err(err) => {
            warn!(host, error = %err, "не удалось определить владельцев процессов");
            HashMap::new()
        }
    }
}

fn describe_exit(status: &ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit {code}"),
        None => "killed by signal".to_string(),
    }
}
