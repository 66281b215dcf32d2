use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default)]
    pub ssh: SshConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SshConfig {
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            command_timeout_secs: default_command_timeout_secs(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("не удалось прочитать файл конфигурации {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("не удалось разобрать YAML в {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("ошибка валидации конфигурации: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        let cfg: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.trim().is_empty() {
            return Err(ConfigError::Validation(
                "поле listen обязательно".to_string(),
            ));
        }
        if SocketAddr::from_str(&self.listen).is_err() {
            return Err(ConfigError::Validation(
                "поле listen должно быть корректным адресом host:port".to_string(),
            ));
        }
        if self.interval_secs < 1 {
            return Err(ConfigError::Validation(
                "interval_secs должно быть >= 1".to_string(),
            ));
        }

        validate_hosts(&self.hosts)?;
        validate_ssh(&self.ssh)?;

        Ok(())
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

fn validate_hosts(hosts: &[String]) -> Result<(), ConfigError> {
    if hosts.is_empty() {
        return Err(ConfigError::Validation(
            "hosts пуст: укажите хотя бы один ssh-алиас".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    for host in hosts {
        if host.trim().is_empty() {
            return Err(ConfigError::Validation(
                "hosts[*] не должен быть пустым".to_string(),
            ));
        }
        if host.chars().any(char::is_whitespace) {
            return Err(ConfigError::Validation(format!(
                "алиас хоста '{host}' не должен содержать пробелов"
            )));
        }
        if !seen.insert(host.clone()) {
            return Err(ConfigError::Validation(format!(
                "алиас хоста '{host}' должен быть уникальным"
            )));
        }
    }
    Ok(())
}

fn validate_ssh(ssh: &SshConfig) -> Result<(), ConfigError> {
    if ssh.connect_timeout_secs < 1 {
        return Err(ConfigError::Validation(
            "ssh.connect_timeout_secs должно быть >= 1".to_string(),
        ));
    }
    if ssh.command_timeout_secs < 1 {
        return Err(ConfigError::Validation(
            "ssh.command_timeout_secs должно быть >= 1".to_string(),
        ));
    }
    if ssh.command_timeout_secs <= ssh.connect_timeout_secs {
        return Err(ConfigError::Validation(
            "ssh.command_timeout_secs должно быть больше ssh.connect_timeout_secs, иначе ssh не успеет сообщить о своём таймауте".to_string(),
        ));
    }
    Ok(())
}

fn default_listen() -> String {
    "127.0.0.1:8000".to_string()
}

const fn default_interval_secs() -> u64 {
    5
}

const fn default_connect_timeout_secs() -> u64 {
    5
}

const fn default_command_timeout_secs() -> u64 {
    15
}
