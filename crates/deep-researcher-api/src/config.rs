use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub listen_addr: String,
    pub max_concurrent_runs: usize,
    pub auth_token: Option<String>,
    /// File-backed checkpoints when set, in-memory otherwise.
    pub checkpoint_dir: Option<PathBuf>,
    /// Research configuration file; falls back to `DEEPRESEARCHER_CONFIG`.
    pub config_path: Option<PathBuf>,
    /// Scripted models instead of provider APIs.
    pub offline: bool,
}

impl AppConfig {
    const DEFAULT_LISTEN_ADDR: &'static str = "0.0.0.0:8080";
    const DEFAULT_MAX_RUNS: usize = 5;

    pub fn from_env() -> Result<Self> {
        let listen_addr = env::var("DEEPRESEARCHER_API_ADDR")
            .unwrap_or_else(|_| Self::DEFAULT_LISTEN_ADDR.to_string());

        let max_concurrent_runs = match non_empty("DEEPRESEARCHER_MAX_CONCURRENT_RUNS") {
            Some(value) => value
                .parse::<usize>()
                .ok()
                .filter(|limit| *limit > 0)
                .with_context(|| {
                    format!("DEEPRESEARCHER_MAX_CONCURRENT_RUNS must be a positive integer, got `{value}`")
                })?,
            None => Self::DEFAULT_MAX_RUNS,
        };

        let offline = non_empty("DEEPRESEARCHER_OFFLINE")
            .and_then(|value| parse_bool(&value))
            .unwrap_or(false);

        Ok(Self {
            listen_addr,
            max_concurrent_runs,
            auth_token: non_empty("DEEPRESEARCHER_API_TOKEN"),
            checkpoint_dir: non_empty("DEEPRESEARCHER_CHECKPOINT_DIR").map(PathBuf::from),
            config_path: None,
            offline,
        })
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen_addr: Self::DEFAULT_LISTEN_ADDR.to_string(),
            max_concurrent_runs: Self::DEFAULT_MAX_RUNS,
            auth_token: None,
            checkpoint_dir: None,
            config_path: None,
            offline: false,
        }
    }
}

fn non_empty(var: &str) -> Option<String> {
    env::var(var)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_bool(input: &str) -> Option<bool> {
    match input.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
