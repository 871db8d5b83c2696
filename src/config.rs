use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::buffer::{BufferConfig, Policy, ServiceOptions};
use crate::counters::AgentDescriptor;

/// Top-level configuration for counterflow.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Metric definition file. Relative paths resolve against the
    /// directory of the config file.
    #[serde(default)]
    pub metric_definitions: PathBuf,

    /// Flush worker configuration.
    #[serde(default)]
    pub flush: FlushConfig,

    /// Record buffers to create at startup.
    #[serde(default)]
    pub buffers: Vec<BufferEntry>,

    /// Agents whose properties back constant metrics.
    #[serde(default)]
    pub agents: Vec<AgentDescriptor>,
}

/// Flush worker configuration.
#[derive(Debug, Deserialize)]
pub struct FlushConfig {
    /// Threads available to drain buffers. Default: 2.
    #[serde(default = "default_flush_workers")]
    pub workers: usize,

    /// Sleep between checks while waiting on a busy buffer. Default: 100us.
    #[serde(default = "default_busy_poll_interval", with = "humantime_serde")]
    pub busy_poll_interval: Duration,
}

/// One record buffer.
#[derive(Debug, Clone, Deserialize)]
pub struct BufferEntry {
    /// Unique buffer name, used as its metric label.
    pub name: String,

    /// Bytes per internal record buffer. Default: 1MB.
    #[serde(default = "default_buffer_size")]
    pub size: usize,

    /// Fill level in bytes that starts a background flush; 0 disables it.
    #[serde(default)]
    pub watermark: usize,

    /// Overflow policy: "discard" or "lossless". Default: discard.
    #[serde(default)]
    pub policy: Policy,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_flush_workers() -> usize {
    2
}

fn default_busy_poll_interval() -> Duration {
    Duration::from_micros(100)
}

fn default_buffer_size() -> usize {
    1024 * 1024
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            metric_definitions: PathBuf::new(),
            flush: FlushConfig::default(),
            buffers: Vec::new(),
            agents: Vec::new(),
        }
    }
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            workers: default_flush_workers(),
            busy_poll_interval: default_busy_poll_interval(),
        }
    }
}

impl FlushConfig {
    pub fn service_options(&self) -> ServiceOptions {
        ServiceOptions {
            flush_workers: self.workers,
            busy_poll_interval: self.busy_poll_interval,
        }
    }
}

impl BufferEntry {
    pub fn buffer_config(&self, context_id: u64) -> BufferConfig {
        BufferConfig {
            name: self.name.clone(),
            context_id,
            size: self.size,
            watermark: self.watermark,
            policy: self.policy,
            user_data: 0,
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let mut cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        if cfg.metric_definitions.is_relative() {
            if let Some(dir) = path.parent() {
                cfg.metric_definitions = dir.join(&cfg.metric_definitions);
            }
        }

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.metric_definitions.as_os_str().is_empty() {
            bail!("metric_definitions is required");
        }

        if self.flush.workers == 0 {
            bail!("flush.workers must be positive");
        }

        if self.flush.busy_poll_interval.is_zero() {
            bail!("flush.busy_poll_interval must be positive");
        }

        let mut names = HashSet::new();
        for buffer in &self.buffers {
            if buffer.name.is_empty() {
                bail!("buffer name is required");
            }
            if !names.insert(buffer.name.as_str()) {
                bail!("duplicate buffer name: {}", buffer.name);
            }
            if buffer.size == 0 {
                bail!("buffer {}: size must be positive", buffer.name);
            }
            if buffer.watermark > buffer.size {
                bail!(
                    "buffer {}: watermark {} exceeds size {}",
                    buffer.name,
                    buffer.watermark,
                    buffer.size
                );
            }
        }

        let mut agents = HashSet::new();
        for agent in &self.agents {
            if agent.name.is_empty() {
                bail!("agent name is required");
            }
            if !agents.insert(agent.name.as_str()) {
                bail!("duplicate agent name: {}", agent.name);
            }
            if agent.architecture.is_empty() {
                bail!("agent {}: architecture is required", agent.name);
            }
        }

        Ok(())
    }

    /// Looks up an agent by name.
    pub fn agent(&self, name: &str) -> Option<&AgentDescriptor> {
        self.agents.iter().find(|a| a.name == name)
    }

    /// Looks up a buffer by name.
    pub fn buffer(&self, name: &str) -> Option<&BufferEntry> {
        self.buffers.iter().find(|b| b.name == name)
    }
}
