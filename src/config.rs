use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub console: ConsoleConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SandboxConfig {
    #[serde(default)]
    pub isolation: Isolation,
    /// Binary started as `<program> sandbox-worker` in process mode.
    /// Defaults to the running executable. Supports ${ENV_VAR} substitution
    pub worker_program: Option<PathBuf>,
    /// How long a run request waits for the sandbox's `ready` frame
    #[serde(default = "default_ready_timeout_ms")]
    pub ready_timeout_ms: u64,
    /// Dispose the sandbox this long after a run request. Absent = never
    pub watchdog_ms: Option<u64>,
    /// Whether sandboxed code may use `fetch()`
    #[serde(default = "default_allow_network")]
    pub allow_network: bool,
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Isolation {
    /// One child process per sandbox
    #[default]
    Process,
    /// One OS thread per sandbox, in the controller's process
    Thread,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct EngineConfig {
    pub loop_iteration_limit: Option<u64>,
    pub recursion_limit: Option<usize>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ConsoleConfig {
    /// Quiet period after which `--once` considers a run finished
    #[serde(default = "default_linger_ms")]
    pub linger_ms: u64,
}

fn default_ready_timeout_ms() -> u64 {
    1000
}

fn default_allow_network() -> bool {
    true
}

fn default_linger_ms() -> u64 {
    500
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            isolation: Isolation::default(),
            worker_program: None,
            ready_timeout_ms: default_ready_timeout_ms(),
            watchdog_ms: None,
            allow_network: default_allow_network(),
        }
    }
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            linger_ms: default_linger_ms(),
        }
    }
}

impl SandboxConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn watchdog(&self) -> Option<Duration> {
        self.watchdog_ms.map(Duration::from_millis)
    }
}

impl ConsoleConfig {
    pub fn linger(&self) -> Duration {
        Duration::from_millis(self.linger_ms)
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        // Expand environment variables like ${SANDPAD_WORKER}
        let expanded = shellexpand::env(&content)?;
        Self::parse(&expanded)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }
}
