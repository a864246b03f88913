use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use sandbox::ResourceLimits;
use sandbox_proc::ProcessConfig;

use crate::pool::QueuePolicy;

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{setting} must be between {min} and {max}, got {value}")]
    OutOfRange {
        setting: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },

    #[error("{default_setting} ({default}) must not exceed {max_setting} ({max})")]
    DefaultAboveMax {
        default_setting: &'static str,
        default: u64,
        max_setting: &'static str,
        max: u64,
    },

    #[error("{0}")]
    Invalid(String),
}

/// Per-request limit defaults and ceilings.
#[derive(Args, Debug, Clone)]
pub struct LimitArgs {
    /// Time limit for requests that set none, in milliseconds
    #[arg(long, env = "DEFAULT_TIME_LIMIT_MS", default_value_t = 5_000)]
    pub default_time_limit_ms: u64,
    /// Largest time limit a request may ask for, in milliseconds
    #[arg(long, env = "MAX_TIME_LIMIT_MS", default_value_t = 30_000)]
    pub max_time_limit_ms: u64,
    /// Memory limit for requests that set none, in bytes
    #[arg(long, env = "DEFAULT_MEMORY_LIMIT_BYTES", default_value_t = 100 * MIB)]
    pub default_memory_limit_bytes: u64,
    /// Largest memory limit a request may ask for, in bytes
    #[arg(long, env = "MAX_MEMORY_LIMIT_BYTES", default_value_t = GIB)]
    pub max_memory_limit_bytes: u64,
    /// Per-stream output limit for requests that set none, in bytes
    #[arg(long, env = "DEFAULT_OUTPUT_LIMIT_BYTES", default_value_t = MIB)]
    pub default_output_limit_bytes: u64,
    /// Largest per-stream output limit a request may ask for, in bytes
    #[arg(long, env = "MAX_OUTPUT_LIMIT_BYTES", default_value_t = 16 * MIB)]
    pub max_output_limit_bytes: u64,
}

/// Worker process settings.
#[derive(Args, Debug, Clone)]
pub struct SandboxArgs {
    /// Python interpreter (name on PATH or absolute path)
    #[arg(long, env = "PYTHON_BIN", default_value = "python3")]
    pub python_bin: PathBuf,
    /// Directory holding per-worker directories [default: $TMPDIR/code-executor]
    #[arg(long, env = "SANDBOX_DIR")]
    pub sandbox_dir: Option<PathBuf>,
    /// Modules submitted code may not import
    #[arg(
        long,
        env = "BLOCKED_MODULES",
        value_delimiter = ',',
        default_values_t = [String::from("ctypes"), String::from("_ctypes")]
    )]
    pub blocked_modules: Vec<String>,
    /// Run each worker in fresh user and network namespaces
    #[arg(long, env = "SANDBOX_NETWORK_NAMESPACE")]
    pub network_namespace: bool,
    /// Resource governor sampling interval, in milliseconds
    #[arg(long, env = "GOVERNOR_INTERVAL_MS", default_value_t = 25)]
    pub governor_interval_ms: u64,
}

/// Execution pool sizing.
#[derive(Args, Debug, Clone)]
pub struct PoolArgs {
    /// Maximum concurrent executions
    #[arg(long, env = "MAX_WORKERS", default_value_t = 4)]
    pub max_workers: u64,
    /// Requests allowed to wait for a slot; 0 rejects as soon as the pool is full
    #[arg(long, env = "QUEUE_DEPTH", default_value_t = 16)]
    pub queue_depth: u64,
    /// Longest a queued request waits for a slot, in milliseconds
    #[arg(long, env = "QUEUE_WAIT_MS", default_value_t = 10_000)]
    pub queue_wait_ms: u64,
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Address both listeners bind to
    #[arg(long, env = "SERVER_HOST", default_value = "0.0.0.0")]
    pub host: IpAddr,
    /// Port for execution requests
    #[arg(long, env = "MAIN_PORT", default_value_t = 18080)]
    pub main_port: u16,
    /// Port for the metrics endpoint
    #[arg(long, env = "METRICS_PORT", default_value_t = 18000)]
    pub metrics_port: u16,
    #[command(flatten)]
    pub pool: PoolArgs,
    #[command(flatten)]
    pub limits: LimitArgs,
    #[command(flatten)]
    pub sandbox: SandboxArgs,
}

/// Default and ceiling for one kind of limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bounds<T> {
    pub default: T,
    pub max: T,
}

impl<T: Copy + PartialOrd> Bounds<T> {
    /// Absent requests get the default; zero or anything above the ceiling
    /// is refused.
    fn resolve(&self, requested: Option<T>, zero: T) -> Option<T> {
        match requested {
            None => Some(self.default),
            Some(value) if value > zero && value <= self.max => Some(value),
            Some(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitPolicy {
    pub time: Bounds<Duration>,
    pub memory: Bounds<u64>,
    pub output: Bounds<u64>,
}

impl LimitPolicy {
    #[cfg(test)]
    pub fn defaults(&self) -> ResourceLimits {
        ResourceLimits {
            time_limit: self.time.default,
            memory_bytes: self.memory.default,
            output_bytes: self.output.default,
        }
    }

    /// Apply per-request overrides, returning a message naming the first
    /// field that is out of bounds.
    pub fn resolve(
        &self,
        time_limit_ms: Option<u64>,
        memory_bytes: Option<u64>,
        output_bytes: Option<u64>,
    ) -> Result<ResourceLimits, String> {
        let time_limit = self
            .time
            .resolve(time_limit_ms.map(Duration::from_millis), Duration::ZERO)
            .ok_or_else(|| {
                format!(
                    "time_limit_ms must be between 1 and {}",
                    self.time.max.as_millis()
                )
            })?;
        let memory_bytes = self.memory.resolve(memory_bytes, 0).ok_or_else(|| {
            format!("memory_limit_bytes must be between 1 and {}", self.memory.max)
        })?;
        let output_bytes = self.output.resolve(output_bytes, 0).ok_or_else(|| {
            format!("output_limit_bytes must be between 1 and {}", self.output.max)
        })?;
        Ok(ResourceLimits {
            time_limit,
            memory_bytes,
            output_bytes,
        })
    }
}

/// Fully validated service settings.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub main_addr: SocketAddr,
    pub metrics_addr: SocketAddr,
    pub capacity: usize,
    pub queue: QueuePolicy,
    pub limits: LimitPolicy,
    pub process: ProcessConfig,
}

fn check_range(setting: &'static str, value: u64, min: u64, max: u64) -> Result<u64, ConfigError> {
    if (min..=max).contains(&value) {
        Ok(value)
    } else {
        Err(ConfigError::OutOfRange {
            setting,
            value,
            min,
            max,
        })
    }
}

fn check_bounds(
    (default_setting, default): (&'static str, u64),
    (max_setting, max): (&'static str, u64),
    min: u64,
    ceiling: u64,
) -> Result<Bounds<u64>, ConfigError> {
    check_range(default_setting, default, min, ceiling)?;
    check_range(max_setting, max, min, ceiling)?;
    if default > max {
        return Err(ConfigError::DefaultAboveMax {
            default_setting,
            default,
            max_setting,
            max,
        });
    }
    Ok(Bounds { default, max })
}

impl LimitArgs {
    pub fn validate(&self) -> Result<LimitPolicy, ConfigError> {
        let time = check_bounds(
            ("DEFAULT_TIME_LIMIT_MS", self.default_time_limit_ms),
            ("MAX_TIME_LIMIT_MS", self.max_time_limit_ms),
            1,
            300_000,
        )?;
        let memory = check_bounds(
            ("DEFAULT_MEMORY_LIMIT_BYTES", self.default_memory_limit_bytes),
            ("MAX_MEMORY_LIMIT_BYTES", self.max_memory_limit_bytes),
            32 * MIB,
            8 * GIB,
        )?;
        let output = check_bounds(
            ("DEFAULT_OUTPUT_LIMIT_BYTES", self.default_output_limit_bytes),
            ("MAX_OUTPUT_LIMIT_BYTES", self.max_output_limit_bytes),
            1,
            64 * MIB,
        )?;
        Ok(LimitPolicy {
            time: Bounds {
                default: Duration::from_millis(time.default),
                max: Duration::from_millis(time.max),
            },
            memory,
            output,
        })
    }
}

impl SandboxArgs {
    pub fn validate(&self) -> Result<ProcessConfig, ConfigError> {
        let interval = check_range("GOVERNOR_INTERVAL_MS", self.governor_interval_ms, 1, 1000)?;
        let blocked_modules = self
            .blocked_modules
            .iter()
            .map(|m| m.trim())
            .filter(|m| !m.is_empty())
            .map(|m| {
                if m.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '.') {
                    Ok(m.to_string())
                } else {
                    Err(ConfigError::Invalid(format!(
                        "BLOCKED_MODULES contains an invalid module name: {m:?}"
                    )))
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        let base_dir = self
            .sandbox_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("code-executor"));
        Ok(ProcessConfig {
            python: self.python_bin.clone(),
            base_dir,
            blocked_modules,
            network_namespace: self.network_namespace,
            sampling_interval: Duration::from_millis(interval),
        })
    }
}

impl PoolArgs {
    pub fn validate(&self) -> Result<(usize, QueuePolicy), ConfigError> {
        let capacity = check_range("MAX_WORKERS", self.max_workers, 1, 256)?;
        let depth = check_range("QUEUE_DEPTH", self.queue_depth, 0, 4096)?;
        let wait = check_range("QUEUE_WAIT_MS", self.queue_wait_ms, 1, 300_000)?;
        let queue = if depth == 0 {
            QueuePolicy::Reject
        } else {
            QueuePolicy::Wait {
                depth: depth as usize,
                max_wait: Duration::from_millis(wait),
            }
        };
        Ok((capacity as usize, queue))
    }
}

impl ServeArgs {
    pub fn validate(&self) -> Result<ServiceConfig, ConfigError> {
        check_range("MAIN_PORT", u64::from(self.main_port), 1, 65_535)?;
        check_range("METRICS_PORT", u64::from(self.metrics_port), 1, 65_535)?;
        if self.main_port == self.metrics_port {
            return Err(ConfigError::Invalid(format!(
                "MAIN_PORT and METRICS_PORT must differ, both are {}",
                self.main_port
            )));
        }
        let (capacity, queue) = self.pool.validate()?;
        Ok(ServiceConfig {
            main_addr: SocketAddr::new(self.host, self.main_port),
            metrics_addr: SocketAddr::new(self.host, self.metrics_port),
            capacity,
            queue,
            limits: self.limits.validate()?,
            process: self.sandbox.validate()?,
        })
    }
}
