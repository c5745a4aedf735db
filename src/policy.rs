//! Resource policy for sandboxed jobs
//!
//! A single immutable set of limits, loaded once at startup and applied verbatim
//! to every container launch. Loaded from a TOML file (or the embedded default
//! at `files/policy.toml`).

use std::num::NonZeroU32;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Policy loading and validation errors
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("Failed to read policy file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse policy: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid size for {field}: {value}")]
    InvalidSize { field: &'static str, value: String },

    #[error("{0} must be greater than zero")]
    NotPositive(&'static str),

    #[error("cpu_quota_micros ({quota}) exceeds cpu_period_micros ({period}) x {cores} cores")]
    CpuQuotaTooLarge { quota: u64, period: u64, cores: u64 },
}

/// Sandbox limits shared by all jobs
#[derive(Debug, Clone, PartialEq)]
pub struct ResourcePolicy {
    /// CPU time allowed per period, in microseconds (50_000 = half a core)
    pub cpu_quota_micros: u64,
    /// CPU quota enforcement window, in microseconds
    pub cpu_period_micros: u64,
    /// Relative CPU weight under contention
    pub cpu_shares: u64,
    /// Hard memory ceiling in bytes; exceeding it kills the job
    pub memory_limit: u64,
    /// Memory + swap ceiling in bytes
    pub memory_swap_limit: u64,
    /// Soft memory reservation in bytes
    pub memory_reservation: u64,
    /// Ceiling on submitted file content, checked before staging
    pub storage_limit_mb: u64,
    /// Wall-clock budget for a single job
    pub execution_timeout: Duration,
    /// Whether the container may reach the network
    pub network_enabled: bool,
    /// Maximum processes + threads inside the container
    pub pids_limit: u64,
    /// Mount the container root filesystem read-only
    pub read_only_root: bool,
    /// Size of the `/tmp` tmpfs used when the root is read-only, in bytes
    pub tmpfs_size: u64,
    /// Drop every Linux capability at launch
    pub drop_all_capabilities: bool,
    /// Block privilege escalation (setuid etc.) at launch
    pub no_new_privileges: bool,
    /// Admission rate for `/run`
    pub max_jobs_per_minute: u32,
}

impl Default for ResourcePolicy {
    fn default() -> Self {
        Self {
            cpu_quota_micros: 50_000,
            cpu_period_micros: 100_000,
            cpu_shares: 512,
            memory_limit: 512 * MIB,
            memory_swap_limit: 512 * MIB,
            memory_reservation: 256 * MIB,
            storage_limit_mb: 100,
            execution_timeout: Duration::from_secs(300),
            network_enabled: true,
            pids_limit: 100,
            read_only_root: false,
            tmpfs_size: 100 * MIB,
            drop_all_capabilities: true,
            no_new_privileges: true,
            max_jobs_per_minute: 10,
        }
    }
}

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;

/// Raw TOML representation; sizes are human strings like "512m"
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPolicy {
    cpu_quota_micros: u64,
    cpu_period_micros: u64,
    cpu_shares: u64,
    memory_limit: String,
    memory_swap_limit: String,
    memory_reservation: String,
    storage_limit_mb: u64,
    execution_timeout_seconds: u64,
    network_enabled: bool,
    pids_limit: u64,
    read_only_root: bool,
    tmpfs_size: String,
    drop_all_capabilities: bool,
    no_new_privileges: bool,
    max_jobs_per_minute: u32,
}

impl ResourcePolicy {
    /// Parse and validate a policy from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, PolicyError> {
        let raw: RawPolicy = toml::from_str(content)?;

        let policy = Self {
            cpu_quota_micros: raw.cpu_quota_micros,
            cpu_period_micros: raw.cpu_period_micros,
            cpu_shares: raw.cpu_shares,
            memory_limit: parse_size("memory_limit", &raw.memory_limit)?,
            memory_swap_limit: parse_size("memory_swap_limit", &raw.memory_swap_limit)?,
            memory_reservation: parse_size("memory_reservation", &raw.memory_reservation)?,
            storage_limit_mb: raw.storage_limit_mb,
            execution_timeout: Duration::from_secs(raw.execution_timeout_seconds),
            network_enabled: raw.network_enabled,
            pids_limit: raw.pids_limit,
            read_only_root: raw.read_only_root,
            tmpfs_size: parse_size("tmpfs_size", &raw.tmpfs_size)?,
            drop_all_capabilities: raw.drop_all_capabilities,
            no_new_privileges: raw.no_new_privileges,
            max_jobs_per_minute: raw.max_jobs_per_minute,
        };

        policy.validate()?;
        Ok(policy)
    }

    /// Load the policy from `path`, or the embedded default when `None`
    pub fn load(path: Option<&Path>) -> Result<Self, PolicyError> {
        match path {
            Some(path) => {
                let content = std::fs::read_to_string(path).map_err(|source| PolicyError::Read {
                    path: path.display().to_string(),
                    source,
                })?;
                Self::from_toml_str(&content)
            }
            None => Self::from_toml_str(include_str!(concat!(
                env!("CARGO_MANIFEST_DIR"),
                "/files/policy.toml"
            ))),
        }
    }

    /// Check every numeric field is positive and the CPU quota fits the host
    pub fn validate(&self) -> Result<(), PolicyError> {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get() as u64)
            .unwrap_or(1);
        self.validate_for_cores(cores)
    }

    fn validate_for_cores(&self, cores: u64) -> Result<(), PolicyError> {
        let numeric: [(&'static str, u64); 11] = [
            ("cpu_quota_micros", self.cpu_quota_micros),
            ("cpu_period_micros", self.cpu_period_micros),
            ("cpu_shares", self.cpu_shares),
            ("memory_limit", self.memory_limit),
            ("memory_swap_limit", self.memory_swap_limit),
            ("memory_reservation", self.memory_reservation),
            ("storage_limit_mb", self.storage_limit_mb),
            ("execution_timeout_seconds", self.execution_timeout.as_secs()),
            ("pids_limit", self.pids_limit),
            ("tmpfs_size", self.tmpfs_size),
            ("max_jobs_per_minute", u64::from(self.max_jobs_per_minute)),
        ];
        if let Some((name, _)) = numeric.iter().find(|(_, value)| *value == 0) {
            return Err(PolicyError::NotPositive(name));
        }

        if self.cpu_quota_micros > self.cpu_period_micros.saturating_mul(cores) {
            return Err(PolicyError::CpuQuotaTooLarge {
                quota: self.cpu_quota_micros,
                period: self.cpu_period_micros,
                cores,
            });
        }

        Ok(())
    }

    /// Storage ceiling in bytes
    pub fn storage_limit_bytes(&self) -> u64 {
        self.storage_limit_mb.saturating_mul(MIB)
    }

    /// Most container output returned with a job result; same ceiling as submitted files
    pub fn output_limit_bytes(&self) -> usize {
        usize::try_from(self.storage_limit_bytes()).unwrap_or(usize::MAX)
    }

    /// Admission quota; validation guarantees a non-zero rate
    pub fn jobs_per_minute(&self) -> NonZeroU32 {
        NonZeroU32::new(self.max_jobs_per_minute).unwrap_or(NonZeroU32::MIN)
    }
}

/// Parse a docker-style size ("512m", "1g", "100k", "2048") into bytes
pub fn parse_size(field: &'static str, value: &str) -> Result<u64, PolicyError> {
    let invalid = || PolicyError::InvalidSize {
        field,
        value: value.to_string(),
    };

    let trimmed = value.trim().to_ascii_lowercase();
    let trimmed = trimmed.strip_suffix('b').unwrap_or(&trimmed);
    let (digits, multiplier) = match trimmed.chars().last() {
        Some('k') => (&trimmed[..trimmed.len() - 1], KIB),
        Some('m') => (&trimmed[..trimmed.len() - 1], MIB),
        Some('g') => (&trimmed[..trimmed.len() - 1], GIB),
        Some(c) if c.is_ascii_digit() => (trimmed, 1),
        _ => return Err(invalid()),
    };

    let amount: u64 = digits.trim().parse().map_err(|_| invalid())?;
    amount.checked_mul(multiplier).ok_or_else(invalid)
}
