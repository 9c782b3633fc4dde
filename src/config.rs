//! The configuration surface enumerated in spec §6.2.
//!
//! Loading these from a file or environment variables is explicitly out of
//! scope (spec §1); these are plain typed structs with defaults matching
//! what the spec implies, for an embedder to populate however it likes.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignerConfig {
    pub signature_algorithm: String,
    pub private_key_file: PathBuf,
    pub public_key_file: PathBuf,
    pub auto_generate: bool,
}

impl Default for SignerConfig {
    fn default() -> Self {
        Self {
            signature_algorithm: crate::signer::SIGNATURE_ALGORITHM.to_string(),
            private_key_file: PathBuf::from("agent.key"),
            public_key_file: PathBuf::from("agent.pub"),
            auto_generate: true,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    pub default_ttl: i64,
    pub max_ttl: i64,
    pub default_max_uses: u64,
    pub max_uses: u64,
    pub issuer: String,
    pub enable_usage_tracking: bool,
    pub cleanup_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_ttl: 3_600,
            max_ttl: 86_400,
            default_max_uses: 100,
            max_uses: 10_000,
            issuer: "capcore-agent".to_string(),
            enable_usage_tracking: true,
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreConfig {
    pub enable_cache: bool,
    pub cache_size: usize,
    pub enable_persistence: bool,
    pub storage_file_path: PathBuf,
    pub cleanup_interval: Duration,
    pub enable_compression: bool,
    pub enable_encryption: bool,
    pub encryption_key_file: Option<PathBuf>,
    /// Grace period after expiry, and revocation retention window, before
    /// cleanup purges a record (spec §3 Lifecycle).
    pub grace_period_seconds: i64,
    pub revocation_retention_seconds: i64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            enable_cache: true,
            cache_size: 10_000,
            enable_persistence: true,
            storage_file_path: PathBuf::from("capabilities.json"),
            cleanup_interval: Duration::from_secs(60),
            enable_compression: false,
            enable_encryption: false,
            encryption_key_file: None,
            grace_period_seconds: 300,
            revocation_retention_seconds: 86_400 * 7,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DefaultDecision {
    Allow,
    Deny,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PolicyEngineConfig {
    pub directory: PathBuf,
    pub default_decision: DefaultDecision,
    pub enable_cache: bool,
    pub cache_ttl: Duration,
    pub cache_size: usize,
    pub enable_reloading: bool,
    pub reload_interval: Duration,
    pub enable_validation: bool,
}

impl Default for PolicyEngineConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("policies"),
            default_decision: DefaultDecision::Deny,
            enable_cache: true,
            cache_ttl: Duration::from_secs(30),
            cache_size: 1_000,
            enable_reloading: true,
            reload_interval: Duration::from_secs(30),
            enable_validation: true,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditConfig {
    pub enable_logging: bool,
    pub log_file_path: PathBuf,
    pub enable_buffer: bool,
    pub buffer_size: usize,
    pub flush_interval: Duration,
    pub enable_rotation: bool,
    pub max_file_size: u64,
    pub max_backup_files: usize,
    pub enable_compression: bool,
    pub enable_signature: bool,
    pub signature_key_file: Option<PathBuf>,
    pub log_level: String,
    pub enable_siem: bool,
    pub siem_endpoint: Option<String>,
    pub siem_format: Option<String>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enable_logging: true,
            log_file_path: PathBuf::from("audit.log"),
            enable_buffer: true,
            buffer_size: 256,
            flush_interval: Duration::from_secs(5),
            enable_rotation: true,
            max_file_size: 50 * 1024 * 1024,
            max_backup_files: 5,
            enable_compression: false,
            enable_signature: true,
            signature_key_file: None,
            log_level: "info".to_string(),
            enable_siem: false,
            siem_endpoint: None,
            siem_format: None,
        }
    }
}

/// Modeled for contract completeness (spec §6.2): the IPC transport itself
/// is out of scope, but the core needs to know its shape of these values
/// for timeouts and diagnostics.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IpcSurfaceConfig {
    pub timeout_seconds: u64,
    pub max_connections: usize,
    pub enable_auth: bool,
    pub socket_path: PathBuf,
}

impl Default for IpcSurfaceConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 30,
            max_connections: 256,
            enable_auth: true,
            socket_path: PathBuf::from("capcore.sock"),
        }
    }
}

/// The full configuration for a [`crate::supervisor::Supervisor`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    pub signer: SignerConfig,
    pub engine: EngineConfig,
    pub store: StoreConfig,
    pub policy: PolicyEngineConfig,
    pub audit: AuditConfig,
    pub ipc: IpcSurfaceConfig,
}
