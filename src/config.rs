//! Broker configuration: CLI flags, validated domain values, and environment
//! overrides (spec.md §6, SPEC_FULL.md §4.6).
//!
//! Grounded on `message_router::config::RouterConfig`: a validated, nutype-backed
//! settings struct with `development()`/`production()` presets and a `validate()`
//! pass over cross-field invariants.

use nutype::nutype;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Rank of a broker instance within a session; rank 0 is the treeroot.
#[nutype(derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, From, Into
))]
pub struct Rank(u32);

/// Total number of ranks in the session.
#[nutype(
    validate(greater_or_equal = 1),
    derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display, TryFrom, Into)
)]
pub struct ClusterSize(u32);

/// Tree fan-out (`--k-ary`).
#[nutype(
    validate(greater_or_equal = 1),
    derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display, TryFrom, Into, Default),
    default = 2
)]
pub struct KAry(u32);

/// Session identifier shared by every rank in one broker instance.
#[nutype(
    validate(len_char_min = 1),
    derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, TryFrom, Into, AsRef)
)]
pub struct SessionId(String);

/// Security mode flag (`--security`); wiring is out of scope (spec.md §1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
pub enum SecurityMode {
    /// No authentication or encryption.
    None,
    /// Plaintext credential exchange.
    Plain,
    /// CURVE keypair-based security.
    Curve,
}

/// Configuration errors raised while building or validating a [`BrokerConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field failed validation.
    #[error("invalid configuration: {field} - {reason}")]
    ValidationError {
        /// Name of the offending field.
        field: String,
        /// Human-readable reason.
        reason: String,
    },
}

/// Process-wide configuration resolved once at startup from CLI flags (and,
/// in a fuller deployment, a TOML file/environment overrides). Not mutated
/// after startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// This process's rank.
    pub rank: Rank,
    /// Total ranks in the session.
    pub size: ClusterSize,
    /// Shared session identifier.
    pub session_id: SessionId,
    /// URI to connect to the parent's bound child endpoint (`None` at rank 0).
    pub parent_uri: Option<String>,
    /// URI this rank binds its child (ROUTER) endpoint on.
    pub child_uri: String,
    /// URI to connect to the right sibling for rank-forwarding.
    pub right_uri: Option<String>,
    /// URI for the event (pub/sub) endpoint.
    pub event_uri: String,
    /// Tree fan-out.
    pub k_ary: KAry,
    /// Module names to load at startup.
    pub modules: Vec<String>,
    /// Search path(s) for module binaries/configuration.
    pub module_path: Vec<PathBuf>,
    /// Security mode.
    pub security: SecurityMode,
    /// Logging destination (`stderr`, a file path, or `syslog`).
    pub logdest: String,
    /// Kill a pre-existing broker holding the pid file.
    pub force: bool,
    /// Per-rank run directory holding `broker.pid` and module-local files.
    pub run_dir: PathBuf,
}

impl BrokerConfig {
    /// Validates cross-field invariants not expressible via `nutype` alone.
    ///
    /// # Errors
    /// Returns [`ConfigError::ValidationError`] if `rank >= size`, if rank 0
    /// carries a `parent_uri`, or if a non-root rank is missing one.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rank.into_inner() >= self.size.into_inner() {
            return Err(ConfigError::ValidationError {
                field: "rank".to_string(),
                reason: format!("rank {} must be < size {}", self.rank, self.size),
            });
        }
        let is_root = self.rank.into_inner() == 0;
        if is_root && self.parent_uri.is_some() {
            return Err(ConfigError::ValidationError {
                field: "parent_uri".to_string(),
                reason: "the treeroot (rank 0) must not have a parent_uri".to_string(),
            });
        }
        if !is_root && self.parent_uri.is_none() {
            return Err(ConfigError::ValidationError {
                field: "parent_uri".to_string(),
                reason: "non-root ranks must specify a parent_uri".to_string(),
            });
        }
        Ok(())
    }

    /// Loads a full configuration from a TOML file (`--config`), applying the
    /// same validation as a CLI-built one.
    ///
    /// # Errors
    /// Returns [`ConfigError::ValidationError`] if the file cannot be read,
    /// fails to parse, or fails cross-field validation.
    pub fn load_from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::ValidationError {
            field: "config".to_string(),
            reason: format!("reading {}: {e}", path.display()),
        })?;
        let config: Self = toml::from_str(&text).map_err(|e| ConfigError::ValidationError {
            field: "config".to_string(),
            reason: format!("parsing {}: {e}", path.display()),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Applies the `FLUXBROKER_LOGDEST` environment override, if set, taking
    /// precedence over both the CLI flag and a loaded config file.
    fn apply_env_overrides(mut self) -> Self {
        if let Ok(logdest) = std::env::var("FLUXBROKER_LOGDEST") {
            self.logdest = logdest;
        }
        self
    }

    /// A configuration suitable for local single-process testing: rank 0 of
    /// a size-1 session, in-memory everything.
    #[must_use]
    pub fn development(session_id: &str) -> Self {
        Self {
            rank: Rank::from(0),
            size: ClusterSize::try_new(1).unwrap(),
            session_id: SessionId::try_new(session_id.to_string()).unwrap(),
            parent_uri: None,
            child_uri: format!("inproc://{session_id}/rank-0/child"),
            right_uri: None,
            event_uri: format!("inproc://{session_id}/rank-0/event"),
            k_ary: KAry::default(),
            modules: Vec::new(),
            module_path: Vec::new(),
            security: SecurityMode::None,
            logdest: "stderr".to_string(),
            force: false,
            run_dir: std::env::temp_dir().join(format!("{session_id}-0")),
        }
    }
}

/// CLI flags for the broker process, converted to a [`BrokerConfig`] via
/// [`TryFrom`].
#[derive(Debug, Clone, clap::Parser)]
#[command(version, about = "Per-rank broker process for a Flux-style resource manager overlay")]
pub struct Cli {
    /// Load full configuration from this TOML file instead of the flags
    /// below (`FLUXBROKER_LOGDEST` still applies on top of either source).
    #[arg(long = "config")]
    pub config_file: Option<PathBuf>,
    /// This process's rank.
    #[arg(long, default_value_t = 0)]
    pub rank: u32,
    /// Total ranks in the session.
    #[arg(long, default_value_t = 1)]
    pub size: u32,
    /// Shared session identifier.
    #[arg(long = "session-id", default_value = "default")]
    pub session_id: String,
    /// URI to connect to the parent's child endpoint.
    #[arg(long = "parent-uri")]
    pub parent_uri: Option<String>,
    /// URI this rank binds its child endpoint on.
    #[arg(long = "child-uri")]
    pub child_uri: String,
    /// URI to connect to the right sibling.
    #[arg(long = "right-uri")]
    pub right_uri: Option<String>,
    /// URI for the event endpoint.
    #[arg(long = "event-uri")]
    pub event_uri: String,
    /// Tree fan-out.
    #[arg(long = "k-ary", default_value_t = 2)]
    pub k_ary: u32,
    /// Comma-separated module names.
    #[arg(long, value_delimiter = ',')]
    pub modules: Vec<String>,
    /// Search directories for module binaries.
    #[arg(long = "module-path", value_delimiter = ',')]
    pub module_path: Vec<PathBuf>,
    /// Security mode.
    #[arg(long, value_enum, default_value_t = SecurityMode::None)]
    pub security: SecurityMode,
    /// Logging destination.
    #[arg(long, default_value = "stderr")]
    pub logdest: String,
    /// Kill a pre-existing broker holding the pid file.
    #[arg(long)]
    pub force: bool,
}

impl TryFrom<Cli> for BrokerConfig {
    type Error = ConfigError;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        if let Some(path) = &cli.config_file {
            return Self::load_from_file(path).map(Self::apply_env_overrides);
        }
        let run_dir = std::env::temp_dir().join(format!("{}-{}", cli.session_id, cli.rank));
        let config = Self {
            rank: Rank::from(cli.rank),
            size: ClusterSize::try_new(cli.size).map_err(|e| ConfigError::ValidationError {
                field: "size".to_string(),
                reason: e.to_string(),
            })?,
            session_id: SessionId::try_new(cli.session_id).map_err(|e| {
                ConfigError::ValidationError {
                    field: "session_id".to_string(),
                    reason: e.to_string(),
                }
            })?,
            parent_uri: cli.parent_uri,
            child_uri: cli.child_uri,
            right_uri: cli.right_uri,
            event_uri: cli.event_uri,
            k_ary: KAry::try_new(cli.k_ary).map_err(|e| ConfigError::ValidationError {
                field: "k_ary".to_string(),
                reason: e.to_string(),
            })?,
            modules: cli.modules,
            module_path: cli.module_path,
            security: cli.security,
            logdest: cli.logdest,
            force: cli.force,
            run_dir,
        };
        config.validate()?;
        Ok(config.apply_env_overrides())
    }
}
