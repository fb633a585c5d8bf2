//! Navigator configuration.
//!
//! Limits applied while walking a tree, loadable from environment
//! variables.
//!
//! # Environment Variables
//!
//! - `APFS_BTREE_MAX_DEPTH`: Maximum root level accepted (default: `16`)
//! - `APFS_BTREE_VERIFY_CHECKSUMS`: Verify block checksums (default: `true`)
//!
//! # Invariants
//!
//! - `max_depth` is always in `1..=255`

/// Configuration for tree navigation and object resolution.
///
/// # Post-conditions
///
/// When constructed via `from_env()` or `default()`:
/// - `max_depth` is in the valid range (1-255)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NavigatorConfig {
    /// Highest root level a tree may declare.
    /// Deeper trees are reported as malformed instead of walked.
    pub max_depth: u16,
    /// Whether persistent blocks must pass checksum validation.
    /// Turning this off is only meant for forensic reads of damaged images.
    pub verify_checksums: bool,
}

/// Error returned when loading configuration fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    InvalidValue { name: String, message: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidValue { name, message } => {
                write!(f, "invalid value for {name}: {message}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl Default for NavigatorConfig {
    fn default() -> Self {
        Self {
            max_depth: Self::DEFAULT_MAX_DEPTH,
            verify_checksums: Self::DEFAULT_VERIFY_CHECKSUMS,
        }
    }
}

impl NavigatorConfig {
    /// Default maximum tree depth.
    pub const DEFAULT_MAX_DEPTH: u16 = 16;
    /// Upper bound accepted for `max_depth`.
    pub const MAX_DEPTH_LIMIT: u16 = 255;
    /// Checksums are verified unless explicitly disabled.
    pub const DEFAULT_VERIFY_CHECKSUMS: bool = true;

    const MAX_DEPTH_VAR: &'static str = "APFS_BTREE_MAX_DEPTH";
    const VERIFY_CHECKSUMS_VAR: &'static str = "APFS_BTREE_VERIFY_CHECKSUMS";

    /// Load configuration from environment variables.
    ///
    /// Unset variables fall back to their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `APFS_BTREE_MAX_DEPTH` is set but not a number in `1..=255`
    /// - `APFS_BTREE_VERIFY_CHECKSUMS` is set but not a boolean
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Load configuration through a variable lookup function.
    ///
    /// `from_env()` passes the process environment.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let max_depth = Self::load_max_depth(lookup(Self::MAX_DEPTH_VAR).as_deref())?;
        let verify_checksums =
            Self::load_verify_checksums(lookup(Self::VERIFY_CHECKSUMS_VAR).as_deref())?;

        Ok(Self {
            max_depth,
            verify_checksums,
        })
    }

    /// Parse the maximum depth.
    ///
    /// Returns the default if not set.
    fn load_max_depth(value: Option<&str>) -> Result<u16, ConfigError> {
        let Some(value) = value else {
            return Ok(Self::DEFAULT_MAX_DEPTH);
        };
        match value.trim().parse::<u16>() {
            Ok(depth) if (1..=Self::MAX_DEPTH_LIMIT).contains(&depth) => Ok(depth),
            _ => Err(ConfigError::InvalidValue {
                name: Self::MAX_DEPTH_VAR.to_string(),
                message: format!(
                    "'{value}' is not a valid depth (must be 1-{})",
                    Self::MAX_DEPTH_LIMIT
                ),
            }),
        }
    }

    /// Parse the checksum switch.
    ///
    /// Returns the default if not set.
    fn load_verify_checksums(value: Option<&str>) -> Result<bool, ConfigError> {
        let Some(value) = value else {
            return Ok(Self::DEFAULT_VERIFY_CHECKSUMS);
        };
        match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue {
                name: Self::VERIFY_CHECKSUMS_VAR.to_string(),
                message: format!("'{value}' is not a boolean"),
            }),
        }
    }
}
