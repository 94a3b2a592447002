//! Configuration loading via `ortho-config`.

use std::str::FromStr;
use std::time::Duration;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

/// CloudStack specific configuration derived from environment variables,
/// configuration files, and CLI flags.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(prefix = "CLOUDSTACK")]
pub struct CloudStackConfig {
    /// API endpoint URL. Also keys the product cache and the override tables.
    pub endpoint: String,
    /// Account number recorded as the owner of every instance.
    pub account_number: Option<String>,
    /// Region (CloudStack zone) that scopes listing and provisioning.
    pub region_id: Option<String>,
    /// API version spoken by the endpoint. `2.1` selects the legacy deploy
    /// request shape.
    #[ortho_config(default = "2.2".to_owned())]
    pub api_version: String,
    /// Directory holding the network and offering override tables.
    pub overrides_dir: Option<String>,
    /// Ceiling for the post-create visibility poll, in seconds.
    #[ortho_config(default = 1200)]
    pub launch_timeout_secs: u64,
    /// Delay between visibility polls, in milliseconds.
    #[ortho_config(default = 200)]
    pub poll_interval_ms: u64,
    /// Delay after a failed visibility poll, in milliseconds.
    #[ortho_config(default = 1000)]
    pub error_backoff_ms: u64,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }
}

/// Protocol generation of the remote API.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum ApiVersion {
    /// CloudStack 2.1: no user-data, key pairs, security groups or networks.
    V2_1,
    /// CloudStack 2.2 and later.
    V2_2,
}

impl FromStr for ApiVersion {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed == "2.1" || trimmed.starts_with("2.1.") {
            return Ok(Self::V2_1);
        }
        let mut parts = trimmed.split('.');
        let major = parts.next().and_then(|part| part.parse::<u32>().ok());
        let minor = parts.next().map_or(Some(0), |part| part.parse::<u32>().ok());
        match (major, minor) {
            (Some(major), Some(minor)) if major > 2 || (major == 2 && minor >= 2) => Ok(Self::V2_2),
            _ => Err(ConfigError::InvalidValue {
                field: String::from("api_version"),
                message: format!("unsupported API version '{trimmed}'"),
            }),
        }
    }
}

/// Caller identity and placement scope for every request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProviderContext {
    /// Endpoint URL.
    pub endpoint: String,
    /// Owning account number, if known.
    pub account_number: Option<String>,
    /// Configured region, if any.
    pub region_id: Option<String>,
    /// Negotiated API version.
    pub api_version: ApiVersion,
}

impl ProviderContext {
    /// Creates a context for the given endpoint and region using the current
    /// API version.
    #[must_use]
    pub fn new(endpoint: impl Into<String>, region_id: Option<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            account_number: None,
            region_id,
            api_version: ApiVersion::V2_2,
        }
    }

    /// Sets the owning account number.
    #[must_use]
    pub fn with_account(mut self, account_number: impl Into<String>) -> Self {
        self.account_number = Some(account_number.into());
        self
    }

    /// Sets the API version.
    #[must_use]
    pub const fn with_api_version(mut self, api_version: ApiVersion) -> Self {
        self.api_version = api_version;
        self
    }
}

/// Timings for the post-create visibility poll.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MaterializeSettings {
    /// Deadline for direct polling before falling back to the job handle.
    pub timeout: Duration,
    /// Delay between polls.
    pub poll_interval: Duration,
    /// Delay after a failed poll.
    pub error_backoff: Duration,
}

impl Default for MaterializeSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20 * 60),
            poll_interval: Duration::from_millis(200),
            error_backoff: Duration::from_secs(1),
        }
    }
}

impl CloudStackConfig {
    fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::MissingField(format!(
                "missing {}: set {} or add {} to cloudstack-vm.toml",
                metadata.description, metadata.env_var, metadata.toml_key
            )));
        }
        Ok(())
    }

    /// Loads configuration using the `ortho-config` derive. Values merge
    /// defaults, configuration files, environment variables, and CLI flags in
    /// that order of precedence.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the loader fails to merge sources.
    pub fn load_from_sources() -> Result<Self, ConfigError> {
        Self::load().map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("cloudstack-vm")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation. Error messages say how to supply the
    /// missing value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when the endpoint is empty and
    /// [`ConfigError::InvalidValue`] when the API version or a timing is
    /// unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Self::require_field(
            &self.endpoint,
            &FieldMetadata::new("API endpoint", "CLOUDSTACK_ENDPOINT", "endpoint"),
        )?;
        self.api_version.parse::<ApiVersion>()?;
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: String::from("poll_interval_ms"),
                message: String::from("poll interval must be greater than zero"),
            });
        }
        Ok(())
    }

    /// Builds the [`ProviderContext`] used by every request. Blank optional
    /// values are treated as unset.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when validation fails.
    pub fn context(&self) -> Result<ProviderContext, ConfigError> {
        self.validate()?;
        let non_blank = |value: &Option<String>| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|inner| !inner.is_empty())
                .map(str::to_owned)
        };
        Ok(ProviderContext {
            endpoint: self.endpoint.trim().to_owned(),
            account_number: non_blank(&self.account_number),
            region_id: non_blank(&self.region_id),
            api_version: self.api_version.parse()?,
        })
    }

    /// Returns the configured polling timings.
    #[must_use]
    pub const fn materialize_settings(&self) -> MaterializeSettings {
        MaterializeSettings {
            timeout: Duration::from_secs(self.launch_timeout_secs),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            error_backoff: Duration::from_millis(self.error_backoff_ms),
        }
    }

    /// Returns the override table directory, if configured.
    #[must_use]
    pub fn overrides_dir(&self) -> Option<Utf8PathBuf> {
        self.overrides_dir
            .as_deref()
            .map(str::trim)
            .filter(|dir| !dir.is_empty())
            .map(Utf8PathBuf::from)
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a field is present but unusable.
    #[error("invalid {field}: {message}")]
    InvalidValue {
        /// Offending field.
        field: String,
        /// Why the value was rejected.
        message: String,
    },
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
