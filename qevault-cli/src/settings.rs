//! Configuration loading and validation for the `qevault` binary.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use qevault::config::VaultConfig;
use serde::Deserialize;

/// Environment variables starting with this prefix override file values,
/// with `__` separating nested keys (`QEVAULT__STORE__PATH`).
pub const ENV_PREFIX: &str = "QEVAULT";

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Validated binary configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Tracing filter used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_format: LogFormat,

    #[serde(default)]
    pub store: StoreSettings,

    #[serde(default)]
    pub kms: KmsSettings,

    /// Key vault, target collection and encrypted fields.
    pub vault: VaultConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreSettings {
    /// SQLite database file.
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self { path: default_store_path() }
    }
}

/// Key providers to register. Only configured ones are available.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct KmsSettings {
    pub local: Option<LocalKmsSettings>,
    pub aws: Option<AwsKmsSettings>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocalKmsSettings {
    /// File written by `qevault keygen`.
    pub master_key_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AwsKmsSettings {
    /// KMS key id, ARN or alias.
    pub key_id: String,
}

fn default_log_level() -> String {
    "info".into()
}

fn default_store_path() -> PathBuf {
    PathBuf::from("qevault.db")
}

impl Settings {
    /// Loads `path` (TOML) with environment overrides, then validates.
    pub fn load(path: &Path) -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Toml))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .with_context(|| format!("failed to read configuration from {}", path.display()))?;

        let settings: Self =
            cfg.try_deserialize().context("failed to deserialise qevault configuration")?;

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        self.vault.validate().context("invalid [vault] section")?;

        let provider = self.vault.kms_provider.as_str();
        let configured = match provider {
            qevault_kms_local::PROVIDER_NAME => self.kms.local.is_some(),
            qevault_kms_aws::PROVIDER_NAME => self.kms.aws.is_some(),
            other => bail!("unknown kms_provider `{other}` (expected `local` or `aws`)"),
        };
        if !configured {
            bail!("kms_provider is `{provider}` but [kms.{provider}] is not configured");
        }
        if self.log_level.trim().is_empty() {
            bail!("log_level must not be empty");
        }
        Ok(())
    }
}
