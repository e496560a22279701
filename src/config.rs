use anyhow::{Context, Result};
use clap::Parser;
use std::{env, time::Duration};

use crate::trash::{DEFAULT_TRASH_PREFIX, MAX_PREFIX_LEN};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    /// Reserved key prefix holding trashed objects in every bucket.
    pub trash_prefix: String,
    /// Age past which `--purge-expired` removes trash entries.
    pub retention: Duration,
    /// Profile used when a request does not name one.
    pub default_profile: String,
}

/// What the binary should do after loading its configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunMode {
    Serve,
    Migrate,
    PurgeExpired { bucket: String },
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Trash bin service for S3-style buckets")]
pub struct Args {
    /// Host to bind to (overrides XDRIVE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides XDRIVE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where objects are stored (overrides XDRIVE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides XDRIVE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Trash key prefix (overrides XDRIVE_TRASH_PREFIX)
    #[arg(long)]
    pub trash_prefix: Option<String>,

    /// Trash retention such as `30d` or `12h` (overrides XDRIVE_TRASH_RETENTION)
    #[arg(long)]
    pub retention: Option<String>,

    /// Default profile name (overrides XDRIVE_PROFILE)
    #[arg(long)]
    pub profile: Option<String>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,

    /// Purge trash entries of BUCKET older than the retention window and exit
    #[arg(long, value_name = "BUCKET", conflicts_with = "migrate")]
    pub purge_expired: Option<String>,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and run mode.
    pub fn from_env_and_args() -> Result<(Self, RunMode)> {
        Self::resolve(Args::parse(), |name| env::var(name))
    }

    /// Merge `args` over values looked up with `var`, then defaults.
    pub fn resolve<F>(args: Args, var: F) -> Result<(Self, RunMode)>
    where
        F: Fn(&str) -> Result<String, env::VarError>,
    {
        let lookup = |name: &str, default: &str| -> Result<String> {
            match var(name) {
                Ok(value) => Ok(value),
                Err(env::VarError::NotPresent) => Ok(default.to_string()),
                Err(err) => Err(err).with_context(|| format!("reading {}", name)),
            }
        };

        // --- Environment fallback ---
        let env_host = lookup("XDRIVE_HOST", "0.0.0.0")?;
        let port = match args.port {
            Some(port) => port,
            None => {
                let value = lookup("XDRIVE_PORT", "3000")?;
                value
                    .parse::<u16>()
                    .with_context(|| format!("parsing XDRIVE_PORT value `{}`", value))?
            }
        };
        let env_storage = lookup("XDRIVE_STORAGE_DIR", "./data/objects")?;
        let env_db = lookup("XDRIVE_DATABASE_URL", "sqlite://./data/meta/xdrive.db")?;
        let env_prefix = lookup("XDRIVE_TRASH_PREFIX", DEFAULT_TRASH_PREFIX)?;
        let env_profile = lookup("XDRIVE_PROFILE", "default")?;

        let retention_raw = match args.retention {
            Some(value) => value,
            None => lookup("XDRIVE_TRASH_RETENTION", "30d")?,
        };
        let retention = humantime::parse_duration(&retention_raw)
            .with_context(|| format!("parsing retention `{}`", retention_raw))?;

        let trash_prefix = args.trash_prefix.unwrap_or(env_prefix);
        let trimmed = trash_prefix.trim_matches('/');
        if trimmed.is_empty() {
            anyhow::bail!("trash prefix must not be empty");
        }
        if trimmed.len() > MAX_PREFIX_LEN {
            anyhow::bail!("trash prefix is longer than {} bytes", MAX_PREFIX_LEN);
        }

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port,
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            trash_prefix,
            retention,
            default_profile: args.profile.unwrap_or(env_profile),
        };

        let mode = match (args.migrate, args.purge_expired) {
            (true, _) => RunMode::Migrate,
            (false, Some(bucket)) => RunMode::PurgeExpired { bucket },
            (false, None) => RunMode::Serve,
        };

        Ok((cfg, mode))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Result<String, env::VarError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned().ok_or(env::VarError::NotPresent)
    }

    #[test]
    fn defaults_apply_without_env_or_flags() {
        let (cfg, mode) = AppConfig::resolve(Args::default(), env_of(&[])).unwrap();
        assert_eq!(cfg.addr(), "0.0.0.0:3000");
        assert_eq!(cfg.trash_prefix, ".xdrive-trash");
        assert_eq!(cfg.retention, Duration::from_secs(30 * 24 * 60 * 60));
        assert_eq!(cfg.default_profile, "default");
        assert_eq!(mode, RunMode::Serve);
    }

    #[test]
    fn flags_beat_env_and_env_beats_defaults() {
        let args = Args {
            port: Some(8080),
            retention: Some("12h".into()),
            purge_expired: Some("photos".into()),
            ..Args::default()
        };
        let env = env_of(&[
            ("XDRIVE_PORT", "9000"),
            ("XDRIVE_HOST", "127.0.0.1"),
            ("XDRIVE_TRASH_RETENTION", "7d"),
            ("XDRIVE_TRASH_PREFIX", "Trash/"),
        ]);

        let (cfg, mode) = AppConfig::resolve(args, env).unwrap();
        assert_eq!(cfg.addr(), "127.0.0.1:8080");
        assert_eq!(cfg.retention, Duration::from_secs(12 * 60 * 60));
        assert_eq!(cfg.trash_prefix, "Trash/");
        assert_eq!(
            mode,
            RunMode::PurgeExpired {
                bucket: "photos".into()
            }
        );
    }

    #[test]
    fn rejects_bad_values() {
        assert!(AppConfig::resolve(Args::default(), env_of(&[("XDRIVE_PORT", "http")])).is_err());
        assert!(
            AppConfig::resolve(Args::default(), env_of(&[("XDRIVE_TRASH_RETENTION", "soon")]))
                .is_err()
        );
        assert!(AppConfig::resolve(Args::default(), env_of(&[("XDRIVE_TRASH_PREFIX", "/")])).is_err());
        let long_prefix = "t".repeat(MAX_PREFIX_LEN + 1);
        assert!(
            AppConfig::resolve(Args::default(), env_of(&[("XDRIVE_TRASH_PREFIX", long_prefix.as_str())]))
                .is_err()
        );
    }
}
