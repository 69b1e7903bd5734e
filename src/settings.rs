use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, bail, ensure};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::cli::{Cli, LogFormat};
use crate::proxy::config::{CacheConfig, ForwardConfig};

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

fn default_client_timeout() -> u64 {
    30
}

fn default_upstream_connect_timeout() -> u64 {
    5
}

fn default_upstream_timeout() -> u64 {
    60
}

fn default_max_header_size() -> usize {
    32 * 1024
}

fn default_max_body_size() -> usize {
    64 * 1024 * 1024
}

fn default_memory_cache_size() -> u64 {
    256 * 1024 * 1024 // 256 MiB
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub listen: SocketAddr,
    /// Default origin; requests stay unanswerable (503) without one.
    #[serde(default)]
    pub forward_host: Option<String>,
    #[serde(default)]
    pub forward_tls: bool,
    #[serde(default = "default_log_format")]
    pub log: LogFormat,
    #[serde(default = "default_client_timeout")]
    pub client_timeout: u64,
    #[serde(default = "default_upstream_connect_timeout")]
    pub upstream_connect_timeout: u64,
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout: u64,
    #[serde(default = "default_max_header_size")]
    pub max_header_size: usize,
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
    #[serde(default = "default_memory_cache_size")]
    pub memory_cache_size: u64,
    #[serde(default)]
    pub cacheable_methods: Option<Vec<String>>,
    #[serde(default)]
    pub safe_methods: Option<Vec<String>>,
    /// Map of status code to default freshness in seconds.
    #[serde(default)]
    pub status_code_default_expiration: Option<HashMap<String, u64>>,
    #[serde(default)]
    pub cacheable_file_extensions: Option<Vec<String>>,
    #[serde(default)]
    pub cache_incomplete_responses: bool,
    #[serde(default)]
    pub combine_partial_responses: bool,
    #[serde(default = "default_true")]
    pub serve_stale_on_error: bool,
    #[serde(default = "default_true")]
    pub http_warnings: bool,
}

impl Settings {
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut builder = Config::builder();
        let config_path = resolve_config_path(cli)?;

        builder = builder.add_source(File::from(config_path).required(true));
        builder = builder.add_source(
            Environment::with_prefix("CACHEGATE")
                .separator("__")
                .try_parsing(true),
        );

        let cfg = builder.build().map_err(to_anyhow)?;
        let settings: Settings = cfg.try_deserialize().map_err(to_anyhow)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout)
    }

    pub fn upstream_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_connect_timeout)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout)
    }

    pub fn forward_config(&self) -> Option<ForwardConfig> {
        self.forward_host.as_ref().map(|host| ForwardConfig {
            host: host.clone(),
            tls: self.forward_tls,
        })
    }

    /// Materialize the caching policy, starting from the RFC defaults and
    /// overriding whatever the configuration file names.
    pub fn cache_config(&self) -> Result<CacheConfig> {
        let mut config = CacheConfig {
            cache_incomplete_responses: self.cache_incomplete_responses,
            combine_partial_responses: self.combine_partial_responses,
            serve_stale_on_error: self.serve_stale_on_error,
            http_warnings: self.http_warnings,
            ..CacheConfig::default()
        };

        if let Some(methods) = &self.cacheable_methods {
            config.cacheable_methods = methods.iter().cloned().collect();
        }
        if let Some(methods) = &self.safe_methods {
            config.safe_methods = methods.iter().cloned().collect();
        }
        if let Some(extensions) = &self.cacheable_file_extensions {
            config.cacheable_file_extensions = extensions
                .iter()
                .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
                .collect();
        }
        if let Some(expirations) = &self.status_code_default_expiration {
            let mut table = HashMap::new();
            for (status, seconds) in expirations {
                let status: u16 = match status.parse() {
                    Ok(status) => status,
                    Err(_) => bail!("invalid status code '{status}' in status_code_default_expiration"),
                };
                table.insert(status, time::Duration::seconds(*seconds as i64));
            }
            config.status_code_default_expiration = table;
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.client_timeout > 0,
            "client_timeout must be greater than 0 seconds (got {})",
            self.client_timeout
        );
        ensure!(
            self.upstream_connect_timeout > 0,
            "upstream_connect_timeout must be greater than 0 seconds (got {})",
            self.upstream_connect_timeout
        );
        ensure!(
            self.upstream_timeout > 0,
            "upstream_timeout must be greater than 0 seconds (got {})",
            self.upstream_timeout
        );
        ensure!(
            self.max_header_size > 0,
            "max_header_size must be greater than 0 (got {})",
            self.max_header_size
        );
        ensure!(
            self.max_body_size > 0,
            "max_body_size must be greater than 0 (got {})",
            self.max_body_size
        );
        ensure!(
            self.memory_cache_size > 0,
            "memory_cache_size must be greater than 0 (got {})",
            self.memory_cache_size
        );
        for method in self.cacheable_methods.iter().flatten() {
            ensure!(
                method.chars().all(|c| c.is_ascii_uppercase()),
                "cacheable method '{method}' must be uppercase"
            );
        }
        for method in self.safe_methods.iter().flatten() {
            ensure!(
                method.chars().all(|c| c.is_ascii_uppercase()),
                "safe method '{method}' must be uppercase"
            );
        }
        // Fail fast on malformed expiration tables instead of at first use.
        self.cache_config()?;
        Ok(())
    }
}

fn to_anyhow(err: ConfigError) -> anyhow::Error {
    anyhow::anyhow!(err)
}

impl Cli {
    pub fn config_path(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

fn resolve_config_path(cli: &Cli) -> Result<PathBuf> {
    if let Some(path) = cli.config_path() {
        return Ok(path.to_path_buf());
    }

    for candidate in default_config_candidates() {
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    bail!(
        "no configuration file provided via --config and none found in default locations: {}",
        default_config_candidates()
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );
}

fn default_config_candidates() -> [PathBuf; 2] {
    [
        PathBuf::from("/etc/cachegate/cachegate.toml"),
        PathBuf::from("cachegate.toml"),
    ]
}
