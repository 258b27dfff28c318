pub mod types;

#[cfg(test)]
mod tests;

pub use types::*;

use anyhow::Result;
use std::path::Path;

impl ProxyConfig {
    /// Load configuration from a file (if it exists) and apply environment
    /// variable overrides. When the file does not exist, built-in defaults
    /// are used; everything can then come from flags and the environment.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: ProxyConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)?,
                Some("json") => serde_json::from_str(&content)?,
                Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
                None => anyhow::bail!("config file has no extension, use .toml or .json"),
            }
        } else {
            ProxyConfig::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides. Flags handled in `main` take
    /// precedence over both the file and the environment.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("SQLTUNNEL_INSTANCES") {
            self.instances = v.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Ok(v) = std::env::var("SQLTUNNEL_INSTANCES_METADATA") {
            self.instances_metadata = Some(v);
        }
        if let Ok(v) = std::env::var("SQLTUNNEL_API_ENDPOINT") {
            self.api.endpoint = v;
        }
        if let Ok(v) = std::env::var("SQLTUNNEL_API_TOKEN") {
            self.api.token = Some(v);
        }
        if let Ok(v) = std::env::var("SQLTUNNEL_UNIX_SOCKET_DIR") {
            self.unix_socket_dir = v;
        }
        if let Ok(v) = std::env::var("SQLTUNNEL_ADMIN_LISTEN") {
            self.admin_listen = Some(v);
        }
        if let Ok(v) = std::env::var("SQLTUNNEL_MAX_CONNECTIONS") {
            if let Ok(n) = v.parse::<u64>() {
                self.max_connections = n;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.instances.is_empty() && self.instances_metadata.is_none() {
            anyhow::bail!(
                "no instance selected and no discovery source configured \
                 (set --instances or --instances-metadata)"
            );
        }
        if self.api.endpoint.is_empty() {
            anyhow::bail!(
                "control-plane endpoint not configured \
                 (set api.endpoint or SQLTUNNEL_API_ENDPOINT)"
            );
        }
        if !self.api.endpoint.starts_with("http://") && !self.api.endpoint.starts_with("https://") {
            anyhow::bail!("control-plane endpoint must be an http(s) URL");
        }
        if self.log.quiet && self.log.verbose {
            anyhow::bail!("--quiet and --verbose are mutually exclusive");
        }
        for t in &self.api.ip_address_types {
            if !matches!(t.as_str(), "PUBLIC" | "PRIMARY" | "PRIVATE" | "OUTGOING") {
                anyhow::bail!("unknown ip address type {:?}", t);
            }
        }
        Ok(())
    }
}
