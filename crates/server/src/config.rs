//! Configuration loading and CLI surface (§10.4).
//!
//! Layered the way the teacher layers daemon config: a defaults layer,
//! an optional YAML/JSON file layer, then an environment layer, all
//! through `figment`; `clap`-parsed per-field overrides are applied last,
//! mirroring `Args::merge_config`'s "only overwrite what was explicitly
//! passed" rule.

use clap::Parser;
use figment::providers::{Env, Format, Json, Serialized, Yaml};
use figment::Figment;
use racetype_common::RuntimeConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    pub listen_address: SocketAddr,
    #[serde(flatten)]
    pub runtime: RuntimeConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:8080".parse().expect("hardcoded address parses"),
            runtime: RuntimeConfig::default(),
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "racetype-server", about = "Real-time coordination engine for a competitive typing-test service")]
pub struct Args {
    #[arg(long, value_name = "listen-address", help = "HTTP/WS listen address")]
    pub listen_address: Option<SocketAddr>,

    #[arg(long, value_name = "config", help = "Path to a YAML or JSON configuration file layered over the defaults")]
    pub config_file: Option<PathBuf>,

    #[arg(
        long,
        value_name = "write-merged-config",
        help = "If set, write the fully merged configuration (JSON) to this path and exit without starting the server"
    )]
    pub write_merged_config: Option<PathBuf>,

    #[arg(long, value_name = "n", help = "Override max_connections_per_identity")]
    pub max_connections_per_identity: Option<u32>,

    #[arg(long, value_name = "ms", help = "Override countdown_duration_ms")]
    pub countdown_duration_ms: Option<u64>,

    #[arg(long, value_name = "ms", help = "Override housekeeping_interval_ms")]
    pub housekeeping_interval_ms: Option<u64>,

    #[arg(long, help = "Enable debug-level logging")]
    pub debug: bool,
}

impl Args {
    /// Apply CLI overrides onto a file/defaults-derived config, touching
    /// only the fields that were actually passed (§10.4).
    fn merge_config(&self, mut config: ServerConfig) -> ServerConfig {
        if let Some(addr) = self.listen_address {
            config.listen_address = addr;
        }
        if let Some(n) = self.max_connections_per_identity {
            config.runtime.max_connections_per_identity = n;
        }
        if let Some(ms) = self.countdown_duration_ms {
            config.runtime.countdown_duration_ms = ms;
        }
        if let Some(ms) = self.housekeeping_interval_ms {
            config.runtime.housekeeping_interval_ms = ms;
        }
        config
    }

    /// Load defaults, then an optional config file, then the environment,
    /// then this `Args`' own overrides, in that precedence order.
    pub fn load(&self) -> Result<ServerConfig, figment::Error> {
        let mut figment = Figment::new().merge(Serialized::defaults(ServerConfig::default()));

        if let Some(path) = &self.config_file {
            figment = match path.extension().and_then(|ext| ext.to_str()) {
                Some("json") => figment.merge(Json::file(path)),
                _ => figment.merge(Yaml::file(path)),
            };
        }

        figment = figment.merge(Env::prefixed("RACETYPE_").split("__"));

        let config: ServerConfig = figment.extract()?;
        Ok(self.merge_config(config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_load_without_a_config_file() {
        let args = Args::parse_from(["racetype-server"]);
        let config = args.load().unwrap();
        assert_eq!(config.listen_address, "0.0.0.0:8080".parse::<SocketAddr>().unwrap());
        assert_eq!(config.runtime.max_connections_per_identity, 5);
    }

    #[test]
    fn cli_override_wins_over_defaults() {
        let args = Args::parse_from(["racetype-server", "--max-connections-per-identity", "9"]);
        let config = args.load().unwrap();
        assert_eq!(config.runtime.max_connections_per_identity, 9);
    }

    #[test]
    fn listen_address_override_is_applied() {
        let args = Args::parse_from(["racetype-server", "--listen-address", "127.0.0.1:9999"]);
        let config = args.load().unwrap();
        assert_eq!(config.listen_address, "127.0.0.1:9999".parse::<SocketAddr>().unwrap());
    }
}
