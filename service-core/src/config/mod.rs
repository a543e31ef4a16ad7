use crate::error::AppError;
use config::{Config as Cfg, File};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};

/// Settings shared by every service: the HTTP bind address.
///
/// Read from an optional `configuration` file and `APP__*` environment
/// variables, after loading `.env` if present.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Config {
    pub fn load() -> Result<Self, AppError> {
        dotenvy::dotenv().ok();

        let config = Cfg::builder()
            .add_source(File::with_name("configuration").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Socket address to bind. `host` must be an IP literal.
    pub fn bind_addr(&self) -> Result<SocketAddr, AppError> {
        let ip: IpAddr = self.host.trim().parse().map_err(|_| {
            AppError::ConfigError(anyhow::anyhow!(
                "APP__HOST must be an IP address, got {:?}",
                self.host
            ))
        })?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_addr_uses_host_and_port() {
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 0,
        };
        assert_eq!(config.bind_addr().unwrap().to_string(), "127.0.0.1:0");
    }

    #[test]
    fn bind_addr_rejects_hostnames() {
        let config = Config {
            host: "localhost".to_string(),
            port: 8080,
        };
        assert!(matches!(config.bind_addr(), Err(AppError::ConfigError(_))));
    }
}
