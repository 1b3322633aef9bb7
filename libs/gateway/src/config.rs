//! Gateway configuration: CLI-derived settings, the optional JSON route
//! table, and the derived `PoolOptions`/bind address.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use kirogate_server::pool::PoolOptions;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub host: IpAddr,
    pub port: u16,
    pub agent_bin: PathBuf,
    pub agent_subcommand: String,
    pub agent_args: Vec<String>,
    pub cwd: PathBuf,
    pub idle_secs: u64,
    pub routes_path: Option<PathBuf>,
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayConfigValidationError {
    #[error("cwd does not exist or is not a directory: {0}")]
    CwdNotADirectory(PathBuf),
    #[error("routes file does not exist: {0}")]
    RoutesFileMissing(PathBuf),
    #[error("idle_secs must be greater than zero")]
    IdleSecsZero,
}

impl GatewayConfig {
    pub fn validate(&self) -> Result<(), GatewayConfigValidationError> {
        if !self.cwd.is_dir() {
            return Err(GatewayConfigValidationError::CwdNotADirectory(
                self.cwd.clone(),
            ));
        }
        if let Some(routes_path) = &self.routes_path {
            if !routes_path.is_file() {
                return Err(GatewayConfigValidationError::RoutesFileMissing(
                    routes_path.clone(),
                ));
            }
        }
        if self.idle_secs == 0 {
            return Err(GatewayConfigValidationError::IdleSecsZero);
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn pool_options(&self) -> PoolOptions {
        PoolOptions {
            agent_bin: self.agent_bin.clone(),
            subcommand: self.agent_subcommand.clone(),
            default_extra_args: self.agent_args.clone(),
            default_cwd: self.cwd.clone(),
            idle_timeout: Duration::from_secs(self.idle_secs),
            ..PoolOptions::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> GatewayConfig {
        GatewayConfig {
            host: "127.0.0.1".parse().unwrap_or_else(|e| panic!("{e}")),
            port: 8080,
            agent_bin: PathBuf::from("kiro"),
            agent_subcommand: "agent".to_string(),
            agent_args: Vec::new(),
            cwd: std::env::temp_dir(),
            idle_secs: 1800,
            routes_path: None,
        }
    }

    #[test]
    fn validate_accepts_a_sensible_config() {
        assert!(sample_config().validate().is_ok());
    }

    #[test]
    fn validate_rejects_a_missing_cwd() {
        let mut config = sample_config();
        config.cwd = PathBuf::from("/no/such/directory/kirogate-test");
        assert!(matches!(
            config.validate(),
            Err(GatewayConfigValidationError::CwdNotADirectory(_))
        ));
    }

    #[test]
    fn validate_rejects_zero_idle_secs() {
        let mut config = sample_config();
        config.idle_secs = 0;
        assert!(matches!(
            config.validate(),
            Err(GatewayConfigValidationError::IdleSecsZero)
        ));
    }

    #[test]
    fn pool_options_carries_idle_timeout_and_agent_settings_through() {
        let config = sample_config();
        let options = config.pool_options();
        assert_eq!(options.idle_timeout, Duration::from_secs(1800));
        assert_eq!(options.agent_bin, PathBuf::from("kiro"));
        assert_eq!(options.subcommand, "agent");
    }

    #[test]
    fn bind_addr_combines_host_and_port() {
        let config = sample_config();
        assert_eq!(config.bind_addr().to_string(), "127.0.0.1:8080");
    }
}
