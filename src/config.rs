//! Service configuration.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable could not be parsed.
    #[error("invalid value for {var}: {value:?}")]
    Invalid {
        /// Variable name.
        var: &'static str,
        /// Raw value.
        value: String,
    },
}

/// Settings shared by every service.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the front-ends bind to.
    pub bind_ip: IpAddr,
    /// QR heartbeat port (UDP).
    pub qr_port: u16,
    /// Server browser port (TCP).
    pub browser_port: u16,
    /// NAT negotiation port (UDP).
    pub natneg_port: u16,
    /// Registry RPC address.
    pub registry_addr: SocketAddr,
    /// Secret key table.
    pub gslist: PathBuf,
    /// Optional `{pid: platform}` JSON table.
    pub profiles: Option<PathBuf>,
    /// QR sessions silent this long are dropped.
    pub keepalive_timeout: Duration,
    /// How often the QR keepalive sweep runs.
    pub sweep_interval: Duration,
    /// NatNeg slot lifetime. `None` keeps slots forever.
    pub natneg_slot_ttl: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            qr_port: 27900,
            browser_port: 28910,
            natneg_port: 27901,
            registry_addr: SocketAddr::from(([127, 0, 0, 1], 27500)),
            gslist: PathBuf::from("gslist.cfg"),
            profiles: None,
            keepalive_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(15),
            natneg_slot_ttl: None,
        }
    }
}

impl ServerConfig {
    /// Create config from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            bind_ip: env_parse("DWC_BIND_IP")?.unwrap_or(defaults.bind_ip),
            qr_port: env_parse("DWC_QR_PORT")?.unwrap_or(defaults.qr_port),
            browser_port: env_parse("DWC_BROWSER_PORT")?.unwrap_or(defaults.browser_port),
            natneg_port: env_parse("DWC_NATNEG_PORT")?.unwrap_or(defaults.natneg_port),
            registry_addr: env_parse("DWC_REGISTRY_ADDR")?.unwrap_or(defaults.registry_addr),
            gslist: std::env::var("DWC_GSLIST").map(PathBuf::from).unwrap_or(defaults.gslist),
            profiles: std::env::var("DWC_PROFILES").ok().map(PathBuf::from),
            keepalive_timeout: env_secs("DWC_KEEPALIVE_TIMEOUT")?.unwrap_or(defaults.keepalive_timeout),
            sweep_interval: env_secs("DWC_SWEEP_INTERVAL")?.unwrap_or(defaults.sweep_interval),
            natneg_slot_ttl: env_parse::<u64>("DWC_NATNEG_SLOT_TTL")?
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
        })
    }

    /// QR socket address.
    pub fn qr_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_ip, self.qr_port)
    }

    /// Server browser listener address.
    pub fn browser_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_ip, self.browser_port)
    }

    /// NAT negotiation socket address.
    pub fn natneg_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_ip, self.natneg_port)
    }
}

fn env_parse<T: FromStr>(var: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(var) {
        Ok(value) => parse_value(var, &value).map(Some),
        Err(_) => Ok(None),
    }
}

/// A positive number of seconds.
fn env_secs(var: &'static str) -> Result<Option<Duration>, ConfigError> {
    match std::env::var(var) {
        Ok(value) => parse_secs(var, &value).map(Some),
        Err(_) => Ok(None),
    }
}

fn parse_secs(var: &'static str, value: &str) -> Result<Duration, ConfigError> {
    match parse_value::<u64>(var, value)? {
        0 => Err(ConfigError::Invalid {
            var,
            value: value.to_string(),
        }),
        secs => Ok(Duration::from_secs(secs)),
    }
}

fn parse_value<T: FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        var,
        value: value.to_string(),
    })
}
