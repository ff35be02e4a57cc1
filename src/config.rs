use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// Port assumed when `upstream_dns` is given as a bare IP.
const DNS_PORT: u16 = 53;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub dns_bind: SocketAddr,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_ip: Option<String>,
    pub upstream_dns: String,
    pub upstream_timeout_ms: u64,
    /// Seconds a resolved address stays cached; zero or less never expires.
    pub cache_ttl_secs: i64,
    /// Highest workload a cloudlet may report and still receive clients.
    pub max_cloudlet_workload: i32,
    /// `memory`, or a `redis://` URL.
    pub cache_store: String,
    pub telemetry_port: u16,
    pub telemetry_path: String,
    pub telemetry_connect_timeout_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub services_file: Option<String>,
    #[serde(default)]
    pub cloudlets: Vec<CloudletSeed>,
}

/// A cloudlet registered at startup rather than through the registration API.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CloudletSeed {
    pub name: String,
    pub ip: String,
    #[serde(default)]
    pub domain: String,
    /// Domains of the services this cloudlet provides.
    #[serde(default)]
    pub services: Vec<String>,
}

/// Settings the workload trackers need to reach a cloudlet.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub port: u16,
    pub path: String,
    pub connect_timeout: Duration,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            port: 6000,
            path: "/info/currentclient".into(),
            connect_timeout: Duration::from_secs(3),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let telemetry = TelemetryConfig::default();
        Self {
            dns_bind: SocketAddr::from(([0, 0, 0, 0], DNS_PORT)),
            bind_ip: None,
            upstream_dns: "8.8.8.8:53".into(),
            upstream_timeout_ms: 2000,
            cache_ttl_secs: 60,
            max_cloudlet_workload: 100,
            cache_store: "redis://127.0.0.1:6379/0".into(),
            telemetry_port: telemetry.port,
            telemetry_path: telemetry.path,
            telemetry_connect_timeout_ms: telemetry.connect_timeout.as_millis() as u64,
            services_file: None,
            cloudlets: Vec::new(),
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Self::from_figment(
            Figment::from(Serialized::defaults(Config::default()))
                .merge(Toml::file("cloudlet-dns.toml"))
                .merge(Json::file("cloudlet-dns.json"))
                .merge(Env::prefixed("CLOUDLET_DNS_")),
        )
    }

    fn from_figment(figment: Figment) -> anyhow::Result<Self> {
        let mut config: Config = figment
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        // If bind_ip is set, override the IP part of dns_bind
        if let Some(ref ip) = config.bind_ip {
            let ip: IpAddr = ip
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid bind_ip: {}", e))?;
            config.dns_bind.set_ip(ip);
        }

        config.upstream_addr()?;
        Ok(config)
    }

    /// Upstream resolver address; a bare IP means port 53.
    pub fn upstream_addr(&self) -> anyhow::Result<SocketAddr> {
        if let Ok(addr) = self.upstream_dns.parse::<SocketAddr>() {
            return Ok(addr);
        }
        let ip: IpAddr = self
            .upstream_dns
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid upstream_dns {}: {}", self.upstream_dns, e))?;
        Ok(SocketAddr::new(ip, DNS_PORT))
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream_timeout_ms)
    }

    pub fn telemetry(&self) -> TelemetryConfig {
        TelemetryConfig {
            port: self.telemetry_port,
            path: self.telemetry_path.clone(),
            connect_timeout: Duration::from_millis(self.telemetry_connect_timeout_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_extract_cleanly() {
        let config = Config::from_figment(Figment::from(Serialized::defaults(Config::default())))
            .unwrap();
        assert_eq!(config.dns_bind.port(), 53);
        assert_eq!(config.upstream_addr().unwrap(), "8.8.8.8:53".parse().unwrap());
        assert_eq!(config.telemetry().path, "/info/currentclient");
    }

    #[test]
    fn bare_upstream_ip_gets_dns_port_and_bind_ip_keeps_port() {
        let figment = Figment::from(Serialized::defaults(Config::default()))
            .merge(Serialized::default("upstream_dns", "1.1.1.1"))
            .merge(Serialized::default("bind_ip", "127.0.0.1"))
            .merge(Serialized::default("dns_bind", "0.0.0.0:5353"));
        let config = Config::from_figment(figment).unwrap();
        assert_eq!(config.upstream_addr().unwrap(), "1.1.1.1:53".parse().unwrap());
        assert_eq!(config.dns_bind, "127.0.0.1:5353".parse().unwrap());
    }

    #[test]
    fn garbage_upstream_is_rejected() {
        let figment = Figment::from(Serialized::defaults(Config::default()))
            .merge(Serialized::default("upstream_dns", "not-an-ip"));
        assert!(Config::from_figment(figment).is_err());
    }
}
