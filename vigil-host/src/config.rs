use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;
use tracing::warn;

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HostConfig {
    pub listen: ListenConf,
    pub auth: AuthConf,
    /// Operator identity recorded in command audit entries.
    pub operator: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ListenConf {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AuthConf {
    /// Advertised lifetime of the one-time code sent on connect.
    pub expire_sec: u32,
}

impl Default for ListenConf {
    fn default() -> Self {
        Self { host: "0.0.0.0".into(), port: 9000 }
    }
}

impl Default for AuthConf {
    fn default() -> Self {
        Self { expire_sec: 300 }
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            listen: ListenConf::default(),
            auth: AuthConf::default(),
            operator: "host".into(),
        }
    }
}

pub async fn load_config() -> HostConfig {
    let path = std::env::var("VIGIL_HOST_CONFIG").unwrap_or_else(|_| "host.yaml".into());
    if Path::new(&path).exists() {
        let txt = fs::read_to_string(&path).await.unwrap_or_default();
        if txt.trim().is_empty() {
            return HostConfig::default();
        }
        serde_yaml::from_str(&txt).unwrap_or_else(|e| {
            warn!("invalid config {path}: {e}, using defaults");
            HostConfig::default()
        })
    } else {
        warn!("no {path}, using default config");
        HostConfig::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_protocol() {
        let config = HostConfig::default();
        assert_eq!(config.listen.host, "0.0.0.0");
        assert_eq!(config.listen.port, 9000);
        assert_eq!(config.auth.expire_sec, 300);
        assert_eq!(config.operator, "host");
    }

    #[test]
    fn partial_yaml_fills_in_defaults() {
        let config: HostConfig = serde_yaml::from_str("listen:\n  port: 7000\n").unwrap();
        assert_eq!(config.listen.port, 7000);
        assert_eq!(config.listen.host, "0.0.0.0");
        assert_eq!(config.auth.expire_sec, 300);
    }
}
