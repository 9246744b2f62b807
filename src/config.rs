use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Service type advertised and browsed for, e.g. `_beacond._tcp`.
    pub service_name: String,
    /// Discovery domain, almost always `local`.
    pub service_domain: String,
    /// Port published in the service's SRV record.
    pub service_port: u16,
    /// Explicit interface to bind registrations to, by name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface_name: Option<String>,
    /// Restrict registration to `interface_name` (or the first probed
    /// eligible interface when no name is given).
    pub bind_to_interface: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: "_beacond._tcp".into(),
            service_domain: "local".into(),
            service_port: 9999,
            interface_name: None,
            bind_to_interface: false,
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("beacond.toml"))
            .merge(Json::file("beacond.json"))
            .merge(Env::prefixed("BEACOND_"))
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        if config.service_port == 0 {
            return Err(anyhow::anyhow!("service_port must be non-zero"));
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.service_name, "_beacond._tcp");
        assert_eq!(cfg.service_domain, "local");
        assert_eq!(cfg.service_port, 9999);
        assert!(cfg.interface_name.is_none());
        assert!(!cfg.bind_to_interface);
    }
}
