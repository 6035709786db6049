//! Relay configuration loaded from environment variables.
//!
//! All settings have defaults so the relay starts with zero configuration
//! for local development.

use couloir_shared::constants::DEFAULT_LISTEN_ADDR;

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// TCP address the WebSocket listener binds to.
    /// Env: `LISTEN_ADDR`
    /// Default: `0.0.0.0:9090`
    pub listen_addr: String,

    /// Human-readable name for this relay instance, echoed in `welcome`
    /// envelopes.
    /// Env: `INSTANCE_NAME`
    /// Default: `"Couloir Relay"`
    pub instance_name: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            instance_name: "Couloir Relay".to_string(),
        }
    }
}

impl RelayConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("LISTEN_ADDR") {
            config.listen_addr = addr;
        }

        if let Ok(name) = std::env::var("INSTANCE_NAME") {
            if !name.is_empty() {
                config.instance_name = name;
            }
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so it is not stored here.

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RelayConfig::default();
        assert_eq!(config.listen_addr, "0.0.0.0:9090");
        assert_eq!(config.instance_name, "Couloir Relay");
    }
}
