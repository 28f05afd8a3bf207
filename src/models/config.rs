use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    RoundRobin,
    FillFirst,
}

impl RoutingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutingStrategy::RoundRobin => "round_robin",
            RoutingStrategy::FillFirst => "fill_first",
        }
    }

    // Unknown strategies fall back to round_robin.
    pub fn parse(value: &str) -> Self {
        match value {
            "fill_first" => RoutingStrategy::FillFirst,
            _ => RoutingStrategy::RoundRobin,
        }
    }
}

impl Default for RoutingStrategy {
    fn default() -> Self {
        RoutingStrategy::RoundRobin
    }
}

// Singleton proxy configuration row. api_key, when non-empty, is the shared
// secret clients must present as a bearer token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_proxy_port")]
    pub port: u16,
    #[serde(default)]
    pub routing_strategy: RoutingStrategy,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub auto_start: bool,
}

fn default_proxy_port() -> u16 {
    crate::constants::DEFAULT_PROXY_PORT
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: default_proxy_port(),
            routing_strategy: RoutingStrategy::default(),
            api_key: String::new(),
            auto_start: false,
        }
    }
}

// Per client-CLI record: where its config lives and whether it already points
// at this proxy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub agent_name: String,
    pub config_path: String,
    pub installed: bool,
    pub auto_configured: bool,
    pub proxy_url: String,
    pub last_configured: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_parse_defaults_to_round_robin() {
        assert_eq!(RoutingStrategy::parse("fill_first"), RoutingStrategy::FillFirst);
        assert_eq!(RoutingStrategy::parse("round_robin"), RoutingStrategy::RoundRobin);
        assert_eq!(RoutingStrategy::parse("anything-else"), RoutingStrategy::RoundRobin);
    }

    #[test]
    fn proxy_config_defaults() {
        let config = ProxyConfig::default();
        assert_eq!(config.port, crate::constants::DEFAULT_PROXY_PORT);
        assert_eq!(config.routing_strategy, RoutingStrategy::RoundRobin);
        assert!(config.api_key.is_empty());
        assert!(!config.auto_start);
    }
}
