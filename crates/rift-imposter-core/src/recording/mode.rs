//! Proxy recording mode definitions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Proxy recording mode (Mountebank-compatible)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "camelCase")]
#[allow(clippy::enum_variant_names)] // Keep Mountebank-compatible names
pub enum ProxyMode {
    /// Record first response, replay on subsequent matches
    #[default]
    ProxyOnce,
    /// Always proxy, record every response
    ProxyAlways,
    /// Always proxy, never record
    ProxyTransparent,
}

impl ProxyMode {
    /// Parse a configured mode; unknown or missing modes yield `None`.
    pub fn parse(mode: Option<&str>) -> Option<Self> {
        match mode? {
            "proxyOnce" => Some(ProxyMode::ProxyOnce),
            "proxyAlways" => Some(ProxyMode::ProxyAlways),
            "proxyTransparent" => Some(ProxyMode::ProxyTransparent),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyMode::ProxyOnce => "proxyOnce",
            ProxyMode::ProxyAlways => "proxyAlways",
            ProxyMode::ProxyTransparent => "proxyTransparent",
        }
    }

    /// Whether proxied responses are saved as new stubs or responses.
    pub fn records(&self) -> bool {
        !matches!(self, ProxyMode::ProxyTransparent)
    }
}

impl fmt::Display for ProxyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_modes() {
        assert_eq!(ProxyMode::parse(Some("proxyAlways")), Some(ProxyMode::ProxyAlways));
        assert_eq!(ProxyMode::parse(Some("proxyonce")), None);
        assert_eq!(ProxyMode::parse(None), None);
        assert_eq!(ProxyMode::default(), ProxyMode::ProxyOnce);
    }

    #[test]
    fn test_serde_round_names() {
        let mode: ProxyMode = serde_json::from_str("\"proxyTransparent\"").unwrap();
        assert_eq!(mode, ProxyMode::ProxyTransparent);
        assert!(!mode.records());
        assert_eq!(mode.to_string(), "proxyTransparent");
    }
}
