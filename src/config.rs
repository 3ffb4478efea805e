//! Application configuration.
//!
//! Every field has a default, so a partial TOML document (or none at all)
//! yields a usable configuration.

use crate::error::{ServerError, ServerResult};
use crate::router::WildcardMode;
use serde::Deserialize;

pub const DEFAULT_BODY_LIMIT: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Largest request body, in bytes, that `Body::bytes` will read.
    pub body_limit: usize,
    pub max_connections: usize,
    /// Whether a trailing `*` also matches an empty remainder.
    pub wildcard: WildcardMode,
    /// Answer 405 with an `Allow` header instead of 404 when the path
    /// matches a route registered for other methods only.
    pub method_not_allowed: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            body_limit: DEFAULT_BODY_LIMIT,
            max_connections: 256,
            wildcard: WildcardMode::OneOrMore,
            method_not_allowed: false,
        }
    }
}

impl AppConfig {
    pub fn from_toml_str(source: &str) -> ServerResult<Self> {
        toml::from_str(source).map_err(|e| ServerError::ParseError(format!("invalid config: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = AppConfig::from_toml_str(
            r#"
            body_limit = 2048
            wildcard = "zero_or_more"
            "#,
        )
        .unwrap();
        assert_eq!(config.body_limit, 2048);
        assert_eq!(config.wildcard, WildcardMode::ZeroOrMore);
        assert_eq!(config.max_connections, 256);
        assert!(!config.method_not_allowed);
    }

    #[test]
    fn test_invalid_toml() {
        assert!(matches!(
            AppConfig::from_toml_str("body_limit = \"lots\""),
            Err(ServerError::ParseError(_))
        ));
    }
}
