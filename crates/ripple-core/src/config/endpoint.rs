//! Query endpoint configuration.

use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Where the stream engine's HTTP API lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Base URL of the engine, e.g. `http://localhost:8088`.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Path of the statement endpoint (pull and push queries).
    #[serde(default = "default_query_path")]
    pub query_path: String,

    /// Path of the query-termination endpoint.
    #[serde(default = "default_close_query_path")]
    pub close_query_path: String,

    /// API key sent as a bearer token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Environment variable holding the API key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            query_path: default_query_path(),
            close_query_path: default_close_query_path(),
            api_key: None,
            api_key_env: None,
        }
    }
}

impl EndpointConfig {
    /// Create a configuration pointing at `base_url` with default paths.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    /// Resolve the API key, preferring `api_key_env` when the variable is set.
    pub fn resolved_api_key(&self) -> Option<String> {
        if let Some(env_var) = &self.api_key_env {
            if let Ok(key) = std::env::var(env_var) {
                return Some(key);
            }
        }
        self.api_key.clone()
    }

    /// Full URL of the statement endpoint.
    pub fn query_url(&self) -> String {
        join_url(&self.base_url, &self.query_path)
    }

    /// Full URL of the query-termination endpoint.
    pub fn close_query_url(&self) -> String {
        join_url(&self.base_url, &self.close_query_path)
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(ConfigError::Config(format!(
                "endpoint.base_url must be an http(s) URL, got '{}'",
                self.base_url
            )));
        }
        Ok(())
    }
}

fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

fn default_base_url() -> String {
    "http://localhost:8088".to_string()
}

fn default_query_path() -> String {
    "/query-stream".to_string()
}

fn default_close_query_path() -> String {
    "/close-query".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls_join_without_double_slash() {
        let endpoint = EndpointConfig::new("http://engine:8088/");
        assert_eq!(endpoint.query_url(), "http://engine:8088/query-stream");
        assert_eq!(endpoint.close_query_url(), "http://engine:8088/close-query");
    }

    #[test]
    fn test_api_key_from_env() {
        // SAFETY: We're in a test and controlling the environment
        unsafe {
            std::env::set_var("RIPPLE_TEST_API_KEY", "from-env");
        }

        let endpoint = EndpointConfig {
            api_key: Some("inline".to_string()),
            api_key_env: Some("RIPPLE_TEST_API_KEY".to_string()),
            ..Default::default()
        };
        assert_eq!(endpoint.resolved_api_key().as_deref(), Some("from-env"));

        // SAFETY: Cleanup in test
        unsafe {
            std::env::remove_var("RIPPLE_TEST_API_KEY");
        }
        assert_eq!(endpoint.resolved_api_key().as_deref(), Some("inline"));
    }

    #[test]
    fn test_rejects_non_http_base_url() {
        let endpoint = EndpointConfig::new("ftp://engine");
        assert!(endpoint.validate().is_err());
    }
}
