use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{McpError, Result};

/// Root client configuration for one tool hub endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Tool hub URL; sessions and catalogues are keyed by it
    pub endpoint: String,
    /// Additional headers sent on every request
    #[serde(default)]
    pub headers: Vec<HeaderConfig>,
    /// Write endpoint to use instead of waiting for the `endpoint` event
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_endpoint_url: Option<String>,
    #[serde(default)]
    pub profile: Profile,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub timeouts: TimeoutTiers,
    #[serde(default)]
    pub session: SessionConfig,
    /// Handshake and discovery timeout in milliseconds
    #[serde(default = "default_bootstrap_timeout")]
    pub bootstrap_timeout_ms: u64,
    /// Boolean flags injected as `false` for matching tools
    #[serde(default = "default_flag_defaults")]
    pub flag_defaults: Vec<FlagDefault>,
    /// List of allowed tools (empty = all allowed)
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    /// List of denied tools
    #[serde(default)]
    pub denied_tools: Vec<String>,
}

fn default_bootstrap_timeout() -> u64 {
    30000 // 30 seconds
}

fn default_flag_defaults() -> Vec<FlagDefault> {
    vec![FlagDefault {
        prefix: "images.".to_string(),
        flag: "force_refresh".to_string(),
    }]
}

/// HTTP header configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderConfig {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlagDefault {
    pub prefix: String,
    pub flag: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Profile {
    #[default]
    Standard,
    Test,
    FastTest,
}

impl std::str::FromStr for Profile {
    type Err = McpError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "standard" | "production" | "default" => Ok(Profile::Standard),
            "test" => Ok(Profile::Test),
            "fast-test" | "fast_test" | "fast" => Ok(Profile::FastTest),
            other => Err(McpError::InvalidConfig(format!("Unknown profile: {}", other))),
        }
    }
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per invocation
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Backoff unit; attempt `n` sleeps `2^n * base_delay_ms`
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay() -> u64 {
    1000
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Delay slept after a failed `attempt` (1-based). Saturates instead of
    /// overflowing for huge bases or attempt counts.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay()
            .checked_mul(2u32.saturating_pow(attempt))
            .unwrap_or(Duration::MAX)
    }
}

/// Timeout tiers selected by tool-name prefix
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutTiers {
    #[serde(default = "default_timeout")]
    pub default_ms: u64,
    #[serde(default = "default_slow_timeout")]
    pub slow_ms: u64,
    #[serde(default = "default_slowest_timeout")]
    pub slowest_ms: u64,
    #[serde(default = "default_slow_prefixes")]
    pub slow_prefixes: Vec<String>,
    #[serde(default = "default_slowest_prefixes")]
    pub slowest_prefixes: Vec<String>,
}

impl Default for TimeoutTiers {
    fn default() -> Self {
        Self {
            default_ms: default_timeout(),
            slow_ms: default_slow_timeout(),
            slowest_ms: default_slowest_timeout(),
            slow_prefixes: default_slow_prefixes(),
            slowest_prefixes: default_slowest_prefixes(),
        }
    }
}

fn default_timeout() -> u64 {
    60000
}

fn default_slow_timeout() -> u64 {
    240000
}

fn default_slowest_timeout() -> u64 {
    300000
}

fn default_slow_prefixes() -> Vec<String> {
    vec!["geo.".to_string(), "places.".to_string()]
}

fn default_slowest_prefixes() -> Vec<String> {
    vec!["booking.".to_string(), "flights.".to_string()]
}

impl TimeoutTiers {
    pub fn for_tool(&self, tool_name: &str) -> Duration {
        let matches = |prefixes: &[String]| prefixes.iter().any(|p| tool_name.starts_with(p.as_str()));
        let ms = if matches(&self.slowest_prefixes) {
            self.slowest_ms
        } else if matches(&self.slow_prefixes) {
            self.slow_ms
        } else {
            self.default_ms
        };
        Duration::from_millis(ms)
    }

    fn lowered_for_tests(&mut self) {
        self.default_ms = 15000;
        self.slow_ms = 45000;
        self.slowest_ms = 90000;
    }
}

/// Session cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_session_ttl")]
    pub ttl_secs: u64,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_session_header")]
    pub header: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_session_ttl(),
            probe_timeout_ms: default_probe_timeout(),
            header: default_session_header(),
        }
    }
}

fn default_session_ttl() -> u64 {
    300
}

fn default_probe_timeout() -> u64 {
    5000
}

fn default_session_header() -> String {
    "Mcp-Session-Id".to_string()
}

impl SessionConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

fn parse_bool_env(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "y" | "on"
    )
}

impl ClientConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            headers: Vec::new(),
            override_endpoint_url: None,
            profile: Profile::Standard,
            retry: RetryConfig::default(),
            timeouts: TimeoutTiers::default(),
            session: SessionConfig::default(),
            bootstrap_timeout_ms: default_bootstrap_timeout(),
            flag_defaults: default_flag_defaults(),
            allowed_tools: Vec::new(),
            denied_tools: Vec::new(),
        }
    }

    /// Builds a configuration from `MCP_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let endpoint = std::env::var("MCP_SERVER_URL")
            .map_err(|_| McpError::InvalidConfig("MCP_SERVER_URL is not set".to_string()))?;
        let mut config = Self::new(endpoint);
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Reads a TOML file, then applies environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            McpError::InvalidConfig(format!("Cannot read {}: {}", path.display(), e))
        })?;
        let mut config = Self::from_toml_str(&content)?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let mut config: ClientConfig = toml::from_str(content)
            .map_err(|e| McpError::InvalidConfig(format!("Invalid TOML: {}", e)))?;
        let profile = config.profile;
        config.apply_profile(profile);
        Ok(config)
    }

    /// Lowers timeouts and retries for a test profile.
    pub fn apply_profile(&mut self, profile: Profile) {
        self.profile = profile;
        match profile {
            Profile::Standard => {}
            Profile::Test => self.timeouts.lowered_for_tests(),
            Profile::FastTest => {
                self.timeouts.lowered_for_tests();
                self.retry.max_retries = 1;
                self.retry.base_delay_ms = 500;
            }
        }
    }

    /// Applies `MCP_*` environment overrides on top of the current values.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(url) = std::env::var("MCP_SERVER_URL") {
            self.endpoint = url;
        }
        if let Ok(profile) = std::env::var("MCP_PROFILE") {
            self.apply_profile(profile.parse()?);
        }
        if let Ok(fast) = std::env::var("MCP_FAST_TEST") {
            if parse_bool_env(&fast) {
                self.apply_profile(Profile::FastTest);
            }
        }
        self.apply_env_limits()
    }

    /// Switches profile while keeping explicit `MCP_*` retry and override URL
    /// values, which always win over profile defaults.
    pub fn override_profile(&mut self, profile: Profile) -> Result<()> {
        self.apply_profile(profile);
        self.apply_env_limits()
    }

    fn apply_env_limits(&mut self) -> Result<()> {
        if let Ok(retries) = std::env::var("MCP_MAX_RETRIES") {
            self.retry.max_retries = retries.trim().parse().map_err(|_| {
                McpError::InvalidConfig(format!("Invalid MCP_MAX_RETRIES: {}", retries))
            })?;
        }
        if let Ok(delay) = std::env::var("MCP_RETRY_BASE_DELAY_MS") {
            self.retry.base_delay_ms = delay.trim().parse().map_err(|_| {
                McpError::InvalidConfig(format!("Invalid MCP_RETRY_BASE_DELAY_MS: {}", delay))
            })?;
        }
        if let Ok(url) = std::env::var("MCP_OVERRIDE_ENDPOINT_URL") {
            if !url.trim().is_empty() {
                self.override_endpoint_url = Some(url);
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        url::Url::parse(&self.endpoint)?;
        if let Some(url) = &self.override_endpoint_url {
            url::Url::parse(url)?;
        }
        if self.retry.max_retries == 0 {
            return Err(McpError::InvalidConfig(
                "retry.max_retries must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn bootstrap_timeout(&self) -> Duration {
        Duration::from_millis(self.bootstrap_timeout_ms)
    }

    pub fn timeout_for(&self, tool_name: &str) -> Duration {
        self.timeouts.for_tool(tool_name)
    }

    /// Flags that must be present (as `false`) for this tool.
    pub fn flags_for<'a>(&'a self, tool_name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.flag_defaults
            .iter()
            .filter(move |f| tool_name.starts_with(f.prefix.as_str()))
            .map(|f| f.flag.as_str())
    }
}
