//! Configuration management

use std::{collections::HashMap, env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Token type URN for a JWT subject token
pub const JWT_SUBJECT_TOKEN_TYPE: &str = "urn:ietf:params:oauth:token-type:jwt";

/// Scope requested for the gateway identity token when none is configured
pub const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

/// Longest role session name prefix that still leaves room for the
/// `-YYYYmmdd-HHMMSS-xxxxxxxx` suffix within STS's 64 characters
pub const MAX_SESSION_NAME_PREFIX_LEN: usize = 39;

/// Legacy flat environment variables and the config keys they populate
const LEGACY_ENV_KEYS: &[(&str, &str)] = &[
    ("AWS_ROLE_ARN", "federation.role_arn"),
    ("AWS_REGION", "federation.region"),
    ("GCP_WORKLOAD_IDENTITY_POOL", "gateway_identity.token_url"),
    ("GCP_PROVIDER_ID", "gateway_identity.audience"),
    ("WORKLOAD_IDENTITY_POOL", "federation_identity.token_url"),
    ("WORKLOAD_IDENTITY_PROVIDER", "federation_identity.audience"),
    ("GCP_GATEWAY_URL", "gateway.url"),
    ("GATEWAY_TIMEOUT", "gateway.timeout"),
];

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// Server configuration
    pub server: ServerConfig,
    /// Workload identity used to mint the token sent to the policy gateway
    pub gateway_identity: IdentityConfig,
    /// Workload identity used to mint the token presented to STS
    pub federation_identity: IdentityConfig,
    /// Cross-cloud role federation configuration
    pub federation: FederationConfig,
    /// Policy gateway configuration
    pub gateway: GatewayConfig,
    /// Bedrock backend configuration
    pub backend: BackendConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            env_files: Vec::new(),
            server: ServerConfig::default(),
            gateway_identity: IdentityConfig {
                scopes: vec![CLOUD_PLATFORM_SCOPE.to_string()],
                ..Default::default()
            },
            federation_identity: IdentityConfig::default(),
            federation: FederationConfig::default(),
            gateway: GatewayConfig::default(),
            backend: BackendConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or the resulting configuration fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Legacy flat variables sit below the prefixed ones
        figment = figment.merge(Env::raw().filter_map(|key| {
            LEGACY_ENV_KEYS
                .iter()
                .find(|(name, _)| key == *name)
                .map(|(_, target)| (*target).into())
        }));
        figment = figment.merge(Env::prefixed("CRED_PROXY_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        if config.gateway_identity.scopes.is_empty() {
            config.gateway_identity.scopes = vec![CLOUD_PLATFORM_SCOPE.to_string()];
        }
        config.load_env_files();
        config.expand_env_vars();
        config.validate()?;

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand ${VAR} and ${VAR:-default} patterns in endpoint URLs
    fn expand_env_vars(&mut self) {
        let Ok(re) = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}") else {
            return;
        };

        for identity in [&mut self.gateway_identity, &mut self.federation_identity] {
            identity.token_url = Self::expand_string(&re, &identity.token_url);
            if let SubjectTokenSource::Url { headers, .. } = &mut identity.subject_token {
                for value in headers.values_mut() {
                    *value = Self::expand_string(&re, value);
                }
            }
        }
        self.gateway.url = Self::expand_string(&re, &self.gateway.url);
        if let Some(endpoint) = self.federation.sts_endpoint.as_mut() {
            *endpoint = Self::expand_string(&re, endpoint);
        }
        if let Some(endpoint) = self.backend.endpoint.as_mut() {
            *endpoint = Self::expand_string(&re, endpoint);
        }
    }

    /// Expand environment variables in a string
    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }

    /// Check required fields and refresh-policy invariants
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` naming the first problem found.
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("federation.role_arn (AWS_ROLE_ARN)", &self.federation.role_arn),
            (
                "gateway_identity.token_url (GCP_WORKLOAD_IDENTITY_POOL)",
                &self.gateway_identity.token_url,
            ),
            (
                "gateway_identity.audience (GCP_PROVIDER_ID)",
                &self.gateway_identity.audience,
            ),
            (
                "federation_identity.token_url (WORKLOAD_IDENTITY_POOL)",
                &self.federation_identity.token_url,
            ),
            (
                "federation_identity.audience (WORKLOAD_IDENTITY_PROVIDER)",
                &self.federation_identity.audience,
            ),
            ("gateway.url (GCP_GATEWAY_URL)", &self.gateway.url),
        ];
        let missing: Vec<&str> = required
            .iter()
            .filter(|(_, value)| value.trim().is_empty())
            .map(|(name, _)| *name)
            .collect();
        if !missing.is_empty() {
            return Err(Error::Config(format!(
                "Missing required configuration: {}",
                missing.join(", ")
            )));
        }

        for (section, identity) in [
            ("gateway_identity", &self.gateway_identity),
            ("federation_identity", &self.federation_identity),
        ] {
            if identity.refresh_buffer >= identity.session_duration {
                return Err(Error::Config(format!(
                    "{section}.refresh_buffer must be shorter than {section}.session_duration"
                )));
            }
        }
        if self.federation.refresh_buffer >= self.federation.session_duration {
            return Err(Error::Config(
                "federation.refresh_buffer must be shorter than federation.session_duration"
                    .into(),
            ));
        }

        // AssumeRoleWithWebIdentity accepts 15 minutes to 12 hours
        let secs = self.federation.session_duration.as_secs();
        if !(900..=43_200).contains(&secs) {
            return Err(Error::Config(format!(
                "federation.session_duration must be between 900s and 43200s, got {secs}s"
            )));
        }

        let prefix = &self.federation.session_name_prefix;
        if prefix.is_empty() || prefix.len() > MAX_SESSION_NAME_PREFIX_LEN {
            return Err(Error::Config(format!(
                "federation.session_name_prefix must be 1 to {MAX_SESSION_NAME_PREFIX_LEN} characters, got {}",
                prefix.len()
            )));
        }
        if let Some(bad) = prefix
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || "_+=,.@-".contains(*c)))
        {
            return Err(Error::Config(format!(
                "federation.session_name_prefix contains '{bad}'; allowed are letters, digits and _+=,.@-"
            )));
        }

        if self.backend.max_attempts == 0 {
            return Err(Error::Config("backend.max_attempts must be at least 1".into()));
        }

        Ok(())
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Overall request timeout
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Graceful shutdown timeout
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Maximum request body size (bytes)
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            request_timeout: Duration::from_secs(120),
            shutdown_timeout: Duration::from_secs(30),
            max_body_size: 10 * 1024 * 1024, // 10MB
        }
    }
}

/// Workload identity federation settings used to mint a federated token
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Token exchange endpoint of the workload identity pool
    pub token_url: String,
    /// Audience, i.e. the full workload identity provider resource name
    pub audience: String,
    /// Subject token type URN
    pub subject_token_type: String,
    /// Scopes requested for the exchanged token; the gateway identity
    /// requests cloud-platform when this is empty
    pub scopes: Vec<String>,
    /// Where to read the subject token from
    pub subject_token: SubjectTokenSource,
    /// How long a minted token is cached
    #[serde(with = "humantime_serde")]
    pub session_duration: Duration,
    /// Treat the token as stale this long before it expires
    #[serde(with = "humantime_serde")]
    pub refresh_buffer: Duration,
    /// Timeout for each token exchange call
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            token_url: String::new(),
            audience: String::new(),
            subject_token_type: JWT_SUBJECT_TOKEN_TYPE.to_string(),
            scopes: Vec::new(),
            subject_token: SubjectTokenSource::default(),
            session_duration: Duration::from_secs(3600),
            refresh_buffer: Duration::from_secs(300),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Source of the subject token presented to the token exchange endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SubjectTokenSource {
    /// Read from a file (projected service account token, etc.)
    File {
        /// Path to the token file
        path: String,
        /// Field to extract when the file holds JSON
        #[serde(default)]
        json_field: Option<String>,
    },
    /// Fetch from a local metadata URL
    Url {
        /// URL to GET
        url: String,
        /// Extra request headers
        #[serde(default)]
        headers: HashMap<String, String>,
        /// Field to extract when the response is JSON
        #[serde(default)]
        json_field: Option<String>,
    },
    /// Read from an environment variable
    Env {
        /// Variable name
        var: String,
    },
}

impl Default for SubjectTokenSource {
    fn default() -> Self {
        Self::File {
            path: "/var/run/secrets/workload-identity/token".to_string(),
            json_field: None,
        }
    }
}

/// Role federation (`AssumeRoleWithWebIdentity`) settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FederationConfig {
    /// ARN of the role to assume
    pub role_arn: String,
    /// AWS region for STS and Bedrock
    pub region: String,
    /// STS endpoint override (defaults to the regional endpoint)
    pub sts_endpoint: Option<String>,
    /// Requested credential lifetime
    #[serde(with = "humantime_serde")]
    pub session_duration: Duration,
    /// Treat credentials as stale this long before they expire
    #[serde(with = "humantime_serde")]
    pub refresh_buffer: Duration,
    /// Prefix for generated role session names
    pub session_name_prefix: String,
    /// Timeout for each STS call
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            role_arn: String::new(),
            region: "us-east-1".to_string(),
            sts_endpoint: None,
            session_duration: Duration::from_secs(3600),
            refresh_buffer: Duration::from_secs(300),
            session_name_prefix: "bedrock-proxy".to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

impl FederationConfig {
    /// STS endpoint, regional unless overridden
    #[must_use]
    pub fn sts_url(&self) -> String {
        self.sts_endpoint
            .clone()
            .unwrap_or_else(|| format!("https://sts.{}.amazonaws.com/", self.region))
    }
}

/// Policy gateway settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Validation endpoint
    pub url: String,
    /// Timeout for each validation call
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Bedrock backend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Endpoint override; `{service}` and `{region}` are substituted
    pub endpoint: Option<String>,
    /// Timeout for each backend attempt
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Maximum attempts per call (standard retry mode)
    pub max_attempts: u32,
    /// Initial retry backoff
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    /// Maximum retry backoff
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout: Duration::from_secs(60),
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawDuration {
        Seconds(u64),
        Text(String),
    }

    /// Serialize Duration to human-readable string (e.g., "30s")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize "30s", "5m", "100ms", or a bare number of seconds
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the value cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = match RawDuration::deserialize(deserializer)? {
            RawDuration::Seconds(secs) => return Ok(Duration::from_secs(secs)),
            RawDuration::Text(s) => s,
        };
        let s = s.trim();

        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(serde::de::Error::custom)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(serde::de::Error::custom)
        } else if let Some(hours) = s.strip_suffix('h') {
            hours
                .parse::<u64>()
                .map(|h| Duration::from_secs(h * 3600))
                .map_err(serde::de::Error::custom)
        } else {
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        }
    }
}
