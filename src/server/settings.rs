use config::{builder::DefaultState, Config, ConfigBuilder, ConfigError};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;

use crate::server::registry::models::RegistryConfig;

/// Prefix for structured environment overrides, e.g. `REGISTRY_PROXY__REGISTRY__HOST`
const ENV_PREFIX: &str = "REGISTRY_PROXY";

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub registry: RegistryConfig,
    #[serde(default)]
    pub auth: AuthSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,
    pub port: u16,

    /// Redirect non-API paths to the upstream registry's web UI
    #[serde(default = "default_browser_redirects")]
    pub browser_redirects: bool,

    /// Overall timeout for a single upstream request, in seconds.
    /// When unset, upstream calls are bounded only by the transport.
    #[serde(default)]
    pub upstream_timeout_secs: Option<u64>,

    /// Serve HTTPS with this certificate/key pair instead of plain HTTP
    #[serde(default)]
    pub tls: Option<TlsSettings>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TlsSettings {
    pub cert_path: String,
    pub key_path: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_browser_redirects() -> bool {
    true
}

fn default_metadata_endpoint() -> String {
    "http://metadata/computeMetadata/v1/instance/service-accounts/default/token".to_string()
}

fn default_refresh_margin_secs() -> u64 {
    300
}

/// How proxied registry requests are authenticated
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AuthSettings {
    /// Forward requests without adding an Authorization header
    #[default]
    None,
    /// Send a fixed Authorization header value
    StaticHeader { header: String },
    /// Send `Basic` credentials built from a service account JSON key file
    ServiceAccountKey { path: String },
    /// Use short-lived tokens from the platform metadata service
    MetadataServer {
        #[serde(default = "default_metadata_endpoint")]
        endpoint: String,
        /// Refresh this many seconds before the token expires
        #[serde(default = "default_refresh_margin_secs")]
        refresh_margin_secs: u64,
    },
}

impl AuthSettings {
    pub fn kind(&self) -> &'static str {
        match self {
            AuthSettings::None => "none",
            AuthSettings::StaticHeader { .. } => "static-header",
            AuthSettings::ServiceAccountKey { .. } => "service-account-key",
            AuthSettings::MetadataServer { .. } => "metadata-server",
        }
    }
}

impl Settings {
    /// Substitute environment variables in a string value
    /// Replaces ${VAR_NAME} or ${VAR_NAME:-default} with environment variable values
    fn substitute_env_vars_in_string(s: &str) -> String {
        lazy_static::lazy_static! {
            static ref ENV_REF: regex::Regex =
                regex::Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").unwrap();
        }

        ENV_REF
            .replace_all(s, |caps: &regex::Captures| {
                let var_name = &caps[1];
                let default_value = caps.get(2).map(|m| m.as_str());

                match env::var(var_name) {
                    Ok(val) => val,
                    Err(_) => default_value.unwrap_or("").to_string(),
                }
            })
            .to_string()
    }

    /// Convert a config::Value to a serde_json::Value, performing environment variable substitution
    fn config_value_to_json(value: &config::Value) -> serde_json::Value {
        use config::ValueKind;

        match &value.kind {
            ValueKind::Nil => serde_json::Value::Null,
            ValueKind::Boolean(b) => serde_json::Value::Bool(*b),
            ValueKind::I64(i) => serde_json::Value::Number((*i).into()),
            ValueKind::I128(i) => serde_json::Value::Number((*i as i64).into()),
            ValueKind::U64(u) => serde_json::Value::Number((*u).into()),
            ValueKind::U128(u) => serde_json::Value::Number((*u as u64).into()),
            ValueKind::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            ValueKind::String(s) => {
                serde_json::Value::String(Self::substitute_env_vars_in_string(s))
            }
            ValueKind::Table(table) => {
                let mut map = serde_json::Map::new();
                for (k, v) in table.iter() {
                    map.insert(k.clone(), Self::config_value_to_json(v));
                }
                serde_json::Value::Object(map)
            }
            ValueKind::Array(arr) => {
                let vec: Vec<serde_json::Value> =
                    arr.iter().map(Self::config_value_to_json).collect();
                serde_json::Value::Array(vec)
            }
        }
    }

    /// Try to add a config file with multiple extension attempts (.toml, .yaml, .yml)
    /// Returns true if a file was loaded
    fn try_add_config_file(
        builder: &mut ConfigBuilder<DefaultState>,
        config_dir: &str,
        name: &str,
    ) -> bool {
        let extensions = ["toml", "yaml", "yml"];

        for ext in extensions {
            let path = format!("{}/{}.{}", config_dir, name, ext);
            if std::path::Path::new(&path).exists() {
                tracing::info!("Loading config file: {}", path);
                *builder = builder
                    .clone()
                    .add_source(config::File::with_name(&format!("{}/{}", config_dir, name)));
                return true;
            }
        }

        tracing::debug!(
            "Optional config file not found: {}/{}.{{toml,yaml,yml}}",
            config_dir,
            name
        );
        false
    }

    /// Apply the plain environment variables of the classic deployment
    /// (`PORT`, `REGISTRY_HOST`, ...). These take precedence over everything else.
    fn apply_plain_env_overrides(
        mut builder: ConfigBuilder<DefaultState>,
        vars: &HashMap<String, String>,
    ) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
        let var = |name: &str| vars.get(name).filter(|v| !v.is_empty()).cloned();

        if let Some(port) = var("PORT") {
            let port: i64 = port.parse().map_err(|_| {
                ConfigError::Message(format!("PORT must be a number, got '{}'", port))
            })?;
            builder = builder.set_override("server.port", port)?;
        }

        builder = builder
            .set_override_option("registry.host", var("REGISTRY_HOST"))?
            .set_override_option("registry.repo_prefix", var("REPO_PREFIX"))?;

        if var("DISABLE_BROWSER_REDIRECTS").is_some() {
            builder = builder.set_override("server.browser_redirects", false)?;
        }

        if let (Some(cert), Some(key)) = (var("TLS_CERT"), var("TLS_KEY")) {
            builder = builder
                .set_override("server.tls.cert_path", cert)?
                .set_override("server.tls.key_path", key)?;
        }

        // First match wins: metadata server, then a literal header, then a key file
        if var("USE_METADATA_SERVER").is_some() {
            builder = builder.set_override("auth.type", "metadata-server")?;
        } else if let Some(header) = var("AUTH_HEADER") {
            builder = builder
                .set_override("auth.type", "static-header")?
                .set_override("auth.header", header)?;
        } else if let Some(path) = var("GOOGLE_APPLICATION_CREDENTIALS") {
            builder = builder
                .set_override("auth.type", "service-account-key")?
                .set_override("auth.path", path)?;
        }

        Ok(builder)
    }

    pub fn new() -> Result<Self, ConfigError> {
        let vars: HashMap<String, String> = env::vars().collect();
        let run_mode = vars
            .get("REGISTRY_PROXY_CONFIG_RUN_MODE")
            .cloned()
            .unwrap_or_else(|| "development".into());
        let config_dir = vars
            .get("REGISTRY_PROXY_CONFIG_DIR")
            .cloned()
            .unwrap_or_else(|| "config".into());

        Self::load(&config_dir, &run_mode, vars)
    }

    /// Load settings from `config_dir` and the given environment.
    ///
    /// Sources, lowest precedence first: `default`, `<run_mode>` and `local`
    /// config files, `REGISTRY_PROXY__SECTION__FIELD` variables, then the plain
    /// variables handled by [`Self::apply_plain_env_overrides`].
    pub fn load(
        config_dir: &str,
        run_mode: &str,
        vars: HashMap<String, String>,
    ) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        // TOML takes precedence if both exist
        Self::try_add_config_file(&mut builder, config_dir, "default");
        Self::try_add_config_file(&mut builder, config_dir, run_mode);
        Self::try_add_config_file(&mut builder, config_dir, "local");

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true)
                .source(Some(vars.clone())),
        );
        builder = Self::apply_plain_env_overrides(builder, &vars)?;

        let config = builder.build()?;

        let root_value = config
            .cache
            .into_table()
            .map_err(|e| ConfigError::Message(format!("Failed to get config table: {}", e)))?;

        let mut json_map = serde_json::Map::new();
        for (k, v) in root_value.iter() {
            json_map.insert(k.clone(), Self::config_value_to_json(v));
        }
        let json_value = serde_json::Value::Object(json_map);

        let mut unused_fields = Vec::new();
        let mut settings: Settings = serde_ignored::deserialize(json_value, |path| {
            unused_fields.push(path.to_string());
        })
        .map_err(|e| ConfigError::Message(format!("Failed to load settings: {}", e)))?;

        for field in &unused_fields {
            tracing::warn!("Unknown configuration field: {}", field);
        }

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&mut self) -> Result<(), ConfigError> {
        self.registry.host = self.registry.host.trim().to_string();
        self.registry.repo_prefix = self.registry.repo_prefix.trim_matches('/').to_string();

        if self.registry.host.is_empty() {
            return Err(ConfigError::Message(
                "Registry host not configured. Set REGISTRY_HOST (example: gcr.io) or [registry] host in config".to_string(),
            ));
        }
        if self.registry.repo_prefix.is_empty() {
            return Err(ConfigError::Message(
                "Repository prefix not configured. Set REPO_PREFIX or [registry] repo_prefix in config".to_string(),
            ));
        }

        if let Some(tls) = &self.server.tls {
            if tls.cert_path.is_empty() || tls.key_path.is_empty() {
                return Err(ConfigError::Message(
                    "TLS requires both cert_path and key_path".to_string(),
                ));
            }
        }

        match &self.auth {
            AuthSettings::StaticHeader { header } if header.is_empty() => {
                Err(ConfigError::Message(
                    "Static header authentication requires a non-empty header".to_string(),
                ))
            }
            AuthSettings::ServiceAccountKey { path } if path.is_empty() => {
                Err(ConfigError::Message(
                    "Service account key authentication requires a key file path".to_string(),
                ))
            }
            AuthSettings::MetadataServer { endpoint, .. } => url::Url::parse(endpoint)
                .map(|_| ())
                .map_err(|e| {
                    ConfigError::Message(format!(
                        "Invalid metadata server endpoint '{}': {}",
                        endpoint, e
                    ))
                }),
            _ => Ok(()),
        }
    }
}
