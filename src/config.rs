//! Configuration file parsing for `lodestar.toml`.
//!
//! Every section is optional and falls back to the defaults of the layer it
//! configures. Values may reference environment variables as `${NAME}`, and
//! `[environments.<name>]` tables override selected values when activated
//! with [`LodestarConfig::with_environment`].
//!
//! ```rust
//! use lodestar::config::LodestarConfig;
//!
//! let config = LodestarConfig::from_str(
//!     r#"
//!     [cluster]
//!     seeds = ["db1:27017", "db2:27017"]
//!     server_selection_timeout_ms = 5000
//!
//!     [environments.test.cluster]
//!     seeds = ["localhost"]
//!     "#,
//! )
//! .unwrap()
//! .with_environment("test");
//!
//! let settings = config.cluster_settings().unwrap();
//! assert_eq!(settings.seeds.len(), 1);
//! assert_eq!(settings.server_selection_timeout.as_millis(), 5000);
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use lodestar_bson::GuidRepresentation;
use lodestar_bson::binary::{DEFAULT_MAX_DOCUMENT_SIZE, DuplicateElementPolicy, ReaderSettings, WriterSettings};
use lodestar_bson::json::{JsonOutputMode, JsonWriterSettings};
use lodestar_driver::{ClusterSettings, ConnectionSettings, ServerAddress};
use lodestar_linq::TranslationOptions;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Result type for configuration loading.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML or does not match the expected shape.
    #[error("invalid config: {0}")]
    Toml(#[from] toml::de::Error),

    /// A value parsed but is not usable.
    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: &'static str, message: String },
}

impl ConfigError {
    fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            field,
            message: message.into(),
        }
    }
}

/// Main configuration structure for `lodestar.toml`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LodestarConfig {
    #[serde(default)]
    pub bson: BsonConfig,

    #[serde(default)]
    pub json: JsonConfig,

    #[serde(default)]
    pub translation: TranslationConfig,

    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Environment-specific overrides.
    #[serde(default)]
    pub environments: HashMap<String, EnvironmentOverride>,
}

impl LodestarConfig {
    /// Load configuration from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        debug!(path = %path.display(), "loading configuration");
        Self::from_str(&content)
    }

    /// Parse configuration from a TOML string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> ConfigResult<Self> {
        let expanded = expand_env_vars(content)?;
        Ok(toml::from_str(&expanded)?)
    }

    /// Apply the overrides of environment `env`, if it is defined.
    pub fn with_environment(mut self, env: &str) -> Self {
        let Some(overrides) = self.environments.remove(env) else {
            debug!(environment = env, "no overrides defined");
            return self;
        };
        if let Some(cluster) = overrides.cluster {
            if let Some(seeds) = cluster.seeds {
                self.cluster.seeds = seeds;
            }
            if let Some(set_name) = cluster.set_name {
                self.cluster.set_name = Some(set_name);
            }
            if let Some(timeout) = cluster.server_selection_timeout_ms {
                self.cluster.server_selection_timeout_ms = timeout;
            }
            if let Some(timeout) = cluster.command_timeout_ms {
                self.cluster.command_timeout_ms = Some(timeout);
            }
        }
        if let Some(json) = overrides.json {
            if let Some(mode) = json.output_mode {
                self.json.output_mode = mode;
            }
            if let Some(indent) = json.indent {
                self.json.indent = indent;
            }
        }
        if let Some(simplify) = overrides.translation.and_then(|t| t.simplify) {
            self.translation.simplify = simplify;
        }
        self
    }

    pub fn reader_settings(&self) -> ReaderSettings {
        ReaderSettings {
            max_document_size: self.bson.max_document_size,
            duplicate_element_policy: self.bson.duplicate_element_policy,
            fix_old_binary_subtype_on_input: self.bson.fix_old_binary_subtype_on_input,
            fix_old_date_time_max_value_on_input: self.bson.fix_old_date_time_max_value_on_input,
        }
    }

    pub fn writer_settings(&self) -> WriterSettings {
        WriterSettings {
            max_document_size: self.bson.max_document_size,
            fix_old_binary_subtype_on_output: self.bson.fix_old_binary_subtype_on_output,
        }
    }

    pub fn json_writer_settings(&self) -> JsonWriterSettings {
        JsonWriterSettings {
            output_mode: self.json.output_mode,
            indent: self.json.indent,
            indent_chars: self.json.indent_chars.clone(),
            new_line_chars: self.json.new_line_chars.clone(),
        }
    }

    pub fn translation_options(&self) -> TranslationOptions {
        TranslationOptions {
            simplify: self.translation.simplify,
        }
    }

    /// The GUID layout for registries built from this configuration.
    pub fn guid_representation(&self) -> GuidRepresentation {
        self.bson.guid_representation
    }

    /// Cluster settings, with seeds parsed into addresses.
    pub fn cluster_settings(&self) -> ConfigResult<ClusterSettings> {
        let cluster = &self.cluster;
        if cluster.seeds.is_empty() {
            return Err(ConfigError::invalid("cluster.seeds", "at least one seed is required"));
        }
        let seeds = cluster
            .seeds
            .iter()
            .map(|seed| ServerAddress::parse(seed).map_err(|e| ConfigError::invalid("cluster.seeds", e.to_string())))
            .collect::<ConfigResult<Vec<_>>>()?;
        if cluster.direct_connection && seeds.len() > 1 {
            return Err(ConfigError::invalid("cluster.direct_connection", "requires exactly one seed"));
        }
        if cluster.max_wait_queue_size == 0 {
            return Err(ConfigError::invalid("cluster.max_wait_queue_size", "must be positive"));
        }
        Ok(ClusterSettings {
            seeds,
            set_name: cluster.set_name.clone(),
            direct_connection: cluster.direct_connection,
            server_selection_timeout: Duration::from_millis(cluster.server_selection_timeout_ms),
            heartbeat_frequency: Duration::from_millis(cluster.heartbeat_frequency_ms),
            local_threshold: Duration::from_millis(cluster.local_threshold_ms),
            max_wait_queue_size: cluster.max_wait_queue_size,
            connection: ConnectionSettings {
                reader: self.reader_settings(),
                writer: self.writer_settings(),
                command_timeout: cluster.command_timeout_ms.map(Duration::from_millis),
            },
        })
    }
}

/// Binary codec settings.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct BsonConfig {
    #[serde(default = "default_max_document_size")]
    pub max_document_size: usize,

    #[serde(default)]
    pub duplicate_element_policy: DuplicateElementPolicy,

    #[serde(default)]
    pub fix_old_binary_subtype_on_input: bool,

    #[serde(default)]
    pub fix_old_binary_subtype_on_output: bool,

    #[serde(default)]
    pub fix_old_date_time_max_value_on_input: bool,

    #[serde(default)]
    pub guid_representation: GuidRepresentation,
}

impl Default for BsonConfig {
    fn default() -> Self {
        Self {
            max_document_size: DEFAULT_MAX_DOCUMENT_SIZE,
            duplicate_element_policy: DuplicateElementPolicy::default(),
            fix_old_binary_subtype_on_input: false,
            fix_old_binary_subtype_on_output: false,
            fix_old_date_time_max_value_on_input: false,
            guid_representation: GuidRepresentation::default(),
        }
    }
}

fn default_max_document_size() -> usize {
    DEFAULT_MAX_DOCUMENT_SIZE
}

/// Extended JSON writer settings.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct JsonConfig {
    #[serde(default)]
    pub output_mode: JsonOutputMode,

    #[serde(default)]
    pub indent: bool,

    #[serde(default = "default_indent_chars")]
    pub indent_chars: String,

    #[serde(default = "default_new_line_chars")]
    pub new_line_chars: String,
}

impl Default for JsonConfig {
    fn default() -> Self {
        Self {
            output_mode: JsonOutputMode::default(),
            indent: false,
            indent_chars: default_indent_chars(),
            new_line_chars: default_new_line_chars(),
        }
    }
}

fn default_indent_chars() -> String {
    "  ".to_string()
}

fn default_new_line_chars() -> String {
    "\n".to_string()
}

/// Translator settings.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TranslationConfig {
    /// Run the simplifier over translated pipelines.
    #[serde(default = "default_true")]
    pub simplify: bool,
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self { simplify: true }
    }
}

fn default_true() -> bool {
    true
}

/// Deployment and server selection settings.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    /// Seed addresses as `host` or `host:port` (supports `${ENV_VAR}` interpolation).
    #[serde(default = "default_seeds")]
    pub seeds: Vec<String>,

    pub set_name: Option<String>,

    #[serde(default)]
    pub direct_connection: bool,

    #[serde(default = "default_server_selection_timeout_ms")]
    pub server_selection_timeout_ms: u64,

    #[serde(default = "default_heartbeat_frequency_ms")]
    pub heartbeat_frequency_ms: u64,

    #[serde(default = "default_local_threshold_ms")]
    pub local_threshold_ms: u64,

    #[serde(default = "default_max_wait_queue_size")]
    pub max_wait_queue_size: usize,

    /// Unset waits for replies indefinitely.
    pub command_timeout_ms: Option<u64>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            seeds: default_seeds(),
            set_name: None,
            direct_connection: false,
            server_selection_timeout_ms: default_server_selection_timeout_ms(),
            heartbeat_frequency_ms: default_heartbeat_frequency_ms(),
            local_threshold_ms: default_local_threshold_ms(),
            max_wait_queue_size: default_max_wait_queue_size(),
            command_timeout_ms: None,
        }
    }
}

fn default_seeds() -> Vec<String> {
    vec!["localhost:27017".to_string()]
}
fn default_server_selection_timeout_ms() -> u64 { 30_000 }
fn default_heartbeat_frequency_ms() -> u64 { 10_000 }
fn default_local_threshold_ms() -> u64 { 15 }
fn default_max_wait_queue_size() -> usize { 500 }

/// Environment-specific configuration overrides.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct EnvironmentOverride {
    pub cluster: Option<ClusterOverride>,
    pub json: Option<JsonOverride>,
    pub translation: Option<TranslationOverride>,
}

/// Cluster overrides.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterOverride {
    pub seeds: Option<Vec<String>>,
    pub set_name: Option<String>,
    pub server_selection_timeout_ms: Option<u64>,
    pub command_timeout_ms: Option<u64>,
}

/// JSON writer overrides.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct JsonOverride {
    pub output_mode: Option<JsonOutputMode>,
    pub indent: Option<bool>,
}

/// Translator overrides.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TranslationOverride {
    pub simplify: Option<bool>,
}

/// Expand `${VAR_NAME}` references. Unset variables are left as written.
fn expand_env_vars(content: &str) -> ConfigResult<String> {
    let re = regex_lite::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}")
        .map_err(|e| ConfigError::invalid("environment variable pattern", e.to_string()))?;
    let expanded = re.replace_all(content, |caps: &regex_lite::Captures<'_>| match std::env::var(&caps[1]) {
        Ok(value) => value,
        Err(_) => caps[0].to_string(),
    });
    Ok(expanded.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_config() {
        let config = LodestarConfig::default();
        assert_eq!(config.reader_settings(), ReaderSettings::default());
        assert_eq!(config.writer_settings(), WriterSettings::default());
        assert_eq!(config.json_writer_settings(), JsonWriterSettings::default());
        assert!(config.translation_options().simplify);
        let cluster = config.cluster_settings().unwrap();
        assert_eq!(cluster, ClusterSettings::default());
    }

    #[test]
    fn test_parse_sections() {
        let config = LodestarConfig::from_str(
            r#"
            [bson]
            max_document_size = 1024
            duplicate_element_policy = "reject"
            guid_representation = "standard"

            [json]
            output_mode = "canonical"

            [translation]
            simplify = false
            "#,
        )
        .unwrap();
        assert_eq!(config.reader_settings().max_document_size, 1024);
        assert_eq!(config.reader_settings().duplicate_element_policy, DuplicateElementPolicy::Reject);
        assert_eq!(config.guid_representation(), GuidRepresentation::Standard);
        assert_eq!(config.json_writer_settings().output_mode, JsonOutputMode::Canonical);
        assert!(!config.translation_options().simplify);
    }

    #[test]
    fn test_unknown_fields_rejected() {
        assert!(matches!(LodestarConfig::from_str("[bson]\nmax_size = 1"), Err(ConfigError::Toml(_))));
        assert!(LodestarConfig::from_str("[logging]\nlevel = \"debug\"").is_err());
    }

    #[test]
    fn test_env_var_expansion() {
        // SAFETY: the variable name is unique to this test.
        unsafe {
            std::env::set_var("LODESTAR_TEST_SEED_HOST", "db.internal");
        }
        let expanded = expand_env_vars("seeds = [\"${LODESTAR_TEST_SEED_HOST}:27018\", \"${LODESTAR_TEST_UNSET_VAR}\"]").unwrap();
        assert_eq!(expanded, "seeds = [\"db.internal:27018\", \"${LODESTAR_TEST_UNSET_VAR}\"]");
        unsafe {
            std::env::remove_var("LODESTAR_TEST_SEED_HOST");
        }
    }

    #[test]
    fn test_environment_overrides() {
        let config = LodestarConfig::from_str(
            r#"
            [cluster]
            seeds = ["a:1", "b:2"]

            [environments.ci.cluster]
            seeds = ["ci-db"]
            command_timeout_ms = 250

            [environments.ci.translation]
            simplify = false
            "#,
        )
        .unwrap();
        let untouched = config.clone().with_environment("prod");
        assert_eq!(untouched.cluster.seeds, vec!["a:1", "b:2"]);

        let ci = config.with_environment("ci");
        let settings = ci.cluster_settings().unwrap();
        assert_eq!(settings.seeds, vec![ServerAddress::new("ci-db", 27017)]);
        assert_eq!(settings.connection.command_timeout, Some(Duration::from_millis(250)));
        assert!(!ci.translation_options().simplify);
    }

    #[test]
    fn test_invalid_cluster_values() {
        let bad_seed = LodestarConfig::from_str("[cluster]\nseeds = [\"host:0\"]").unwrap();
        assert!(matches!(
            bad_seed.cluster_settings(),
            Err(ConfigError::InvalidValue { field: "cluster.seeds", .. })
        ));
        let direct = LodestarConfig::from_str("[cluster]\nseeds = [\"a\", \"b\"]\ndirect_connection = true").unwrap();
        assert!(direct.cluster_settings().is_err());
    }
}
