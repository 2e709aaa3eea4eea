//! Configuration for agentstream.
//!
//! Settings are plain structs users can construct manually — no TOML, YAML,
//! or other config-file parsing dependencies are introduced.
//! [`AppConfig::from_env`] fills them from the process environment using the
//! recognized keys below.
//!
//! | Key | Effect |
//! |---|---|
//! | `LLM_PROVIDER` (`azure` \| `ollama` \| `mock`) | Selects the token-source backend. |
//! | `LLM_MOCK_MODE=true` | Forces the mock regardless of provider. |
//! | `AZURE_OPENAI_ENDPOINT` / `_API_KEY` / `_DEPLOYMENT` / `_API_VERSION` | Remote-chat provider. |
//! | `OLLAMA_URL`, `OLLAMA_MODEL` | Local provider. |
//! | `LLM_MOCK_DELAY_MS` | Per-token delay for the mock. |
//! | `DATABASE_PROVIDER` (`memory` \| `sqlite` \| `cosmosdb`) | Repository backend. |
//! | `DATABASE_SQLITE_PATH` | File location for the embedded backend. |
//! | `AZURE_COSMOSDB_ENDPOINT` / `_KEY` / `_DATABASE` / `_CONTAINER` | Document store backend. |
//! | `SSE_STREAM_STORE_PROVIDER` (`memory` \| `redis`) | Enables cross-instance abort. |
//! | `REDIS_URL` | Transport for cross-instance abort. |
//! | `APP_PORT`, `APP_HOST`, `APP_BASE_PATH` | Listener binding. |
//!
//! # Example
//!
//! ```rust
//! use agentstream::config::{AppConfig, LlmProvider};
//!
//! let mut config = AppConfig::default();
//! config.llm.provider = LlmProvider::Mock;
//! assert_eq!(config.server.base_path, "/api/v1");
//! ```

use std::env;

/// Which LLM token-source backend to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmProvider {
    /// Remote-chat provider speaking Azure-OpenAI style chunked SSE.
    Azure,
    /// Local provider speaking newline-delimited JSON.
    Ollama,
    /// Deterministic in-process mock.
    Mock,
}

/// Which repository backend to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseProvider {
    Memory,
    Sqlite,
    CosmosDb,
}

/// Token-source settings.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    /// When set, overrides `provider` with [`LlmProvider::Mock`].
    pub mock_mode: bool,
    pub azure_endpoint: String,
    pub azure_api_key: String,
    pub azure_deployment: String,
    pub azure_api_version: String,
    pub ollama_url: String,
    pub ollama_model: String,
    /// Per-token delay of the mock, in milliseconds.
    pub mock_delay_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::Mock,
            mock_mode: false,
            azure_endpoint: String::new(),
            azure_api_key: String::new(),
            azure_deployment: "gpt-4o".to_string(),
            azure_api_version: "2024-06-01".to_string(),
            ollama_url: "http://localhost:11434".to_string(),
            ollama_model: "llama3".to_string(),
            mock_delay_ms: 0,
        }
    }
}

impl LlmConfig {
    /// Effective provider after applying the mock override.
    pub fn effective_provider(&self) -> LlmProvider {
        if self.mock_mode {
            LlmProvider::Mock
        } else {
            self.provider
        }
    }
}

/// Repository settings.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub provider: DatabaseProvider,
    pub sqlite_path: String,
    pub cosmos_endpoint: String,
    pub cosmos_key: String,
    pub cosmos_database: String,
    pub cosmos_container: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            provider: DatabaseProvider::Memory,
            sqlite_path: "agentstream.db".to_string(),
            cosmos_endpoint: String::new(),
            cosmos_key: String::new(),
            cosmos_database: "chat".to_string(),
            cosmos_container: "threads".to_string(),
        }
    }
}

/// Stream-abort fabric settings.
#[derive(Debug, Clone, Default)]
pub struct AbortConfig {
    /// Redis URL for the cross-instance transport; `None` keeps the fabric
    /// in local-only mode.
    pub redis_url: Option<String>,
}

/// Search collaborator settings.
#[derive(Debug, Clone)]
pub struct SearchConfig {
    /// Divisor that maps a provider's raw average score into [0, 1]. The
    /// default of 10.0 matches providers scoring hits on a 0–10 scale.
    pub relevance_scale: f64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            relevance_scale: 10.0,
        }
    }
}

/// Listener settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Prefix for all routes, default `/api/v1`.
    pub base_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            base_path: "/api/v1".to_string(),
        }
    }
}

/// Full application configuration.
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub database: DatabaseConfig,
    pub abort: AbortConfig,
    pub search: SearchConfig,
    pub server: ServerConfig,
}

impl AppConfig {
    /// Read configuration from the process environment.
    ///
    /// Unknown values fall back to defaults with a warning rather than
    /// failing startup.
    pub fn from_env() -> Self {
        let mut config = AppConfig::default();

        if let Ok(provider) = env::var("LLM_PROVIDER") {
            config.llm.provider = match provider.to_ascii_lowercase().as_str() {
                "azure" => LlmProvider::Azure,
                "ollama" => LlmProvider::Ollama,
                "mock" => LlmProvider::Mock,
                other => {
                    log::warn!("AppConfig::from_env: unknown LLM_PROVIDER '{}', using mock", other);
                    LlmProvider::Mock
                }
            };
        }
        config.llm.mock_mode = env_flag("LLM_MOCK_MODE");
        read_into(&mut config.llm.azure_endpoint, "AZURE_OPENAI_ENDPOINT");
        read_into(&mut config.llm.azure_api_key, "AZURE_OPENAI_API_KEY");
        read_into(&mut config.llm.azure_deployment, "AZURE_OPENAI_DEPLOYMENT");
        read_into(&mut config.llm.azure_api_version, "AZURE_OPENAI_API_VERSION");
        read_into(&mut config.llm.ollama_url, "OLLAMA_URL");
        read_into(&mut config.llm.ollama_model, "OLLAMA_MODEL");
        if let Some(delay) = env_parse::<u64>("LLM_MOCK_DELAY_MS") {
            config.llm.mock_delay_ms = delay;
        }

        if let Ok(provider) = env::var("DATABASE_PROVIDER") {
            config.database.provider = match provider.to_ascii_lowercase().as_str() {
                "memory" => DatabaseProvider::Memory,
                "sqlite" => DatabaseProvider::Sqlite,
                "cosmosdb" => DatabaseProvider::CosmosDb,
                other => {
                    log::warn!(
                        "AppConfig::from_env: unknown DATABASE_PROVIDER '{}', using memory",
                        other
                    );
                    DatabaseProvider::Memory
                }
            };
        }
        read_into(&mut config.database.sqlite_path, "DATABASE_SQLITE_PATH");
        read_into(&mut config.database.cosmos_endpoint, "AZURE_COSMOSDB_ENDPOINT");
        read_into(&mut config.database.cosmos_key, "AZURE_COSMOSDB_KEY");
        read_into(&mut config.database.cosmos_database, "AZURE_COSMOSDB_DATABASE");
        read_into(&mut config.database.cosmos_container, "AZURE_COSMOSDB_CONTAINER");

        let abort_provider = env::var("SSE_STREAM_STORE_PROVIDER").unwrap_or_default();
        if abort_provider.eq_ignore_ascii_case("redis") {
            config.abort.redis_url = env::var("REDIS_URL").ok();
            if config.abort.redis_url.is_none() {
                log::warn!(
                    "AppConfig::from_env: SSE_STREAM_STORE_PROVIDER=redis but REDIS_URL unset; \
                     falling back to local-only abort"
                );
            }
        }

        if let Some(scale) = env_parse::<f64>("SEARCH_RELEVANCE_SCALE") {
            if scale > 0.0 {
                config.search.relevance_scale = scale;
            }
        }

        read_into(&mut config.server.host, "APP_HOST");
        if let Some(port) = env_parse::<u16>("APP_PORT") {
            config.server.port = port;
        }
        read_into(&mut config.server.base_path, "APP_BASE_PATH");

        config
    }
}

fn read_into(slot: &mut String, key: &str) {
    if let Ok(value) = env::var(key) {
        if !value.is_empty() {
            *slot = value;
        }
    }
}

fn env_flag(key: &str) -> bool {
    env::var(key)
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
        .unwrap_or(false)
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_mode_overrides_provider() {
        let mut config = LlmConfig::default();
        config.provider = LlmProvider::Azure;
        config.mock_mode = true;
        assert_eq!(config.effective_provider(), LlmProvider::Mock);
    }

    #[test]
    fn defaults_are_local_friendly() {
        let config = AppConfig::default();
        assert_eq!(config.database.provider, DatabaseProvider::Memory);
        assert!(config.abort.redis_url.is_none());
        assert_eq!(config.server.base_path, "/api/v1");
        assert!((config.search.relevance_scale - 10.0).abs() < f64::EPSILON);
    }
}
