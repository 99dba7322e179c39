use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub llm: LlmConfig,
    pub server: ServerConfig,
    pub agent: AgentConfig,
    pub cache: CacheConfig,
    pub memory: MemoryConfig,
    pub stream: StreamConfig,
    pub sessions: SessionConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub max_rounds: u32,
    pub tool_timeout_ms: u64,
    pub tool_max_retries: u32,
    pub retry_backoff_ms: u64,
    pub model_intent_enabled: bool,
    pub intent_cache_ttl_secs: u64,
}

#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub prompt_ttl_secs: u64,
    pub org_stats_ttl_secs: u64,
    pub decision_tree_ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

#[derive(Clone, Debug)]
pub struct MemoryConfig {
    pub enabled: bool,
    pub limit: usize,
    pub min_relevance: f64,
    pub cache_ttl_secs: u64,
}

#[derive(Clone, Debug)]
pub struct StreamConfig {
    pub chunk_size: usize,
    pub chunk_delay_ms: u64,
    pub heartbeat_secs: u64,
    pub channel_capacity: usize,
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub storage_dir: PathBuf,
    pub persist: bool,
    pub idle_eviction_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// All supported providers speak the OpenAI chat-completions dialect.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    OpenAi,
    Doubao,
    Ollama,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub llm_provider: Option<LlmProvider>,
    pub llm_model: Option<String>,
    pub llm_api_key: Option<String>,
    pub server_port: Option<u16>,
    pub sessions_storage_dir: Option<PathBuf>,
    pub agent_max_rounds: Option<u32>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://sprout.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            llm: LlmConfig {
                provider: LlmProvider::Ollama,
                api_key: None,
                base_url: Some("http://localhost:11434/v1".to_string()),
                model: "qwen2.5".to_string(),
                timeout_secs: 60,
                max_retries: 2,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
            },
            agent: AgentConfig {
                max_rounds: 20,
                tool_timeout_ms: 30_000,
                tool_max_retries: 2,
                retry_backoff_ms: 500,
                model_intent_enabled: false,
                intent_cache_ttl_secs: 300,
            },
            cache: CacheConfig {
                prompt_ttl_secs: 300,
                org_stats_ttl_secs: 600,
                decision_tree_ttl_secs: 1_800,
                sweep_interval_secs: 60,
            },
            memory: MemoryConfig {
                enabled: true,
                limit: 20,
                min_relevance: 0.5,
                cache_ttl_secs: 60,
            },
            stream: StreamConfig {
                chunk_size: 64,
                chunk_delay_ms: 10,
                heartbeat_secs: 30,
                channel_capacity: 1,
            },
            sessions: SessionConfig {
                storage_dir: PathBuf::from("data/sessions"),
                persist: true,
                idle_eviction_secs: 1_800,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl AgentConfig {
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_millis(self.tool_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn intent_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.intent_cache_ttl_secs)
    }
}

impl CacheConfig {
    pub fn prompt_ttl(&self) -> Duration {
        Duration::from_secs(self.prompt_ttl_secs)
    }

    pub fn org_stats_ttl(&self) -> Duration {
        Duration::from_secs(self.org_stats_ttl_secs)
    }

    pub fn decision_tree_ttl(&self) -> Duration {
        Duration::from_secs(self.decision_tree_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl StreamConfig {
    pub fn chunk_delay(&self) -> Duration {
        Duration::from_millis(self.chunk_delay_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }
}

impl LlmConfig {
    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_ref().map(|key| key.expose_secret())
    }

    pub fn resolved_base_url(&self) -> String {
        self.base_url.clone().unwrap_or_else(|| match self.provider {
            LlmProvider::OpenAi => "https://api.openai.com/v1".to_string(),
            LlmProvider::Doubao => "https://ark.cn-beijing.volces.com/api/v3".to_string(),
            LlmProvider::Ollama => "http://localhost:11434/v1".to_string(),
        })
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LlmProvider {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "doubao" => Ok(Self::Doubao),
            "ollama" => Ok(Self::Ollama),
            other => Err(ConfigError::Validation(format!(
                "unsupported llm provider `{other}` (expected openai|doubao|ollama)"
            ))),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("sprout.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(llm) = patch.llm {
            if let Some(provider) = llm.provider {
                self.llm.provider = provider;
            }
            if let Some(llm_api_key_value) = llm.api_key {
                self.llm.api_key = Some(secret_value(llm_api_key_value));
            }
            if let Some(base_url) = llm.base_url {
                self.llm.base_url = Some(base_url);
            }
            if let Some(model) = llm.model {
                self.llm.model = model;
            }
            if let Some(timeout_secs) = llm.timeout_secs {
                self.llm.timeout_secs = timeout_secs;
            }
            if let Some(max_retries) = llm.max_retries {
                self.llm.max_retries = max_retries;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(agent) = patch.agent {
            if let Some(max_rounds) = agent.max_rounds {
                self.agent.max_rounds = max_rounds;
            }
            if let Some(tool_timeout_ms) = agent.tool_timeout_ms {
                self.agent.tool_timeout_ms = tool_timeout_ms;
            }
            if let Some(tool_max_retries) = agent.tool_max_retries {
                self.agent.tool_max_retries = tool_max_retries;
            }
            if let Some(retry_backoff_ms) = agent.retry_backoff_ms {
                self.agent.retry_backoff_ms = retry_backoff_ms;
            }
            if let Some(model_intent_enabled) = agent.model_intent_enabled {
                self.agent.model_intent_enabled = model_intent_enabled;
            }
            if let Some(intent_cache_ttl_secs) = agent.intent_cache_ttl_secs {
                self.agent.intent_cache_ttl_secs = intent_cache_ttl_secs;
            }
        }

        if let Some(cache) = patch.cache {
            if let Some(prompt_ttl_secs) = cache.prompt_ttl_secs {
                self.cache.prompt_ttl_secs = prompt_ttl_secs;
            }
            if let Some(org_stats_ttl_secs) = cache.org_stats_ttl_secs {
                self.cache.org_stats_ttl_secs = org_stats_ttl_secs;
            }
            if let Some(decision_tree_ttl_secs) = cache.decision_tree_ttl_secs {
                self.cache.decision_tree_ttl_secs = decision_tree_ttl_secs;
            }
            if let Some(sweep_interval_secs) = cache.sweep_interval_secs {
                self.cache.sweep_interval_secs = sweep_interval_secs;
            }
        }

        if let Some(memory) = patch.memory {
            if let Some(enabled) = memory.enabled {
                self.memory.enabled = enabled;
            }
            if let Some(limit) = memory.limit {
                self.memory.limit = limit;
            }
            if let Some(min_relevance) = memory.min_relevance {
                self.memory.min_relevance = min_relevance;
            }
            if let Some(cache_ttl_secs) = memory.cache_ttl_secs {
                self.memory.cache_ttl_secs = cache_ttl_secs;
            }
        }

        if let Some(stream) = patch.stream {
            if let Some(chunk_size) = stream.chunk_size {
                self.stream.chunk_size = chunk_size;
            }
            if let Some(chunk_delay_ms) = stream.chunk_delay_ms {
                self.stream.chunk_delay_ms = chunk_delay_ms;
            }
            if let Some(heartbeat_secs) = stream.heartbeat_secs {
                self.stream.heartbeat_secs = heartbeat_secs;
            }
            if let Some(channel_capacity) = stream.channel_capacity {
                self.stream.channel_capacity = channel_capacity;
            }
        }

        if let Some(sessions) = patch.sessions {
            if let Some(storage_dir) = sessions.storage_dir {
                self.sessions.storage_dir = storage_dir;
            }
            if let Some(persist) = sessions.persist {
                self.sessions.persist = persist;
            }
            if let Some(idle_eviction_secs) = sessions.idle_eviction_secs {
                self.sessions.idle_eviction_secs = idle_eviction_secs;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("SPROUT_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("SPROUT_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = parse_u32("SPROUT_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("SPROUT_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("SPROUT_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("SPROUT_LLM_PROVIDER") {
            self.llm.provider = value.parse()?;
        }
        if let Some(value) = read_env("SPROUT_LLM_API_KEY") {
            self.llm.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("SPROUT_LLM_BASE_URL") {
            self.llm.base_url = Some(value);
        }
        if let Some(value) = read_env("SPROUT_LLM_MODEL") {
            self.llm.model = value;
        }
        if let Some(value) = read_env("SPROUT_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_u64("SPROUT_LLM_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("SPROUT_LLM_MAX_RETRIES") {
            self.llm.max_retries = parse_u32("SPROUT_LLM_MAX_RETRIES", &value)?;
        }

        if let Some(value) = read_env("SPROUT_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("SPROUT_SERVER_PORT") {
            self.server.port = parse_u16("SPROUT_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("SPROUT_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("SPROUT_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        if let Some(value) = read_env("SPROUT_AGENT_MAX_ROUNDS") {
            self.agent.max_rounds = parse_u32("SPROUT_AGENT_MAX_ROUNDS", &value)?;
        }
        if let Some(value) = read_env("SPROUT_AGENT_TOOL_TIMEOUT_MS") {
            self.agent.tool_timeout_ms = parse_u64("SPROUT_AGENT_TOOL_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = read_env("SPROUT_AGENT_TOOL_MAX_RETRIES") {
            self.agent.tool_max_retries = parse_u32("SPROUT_AGENT_TOOL_MAX_RETRIES", &value)?;
        }
        if let Some(value) = read_env("SPROUT_AGENT_RETRY_BACKOFF_MS") {
            self.agent.retry_backoff_ms = parse_u64("SPROUT_AGENT_RETRY_BACKOFF_MS", &value)?;
        }
        if let Some(value) = read_env("SPROUT_AGENT_MODEL_INTENT_ENABLED") {
            self.agent.model_intent_enabled =
                parse_bool("SPROUT_AGENT_MODEL_INTENT_ENABLED", &value)?;
        }
        if let Some(value) = read_env("SPROUT_AGENT_INTENT_CACHE_TTL_SECS") {
            self.agent.intent_cache_ttl_secs =
                parse_u64("SPROUT_AGENT_INTENT_CACHE_TTL_SECS", &value)?;
        }

        if let Some(value) = read_env("SPROUT_CACHE_PROMPT_TTL_SECS") {
            self.cache.prompt_ttl_secs = parse_u64("SPROUT_CACHE_PROMPT_TTL_SECS", &value)?;
        }
        if let Some(value) = read_env("SPROUT_CACHE_ORG_STATS_TTL_SECS") {
            self.cache.org_stats_ttl_secs = parse_u64("SPROUT_CACHE_ORG_STATS_TTL_SECS", &value)?;
        }
        if let Some(value) = read_env("SPROUT_CACHE_DECISION_TREE_TTL_SECS") {
            self.cache.decision_tree_ttl_secs =
                parse_u64("SPROUT_CACHE_DECISION_TREE_TTL_SECS", &value)?;
        }

        if let Some(value) = read_env("SPROUT_MEMORY_ENABLED") {
            self.memory.enabled = parse_bool("SPROUT_MEMORY_ENABLED", &value)?;
        }
        if let Some(value) = read_env("SPROUT_MEMORY_LIMIT") {
            self.memory.limit = parse_usize("SPROUT_MEMORY_LIMIT", &value)?;
        }
        if let Some(value) = read_env("SPROUT_MEMORY_MIN_RELEVANCE") {
            self.memory.min_relevance = parse_f64("SPROUT_MEMORY_MIN_RELEVANCE", &value)?;
        }

        if let Some(value) = read_env("SPROUT_STREAM_CHUNK_SIZE") {
            self.stream.chunk_size = parse_usize("SPROUT_STREAM_CHUNK_SIZE", &value)?;
        }
        if let Some(value) = read_env("SPROUT_STREAM_CHUNK_DELAY_MS") {
            self.stream.chunk_delay_ms = parse_u64("SPROUT_STREAM_CHUNK_DELAY_MS", &value)?;
        }
        if let Some(value) = read_env("SPROUT_STREAM_HEARTBEAT_SECS") {
            self.stream.heartbeat_secs = parse_u64("SPROUT_STREAM_HEARTBEAT_SECS", &value)?;
        }

        if let Some(value) = read_env("SPROUT_SESSIONS_STORAGE_DIR") {
            self.sessions.storage_dir = PathBuf::from(value);
        }
        if let Some(value) = read_env("SPROUT_SESSIONS_PERSIST") {
            self.sessions.persist = parse_bool("SPROUT_SESSIONS_PERSIST", &value)?;
        }
        if let Some(value) = read_env("SPROUT_SESSIONS_IDLE_EVICTION_SECS") {
            self.sessions.idle_eviction_secs =
                parse_u64("SPROUT_SESSIONS_IDLE_EVICTION_SECS", &value)?;
        }

        let log_level = read_env("SPROUT_LOGGING_LEVEL").or_else(|| read_env("SPROUT_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("SPROUT_LOGGING_FORMAT").or_else(|| read_env("SPROUT_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(llm_provider) = overrides.llm_provider {
            self.llm.provider = llm_provider;
        }
        if let Some(llm_model) = overrides.llm_model {
            self.llm.model = llm_model;
        }
        if let Some(llm_api_key) = overrides.llm_api_key {
            self.llm.api_key = Some(secret_value(llm_api_key));
        }
        if let Some(server_port) = overrides.server_port {
            self.server.port = server_port;
        }
        if let Some(storage_dir) = overrides.sessions_storage_dir {
            self.sessions.storage_dir = storage_dir;
        }
        if let Some(max_rounds) = overrides.agent_max_rounds {
            self.agent.max_rounds = max_rounds;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_llm(&self.llm)?;
        validate_server(&self.server)?;
        validate_agent(&self.agent)?;
        validate_cache(&self.cache)?;
        validate_memory(&self.memory)?;
        validate_stream(&self.stream)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("sprout.toml"), PathBuf::from("config/sprout.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_llm(llm: &LlmConfig) -> Result<(), ConfigError> {
    if llm.timeout_secs == 0 || llm.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "llm.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    if llm.model.trim().is_empty() {
        return Err(ConfigError::Validation("llm.model must not be empty".to_string()));
    }

    match llm.provider {
        LlmProvider::OpenAi | LlmProvider::Doubao => {
            let missing = llm
                .api_key
                .as_ref()
                .map(|value| value.expose_secret().trim().is_empty())
                .unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.api_key is required for openai/doubao providers".to_string(),
                ));
            }
        }
        LlmProvider::Ollama => {
            let missing =
                llm.base_url.as_ref().map(|value| value.trim().is_empty()).unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.base_url is required for ollama provider".to_string(),
                ));
            }
        }
    }

    if let Some(base_url) = &llm.base_url {
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(ConfigError::Validation(
                "llm.base_url must start with http:// or https://".to_string(),
            ));
        }
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_agent(agent: &AgentConfig) -> Result<(), ConfigError> {
    if agent.max_rounds == 0 || agent.max_rounds > 100 {
        return Err(ConfigError::Validation(
            "agent.max_rounds must be in range 1..=100".to_string(),
        ));
    }

    if agent.tool_timeout_ms == 0 {
        return Err(ConfigError::Validation(
            "agent.tool_timeout_ms must be greater than zero".to_string(),
        ));
    }

    if agent.tool_max_retries > 10 {
        return Err(ConfigError::Validation(
            "agent.tool_max_retries must be at most 10".to_string(),
        ));
    }

    Ok(())
}

fn validate_cache(cache: &CacheConfig) -> Result<(), ConfigError> {
    let ttls = [
        ("cache.prompt_ttl_secs", cache.prompt_ttl_secs),
        ("cache.org_stats_ttl_secs", cache.org_stats_ttl_secs),
        ("cache.decision_tree_ttl_secs", cache.decision_tree_ttl_secs),
        ("cache.sweep_interval_secs", cache.sweep_interval_secs),
    ];

    for (key, value) in ttls {
        if value == 0 {
            return Err(ConfigError::Validation(format!("{key} must be greater than zero")));
        }
    }

    Ok(())
}

fn validate_memory(memory: &MemoryConfig) -> Result<(), ConfigError> {
    if memory.limit == 0 {
        return Err(ConfigError::Validation("memory.limit must be greater than zero".to_string()));
    }

    if !(0.0..=1.0).contains(&memory.min_relevance) {
        return Err(ConfigError::Validation(
            "memory.min_relevance must be in range 0.0..=1.0".to_string(),
        ));
    }

    Ok(())
}

fn validate_stream(stream: &StreamConfig) -> Result<(), ConfigError> {
    if stream.chunk_size == 0 {
        return Err(ConfigError::Validation(
            "stream.chunk_size must be greater than zero".to_string(),
        ));
    }

    if stream.heartbeat_secs == 0 {
        return Err(ConfigError::Validation(
            "stream.heartbeat_secs must be greater than zero".to_string(),
        ));
    }

    if stream.channel_capacity == 0 {
        return Err(ConfigError::Validation(
            "stream.channel_capacity must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_usize(key: &str, value: &str) -> Result<usize, ConfigError> {
    value.parse::<usize>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_f64(key: &str, value: &str) -> Result<f64, ConfigError> {
    value.parse::<f64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    value.parse::<bool>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    llm: Option<LlmPatch>,
    server: Option<ServerPatch>,
    agent: Option<AgentPatch>,
    cache: Option<CachePatch>,
    memory: Option<MemoryPatch>,
    stream: Option<StreamPatch>,
    sessions: Option<SessionPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    provider: Option<LlmProvider>,
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    timeout_secs: Option<u64>,
    max_retries: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct AgentPatch {
    max_rounds: Option<u32>,
    tool_timeout_ms: Option<u64>,
    tool_max_retries: Option<u32>,
    retry_backoff_ms: Option<u64>,
    model_intent_enabled: Option<bool>,
    intent_cache_ttl_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct CachePatch {
    prompt_ttl_secs: Option<u64>,
    org_stats_ttl_secs: Option<u64>,
    decision_tree_ttl_secs: Option<u64>,
    sweep_interval_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct MemoryPatch {
    enabled: Option<bool>,
    limit: Option<usize>,
    min_relevance: Option<f64>,
    cache_ttl_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamPatch {
    chunk_size: Option<usize>,
    chunk_delay_ms: Option<u64>,
    heartbeat_secs: Option<u64>,
    channel_capacity: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct SessionPatch {
    storage_dir: Option<PathBuf>,
    persist: Option<bool>,
    idle_eviction_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Mutex, OnceLock};

    use tempfile::TempDir;

    use super::{AppConfig, ConfigError, ConfigOverrides, LlmProvider, LoadOptions, LogFormat};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    #[test]
    fn defaults_validate_without_any_file_or_env() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let config = AppConfig::load(LoadOptions::default())
            .map_err(|err| format!("config load failed: {err}"))?;

        ensure(config.agent.max_rounds == 20, "default max rounds should be 20")?;
        ensure(config.stream.heartbeat_secs == 30, "default heartbeat should be 30s")?;
        ensure(
            matches!(config.llm.provider, LlmProvider::Ollama),
            "default provider should be ollama",
        )?;
        Ok(())
    }

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_SPROUT_LLM_KEY", "sk-from-env");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("sprout.toml");
            fs::write(
                &path,
                r#"
[llm]
provider = "open_ai"
api_key = "${TEST_SPROUT_LLM_KEY}"
model = "gpt-4o-mini"

[agent]
max_rounds = 8
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.llm.api_key() == Some("sk-from-env"), "api key should come from env")?;
            ensure(config.llm.provider == LlmProvider::OpenAi, "provider should be openai")?;
            ensure(config.agent.max_rounds == 8, "max rounds should come from the file")?;
            Ok(())
        })();

        clear_vars(&["TEST_SPROUT_LLM_KEY"]);
        result
    }

    #[test]
    fn logging_env_aliases_are_supported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("SPROUT_LOG_LEVEL", "warn");
        env::set_var("SPROUT_LOG_FORMAT", "pretty");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.logging.level == "warn", "warning log level should be set from env var")?;
            ensure(
                matches!(config.logging.format, LogFormat::Pretty),
                "pretty logging format should be set from env var",
            )?;
            Ok(())
        })();

        clear_vars(&["SPROUT_LOG_LEVEL", "SPROUT_LOG_FORMAT"]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("SPROUT_DATABASE_URL", "sqlite://from-env.db");
        env::set_var("SPROUT_AGENT_TOOL_TIMEOUT_MS", "1500");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("sprout.toml");
            fs::write(
                &path,
                r#"
[database]
url = "sqlite://from-file.db"

[agent]
tool_timeout_ms = 9000
max_rounds = 12

[logging]
level = "warn"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    database_url: Some("sqlite://from-override.db".to_string()),
                    log_level: Some("debug".to_string()),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.database.url == "sqlite://from-override.db",
                "override database url should win",
            )?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")?;
            ensure(config.agent.tool_timeout_ms == 1500, "env tool timeout should win over file")?;
            ensure(config.agent.max_rounds == 12, "file max rounds should win over defaults")?;
            Ok(())
        })();

        clear_vars(&["SPROUT_DATABASE_URL", "SPROUT_AGENT_TOOL_TIMEOUT_MS"]);
        result
    }

    #[test]
    fn validation_fails_fast_with_actionable_error() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("SPROUT_LLM_PROVIDER", "doubao");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => {
                    return Err("expected validation failure but config load succeeded".to_string())
                }
                Err(error) => error,
            };
            let has_message = matches!(
                error,
                ConfigError::Validation(ref message) if message.contains("llm.api_key")
            );
            ensure(has_message, "validation failure should mention llm.api_key")
        })();

        clear_vars(&["SPROUT_LLM_PROVIDER"]);
        result
    }

    #[test]
    fn invalid_numeric_env_override_is_rejected() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("SPROUT_AGENT_MAX_ROUNDS", "many");

        let result = match AppConfig::load(LoadOptions::default()) {
            Err(ConfigError::InvalidEnvOverride { key, .. }) => {
                ensure(key == "SPROUT_AGENT_MAX_ROUNDS", "error should name the env key")
            }
            _ => Err("expected invalid env override error".to_string()),
        };

        clear_vars(&["SPROUT_AGENT_MAX_ROUNDS"]);
        result
    }

    #[test]
    fn secret_values_are_not_leaked_by_debug() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("SPROUT_LLM_API_KEY", "sk-secret-value");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            let debug = format!("{config:?}");

            ensure(!debug.contains("sk-secret-value"), "debug output should not contain api key")?;
            ensure(
                matches!(config.logging.format, LogFormat::Compact),
                "default logging format should be compact",
            )?;
            Ok(())
        })();

        clear_vars(&["SPROUT_LLM_API_KEY"]);
        result
    }
}
