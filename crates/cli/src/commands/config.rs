use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use sprout_core::config::{AppConfig, LoadOptions};
use toml::Value;

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for field in effective_values(&config) {
        let source = field_source(
            field.key_path,
            field.env_keys,
            config_file_doc.as_ref(),
            config_file_path.as_deref(),
        );
        lines.push(render_line(field.key_path, &field.value, source));
    }

    lines.join("\n")
}

struct ConfigField {
    key_path: &'static str,
    value: String,
    env_keys: &'static [&'static str],
}

fn field(key_path: &'static str, value: String, env_keys: &'static [&'static str]) -> ConfigField {
    ConfigField { key_path, value, env_keys }
}

fn effective_values(config: &AppConfig) -> Vec<ConfigField> {
    let api_key = if config.llm.api_key.is_some() { "<redacted>" } else { "<unset>" };

    vec![
        field("database.url", config.database.url.clone(), &["SPROUT_DATABASE_URL"]),
        field(
            "database.max_connections",
            config.database.max_connections.to_string(),
            &["SPROUT_DATABASE_MAX_CONNECTIONS"],
        ),
        field("llm.provider", format!("{:?}", config.llm.provider), &["SPROUT_LLM_PROVIDER"]),
        field("llm.model", config.llm.model.clone(), &["SPROUT_LLM_MODEL"]),
        field("llm.base_url", config.llm.resolved_base_url(), &["SPROUT_LLM_BASE_URL"]),
        field("llm.api_key", api_key.to_string(), &["SPROUT_LLM_API_KEY"]),
        field(
            "server.bind_address",
            config.server.bind_address.clone(),
            &["SPROUT_SERVER_BIND_ADDRESS"],
        ),
        field("server.port", config.server.port.to_string(), &["SPROUT_SERVER_PORT"]),
        field(
            "agent.max_rounds",
            config.agent.max_rounds.to_string(),
            &["SPROUT_AGENT_MAX_ROUNDS"],
        ),
        field(
            "agent.tool_timeout_ms",
            config.agent.tool_timeout_ms.to_string(),
            &["SPROUT_AGENT_TOOL_TIMEOUT_MS"],
        ),
        field(
            "agent.model_intent_enabled",
            config.agent.model_intent_enabled.to_string(),
            &["SPROUT_AGENT_MODEL_INTENT_ENABLED"],
        ),
        field(
            "cache.prompt_ttl_secs",
            config.cache.prompt_ttl_secs.to_string(),
            &["SPROUT_CACHE_PROMPT_TTL_SECS"],
        ),
        field("memory.enabled", config.memory.enabled.to_string(), &["SPROUT_MEMORY_ENABLED"]),
        field(
            "stream.heartbeat_secs",
            config.stream.heartbeat_secs.to_string(),
            &["SPROUT_STREAM_HEARTBEAT_SECS"],
        ),
        field(
            "sessions.storage_dir",
            config.sessions.storage_dir.display().to_string(),
            &["SPROUT_SESSIONS_STORAGE_DIR"],
        ),
        field(
            "sessions.persist",
            config.sessions.persist.to_string(),
            &["SPROUT_SESSIONS_PERSIST"],
        ),
        field(
            "logging.level",
            config.logging.level.clone(),
            &["SPROUT_LOGGING_LEVEL", "SPROUT_LOG_LEVEL"],
        ),
        field(
            "logging.format",
            format!("{:?}", config.logging.format),
            &["SPROUT_LOGGING_FORMAT", "SPROUT_LOG_FORMAT"],
        ),
    ]
}

fn detect_config_path() -> Option<PathBuf> {
    [PathBuf::from("sprout.toml"), PathBuf::from("config/sprout.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_keys: &[&str],
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_keys.iter().find(|key| env::var_os(key).is_some()) {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}
