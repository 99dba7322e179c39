use std::sync::Arc;
use std::time::Duration;

use sprout_agent::intent::{ClassifierConfig, IntentClassifier};
use sprout_agent::llm::{ModelClient, ModelError, OpenAiCompatibleClient};
use sprout_agent::memory::MemoryRetriever;
use sprout_agent::orchestrator::{CapabilityTable, OrchestratorError, ToolOrchestrator};
use sprout_agent::prompt_cache::{PromptCache, PromptCacheConfig};
use sprout_agent::session::{FileSessionStore, SessionManager};
use sprout_agent::tools::{ExecutorConfig, ToolExecutor};
use sprout_agent::{AgentRuntime, RuntimeConfig};
use sprout_core::config::{AppConfig, ConfigError, LoadOptions};
use sprout_db::{connect_with_settings, migrations, DbPool, SqlMemoryStore, SqlOrganizationStatsSource};
use thiserror::Error;
use tracing::info;

use crate::tools::builtin_registry;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub runtime: Arc<AgentRuntime>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("model client setup failed: {0}")]
    Model(#[from] ModelError),
    #[error(transparent)]
    ToolTable(#[from] OrchestratorError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let model: Arc<dyn ModelClient> = Arc::new(OpenAiCompatibleClient::from_config(&config.llm)?);
    let runtime = build_runtime(&config, db_pool.clone(), model)?;
    info!(
        event_name = "system.bootstrap.runtime_ready",
        correlation_id = "bootstrap",
        model = %config.llm.model,
        tools = runtime.orchestrator().registry().len(),
        session_persistence = config.sessions.persist,
        "agent runtime assembled"
    );

    Ok(Application { config, db_pool, runtime: Arc::new(runtime) })
}

/// Wires every runtime component from configuration. The capability table is
/// checked against the registry before anything is served.
pub fn build_runtime(
    config: &AppConfig,
    db_pool: DbPool,
    model: Arc<dyn ModelClient>,
) -> Result<AgentRuntime, BootstrapError> {
    let mut classifier = IntentClassifier::new(ClassifierConfig::from(&config.agent));
    if config.agent.model_intent_enabled {
        classifier = classifier.with_model(Arc::clone(&model));
    }

    let prompts = Arc::new(PromptCache::new(
        Arc::new(SqlOrganizationStatsSource::new(db_pool.clone())),
        PromptCacheConfig::from(&config.cache),
    ));

    let orchestrator = ToolOrchestrator::new(
        builtin_registry(db_pool.clone(), Arc::clone(&prompts)),
        CapabilityTable::default(),
        ToolExecutor::with_config(ExecutorConfig::from(&config.agent)),
    );
    orchestrator.validate_capability_table()?;

    let mut sessions = SessionManager::new(config.agent.max_rounds);
    if config.sessions.persist {
        sessions = sessions.with_store(Arc::new(FileSessionStore::new(&config.sessions.storage_dir)));
    }

    let mut runtime = AgentRuntime::new(
        classifier,
        orchestrator,
        prompts,
        Arc::new(sessions),
        model,
        RuntimeConfig::from(config),
    );
    if config.memory.enabled {
        runtime = runtime.with_memory(MemoryRetriever::new(
            Arc::new(SqlMemoryStore::new(db_pool)),
            Duration::from_secs(config.memory.cache_ttl_secs),
        ));
    }

    Ok(runtime)
}
