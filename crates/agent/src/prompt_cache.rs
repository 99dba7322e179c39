use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use sha2::{Digest, Sha256};
use sprout_core::config::CacheConfig;
use sprout_core::domain::organization::{DataCategory, OrganizationStats, OrganizationStatsSource};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::TtlCache;
use crate::orchestrator::CapabilityTable;
use crate::tools::ToolRegistry;

const DECISION_TREE_KEY: &str = "decision_tree";

/// The subset of request context that changes a rendered prompt.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PromptContext {
    pub tenant_id: String,
    pub page_path: Option<String>,
    pub mode_flags: BTreeSet<String>,
    pub selected_tools: Vec<String>,
}

impl PromptContext {
    pub fn fingerprint(&self) -> String {
        let canonical = serde_json::to_string(self).unwrap_or_default();
        format!("{:x}", Sha256::digest(canonical.as_bytes()))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PromptKey {
    pub role: String,
    pub tenant_id: String,
    pub fingerprint: String,
}

#[derive(Clone, Debug)]
pub struct PromptCacheConfig {
    pub prompt_ttl: Duration,
    pub org_stats_ttl: Duration,
    pub decision_tree_ttl: Duration,
}

impl Default for PromptCacheConfig {
    fn default() -> Self {
        Self {
            prompt_ttl: Duration::from_secs(300),
            org_stats_ttl: Duration::from_secs(600),
            decision_tree_ttl: Duration::from_secs(1_800),
        }
    }
}

impl From<&CacheConfig> for PromptCacheConfig {
    fn from(config: &CacheConfig) -> Self {
        Self {
            prompt_ttl: config.prompt_ttl(),
            org_stats_ttl: config.org_stats_ttl(),
            decision_tree_ttl: config.decision_tree_ttl(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct InvalidationReport {
    pub category: Option<DataCategory>,
    pub tenant_id: String,
    pub stats_removed: usize,
    pub prompts_removed: usize,
    pub decision_tree_flushed: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub prompts: usize,
    pub org_stats: usize,
    pub decision_tree: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.prompts + self.org_stats + self.decision_tree
    }
}

pub struct PromptCache {
    stats_source: Arc<dyn OrganizationStatsSource>,
    prompts: TtlCache<PromptKey, String>,
    org_stats: TtlCache<String, OrganizationStats>,
    decision_tree: TtlCache<String, String>,
    /// Bumped by every invalidation; renders started under an older value are not cached.
    generations: Mutex<HashMap<String, u64>>,
}

impl PromptCache {
    pub fn new(stats_source: Arc<dyn OrganizationStatsSource>, config: PromptCacheConfig) -> Self {
        Self {
            stats_source,
            prompts: TtlCache::new(config.prompt_ttl),
            org_stats: TtlCache::new(config.org_stats_ttl),
            decision_tree: TtlCache::new(config.decision_tree_ttl),
            generations: Mutex::new(HashMap::new()),
        }
    }

    async fn generation(&self, tenant_id: &str) -> u64 {
        self.generations.lock().await.get(tenant_id).copied().unwrap_or_default()
    }

    /// Cached per tenant. A failing source yields empty statistics, which are
    /// not cached.
    pub async fn organization_stats(&self, tenant_id: &str) -> OrganizationStats {
        let key = tenant_id.to_string();
        if let Some(stats) = self.org_stats.get(&key).await {
            return stats;
        }

        let generation = self.generation(tenant_id).await;
        match self.stats_source.load_stats(tenant_id).await {
            Ok(stats) => {
                let generations = self.generations.lock().await;
                if generations.get(tenant_id).copied().unwrap_or_default() == generation {
                    self.org_stats.insert(key, stats.clone()).await;
                } else {
                    debug!(
                        event_name = "agent.prompt.stale_stats_dropped",
                        tenant_id,
                        "statistics loaded across an invalidation; not cached"
                    );
                }
                stats
            }
            Err(error) => {
                warn!(
                    event_name = "agent.prompt.org_stats_failed",
                    tenant_id,
                    error = %error,
                    "organization statistics unavailable; rendering without them"
                );
                OrganizationStats::empty(tenant_id)
            }
        }
    }

    pub async fn decision_tree(&self, table: &CapabilityTable, registry: &ToolRegistry) -> String {
        self.decision_tree
            .get_or_insert_with(DECISION_TREE_KEY.to_string(), || {
                render_decision_tree(table, registry)
            })
            .await
    }

    pub async fn system_prompt(
        &self,
        role: &str,
        context: &PromptContext,
        table: &CapabilityTable,
        registry: &ToolRegistry,
    ) -> String {
        let key = PromptKey {
            role: role.to_string(),
            tenant_id: context.tenant_id.clone(),
            fingerprint: context.fingerprint(),
        };
        if let Some(prompt) = self.prompts.get(&key).await {
            debug!(event_name = "agent.prompt.cache_hit", role, "system prompt served from cache");
            return prompt;
        }

        let generation = self.generation(&context.tenant_id).await;
        let stats = self.organization_stats(&context.tenant_id).await;
        let tree = self.decision_tree(table, registry).await;
        let prompt = render_system_prompt(role, &stats, &tree, context);

        let generations = self.generations.lock().await;
        if generations.get(&context.tenant_id).copied().unwrap_or_default() == generation {
            self.prompts.insert(key, prompt.clone()).await;
        } else {
            debug!(
                event_name = "agent.prompt.stale_prompt_dropped",
                role,
                "prompt rendered across an invalidation; not cached"
            );
        }
        prompt
    }

    /// Drops everything derived from the tenant's data. Changes to core
    /// entities also flush the decision tree.
    pub async fn invalidate(&self, category: DataCategory, tenant_id: &str) -> InvalidationReport {
        *self.generations.lock().await.entry(tenant_id.to_string()).or_default() += 1;
        let stats_removed = usize::from(self.org_stats.remove(&tenant_id.to_string()).await.is_some());
        let prompts_removed = self.prompts.invalidate_matching(|key| key.tenant_id == tenant_id).await;
        let decision_tree_flushed = if category.affects_decision_tree() {
            self.decision_tree.clear().await > 0
        } else {
            false
        };

        info!(
            event_name = "agent.prompt.invalidated",
            category = category.as_str(),
            tenant_id,
            stats_removed,
            prompts_removed,
            decision_tree_flushed,
            "prompt caches invalidated"
        );

        InvalidationReport {
            category: Some(category),
            tenant_id: tenant_id.to_string(),
            stats_removed,
            prompts_removed,
            decision_tree_flushed,
        }
    }

    pub async fn sweep_expired(&self) -> SweepReport {
        SweepReport {
            prompts: self.prompts.sweep_expired().await,
            org_stats: self.org_stats.sweep_expired().await,
            decision_tree: self.decision_tree.sweep_expired().await,
        }
    }

    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = self.sweep_expired().await;
                        if report.total() > 0 {
                            debug!(
                                event_name = "agent.prompt.swept",
                                removed = report.total(),
                                "expired prompt cache entries removed"
                            );
                        }
                    }
                }
            }
        })
    }
}

pub fn format_organization_status(stats: &OrganizationStats) -> String {
    format!(
        "Organization status (as of {}):\n\
         - Students: {}\n\
         - Teachers: {}\n\
         - Classes: {}\n\
         - Pending enrollment applications: {}\n\
         - Active activities: {}",
        stats.refreshed_at.format("%Y-%m-%d %H:%M UTC"),
        stats.student_count,
        stats.teacher_count,
        stats.class_count,
        stats.pending_enrollments,
        stats.active_activities,
    )
}

pub fn render_decision_tree(table: &CapabilityTable, registry: &ToolRegistry) -> String {
    let mut lines = vec!["Tool selection guide:".to_string()];
    for route in table.routes() {
        let tools: Vec<String> = route
            .tools
            .iter()
            .filter_map(|name| registry.spec(name))
            .map(|spec| format!("{} ({})", spec.name, spec.description))
            .collect();
        if tools.is_empty() {
            continue;
        }
        lines.push(format!("- {} -> {}", route.capability.as_str(), tools.join(", ")));
    }
    lines.push("- text_generation -> answer directly without tools".to_string());
    lines.join("\n")
}

pub fn render_system_prompt(
    role: &str,
    stats: &OrganizationStats,
    decision_tree: &str,
    context: &PromptContext,
) -> String {
    let mut sections = vec![format!(
        "You are the Sprout kindergarten management assistant, speaking with a user whose role is `{role}`. \
         Use tools for any factual data and never invent numbers."
    )];
    sections.push(format_organization_status(stats));
    sections.push(decision_tree.to_string());
    if let Some(page_path) = &context.page_path {
        sections.push(format!("The user is currently on page `{page_path}`."));
    }
    if !context.mode_flags.is_empty() {
        let flags: Vec<&str> = context.mode_flags.iter().map(String::as_str).collect();
        sections.push(format!("Active modes: {}.", flags.join(", ")));
    }
    if !context.selected_tools.is_empty() {
        sections.push(format!("Prefer these tools: {}.", context.selected_tools.join(", ")));
    }
    sections.join("\n\n")
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{json, Value};
    use sprout_core::domain::organization::{
        DataCategory, OrganizationStats, OrganizationStatsSource,
    };
    use sprout_core::domain::tool::ToolSpec;
    use sprout_core::errors::ApplicationError;
    use tokio::sync::Notify;

    use super::{PromptCache, PromptCacheConfig, PromptContext};
    use crate::orchestrator::CapabilityTable;
    use crate::tools::{Tool, ToolError, ToolRegistry};

    struct CountingSource {
        loads: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl OrganizationStatsSource for CountingSource {
        async fn load_stats(&self, tenant_id: &str) -> Result<OrganizationStats, ApplicationError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ApplicationError::Persistence("db down".to_string()));
            }
            let mut stats = OrganizationStats::empty(tenant_id);
            stats.student_count = 120;
            stats.class_count = 6;
            Ok(stats)
        }
    }

    #[derive(Default)]
    struct GatedSource {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl OrganizationStatsSource for GatedSource {
        async fn load_stats(&self, tenant_id: &str) -> Result<OrganizationStats, ApplicationError> {
            self.entered.notify_one();
            self.release.notified().await;
            let mut stats = OrganizationStats::empty(tenant_id);
            stats.student_count = 80;
            Ok(stats)
        }
    }

    struct NamedTool(&'static str);

    #[async_trait]
    impl Tool for NamedTool {
        fn spec(&self) -> ToolSpec {
            ToolSpec::new(self.0, "fixture")
        }

        async fn execute(&self, _input: Value) -> Result<Value, ToolError> {
            Ok(json!({}))
        }
    }

    fn cache(fail: bool) -> (PromptCache, Arc<CountingSource>) {
        let source = Arc::new(CountingSource { loads: AtomicUsize::new(0), fail });
        (PromptCache::new(source.clone(), PromptCacheConfig::default()), source)
    }

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(NamedTool("any_query")));
        registry.register(Arc::new(NamedTool("render_chart")));
        registry
    }

    fn context(tenant: &str) -> PromptContext {
        PromptContext { tenant_id: tenant.to_string(), ..PromptContext::default() }
    }

    #[tokio::test]
    async fn prompt_embeds_stats_and_decision_tree() {
        let (cache, _) = cache(false);
        let table = CapabilityTable::default();

        let prompt = cache.system_prompt("principal", &context("k1"), &table, &registry()).await;

        assert!(prompt.contains("`principal`"));
        assert!(prompt.contains("Students: 120"));
        assert!(prompt.contains("database_query -> any_query (fixture)"));
        assert!(!prompt.contains("web_search"), "unregistered tools are not advertised");
    }

    #[tokio::test]
    async fn prompt_is_cached_per_role_and_context() {
        let (cache, source) = cache(false);
        let table = CapabilityTable::default();
        let registry = registry();

        cache.system_prompt("principal", &context("k1"), &table, &registry).await;
        cache.system_prompt("principal", &context("k1"), &table, &registry).await;
        let mut on_page = context("k1");
        on_page.page_path = Some("/students".to_string());
        let page_prompt = cache.system_prompt("principal", &on_page, &table, &registry).await;

        assert_eq!(source.loads.load(Ordering::SeqCst), 1, "stats cached across prompts");
        assert!(page_prompt.contains("/students"));
    }

    #[tokio::test]
    async fn invalidation_removes_tenant_entries_only() {
        let (cache, source) = cache(false);
        let table = CapabilityTable::default();
        let registry = registry();
        cache.system_prompt("principal", &context("k1"), &table, &registry).await;
        cache.system_prompt("teacher", &context("k1"), &table, &registry).await;
        cache.system_prompt("principal", &context("k2"), &table, &registry).await;

        let report = cache.invalidate(DataCategory::Enrollment, "k1").await;

        assert_eq!(report.stats_removed, 1);
        assert_eq!(report.prompts_removed, 2);
        assert!(!report.decision_tree_flushed);

        let report = cache.invalidate(DataCategory::Student, "k2").await;
        assert!(report.decision_tree_flushed);

        cache.system_prompt("principal", &context("k1"), &table, &registry).await;
        assert_eq!(source.loads.load(Ordering::SeqCst), 3, "k1 stats reloaded after invalidation");
    }

    #[tokio::test]
    async fn render_spanning_an_invalidation_is_not_cached() {
        let source = Arc::new(GatedSource::default());
        let cache = Arc::new(PromptCache::new(source.clone(), PromptCacheConfig::default()));

        let render = tokio::spawn({
            let cache = Arc::clone(&cache);
            async move {
                cache
                    .system_prompt("principal", &context("k1"), &CapabilityTable::default(), &registry())
                    .await
            }
        });
        source.entered.notified().await;
        cache.invalidate(DataCategory::Enrollment, "k1").await;
        source.release.notify_one();

        let prompt = render.await.expect("render task");
        assert!(prompt.contains("Students: 80"));

        let report = cache.invalidate(DataCategory::Enrollment, "k1").await;
        assert_eq!(report.stats_removed, 0, "stale stats were not cached");
        assert_eq!(report.prompts_removed, 0, "stale prompt was not cached");
    }

    #[tokio::test]
    async fn failing_stats_source_renders_empty_stats_without_caching() {
        let (cache, source) = cache(true);

        let first = cache.organization_stats("k1").await;
        cache.organization_stats("k1").await;

        assert_eq!(first.student_count, 0);
        assert_eq!(source.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_removes_expired_entries() {
        let source = Arc::new(CountingSource { loads: AtomicUsize::new(0), fail: false });
        let cache = PromptCache::new(
            source,
            PromptCacheConfig {
                prompt_ttl: Duration::from_secs(5),
                org_stats_ttl: Duration::from_secs(600),
                decision_tree_ttl: Duration::from_secs(5),
            },
        );
        cache.system_prompt("principal", &context("k1"), &CapabilityTable::default(), &registry()).await;

        tokio::time::advance(Duration::from_secs(6)).await;
        let report = cache.sweep_expired().await;

        assert_eq!(report.prompts, 1);
        assert_eq!(report.decision_tree, 1);
        assert_eq!(report.org_stats, 0);
    }

    #[test]
    fn fingerprint_changes_with_mode_flags() {
        let base = context("k1");
        let mut flagged = context("k1");
        flagged.mode_flags.insert("expert".to_string());

        assert_eq!(base.fingerprint(), context("k1").fingerprint());
        assert_ne!(base.fingerprint(), flagged.fingerprint());
    }
}
