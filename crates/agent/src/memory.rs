use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use serde_json::{json, Value};
use sprout_core::config::MemoryConfig;
use sprout_core::domain::memory::{MemoryDimension, MemoryItem, MemoryStore};
use tracing::{debug, warn};

use crate::cache::TtlCache;

#[derive(Clone, Debug, PartialEq)]
pub struct RetrievalOptions {
    pub dimensions: Vec<MemoryDimension>,
    pub limit: usize,
    pub min_relevance: f64,
    pub use_cache: bool,
}

impl Default for RetrievalOptions {
    fn default() -> Self {
        Self {
            dimensions: MemoryDimension::ALL.to_vec(),
            limit: 20,
            min_relevance: 0.5,
            use_cache: true,
        }
    }
}

impl From<&MemoryConfig> for RetrievalOptions {
    fn from(config: &MemoryConfig) -> Self {
        Self { limit: config.limit, min_relevance: config.min_relevance, ..Self::default() }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MemoryContext {
    pub query: String,
    pub user_id: String,
    pub items: Vec<MemoryItem>,
    pub failed_dimensions: Vec<MemoryDimension>,
    pub cache_hit: bool,
    pub retrieved_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MemoryCoverage {
    pub per_dimension: BTreeMap<MemoryDimension, usize>,
    pub covered_dimensions: usize,
    pub total_dimensions: usize,
    pub coverage_ratio: f64,
    pub average_relevance: f64,
}

impl MemoryContext {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Plain text grouped by dimension, for inclusion in a system prompt.
    pub fn format_for_prompt(&self) -> String {
        if self.items.is_empty() {
            return String::new();
        }

        let mut sections = Vec::new();
        for dimension in MemoryDimension::ALL {
            let lines: Vec<String> = self
                .items
                .iter()
                .filter(|item| item.dimension == dimension)
                .map(|item| format!("- {} (relevance {:.2})", item.content, item.relevance))
                .collect();
            if !lines.is_empty() {
                sections.push(format!("[{}]\n{}", dimension.label(), lines.join("\n")));
            }
        }
        sections.join("\n\n")
    }

    pub fn as_list(&self) -> Vec<String> {
        self.items
            .iter()
            .map(|item| format!("[{}] {}", item.dimension.as_str(), item.content))
            .collect()
    }

    pub fn to_records(&self) -> Vec<Value> {
        self.items
            .iter()
            .map(|item| {
                json!({
                    "id": item.id,
                    "dimension": item.dimension.as_str(),
                    "content": item.content,
                    "relevance": item.relevance,
                    "timestamp": item.timestamp.to_rfc3339(),
                })
            })
            .collect()
    }

    pub fn coverage(&self) -> MemoryCoverage {
        coverage(&self.items)
    }
}

/// Fan-out result before the relevance floor and limit are applied.
#[derive(Clone, Debug)]
struct Fetched {
    items: Vec<MemoryItem>,
    failed_dimensions: Vec<MemoryDimension>,
}

/// User, query and the sorted set of dimensions consulted.
type FetchKey = (String, String, Vec<MemoryDimension>);

/// Read-only fan-out over the memory dimensions.
pub struct MemoryRetriever {
    store: Arc<dyn MemoryStore>,
    cache: TtlCache<FetchKey, Fetched>,
}

impl MemoryRetriever {
    pub fn new(store: Arc<dyn MemoryStore>, cache_ttl: Duration) -> Self {
        Self { store, cache: TtlCache::new(cache_ttl) }
    }

    /// Caches the raw fan-out per (user, query, dimensions); floor and limit
    /// are applied on every call, cached or not.
    pub async fn retrieve(
        &self,
        query: &str,
        user_id: &str,
        options: &RetrievalOptions,
    ) -> MemoryContext {
        let mut dimensions = options.dimensions.clone();
        dimensions.sort();
        dimensions.dedup();
        let key = (user_id.to_string(), query.to_string(), dimensions);

        let cached = if options.use_cache { self.cache.get(&key).await } else { None };
        let cache_hit = cached.is_some();
        let fetched = match cached {
            Some(fetched) => fetched,
            None => {
                let fetched = self.fetch(query, user_id, &key.2).await;
                if options.use_cache {
                    self.cache.insert(key, fetched.clone()).await;
                }
                fetched
            }
        };

        let mut items = filter_by_relevance(fetched.items, options.min_relevance);
        sort_by_relevance(&mut items);
        items.truncate(options.limit);

        debug!(
            event_name = "agent.memory.retrieved",
            items = items.len(),
            failed = fetched.failed_dimensions.len(),
            cache_hit,
            "memory retrieval complete"
        );

        MemoryContext {
            query: query.to_string(),
            user_id: user_id.to_string(),
            items,
            failed_dimensions: fetched.failed_dimensions,
            cache_hit,
            retrieved_at: Utc::now(),
        }
    }

    async fn fetch(&self, query: &str, user_id: &str, dimensions: &[MemoryDimension]) -> Fetched {
        let lookups = dimensions.iter().map(|dimension| async move {
            (*dimension, self.store.retrieve_by_dimension(*dimension, query, user_id).await)
        });

        let mut items = Vec::new();
        let mut failed_dimensions = Vec::new();
        for (dimension, outcome) in join_all(lookups).await {
            match outcome {
                Ok(found) => items.extend(found),
                Err(error) => {
                    warn!(
                        event_name = "agent.memory.dimension_failed",
                        dimension = dimension.as_str(),
                        error = %error,
                        "memory dimension lookup failed; treating as empty"
                    );
                    failed_dimensions.push(dimension);
                }
            }
        }
        Fetched { items, failed_dimensions }
    }

    pub async fn sweep_expired(&self) -> usize {
        self.cache.sweep_expired().await
    }
}

fn sort_by_relevance(items: &mut [MemoryItem]) {
    items.sort_by(|left, right| right.relevance.total_cmp(&left.relevance));
}

pub fn filter_by_dimension(items: Vec<MemoryItem>, dimensions: &[MemoryDimension]) -> Vec<MemoryItem> {
    items.into_iter().filter(|item| dimensions.contains(&item.dimension)).collect()
}

/// NaN relevance never passes the floor.
pub fn filter_by_relevance(items: Vec<MemoryItem>, min_relevance: f64) -> Vec<MemoryItem> {
    items.into_iter().filter(|item| item.relevance >= min_relevance).collect()
}

pub fn filter_by_age(
    items: Vec<MemoryItem>,
    max_age: chrono::Duration,
    now: DateTime<Utc>,
) -> Vec<MemoryItem> {
    items.into_iter().filter(|item| now - item.timestamp <= max_age).collect()
}

/// Union keyed by id; the first occurrence wins. Result is relevance-sorted.
pub fn merge_items(primary: Vec<MemoryItem>, secondary: Vec<MemoryItem>) -> Vec<MemoryItem> {
    let mut seen = HashSet::new();
    let mut merged: Vec<MemoryItem> =
        primary.into_iter().chain(secondary).filter(|item| seen.insert(item.id.clone())).collect();
    sort_by_relevance(&mut merged);
    merged
}

pub fn coverage(items: &[MemoryItem]) -> MemoryCoverage {
    let mut per_dimension: BTreeMap<MemoryDimension, usize> =
        MemoryDimension::ALL.iter().map(|dimension| (*dimension, 0)).collect();
    for item in items {
        *per_dimension.entry(item.dimension).or_default() += 1;
    }

    let covered_dimensions = per_dimension.values().filter(|count| **count > 0).count();
    let total_dimensions = MemoryDimension::ALL.len();
    let average_relevance = if items.is_empty() {
        0.0
    } else {
        items.iter().map(|item| item.relevance).sum::<f64>() / items.len() as f64
    };

    MemoryCoverage {
        per_dimension,
        covered_dimensions,
        total_dimensions,
        coverage_ratio: covered_dimensions as f64 / total_dimensions as f64,
        average_relevance,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;
    use sprout_core::domain::memory::{MemoryDimension, MemoryItem, MemoryStore};
    use sprout_core::errors::ApplicationError;

    use super::{
        filter_by_age, filter_by_dimension, merge_items, MemoryRetriever, RetrievalOptions,
    };

    fn item(id: &str, dimension: MemoryDimension, relevance: f64) -> MemoryItem {
        MemoryItem {
            id: id.to_string(),
            dimension,
            content: format!("memory {id}"),
            relevance,
            timestamp: Utc::now(),
            metadata: BTreeMap::new(),
        }
    }

    struct FixtureStore {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MemoryStore for FixtureStore {
        async fn retrieve_by_dimension(
            &self,
            dimension: MemoryDimension,
            _query: &str,
            _user_id: &str,
        ) -> Result<Vec<MemoryItem>, ApplicationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match dimension {
                MemoryDimension::Core => {
                    Ok(vec![item("core-1", dimension, 0.9), item("core-2", dimension, 0.3)])
                }
                MemoryDimension::Episodic => Ok(vec![item("ep-1", dimension, 0.7)]),
                MemoryDimension::Semantic => {
                    Err(ApplicationError::Persistence("vector index offline".to_string()))
                }
                MemoryDimension::Knowledge => Ok(vec![item("kn-1", dimension, 0.95)]),
                _ => Ok(Vec::new()),
            }
        }
    }

    fn retriever() -> (MemoryRetriever, Arc<FixtureStore>) {
        let store = Arc::new(FixtureStore { calls: AtomicUsize::new(0) });
        (MemoryRetriever::new(store.clone(), Duration::from_secs(60)), store)
    }

    #[tokio::test]
    async fn failed_dimension_is_empty_and_results_are_ranked() {
        let (retriever, _) = retriever();

        let context = retriever.retrieve("班级出勤", "teacher-7", &RetrievalOptions::default()).await;

        let ids: Vec<_> = context.items.iter().map(|item| item.id.as_str()).collect();
        assert_eq!(ids, vec!["kn-1", "core-1", "ep-1"], "below-floor item dropped, sorted desc");
        assert_eq!(context.failed_dimensions, vec![MemoryDimension::Semantic]);
        assert!(!context.cache_hit);
    }

    #[tokio::test]
    async fn limit_caps_after_sorting() {
        let (retriever, _) = retriever();
        let options = RetrievalOptions { limit: 2, min_relevance: 0.0, ..RetrievalOptions::default() };

        let context = retriever.retrieve("q", "u", &options).await;

        let ids: Vec<_> = context.items.iter().map(|item| item.id.as_str()).collect();
        assert_eq!(ids, vec!["kn-1", "core-1"]);
    }

    #[tokio::test]
    async fn repeated_retrieval_is_cached_per_user_and_query() {
        let (retriever, store) = retriever();
        let options = RetrievalOptions::default();

        retriever.retrieve("q", "u1", &options).await;
        let again = retriever.retrieve("q", "u1", &options).await;
        retriever.retrieve("q", "u2", &options).await;

        assert!(again.cache_hit);
        assert_eq!(store.calls.load(Ordering::SeqCst), 12, "two uncached fan-outs of six");
    }

    #[tokio::test]
    async fn narrow_retrieval_does_not_truncate_later_wide_ones() {
        let (retriever, store) = retriever();
        let narrow = RetrievalOptions { limit: 1, ..RetrievalOptions::default() };

        let first = retriever.retrieve("q", "u", &narrow).await;
        let wide = retriever.retrieve("q", "u", &RetrievalOptions::default()).await;
        let loose = RetrievalOptions { min_relevance: 0.0, ..RetrievalOptions::default() };
        let all = retriever.retrieve("q", "u", &loose).await;

        assert_eq!(first.items.len(), 1);
        assert!(wide.cache_hit);
        assert_eq!(wide.items.len(), 3);
        assert_eq!(all.items.len(), 4);
        assert_eq!(store.calls.load(Ordering::SeqCst), 6, "one fan-out serves every option set");
    }

    #[tokio::test]
    async fn dimension_subset_is_cached_separately() {
        let (retriever, store) = retriever();
        let core_only =
            RetrievalOptions { dimensions: vec![MemoryDimension::Core], ..RetrievalOptions::default() };

        let core = retriever.retrieve("q", "u", &core_only).await;
        let full = retriever.retrieve("q", "u", &RetrievalOptions::default()).await;

        assert_eq!(core.items.len(), 1);
        assert!(!full.cache_hit);
        assert_eq!(full.items.len(), 3);
        assert_eq!(store.calls.load(Ordering::SeqCst), 7);
    }

    #[tokio::test]
    async fn prompt_text_groups_items_by_dimension() {
        let (retriever, _) = retriever();

        let context = retriever.retrieve("q", "u", &RetrievalOptions::default()).await;
        let text = context.format_for_prompt();

        let core = text.find("[Core memory]").expect("core section");
        let knowledge = text.find("[Knowledge base]").expect("knowledge section");
        assert!(core < knowledge, "sections follow canonical dimension order");
        assert!(text.contains("- memory kn-1 (relevance 0.95)"));
        assert_eq!(context.to_records().len(), 3);
    }

    #[tokio::test]
    async fn flat_list_tags_each_item_with_its_dimension() {
        let (retriever, _) = retriever();

        let context = retriever.retrieve("q", "u", &RetrievalOptions::default()).await;

        assert_eq!(
            context.as_list(),
            vec!["[knowledge] memory kn-1", "[core] memory core-1", "[episodic] memory ep-1"]
        );
    }

    #[tokio::test]
    async fn coverage_counts_all_six_dimensions() {
        let (retriever, _) = retriever();

        let context = retriever.retrieve("q", "u", &RetrievalOptions::default()).await;
        let coverage = context.coverage();

        assert_eq!(coverage.total_dimensions, 6);
        assert_eq!(coverage.covered_dimensions, 3);
        assert_eq!(coverage.per_dimension.len(), 6);
        assert!((coverage.coverage_ratio - 0.5).abs() < 1e-9);
    }

    #[test]
    fn merge_deduplicates_by_id_keeping_first() {
        let merged = merge_items(
            vec![item("a", MemoryDimension::Core, 0.4)],
            vec![item("a", MemoryDimension::Core, 0.9), item("b", MemoryDimension::Resource, 0.6)],
        );

        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].id, "b");
        assert_eq!(merged[1].relevance, 0.4);
    }

    #[test]
    fn dimension_filter_keeps_only_requested_dimensions() {
        let items = vec![
            item("c", MemoryDimension::Core, 0.5),
            item("r", MemoryDimension::Resource, 0.5),
            item("k", MemoryDimension::Knowledge, 0.5),
        ];

        let kept = filter_by_dimension(items, &[MemoryDimension::Core, MemoryDimension::Knowledge]);

        let ids: Vec<_> = kept.iter().map(|item| item.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "k"]);
    }

    #[test]
    fn age_filter_drops_stale_items() {
        let now = Utc::now();
        let mut stale = item("old", MemoryDimension::Episodic, 0.8);
        stale.timestamp = now - chrono::Duration::days(40);
        let fresh = item("new", MemoryDimension::Episodic, 0.8);

        let kept = filter_by_age(vec![stale, fresh], chrono::Duration::days(30), now);

        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].id, "new");
    }
}
