use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use sprout_core::config::AgentConfig;
use sprout_core::domain::chat::ChatMessage;
use sprout_core::domain::intent::{
    AnalysisSource, Capability, Complexity, IntentAnalysis, IntentType,
};
use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::TtlCache;
use crate::llm::{ModelClient, ModelRequest};

const MAX_KEYWORDS: usize = 10;

const GREETINGS: [&str; 16] = [
    "你好", "您好", "嗨", "哈喽", "早上好", "下午好", "晚上好", "谢谢", "再见", "hi", "hello",
    "hey", "thanks", "thank you", "bye", "good morning",
];

const INTENT_FAMILIES: [(IntentType, &[&str]); 7] = [
    (
        IntentType::Navigation,
        &["导航", "跳转", "打开", "去到", "访问", "进入", "页面", "navigate", "go to", "open"],
    ),
    (
        IntentType::Query,
        &[
            "查询", "查看", "查找", "搜索", "显示", "列出", "多少", "人数", "query", "search",
            "show", "list", "find", "how many",
        ],
    ),
    (
        IntentType::Creation,
        &["创建", "新建", "添加", "新增", "录入", "生成", "create", "add", "new", "generate"],
    ),
    (
        IntentType::Modification,
        &["修改", "编辑", "更新", "更改", "调整", "update", "edit", "modify", "change"],
    ),
    (IntentType::Deletion, &["删除", "移除", "清除", "delete", "remove"]),
    (
        IntentType::Analysis,
        &[
            "分析", "评估", "建议", "趋势", "对比", "报告", "analyze", "analysis", "compare",
            "trend", "report",
        ],
    ),
    (
        IntentType::Operation,
        &[
            "执行", "提交", "审批", "安排", "发送", "导出", "导入", "工作流", "run", "execute",
            "submit", "approve", "export",
        ],
    ),
];

const SECONDARY_CAPABILITIES: [(Capability, &[&str]); 6] = [
    (
        Capability::ChartGeneration,
        &[
            "图表", "柱状图", "折线图", "饼图", "趋势图", "统计图", "可视化", "chart", "graph",
            "plot",
        ],
    ),
    (
        Capability::FileOperation,
        &["文件", "文档", "导出", "下载", "上传", "excel", "pdf", "file", "document", "download"],
    ),
    (
        Capability::Calculation,
        &["计算", "平均", "总和", "合计", "百分比", "比例", "增长率", "calculate", "average", "sum"],
    ),
    (
        Capability::TextGeneration,
        &["撰写", "起草", "总结", "通知", "文案", "write", "draft", "summarize"],
    ),
    (Capability::WebSearch, &["网上", "网络搜索", "最新", "新闻", "政策", "web", "internet", "news"]),
    (Capability::UiRendering, &["表格", "列表", "卡片", "table", "card"]),
];

const MULTI_STEP_MARKERS: [&str; 11] =
    ["然后", "接着", "之后", "再", "并且", "同时", "并", "首先", "then", "after that", "first"];
const BATCH_MARKERS: [&str; 7] = ["批量", "所有", "全部", "每个", "batch", "all", "every"];
const CONDITIONAL_MARKERS: [&str; 7] = ["如果", "假如", "除非", "否则", "if", "unless", "otherwise"];

const STOPWORDS: [&str; 30] = [
    "the", "a", "an", "and", "or", "of", "to", "in", "is", "are", "for", "with", "please", "me",
    "my", "帮我", "请帮", "一下", "我们", "你们", "什么", "怎么", "可以", "一个", "这个", "那个",
    "的是", "是否", "我想", "需要",
];

#[derive(Clone, Debug)]
pub struct ClassifierConfig {
    pub model_enabled: bool,
    pub cache_ttl: Duration,
    /// Text with fewer characters than this is treated as small talk.
    pub greeting_threshold_chars: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self { model_enabled: false, cache_ttl: Duration::from_secs(300), greeting_threshold_chars: 3 }
    }
}

impl From<&AgentConfig> for ClassifierConfig {
    fn from(config: &AgentConfig) -> Self {
        Self {
            model_enabled: config.model_intent_enabled,
            cache_ttl: config.intent_cache_ttl(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Error)]
pub enum ClassificationError {
    #[error("model call failed: {0}")]
    Model(String),
    #[error("model returned no content")]
    EmptyReply,
    #[error("model reply does not match the analysis schema: {0}")]
    Schema(String),
}

/// Turns user text into an [`IntentAnalysis`]. Never fails: model problems
/// fall back to the keyword rules.
pub struct IntentClassifier {
    config: ClassifierConfig,
    model: Option<Arc<dyn ModelClient>>,
    cache: TtlCache<String, IntentAnalysis>,
}

impl IntentClassifier {
    pub fn new(config: ClassifierConfig) -> Self {
        let cache = TtlCache::new(config.cache_ttl);
        Self { config, model: None, cache }
    }

    pub fn with_model(mut self, model: Arc<dyn ModelClient>) -> Self {
        self.model = Some(model);
        self
    }

    pub async fn classify(&self, query: &str, context: Option<&Value>) -> IntentAnalysis {
        let key = cache_key(query, context);
        if let Some(mut cached) = self.cache.get(&key).await {
            cached.cache_hit = true;
            return cached;
        }

        let analysis = match self.model_analysis(query).await {
            Some(analysis) => analysis,
            None => self.classify_rules(query),
        };

        self.cache.insert(key, analysis.clone()).await;
        analysis
    }

    pub async fn sweep_expired(&self) -> usize {
        self.cache.sweep_expired().await
    }

    async fn model_analysis(&self, query: &str) -> Option<IntentAnalysis> {
        if !self.config.model_enabled {
            return None;
        }
        let model = self.model.as_ref()?;

        let request = ModelRequest {
            messages: vec![ChatMessage::system(CLASSIFIER_PROMPT), ChatMessage::user(query)],
            tools: Vec::new(),
            temperature: Some(0.0),
            json_mode: true,
        };

        let outcome = match model.chat(request).await {
            Ok(response) => match response.content {
                Some(content) => parse_model_analysis(&content),
                None => Err(ClassificationError::EmptyReply),
            },
            Err(error) => Err(ClassificationError::Model(error.to_string())),
        };

        match outcome {
            Ok(analysis) => Some(analysis),
            Err(error) => {
                warn!(
                    event_name = "agent.intent.model_fallback",
                    error = %error,
                    "model-assisted classification failed; using rules"
                );
                None
            }
        }
    }

    pub fn classify_rules(&self, query: &str) -> IntentAnalysis {
        let normalized = query.trim().to_lowercase();
        let words = latin_words(&normalized);

        let intent = detect_intent(&normalized, &words, self.config.greeting_threshold_chars);
        let complexity = score_complexity(intent, &normalized, &words);
        let required_capabilities = if intent == IntentType::Conversation {
            BTreeSet::new()
        } else {
            capabilities_for(intent, &normalized, &words)
        };
        let keywords = extract_keywords(&normalized);
        let entities = extract_entities(query);
        let confidence = rule_confidence(intent, keywords.len(), entities.len());

        debug!(
            event_name = "agent.intent.classified",
            intent = intent.as_str(),
            complexity = complexity.as_str(),
            capabilities = required_capabilities.len(),
            "rule-based classification complete"
        );

        IntentAnalysis {
            intent,
            complexity,
            required_capabilities,
            confidence,
            keywords,
            entities,
            cache_hit: false,
            source: AnalysisSource::Rules,
        }
    }
}

/// False only for simple small talk that needs no capability.
pub fn requires_tools(analysis: &IntentAnalysis) -> bool {
    if analysis.complexity == Complexity::Complex {
        return true;
    }
    let small_talk =
        analysis.intent == IntentType::Conversation && analysis.complexity == Complexity::Simple;
    !(small_talk && analysis.required_capabilities.is_empty())
}

fn cache_key(query: &str, context: Option<&Value>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(query.as_bytes());
    hasher.update([0x1f_u8]);
    if let Some(context) = context {
        hasher.update(context.to_string().as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

const CLASSIFIER_PROMPT: &str = "Classify the user's request for a kindergarten management assistant. \
Reply with one JSON object and nothing else, using exactly these fields: \
\"intent\" (navigation|query|operation|analysis|creation|modification|deletion|conversation|unknown), \
\"complexity\" (simple|moderate|complex), \"confidence\" (number 0..1), \
\"required_capabilities\" (array of database_query|data_analysis|chart_generation|file_operation|\
calculation|text_generation|web_search|ui_rendering|navigation|workflow), \
\"keywords\" (array of strings), \"entities\" (array of strings).";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ModelAnalysisPayload {
    intent: String,
    complexity: String,
    confidence: f64,
    required_capabilities: Vec<String>,
    keywords: Vec<String>,
    entities: Vec<String>,
}

/// Strict parse of a model classification reply. Code fences are stripped;
/// every field must be present and every enum value known.
pub fn parse_model_analysis(raw: &str) -> Result<IntentAnalysis, ClassificationError> {
    let trimmed = raw.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();

    let payload: ModelAnalysisPayload = serde_json::from_str(body)
        .map_err(|error| ClassificationError::Schema(error.to_string()))?;

    let intent = IntentType::parse(&payload.intent)
        .ok_or_else(|| ClassificationError::Schema(format!("unknown intent `{}`", payload.intent)))?;
    let complexity = Complexity::parse(&payload.complexity).ok_or_else(|| {
        ClassificationError::Schema(format!("unknown complexity `{}`", payload.complexity))
    })?;
    if !payload.confidence.is_finite() || !(0.0..=1.0).contains(&payload.confidence) {
        return Err(ClassificationError::Schema(format!(
            "confidence {} is outside 0..=1",
            payload.confidence
        )));
    }
    let required_capabilities = payload
        .required_capabilities
        .iter()
        .map(|raw| {
            Capability::parse(raw)
                .ok_or_else(|| ClassificationError::Schema(format!("unknown capability `{raw}`")))
        })
        .collect::<Result<BTreeSet<_>, _>>()?;

    Ok(IntentAnalysis {
        intent,
        complexity,
        required_capabilities,
        confidence: payload.confidence,
        keywords: payload.keywords,
        entities: payload.entities,
        cache_hit: false,
        source: AnalysisSource::Model,
    })
}

fn latin_words(normalized: &str) -> Vec<&str> {
    normalized
        .split(|character: char| !character.is_ascii_alphanumeric())
        .filter(|word| !word.is_empty())
        .collect()
}

/// CJK terms match as substrings; latin terms must match whole words.
fn mentions(normalized: &str, words: &[&str], term: &str) -> bool {
    if !term.is_ascii() {
        return normalized.contains(term);
    }
    let term_words: Vec<&str> = term.split_whitespace().collect();
    !term_words.is_empty() && words.windows(term_words.len()).any(|window| window == term_words)
}

fn mentions_any(normalized: &str, words: &[&str], terms: &[&str]) -> bool {
    terms.iter().any(|term| mentions(normalized, words, term))
}

fn detect_intent(normalized: &str, words: &[&str], greeting_threshold: usize) -> IntentType {
    let stripped: String = normalized
        .chars()
        .filter(|character| character.is_alphanumeric() || character.is_whitespace())
        .collect();
    let stripped = stripped.trim();

    if GREETINGS.contains(&stripped) || stripped.chars().count() < greeting_threshold {
        return IntentType::Conversation;
    }

    INTENT_FAMILIES
        .iter()
        .find(|(_, terms)| mentions_any(normalized, words, terms))
        .map(|(intent, _)| *intent)
        .unwrap_or(IntentType::Unknown)
}

fn score_complexity(intent: IntentType, normalized: &str, words: &[&str]) -> Complexity {
    let length = normalized.chars().count();
    let mut score = intent.base_weight();
    if length > 50 {
        score += 1;
    }
    if length > 100 {
        score += 1;
    }
    if mentions_any(normalized, words, &MULTI_STEP_MARKERS) {
        score += 2;
    }
    if mentions_any(normalized, words, &BATCH_MARKERS) {
        score += 1;
    }
    if mentions_any(normalized, words, &CONDITIONAL_MARKERS) {
        score += 1;
    }

    match score {
        0..=2 => Complexity::Simple,
        3..=4 => Complexity::Moderate,
        _ => Complexity::Complex,
    }
}

fn capabilities_for(intent: IntentType, normalized: &str, words: &[&str]) -> BTreeSet<Capability> {
    let mut capabilities: BTreeSet<Capability> = match intent {
        IntentType::Navigation => [Capability::Navigation].into(),
        IntentType::Query | IntentType::Modification | IntentType::Deletion => {
            [Capability::DatabaseQuery].into()
        }
        IntentType::Analysis => [Capability::DatabaseQuery, Capability::DataAnalysis].into(),
        IntentType::Creation | IntentType::Operation => [Capability::Workflow].into(),
        IntentType::Conversation | IntentType::Unknown => BTreeSet::new(),
    };

    for (capability, terms) in SECONDARY_CAPABILITIES {
        if mentions_any(normalized, words, terms) {
            capabilities.insert(capability);
        }
    }
    capabilities
}

/// CJK bigrams plus latin words, ranked by frequency then first appearance.
fn extract_keywords(normalized: &str) -> Vec<String> {
    let mut tokens: Vec<String> = Vec::new();
    let mut cjk_run: Vec<char> = Vec::new();
    let mut latin = String::new();

    let flush_cjk = |run: &mut Vec<char>, tokens: &mut Vec<String>| {
        if run.len() >= 2 {
            tokens.extend(run.windows(2).map(|pair| pair.iter().collect::<String>()));
        }
        run.clear();
    };
    let flush_latin = |word: &mut String, tokens: &mut Vec<String>| {
        if word.chars().count() >= 2 {
            tokens.push(std::mem::take(word));
        }
        word.clear();
    };

    for character in normalized.chars() {
        if is_cjk(character) {
            flush_latin(&mut latin, &mut tokens);
            cjk_run.push(character);
        } else if character.is_ascii_alphanumeric() {
            flush_cjk(&mut cjk_run, &mut tokens);
            latin.push(character);
        } else {
            flush_cjk(&mut cjk_run, &mut tokens);
            flush_latin(&mut latin, &mut tokens);
        }
    }
    flush_cjk(&mut cjk_run, &mut tokens);
    flush_latin(&mut latin, &mut tokens);

    let mut ranked: HashMap<String, (usize, usize)> = HashMap::new();
    for (index, token) in tokens.into_iter().enumerate() {
        if STOPWORDS.contains(&token.as_str()) || token.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        ranked.entry(token).or_insert((0, index)).0 += 1;
    }

    let mut ranked: Vec<(String, (usize, usize))> = ranked.into_iter().collect();
    ranked.sort_by(|(_, (left_count, left_first)), (_, (right_count, right_first))| {
        right_count.cmp(left_count).then(left_first.cmp(right_first))
    });
    ranked.into_iter().take(MAX_KEYWORDS).map(|(token, _)| token).collect()
}

fn is_cjk(character: char) -> bool {
    matches!(character, '\u{4e00}'..='\u{9fff}' | '\u{3400}'..='\u{4dbf}')
}

fn entity_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"\d{4}[-/年]\d{1,2}(?:[-/月]\d{1,2}日?)?",
            r"\d{1,2}月\d{1,2}[日号]",
            r"\d+(?:\.\d+)?",
        ]
        .iter()
        .filter_map(|pattern| Regex::new(pattern).ok())
        .collect()
    })
}

/// Dates first, then free-standing numbers that are not part of a date.
fn extract_entities(query: &str) -> Vec<String> {
    let mut taken: Vec<(usize, usize)> = Vec::new();
    let mut entities = Vec::new();

    for pattern in entity_patterns() {
        for found in pattern.find_iter(query) {
            let overlaps =
                taken.iter().any(|(start, end)| found.start() < *end && *start < found.end());
            if overlaps {
                continue;
            }
            taken.push((found.start(), found.end()));
            entities.push(found.as_str().to_string());
        }
    }
    entities
}

fn rule_confidence(intent: IntentType, keyword_count: usize, entity_count: usize) -> f64 {
    let mut confidence = 0.5;
    if intent != IntentType::Unknown {
        confidence += 0.2;
    }
    confidence += (0.02 * keyword_count as f64).min(0.2);
    confidence += (0.05 * entity_count as f64).min(0.1);
    confidence.min(1.0)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::json;
    use sprout_core::domain::intent::{AnalysisSource, Capability, Complexity, IntentType};

    use super::{
        extract_entities, extract_keywords, parse_model_analysis, requires_tools,
        ClassifierConfig, IntentClassifier,
    };
    use crate::llm::{ModelClient, ModelError, ModelRequest, ModelResponse};

    struct CannedModel {
        reply: Option<String>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ModelClient for CannedModel {
        fn model_name(&self) -> &str {
            "canned"
        }

        async fn chat(&self, _request: ModelRequest) -> Result<ModelResponse, ModelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.reply {
                Some(reply) => Ok(ModelResponse { content: Some(reply.clone()), ..Default::default() }),
                None => Err(ModelError::Transport("connection refused".to_string())),
            }
        }
    }

    fn classifier() -> IntentClassifier {
        IntentClassifier::new(ClassifierConfig::default())
    }

    #[tokio::test]
    async fn greeting_is_simple_conversation_without_capabilities() {
        let analysis = classifier().classify("你好", None).await;

        assert_eq!(analysis.intent, IntentType::Conversation);
        assert_eq!(analysis.complexity, Complexity::Simple);
        assert!(analysis.required_capabilities.is_empty());
        assert!(!requires_tools(&analysis));
    }

    #[tokio::test]
    async fn student_count_chart_request_needs_query_and_chart() {
        let analysis = classifier().classify("查询所有学生人数并生成图表", None).await;

        assert!(matches!(analysis.intent, IntentType::Query | IntentType::Analysis));
        assert!(analysis.requires(Capability::DatabaseQuery));
        assert!(analysis.requires(Capability::ChartGeneration));
        assert!(analysis.complexity >= Complexity::Moderate);
        assert!(requires_tools(&analysis));
        assert_eq!(analysis.source, AnalysisSource::Rules);
    }

    #[tokio::test]
    async fn repeated_classification_is_served_from_cache() {
        let classifier = classifier();
        let context = json!({ "page": "/students" });

        let first = classifier.classify("统计本月新增学生", Some(&context)).await;
        let second = classifier.classify("统计本月新增学生", Some(&context)).await;
        let other_context = classifier.classify("统计本月新增学生", None).await;

        assert!(!first.cache_hit);
        assert!(second.cache_hit);
        assert!(!other_context.cache_hit, "context is part of the cache key");
        assert_eq!(first.intent, second.intent);
        assert_eq!(first.complexity, second.complexity);
        assert_eq!(first.required_capabilities, second.required_capabilities);
        assert_eq!(first.keywords, second.keywords);
        assert_eq!(first.entities, second.entities);
        assert_eq!(first.confidence, second.confidence);
    }

    #[test]
    fn navigation_wins_over_later_families() {
        let analysis = classifier().classify_rules("打开学生列表页面");

        assert_eq!(analysis.intent, IntentType::Navigation);
        assert!(analysis.requires(Capability::Navigation));
    }

    #[test]
    fn latin_terms_match_whole_words_only() {
        let analysis = classifier().classify_rules("allow tall shows");
        assert_eq!(analysis.intent, IntentType::Unknown);
        assert_eq!(analysis.complexity, Complexity::Simple);

        let analysis = classifier().classify_rules("show me every class");
        assert_eq!(analysis.intent, IntentType::Query);
        assert_eq!(analysis.complexity, Complexity::Moderate);
    }

    #[test]
    fn multi_step_conditional_analysis_is_complex() {
        let analysis =
            classifier().classify_rules("分析各班出勤趋势，然后如果低于90%就通知老师");

        assert_eq!(analysis.intent, IntentType::Analysis);
        assert_eq!(analysis.complexity, Complexity::Complex);
        assert!(requires_tools(&analysis));
    }

    #[test]
    fn entities_capture_dates_before_numbers() {
        let entities = extract_entities("2024-09-01 之后入园的 35 名学生，3月5日前完成");

        assert_eq!(entities, vec!["2024-09-01", "3月5日", "35"]);
    }

    #[test]
    fn keywords_rank_by_frequency_then_first_seen() {
        let keywords = extract_keywords("学生 学生 class report class");

        assert_eq!(keywords, vec!["学生", "class", "report"]);
    }

    #[test]
    fn confidence_follows_weighted_formula() {
        let analysis = classifier().classify_rules("xyz qq");
        // unknown intent, two keywords, no entities
        assert_eq!(analysis.intent, IntentType::Unknown);
        assert!((analysis.confidence - 0.54).abs() < 1e-9);
    }

    #[test]
    fn strict_parse_rejects_out_of_range_confidence_and_unknown_fields() {
        let valid = r#"```json
{"intent":"analysis","complexity":"moderate","confidence":0.8,
 "required_capabilities":["database_query","data_analysis"],"keywords":["出勤"],"entities":[]}
```"#;
        let analysis = parse_model_analysis(valid).expect("valid payload parses");
        assert_eq!(analysis.source, AnalysisSource::Model);
        assert!(analysis.requires(Capability::DataAnalysis));

        let out_of_range = r#"{"intent":"query","complexity":"simple","confidence":1.4,
            "required_capabilities":[],"keywords":[],"entities":[]}"#;
        assert!(parse_model_analysis(out_of_range).is_err());

        let missing_field = r#"{"intent":"query","complexity":"simple","confidence":0.4,
            "required_capabilities":[],"keywords":[]}"#;
        assert!(parse_model_analysis(missing_field).is_err());

        let unknown_capability = r#"{"intent":"query","complexity":"simple","confidence":0.4,
            "required_capabilities":["teleport"],"keywords":[],"entities":[]}"#;
        assert!(parse_model_analysis(unknown_capability).is_err());
    }

    #[tokio::test]
    async fn model_path_is_used_when_enabled_and_valid() {
        let model = Arc::new(CannedModel {
            reply: Some(
                r#"{"intent":"deletion","complexity":"simple","confidence":0.9,
                "required_capabilities":["database_query"],"keywords":["删除"],"entities":[]}"#
                    .to_string(),
            ),
            calls: AtomicUsize::new(0),
        });
        let classifier =
            IntentClassifier::new(ClassifierConfig { model_enabled: true, ..Default::default() })
                .with_model(model.clone());

        let analysis = classifier.classify("把这条记录去掉", None).await;

        assert_eq!(analysis.intent, IntentType::Deletion);
        assert_eq!(analysis.source, AnalysisSource::Model);
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn model_failure_falls_back_to_rules() {
        let model = Arc::new(CannedModel { reply: None, calls: AtomicUsize::new(0) });
        let classifier =
            IntentClassifier::new(ClassifierConfig { model_enabled: true, ..Default::default() })
                .with_model(model);

        let analysis = classifier.classify("查询所有学生人数并生成图表", None).await;

        assert_eq!(analysis.source, AnalysisSource::Rules);
        assert!(analysis.requires(Capability::DatabaseQuery));
    }

    #[tokio::test]
    async fn schema_violation_falls_back_to_rules() {
        let model = Arc::new(CannedModel {
            reply: Some("sure, that's a query".to_string()),
            calls: AtomicUsize::new(0),
        });
        let classifier =
            IntentClassifier::new(ClassifierConfig { model_enabled: true, ..Default::default() })
                .with_model(model);

        let analysis = classifier.classify("你好", None).await;

        assert_eq!(analysis.source, AnalysisSource::Rules);
        assert_eq!(analysis.intent, IntentType::Conversation);
    }
}
