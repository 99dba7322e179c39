//! Tools registered by the server, one per capability route.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Map, Value};
use sprout_agent::prompt_cache::PromptCache;
use sprout_agent::tools::{Tool, ToolError, ToolRegistry};
use sprout_core::domain::organization::DataCategory;
use sprout_core::domain::tool::ToolSpec;
use sprout_db::DbPool;
use sqlx::Row;

const DEFAULT_ROW_LIMIT: i64 = 20;

/// Write tools flush the tenant's cached prompts through `prompts`.
pub fn builtin_registry(pool: DbPool, prompts: Arc<PromptCache>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    let tools: Vec<Arc<dyn Tool>> = vec![
        Arc::new(AnyQueryTool { pool: pool.clone() }),
        Arc::new(WebSearchTool),
        Arc::new(AnalyzeDataTool),
        Arc::new(CalculateTool),
        Arc::new(RenderChartTool),
        Arc::new(RenderComponentTool),
        Arc::new(GenerateDocumentTool),
        Arc::new(NavigateTool),
        Arc::new(ActivityWorkflowTool { pool, prompts }),
    ];
    for tool in tools {
        registry.register(tool);
    }
    registry
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Entity {
    Student,
    Teacher,
    Class,
    Enrollment,
    Activity,
}

impl Entity {
    const TERMS: [(Entity, &'static [&'static str]); 5] = [
        (Entity::Enrollment, &["招生", "报名", "enrollment", "application"]),
        (Entity::Teacher, &["老师", "教师", "teacher"]),
        (Entity::Activity, &["活动", "activity", "event"]),
        (Entity::Class, &["班级", "class"]),
        (Entity::Student, &["学生", "幼儿", "student", "child"]),
    ];

    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "student" | "students" => Some(Self::Student),
            "teacher" | "teachers" => Some(Self::Teacher),
            "class" | "classes" => Some(Self::Class),
            "enrollment" | "enrollment_application" => Some(Self::Enrollment),
            "activity" | "activities" => Some(Self::Activity),
            _ => None,
        }
    }

    fn infer(query: &str) -> Self {
        let lowered = query.to_lowercase();
        Self::TERMS
            .iter()
            .find(|(_, terms)| terms.iter().any(|term| lowered.contains(term)))
            .map(|(entity, _)| *entity)
            .unwrap_or(Self::Student)
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Student => "student",
            Self::Teacher => "teacher",
            Self::Class => "class",
            Self::Enrollment => "enrollment_application",
            Self::Activity => "activity",
        }
    }

    fn label_column(&self) -> &'static str {
        match self {
            Self::Enrollment => "child_name",
            Self::Activity => "title",
            _ => "name",
        }
    }

    fn status_column(&self) -> &'static str {
        match self {
            Self::Class => "NULL",
            _ => "status",
        }
    }
}

fn tenant_of(input: &Value) -> Result<&str, ToolError> {
    input
        .get("tenantId")
        .and_then(Value::as_str)
        .filter(|tenant| !tenant.is_empty())
        .ok_or_else(|| ToolError::InvalidInput("`tenantId` is required".to_string()))
}

fn query_of(input: &Value) -> &str {
    input.get("query").and_then(Value::as_str).unwrap_or_default()
}

fn previous_of(input: &Value) -> Option<&Value> {
    input.get("previousResult")
}

fn db_failure(error: sqlx::Error) -> ToolError {
    ToolError::Failed(format!("database error: {error}"))
}

struct AnyQueryTool {
    pool: DbPool,
}

#[async_trait]
impl Tool for AnyQueryTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new("any_query", "Count and list students, teachers, classes, enrollment applications or activities")
            .with_parameters(json!({
                "type": "object",
                "properties": {
                    "entity": {
                        "type": "string",
                        "enum": ["student", "teacher", "class", "enrollment", "activity"]
                    },
                    "limit": { "type": "integer", "minimum": 1, "maximum": 100 }
                }
            }))
    }

    async fn execute(&self, input: Value) -> Result<Value, ToolError> {
        let tenant = tenant_of(&input)?;
        let entity = match input.get("entity").and_then(Value::as_str) {
            Some(name) => Entity::parse(name)
                .ok_or_else(|| ToolError::InvalidInput(format!("unknown entity `{name}`")))?,
            None => Entity::infer(query_of(&input)),
        };
        let limit = input
            .get("limit")
            .and_then(Value::as_i64)
            .map(|limit| limit.clamp(1, 100))
            .unwrap_or(DEFAULT_ROW_LIMIT);

        let grouped = sqlx::query(&format!(
            "SELECT IFNULL({status}, 'all') AS status, COUNT(*) AS count FROM {table}
             WHERE tenant_id = ? GROUP BY 1 ORDER BY 1",
            status = entity.status_column(),
            table = entity.as_str(),
        ))
        .bind(tenant)
        .fetch_all(&self.pool)
        .await
        .map_err(db_failure)?;

        let mut by_status = Map::new();
        let mut total = 0_i64;
        for row in &grouped {
            let status: String = row.try_get("status").map_err(db_failure)?;
            let count: i64 = row.try_get("count").map_err(db_failure)?;
            total += count;
            by_status.insert(status, json!(count));
        }

        let rows = sqlx::query(&format!(
            "SELECT id, {label} AS label, {status} AS status FROM {table}
             WHERE tenant_id = ? ORDER BY id LIMIT ?",
            label = entity.label_column(),
            status = entity.status_column(),
            table = entity.as_str(),
        ))
        .bind(tenant)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_failure)?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: String = row.try_get("id").map_err(db_failure)?;
            let label: String = row.try_get("label").map_err(db_failure)?;
            let status: Option<String> = row.try_get("status").map_err(db_failure)?;
            records.push(json!({ "id": id, "label": label, "status": status }));
        }

        Ok(json!({
            "entity": entity.as_str(),
            "total": total,
            "byStatus": by_status,
            "rows": records,
        }))
    }
}

struct WebSearchTool;

#[async_trait]
impl Tool for WebSearchTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new("web_search", "Search the public web").retryable(false)
    }

    async fn execute(&self, _input: Value) -> Result<Value, ToolError> {
        Err(ToolError::Failed("no web search provider is configured".to_string()))
    }
}

/// Numeric series carried by a previous result: `byStatus` counts or a `values` array.
fn series(value: &Value) -> Vec<(String, f64)> {
    if let Some(Value::Object(groups)) = value.get("byStatus") {
        return groups
            .iter()
            .filter_map(|(label, count)| count.as_f64().map(|count| (label.clone(), count)))
            .collect();
    }
    if let Some(Value::Array(values)) = value.get("values") {
        return values
            .iter()
            .enumerate()
            .filter_map(|(index, value)| value.as_f64().map(|value| (format!("#{}", index + 1), value)))
            .collect();
    }
    Vec::new()
}

fn input_series(input: &Value) -> Vec<(String, f64)> {
    let own = series(input);
    if !own.is_empty() {
        return own;
    }
    previous_of(input).map(series).unwrap_or_default()
}

struct AnalyzeDataTool;

#[async_trait]
impl Tool for AnalyzeDataTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new("analyze_data", "Summarize the distribution of the previous query result")
    }

    async fn execute(&self, input: Value) -> Result<Value, ToolError> {
        let points = input_series(&input);
        if points.is_empty() {
            return Err(ToolError::InvalidInput("no data to analyze".to_string()));
        }

        let total: f64 = points.iter().map(|(_, value)| value).sum();
        let shares: Map<String, Value> = points
            .iter()
            .map(|(label, value)| {
                let share = if total > 0.0 { value / total * 100.0 } else { 0.0 };
                (label.clone(), json!((share * 10.0).round() / 10.0))
            })
            .collect();
        let (top_label, top_value) = points
            .iter()
            .max_by(|left, right| left.1.total_cmp(&right.1))
            .map(|(label, value)| (label.clone(), *value))
            .unwrap_or_default();

        Ok(json!({
            "total": total,
            "sharePercent": shares,
            "largest": { "label": top_label, "value": top_value },
            "byStatus": points.iter().map(|(label, value)| (label.clone(), json!(value))).collect::<Map<_, _>>(),
        }))
    }
}

struct CalculateTool;

#[async_trait]
impl Tool for CalculateTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new("calculate", "Sum, mean, minimum and maximum of a numeric series").with_parameters(
            json!({
                "type": "object",
                "properties": { "values": { "type": "array", "items": { "type": "number" } } }
            }),
        )
    }

    async fn execute(&self, input: Value) -> Result<Value, ToolError> {
        let values: Vec<f64> = input_series(&input).into_iter().map(|(_, value)| value).collect();
        if values.is_empty() {
            return Err(ToolError::InvalidInput("`values` must contain numbers".to_string()));
        }

        let sum: f64 = values.iter().sum();
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        Ok(json!({
            "count": values.len(),
            "sum": sum,
            "mean": sum / values.len() as f64,
            "min": min,
            "max": max,
        }))
    }
}

struct RenderChartTool;

#[async_trait]
impl Tool for RenderChartTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new("render_chart", "Build a bar chart specification from the previous result")
    }

    async fn execute(&self, input: Value) -> Result<Value, ToolError> {
        let points = input_series(&input);
        if points.is_empty() {
            return Err(ToolError::InvalidInput("no series to chart".to_string()));
        }
        let title = previous_of(&input)
            .and_then(|previous| previous.get("entity"))
            .and_then(Value::as_str)
            .unwrap_or("summary");

        Ok(json!({
            "chart": {
                "type": "bar",
                "title": title,
                "labels": points.iter().map(|(label, _)| label.clone()).collect::<Vec<_>>(),
                "values": points.iter().map(|(_, value)| *value).collect::<Vec<_>>(),
            }
        }))
    }
}

struct RenderComponentTool;

#[async_trait]
impl Tool for RenderComponentTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new("render_component", "Describe a UI component for the client to render")
    }

    async fn execute(&self, input: Value) -> Result<Value, ToolError> {
        let props = previous_of(&input).cloned().unwrap_or_else(|| json!({}));
        let component = if props.get("rows").is_some() { "data-table" } else { "summary-card" };
        Ok(json!({ "component": component, "props": props }))
    }
}

struct GenerateDocumentTool;

#[async_trait]
impl Tool for GenerateDocumentTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new("generate_document", "Produce a markdown summary document")
    }

    async fn execute(&self, input: Value) -> Result<Value, ToolError> {
        let query = query_of(&input);
        let mut body = format!("# {}\n\n", if query.is_empty() { "Summary" } else { query });
        body.push_str(&format!("Generated at {}\n", Utc::now().to_rfc3339()));

        let points = input_series(&input);
        if !points.is_empty() {
            body.push_str("\n| item | value |\n|---|---|\n");
            for (label, value) in &points {
                body.push_str(&format!("| {label} | {value} |\n"));
            }
        }

        Ok(json!({ "format": "markdown", "body": body }))
    }
}

struct NavigateTool;

const PAGES: [(&str, &str, &[&str]); 5] = [
    ("/enrollment", "招生管理", &["招生", "报名", "enrollment"]),
    ("/teachers", "教师管理", &["老师", "教师", "teacher"]),
    ("/activities", "活动管理", &["活动", "activity"]),
    ("/classes", "班级管理", &["班级", "class"]),
    ("/students", "学生管理", &["学生", "幼儿", "student"]),
];

#[async_trait]
impl Tool for NavigateTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new("navigate_to_page", "Resolve the application page a request refers to")
    }

    async fn execute(&self, input: Value) -> Result<Value, ToolError> {
        let query = query_of(&input).to_lowercase();
        let (path, label) = PAGES
            .iter()
            .find(|(_, _, terms)| terms.iter().any(|term| query.contains(term)))
            .map(|(path, label, _)| (*path, *label))
            .unwrap_or(("/dashboard", "工作台"));
        Ok(json!({ "path": path, "label": label }))
    }
}

struct ActivityWorkflowTool {
    pool: DbPool,
    prompts: Arc<PromptCache>,
}

#[async_trait]
impl Tool for ActivityWorkflowTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new("execute_activity_workflow", "Create a planned activity")
            .with_parameters(json!({
                "type": "object",
                "properties": {
                    "title": { "type": "string" },
                    "startsAt": { "type": "string", "format": "date-time" }
                }
            }))
            .retryable(false)
            .critical(true)
    }

    async fn execute(&self, input: Value) -> Result<Value, ToolError> {
        let tenant = tenant_of(&input)?;
        let title = input
            .get("title")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| query_of(&input).chars().take(60).collect());
        if title.trim().is_empty() {
            return Err(ToolError::InvalidInput("activity title is required".to_string()));
        }
        let starts_at = input.get("startsAt").and_then(Value::as_str);
        let id = format!("act-{}", uuid::Uuid::new_v4());

        sqlx::query(
            "INSERT INTO activity (id, tenant_id, title, status, starts_at) VALUES (?, ?, ?, 'planned', ?)",
        )
        .bind(&id)
        .bind(tenant)
        .bind(&title)
        .bind(starts_at)
        .execute(&self.pool)
        .await
        .map_err(db_failure)?;
        self.prompts.invalidate(DataCategory::Activity, tenant).await;

        Ok(json!({ "activityId": id, "title": title, "status": "planned" }))
    }
}
