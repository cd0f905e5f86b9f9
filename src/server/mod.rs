//! Local review dashboard: a JSON API over the KB plus one static page.

use anyhow::anyhow;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tracing::{error, info};

use crate::actions::queue::{apply_event, count_views, get_item, list_items, QueueFilter, ViewCounts};
use crate::actions::refine::Refiner;
use crate::actions::{ActionEvent, ActionKey, View};
use crate::analysis::llm::LlmBackend;
use crate::analysis::{AnalysisType, Analyzer};
use crate::error::KbError;
use crate::feedback::Flag;
use crate::kb::Kb;
use crate::search::filters::Filters;

const DASHBOARD: &str = include_str!("dashboard.html");

pub struct AppState {
    pub kb: Kb,
    /// `None` when no API key is configured; LLM endpoints then fail with 503.
    pub llm: Option<Arc<dyn LlmBackend>>,
    /// Held for every read-modify-write of the JSON documents.
    pub write_lock: Mutex<()>,
}

impl AppState {
    pub fn new(kb: Kb, llm: Option<Arc<dyn LlmBackend>>) -> Self {
        Self {
            kb,
            llm,
            write_lock: Mutex::new(()),
        }
    }

    fn llm(&self) -> Result<&dyn LlmBackend, ApiError> {
        self.llm.as_deref().ok_or_else(|| ApiError {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: "no LLM API key configured".into(),
        })
    }

    fn write_guard(&self) -> std::sync::MutexGuard<'_, ()> {
        self.write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// JSON `{error}` response with a status derived from the domain error.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        let status = match e.downcast_ref::<KbError>() {
            Some(KbError::NotFound { .. } | KbError::UnknownAnalysis(_)) => StatusCode::NOT_FOUND,
            Some(KbError::InvalidTransition { .. } | KbError::Busy) => StatusCode::CONFLICT,
            Some(
                KbError::Invalid { .. } | KbError::Template(_) | KbError::DependencyCycle(_),
            ) => StatusCode::BAD_REQUEST,
            None => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: format!("{e:#}"),
        }
    }
}

impl From<KbError> for ApiError {
    fn from(e: KbError) -> Self {
        anyhow::Error::from(e).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!("{}", self.message);
        }
        (self.status, Json(serde_json::json!({ "error": self.message }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Run blocking KB work (file I/O, SQLite, LLM calls) off the async runtime.
async fn blocking<T, F>(state: Arc<AppState>, f: F) -> ApiResult<T>
where
    T: Send + 'static,
    F: FnOnce(&AppState) -> Result<T, ApiError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || f(&state))
        .await
        .map_err(|e| ApiError::from(anyhow!("worker task failed: {e}")))?
        .map(Json)
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/actions", get(actions_list))
        .route("/api/action/:id", get(action_get))
        .route("/api/action/:id/:event", post(action_event))
        .route("/api/transcripts", get(transcripts_list))
        .route("/api/transcripts/:id", get(transcript_get))
        .route("/api/search", get(search))
        .route("/api/prompts", get(prompts_list))
        .route("/api/prompts/:name", get(prompt_get))
        .route("/api/feedback", get(feedback_list).post(feedback_create))
        .route("/api/feedback/:id/resolve", post(feedback_resolve))
        .route("/api/registry", get(registry))
        .route("/api/stats", get(stats))
        .with_state(state)
}

/// Serve the dashboard until Ctrl-C.
pub async fn serve(state: Arc<AppState>, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Dashboard on http://{addr}");
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

async fn index() -> Html<&'static str> {
    Html(DASHBOARD)
}

#[derive(Debug, Deserialize, Default)]
struct ActionsQuery {
    view: Option<String>,
    decimal: Option<String>,
    #[serde(rename = "type")]
    analysis_type: Option<String>,
}

#[derive(Serialize)]
struct ActionsPage {
    items: Vec<crate::actions::queue::ActionItem>,
    counts: ViewCounts,
}

async fn actions_list(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ActionsQuery>,
) -> ApiResult<ActionsPage> {
    blocking(state, move |s| {
        let view = match q.view.as_deref().filter(|v| !v.is_empty()) {
            Some(v) => Some(View::from_str(v).ok_or_else(|| KbError::invalid("view", v))?),
            None => None,
        };
        let filter = QueueFilter {
            view: None,
            decimal: q.decimal.filter(|d| !d.is_empty()),
            analysis_type: q.analysis_type.filter(|t| !t.is_empty()),
        };
        let transcripts = s.kb.store.list()?;
        let catalog = s.kb.catalog()?;
        let ledger = s.kb.ledger()?;

        let all = list_items(&transcripts, &catalog, &ledger, &filter);
        let counts = count_views(&all);
        let items = match view {
            Some(v) => all.into_iter().filter(|i| i.view == v).collect(),
            None => all,
        };
        Ok(ActionsPage { items, counts })
    })
    .await
}

async fn action_get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<crate::actions::queue::ActionItem> {
    blocking(state, move |s| {
        let key = ActionKey::parse(&id)?;
        Ok(get_item(&s.kb.store, &s.kb.catalog()?, &s.kb.ledger()?, &key)?)
    })
    .await
}

#[derive(Debug, Deserialize, Default)]
struct IterateBody {
    feedback: Option<String>,
}

async fn action_event(
    State(state): State<Arc<AppState>>,
    Path((id, event)): Path<(String, String)>,
    body: Bytes,
) -> ApiResult<serde_json::Value> {
    blocking(state, move |s| {
        let key = ActionKey::parse(&id)?;
        let event_name = event.as_str();
        let catalog = s.kb.catalog()?;
        let ledger_path = s.kb.paths.action_state_file();

        match event_name {
            "iterate" | "judge" | "refine" => {
                let registry = s.kb.registry()?;
                let analyzer = Analyzer {
                    catalog: &catalog,
                    store: &s.kb.store,
                    registry: &registry,
                    llm: s.llm()?,
                };
                let refiner = Refiner {
                    analyzer: &analyzer,
                    ledger_path: &ledger_path,
                    commit_lock: Some(&s.write_lock),
                };
                let value = match event_name {
                    "iterate" => {
                        let req: IterateBody = if body.is_empty() {
                            IterateBody::default()
                        } else {
                            serde_json::from_slice(&body)
                                .map_err(|e| KbError::invalid("request body", e.to_string()))?
                        };
                        let item = refiner.iterate(&key, req.feedback.as_deref())?;
                        serde_json::to_value(item).map_err(anyhow::Error::from)?
                    }
                    "judge" => {
                        let (verdict, item) = refiner.judge(&key)?;
                        serde_json::json!({ "verdict": verdict, "item": item })
                    }
                    _ => serde_json::to_value(refiner.refine(&key)?).map_err(anyhow::Error::from)?,
                };
                s.kb.reindex_id(&key.transcript_id)?;
                Ok(value)
            }
            other => {
                let event = ActionEvent::from_str(other)
                    .filter(|e| *e != ActionEvent::Iterate)
                    .ok_or_else(|| KbError::not_found("action event", other))?;
                let _guard = s.write_guard();
                let item = apply_event(&s.kb.store, &catalog, &ledger_path, &key, event)?;
                Ok(serde_json::to_value(item).map_err(anyhow::Error::from)?)
            }
        }
    })
    .await
}

#[derive(Debug, Deserialize, Default)]
struct DecimalQuery {
    decimal: Option<String>,
}

#[derive(Serialize)]
struct TranscriptSummary {
    id: String,
    title: String,
    decimal: Option<String>,
    date: String,
    source_kind: String,
    duration_seconds: f64,
    word_count: usize,
    analyses: Vec<String>,
}

async fn transcripts_list(
    State(state): State<Arc<AppState>>,
    Query(q): Query<DecimalQuery>,
) -> ApiResult<Vec<TranscriptSummary>> {
    blocking(state, move |s| {
        let prefix = q.decimal.filter(|d| !d.is_empty());
        let out = s
            .kb
            .store
            .list()?
            .into_iter()
            .filter(|t| match (&prefix, &t.decimal) {
                (None, _) => true,
                (Some(p), Some(d)) => d == p || d.starts_with(&format!("{p}.")),
                (Some(_), None) => false,
            })
            .map(|t| TranscriptSummary {
                word_count: t.word_count(),
                analyses: t.analysis.keys().cloned().collect(),
                source_kind: t.source_kind.as_str().to_string(),
                id: t.id,
                title: t.title,
                decimal: t.decimal,
                date: t.date,
                duration_seconds: t.duration_seconds,
            })
            .collect();
        Ok(out)
    })
    .await
}

async fn transcript_get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<crate::store::models::Transcript> {
    blocking(state, move |s| Ok(s.kb.store.require(&id)?)).await
}

#[derive(Debug, Deserialize)]
struct SearchQuery {
    q: String,
    decimal: Option<String>,
    tag: Option<String>,
    source: Option<String>,
    from: Option<String>,
    to: Option<String>,
    limit: Option<usize>,
}

async fn search(
    State(state): State<Arc<AppState>>,
    Query(q): Query<SearchQuery>,
) -> ApiResult<Vec<crate::search::TranscriptHit>> {
    blocking(state, move |s| {
        if q.q.trim().is_empty() {
            return Err(KbError::invalid("query", "empty").into());
        }
        let set = |v: Option<String>| v.filter(|v| !v.trim().is_empty());
        let filters = Filters {
            decimal: set(q.decimal),
            tag: set(q.tag),
            source_kind: set(q.source),
            from_date: set(q.from),
            to_date: set(q.to),
        };
        let hits = s
            .kb
            .index()?
            .search(&q.q, &filters, q.limit.unwrap_or(20))
            .map_err(|e| KbError::invalid("query", format!("{e:#}")))?;
        Ok(hits)
    })
    .await
}

#[derive(Serialize)]
struct PromptSummary {
    #[serde(flatten)]
    ty: AnalysisType,
    open_flags: usize,
}

async fn prompts_list(State(state): State<Arc<AppState>>) -> ApiResult<Vec<PromptSummary>> {
    blocking(state, |s| {
        let counts = s.kb.feedback()?.open_counts();
        Ok(s.kb
            .catalog()?
            .iter()
            .map(|ty| PromptSummary {
                open_flags: counts.get(&ty.name).copied().unwrap_or(0),
                ty: ty.clone(),
            })
            .collect())
    })
    .await
}

#[derive(Serialize)]
struct PromptDetail {
    #[serde(flatten)]
    ty: AnalysisType,
    flags: Vec<Flag>,
}

async fn prompt_get(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<PromptDetail> {
    blocking(state, move |s| {
        let ty = s.kb.catalog()?.require(&name)?.clone();
        let flags = s
            .kb
            .feedback()?
            .list(Some(name.as_str()), true)
            .into_iter()
            .cloned()
            .collect();
        Ok(PromptDetail { ty, flags })
    })
    .await
}

#[derive(Debug, Deserialize, Default)]
struct FeedbackQuery {
    #[serde(rename = "type")]
    analysis_type: Option<String>,
    #[serde(default)]
    all: bool,
}

async fn feedback_list(
    State(state): State<Arc<AppState>>,
    Query(q): Query<FeedbackQuery>,
) -> ApiResult<Vec<Flag>> {
    blocking(state, move |s| {
        let log = s.kb.feedback()?;
        Ok(log
            .list(q.analysis_type.as_deref().filter(|t| !t.is_empty()), q.all)
            .into_iter()
            .cloned()
            .collect())
    })
    .await
}

#[derive(Debug, Deserialize)]
struct NewFlag {
    transcript_id: String,
    analysis_type: String,
    reason: String,
}

async fn feedback_create(
    State(state): State<Arc<AppState>>,
    Json(req): Json<NewFlag>,
) -> ApiResult<Flag> {
    blocking(state, move |s| {
        s.kb.catalog()?.require(&req.analysis_type)?;
        s.kb.store.require(&req.transcript_id)?;
        let _guard = s.write_guard();
        let path = s.kb.paths.feedback_file();
        let mut log = s.kb.feedback()?;
        let flag = log.flag(&req.transcript_id, &req.analysis_type, &req.reason)?;
        log.save(&path)?;
        info!("Flagged {} on {}", req.analysis_type, req.transcript_id);
        Ok(flag)
    })
    .await
}

async fn feedback_resolve(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Flag> {
    blocking(state, move |s| {
        let _guard = s.write_guard();
        let path = s.kb.paths.feedback_file();
        let mut log = s.kb.feedback()?;
        let flag = log.resolve(&id)?.clone();
        log.save(&path)?;
        Ok(flag)
    })
    .await
}

async fn registry(State(state): State<Arc<AppState>>) -> ApiResult<crate::registry::Registry> {
    blocking(state, |s| Ok(s.kb.registry()?)).await
}

#[derive(Serialize)]
struct Stats {
    transcripts: usize,
    words: usize,
    hours: f64,
    by_decimal: BTreeMap<String, usize>,
    actions: ViewCounts,
    open_flags: usize,
}

async fn stats(State(state): State<Arc<AppState>>) -> ApiResult<Stats> {
    blocking(state, |s| {
        let transcripts = s.kb.store.list()?;
        let catalog = s.kb.catalog()?;
        let ledger = s.kb.ledger()?;
        let items = list_items(&transcripts, &catalog, &ledger, &QueueFilter::default());

        let mut by_decimal = BTreeMap::new();
        for t in &transcripts {
            let code = t.decimal.clone().unwrap_or_else(|| "-".to_string());
            *by_decimal.entry(code).or_insert(0) += 1;
        }
        Ok(Stats {
            transcripts: transcripts.len(),
            words: transcripts.iter().map(|t| t.word_count()).sum(),
            hours: transcripts.iter().map(|t| t.duration_seconds).sum::<f64>() / 3600.0,
            by_decimal,
            actions: count_views(&items),
            open_flags: s.kb.feedback()?.open_counts().values().sum(),
        })
    })
    .await
}
