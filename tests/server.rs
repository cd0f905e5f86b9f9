use anyhow::Result;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

use kb::analysis::llm::LlmBackend;
use kb::kb::Kb;
use kb::server::{build_router, AppState};
use kb::store::models::{AnalysisResult, SourceKind, Transcript};

struct FixedLlm;

impl LlmBackend for FixedLlm {
    fn model(&self) -> &str {
        "fixed"
    }

    fn complete(&self, _system: Option<&str>, prompt: &str, _model: Option<&str>) -> Result<String> {
        if prompt.starts_with("JUDGE") {
            Ok(r#"{"score": 9, "feedback": "good"}"#.to_string())
        } else {
            Ok("Revised draft".to_string())
        }
    }
}

fn result(output: &str) -> AnalysisResult {
    AnalysisResult {
        output: json!(output),
        model: "fixed".into(),
        analyzed_at: "2026-07-01T00:00:00Z".into(),
        prompt_version: None,
    }
}

fn state(llm: bool) -> (tempfile::TempDir, Arc<AppState>, String) {
    let dir = tempfile::tempdir().unwrap();
    let kb = Kb::open(dir.path()).unwrap();
    let prompts = kb.paths.prompts_dir();
    std::fs::write(
        prompts.join("summary.md"),
        "---\nactionable: true\n---\nSUMMARY {{transcript}}\n",
    )
    .unwrap();
    std::fs::write(
        prompts.join("post.md"),
        "---\nkind: auto_judge\nactionable: true\njudge: post_judge\n---\nPOST {{summary}}\n",
    )
    .unwrap();
    std::fs::write(prompts.join("post_judge.md"), "---\noutput: json\n---\nJUDGE {{draft}}\n").unwrap();

    let mut t = Transcript::new("Standup", "2026-07-01", SourceKind::Text);
    t.decimal = Some("10.01".into());
    t.text = "Shipping the dashboard this week.".into();
    t.analysis.insert("summary".into(), result("Dashboard ships"));
    t.analysis.insert("post".into(), result("First draft"));
    kb.add_transcript(&mut t).unwrap();

    let llm: Option<Arc<dyn LlmBackend>> = if llm { Some(Arc::new(FixedLlm)) } else { None };
    (dir, Arc::new(AppState::new(kb, llm)), t.id)
}

async fn call(state: &Arc<AppState>, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut req = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(v) => {
            req = req.header("content-type", "application/json");
            Body::from(v.to_string())
        }
        None => Body::empty(),
    };
    let res = build_router(Arc::clone(state))
        .oneshot(req.body(body).unwrap())
        .await
        .unwrap();
    let status = res.status();
    let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

#[tokio::test]
async fn actions_move_between_views() {
    let (_dir, state, id) = state(false);

    let (status, page) = call(&state, "GET", "/api/actions?view=queue", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["items"].as_array().unwrap().len(), 2);
    assert_eq!(page["counts"]["queue"], 2);

    let (status, item) = call(&state, "POST", &format!("/api/action/{id}--post/approve"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(item["status"], "staged");

    let (_, page) = call(&state, "GET", "/api/actions?view=review", None).await;
    assert_eq!(page["items"][0]["id"], format!("{id}--post"));
    assert_eq!(page["counts"]["queue"], 1);
    assert_eq!(page["counts"]["review"], 1);

    let (status, item) = call(&state, "POST", &format!("/api/action/{id}--summary/approve"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(item["status"], "done");
}

#[tokio::test]
async fn errors_map_to_status_codes() {
    let (_dir, state, id) = state(false);

    let (status, body) = call(&state, "GET", "/api/action/nope--summary", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("not found"));

    let (status, _) = call(&state, "POST", &format!("/api/action/{id}--summary/posted"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = call(&state, "POST", &format!("/api/action/{id}--summary/explode"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = call(&state, "GET", "/api/action/missing-separator", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(&state, "GET", "/api/actions?view=inbox", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(&state, "GET", "/api/search?q=", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    call(&state, "POST", &format!("/api/action/{id}--post/approve"), None).await;
    let (status, _) = call(&state, "POST", &format!("/api/action/{id}--post/judge"), None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn judge_and_iterate_through_the_api() {
    let (_dir, state, id) = state(true);
    call(&state, "POST", &format!("/api/action/{id}--post/approve"), None).await;

    let (status, item) = call(
        &state,
        "POST",
        &format!("/api/action/{id}--post/iterate"),
        Some(json!({"feedback": "shorter"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(item["output"], "Revised draft");
    assert_eq!(item["record"]["iterations"][0]["feedback"], "shorter");

    let (status, body) = call(&state, "POST", &format!("/api/action/{id}--post/judge"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["verdict"]["passed"], true);
    assert_eq!(body["item"]["status"], "ready");

    let (status, item) = call(&state, "POST", &format!("/api/action/{id}--post/posted"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(item["status"], "done");
}

#[tokio::test]
async fn feedback_flags_show_on_prompts() {
    let (_dir, state, id) = state(false);

    let (status, flag) = call(
        &state,
        "POST",
        "/api/feedback",
        Some(json!({"transcript_id": id, "analysis_type": "summary", "reason": "too long"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let flag_id = flag["id"].as_str().unwrap().to_string();

    let (_, prompts) = call(&state, "GET", "/api/prompts", None).await;
    let summary = prompts
        .as_array()
        .unwrap()
        .iter()
        .find(|p| p["name"] == "summary")
        .unwrap();
    assert_eq!(summary["open_flags"], 1);

    let (status, _) = call(
        &state,
        "POST",
        "/api/feedback",
        Some(json!({"transcript_id": id, "analysis_type": "ghost", "reason": "?"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, resolved) = call(&state, "POST", &format!("/api/feedback/{flag_id}/resolve"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(resolved["resolved_at"].is_string());

    let (_, open) = call(&state, "GET", "/api/feedback", None).await;
    assert!(open.as_array().unwrap().is_empty());
    let (_, all) = call(&state, "GET", "/api/feedback?all=true", None).await;
    assert_eq!(all.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn transcripts_search_and_stats() {
    let (_dir, state, id) = state(false);

    let (_, list) = call(&state, "GET", "/api/transcripts?decimal=10", None).await;
    assert_eq!(list[0]["id"], id);
    let (_, list) = call(&state, "GET", "/api/transcripts?decimal=20", None).await;
    assert!(list.as_array().unwrap().is_empty());

    let (status, _) = call(&state, "GET", "/api/transcripts/unknown", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, hits) = call(&state, "GET", "/api/search?q=dashboard", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(hits[0]["id"], id);

    let (_, stats) = call(&state, "GET", "/api/stats", None).await;
    assert_eq!(stats["transcripts"], 1);
    assert_eq!(stats["by_decimal"]["10.01"], 1);
    assert_eq!(stats["actions"]["queue"], 2);

    let (status, _) = call(&state, "GET", "/", None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn search_applies_tag_source_and_date_filters() {
    let (_dir, state, id) = state(false);

    let (_, hits) = call(&state, "GET", "/api/search?q=dashboard&tag=ops", None).await;
    assert!(hits.as_array().unwrap().is_empty());
    let (_, hits) = call(&state, "GET", "/api/search?q=dashboard&source=audio", None).await;
    assert!(hits.as_array().unwrap().is_empty());
    let (_, hits) = call(&state, "GET", "/api/search?q=dashboard&from=2026-08-01", None).await;
    assert!(hits.as_array().unwrap().is_empty());
    let (_, hits) = call(&state, "GET", "/api/search?q=dashboard&to=2026-06-30", None).await;
    assert!(hits.as_array().unwrap().is_empty());

    let (_, hits) = call(
        &state,
        "GET",
        "/api/search?q=dashboard&source=text&from=2026-07-01&to=2026-07-01&tag=",
        None,
    )
    .await;
    assert_eq!(hits[0]["id"], id);
}
