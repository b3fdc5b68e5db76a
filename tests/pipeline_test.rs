//! End-to-end pipeline tests against a mocked completion endpoint.

use std::path::Path;
use std::time::Duration;

use serde_json::{Value, json};
use tempfile::TempDir;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use minutes_worker::app::ComponentRegistry;
use minutes_worker::config::Config;
use minutes_worker::events::ProgressEvent;
use minutes_worker::models::{AnalysisPayload, AnalyzerStatus, Job, JobStatus};
use minutes_worker::store::JobStore as _;

struct TestEnv {
    registry: ComponentRegistry,
    output_root: TempDir,
    _prompts_root: TempDir,
}

fn write_prompt(root: &Path, rel: &str, body: &str) {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, body).unwrap();
}

fn default_prompts(root: &Path) {
    write_prompt(
        root,
        "stage_a/say_means.md",
        "Analyze what is said versus meant.\n\n# Transcript\n{{ transcript }}",
    );
    write_prompt(
        root,
        "stage_a/perspective_perception.md",
        "PERSPECTIVE-FAIL-MARKER perspectives.\n\n# Transcript\n{{ transcript }}",
    );
    write_prompt(
        root,
        "stage_b/first_principles.md",
        "Reduce to first principles.\n\n# Prior Analyses\n{{ context }}",
    );
    write_prompt(
        root,
        "final/meeting_notes.md",
        "Produce notes.\n\n# Combined\n{{ context }}\n\n# Transcript\n{{ transcript }}",
    );
}

fn completion_body(content: &str) -> Value {
    json!({
        "choices": [{"message": {"role": "assistant", "content": content}}],
        "usage": {"prompt_tokens": 100, "completion_tokens": 40, "total_tokens": 140}
    })
}

async fn build_env(server: &MockServer, tune: impl FnOnce(minutes_worker::config::ConfigBuilder) -> minutes_worker::config::ConfigBuilder) -> TestEnv {
    let prompts_root = TempDir::new().unwrap();
    let output_root = TempDir::new().unwrap();
    default_prompts(prompts_root.path());

    let builder = Config::builder()
        .llm_base_url(server.uri())
        .llm_retry(2, 1, 5)
        .prompts_root(prompts_root.path())
        .output_root(output_root.path())
        .max_concurrent(3)
        .analyzer_timeout(Duration::from_secs(10))
        .insights_llm_enabled(false);
    let config = tune(builder).build();

    let registry = ComponentRegistry::build(config).await.expect("registry");
    TestEnv {
        registry,
        output_root,
        _prompts_root: prompts_root,
    }
}

async fn wait_for_terminal(env: &TestEnv, job_id: &str) -> Job {
    let store = env.registry.store();
    for _ in 0..1200 {
        if let Some(job) = store.get(job_id).await.expect("store read") {
            if matches!(job.status, JobStatus::Completed | JobStatus::Error) {
                return job;
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("job {job_id} did not reach a terminal state");
}

async fn collect_events(
    rx: &mut tokio::sync::broadcast::Receiver<ProgressEvent>,
) -> Vec<ProgressEvent> {
    let mut events = Vec::new();
    loop {
        match tokio::time::timeout(Duration::from_secs(30), rx.recv()).await {
            Ok(Ok(event)) => {
                let terminal = event.is_terminal();
                events.push(event);
                if terminal {
                    break;
                }
            }
            _ => break,
        }
    }
    events
}

fn event_name(event: &ProgressEvent) -> String {
    serde_json::to_value(event).unwrap()["event"]
        .as_str()
        .unwrap()
        .to_string()
}

#[tokio::test]
async fn happy_path_minimal_selection() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body(
            "## Summary\nThe team agreed on the fix.\n\nAction: Ship the fix by Friday\n",
        )))
        .mount(&server)
        .await;

    let env = build_env(&server, |b| b).await;
    let payload: AnalysisPayload = serde_json::from_value(json!({
        "transcript_text": "Speaker 1: Ship the fix by Friday.\n\nSpeaker 2: Agreed.",
        "selected": {"A": ["say_means"], "B": [], "Final": ["meeting_notes"]}
    }))
    .unwrap();

    let receipt = env.registry.scheduler().submit(payload).await.expect("submit");
    let mut rx = env.registry.events().subscribe(&receipt.job_id);

    let job = wait_for_terminal(&env, &receipt.job_id).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(
        job.stage_a.get("say_means").unwrap().status,
        AnalyzerStatus::Completed
    );
    assert!(job.stage_b.is_empty());
    assert_eq!(
        job.final_stage.get("meeting_notes").unwrap().status,
        AnalyzerStatus::Completed
    );

    // Token sum invariant: totals equal the sum of per-analyzer usage.
    let per_analyzer: u64 = job
        .stage_a
        .values()
        .chain(job.stage_b.values())
        .chain(job.final_stage.values())
        .map(|r| r.token_usage.total_tokens)
        .sum();
    assert_eq!(job.token_usage_total.total_tokens, per_analyzer);
    assert_eq!(per_analyzer, 280, "two completions at 140 tokens each");

    // Artifacts
    let job_dir = env.output_root.path().join(&receipt.job_id);
    let sentinel = std::fs::metadata(job_dir.join("COMPLETED")).expect("sentinel");
    assert_eq!(sentinel.len(), 0);
    assert!(job_dir.join("intermediate/stage_a/say_means.json").is_file());
    assert!(job_dir.join("intermediate/stage_a/say_means.md").is_file());
    assert!(job_dir.join("final/meeting_notes.md").is_file());
    assert!(job_dir.join("final/context_combined.txt").is_file());

    let final_status: Value =
        serde_json::from_str(&std::fs::read_to_string(job_dir.join("final_status.json")).unwrap())
            .unwrap();
    assert_eq!(final_status["status"], "completed");
    assert_eq!(final_status["run_id"], receipt.job_id.as_str());
    assert_eq!(final_status["total_tokens"], 280);

    // Insight dashboard contains the action with its due date and evidence.
    let dashboard: Value = serde_json::from_str(
        &std::fs::read_to_string(job_dir.join("final/insight_dashboard.json")).unwrap(),
    )
    .unwrap();
    let items = dashboard["items"].as_array().unwrap();
    let action = items
        .iter()
        .find(|item| {
            item["type"] == "action"
                && item["title"].as_str().unwrap_or("").contains("Ship the fix")
        })
        .expect("action item present");
    assert_eq!(action["due_date"], "Friday");
    assert_eq!(action["evidence"]["segment_id"], 0);
    assert_eq!(action["links"]["transcript_anchor"], "#seg-0");
    assert!(job_dir.join("final/insight_dashboard.md").is_file());
    assert!(job_dir.join("final/insight_dashboard.csv").is_file());

    // Event ordering: started precedes the terminal event per analyzer, and
    // Final work begins only after the Stage B barrier.
    let events = collect_events(&mut rx).await;
    let names: Vec<String> = events.iter().map(event_name).collect();
    let started_final = names
        .iter()
        .position(|n| n == "analyzer.started")
        .expect("first analyzer.started");
    let completed_first = names
        .iter()
        .position(|n| n == "analyzer.completed")
        .expect("analyzer.completed");
    assert!(started_final < completed_first);

    let stage_b_done = names.iter().position(|n| n == "stage.completed").map(|_| {
        // Find the stage_b completion specifically.
        events
            .iter()
            .position(|e| {
                serde_json::to_value(e).unwrap()["stage"] == "stage_b"
                    && event_name(e) == "stage.completed"
            })
            .unwrap()
    });
    if let Some(stage_b_done) = stage_b_done {
        let final_started = events
            .iter()
            .position(|e| {
                event_name(e) == "analyzer.started"
                    && serde_json::to_value(e).unwrap()["stage"] == "final"
            })
            .expect("final analyzer started");
        assert!(stage_b_done < final_started);
    }
    assert_eq!(names.last().map(String::as_str), Some("job.completed"));
}

#[tokio::test]
async fn stage_a_partial_failure_does_not_fail_the_job() {
    let server = MockServer::start().await;
    // The perspective analyzer's prompt carries a marker; fail those calls.
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_string_contains("PERSPECTIVE-FAIL-MARKER"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body(
            "## Findings\n- The fix must ship before the demo on Friday\n",
        )))
        .mount(&server)
        .await;

    let env = build_env(&server, |b| b).await;
    let payload: AnalysisPayload = serde_json::from_value(json!({
        "transcript_text": "Ana: We must ship the fix.\n\nBo: Before the demo.",
        "selected": {
            "A": ["say_means", "perspective_perception"],
            "B": ["first_principles"],
            "Final": []
        }
    }))
    .unwrap();

    let receipt = env.registry.scheduler().submit(payload).await.expect("submit");
    let mut rx = env.registry.events().subscribe(&receipt.job_id);
    let job = wait_for_terminal(&env, &receipt.job_id).await;

    // The failing analyzer is an error record; the job still completes.
    assert_eq!(job.status, JobStatus::Completed);
    let failed = job.stage_a.get("perspective_perception").unwrap();
    assert_eq!(failed.status, AnalyzerStatus::Error);
    assert!(failed.error_message.as_deref().unwrap_or("").contains("500"));
    assert_eq!(
        job.stage_a.get("say_means").unwrap().status,
        AnalyzerStatus::Completed
    );
    assert_eq!(
        job.stage_b.get("first_principles").unwrap().status,
        AnalyzerStatus::Completed
    );

    let events = collect_events(&mut rx).await;
    assert!(
        events.iter().any(|e| event_name(e) == "analyzer.error"),
        "analyzer.error event must be emitted"
    );
    assert_eq!(
        events.last().map(event_name).as_deref(),
        Some("job.completed"),
        "partial analyzer failure must still end in job.completed"
    );

    // Stage B context only contains the surviving Stage A section.
    let job_dir = env.output_root.path().join(&receipt.job_id);
    let context =
        std::fs::read_to_string(job_dir.join("intermediate/stage_b_context.txt")).unwrap();
    assert!(context.contains("say_means"));
    assert!(!context.contains("perspective_perception"));

    // Empty Final selection: no final analyzer outputs, but the dashboard and
    // sentinel are still written.
    assert!(!job_dir.join("final/meeting_notes.md").exists());
    assert!(job_dir.join("final/insight_dashboard.json").is_file());
    assert!(job_dir.join("COMPLETED").is_file());
}

#[tokio::test]
async fn analyzer_timeout_is_an_error_record_with_cause() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(completion_body("slow"))
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;

    let env = build_env(&server, |b| {
        b.analyzer_timeout(Duration::from_millis(300))
    })
    .await;
    let payload: AnalysisPayload = serde_json::from_value(json!({
        "transcript_text": "Ana: hello there.",
        "selected": {"A": ["say_means"], "B": [], "Final": []}
    }))
    .unwrap();

    let receipt = env.registry.scheduler().submit(payload).await.expect("submit");
    let job = wait_for_terminal(&env, &receipt.job_id).await;

    assert_eq!(job.status, JobStatus::Completed);
    let record = job.stage_a.get("say_means").unwrap();
    assert_eq!(record.status, AnalyzerStatus::Error);
    assert!(
        record.error_message.as_deref().unwrap().contains("timeout"),
        "timeout cause must be recorded: {:?}",
        record.error_message
    );
}

#[tokio::test]
async fn stage_b_summary_mode_runs_map_reduce() {
    let server = MockServer::start().await;
    // Map/reduce summarization prompts are distinguishable by their headers.
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_string_contains("# Chunk Summaries"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body(
            "REDUCED TRANSCRIPT SUMMARY",
        )))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_string_contains("# Chunk"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("chunk summary")))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body(
            "## Findings\n- a reasonably long analytical finding here\n",
        )))
        .mount(&server)
        .await;

    // Long transcript: well past the single-pass threshold of 100 tokens.
    let long_text = (0..200)
        .map(|i| format!("Ana: point number {i} about the launch plan."))
        .collect::<Vec<_>>()
        .join("\n\n");

    let env = build_env(&server, |b| b.summary(true, 100, 50, 5)).await;
    let payload: AnalysisPayload = serde_json::from_value(json!({
        "transcript_text": long_text,
        "selected": {"A": ["say_means"], "B": ["first_principles"], "Final": []},
        "options": {
            "stage_b": {"include_transcript": true, "mode": "summary"}
        }
    }))
    .unwrap();

    let receipt = env.registry.scheduler().submit(payload).await.expect("submit");
    let job = wait_for_terminal(&env, &receipt.job_id).await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(
        job.stage_b.get("first_principles").unwrap().status,
        AnalyzerStatus::Completed
    );

    let job_dir = env.output_root.path().join(&receipt.job_id);
    let summaries = job_dir.join("intermediate/summaries");
    assert!(
        summaries.join("summary.stage_b.reduce.md").is_file(),
        "reduce summary artifact expected"
    );
    assert!(summaries.join("chunk_001.md").is_file());
    let reduce = std::fs::read_to_string(summaries.join("summary.stage_b.reduce.md")).unwrap();
    assert_eq!(reduce, "REDUCED TRANSCRIPT SUMMARY");
}

#[tokio::test]
async fn llm_insight_pass_merges_validated_items() {
    let server = MockServer::start().await;
    let insight_payload = json!({
        "items": [{
            "type": "action",
            "summary": "Prepare pricing deck",
            "owner": "Ana",
            "due": "2025-02-01",
            "source": "transcript",
            "evidence": {"segment_ids": [1], "speakers": ["Ana"], "quotes": ["pricing deck"]}
        }]
    });
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_string_contains("Segmented Transcript"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(completion_body(&insight_payload.to_string())),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body(
            "## Findings\nnothing actionable in this pass\n",
        )))
        .mount(&server)
        .await;

    let env = build_env(&server, |b| b.insights_llm_enabled(true)).await;
    let payload: AnalysisPayload = serde_json::from_value(json!({
        "transcript_text": "Bo: Opening remarks.\n\nAna: I will prepare the pricing deck.",
        "selected": {"A": ["say_means"], "B": [], "Final": []}
    }))
    .unwrap();

    let receipt = env.registry.scheduler().submit(payload).await.expect("submit");
    let job = wait_for_terminal(&env, &receipt.job_id).await;
    assert_eq!(job.status, JobStatus::Completed);

    let job_dir = env.output_root.path().join(&receipt.job_id);
    let dashboard: Value = serde_json::from_str(
        &std::fs::read_to_string(job_dir.join("final/insight_dashboard.json")).unwrap(),
    )
    .unwrap();
    let items = dashboard["items"].as_array().unwrap();
    let action = items
        .iter()
        .find(|i| i["title"] == "Prepare pricing deck")
        .expect("LLM-extracted action present");
    assert_eq!(action["owner"], "Ana");
    assert_eq!(action["due_date"], "2025-02-01");
    assert_eq!(action["evidence"]["segment_id"], 1);

    assert!(job_dir.join("final/insight_llm.json").is_file());
}

#[tokio::test]
async fn submit_rejects_bad_input() {
    let server = MockServer::start().await;
    let env = build_env(&server, |b| b).await;

    // Empty transcript
    let empty: AnalysisPayload = serde_json::from_value(json!({
        "transcript_text": "   "
    }))
    .unwrap();
    let error = env.registry.scheduler().submit(empty).await.unwrap_err();
    assert!(error.to_string().contains("transcript"));

    // Unknown analyzer slug
    let unknown: AnalysisPayload = serde_json::from_value(json!({
        "transcript_text": "Ana: hello.",
        "selected": {"A": ["does_not_exist"]}
    }))
    .unwrap();
    let error = env.registry.scheduler().submit(unknown).await.unwrap_err();
    assert!(error.to_string().contains("does_not_exist"));
}
