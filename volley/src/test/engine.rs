//! End-to-end benchmark run
//!
//! Loads a configuration pointing at a wiremock server, runs the full
//! (prompt × model) matrix through the real HTTP invoker and checks the
//! classified outcomes, the aggregated stats and the written run directory.

use std::sync::Arc;
use std::time::Duration;

use figment::Figment;
use figment::providers::{Format, Yaml};
use rust_decimal::Decimal;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::config::{Config, Selection};
use crate::dispatcher::{Dispatcher, DispatcherConfig};
use crate::invoker::OpenAiInvoker;
use crate::output::RunWriter;
use crate::runner::Runner;
use crate::types::ErrorKind;

fn completion(content: &str) -> serde_json::Value {
    json!({
        "id": "chatcmpl-123",
        "object": "chat.completion",
        "created": 1677652288,
        "model": "test-model",
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": content },
            "finish_reason": "stop"
        }],
        "usage": { "prompt_tokens": 12, "completion_tokens": 30, "total_tokens": 42 }
    })
}

async fn mount_model(server: &MockServer, model_id: &str, response: ResponseTemplate) {
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .and(body_partial_json(json!({ "model": model_id })))
        .respond_with(response)
        .mount(server)
        .await;
}

fn config(server: &MockServer) -> Config {
    let yaml = format!(
        r#"
endpoint: {}/v1
api_key: sk-test
request_timeout: 2s
number_of_calls: 6
concurrency: 3
models:
  - name: healthy
    model_id: acme/healthy
    input_cost_per_1k_tokens: 0.001
    output_cost_per_1k_tokens: 0.002
  - name: throttled
    model_id: acme/throttled
    input_cost_per_1k_tokens: 0.001
    output_cost_per_1k_tokens: 0.002
  - name: broken
    model_id: acme/broken
    input_cost_per_1k_tokens: 0.001
    output_cost_per_1k_tokens: 0.002
  - name: locked
    model_id: acme/locked
    input_cost_per_1k_tokens: 0.001
    output_cost_per_1k_tokens: 0.002
prompts:
  - name: cloud
    description: Cloud explainer
    prompt: What are the key benefits of cloud computing?
  - name: haiku
    prompt: Write a haiku about queues.
"#,
        server.uri()
    );
    let config: Config = Figment::from(Yaml::string(&yaml)).extract().unwrap();
    config.validate().unwrap();
    config
}

fn runner(config: &Config) -> Runner<OpenAiInvoker> {
    let invoker = Arc::new(OpenAiInvoker::new(
        reqwest::Client::new(),
        &config.endpoint,
        config.api_key.clone(),
        config.request_timeout,
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        invoker,
        DispatcherConfig {
            call_timeout: Duration::from_secs(5),
        },
    ));
    Runner::new(dispatcher, config.pricing_table().unwrap(), config.concurrency)
}

#[test_log::test(tokio::test)]
async fn test_full_matrix_against_http_server() {
    let server = MockServer::start().await;
    mount_model(&server, "acme/healthy", ResponseTemplate::new(200).set_body_json(completion("Scalability."))).await;
    mount_model(
        &server,
        "acme/throttled",
        ResponseTemplate::new(429).set_body_json(json!({
            "error": { "message": "Rate limit reached", "type": "requests", "code": "rate_limit_exceeded" }
        })),
    )
    .await;
    mount_model(&server, "acme/broken", ResponseTemplate::new(500).set_body_string("upstream exploded")).await;
    mount_model(
        &server,
        "acme/locked",
        ResponseTemplate::new(401).set_body_json(json!({
            "error": { "message": "Invalid API key", "type": "invalid_request_error", "code": "invalid_api_key" }
        })),
    )
    .await;

    let config = config(&server);
    let selection = Selection::default();
    let items = config.work_items(&selection).unwrap();
    assert_eq!(items.len(), 8);

    let report = runner(&config).run(&items, &CancellationToken::new()).await.unwrap();

    assert!(!report.interrupted);
    assert_eq!(report.groups.len(), 8);
    assert_eq!(server.received_requests().await.unwrap().len(), 48);

    for group in &report.groups {
        let ids: Vec<_> = group.records.iter().map(|record| record.call_id()).collect();
        assert_eq!(ids, (1..=6).collect::<Vec<_>>());
        assert!(group.complete);
    }

    let by_model = report.by_model();
    let stats = |name: &str| &by_model.iter().find(|model| model.model == name).unwrap().stats;

    let healthy = stats("healthy");
    assert_eq!(healthy.total_calls, 12);
    assert_eq!(healthy.successful_calls, 12);
    assert_eq!(healthy.total_input_tokens, 144);
    assert_eq!(healthy.total_output_tokens, 360);
    // 144/1000 * 0.001 + 360/1000 * 0.002
    assert_eq!(healthy.total_cost, Decimal::new(864, 6));
    assert!(healthy.avg_response_time().is_some());

    assert_eq!(stats("throttled").errors.get(ErrorKind::RateLimit), 12);
    assert_eq!(stats("broken").errors.get(ErrorKind::ServiceUnavailable), 12);
    assert_eq!(stats("locked").errors.get(ErrorKind::Authentication), 12);
    assert_eq!(stats("locked").success_rate(), 0.0);
    assert_eq!(stats("locked").avg_response_time(), None);

    let overall = &report.overall.stats;
    assert_eq!(overall.total_calls, 48);
    assert_eq!(overall.successful_calls + overall.errors.total(), overall.total_calls);
    assert_eq!(overall.success_rate(), 0.25);

    let dir = tempfile::tempdir().unwrap();
    let prompts = config.selected_prompts(&selection).unwrap();
    let run_dir = RunWriter::new(dir.path()).write(&report, &prompts).unwrap();

    assert!(run_dir.join("results_overall.csv").is_file());
    assert!(run_dir.join("cloud/prompt_info.json").is_file());
    assert!(run_dir.join("haiku/answers_throttled.json").is_file());

    let answers: serde_json::Value =
        serde_json::from_reader(std::fs::File::open(run_dir.join("cloud/answers_throttled.json")).unwrap()).unwrap();
    let first = &answers["responses"][0];
    assert_eq!(first["success"], false);
    assert_eq!(first["error_kind"], "rate_limit");
    assert!(first["error_message"].as_str().unwrap().contains("Rate limit reached"));
}

#[tokio::test]
async fn test_slow_server_is_classified_as_timeout() {
    let server = MockServer::start().await;
    mount_model(
        &server,
        "acme/healthy",
        ResponseTemplate::new(200)
            .set_body_json(completion("late"))
            .set_delay(Duration::from_secs(10)),
    )
    .await;

    let mut config = config(&server);
    config.request_timeout = Duration::from_millis(200);
    config.number_of_calls = 2;
    let selection = Selection {
        model: Some("healthy".to_string()),
        prompt_name: Some("cloud".to_string()),
        custom_prompt: None,
    };
    let items = config.work_items(&selection).unwrap();

    let report = runner(&config).run(&items, &CancellationToken::new()).await.unwrap();

    let stats = &report.groups[0].summary.stats;
    assert_eq!(stats.errors.timeout, 2);
    assert_eq!(stats.total_cost, Decimal::ZERO);
}

#[tokio::test]
async fn test_unpriced_model_sends_no_requests() {
    let server = MockServer::start().await;
    mount_model(&server, "acme/healthy", ResponseTemplate::new(200).set_body_json(completion("ok"))).await;

    let mut config = config(&server);
    config.models[0].input_cost_per_1k_tokens = None;
    config.models[0].output_cost_per_1k_tokens = None;
    let items = config.work_items(&Selection::default()).unwrap();

    let err = runner(&config).run(&items, &CancellationToken::new()).await.unwrap_err();

    assert!(err.is_configuration());
    assert!(server.received_requests().await.unwrap().is_empty());
}
