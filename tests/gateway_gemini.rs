use std::sync::Arc;
use std::time::Duration;

use ccsi_harness::catalog::{EraId, RecordKey};
use ccsi_harness::config::EngineConfig;
use ccsi_harness::dataset::{Dataset, IndicatorRecord};
use ccsi_harness::gateway::gemini::GeminiAdapter;
use ccsi_harness::gateway::{
    Attribution, NoopUsageSink, OracleGateway, OracleRequest, ProviderError, TextProvider,
};
use ccsi_harness::indicators::ScoreVector;
use ccsi_harness::repair::{Provenance, RowRepairEngine};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const MODEL_PATH: &str = "/models/gemini-2.0-flash:generateContent";

fn request(prompt: &str) -> OracleRequest {
    OracleRequest::new("gemini-2.0-flash", prompt, Attribution::new("test"))
}

fn adapter(server: &MockServer) -> GeminiAdapter {
    GeminiAdapter::with_config("g-key", server.uri(), Duration::from_secs(5)).unwrap()
}

#[tokio::test]
async fn gemini_sends_key_in_header_and_joins_candidate_parts() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(MODEL_PATH))
        .and(header("x-goog-api-key", "g-key"))
        .and(body_partial_json(json!({
            "contents": [{ "role": "user", "parts": [{ "text": "score E05 / Deccan" }] }]
        })))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("x-goog-request-id", "g-req-7")
                .set_body_json(json!({
                    "candidates": [{
                        "content": { "parts": [{ "text": "{\"scores\":" }, { "text": " []}" }] },
                        "finishReason": "STOP"
                    }],
                    "usageMetadata": { "promptTokenCount": 12, "candidatesTokenCount": 34 }
                })),
        )
        .mount(&server)
        .await;

    let resp = adapter(&server)
        .generate(&request("score E05 / Deccan"))
        .await
        .unwrap();
    assert_eq!(resp.text, "{\"scores\": []}");
    assert_eq!(resp.input_tokens, 12);
    assert_eq!(resp.output_tokens, 34);
    assert_eq!(resp.request_id.as_deref(), Some("g-req-7"));

    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
    assert!(
        !received[0].url.as_str().contains("g-key"),
        "api key must not appear in the URL"
    );
}

#[tokio::test]
async fn gemini_json_mode_sets_response_mime_type() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(MODEL_PATH))
        .and(body_partial_json(json!({
            "generationConfig": { "temperature": 0.2, "responseMimeType": "application/json" }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "candidates": [{ "content": { "parts": [{ "text": "{}" }] }, "finishReason": "STOP" }]
        })))
        .mount(&server)
        .await;

    let resp = adapter(&server)
        .generate(&request("hi").temperature(0.2).json())
        .await
        .unwrap();
    assert_eq!(resp.text, "{}");
}

#[tokio::test]
async fn gemini_429_honours_retry_after_and_status_code() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(MODEL_PATH))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("retry-after", "7")
                .set_body_json(json!({
                    "error": { "code": 429, "message": "quota", "status": "RESOURCE_EXHAUSTED" }
                })),
        )
        .mount(&server)
        .await;

    let err = adapter(&server).generate(&request("hi")).await.unwrap_err();
    assert!(err.is_retryable());
    match err {
        ProviderError::RateLimited {
            retry_after,
            context: ctx,
            ..
        } => {
            assert_eq!(retry_after, Duration::from_secs(7));
            assert_eq!(ctx.http_status, Some(429));
            assert_eq!(ctx.provider_code.as_deref(), Some("RESOURCE_EXHAUSTED"));
        }
        other => panic!("expected RateLimited, got {other:?}"),
    }
}

#[tokio::test]
async fn gemini_400_is_permanent_and_500_is_retryable() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(MODEL_PATH))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": { "code": 400, "message": "bad model", "status": "INVALID_ARGUMENT" }
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(MODEL_PATH))
        .respond_with(ResponseTemplate::new(500).set_body_string("internal"))
        .mount(&server)
        .await;

    let adapter = adapter(&server);
    let first = adapter.generate(&request("hi")).await.unwrap_err();
    assert!(matches!(first, ProviderError::InvalidRequest { .. }));
    assert!(!first.is_retryable());

    let second = adapter.generate(&request("hi")).await.unwrap_err();
    assert!(second.is_retryable());
    assert_eq!(second.context().and_then(|c| c.http_status), Some(500));
}

#[tokio::test]
async fn gemini_blocked_prompt_is_refused() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(MODEL_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "promptFeedback": { "blockReason": "SAFETY" }
        })))
        .mount(&server)
        .await;

    let err = adapter(&server).generate(&request("hi")).await.unwrap_err();
    assert!(matches!(err, ProviderError::Refused { .. }));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn gemini_empty_candidate_is_retryable_unless_safety_filtered() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(MODEL_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "candidates": [{ "content": { "parts": [] }, "finishReason": "STOP" }]
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(MODEL_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "candidates": [{ "finishReason": "SAFETY" }]
        })))
        .mount(&server)
        .await;

    let adapter = adapter(&server);
    let empty = adapter.generate(&request("hi")).await.unwrap_err();
    assert!(matches!(empty, ProviderError::Provider { .. }));
    assert!(empty.is_retryable());

    let filtered = adapter.generate(&request("hi")).await.unwrap_err();
    assert!(matches!(filtered, ProviderError::Refused { .. }));
}

#[test]
fn gemini_rejects_empty_key() {
    let err = GeminiAdapter::with_config("  ", "http://localhost", Duration::from_secs(1))
        .unwrap_err();
    assert!(matches!(err, ProviderError::Config(_)));
}

fn scored(era: u32, value: u8) -> IndicatorRecord {
    let mut record = IndicatorRecord::placeholder(EraId::historical(era), "Deccan");
    record.set_scores(&ScoreVector::uniform(value));
    record.notes = "Scored.".to_string();
    record
}

#[tokio::test]
async fn hedged_reply_with_valid_payload_is_accepted_by_the_engine() {
    let server = MockServer::start().await;
    let payload = json!({
        "scores": vec![3; 25],
        "notes": "Satavahana patronage of Buddhist and Brahmanical institutions alike kept \
                  Deccan trade guilds open to many communities.",
        "sources": ["Thapar 2002", "Ray 1986", "Sircar 1965"],
    });
    let reply = format!(
        "I cannot verify every figure precisely, but here is my assessment:\n{payload}"
    );

    Mock::given(method("POST"))
        .and(path(MODEL_PATH))
        .and(body_partial_json(json!({
            "generationConfig": { "responseMimeType": "application/json" }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "candidates": [{ "content": { "parts": [{ "text": reply }] }, "finishReason": "STOP" }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let gateway = OracleGateway::new(Box::new(adapter(&server)), "gemini-2.0-flash", Arc::new(NoopUsageSink));
    let engine = RowRepairEngine::new(Arc::new(gateway), &EngineConfig::default());

    let mut failed = IndicatorRecord::placeholder(EraId::historical(5), "Deccan");
    failed.notes = "Parsing failed; placeholder summary.".to_string();
    let dataset = Dataset::from_records(vec![scored(4, 2), failed, scored(6, 4)]).unwrap();

    let row = engine
        .repair_row(&dataset, &RecordKey::new(EraId::historical(5), "Deccan"))
        .await
        .unwrap();
    assert_eq!(row.provenance, Provenance::Oracle);
    assert_eq!(row.attempts, 1);
    assert_eq!(row.scores, ScoreVector::uniform(3));
    assert!(!row.interpolated);
}
