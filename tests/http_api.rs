//! HTTP surface tests: the router is driven in process with `oneshot`
//! requests against an engine built on fakes.

mod common;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use common::{test_engine, TEST_ADMIN_KEY};
use http_body_util::BodyExt;
use ragd::{build_router, AppState};
use tower::ServiceExt;

const RESUME_TEXT: &str = "Worked five years as a systems engineer. \
Built storage engines and network services in production.";

async fn test_app(reply: &str) -> (Router, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let (engine, config) = test_engine(dir.path(), reply).await;
    let app = build_router(AppState { engine, config });
    (app, dir)
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn multipart_upload(filename: &str, content: &str) -> Request<Body> {
    let boundary = "ragd-test-boundary";
    let body = format!(
        "--{boundary}\r\n\
         Content-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\n\
         Content-Type: text/plain\r\n\r\n\
         {content}\r\n\
         --{boundary}--\r\n"
    );

    Request::builder()
        .method("POST")
        .uri("/ingest")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={boundary}"),
        )
        .header("X-Admin-Key", TEST_ADMIN_KEY)
        .body(Body::from(body))
        .unwrap()
}

fn json_post(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn health_reports_connected_services() {
    let (app, _dir) = test_app("ok").await;

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["services"]["llm"], "connected");
    assert_eq!(json["services"]["vector_store"], "connected");
    assert!(json["version"].is_string());
    assert!(json["timestamp"].is_string());
}

#[tokio::test]
async fn liveness_and_readiness_probes_respond() {
    let (app, _dir) = test_app("ok").await;

    for (uri, field) in [("/health/ready", "ready"), ("/health/live", "alive")] {
        let response = app
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], field);
    }
}

#[tokio::test]
async fn admin_routes_reject_missing_wrong_and_short_keys() {
    let (app, _dir) = test_app("ok").await;

    // Missing header.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/admin/documents/anything")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Wrong key.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/admin/stats")
                .header("X-Admin-Key", "wrong-key-wrong-key-wrong")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Key below the minimum length can never match.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/admin/documents")
                .header("X-Admin-Key", "short")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // No side effects: the collection is still empty.
    let response = app
        .oneshot(
            Request::builder()
                .uri("/admin/stats")
                .header("X-Admin-Key", TEST_ADMIN_KEY)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["total_documents"], 0);
}

#[tokio::test]
async fn ingest_then_stats_then_delete_roundtrip() {
    let (app, _dir) = test_app("ok").await;

    let response = app
        .clone()
        .oneshot(multipart_upload("resume.txt", RESUME_TEXT))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["success"], true);
    let document_id = json["document"]["document_id"].as_str().unwrap().to_string();
    let chunk_count = json["document"]["chunk_count"].as_i64().unwrap();
    assert!(document_id.starts_with("doc_"));
    assert!(chunk_count >= 1);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/admin/stats")
                .header("X-Admin-Key", TEST_ADMIN_KEY)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let stats = body_json(response).await;
    assert_eq!(stats["total_documents"], 1);
    assert_eq!(stats["total_chunks"], chunk_count);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/admin/documents")
                .header("X-Admin-Key", TEST_ADMIN_KEY)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let listing = body_json(response).await;
    assert_eq!(listing["total_count"], 1);
    assert_eq!(listing["documents"][0]["filename"], "resume.txt");

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/admin/documents/{document_id}"))
                .header("X-Admin-Key", TEST_ADMIN_KEY)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["success"], true);
    assert_eq!(json["deleted_chunks"].as_i64().unwrap(), chunk_count);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/admin/stats")
                .header("X-Admin-Key", TEST_ADMIN_KEY)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(body_json(response).await["total_chunks"], 0);
}

#[tokio::test]
async fn ingest_without_a_file_part_is_a_bad_request() {
    let (app, _dir) = test_app("ok").await;

    let boundary = "ragd-test-boundary";
    let body = format!(
        "--{boundary}\r\n\
         Content-Disposition: form-data; name=\"note\"\r\n\r\n\
         just a text field\r\n\
         --{boundary}--\r\n"
    );

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/ingest")
                .header(
                    header::CONTENT_TYPE,
                    format!("multipart/form-data; boundary={boundary}"),
                )
                .header("X-Admin-Key", TEST_ADMIN_KEY)
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn ingest_of_unsupported_format_is_a_client_error() {
    let (app, _dir) = test_app("ok").await;

    let response = app
        .oneshot(multipart_upload("page.html", "<html></html>"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let json = body_json(response).await;
    assert_eq!(json["error"]["code"], "unsupported_format");
}

#[tokio::test]
async fn chat_returns_answer_with_sources() {
    let (app, _dir) = test_app("They built storage engines.").await;

    let response = app
        .clone()
        .oneshot(multipart_upload("resume.txt", RESUME_TEXT))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(json_post(
            "/chat",
            serde_json::json!({
                "message": "what did they build as a systems engineer?",
                "history": [
                    {"role": "user", "content": "hi"},
                    {"role": "assistant", "content": "hello"}
                ]
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["response"], "They built storage engines.");
    assert_eq!(json["sources"][0], "resume.txt");
}

#[tokio::test]
async fn empty_and_oversized_chat_messages_are_rejected() {
    let (app, _dir) = test_app("ok").await;

    let response = app
        .clone()
        .oneshot(json_post("/chat", serde_json::json!({"message": "   "})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let long = "x".repeat(4001);
    let response = app
        .oneshot(json_post("/chat", serde_json::json!({ "message": long })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn chat_stream_frames_tokens_and_ends_with_sources() {
    let reply = "The resume covers systems engineering.";
    let (app, _dir) = test_app(reply).await;

    let response = app
        .clone()
        .oneshot(multipart_upload("resume.txt", RESUME_TEXT))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(json_post(
            "/chat/stream",
            serde_json::json!({"message": "summarize the resume", "history": []}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response
        .headers()
        .get(header::CONTENT_TYPE)
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(bytes.to_vec()).unwrap();

    let frames: Vec<&str> = text
        .lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .collect();
    assert!(frames.len() >= 3, "expected token, terminal and DONE frames");
    assert_eq!(*frames.last().unwrap(), "[DONE]");

    let mut streamed = String::new();
    let mut saw_terminal = false;
    for frame in &frames[..frames.len() - 1] {
        let json: serde_json::Value = serde_json::from_str(frame).unwrap();
        if json["done"].as_bool().unwrap() {
            saw_terminal = true;
            assert_eq!(json["chunk"], "");
            assert_eq!(json["sources"][0], "resume.txt");
        } else {
            assert!(!saw_terminal, "tokens after the terminal frame");
            assert!(json["sources"].is_null());
            streamed.push_str(json["chunk"].as_str().unwrap());
        }
    }

    assert!(saw_terminal);
    assert_eq!(streamed, reply);
}

#[tokio::test]
async fn stream_of_empty_message_is_rejected_before_streaming() {
    let (app, _dir) = test_app("ok").await;

    let response = app
        .oneshot(json_post("/chat/stream", serde_json::json!({"message": ""})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn reset_clears_the_collection() {
    let (app, _dir) = test_app("ok").await;

    let response = app
        .clone()
        .oneshot(multipart_upload("resume.txt", RESUME_TEXT))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/admin/reset")
                .header("X-Admin-Key", TEST_ADMIN_KEY)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/admin/stats")
                .header("X-Admin-Key", TEST_ADMIN_KEY)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(body_json(response).await["total_documents"], 0);
}
