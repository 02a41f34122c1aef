mod common;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::extract::DefaultBodyLimit;
use axum::http::{Request, Response, StatusCode, header};
use serde::de::DeserializeOwned;
use tower::util::ServiceExt;
use uuid::Uuid;

use parley_api::AppState;
use parley_api::router::router;
use parley_types::api::{ChatThreadResponse, SendMessageResponse, TokenResponse};
use parley_types::models::{ChatMessage, ChatThread, FileMetadata, MessageType, ThreadMember};

async fn test_app() -> (tempfile::TempDir, Router, AppState) {
    let (dir, state) = common::test_state().await;
    let app = router(state.clone()).layer(DefaultBodyLimit::max(6 * 1024 * 1024));
    (dir, app, state)
}

async fn json_body<T: DeserializeOwned>(resp: Response<Body>) -> T {
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.expect("body");
    serde_json::from_slice(&bytes).expect("json body")
}

fn get(path: &str, auth: &str) -> Request<Body> {
    Request::builder()
        .uri(path)
        .header(header::AUTHORIZATION, auth)
        .body(Body::empty())
        .expect("request")
}

fn post_empty(path: &str, auth: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header(header::AUTHORIZATION, auth)
        .body(Body::empty())
        .expect("request")
}

async fn issue_token(app: &Router, user: &str) -> TokenResponse {
    let resp = app
        .clone()
        .oneshot(get("/userToken", user))
        .await
        .expect("response");
    assert_eq!(resp.status(), StatusCode::OK);
    json_body(resp).await
}

async fn join(app: &Router, group: &str, user: &str) -> StatusCode {
    app.clone()
        .oneshot(post_empty(&format!("/groups/{}/user", group), user))
        .await
        .expect("response")
        .status()
}

async fn thread_for(app: &Router, group: &str, user: &str) -> Uuid {
    let resp = app
        .clone()
        .oneshot(get(&format!("/groups/{}/chatThread", group), user))
        .await
        .expect("response");
    assert_eq!(resp.status(), StatusCode::OK);
    let body: ChatThreadResponse = json_body(resp).await;
    body.thread_id
}

#[tokio::test]
async fn token_requires_an_identity_header() {
    let (_dir, app, _state) = test_app().await;

    let resp = app
        .clone()
        .oneshot(Request::builder().uri("/userToken").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn token_issuance_is_stable_per_identity() {
    let (_dir, app, _state) = test_app().await;

    let first = issue_token(&app, "alice").await;
    let second = issue_token(&app, "alice").await;
    assert_eq!(first.user_id, second.user_id);

    let other = issue_token(&app, "bob").await;
    assert_ne!(first.user_id, other.user_id);
}

#[tokio::test]
async fn join_group_gates_and_is_idempotent() {
    let (_dir, app, _state) = test_app().await;

    // Unknown identity: no token was ever issued.
    assert_eq!(join(&app, "g1", "stranger").await, StatusCode::FORBIDDEN);

    issue_token(&app, "alice").await;
    assert_eq!(join(&app, "g1", "alice").await, StatusCode::CREATED);
    assert_eq!(join(&app, "g1", "alice").await, StatusCode::CONFLICT);
}

#[tokio::test]
async fn chat_thread_resolution_requires_membership() {
    let (_dir, app, _state) = test_app().await;

    issue_token(&app, "alice").await;
    issue_token(&app, "carol").await;
    assert_eq!(join(&app, "g1", "alice").await, StatusCode::CREATED);

    let _thread = thread_for(&app, "g1", "alice").await;

    // carol has a token but never joined the group.
    let resp = app
        .clone()
        .oneshot(get("/groups/g1/chatThread", "carol"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn message_send_confirm_and_fetch_roundtrip() {
    let (_dir, app, _state) = test_app().await;

    let token = issue_token(&app, "alice").await;
    assert_eq!(join(&app, "g1", "alice").await, StatusCode::CREATED);
    let thread_id = thread_for(&app, "g1", "alice").await;
    let bearer = format!("Bearer {}", token.token);

    // Thread info carries the version used as the send precondition.
    let resp = app
        .clone()
        .oneshot(get(&format!("/threads/{}", thread_id), &bearer))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let thread: ChatThread = json_body(resp).await;
    assert_eq!(thread.version, 2); // moderator + alice

    let send = Request::builder()
        .method("POST")
        .uri(format!("/threads/{}/messages", thread_id))
        .header(header::AUTHORIZATION, &bearer)
        .header(header::IF_MATCH, thread.version.to_string())
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            serde_json::json!({
                "content": "hello",
                "sender_display_name": "Alice",
            })
            .to_string(),
        ))
        .unwrap();
    let resp = app.clone().oneshot(send).await.unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let created: SendMessageResponse = json_body(resp).await;

    let resp = app
        .clone()
        .oneshot(get(
            &format!("/threads/{}/messages/{}", thread_id, created.id),
            &bearer,
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let message: ChatMessage = json_body(resp).await;
    assert_eq!(message.content, "hello");
    assert_eq!(message.sender_display_name, "Alice");
    assert_eq!(message.sender_id, token.user_id);

    // Members list shows the moderator plus alice.
    let resp = app
        .clone()
        .oneshot(get(&format!("/threads/{}/members", thread_id), &bearer))
        .await
        .unwrap();
    let members: Vec<ThreadMember> = json_body(resp).await;
    assert_eq!(members.len(), 2);
}

#[tokio::test]
async fn stale_version_precondition_fails_the_send() {
    let (_dir, app, _state) = test_app().await;

    let token = issue_token(&app, "alice").await;
    assert_eq!(join(&app, "g1", "alice").await, StatusCode::CREATED);
    let thread_id = thread_for(&app, "g1", "alice").await;
    let bearer = format!("Bearer {}", token.token);

    let send = Request::builder()
        .method("POST")
        .uri(format!("/threads/{}/messages", thread_id))
        .header(header::AUTHORIZATION, &bearer)
        .header(header::IF_MATCH, "0")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            serde_json::json!({
                "content": "hello",
                "sender_display_name": "Alice",
            })
            .to_string(),
        ))
        .unwrap();
    let resp = app.clone().oneshot(send).await.unwrap();
    assert_eq!(resp.status(), StatusCode::PRECONDITION_FAILED);
}

#[tokio::test]
async fn thread_routes_reject_missing_and_foreign_tokens() {
    let (_dir, app, _state) = test_app().await;

    let _alice = issue_token(&app, "alice").await;
    let bob = issue_token(&app, "bob").await;
    assert_eq!(join(&app, "g1", "alice").await, StatusCode::CREATED);
    let thread_id = thread_for(&app, "g1", "alice").await;

    // No bearer token at all.
    let resp = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/threads/{}", thread_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    // bob is authenticated but not a member of alice's thread.
    let resp = app
        .clone()
        .oneshot(get(
            &format!("/threads/{}", thread_id),
            &format!("Bearer {}", bob.token),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn send_budget_exhaustion_returns_too_many_requests() {
    let (_dir, state) = common::test_state_with_limit(2).await;
    let app = router(state.clone());

    let token = issue_token(&app, "alice").await;
    assert_eq!(join(&app, "g1", "alice").await, StatusCode::CREATED);
    let thread_id = thread_for(&app, "g1", "alice").await;
    let bearer = format!("Bearer {}", token.token);

    let mut statuses = Vec::new();
    for i in 0..3 {
        let send = Request::builder()
            .method("POST")
            .uri(format!("/threads/{}/messages", thread_id))
            .header(header::AUTHORIZATION, &bearer)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                serde_json::json!({
                    "content": format!("m{}", i),
                    "sender_display_name": "Alice",
                })
                .to_string(),
            ))
            .unwrap();
        statuses.push(app.clone().oneshot(send).await.unwrap().status());
    }

    assert_eq!(
        statuses,
        vec![
            StatusCode::CREATED,
            StatusCode::CREATED,
            StatusCode::TOO_MANY_REQUESTS
        ]
    );
}

fn multipart_upload(path: &str, auth: &str, file_name: &str, contents: &[u8]) -> Request<Body> {
    let boundary = "parley-test-boundary";
    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(contents);
    body.extend_from_slice(
        format!(
            "\r\n--{boundary}\r\nContent-Disposition: form-data; name=\"filename\"\r\n\r\n{file_name}\r\n--{boundary}--\r\n"
        )
        .as_bytes(),
    );

    Request::builder()
        .method("POST")
        .uri(path)
        .header(header::AUTHORIZATION, auth)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={boundary}"),
        )
        .body(Body::from(body))
        .expect("request")
}

#[tokio::test]
async fn file_upload_lists_downloads_and_announces() {
    let (_dir, app, _state) = test_app().await;

    let token = issue_token(&app, "alice").await;
    assert_eq!(join(&app, "g1", "alice").await, StatusCode::CREATED);
    let thread_id = thread_for(&app, "g1", "alice").await;

    let resp = app
        .clone()
        .oneshot(multipart_upload(
            "/groups/g1/files",
            "alice",
            "notes.txt",
            b"meeting notes",
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);

    // Listed, newest first.
    let resp = app.clone().oneshot(get("/groups/g1/files", "alice")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let files: Vec<FileMetadata> = json_body(resp).await;
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].name, "notes.txt");

    // Download streams the original bytes with an attachment filename.
    let resp = app
        .clone()
        .oneshot(get(&format!("/groups/g1/files/{}", files[0].id), "alice"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let disposition = resp
        .headers()
        .get(header::CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert!(disposition.contains("notes.txt"));
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..], b"meeting notes");

    // The upload was announced in the group's chat thread.
    let resp = app
        .clone()
        .oneshot(get(
            &format!("/threads/{}/messages", thread_id),
            &format!("Bearer {}", token.token),
        ))
        .await
        .unwrap();
    let messages: Vec<ChatMessage> = json_body(resp).await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].message_type, MessageType::Event);
    assert!(messages[0].content.contains("fileUploaded"));
    assert!(messages[0].content.contains("notes.txt"));
}

#[tokio::test]
async fn base64_image_upload_is_accepted() {
    let (_dir, app, _state) = test_app().await;

    issue_token(&app, "alice").await;
    assert_eq!(join(&app, "g1", "alice").await, StatusCode::CREATED);

    let boundary = "parley-test-boundary";
    let body = format!(
        "--{boundary}\r\nContent-Disposition: form-data; name=\"image\"\r\n\r\naGVsbG8=\r\n--{boundary}\r\nContent-Disposition: form-data; name=\"fileName\"\r\n\r\nuser_photo.png\r\n--{boundary}--\r\n"
    );
    let req = Request::builder()
        .method("POST")
        .uri("/groups/g1/files")
        .header(header::AUTHORIZATION, "alice")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={boundary}"),
        )
        .body(Body::from(body))
        .unwrap();

    let resp = app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);

    let resp = app.clone().oneshot(get("/groups/g1/files", "alice")).await.unwrap();
    let files: Vec<FileMetadata> = json_body(resp).await;
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].name, "user_photo.png");
}

#[tokio::test]
async fn uploads_reject_bad_payloads_and_non_members() {
    let (_dir, app, _state) = test_app().await;

    issue_token(&app, "alice").await;
    issue_token(&app, "mallory").await;
    assert_eq!(join(&app, "g1", "alice").await, StatusCode::CREATED);

    // Not a member of g1.
    let resp = app
        .clone()
        .oneshot(multipart_upload("/groups/g1/files", "mallory", "x.txt", b"x"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    // Neither file nor image present.
    let boundary = "parley-test-boundary";
    let body = format!(
        "--{boundary}\r\nContent-Disposition: form-data; name=\"filename\"\r\n\r\nx.txt\r\n--{boundary}--\r\n"
    );
    let req = Request::builder()
        .method("POST")
        .uri("/groups/g1/files")
        .header(header::AUTHORIZATION, "alice")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={boundary}"),
        )
        .body(Body::from(body))
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    // Over the 5 MB ceiling.
    let oversized = vec![0u8; 5 * 1024 * 1024 + 1];
    let resp = app
        .clone()
        .oneshot(multipart_upload("/groups/g1/files", "alice", "big.bin", &oversized))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
}
