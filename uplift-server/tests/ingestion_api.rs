use anyhow::Result;
use axum::{
    Router,
    body::{Body, Bytes},
    http::{Method, Request, StatusCode, header},
};
use axum_test::{TestResponse, TestServer};
use serde_json::{Value, json};
use tower::ServiceExt;
use uplift_core::{
    config::PipelineConfig, local::InMemoryPipeline, types::PartitionId,
};
use uplift_server::{config::CorsConfig, routes::create_app, state::AppState};
use url::Url;

async fn test_pipeline() -> Result<InMemoryPipeline> {
    let mut config = PipelineConfig::default();
    config.feed.partitions = 1;
    config.uploads.signing_key = "test-signing-key".to_string().into();
    let pipeline = InMemoryPipeline::new(config)?;
    pipeline
        .scripts
        .publish(include_bytes!("../scripts/process.sh").to_vec())
        .await?;
    Ok(pipeline)
}

fn router(pipeline: &InMemoryPipeline) -> Router {
    create_app(AppState::from_pipeline(pipeline), &CorsConfig::default())
}

fn server(pipeline: &InMemoryPipeline) -> Result<TestServer> {
    TestServer::new(router(pipeline)).map_err(|err| anyhow::anyhow!(err.to_string()))
}

async fn presign(server: &TestServer, file_id: &str) -> Result<Url> {
    let response = server
        .post("/generate-presigned-url")
        .json(&json!({ "fileId": file_id }))
        .await;
    response.assert_status_ok();
    let body: Value = response.json();
    let url = body["url"]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("missing url in {body}"))?;
    Ok(Url::parse(url)?)
}

async fn put_to(server: &TestServer, url: &Url, body: &'static [u8]) -> TestResponse {
    let mut request = server
        .put(url.path())
        .content_type("text/csv")
        .bytes(Bytes::from_static(body));
    for (name, value) in url.query_pairs() {
        request = request.add_query_param(&name, value.as_ref());
    }
    request.await
}

#[tokio::test]
async fn presign_returns_url_and_expiry() -> Result<()> {
    let pipeline = test_pipeline().await?;
    let server = server(&pipeline)?;

    let response = server
        .post("/generate-presigned-url")
        .json(&json!({ "fileId": "f1" }))
        .await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert!(body["expiresAt"].is_string());

    let url = Url::parse(body["url"].as_str().unwrap_or_default())?;
    assert_eq!(url.path(), "/objects/f1");
    let names: Vec<String> = url.query_pairs().map(|(name, _)| name.into_owned()).collect();
    assert_eq!(names, ["expires", "nonce", "signature"]);
    Ok(())
}

#[tokio::test]
async fn presign_rejects_bad_requests() -> Result<()> {
    let pipeline = test_pipeline().await?;
    let server = server(&pipeline)?;

    server
        .post("/generate-presigned-url")
        .json(&json!({}))
        .await
        .assert_status(StatusCode::BAD_REQUEST);
    server
        .post("/generate-presigned-url")
        .json(&json!({ "fileId": "" }))
        .await
        .assert_status(StatusCode::BAD_REQUEST);
    server
        .post("/generate-presigned-url")
        .json(&json!({ "fileId": "../escape" }))
        .await
        .assert_status(StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn issued_location_accepts_exactly_one_write() -> Result<()> {
    let pipeline = test_pipeline().await?;
    let server = server(&pipeline)?;
    let url = presign(&server, "f1").await?;

    put_to(&server, &url, b"a,b,c\n")
        .await
        .assert_status(StatusCode::CREATED);
    put_to(&server, &url, b"x,y,z\n")
        .await
        .assert_status(StatusCode::CONFLICT);

    let response = server.get("/objects/f1").await;
    response.assert_status_ok();
    assert_eq!(response.as_bytes().as_ref(), b"a,b,c\n");
    assert_eq!(response.header(header::CONTENT_TYPE), "text/csv");
    Ok(())
}

#[tokio::test]
async fn tampered_signature_is_forbidden() -> Result<()> {
    let pipeline = test_pipeline().await?;
    let server = server(&pipeline)?;
    let url = presign(&server, "f1").await?;

    // Reuse f1's signature for a different key.
    let mut forged = url.clone();
    forged.set_path("/objects/f2");
    put_to(&server, &forged, b"nope")
        .await
        .assert_status(StatusCode::FORBIDDEN);

    server
        .get("/objects/f2")
        .await
        .assert_status(StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn put_without_signature_params_is_rejected() -> Result<()> {
    let pipeline = test_pipeline().await?;
    let server = server(&pipeline)?;

    let response = server
        .put("/objects/f1")
        .bytes(Bytes::from_static(b"data"))
        .await;
    assert!(response.status_code().is_client_error());
    Ok(())
}

#[tokio::test]
async fn upload_records_metadata() -> Result<()> {
    let pipeline = test_pipeline().await?;
    let server = server(&pipeline)?;

    let response = server
        .post("/upload")
        .json(&json!({ "recordId": "f1", "attributes": { "name": "a.csv" } }))
        .await;
    response.assert_status_ok();
    response.assert_json(&json!({ "recordId": "f1" }));
    assert_eq!(pipeline.store.len().await, 1);

    server
        .post("/upload")
        .json(&json!({ "recordId": "a/b" }))
        .await
        .assert_status(StatusCode::BAD_REQUEST);
    server
        .post("/upload")
        .text("not json")
        .await
        .assert_status(StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn pipeline_status_reports_backlog() -> Result<()> {
    let pipeline = test_pipeline().await?;
    pipeline.runtime.attach().await?;
    let server = server(&pipeline)?;

    server
        .post("/upload")
        .json(&json!({ "recordId": "f1" }))
        .await
        .assert_status_ok();

    let status: Value = server.get("/ops/pipeline").await.json();
    assert_eq!(status["consumer"], "change-handler");
    assert_eq!(status["pending"], 1);
    assert_eq!(status["retrying"], 0);
    assert_eq!(status["deadLetters"], 0);
    assert_eq!(status["partitions"].as_array().map(Vec::len), Some(1));
    Ok(())
}

#[tokio::test]
async fn access_table_lists_invocation_edge() -> Result<()> {
    let pipeline = test_pipeline().await?;
    let server = server(&pipeline)?;

    let body: Value = server.get("/ops/access").await.json();
    let grants = body["grants"].as_array().cloned().unwrap_or_default();
    assert!(
        grants
            .iter()
            .any(|line| line == "change_feed: invoke change_handler")
    );
    Ok(())
}

#[tokio::test]
async fn upload_flow_provisions_a_worker() -> Result<()> {
    let pipeline = test_pipeline().await?;
    pipeline.runtime.attach().await?;
    let server = server(&pipeline)?;

    let url = presign(&server, "f1").await?;
    put_to(&server, &url, b"a,b,c\n")
        .await
        .assert_status(StatusCode::CREATED);
    server
        .post("/upload")
        .json(&json!({ "recordId": "f1", "attributes": { "name": "a.csv" } }))
        .await
        .assert_status_ok();

    let outcome = pipeline
        .runtime
        .process_partition_once(PartitionId(0))
        .await?
        .ok_or_else(|| anyhow::anyhow!("no batch delivered"))?;
    assert_eq!(outcome.acknowledged, 1);
    assert_eq!(pipeline.compute.launch_count().await, 1);

    let dead: Value = server.get("/ops/dead-letters").await.json();
    assert_eq!(dead, json!([]));
    let status: Value = server.get("/ops/pipeline").await.json();
    assert_eq!(status["pending"], 0);
    Ok(())
}

#[tokio::test]
async fn upload_without_object_is_dead_lettered() -> Result<()> {
    let pipeline = test_pipeline().await?;
    pipeline.runtime.attach().await?;
    let server = server(&pipeline)?;

    server
        .post("/upload")
        .json(&json!({ "recordId": "ghost" }))
        .await
        .assert_status_ok();
    pipeline
        .runtime
        .process_partition_once(PartitionId(0))
        .await?;

    let dead: Value = server.get("/ops/dead-letters").await.json();
    let entries = dead.as_array().cloned().unwrap_or_default();
    assert_eq!(entries.len(), 1);
    assert_eq!(pipeline.compute.launch_count().await, 0);
    Ok(())
}

#[tokio::test]
async fn object_routes_allow_any_origin_preflight() -> Result<()> {
    let pipeline = test_pipeline().await?;
    let response = router(&pipeline)
        .oneshot(
            Request::builder()
                .method(Method::OPTIONS)
                .uri("/objects/f1")
                .header(header::ORIGIN, "https://somewhere.example")
                .header(header::ACCESS_CONTROL_REQUEST_METHOD, "PUT")
                .body(Body::empty())?,
        )
        .await?;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN),
        Some(&"*".parse()?)
    );
    Ok(())
}
