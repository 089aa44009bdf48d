//! Integration tests for the coordination API, in-process and over HTTP

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use http_body_util::BodyExt;
use pachyderm_backup_operator::handler::{
    api, BackupEnvelope, CoordinationApi, HandlerClient, Job, JobMeta, JobStore, RestoreEnvelope,
    RestorePhase,
};
use pachyderm_backup_operator::Error;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;
use uuid::Uuid;

async fn store() -> (Arc<JobStore>, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = JobStore::open(dir.path().join("backup.db")).await.unwrap();
    (Arc::new(store), dir)
}

async fn call(store: &Arc<JobStore>, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    let request = match body {
        Some(body) => request.body(Body::from(body.to_string())).unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };

    let response = api::router(store.clone()).oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

/// Serve the router on an ephemeral port and return its base URL
async fn serve(store: Arc<JobStore>) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, api::router(store)).await.unwrap();
    });
    format!("http://{}", addr)
}

#[tokio::test]
async fn health_reports_ok() {
    let (store, _dir) = store().await;
    let (status, body) = call(&store, Method::GET, "/healthz", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn backup_lifecycle_over_routes() {
    let (store, _dir) = store().await;

    let (status, created) = call(
        &store,
        Method::POST,
        "/backup",
        Some(json!({
            "name": "nightly",
            "namespace": "ml",
            "pod": "postgres-0",
            "container": "postgres",
            "command": ["pg_dumpall", "--clean"],
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = created["id"].as_str().unwrap().to_string();
    assert!(created.get("deleted_at").is_none());

    let (status, batch) = call(&store, Method::GET, "/next-batch?limit=5", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(batch["items"].as_array().unwrap().len(), 1);

    let mut update = created.clone();
    update["location"] = json!("/tmp/nightly-202401021504.sql.gz");
    update["state"] = json!("Completed");
    let (status, updated) = call(&store, Method::PUT, "/backup", Some(update)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["state"], "Completed");

    let (status, found) = call(
        &store,
        Method::GET,
        "/backup?location=/tmp/nightly-202401021504.sql.gz",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(found["id"], id.as_str());

    let (status, deleted) = call(&store, Method::DELETE, &format!("/backup/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(deleted["deleted_at"].is_string());

    let (_, batch) = call(&store, Method::GET, "/next-batch", None).await;
    assert!(batch["items"].as_array().unwrap().is_empty());

    let (status, fetched) = call(&store, Method::GET, &format!("/backup/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["deleted_at"], deleted["deleted_at"]);
}

#[tokio::test]
async fn errors_carry_status_and_message() {
    let (store, _dir) = store().await;

    let (status, body) = call(&store, Method::GET, &format!("/backup/{}", Uuid::new_v4()), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().starts_with("Not found"));

    let (status, _) = call(&store, Method::GET, "/backup", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(&store, Method::PUT, "/restores", Some(json!({ "name": "no-id" }))).await;
    assert!(status.is_client_error());

    let id = Uuid::new_v4();
    let body = json!({ "id": id, "name": "nightly", "namespace": "ml" });
    let (status, _) = call(&store, Method::POST, "/backup", Some(body.clone())).await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, _) = call(&store, Method::POST, "/backup", Some(body)).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn backup_without_a_usable_name_is_a_bad_request() {
    let (store, _dir) = store().await;

    for name in ["", "a/b"] {
        let body = json!({ "name": name, "namespace": "ml", "pod": "postgres-0" });
        let (status, body) = call(&store, Method::POST, "/backup", Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().starts_with("Validation error"));
    }

    let (_, batch) = call(&store, Method::GET, "/next-batch?limit=5", None).await;
    assert!(batch["items"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn client_round_trips_against_a_live_server() {
    let (store, _dir) = store().await;
    let client = HandlerClient::new(serve(store.clone()).await).unwrap();

    let created = client
        .create_backup(&BackupEnvelope::new(
            "nightly",
            "ml",
            "postgres-0",
            "postgres",
            vec!["pg_dumpall".to_string()],
        ))
        .await
        .unwrap();
    let id = created.require_id().unwrap();
    assert_eq!(client.get_backup(id).await.unwrap(), created);
    assert_eq!(client.next_backup_batch(5).await.unwrap().len(), 1);
    assert!(client.find_backup("/tmp/none.sql.gz").await.unwrap().is_none());

    let done = client.delete_backup(id).await.unwrap();
    assert!(done.is_done());

    let err = client.get_restore(Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));

    let err = client.create_backup(&created).await.unwrap_err();
    assert!(matches!(err, Error::DuplicateId(_)));
}

#[tokio::test]
async fn client_restore_flow() {
    let (store, _dir) = store().await;
    let client = HandlerClient::new(serve(store).await).unwrap();

    let created = client
        .create_restore(&RestoreEnvelope {
            meta: JobMeta::new("restore-1", "ml"),
            destination_name: "pachyderm-restored".to_string(),
            destination_namespace: "ml".to_string(),
            backup_location: "/tmp/nightly-202401021504.sql.gz".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(created.phase, RestorePhase::Pending);

    let mut prepared = created.clone();
    prepared.phase = RestorePhase::Prepared;
    prepared.database = Some("c2VsZWN0IDE7".to_string());
    prepared.kubernetes_resource = Some("e30=".to_string());
    client.update_restore(&prepared).await.unwrap();
    assert!(client.next_restore_batch(5).await.unwrap().is_empty());

    let id = created.require_id().unwrap();
    let fetched = client.get_restore(id).await.unwrap();
    assert_eq!(fetched.phase, RestorePhase::Prepared);
    assert!(fetched.has_contents());

    assert!(client.delete_restore(id).await.unwrap().is_done());
}

#[tokio::test]
async fn unreachable_handler_is_a_connection_error() {
    let client = HandlerClient::new("http://127.0.0.1:1").unwrap();
    let err = client.next_backup_batch(5).await.unwrap_err();
    assert!(matches!(err, Error::Connection(_)));
}
