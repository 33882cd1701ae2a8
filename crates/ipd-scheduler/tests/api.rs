//! Admin API over a real listener.

mod common;

use std::sync::Arc;

use serde_json::Value;

use common::*;
use ipd_scheduler::api::{self, AppState};

async fn serve_api(env: &TestEnv) -> String {
    let app = api::router(AppState {
        registry: Arc::clone(&env.registry),
        builder: Arc::clone(&env.builder),
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{}", addr)
}

#[tokio::test]
async fn test_project_crud() {
    let env = env(&["hv1"], |_| {}).await;
    let base = serve_api(&env).await;
    let client = reqwest::Client::new();

    // Empty listing, both spellings.
    for path in ["/projects", "/projects/"] {
        let resp = client.get(format!("{}{}", base, path)).send().await.unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.json::<Vec<String>>().await.unwrap(), Vec::<String>::new());
    }

    // Unknown project.
    let resp = client.get(format!("{}/projects/demo", base)).send().await.unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "project-does-not-exist");
    assert_eq!(body["key"], "demo");

    // Register.
    let resp = client
        .put(format!("{}/projects/demo", base))
        .form(&[("repo", "https://github.com/ex/demo.git")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = client.get(format!("{}/projects/demo", base)).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["repo"], "https://github.com/ex/demo.git");

    // Duplicate registration is rejected and does not overwrite.
    let resp = client
        .put(format!("{}/projects/demo", base))
        .form(&[("repo", "https://github.com/ex/other.git")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "project-already-exists");
    assert_eq!(body["key"], "demo");

    let resp = client.get(format!("{}/projects/demo", base)).send().await.unwrap();
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["repo"], "https://github.com/ex/demo.git");

    let resp = client.get(format!("{}/projects/", base)).send().await.unwrap();
    assert_eq!(resp.json::<Vec<String>>().await.unwrap(), vec!["demo"]);

    // Delete, then the key is free again.
    let resp = client.delete(format!("{}/projects/demo", base)).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let resp = client.get(format!("{}/projects/demo", base)).send().await.unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn test_post_build_and_listing() {
    let env = env(&["hv1"], |_| {}).await;
    let base = serve_api(&env).await;
    let client = reqwest::Client::new();

    client
        .put(format!("{}/projects/demo", base))
        .form(&[("repo", "https://github.com/ex/demo.git")])
        .send()
        .await
        .unwrap();

    let resp = client
        .post(format!("{}/builds/", base))
        .form(&[("project_key", "demo"), ("commit_id", "abc")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let build_ref: String = resp.json().await.unwrap();
    assert_eq!(build_ref, "demo-1");

    let resp = client.get(format!("{}/builds/", base)).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let builds: Vec<Value> = resp.json().await.unwrap();
    assert_eq!(builds.len(), 1);
    assert_eq!(builds[0]["id"], 1);
    assert_eq!(builds[0]["project_key"], "demo");
    assert_eq!(builds[0]["commit_id"], "abc");
    // The pairing loop is not running in this test; the build is queued.
    assert_eq!(builds[0]["status"], "waiting");
}

#[tokio::test]
async fn test_post_build_missing_buildspec() {
    let env = env(&["hv1"], |_| {}).await;
    env.fetcher.clear_spec();
    let base = serve_api(&env).await;
    let client = reqwest::Client::new();

    client
        .put(format!("{}/projects/demo", base))
        .form(&[("repo", "https://github.com/ex/demo.git")])
        .send()
        .await
        .unwrap();

    let resp = client
        .post(format!("{}/builds/", base))
        .form(&[("project_key", "demo"), ("commit_id", "abc")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "buildspec-not-found");
    assert_eq!(body["project_key"], "demo");
    assert_eq!(body["commit_id"], "abc");

    // No build id was consumed.
    let resp = client.get(format!("{}/builds/", base)).send().await.unwrap();
    assert_eq!(resp.json::<Vec<Value>>().await.unwrap(), Vec::<Value>::new());
}

#[tokio::test]
async fn test_post_build_unknown_project() {
    let env = env(&["hv1"], |_| {}).await;
    let base = serve_api(&env).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/builds/", base))
        .form(&[("project_key", "ghost"), ("commit_id", "abc")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "project-does-not-exist");
    assert_eq!(body["key"], "ghost");
}
