mod common;

use common::TestApp;
use reqwest::Client;
use serial_test::serial;

#[tokio::test]
#[serial]
async fn health_check_works() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };
    let client = Client::new();

    let response = client
        .get(&format!("{}/health", app.http_address))
        .send()
        .await
        .expect("Failed to execute request");

    assert!(response.status().is_success());

    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "payout-service");
}

#[tokio::test]
#[serial]
async fn readiness_check_works() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };
    let client = Client::new();

    let response = client
        .get(&format!("{}/ready", app.http_address))
        .send()
        .await
        .expect("Failed to execute request");

    assert!(response.status().is_success());
}

#[tokio::test]
#[serial]
async fn mutating_routes_require_actor_header() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };
    let client = Client::new();

    let response = client
        .post(&format!("{}/exports", app.http_address))
        .send()
        .await
        .expect("Failed to execute request");

    assert_eq!(response.status().as_u16(), 401);
}
