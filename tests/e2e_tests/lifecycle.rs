//! A cluster's life through the public API

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::http::{Method, StatusCode};
use serde_json::json;

use mantle_api::{AppState, Environment};
use mantle_common::model::resource_key;
use mantle_install::Dispatcher;
use mantle_store::{DocumentStore, MemoryStore};

use super::*;

#[tokio::test]
async fn create_installs_the_cluster() {
    let provider = Provider::start().await;

    let (status, body) = provider
        .send(Method::PUT, &versioned(CLUSTER_URI), Some(cluster_body()))
        .await;
    assert_eq!(status, StatusCode::CREATED, "{}", body);
    assert_eq!(body["properties"]["provisioningState"], "Creating");
    assert_eq!(body["id"], CLUSTER_URI);
    assert!(body["properties"]["servicePrincipalProfile"]
        .get("clientSecret")
        .is_none());

    let body = provider.wait_for_state(CLUSTER_URI, "Succeeded").await;
    assert_eq!(
        body["properties"]["apiserverUrl"],
        format!("https://api.dev.{}:6443/", ZONE)
    );
    assert!(body["properties"]["consoleUrl"]
        .as_str()
        .is_some_and(|url| url.contains(ZONE)));

    let deployments = provider.arm.deployments.lock().clone();
    assert_eq!(deployments, vec!["storage", "azuredeploy"]);
    assert!(provider.arm.records.lock().contains_key("api.dev"));

    let (status, credentials) = provider
        .send(
            Method::POST,
            &versioned(&format!("{}/credentials", CLUSTER_URI)),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(credentials["kubeadminPassword"]
        .as_str()
        .is_some_and(|p| !p.is_empty()));

    let (status, list) = provider
        .send(Method::GET, &versioned(RESOURCE_GROUP_URI), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list["value"].as_array().map(Vec::len), Some(1));

    provider.stop().await;
}

#[tokio::test]
async fn failed_install_is_retried_by_a_new_put() {
    let provider = Provider::start().await;
    provider.arm.fail_resources.store(true, Ordering::SeqCst);

    let (status, _) = provider
        .send(Method::PUT, &versioned(CLUSTER_URI), Some(cluster_body()))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    provider.wait_for_state(CLUSTER_URI, "Failed").await;

    let doc = provider
        .store
        .get(&resource_key(CLUSTER_URI))
        .await
        .expect("stored");
    let failure = doc.cluster.properties.last_error.expect("failure recorded");
    assert_eq!(failure.stage, "deploy-resources");
    assert!(failure.message.contains("QuotaExceeded"));

    provider.arm.fail_resources.store(false, Ordering::SeqCst);
    let mut body = cluster_body();
    body["properties"]["servicePrincipalProfile"]
        .as_object_mut()
        .expect("profile")
        .remove("clientSecret");
    let (status, body) = provider
        .send(Method::PUT, &versioned(CLUSTER_URI), Some(body))
        .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["properties"]["provisioningState"], "Creating");

    provider.wait_for_state(CLUSTER_URI, "Succeeded").await;
    let doc = provider
        .store
        .get(&resource_key(CLUSTER_URI))
        .await
        .expect("stored");
    assert!(doc.cluster.properties.last_error.is_none());
    assert_eq!(
        doc.cluster
            .properties
            .service_principal_profile
            .client_secret
            .expose(),
        "s3cret"
    );

    provider.stop().await;
}

#[tokio::test]
async fn update_returns_to_succeeded() {
    let provider = Provider::start().await;
    provider
        .send(Method::PUT, &versioned(CLUSTER_URI), Some(cluster_body()))
        .await;
    provider.wait_for_state(CLUSTER_URI, "Succeeded").await;

    let patch = json!({"properties": {"workerProfiles": [{
        "name": "worker",
        "vmSize": "Standard_D4s_v3",
        "diskSizeGB": 128,
        "subnetId": cluster_body()["properties"]["workerProfiles"][0]["subnetId"],
        "count": 5,
    }]}});
    let (status, body) = provider
        .send(Method::PATCH, &versioned(CLUSTER_URI), Some(patch))
        .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["properties"]["provisioningState"], "Updating");
    assert_eq!(body["tags"]["team"], "platform");

    let body = provider.wait_for_state(CLUSTER_URI, "Succeeded").await;
    assert_eq!(body["properties"]["workerProfiles"][0]["count"], 5);

    provider.stop().await;
}

#[tokio::test]
async fn delete_tears_the_cluster_down() {
    let provider = Provider::start().await;
    provider
        .send(Method::PUT, &versioned(CLUSTER_URI), Some(cluster_body()))
        .await;
    provider.wait_for_state(CLUSTER_URI, "Succeeded").await;

    let (status, _) = provider
        .send(Method::DELETE, &versioned(CLUSTER_URI), None)
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    provider.wait_for_absent(CLUSTER_URI).await;

    assert_eq!(provider.arm.deleted_groups.lock().clone(), vec!["dev"]);
    assert!(provider.arm.records.lock().is_empty());

    let (status, _) = provider
        .send(Method::DELETE, &versioned(CLUSTER_URI), None)
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    provider.stop().await;
}

#[tokio::test]
async fn busy_clusters_refuse_conflicting_requests() {
    let provider = Provider::start().await;
    provider.bootstrapped.store(false, Ordering::SeqCst);

    let (status, _) = provider
        .send(Method::PUT, &versioned(CLUSTER_URI), Some(cluster_body()))
        .await;
    assert_eq!(status, StatusCode::CREATED);

    for method in [Method::DELETE, Method::PATCH] {
        let body = (method == Method::PATCH).then(|| json!({"tags": {"team": "other"}}));
        let (status, body) = provider.send(method, &versioned(CLUSTER_URI), body).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "RequestNotAllowed");
    }
    let (status, _) = provider
        .send(
            Method::POST,
            &versioned(&format!("{}/credentials", CLUSTER_URI)),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    provider.bootstrapped.store(true, Ordering::SeqCst);
    let body = provider.wait_for_state(CLUSTER_URI, "Succeeded").await;
    assert_eq!(body["tags"]["team"], "platform");

    provider.stop().await;
}

/// Accepts requests without running anything, like a frontend whose
/// backend died
#[derive(Default)]
struct DroppingDispatcher;

impl Dispatcher for DroppingDispatcher {
    fn dispatch(&self, _key: &str) {}
}

#[tokio::test]
async fn restart_resumes_interrupted_installs() {
    let store = Arc::new(MemoryStore::new());
    let state = AppState::new(
        store.clone(),
        Arc::new(DroppingDispatcher),
        Arc::new(Environment::Development),
        LOCATION,
        TENANT,
    );
    state.mark_ready();
    let request = axum::http::Request::builder()
        .method(Method::PUT)
        .uri(versioned(CLUSTER_URI))
        .header("content-type", "application/json")
        .body(axum::body::Body::from(cluster_body().to_string()))
        .expect("request");
    let response = mantle_api::router(state)
        .oneshot(request)
        .await
        .expect("router is infallible");
    assert_eq!(response.status(), StatusCode::CREATED);

    let provider = Provider::with_store(store).await;
    let resumed = provider
        .backend
        .recover(provider.dispatcher.as_ref())
        .await
        .expect("recover");
    assert_eq!(resumed, 1);
    provider.wait_for_state(CLUSTER_URI, "Succeeded").await;

    let resumed = provider
        .backend
        .recover(provider.dispatcher.as_ref())
        .await
        .expect("recover");
    assert_eq!(resumed, 0);

    provider.stop().await;
}
