//! Concurrent clients racing on one cluster

use axum::http::{Method, StatusCode};
use futures::future::join_all;
use serde_json::json;

use super::*;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_creates_admit_exactly_one() {
    let provider = Provider::start().await;
    provider
        .bootstrapped
        .store(false, std::sync::atomic::Ordering::SeqCst);

    let uri = versioned(CLUSTER_URI);
    let results = join_all(
        (0..8).map(|_| provider.send(Method::PUT, &uri, Some(cluster_body()))),
    )
    .await;

    let created = results
        .iter()
        .filter(|(status, _)| *status == StatusCode::CREATED)
        .count();
    assert_eq!(created, 1, "{:?}", results);
    for (status, body) in results.iter().filter(|(s, _)| *s != StatusCode::CREATED) {
        assert_eq!(*status, StatusCode::BAD_REQUEST, "{}", body);
        assert_eq!(body["error"]["code"], "RequestNotAllowed");
    }
    assert_eq!(provider.store.len(), 1);

    provider
        .bootstrapped
        .store(true, std::sync::atomic::Ordering::SeqCst);
    provider.wait_for_state(CLUSTER_URI, "Succeeded").await;
    provider.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_patches_never_lose_an_accepted_write() {
    let provider = Provider::start().await;
    provider
        .send(Method::PUT, &versioned(CLUSTER_URI), Some(cluster_body()))
        .await;
    provider.wait_for_state(CLUSTER_URI, "Succeeded").await;

    let uri = versioned(CLUSTER_URI);
    let results = join_all((0..8).map(|i| {
        let patch = json!({"tags": {"writer": i.to_string()}});
        provider.send(Method::PATCH, &uri, Some(patch))
    }))
    .await;

    let accepted: Vec<&Value> = results
        .iter()
        .filter(|(status, _)| *status == StatusCode::OK)
        .map(|(_, body)| body)
        .collect();
    assert!(!accepted.is_empty());
    for (status, body) in &results {
        assert!(
            *status == StatusCode::OK || *status == StatusCode::BAD_REQUEST,
            "unexpected {}: {}",
            status,
            body
        );
    }

    let body = provider.wait_for_state(CLUSTER_URI, "Succeeded").await;
    let winner = &body["tags"]["writer"];
    assert!(
        accepted.iter().any(|b| &b["tags"]["writer"] == winner),
        "final tags {} came from no accepted write",
        winner
    );

    provider.stop().await;
}
