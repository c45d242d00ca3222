// SPDX-FileCopyrightText: © 2025 Orchard Contributors
//
// SPDX-License-Identifier: MPL-2.0

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::disallowed_macros,
    clippy::uninlined_format_args
)]

//! REST surface semantics: authentication, permission filtering and the
//! lifecycle events that machine mutations push into the stream fabric.

use futures_util::StreamExt;
use orchard_server::auth::Capability;
use orchard_server::sandbox::{MachineSeed, SandboxBackend};
use orchard_server::Config;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

async fn start_test_server(backend: &Arc<SandboxBackend>) -> Option<SocketAddr> {
    let listener = match TcpListener::bind("127.0.0.1:0").await {
        Ok(listener) => listener,
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => return None,
        Err(e) => panic!("Failed to bind test server listener: {e}"),
    };
    let addr = listener.local_addr().unwrap();

    let (app, _state) = orchard_server::server::create_app(Config::default(), SandboxBackend::services(&backend));
    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service()).await.unwrap();
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    Some(addr)
}

#[tokio::test]
async fn machine_listing_requires_authentication_and_capability() {
    let backend = SandboxBackend::new();
    backend.add_machine(MachineSeed::default());
    let (_user, mortal_token) = backend.add_user("mortal", []);
    let (_admin, admin_token) = backend.add_user("admin", [Capability::ViewAllVms]);

    let Some(addr) = start_test_server(&backend).await else {
        eprintln!("Skipping REST tests: local TCP bind not permitted");
        return;
    };
    let client = reqwest::Client::new();

    // No token at all.
    let response =
        client.get(format!("http://{addr}/api/v1/machines/global")).send().await.unwrap();
    assert_eq!(response.status(), 401);

    // Authenticated but unprivileged.
    let response = client
        .get(format!("http://{addr}/api/v1/machines/global"))
        .bearer_auth(&mortal_token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);

    // Privileged: every managed machine is present.
    let response = client
        .get(format!("http://{addr}/api/v1/machines/global"))
        .bearer_auth(&admin_token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let machines: HashMap<String, serde_json::Value> = response.json().await.unwrap();
    assert_eq!(machines.len(), 1);
}

#[tokio::test]
async fn account_listing_is_scoped_to_linkage() {
    let backend = SandboxBackend::new();
    let (owner, token) = backend.add_user("owner", []);
    let mine = backend.add_machine(MachineSeed { owner: Some(owner), ..MachineSeed::default() });
    backend.add_machine(MachineSeed::default());

    let Some(addr) = start_test_server(&backend).await else {
        eprintln!("Skipping REST tests: local TCP bind not permitted");
        return;
    };

    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{addr}/api/v1/machines/account"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let machines: HashMap<String, serde_json::Value> = response.json().await.unwrap();
    assert_eq!(machines.len(), 1);
    assert!(machines.contains_key(&mine.to_string()));
}

#[tokio::test]
async fn single_machine_fetch_enforces_access() {
    let backend = SandboxBackend::new();
    let (owner, owner_token) = backend.add_user("owner", []);
    let (_other, other_token) = backend.add_user("other", []);
    let machine = backend.add_machine(MachineSeed { owner: Some(owner), ..MachineSeed::default() });

    let Some(addr) = start_test_server(&backend).await else {
        eprintln!("Skipping REST tests: local TCP bind not permitted");
        return;
    };
    let client = reqwest::Client::new();

    // Unknown machine.
    let response = client
        .get(format!("http://{addr}/api/v1/machines/{}", uuid::Uuid::new_v4()))
        .bearer_auth(&owner_token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    // Not linked, not privileged.
    let response = client
        .get(format!("http://{addr}/api/v1/machines/{machine}"))
        .bearer_auth(&other_token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);

    // Linked.
    let response = client
        .get(format!("http://{addr}/api/v1/machines/{machine}"))
        .bearer_auth(&owner_token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let properties: serde_json::Value = response.json().await.unwrap();
    assert_eq!(properties["uuid"], machine.to_string());
    assert_eq!(properties["owner"]["username"], "owner");
}

#[tokio::test]
async fn failed_start_surfaces_500_and_emits_bootup_fail() {
    let backend = SandboxBackend::new();
    let (owner, token) = backend.add_user("owner", []);
    let machine = backend.add_machine(MachineSeed { owner: Some(owner), ..MachineSeed::default() });
    backend.inject_start_failure(machine);

    let Some(addr) = start_test_server(&backend).await else {
        eprintln!("Skipping REST tests: local TCP bind not permitted");
        return;
    };

    // Watch the machine through a per-machine stream session.
    let (stream, _) = connect_async(format!(
        "ws://{addr}/ws/machines/subscribed?machine_uuid={machine}&access_token={token}"
    ))
    .await
    .unwrap();
    let (_write, mut read) = stream.split();
    for _ in 0..3 {
        let _ = timeout(Duration::from_secs(5), read.next()).await.unwrap();
    }

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{addr}/api/v1/machines/start/{machine}"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 500);

    // The session observes the attempt and its failure, in order.
    for wanted in ["BOOTUP_START", "BOOTUP_FAIL"] {
        let message = timeout(Duration::from_secs(5), read.next())
            .await
            .expect("Timed out waiting for event")
            .unwrap()
            .unwrap();
        let WsMessage::Text(text) = message else { panic!("Expected text frame") };
        let frame: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(frame["type"], wanted);
        if wanted == "BOOTUP_FAIL" {
            assert!(frame["body"]["error"].as_str().unwrap().contains("failed to start"));
        }
    }

    // A successful retry emits start then success.
    let response = client
        .post(format!("http://{addr}/api/v1/machines/start/{machine}"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    for wanted in ["BOOTUP_START", "BOOTUP_SUCCESS"] {
        let message = timeout(Duration::from_secs(5), read.next()).await.unwrap().unwrap().unwrap();
        let WsMessage::Text(text) = message else { panic!("Expected text frame") };
        let frame: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(frame["type"], wanted);
        assert_eq!(frame["body"]["error"], serde_json::Value::Null);
    }
}

#[tokio::test]
async fn create_modify_delete_require_manage_capability() {
    let backend = SandboxBackend::new();
    let (_mortal, mortal_token) = backend.add_user("mortal", []);
    let (_admin, admin_token) = backend.add_user("admin", [Capability::ManageAllVms]);

    let Some(addr) = start_test_server(&backend).await else {
        eprintln!("Skipping REST tests: local TCP bind not permitted");
        return;
    };
    let client = reqwest::Client::new();

    let spec = serde_json::json!({
        "title": "build-runner",
        "description": "CI build runner",
        "tags": ["ci"],
        "vcpu": 4,
        "ram_max": 4_194_304u64,
    });

    // Creation is privileged.
    let response = client
        .post(format!("http://{addr}/api/v1/machines"))
        .bearer_auth(&mortal_token)
        .json(&spec)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);

    let response = client
        .post(format!("http://{addr}/api/v1/machines"))
        .bearer_auth(&admin_token)
        .json(&spec)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let machine: String = response.json().await.unwrap();

    // Modify, then confirm the title stuck.
    let response = client
        .patch(format!("http://{addr}/api/v1/machines/{machine}"))
        .bearer_auth(&admin_token)
        .json(&serde_json::json!({"title": "build-runner-2"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let response = client
        .get(format!("http://{addr}/api/v1/machines/{machine}"))
        .bearer_auth(&admin_token)
        .send()
        .await
        .unwrap();
    let properties: serde_json::Value = response.json().await.unwrap();
    assert_eq!(properties["title"], "build-runner-2");

    // Delete, then the machine is gone.
    let response = client
        .delete(format!("http://{addr}/api/v1/machines/{machine}"))
        .bearer_auth(&admin_token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let response = client
        .get(format!("http://{addr}/api/v1/machines/{machine}"))
        .bearer_auth(&admin_token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}
