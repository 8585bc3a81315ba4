//! Hot config reload: the E5 scenario. Start with {A, B}, rewrite the file
//! to {A, C}, and watch the diff land without touching A.

mod common;

use common::{fake_server_entry, start_gateway, wait_for_status};
use onemcp::mcp::manager::ConnectionStatus;
use serde_json::json;
use std::time::Duration;

#[tokio::test]
async fn test_reload_diff_applies_incrementally() {
    let harness = start_gateway(
        json!({
            "alpha": fake_server_entry("alpha", "a_tool", &[]),
            "beta": fake_server_entry("beta", "b_tool", &[]),
        }),
        false,
    )
    .await;
    wait_for_status(&harness.gateway, "alpha", ConnectionStatus::Connected).await;
    wait_for_status(&harness.gateway, "beta", ConnectionStatus::Connected).await;

    let alpha_before = harness.gateway.manager.get("alpha").await.unwrap();

    // Rewrite: beta removed, gamma added, alpha untouched
    std::fs::write(
        &harness.config_path,
        serde_json::to_string_pretty(&json!({
            "mcpServers": {
                "alpha": fake_server_entry("alpha", "a_tool", &[]),
                "gamma": fake_server_entry("gamma", "c_tool", &[]),
            }
        }))
        .unwrap(),
    )
    .unwrap();

    wait_for_status(&harness.gateway, "gamma", ConnectionStatus::Connected).await;

    // beta is gone
    for _ in 0..200 {
        if harness.gateway.manager.get("beta").await.is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(harness.gateway.manager.get("beta").await.is_none());

    // alpha was not reconnected
    let alpha_after = harness.gateway.manager.get("alpha").await.unwrap();
    assert_eq!(alpha_after.status, ConnectionStatus::Connected);
    assert_eq!(alpha_after.last_connected_at, alpha_before.last_connected_at);

    harness.gateway.shutdown().await;
}

#[tokio::test]
async fn test_identical_rewrite_changes_nothing() {
    let harness = start_gateway(
        json!({ "alpha": fake_server_entry("alpha", "a_tool", &[]) }),
        false,
    )
    .await;
    wait_for_status(&harness.gateway, "alpha", ConnectionStatus::Connected).await;
    let before = harness.gateway.manager.get("alpha").await.unwrap();

    // Same content, new mtime
    let raw = std::fs::read_to_string(&harness.config_path).unwrap();
    std::fs::write(&harness.config_path, raw).unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    let after = harness.gateway.manager.get("alpha").await.unwrap();
    assert_eq!(after.status, ConnectionStatus::Connected);
    assert_eq!(after.last_connected_at, before.last_connected_at);

    harness.gateway.shutdown().await;
}

#[tokio::test]
async fn test_changed_spec_resets_restart_counter() {
    // A spec that always dies and exhausts its restart budget, then a reload
    // that fixes the command brings it back
    let harness = start_gateway(
        json!({
            "flaky": {
                "command": "sh",
                "args": ["-c", "exit 1"],
                "restartOnExit": true,
                "maxRestarts": 1,
                "restartDelay": 50,
                "timeout": 2000,
            }
        }),
        false,
    )
    .await;
    wait_for_status(&harness.gateway, "flaky", ConnectionStatus::Error).await;

    std::fs::write(
        &harness.config_path,
        serde_json::to_string_pretty(&json!({
            "mcpServers": { "flaky": fake_server_entry("flaky", "tool", &[]) }
        }))
        .unwrap(),
    )
    .unwrap();

    wait_for_status(&harness.gateway, "flaky", ConnectionStatus::Connected).await;
    let connection = harness.gateway.manager.get("flaky").await.unwrap();
    assert_eq!(connection.restart_count, 0);

    harness.gateway.shutdown().await;
}
