//! Integration tests for the parallel CLI spawner, using `sh -c` so the
//! "instructions" payload doubles as the slot's script body.

use std::time::Duration;

use ideaforge_desktop::services::generation::{CliRunConfig, CliSpawner, SpawnerConfig};

fn sh_spawner(timeout: Duration) -> CliSpawner {
    CliSpawner::new(SpawnerConfig {
        program: "sh".to_string(),
        base_args: vec!["-c".to_string()],
        timeout,
        ..SpawnerConfig::default()
    })
}

fn slot(subtype: &str, script: &str) -> CliRunConfig {
    CliRunConfig {
        subtype: subtype.to_string(),
        instructions: script.to_string(),
        model: None,
        max_items: None,
    }
}

#[tokio::test]
async fn test_batch_preserves_input_order() {
    let spawner = sh_spawner(Duration::from_secs(10));
    let configs = vec![
        slot("ux", r#"echo 'done. {"slot": "ux"}'"#),
        slot("security", r#"sleep 0.2; echo '{"slot": "security"}'"#),
        slot("performance", r#"echo 'notes first'; echo '{"slot": "performance"}'"#),
    ];

    let results = spawner.spawn_all(configs).await;

    assert_eq!(results.len(), 3);
    let subtypes: Vec<&str> = results.iter().map(|r| r.subtype.as_str()).collect();
    assert_eq!(subtypes, vec!["ux", "security", "performance"]);
    for result in &results {
        assert!(result.success, "slot {} failed: {:?}", result.subtype, result.error);
        let payload = result.payload.as_ref().unwrap();
        assert_eq!(payload["slot"], result.subtype);
    }
    assert!(spawner.active_subtypes().await.is_empty());
}

#[tokio::test]
async fn test_timeout_hits_only_its_own_slot() {
    let spawner = sh_spawner(Duration::from_millis(500));
    let configs = vec![
        slot("fast", r#"echo '{"ok": true}'"#),
        slot("stuck", "exec sleep 30"),
    ];

    let results = spawner.spawn_all(configs).await;

    assert!(results[0].success);
    assert!(!results[1].success);
    assert!(results[1].timed_out);
    assert!(results[1].error.as_deref().unwrap().contains("timed out"));
}

#[tokio::test]
async fn test_failure_classification_per_slot() {
    let spawner = sh_spawner(Duration::from_secs(10));
    let configs = vec![
        slot("limited", "echo 'API error: usage limit reached'; exit 1"),
        slot("locked_out", "echo 'request unauthorized'; exit 1"),
        slot("broken", "echo boom; exit 7"),
        slot("empty", "echo 'finished with nothing structured'"),
    ];

    let results = spawner.spawn_all(configs).await;

    assert!(results[0].rate_limited);
    assert!(results[1].auth_failed);
    assert!(results[2].error.as_deref().unwrap().contains("code 7"));
    assert!(!results[3].success);
    assert!(results[3].error.as_deref().unwrap().contains("no structured payload"));
    // One slot failing a signature check never taints its neighbors
    assert!(!results[2].rate_limited && !results[2].auth_failed);
}

#[tokio::test]
async fn test_kill_all_cancels_running_slots() {
    let spawner = sh_spawner(Duration::from_secs(30));
    let background = spawner.clone();
    let batch = tokio::spawn(async move {
        background
            .spawn_all(vec![slot("a", "exec sleep 30"), slot("b", "exec sleep 30")])
            .await
    });

    // Give the slots time to spawn
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(spawner.active_subtypes().await.len(), 2);
    spawner.kill_all().await;

    let results = batch.await.unwrap();
    for result in &results {
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("cancelled"));
        assert!(!result.timed_out);
    }
}

#[tokio::test]
async fn test_kill_one_targets_a_single_slot() {
    let spawner = sh_spawner(Duration::from_secs(30));
    let background = spawner.clone();
    let batch = tokio::spawn(async move {
        background
            .spawn_all(vec![
                slot("victim", "exec sleep 30"),
                slot("survivor", r#"sleep 0.5; echo '{"ok": true}'"#),
            ])
            .await
    });

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(spawner.kill_one("victim").await);
    assert!(!spawner.kill_one("nonexistent").await);

    let results = batch.await.unwrap();
    assert!(!results[0].success);
    assert!(results[1].success);
}

#[tokio::test]
async fn test_spawn_error_becomes_result() {
    let spawner = CliSpawner::new(SpawnerConfig {
        program: "/nonexistent/agent-cli".to_string(),
        base_args: vec![],
        ..SpawnerConfig::default()
    });

    let results = spawner.spawn_all(vec![slot("ux", "irrelevant")]).await;

    assert_eq!(results.len(), 1);
    assert!(!results[0].success);
    assert!(results[0].error.as_deref().unwrap().contains("failed to spawn"));
}

#[tokio::test]
async fn test_raw_output_stays_bounded_under_flood() {
    let spawner = CliSpawner::new(SpawnerConfig {
        program: "sh".to_string(),
        base_args: vec!["-c".to_string()],
        output_limit: 1024,
        ..SpawnerConfig::default()
    });

    // ~200 KiB of output, far past the capture bound
    let flood = slot(
        "noisy",
        r#"i=0; while [ $i -lt 5000 ]; do echo "line $i of relentless output"; i=$((i+1)); done; echo '{"ok": true}'"#,
    );
    let results = spawner.spawn_all(vec![flood]).await;

    assert!(results[0].raw_output.len() <= 1024);
    // The tail survives, so the payload at the end is still extractable
    assert!(results[0].success);
    assert_eq!(results[0].payload.as_ref().unwrap()["ok"], true);
}
