//! Integration tests for cadence-queue

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use assert_cmd::Command;
use libcadence::accounts::AccountRepository;
use libcadence::error::PlatformError;
use libcadence::retry::{RetryCoordinator, RetryDecision, RetryPolicy};
use libcadence::types::{DeadLetterEntry, Token};
use libcadence::{Database, Platform, Post, PostStatus, SocialAccount, Vault};
use predicates::prelude::*;
use secrecy::SecretString;
use tempfile::TempDir;

struct TestEnv {
    _temp_dir: TempDir,
    config_path: String,
    db: Database,
    vault_key: String,
}

async fn setup_test_env() -> TestEnv {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.toml");
    let db_path = temp_dir.path().join("cadence.db");

    fs::write(
        &config_path,
        format!(
            "[database]\npath = \"{}\"\n",
            db_path.display().to_string().replace('\\', "/")
        ),
    )
    .unwrap();

    let db = Database::new(db_path.to_str().unwrap()).await.unwrap();

    TestEnv {
        _temp_dir: temp_dir,
        config_path: config_path.to_str().unwrap().to_string(),
        db,
        vault_key: Vault::generate_key(),
    }
}

fn cadence_queue(env: &TestEnv) -> Command {
    let mut cmd = Command::cargo_bin("cadence-queue").unwrap();
    cmd.env("CADENCE_CONFIG", &env.config_path)
        .env("CADENCE_VAULT_KEY", &env.vault_key)
        .env_remove("RUST_LOG");
    cmd
}

fn accounts(env: &TestEnv) -> AccountRepository {
    let vault = Vault::from_base64_key(&env.vault_key).unwrap();
    AccountRepository::new(env.db.clone(), Arc::new(vault))
}

async fn connect_account(env: &TestEnv, team: &str) -> SocialAccount {
    let token = Token {
        access_token: SecretString::from("access".to_string()),
        refresh_token: None,
        expires_at: None,
        platform_user_id: "77".to_string(),
        handle: Some("@cadence_ops".to_string()),
    };
    accounts(env)
        .connect(team, Platform::Mastodon, &token)
        .await
        .unwrap()
}

/// Fail a publish until it lands in the dead-letter queue
async fn dead_letter(env: &TestEnv) -> (Post, DeadLetterEntry) {
    let now = chrono::Utc::now().timestamp();
    let post = Post::new("team-1".to_string(), "Doomed".to_string(), vec![Platform::Mastodon])
        .scheduled(now - 60);
    env.db.create_post(&post).await.unwrap();
    assert!(env.db.claim_post(&post.id, now, now + 300).await.unwrap());

    let retry = RetryCoordinator::new(
        env.db.clone(),
        RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(1),
            rate_limit_cooldown: Duration::from_secs(1),
        },
    );
    let error = PlatformError::Network("connection reset".to_string());
    retry
        .record_failure(&post.id, Platform::Mastodon, None, &error, now)
        .await
        .unwrap();
    match retry
        .record_failure(&post.id, Platform::Mastodon, None, &error, now)
        .await
        .unwrap()
    {
        RetryDecision::DeadLettered(entry) => (post, entry),
        other => panic!("expected a dead letter, got {:?}", other),
    }
}

// KEYGEN TESTS

#[test]
fn test_keygen_without_config() {
    let output = Command::cargo_bin("cadence-queue")
        .unwrap()
        .env("CADENCE_CONFIG", "/nonexistent/cadence/config.toml")
        .env_remove("CADENCE_VAULT_KEY")
        .arg("keygen")
        .output()
        .unwrap();

    assert!(output.status.success());
    let key = String::from_utf8(output.stdout).unwrap();
    assert!(Vault::from_base64_key(key.trim()).is_ok());
}

// STATS AND DUE TESTS

#[tokio::test]
async fn test_stats_empty_queue() {
    let env = setup_test_env().await;

    cadence_queue(&env)
        .arg("stats")
        .assert()
        .success()
        .stdout(predicate::str::contains("Scheduled:         0"))
        .stdout(predicate::str::contains("Open dead letters: 0"));
}

#[tokio::test]
async fn test_stats_json_counts_posts() {
    let env = setup_test_env().await;
    let now = chrono::Utc::now().timestamp();
    for offset in [-60, 3600] {
        let post = Post::new("team-1".to_string(), "x".to_string(), vec![Platform::Twitter])
            .scheduled(now + offset);
        env.db.create_post(&post).await.unwrap();
    }

    let output = cadence_queue(&env)
        .args(["stats", "--format", "json"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let stats: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(stats["scheduled"], 2);
    assert_eq!(stats["due_now"], 1);
}

#[tokio::test]
async fn test_due_lists_only_due_posts() {
    let env = setup_test_env().await;
    let now = chrono::Utc::now().timestamp();
    let due = Post::new("team-1".to_string(), "Due".to_string(), vec![Platform::Twitter])
        .scheduled(now - 600);
    let later = Post::new("team-1".to_string(), "Later".to_string(), vec![Platform::Twitter])
        .scheduled(now + 600);
    env.db.create_post(&due).await.unwrap();
    env.db.create_post(&later).await.unwrap();

    cadence_queue(&env)
        .arg("due")
        .assert()
        .success()
        .stdout(predicate::str::contains(&due.id))
        .stdout(predicate::str::contains("10m ago"))
        .stdout(predicate::str::contains(&later.id).not());
}

#[tokio::test]
async fn test_invalid_format_exits_with_invalid_input() {
    let env = setup_test_env().await;

    cadence_queue(&env)
        .args(["due", "--format", "yaml"])
        .assert()
        .failure()
        .code(3)
        .stderr(predicate::str::contains("Invalid format"));
}

// DEAD LETTER TESTS

#[tokio::test]
async fn test_dead_letters_and_requeue() {
    let env = setup_test_env().await;
    let (post, entry) = dead_letter(&env).await;

    cadence_queue(&env)
        .arg("dead-letters")
        .assert()
        .success()
        .stdout(predicate::str::contains(&entry.id))
        .stdout(predicate::str::contains("2 attempts"))
        .stdout(predicate::str::contains("open"));

    cadence_queue(&env)
        .args(["requeue", &entry.id])
        .assert()
        .success()
        .stdout(predicate::str::contains(format!("Requeued post {} on mastodon", post.id)));

    let requeued = env.db.get_post(&post.id).await.unwrap().unwrap();
    assert_eq!(requeued.status, PostStatus::Queued);

    // requeued entries are hidden unless --all
    cadence_queue(&env)
        .arg("dead-letters")
        .assert()
        .success()
        .stdout(predicate::str::is_empty());

    let output = cadence_queue(&env)
        .args(["dead-letters", "--all", "--format", "json"])
        .output()
        .unwrap();
    let entries: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(entries.as_array().unwrap().len(), 1);
    assert!(entries[0]["resolved_at"].is_i64());

    cadence_queue(&env)
        .args(["requeue", &entry.id])
        .assert()
        .failure()
        .code(3)
        .stderr(predicate::str::contains("already resolved"));
}

#[tokio::test]
async fn test_requeue_rejects_bad_ids() {
    let env = setup_test_env().await;

    cadence_queue(&env)
        .args(["requeue", "not-a-uuid"])
        .assert()
        .failure()
        .code(3);

    cadence_queue(&env)
        .args(["requeue", "0b9c3f4e-7d2a-4c1b-9e8f-5a6b7c8d9e0f"])
        .assert()
        .failure()
        .code(3)
        .stderr(predicate::str::contains("no dead letter"));
}

// ACCOUNT TESTS

#[tokio::test]
async fn test_accounts_and_disconnect() {
    let env = setup_test_env().await;
    let account = connect_account(&env, "team-ops").await;

    cadence_queue(&env)
        .args(["accounts", "team-ops"])
        .assert()
        .success()
        .stdout(predicate::str::contains(&account.id))
        .stdout(predicate::str::contains("@cadence_ops"))
        .stdout(predicate::str::contains("active"));

    cadence_queue(&env)
        .args(["disconnect", &account.id])
        .assert()
        .success();

    cadence_queue(&env)
        .args(["accounts", "team-ops"])
        .assert()
        .success()
        .stdout(predicate::str::is_empty());

    cadence_queue(&env)
        .args(["disconnect", &account.id])
        .assert()
        .failure()
        .code(3);
}

#[tokio::test]
async fn test_account_check_without_platform_config() {
    let env = setup_test_env().await;
    connect_account(&env, "team-ops").await;

    let output = cadence_queue(&env)
        .args(["accounts", "team-ops", "--check", "--format", "json"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let rows: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(rows[0]["platform"], "mastodon");
    assert!(rows[0]["token_valid"].is_null());
    assert!(rows[0]["check_error"]
        .as_str()
        .unwrap()
        .contains("no [platforms.mastodon] configuration"));
}

#[tokio::test]
async fn test_accounts_require_vault_key() {
    let env = setup_test_env().await;

    cadence_queue(&env)
        .env_remove("CADENCE_VAULT_KEY")
        .args(["accounts", "team-ops"])
        .assert()
        .failure()
        .code(2);
}
