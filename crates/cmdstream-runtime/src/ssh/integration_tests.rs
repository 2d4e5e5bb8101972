//! SSH Integration Tests
//!
//! These tests require a running SSH server that accepts password logins.
//! They are marked #[ignore] by default and must be run explicitly:
//!
//! ```bash
//! docker run -d -p 2222:2222 -e PASSWORD_ACCESS=true \
//!     -e USER_NAME=testuser -e USER_PASSWORD=testpassword \
//!     linuxserver/openssh-server
//!
//! cargo test -p cmdstream-runtime -- --ignored --test-threads=1
//! ```
//!
//! Environment variables:
//! - SSH_TEST_HOST: Target host (default: localhost)
//! - SSH_TEST_PORT: Target port (default: 2222)
//! - SSH_TEST_USER: SSH username (default: testuser)
//! - SSH_TEST_PASSWORD: SSH password (default: testpassword)

use std::time::Duration;

use super::{Session, SshPoolHandle, Transport};
use crate::config::PoolConfig;
use crate::execution::ConnectParams;

// =============================================================================
// Test Configuration
// =============================================================================

fn test_host() -> String {
    std::env::var("SSH_TEST_HOST").unwrap_or_else(|_| "localhost".to_string())
}

fn test_port() -> u16 {
    std::env::var("SSH_TEST_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(2222)
}

fn test_user() -> String {
    std::env::var("SSH_TEST_USER").unwrap_or_else(|_| "testuser".to_string())
}

fn test_password() -> String {
    std::env::var("SSH_TEST_PASSWORD").unwrap_or_else(|_| "testpassword".to_string())
}

fn test_params() -> ConnectParams {
    ConnectParams::new(test_host(), test_port(), test_user(), test_password())
}

// =============================================================================
// Helper Functions
// =============================================================================

/// Connect and authenticate with password
async fn connect_with_password() -> eyre::Result<Session> {
    let params = test_params();
    let mut session = Session::open(&params, Duration::from_secs(10)).await?;
    session
        .password_auth(&params.username, &params.password)
        .await?;

    Ok(session)
}

// =============================================================================
// Transport Tests
// =============================================================================

#[tokio::test]
#[ignore]
async fn test_auth_password() {
    let result = connect_with_password().await;
    assert!(
        result.is_ok(),
        "Password authentication failed: {:?}",
        result.err()
    );
}

#[tokio::test]
#[ignore]
async fn test_auth_wrong_password_fails() {
    let params = test_params();
    let mut session = Session::open(&params, Duration::from_secs(10))
        .await
        .expect("Failed to open session");

    let result = session
        .password_auth(&params.username, "definitely-not-the-password")
        .await;
    assert!(result.is_err(), "Wrong password should fail authentication");
}

#[tokio::test]
#[ignore]
async fn test_exec_simple_command() {
    let session = connect_with_password().await.expect("Failed to connect");

    let result = session
        .exec_and_capture("echo 'hello world'")
        .await
        .expect("Exec failed");

    assert_eq!(result.exit_code, Some(0));
    assert_eq!(result.stdout.trim(), "hello world");
    assert!(result.stderr.is_empty());
}

#[tokio::test]
#[ignore]
async fn test_exec_with_stdout_and_stderr() {
    let session = connect_with_password().await.expect("Failed to connect");

    let result = session
        .exec_and_capture("echo 'out' && echo 'err' >&2")
        .await
        .expect("Exec failed");

    assert_eq!(result.exit_code, Some(0));
    assert!(result.stdout.contains("out"));
    assert!(result.stderr.contains("err"));
}

#[tokio::test]
#[ignore]
async fn test_exec_with_exit_code() {
    let session = connect_with_password().await.expect("Failed to connect");

    let result = session.exec_and_capture("false").await.expect("Exec failed");

    assert_ne!(result.exit_code, Some(0), "false should exit non-zero");
}

#[tokio::test]
#[ignore]
async fn test_disconnect_closes_transport() {
    let session = connect_with_password().await.expect("Failed to connect");

    Transport::close(&session).await.expect("Disconnect failed");
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(session.is_closed());
}

// =============================================================================
// Pool Tests
// =============================================================================

#[tokio::test]
#[ignore]
async fn test_pool_echo_hello() {
    let pool = SshPoolHandle::new(PoolConfig::default());

    let result = pool
        .run_multiplexed("echo hello", &test_params(), false, None)
        .await;

    assert!(result.success, "echo failed: {}", result.output);
    assert_eq!(result.output, "hello");
    assert_eq!(pool.len().await.unwrap(), 0);
}

#[tokio::test]
#[ignore]
async fn test_pool_state_persists_between_commands() {
    let pool = SshPoolHandle::new(PoolConfig::default());
    let params = test_params();

    let cd = pool.run_multiplexed("cd /tmp", &params, true, None).await;
    assert!(cd.success, "cd failed: {}", cd.output);

    pool.run_multiplexed("export CMDSTREAM_TEST=42", &params, true, None)
        .await;

    let pwd = pool.run_multiplexed("pwd", &params, true, None).await;
    assert!(pwd.output.contains("/tmp"), "unexpected pwd: {}", pwd.output);

    let var = pool
        .run_multiplexed("echo $CMDSTREAM_TEST", &params, false, None)
        .await;
    assert_eq!(var.output, "42");
}

#[tokio::test]
#[ignore]
async fn test_pool_wrong_password() {
    let pool = SshPoolHandle::new(PoolConfig::default());
    let mut params = test_params();
    params.password = "definitely-not-the-password".to_string();

    let result = pool.run_multiplexed("echo hello", &params, true, None).await;

    assert!(!result.success);
    assert!(result.output.contains("authentication failed"));
    assert_eq!(pool.len().await.unwrap(), 0);
}

#[tokio::test]
#[ignore]
async fn test_pool_multiline_output() {
    let pool = SshPoolHandle::new(PoolConfig::default());

    let result = pool
        .run_multiplexed(
            "echo line1; echo line2; echo line3",
            &test_params(),
            false,
            None,
        )
        .await;

    assert!(result.success, "echo failed: {}", result.output);
    assert_eq!(result.output, "line1\nline2\nline3");
}

#[tokio::test]
#[ignore]
async fn test_run_once_over_exec_channel() {
    let pool = SshPoolHandle::new(PoolConfig::default());

    let result = pool.run_once("uname", Some(&test_params())).await;

    assert!(result.success, "uname failed: {}", result.output);
    assert!(!result.output.is_empty());
}
