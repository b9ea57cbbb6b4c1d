//! Live portal reads. Ignored by default: they depend on third-party
//! markup and may be rate limited in CI.
//! Run with: cargo test -p aurum-core --test live -- --ignored --nocapture

#![cfg(feature = "portal")]

use aurum_core::portal::{PortalConfig, Session};

fn live_session() -> Session {
    Session::with_config(PortalConfig {
        min_request_delay_ms: 1_500,
        ..PortalConfig::default()
    })
    .expect("session")
}

#[test]
#[ignore]
fn live_package_info() {
    let mut session = live_session();
    match session.package_info("yay") {
        Ok(info) => {
            assert_eq!(info.name, "yay");
            assert!(!info.version.is_empty());
        }
        Err(e) => eprintln!("package_info failed (may be rate limited): {}", e),
    }
}

#[test]
#[ignore]
fn live_comments() {
    let mut session = live_session();
    match session.comments("yay") {
        Ok(comments) => {
            eprintln!("fetched {} comments", comments.len());
            for comment in comments.iter().take(3) {
                eprintln!("  {}: {}", comment.author, comment.content);
            }
        }
        Err(e) => eprintln!("comments failed (may be rate limited): {}", e),
    }
}

#[test]
#[ignore]
fn live_news() {
    let mut session = live_session();
    match session.news(2) {
        Ok(items) => {
            assert!(!items.is_empty(), "news index should list articles");
            for item in &items {
                assert!(item.url.contains("/news/"));
                eprintln!("  {} -> {}", item.title, item.url);
            }
        }
        Err(e) => eprintln!("news failed (may be rate limited): {}", e),
    }
}
