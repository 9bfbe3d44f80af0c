//! End-to-end reconciliation tests against a mock Caddy admin API
//!
//! Spins up a minimal HTTP server speaking just enough of the admin API
//! (GET /config/, PATCH .../routes) to exercise the real client, the
//! synchronizer, and the site manager together.

use caddyman::caddy::{CaddyClient, CaddyStatus};
use caddyman::db::Database;
use caddyman::sites::{NewSite, SiteConfig, SiteManager, SiteUpdate};
use caddyman::sync::ConfigSynchronizer;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

struct MockState {
    tree: Value,
    /// Bodies of every PATCH received, in order
    patches: Vec<Value>,
    /// Reject PATCH number `n` (0-based) and all later ones with a 500
    fail_patches_from: Option<usize>,
}

/// Minimal in-process Caddy admin API
struct MockCaddy {
    addr: SocketAddr,
    state: Arc<Mutex<MockState>>,
}

impl MockCaddy {
    async fn start(tree: Value) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(MockState {
            tree,
            patches: Vec::new(),
            fail_patches_from: None,
        }));

        let accept_state = state.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let state = accept_state.clone();
                tokio::spawn(async move {
                    let _ = handle_connection(stream, state).await;
                });
            }
        });

        Self { addr, state }
    }

    fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    fn routes(&self, server_key: &str) -> Value {
        self.state.lock().unwrap().tree["apps"]["http"]["servers"][server_key]["routes"]
            .clone()
    }

    fn patches(&self) -> Vec<Value> {
        self.state.lock().unwrap().patches.clone()
    }

    fn fail_patches_from(&self, n: usize) {
        self.state.lock().unwrap().fail_patches_from = Some(n);
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    state: Arc<Mutex<MockState>>,
) -> std::io::Result<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    // Read the request head
    let head_end = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_subslice(&buf, b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    let mut lines = head.lines();
    let request_line = lines.next().unwrap_or_default().to_string();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let path = parts.next().unwrap_or_default().to_string();

    let content_length: usize = lines
        .filter_map(|l| l.split_once(':'))
        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.trim().parse().ok())
        .unwrap_or(0);

    // Read the remainder of the body
    let mut body = buf[head_end..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }

    let (status_line, response_body) = respond(&method, &path, &body, &state);
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status_line,
        response_body.len(),
        response_body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}

fn respond(
    method: &str,
    path: &str,
    body: &[u8],
    state: &Arc<Mutex<MockState>>,
) -> (&'static str, String) {
    let mut state = state.lock().unwrap();

    match (method, path) {
        ("GET", "/config/") => ("200 OK", state.tree.to_string()),
        ("PATCH", p) if p.starts_with("/config/apps/http/servers/") && p.ends_with("/routes") => {
            let server_key = p
                .trim_start_matches("/config/apps/http/servers/")
                .trim_end_matches("/routes")
                .to_string();

            let Ok(routes) = serde_json::from_slice::<Value>(body) else {
                return ("400 Bad Request", r#"{"error":"invalid JSON"}"#.to_string());
            };

            let patch_number = state.patches.len();
            state.patches.push(routes.clone());

            if matches!(state.fail_patches_from, Some(n) if patch_number >= n) {
                return (
                    "500 Internal Server Error",
                    r#"{"error":"simulated admin failure"}"#.to_string(),
                );
            }

            state.tree["apps"]["http"]["servers"][&server_key]["routes"] = routes;
            // Caddy answers PATCH with an empty body
            ("200 OK", String::new())
        }
        _ => ("404 Not Found", r#"{"error":"unknown path"}"#.to_string()),
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn default_tree(routes: Value) -> Value {
    json!({
        "apps": { "http": { "servers": {
            "default": { "listen": [":443"], "routes": routes }
        }}}
    })
}

fn proxy_site(domain: &str, target: &str) -> NewSite {
    NewSite {
        name: format!("Site {}", domain),
        domain: domain.to_string(),
        config: SiteConfig::ReverseProxy {
            target_url: target.to_string(),
            preserve_path: false,
            strip_prefix: false,
            headers: BTreeMap::new(),
        },
    }
}

fn manager_for(mock: &MockCaddy) -> SiteManager<CaddyClient> {
    let db = Arc::new(Database::open_in_memory().unwrap());
    db.ensure_user("system", "system@localhost", "System", "admin")
        .unwrap();
    let client = CaddyClient::new(&mock.base_url(), Duration::from_secs(2)).unwrap();
    SiteManager::new(db, ConfigSynchronizer::new(client), "system".to_string())
}

#[tokio::test]
async fn create_site_appends_route_in_one_patch() {
    let existing = json!([{
        "match": [{ "host": ["existing.test"] }],
        "handle": [{ "handler": "file_server", "root": "/srv" }],
        "terminal": true
    }]);
    let mock = MockCaddy::start(default_tree(existing.clone())).await;
    let manager = manager_for(&mock);

    manager
        .create_site(proxy_site("a.test", "127.0.0.1:8080"), None)
        .await
        .unwrap();

    let patches = mock.patches();
    assert_eq!(patches.len(), 1);
    let body = patches[0].as_array().unwrap();
    assert_eq!(body.len(), 2);
    assert_eq!(body[0], existing[0]);
    assert_eq!(body[1]["match"][0]["host"], json!(["a.test"]));
    assert_eq!(
        body[1]["handle"][0]["upstreams"][0]["dial"],
        json!("127.0.0.1:8080")
    );
    assert_eq!(body[1]["terminal"], json!(true));
}

#[tokio::test]
async fn update_target_leaves_single_route() {
    let mock = MockCaddy::start(default_tree(json!([]))).await;
    let manager = manager_for(&mock);

    let site = manager
        .create_site(proxy_site("a.test", "127.0.0.1:8080"), None)
        .await
        .unwrap();

    manager
        .update_site(
            &site.id,
            SiteUpdate {
                name: site.name.clone(),
                domain: "a.test".to_string(),
                config: SiteConfig::ReverseProxy {
                    target_url: "127.0.0.1:9090".to_string(),
                    preserve_path: false,
                    strip_prefix: false,
                    headers: BTreeMap::new(),
                },
            },
            None,
        )
        .await
        .unwrap();

    let routes = mock.routes("default");
    let routes = routes.as_array().unwrap();
    assert_eq!(routes.len(), 1);
    assert_eq!(
        routes[0]["handle"][0]["upstreams"][0]["dial"],
        json!("127.0.0.1:9090")
    );
}

#[tokio::test]
async fn rename_is_two_patches_and_crash_between_loses_both() {
    let mock = MockCaddy::start(default_tree(json!([]))).await;
    let manager = manager_for(&mock);

    let site = manager
        .create_site(proxy_site("a.test", "127.0.0.1:8080"), None)
        .await
        .unwrap();

    // The remove PATCH (number 1) succeeds, the re-add (number 2) fails,
    // simulating a crash in the window between the two remote calls.
    mock.fail_patches_from(2);

    let updated = manager
        .update_site(
            &site.id,
            SiteUpdate {
                name: site.name.clone(),
                domain: "b.test".to_string(),
                config: site.config.clone(),
            },
            None,
        )
        .await
        .unwrap();

    // Update fails open: the local record carries the new domain
    assert_eq!(updated.domain, "b.test");

    // The remote side has a route for NEITHER domain. This is the
    // documented non-atomic rename behavior, not something the
    // synchronizer papers over.
    let routes = mock.routes("default");
    let routes = routes.as_array().unwrap();
    assert!(routes.is_empty());

    let patches = mock.patches();
    assert_eq!(patches.len(), 3); // create, remove, rejected re-add
    assert!(patches[1].as_array().unwrap().is_empty());
    assert_eq!(patches[2][0]["match"][0]["host"], json!(["b.test"]));
}

#[tokio::test]
async fn delete_with_remote_failure_still_deletes_locally() {
    let existing = json!([{
        "match": [{ "host": ["a.test"] }],
        "handle": [{ "handler": "reverse_proxy",
                     "upstreams": [{ "dial": "127.0.0.1:8080" }] }],
        "terminal": true
    }]);
    let mock = MockCaddy::start(default_tree(existing)).await;

    let db = Arc::new(Database::open_in_memory().unwrap());
    db.ensure_user("system", "system@localhost", "System", "admin")
        .unwrap();
    db.create_site(&caddyman::db::SiteRecord {
        id: "s1".to_string(),
        name: "A".to_string(),
        domain: "a.test".to_string(),
        site_type: "reverse_proxy".to_string(),
        config: r#"{"type":"reverse_proxy","target_url":"127.0.0.1:8080"}"#.to_string(),
        enabled: true,
        created_by: "system".to_string(),
        created_at: String::new(),
        updated_at: String::new(),
    })
    .unwrap();

    let client = CaddyClient::new(&mock.base_url(), Duration::from_secs(2)).unwrap();
    let manager = SiteManager::new(
        db.clone(),
        ConfigSynchronizer::new(client),
        "system".to_string(),
    );

    mock.fail_patches_from(0);

    manager.delete_site("s1", None).await.unwrap();

    // Local record gone despite the 500
    assert!(db.get_site("s1").unwrap().is_none());

    // Audit entry captures the remote failure verbatim
    let log = db.list_activity(10).unwrap();
    assert_eq!(log[0].action, "delete");
    let details: Value = serde_json::from_str(&log[0].details).unwrap();
    let remote_error = details["remote"]["caddy_error"].as_str().unwrap();
    assert!(remote_error.contains("500"));
    assert!(remote_error.contains("simulated admin failure"));
}

#[tokio::test]
async fn status_probe_reports_running() {
    let mock = MockCaddy::start(default_tree(json!([]))).await;
    let client = CaddyClient::new(&mock.base_url(), Duration::from_secs(2)).unwrap();
    assert_eq!(client.check_status().await, CaddyStatus::Running);
}

#[tokio::test]
async fn srv0_fallback_is_used_when_default_is_absent() {
    let tree = json!({
        "apps": { "http": { "servers": {
            "srv0": { "listen": [":80"], "routes": [] }
        }}}
    });
    let mock = MockCaddy::start(tree).await;
    let manager = manager_for(&mock);

    manager
        .create_site(proxy_site("a.test", "127.0.0.1:8080"), None)
        .await
        .unwrap();

    let routes = mock.routes("srv0");
    assert_eq!(routes.as_array().unwrap().len(), 1);
    assert_eq!(routes[0]["match"][0]["host"], json!(["a.test"]));
}
