//! Reconciliation of stored sites against the live Caddy configuration
//!
//! Every mutation is a fresh read-modify-write: fetch the configuration
//! tree, locate the server that owns the routes array, edit that array,
//! PATCH the whole thing back. The admin API has no optimistic-concurrency
//! token, so the whole sequence runs under a process-wide mutex; writers in
//! other processes remain a deployment concern.

use crate::caddy::CaddyClient;
use crate::error::{Error, Result};
use crate::routes::Route;
use crate::sites::SiteConfig;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Server key Caddy generates when none is named explicitly
const FALLBACK_SERVER_KEY: &str = "srv0";

/// Determine which HTTP server under `apps.http.servers` owns the live
/// routes array. Prefers `default`, falls back to `srv0`.
///
/// The administered server must already have an HTTP listener defined
/// out-of-band; this tool never creates one.
pub fn resolve_server_slot(config: &Value) -> Result<&'static str> {
    let servers = &config["apps"]["http"]["servers"];

    if servers["default"].is_object() {
        Ok("default")
    } else if servers[FALLBACK_SERVER_KEY].is_object() {
        Ok(FALLBACK_SERVER_KEY)
    } else {
        Err(Error::NoServerConfigured)
    }
}

/// Extract the routes array of the given server slot. A missing `routes`
/// key means an empty array, not an error.
fn routes_of(config: &Value, server_key: &str) -> Result<Vec<Route>> {
    match &config["apps"]["http"]["servers"][server_key]["routes"] {
        Value::Null => Ok(Vec::new()),
        routes => serde_json::from_value(routes.clone()).map_err(|e| {
            Error::RemoteUnavailable(format!("unparseable routes array: {}", e))
        }),
    }
}

/// Replace the route owning `domain` in place, or append a new one.
///
/// Positions of all other routes are preserved.
pub fn upsert_route(routes: &mut Vec<Route>, route: Route, domain: &str) {
    match routes.iter().position(|r| r.matches_domain(domain)) {
        Some(index) => routes[index] = route,
        None => routes.push(route),
    }
}

/// Drop every route whose host matcher contains `domain` exactly.
///
/// Catch-all routes (no `match` at all) never match a domain and are
/// always kept. Returns how many routes were dropped.
pub fn remove_routes_for(routes: &mut Vec<Route>, domain: &str) -> usize {
    let before = routes.len();
    routes.retain(|r| !r.matches_domain(domain));
    before - routes.len()
}

/// Minimal interface the synchronizer needs from the admin API.
///
/// `CaddyClient` is the production implementation; tests substitute a
/// recording fake.
pub trait AdminApi {
    fn fetch_config(&self) -> impl std::future::Future<Output = Result<Value>> + Send;
    fn replace_routes(
        &self,
        server_key: &str,
        routes: &[Route],
    ) -> impl std::future::Future<Output = Result<Value>> + Send;
}

impl AdminApi for crate::caddy::CaddyClient {
    async fn fetch_config(&self) -> Result<Value> {
        CaddyClient::fetch_config(self).await
    }

    async fn replace_routes(&self, server_key: &str, routes: &[Route]) -> Result<Value> {
        CaddyClient::replace_routes(self, server_key, routes).await
    }
}

/// Keeps the live routes array consistent with stored site definitions
pub struct ConfigSynchronizer<A> {
    api: A,
    // Serializes the fetch -> mutate -> write sequence for the whole
    // server; routes from different domains share one array.
    write_lock: Mutex<()>,
}

impl<A: AdminApi> ConfigSynchronizer<A> {
    pub fn new(api: A) -> Self {
        Self {
            api,
            write_lock: Mutex::new(()),
        }
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    /// Add or replace the route for `domain`, leaving every other route
    /// untouched. Idempotent: re-running with an unchanged site yields a
    /// value-equal array.
    pub async fn upsert_site(&self, domain: &str, config: &SiteConfig) -> Result<Value> {
        let route = Route::for_site(domain, config);

        let _guard = self.write_lock.lock().await;
        let tree = self.api.fetch_config().await?;
        let slot = resolve_server_slot(&tree)?;
        let mut routes = routes_of(&tree, slot)?;

        upsert_route(&mut routes, route, domain);

        let response = self.api.replace_routes(slot, &routes).await?;
        info!(domain = %domain, server = slot, "Route upserted");
        Ok(response)
    }

    /// Remove every route owned by `domain`. Removing a domain with no
    /// matching route is a no-op success.
    pub async fn remove_site(&self, domain: &str) -> Result<Value> {
        let _guard = self.write_lock.lock().await;
        let tree = self.api.fetch_config().await?;
        let slot = resolve_server_slot(&tree)?;
        let mut routes = routes_of(&tree, slot)?;

        let removed = remove_routes_for(&mut routes, domain);
        if removed == 0 {
            debug!(domain = %domain, "No route to remove");
        }

        let response = self.api.replace_routes(slot, &routes).await?;
        info!(domain = %domain, server = slot, removed, "Route removal applied");
        Ok(response)
    }

    /// Move a site's route from `old_domain` to `new_domain`.
    ///
    /// The admin API has no atomic rename, so this is two independent
    /// remote calls; a crash between them leaves neither domain routed
    /// until the next successful reconciliation.
    pub async fn rename_domain(
        &self,
        old_domain: &str,
        new_domain: &str,
        config: &SiteConfig,
    ) -> Result<Value> {
        warn!(
            old = %old_domain,
            new = %new_domain,
            "Renaming domain via remove + upsert (non-atomic)"
        );
        self.remove_site(old_domain).await?;
        self.upsert_site(new_domain, config).await
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{tree_with_routes, FakeAdmin};
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn proxy_config(target: &str) -> SiteConfig {
        SiteConfig::ReverseProxy {
            target_url: target.to_string(),
            preserve_path: false,
            strip_prefix: false,
            headers: BTreeMap::new(),
        }
    }

    #[test]
    fn test_resolver_prefers_default() {
        let tree = json!({
            "apps": { "http": { "servers": {
                "default": { "listen": [":443"] },
                "srv0": { "listen": [":80"] }
            }}}
        });
        assert_eq!(resolve_server_slot(&tree).unwrap(), "default");
    }

    #[test]
    fn test_resolver_falls_back_to_srv0() {
        let tree = tree_with_routes("srv0", json!([]));
        assert_eq!(resolve_server_slot(&tree).unwrap(), "srv0");
    }

    #[test]
    fn test_resolver_fails_without_server() {
        let tree = json!({ "apps": { "http": { "servers": {} } } });
        assert!(matches!(
            resolve_server_slot(&tree),
            Err(Error::NoServerConfigured)
        ));

        let empty = json!({});
        assert!(matches!(
            resolve_server_slot(&empty),
            Err(Error::NoServerConfigured)
        ));
    }

    #[test]
    fn test_resolver_ignores_other_server_keys() {
        let tree = tree_with_routes("custom", json!([]));
        assert!(matches!(
            resolve_server_slot(&tree),
            Err(Error::NoServerConfigured)
        ));
    }

    #[tokio::test]
    async fn test_upsert_appends_new_route() {
        let existing = json!([{
            "match": [{ "host": ["other.test"] }],
            "handle": [{ "handler": "file_server", "root": "/srv" }],
            "terminal": true
        }]);
        let admin = FakeAdmin::new(tree_with_routes("default", existing.clone()));
        let sync = ConfigSynchronizer::new(&admin);

        sync.upsert_site("a.test", &proxy_config("127.0.0.1:8080"))
            .await
            .unwrap();

        let routes = admin.routes("default");
        assert_eq!(routes.as_array().unwrap().len(), 2);
        assert_eq!(routes[0], existing[0]);
        assert_eq!(routes[1]["match"][0]["host"], json!(["a.test"]));
        assert_eq!(
            routes[1]["handle"][0]["upstreams"][0]["dial"],
            json!("127.0.0.1:8080")
        );
    }

    #[tokio::test]
    async fn test_upsert_replaces_in_place() {
        let existing = json!([
            { "match": [{ "host": ["first.test"] }],
              "handle": [{ "handler": "file_server", "root": "/a" }] },
            { "match": [{ "host": ["a.test"] }],
              "handle": [{ "handler": "reverse_proxy",
                           "upstreams": [{ "dial": "127.0.0.1:1111" }] }] },
            { "match": [{ "host": ["last.test"] }],
              "handle": [{ "handler": "file_server", "root": "/z" }] }
        ]);
        let admin = FakeAdmin::new(tree_with_routes("default", existing.clone()));
        let sync = ConfigSynchronizer::new(&admin);

        sync.upsert_site("a.test", &proxy_config("127.0.0.1:2222"))
            .await
            .unwrap();

        let routes = admin.routes("default");
        assert_eq!(routes.as_array().unwrap().len(), 3);
        // Neighbors untouched, updated route stays at index 1
        assert_eq!(routes[0], existing[0]);
        assert_eq!(routes[2], existing[2]);
        assert_eq!(
            routes[1]["handle"][0]["upstreams"][0]["dial"],
            json!("127.0.0.1:2222")
        );
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent_by_value() {
        let admin = FakeAdmin::new(tree_with_routes("default", json!([])));
        let sync = ConfigSynchronizer::new(&admin);
        let config = proxy_config("127.0.0.1:8080");

        sync.upsert_site("a.test", &config).await.unwrap();
        let first = admin.routes("default");

        sync.upsert_site("a.test", &config).await.unwrap();
        let second = admin.routes("default");

        assert_eq!(first, second);
        assert_eq!(second.as_array().unwrap().len(), 1);
        // Both calls went through a full read-modify-write
        assert_eq!(admin.patch_count(), 2);
    }

    #[tokio::test]
    async fn test_remove_drops_only_owned_routes() {
        let existing = json!([
            { "match": [{ "host": ["keep.test"] }],
              "handle": [{ "handler": "file_server", "root": "/k" }] },
            { "match": [{ "host": ["a.test"] }],
              "handle": [{ "handler": "reverse_proxy",
                           "upstreams": [{ "dial": "127.0.0.1:1111" }] }] },
            { "handle": [{ "handler": "static_response", "status_code": 404 }] }
        ]);
        let admin = FakeAdmin::new(tree_with_routes("default", existing.clone()));
        let sync = ConfigSynchronizer::new(&admin);

        sync.remove_site("a.test").await.unwrap();

        let routes = admin.routes("default");
        assert_eq!(routes.as_array().unwrap().len(), 2);
        assert_eq!(routes[0], existing[0]);
        // Catch-all route (no match) survives
        assert_eq!(routes[1], existing[2]);
    }

    #[tokio::test]
    async fn test_remove_missing_domain_is_noop_success() {
        let existing = json!([{
            "match": [{ "host": ["keep.test"] }],
            "handle": [{ "handler": "file_server", "root": "/k" }]
        }]);
        let admin = FakeAdmin::new(tree_with_routes("default", existing.clone()));
        let sync = ConfigSynchronizer::new(&admin);

        sync.remove_site("ghost.test").await.unwrap();

        assert_eq!(admin.routes("default"), existing);
    }

    #[tokio::test]
    async fn test_rename_is_two_patches_and_crash_window_loses_both() {
        let existing = json!([{
            "match": [{ "host": ["a.test"] }],
            "handle": [{ "handler": "reverse_proxy",
                         "upstreams": [{ "dial": "127.0.0.1:8080" }] }],
            "terminal": true
        }]);
        let admin = FakeAdmin::new(tree_with_routes("default", existing));
        let sync = ConfigSynchronizer::new(&admin);

        sync.rename_domain("a.test", "b.test", &proxy_config("127.0.0.1:8080"))
            .await
            .unwrap();

        let patches = admin.patches.lock().unwrap();
        assert_eq!(patches.len(), 2);
        // First PATCH removes a.test; this is the documented crash window
        // where neither domain is routed.
        let after_remove = patches[0].1.as_array().unwrap();
        assert!(after_remove.is_empty());
        // Second PATCH adds b.test
        let after_add = &patches[1].1;
        assert_eq!(after_add[0]["match"][0]["host"], json!(["b.test"]));
    }

    #[tokio::test]
    async fn test_patch_failure_propagates() {
        let mut admin = FakeAdmin::new(tree_with_routes("default", json!([])));
        admin.fail_patch_with_status = Some(500);
        let sync = ConfigSynchronizer::new(&admin);

        match sync.upsert_site("a.test", &proxy_config("127.0.0.1:1")).await {
            Err(Error::RemoteRejected { status: 500, .. }) => {}
            other => panic!("expected RemoteRejected, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_routes_key_treated_as_empty() {
        let tree = json!({
            "apps": { "http": { "servers": { "default": { "listen": [":443"] } } } }
        });
        let admin = FakeAdmin::new(tree);
        let sync = ConfigSynchronizer::new(&admin);

        sync.upsert_site("a.test", &proxy_config("127.0.0.1:8080"))
            .await
            .unwrap();

        assert_eq!(admin.routes("default").as_array().unwrap().len(), 1);
    }
}
