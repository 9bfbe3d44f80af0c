//! Site model and lifecycle orchestration
//!
//! A site is the stored definition of one managed website: a domain plus
//! type-specific configuration. `SiteManager` sequences storage mutation,
//! remote reconciliation, and audit logging for create/update/delete/toggle,
//! applying a per-operation consistency policy: create fails closed (no
//! local record without a successful remote upsert), update and delete fail
//! open on the remote side (the local change proceeds and the remote error
//! is captured in the audit entry).

use crate::db::{Database, SiteRecord};
use crate::error::{Error, Result};
use crate::sync::{AdminApi, ConfigSynchronizer};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Supported site kinds. Immutable after creation; changing kinds means
/// delete + recreate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SiteType {
    ReverseProxy,
    Static,
}

impl SiteType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SiteType::ReverseProxy => "reverse_proxy",
            SiteType::Static => "static",
        }
    }
}

impl std::fmt::Display for SiteType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Type-specific site configuration, stored JSON-encoded in the `sites`
/// table alongside the `site_type` column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SiteConfig {
    ReverseProxy {
        /// Upstream dial target, e.g. `127.0.0.1:8080`
        target_url: String,
        #[serde(default)]
        preserve_path: bool,
        #[serde(default)]
        strip_prefix: bool,
        /// Custom request-header overrides
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        headers: BTreeMap<String, String>,
    },
    Static {
        /// Filesystem root the file server serves from
        root: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        index_names: Option<Vec<String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        try_files: Option<Vec<String>>,
    },
}

impl SiteConfig {
    pub fn site_type(&self) -> SiteType {
        match self {
            SiteConfig::ReverseProxy { .. } => SiteType::ReverseProxy,
            SiteConfig::Static { .. } => SiteType::Static,
        }
    }

    /// Validate type-specific fields before any remote or storage work
    pub fn validate(&self) -> Result<()> {
        match self {
            SiteConfig::ReverseProxy { target_url, headers, .. } => {
                if target_url.trim().is_empty() {
                    return Err(Error::InvalidSiteConfig(
                        "target URL must not be empty".to_string(),
                    ));
                }
                if headers.keys().any(|k| k.trim().is_empty()) {
                    return Err(Error::InvalidSiteConfig(
                        "header names must not be empty".to_string(),
                    ));
                }
            }
            SiteConfig::Static { root, .. } => {
                if root.trim().is_empty() {
                    return Err(Error::InvalidSiteConfig(
                        "root path must not be empty".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .context("Failed to encode site config")
            .map_err(Error::from)
    }
}

/// A site with its configuration decoded
#[derive(Debug, Clone, Serialize)]
pub struct Site {
    pub id: String,
    pub name: String,
    pub domain: String,
    pub site_type: SiteType,
    pub config: SiteConfig,
    pub enabled: bool,
    pub created_by: String,
    pub created_at: String,
    pub updated_at: String,
}

impl Site {
    fn from_record(record: SiteRecord) -> Result<Self> {
        let config: SiteConfig = serde_json::from_str(&record.config)
            .with_context(|| format!("Corrupt config for site {}", record.id))?;
        Ok(Self {
            id: record.id,
            name: record.name,
            domain: record.domain,
            site_type: config.site_type(),
            config,
            enabled: record.enabled,
            created_by: record.created_by,
            created_at: record.created_at,
            updated_at: record.updated_at,
        })
    }
}

/// Input for creating a site
#[derive(Debug, Clone, Deserialize)]
pub struct NewSite {
    pub name: String,
    pub domain: String,
    pub config: SiteConfig,
}

/// Input for updating a site. The type is carried by `config` and must
/// match the stored one.
#[derive(Debug, Clone, Deserialize)]
pub struct SiteUpdate {
    pub name: String,
    pub domain: String,
    pub config: SiteConfig,
}

/// Orchestrates storage, remote reconciliation, and audit logging
pub struct SiteManager<A> {
    db: Arc<Database>,
    sync: ConfigSynchronizer<A>,
    /// Named account used for audit attribution when no performer is given
    system_actor: String,
}

impl<A: AdminApi> SiteManager<A> {
    pub fn new(db: Arc<Database>, sync: ConfigSynchronizer<A>, system_actor: String) -> Self {
        Self {
            db,
            sync,
            system_actor,
        }
    }

    pub fn synchronizer(&self) -> &ConfigSynchronizer<A> {
        &self.sync
    }

    fn actor<'a>(&'a self, performer: Option<&'a str>) -> &'a str {
        performer.unwrap_or(&self.system_actor)
    }

    pub fn get_site(&self, id: &str) -> Result<Site> {
        let record = self
            .db
            .get_site(id)?
            .ok_or_else(|| Error::NotFound(format!("site {}", id)))?;
        Site::from_record(record)
    }

    pub fn list_sites(&self) -> Result<Vec<Site>> {
        self.db
            .list_sites()?
            .into_iter()
            .map(Site::from_record)
            .collect()
    }

    /// Create a site: validate, reconcile the remote route, then persist.
    ///
    /// Fails closed: if the remote upsert fails, nothing is stored and the
    /// error is surfaced.
    pub async fn create_site(&self, req: NewSite, performer: Option<&str>) -> Result<Site> {
        validate_domain(&req.domain)?;
        req.config.validate()?;

        if self.db.get_site_by_domain(&req.domain)?.is_some() {
            return Err(Error::DomainConflict(req.domain));
        }

        let caddy_response = self.sync.upsert_site(&req.domain, &req.config).await?;

        let record = SiteRecord {
            id: Uuid::new_v4().to_string(),
            name: req.name,
            domain: req.domain,
            site_type: req.config.site_type().as_str().to_string(),
            config: req.config.to_json()?,
            enabled: true,
            created_by: self.actor(performer).to_string(),
            created_at: String::new(),
            updated_at: String::new(),
        };
        self.db.create_site(&record)?;

        let site = self.get_site(&record.id)?;
        self.db.append_activity(
            "create",
            "site",
            Some(&site.id),
            &json!({ "site": site, "caddy_response": caddy_response }),
            self.actor(performer),
        )?;

        info!(id = %site.id, domain = %site.domain, "Site created");
        Ok(site)
    }

    /// Update a site. The remote side is reconciled only when the domain
    /// or the type-specific configuration changed.
    ///
    /// Fails open on remote errors: the local record is still updated and
    /// the error is captured in the audit entry. Leaving a stale local
    /// record was judged worse than a temporarily inconsistent route.
    pub async fn update_site(
        &self,
        id: &str,
        req: SiteUpdate,
        performer: Option<&str>,
    ) -> Result<Site> {
        let before = self.get_site(id)?;

        if req.config.site_type() != before.site_type {
            return Err(Error::InvalidSiteConfig(
                "site type cannot be changed; delete and recreate instead".to_string(),
            ));
        }
        validate_domain(&req.domain)?;
        req.config.validate()?;

        let domain_changed = req.domain != before.domain;
        if domain_changed {
            if let Some(other) = self.db.get_site_by_domain(&req.domain)? {
                if other.id != id {
                    return Err(Error::DomainConflict(req.domain));
                }
            }
        }
        let config_changed = req.config != before.config;

        let mut remote_detail = Value::Null;
        if domain_changed || config_changed {
            let result = if domain_changed {
                self.sync
                    .rename_domain(&before.domain, &req.domain, &req.config)
                    .await
            } else {
                self.sync.upsert_site(&req.domain, &req.config).await
            };

            match result {
                Ok(response) => remote_detail = json!({ "caddy_response": response }),
                Err(e) if e.is_remote() => {
                    warn!(id = %id, error = %e, "Remote reconciliation failed, applying local update anyway");
                    remote_detail = json!({ "caddy_error": e.to_string() });
                }
                Err(e) => return Err(e),
            }
        }

        self.db
            .update_site(id, &req.name, &req.domain, &req.config.to_json()?)?;

        let after = self.get_site(id)?;
        self.db.append_activity(
            "update",
            "site",
            Some(id),
            &json!({ "before": before, "after": after, "remote": remote_detail }),
            self.actor(performer),
        )?;

        info!(id = %id, domain = %after.domain, "Site updated");
        Ok(after)
    }

    /// Delete a site.
    ///
    /// Fails open on the remote side unconditionally: an orphaned local
    /// record for a site the operator asked to delete is worse than a
    /// stale remote route.
    pub async fn delete_site(&self, id: &str, performer: Option<&str>) -> Result<Site> {
        let site = self.get_site(id)?;

        let remote_detail = match self.sync.remove_site(&site.domain).await {
            Ok(response) => json!({ "caddy_response": response }),
            Err(e) => {
                warn!(id = %id, domain = %site.domain, error = %e, "Remote route removal failed, deleting local record anyway");
                json!({ "caddy_error": e.to_string() })
            }
        };

        self.db.delete_site(id)?;

        self.db.append_activity(
            "delete",
            "site",
            Some(id),
            &json!({ "site": site, "remote": remote_detail }),
            self.actor(performer),
        )?;

        info!(id = %id, domain = %site.domain, "Site deleted");
        Ok(site)
    }

    /// Flip the enabled flag.
    ///
    /// Bookkeeping only: the live route is not touched, so a disabled
    /// site keeps serving until it is deleted or updated.
    pub async fn toggle_site(&self, id: &str, performer: Option<&str>) -> Result<Site> {
        let before = self.get_site(id)?;
        let enabled = !before.enabled;

        self.db.set_site_enabled(id, enabled)?;

        self.db.append_activity(
            if enabled { "enable" } else { "disable" },
            "site",
            Some(id),
            &json!({
                "before": { "enabled": before.enabled },
                "after": { "enabled": enabled }
            }),
            self.actor(performer),
        )?;

        info!(id = %id, enabled, "Site toggled");
        self.get_site(id)
    }
}

fn validate_domain(domain: &str) -> Result<()> {
    if domain.trim().is_empty() {
        return Err(Error::InvalidSiteConfig("domain must not be empty".to_string()));
    }
    if domain.chars().any(|c| c.is_whitespace() || c == '/') {
        return Err(Error::InvalidSiteConfig(format!(
            "invalid domain '{}'",
            domain
        )));
    }
    Ok(())
}
