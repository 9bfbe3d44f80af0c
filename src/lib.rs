//! Caddyman - admin backend for sites fronted by a Caddy server
//!
//! This library keeps a set of stored site definitions consistent with the
//! live configuration of a Caddy instance through its admin API:
//! - Stores sites, settings, and an audit log in SQLite
//! - Builds Caddy routes (reverse proxy or static file server) from sites
//! - Reconciles the remote routes array with read-modify-write PATCHes
//! - Applies per-operation consistency policy when storage and remote
//!   disagree on success

pub mod caddy;
pub mod config;
pub mod db;
pub mod error;
pub mod routes;
pub mod sites;
pub mod sync;
