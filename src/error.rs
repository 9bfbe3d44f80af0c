//! Error taxonomy for site reconciliation

use thiserror::Error;

/// Errors surfaced by the Caddy client, synchronizer, and site manager
#[derive(Debug, Error)]
pub enum Error {
    /// The Caddy admin API could not be reached (network error or timeout)
    #[error("Caddy admin API unavailable: {0}")]
    RemoteUnavailable(String),

    /// The Caddy admin API answered with a non-2xx status
    #[error("Caddy admin API rejected the request ({status}): {body}")]
    RemoteRejected { status: u16, body: String },

    /// The fetched configuration has no HTTP server to attach routes to
    #[error("no HTTP server configured on the Caddy side (expected 'default' or 'srv0')")]
    NoServerConfigured,

    /// A site with this domain already exists
    #[error("a site for domain '{0}' already exists")]
    DomainConflict(String),

    /// Type-specific site configuration failed validation
    #[error("invalid site configuration: {0}")]
    InvalidSiteConfig(String),

    /// Unknown site id or domain
    #[error("not found: {0}")]
    NotFound(String),

    /// Persistence layer failure
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl Error {
    /// Whether this error came from the remote side rather than local
    /// validation or storage. The site manager uses this to decide which
    /// failures are recorded-and-tolerated on update/delete.
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            Error::RemoteUnavailable(_) | Error::RemoteRejected { .. } | Error::NoServerConfigured
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
