//! Activity log port.

use std::future::Future;
use std::pin::Pin;

use funnelflow_types::contact::ActivityEntry;
use funnelflow_types::error::RepositoryError;

/// Append-only per-contact activity log.
///
/// The engine treats appends as fire-and-forget: failures are logged and
/// never fail the step that produced them.
pub trait ActivityLog: Send + Sync {
    fn append<'a>(
        &'a self,
        entry: &'a ActivityEntry,
    ) -> Pin<Box<dyn Future<Output = Result<(), RepositoryError>> + Send + 'a>>;
}
