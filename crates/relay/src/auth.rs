use async_trait::async_trait;

use crate::types::Identity;

/// Maps a connection's credential to an identity.
#[async_trait]
pub trait AuthResolver: Send + Sync {
    /// `None` rejects the connection.
    async fn resolve(&self, token: &str) -> Option<Identity>;
}
