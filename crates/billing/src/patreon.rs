//! Patreon membership links.
//!
//! The OAuth token exchange happens in the storefront; this service is handed
//! the resulting membership and owns the stored link. A re-link replaces the
//! row wholesale (delete then insert) so stale unique-constraint collisions
//! cannot occur.

use uuid::Uuid;

use crate::error::BillingResult;
use crate::store::{BillingStore, PatreonLink};

#[derive(Clone)]
pub struct PatreonService {
    store: BillingStore,
}

impl PatreonService {
    pub fn new(store: BillingStore) -> Self {
        Self { store }
    }

    /// Create or replace the user's membership link.
    pub async fn link(&self, link: PatreonLink) -> BillingResult<()> {
        self.store.replace_patreon_link(&link).await?;

        tracing::info!(
            user_id = %link.user_id,
            patreon_member_id = %link.patreon_member_id,
            is_active = link.is_active,
            tier = ?link.tier,
            "Patreon link replaced"
        );

        Ok(())
    }

    /// Mark the link inactive without removing it. Returns false when the
    /// user had no link.
    pub async fn unlink(&self, user_id: Uuid) -> BillingResult<bool> {
        let rows = self.store.deactivate_patreon_link(user_id).await?;

        if rows > 0 {
            tracing::info!(user_id = %user_id, "Patreon link deactivated");
        }

        Ok(rows > 0)
    }

    pub async fn link_for_user(&self, user_id: Uuid) -> BillingResult<Option<PatreonLink>> {
        self.store.patreon_link_for_user(user_id).await
    }
}
