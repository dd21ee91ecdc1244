//! User directory trait: identity lookups for quota display and role checks.

use async_trait::async_trait;
use std::collections::HashMap;

use crate::error::Result;
use crate::lead::UserRole;

#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Display names for the given ids. Unknown ids are absent from the map.
    async fn resolve_names(&self, user_ids: &[String]) -> Result<HashMap<String, String>>;

    /// Role of a user, `None` if the user does not exist.
    async fn role_of(&self, user_id: &str) -> Result<Option<UserRole>>;
}
