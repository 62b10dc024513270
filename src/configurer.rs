//! Account configurer contract
//!
//! Configurers run during the Configuring stage of a pass, before any
//! checking. A global configurer runs once per account; a regional one runs
//! per account x region. Their failures never block the Checking stage.

use crate::accounts::Account;
use crate::aws::context::AwsContext;
use anyhow::Result;
use async_trait::async_trait;

#[async_trait]
pub trait Configurer: Send + Sync {
    fn name(&self) -> &str;

    /// Global configurers run once per account; regional ones run per
    /// account x region.
    fn is_global(&self) -> bool {
        false
    }

    fn is_enabled_on(&self, _account_id: &str, _region: Option<&str>) -> bool {
        true
    }

    /// Apply configuration. `region` is `None` for global configurers.
    async fn configure(
        &self,
        ctx: &AwsContext,
        account: &Account,
        region: Option<&str>,
    ) -> Result<()>;
}
