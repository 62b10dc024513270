//! Cross-account credential cache
//!
//! Owns per-account temporary credentials obtained via STS AssumeRole,
//! tracks expiry and refreshes on demand. A valid cache entry is reused
//! across regions for the same account without a network call.

use crate::aws::context::AwsContext;
use crate::aws::error::ClassifyAwsResult;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, info};

/// Requested session duration for AssumeRole calls.
const SESSION_DURATION_SECS: i32 = 3600;

/// Cached credentials are considered expired 100 seconds before the actual
/// session expiry, so an entry handed out near the boundary stays usable.
const CACHE_LIFETIME_SECS: i64 = 3500;

/// Session name attached to every assumed-role session.
const SESSION_NAME: &str = "cloudwarden-session";

/// A set of temporary credentials for one account.
#[derive(Debug, Clone)]
pub struct SessionCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
    pub expires_at: DateTime<Utc>,
}

impl SessionCredentials {
    fn is_valid(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    fn context(&self, region: &str) -> AwsContext {
        AwsContext::from_credentials(
            &self.access_key_id,
            &self.secret_access_key,
            &self.session_token,
            region,
        )
    }
}

/// Compute the cache expiry for an entry created at `now`.
pub(crate) fn entry_expiry(now: DateTime<Utc>) -> DateTime<Utc> {
    now + Duration::seconds(CACHE_LIFETIME_SECS)
}

/// Per-account credential cache backed by STS AssumeRole.
pub struct CredentialCache {
    main_ctx: AwsContext,
    role_name: String,
    external_id: String,
    entries: Mutex<HashMap<String, SessionCredentials>>,
}

impl CredentialCache {
    /// Create a cache that assumes `role_name` with `external_id` in target
    /// accounts, using `main_ctx` for the STS calls.
    pub fn new(main_ctx: AwsContext, role_name: &str, external_id: &str) -> Self {
        Self {
            main_ctx,
            role_name: role_name.to_string(),
            external_id: external_id.to_string(),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// The context the cache itself runs under (main account).
    pub fn main_context(&self) -> &AwsContext {
        &self.main_ctx
    }

    /// Return a region-scoped context from a still-valid cache entry, if any.
    pub(crate) fn cached_context(&self, account_id: &str, region: &str) -> Option<AwsContext> {
        let entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries
            .get(account_id)
            .filter(|c| c.is_valid(Utc::now()))
            .map(|c| c.context(region))
    }

    /// Obtain a region-scoped context for `account_id` using the configured
    /// role and external id.
    pub async fn context_for_account(&self, account_id: &str, region: &str) -> Result<AwsContext> {
        self.assume_role(account_id, &self.role_name, &self.external_id, region, false)
            .await
    }

    /// Assume `role` in `account_id` and return a region-scoped context.
    ///
    /// A cache hit within validity is cloned with the requested region
    /// substituted and returned without a network call. On a miss (or with
    /// `force_refresh`), one AssumeRole call is made and the entry is stored
    /// with a 100-second safety margin below the actual session expiry.
    /// Failures propagate; the caller decides whether to skip the account.
    pub async fn assume_role(
        &self,
        account_id: &str,
        role: &str,
        external_id: &str,
        region: &str,
        force_refresh: bool,
    ) -> Result<AwsContext> {
        if !force_refresh {
            if let Some(ctx) = self.cached_context(account_id, region) {
                debug!(account = %account_id, region = %region, "Credential cache hit");
                return Ok(ctx);
            }
        }

        let role_arn = format!("arn:aws:iam::{}:role/{}", account_id, role);
        info!(account = %account_id, role = %role, "Assuming role");

        let response = self
            .main_ctx
            .sts_client()
            .assume_role()
            .role_arn(&role_arn)
            .role_session_name(SESSION_NAME)
            .external_id(external_id)
            .duration_seconds(SESSION_DURATION_SECS)
            .send()
            .await
            .classify_aws()
            .with_context(|| format!("Failed to assume role {}", role_arn))?;

        let token = response
            .credentials()
            .context("No credentials in AssumeRole response")?;

        let credentials = SessionCredentials {
            access_key_id: token.access_key_id().to_string(),
            secret_access_key: token.secret_access_key().to_string(),
            session_token: token.session_token().to_string(),
            expires_at: entry_expiry(Utc::now()),
        };

        let ctx = credentials.context(region);
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(account_id.to_string(), credentials);

        Ok(ctx)
    }

    #[cfg(test)]
    pub(crate) fn seed(&self, account_id: &str, credentials: SessionCredentials) {
        self.entries
            .lock()
            .unwrap()
            .insert(account_id.to_string(), credentials);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cache() -> CredentialCache {
        let ctx = AwsContext::from_credentials("AKIDMAIN", "secret", "token", "us-east-1");
        CredentialCache::new(ctx, "governance-role", "external-id")
    }

    fn credentials(expires_at: DateTime<Utc>) -> SessionCredentials {
        SessionCredentials {
            access_key_id: "AKIDCACHED".to_string(),
            secret_access_key: "secret".to_string(),
            session_token: "token".to_string(),
            expires_at,
        }
    }

    #[test]
    fn test_valid_entry_served_without_network() {
        let cache = test_cache();
        cache.seed("111122223333", credentials(Utc::now() + Duration::seconds(600)));

        let ctx = cache.cached_context("111122223333", "eu-west-1");
        assert!(ctx.is_some());
        assert_eq!(ctx.unwrap().region(), "eu-west-1");
    }

    #[test]
    fn test_valid_entry_reused_across_regions() {
        let cache = test_cache();
        cache.seed("111122223333", credentials(Utc::now() + Duration::seconds(600)));

        assert!(cache.cached_context("111122223333", "us-east-1").is_some());
        assert!(cache.cached_context("111122223333", "ap-southeast-2").is_some());
    }

    #[test]
    fn test_expired_entry_is_a_miss() {
        let cache = test_cache();
        cache.seed("111122223333", credentials(Utc::now() - Duration::seconds(1)));

        assert!(cache.cached_context("111122223333", "us-east-1").is_none());
    }

    #[test]
    fn test_unknown_account_is_a_miss() {
        let cache = test_cache();
        assert!(cache.cached_context("999999999999", "us-east-1").is_none());
    }

    #[test]
    fn test_entry_expiry_margin() {
        let now = Utc::now();
        let expiry = entry_expiry(now);
        assert_eq!((expiry - now).num_seconds(), 3500);
        assert!((expiry - now).num_seconds() < SESSION_DURATION_SECS as i64);
    }
}
