//! Account directory
//!
//! The list of AWS accounts under governance. Two modes: a static list from
//! configuration, or a dynamic list from the Organizations API refreshed on
//! a TTL. Refresh failures keep serving the last known list.

use crate::aws::context::AwsContext;
use crate::aws::credentials::CredentialCache;
use crate::aws::error::{classify_anyhow_error, ClassifyAwsResult};
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Directory refresh TTL.
const REFRESH_TTL_SECS: i64 = 3600;

/// Cooldown before an unknown account id can trigger another refresh.
/// Prevents refresh storms during event floods full of foreign accounts.
const MISS_COOLDOWN_SECS: i64 = 300;

/// Name returned for account ids the directory does not know.
pub const UNKNOWN_ACCOUNT: &str = "Unknown";

/// One AWS account under governance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub alias: Option<String>,
}

impl Account {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            alias: None,
        }
    }

    /// Display name: alias when resolved, configured/organization name otherwise.
    pub fn display_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Default)]
struct DirectoryState {
    accounts: Vec<Account>,
    expires_at: Option<DateTime<Utc>>,
    miss_attempts: HashMap<String, DateTime<Utc>>,
}

impl DirectoryState {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |e| e < now)
    }

    /// Record a lookup miss for `id` and decide whether a refresh may run.
    fn note_miss(&mut self, id: &str, now: DateTime<Utc>) -> bool {
        match self.miss_attempts.get(id) {
            Some(last) if now - *last < Duration::seconds(MISS_COOLDOWN_SECS) => false,
            _ => {
                self.miss_attempts.insert(id.to_string(), now);
                true
            }
        }
    }

    fn find_name(&self, id: &str) -> Option<String> {
        self.accounts
            .iter()
            .find(|a| a.id == id)
            .map(|a| a.display_name().to_string())
    }
}

/// Directory of accounts under governance.
pub struct AccountDirectory {
    main_account: String,
    is_static: bool,
    inner: Mutex<DirectoryState>,
    // Serializes refreshes without blocking name lookups: the state lock is
    // never held across the Organizations round trip.
    refresh_guard: Mutex<()>,
}

impl AccountDirectory {
    /// Static mode: the configured list is served as-is, never refreshed.
    pub fn from_static(main_account: &str, accounts: Vec<Account>) -> Self {
        let mut state = DirectoryState {
            accounts,
            expires_at: None,
            miss_attempts: HashMap::new(),
        };
        sort_accounts(&mut state.accounts, main_account);
        Self {
            main_account: main_account.to_string(),
            is_static: true,
            inner: Mutex::new(state),
            refresh_guard: Mutex::new(()),
        }
    }

    /// Dynamic mode: the list is fetched from the Organizations API and
    /// refreshed when the TTL expires.
    pub fn dynamic(main_account: &str) -> Self {
        Self {
            main_account: main_account.to_string(),
            is_static: false,
            inner: Mutex::new(DirectoryState::default()),
            refresh_guard: Mutex::new(()),
        }
    }

    pub fn main_account_id(&self) -> &str {
        &self.main_account
    }

    pub fn is_main_account(&self, id: &str) -> bool {
        id == self.main_account
    }

    /// Ordered account list: main account first, others by name.
    ///
    /// In dynamic mode an expired list triggers a refresh; when the refresh
    /// fails the stale list keeps being served and the failure is logged.
    pub async fn get_accounts(&self, cache: &CredentialCache) -> Vec<Account> {
        if !self.is_static {
            let expired = self.inner.lock().await.is_expired(Utc::now());
            if expired {
                self.refresh(cache).await;
            }
        }
        self.inner.lock().await.accounts.clone()
    }

    /// Resolve an account id to its known alias/name, or `"Unknown"`.
    ///
    /// A dynamic-mode miss triggers at most one refresh attempt, then a
    /// 5-minute per-id cooldown before that id can trigger another.
    pub async fn get_account_name(&self, cache: &CredentialCache, id: &str) -> String {
        {
            let mut state = self.inner.lock().await;
            if let Some(name) = state.find_name(id) {
                return name;
            }
            if self.is_static || !state.note_miss(id, Utc::now()) {
                return UNKNOWN_ACCOUNT.to_string();
            }
        }
        debug!(account = %id, "Unknown account, refreshing directory");
        self.refresh(cache).await;
        self.inner
            .lock()
            .await
            .find_name(id)
            .unwrap_or_else(|| UNKNOWN_ACCOUNT.to_string())
    }

    /// Refresh the account list from the Organizations API.
    ///
    /// Refreshes serialize on their own lock; the state lock is only taken
    /// for the TTL re-arm and the final store, so lookups keep being served
    /// from the last known list while a refresh is in flight. The TTL is
    /// re-armed even on failure so a broken organization does not turn
    /// every call into a refresh attempt.
    async fn refresh(&self, cache: &CredentialCache) {
        let _refreshing = self.refresh_guard.lock().await;
        self.inner.lock().await.expires_at = Some(Utc::now() + Duration::seconds(REFRESH_TTL_SECS));
        match self.load_organization(cache).await {
            Ok(mut accounts) => {
                sort_accounts(&mut accounts, &self.main_account);
                info!(count = accounts.len(), "Refreshed account directory");
                self.inner.lock().await.accounts = accounts;
            }
            Err(e) => {
                warn!(error = %e, "Cannot refresh account directory, keeping last known list");
            }
        }
    }

    async fn load_organization(&self, cache: &CredentialCache) -> Result<Vec<Account>> {
        let ctx = cache.main_context();
        match self.list_organization_accounts(ctx).await {
            Ok(accounts) => {
                let mut resolved = Vec::with_capacity(accounts.len());
                for mut account in accounts {
                    account.alias = self.resolve_alias(cache, &account.id).await;
                    resolved.push(account);
                }
                Ok(resolved)
            }
            Err(e) => {
                let classified = classify_anyhow_error(&e);
                if classified.code() == Some("AWSOrganizationsNotInUseException") {
                    // Standalone account: degrade to a directory of one.
                    Ok(vec![self.self_account(ctx).await?])
                } else if classified.is_access_denied() {
                    info!("Caller is a sub-account of its organization");
                    Ok(Vec::new())
                } else {
                    Err(e)
                }
            }
        }
    }

    async fn list_organization_accounts(&self, ctx: &AwsContext) -> Result<Vec<Account>> {
        let client = ctx.organizations_client();
        let mut accounts = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let mut request = client.list_accounts();
            if let Some(token) = &next_token {
                request = request.next_token(token);
            }
            let response = request
                .send()
                .await
                .classify_aws()
                .context("Failed to list organization accounts")?;

            for account in response.accounts() {
                let active = matches!(
                    account.status(),
                    Some(aws_sdk_organizations::types::AccountStatus::Active)
                );
                if !active {
                    continue;
                }
                if let (Some(id), Some(name)) = (account.id(), account.name()) {
                    accounts.push(Account::new(id, name));
                }
            }

            match response.next_token() {
                Some(token) => next_token = Some(token.to_string()),
                None => break,
            }
        }

        Ok(accounts)
    }

    /// Resolve the IAM account alias under the target account's own
    /// credentials. Alias resolution is best-effort.
    async fn resolve_alias(&self, cache: &CredentialCache, account_id: &str) -> Option<String> {
        let ctx = match cache.context_for_account(account_id, "us-east-1").await {
            Ok(ctx) => ctx,
            Err(e) => {
                debug!(account = %account_id, error = %e, "Cannot assume role for alias lookup");
                return None;
            }
        };
        account_alias(&ctx).await
    }

    /// Directory entry for a standalone (non-organization) account.
    async fn self_account(&self, ctx: &AwsContext) -> Result<Account> {
        let identity = ctx
            .sts_client()
            .get_caller_identity()
            .send()
            .await
            .context("Failed to get caller identity")?;
        let id = identity
            .account()
            .context("No account ID in caller identity")?;

        let name = account_alias(ctx)
            .await
            .unwrap_or_else(|| format!("AWS Account ID {}", id));
        Ok(Account::new(id, &name))
    }
}

/// Fetch the first IAM account alias, if any.
async fn account_alias(ctx: &AwsContext) -> Option<String> {
    match ctx.iam_client().list_account_aliases().send().await {
        Ok(response) => response.account_aliases().first().cloned(),
        Err(e) => {
            debug!(error = %e, "Cannot list account aliases");
            None
        }
    }
}

/// Sort invariant: the main account first, then by name.
fn sort_accounts(accounts: &mut [Account], main_account: &str) {
    accounts.sort_by(|a, b| {
        if a.id == main_account {
            return std::cmp::Ordering::Less;
        }
        if b.id == main_account {
            return std::cmp::Ordering::Greater;
        }
        a.name.cmp(&b.name)
    });
}
