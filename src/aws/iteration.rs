//! Cross-account iteration engine
//!
//! Drives a callback over every account (and optionally every region)
//! under governance, sequentially. Credential failures and callback
//! failures are isolated per account/region: logged and skipped, never
//! fatal to the sweep.

use crate::accounts::{Account, AccountDirectory};
use crate::aws::context::AwsContext;
use crate::aws::credentials::CredentialCache;
use anyhow::{Context, Result};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, error, info};

/// Sequential account/region traversal.
pub struct Traversal {
    cache: Arc<CredentialCache>,
    directory: Arc<AccountDirectory>,
    default_region: String,
    regions_override: Option<Vec<String>>,
    regions: OnceCell<Vec<String>>,
}

impl Traversal {
    pub fn new(
        cache: Arc<CredentialCache>,
        directory: Arc<AccountDirectory>,
        default_region: &str,
        regions_override: Option<Vec<String>>,
    ) -> Self {
        Self {
            cache,
            directory,
            default_region: default_region.to_string(),
            regions_override,
            regions: OnceCell::new(),
        }
    }

    pub fn credential_cache(&self) -> &CredentialCache {
        &self.cache
    }

    pub fn directory(&self) -> &AccountDirectory {
        &self.directory
    }

    /// Region list for the sweep: the configured override when present,
    /// otherwise EC2 `DescribeRegions`, fetched once per process.
    pub async fn regions(&self) -> Result<&[String]> {
        let regions = self
            .regions
            .get_or_try_init(|| async {
                if let Some(regions) = &self.regions_override {
                    return Ok(regions.clone());
                }
                list_regions(self.cache.main_context()).await
            })
            .await?;
        Ok(regions)
    }

    /// Run `f` once per account, sequentially, in directory order.
    ///
    /// Assume-role and callback failures are logged and the sweep moves on
    /// to the next account.
    pub async fn for_each_account<F, Fut>(&self, label: &str, f: F)
    where
        F: Fn(AwsContext, Account) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        for account in self.directory.get_accounts(&self.cache).await {
            let ctx = match self
                .cache
                .context_for_account(&account.id, &self.default_region)
                .await
            {
                Ok(ctx) => ctx,
                Err(e) => {
                    error!(
                        account = %account.id,
                        label = %label,
                        error = %format!("{:#}", e),
                        "Cannot assume role, skipping account"
                    );
                    continue;
                }
            };

            debug!(account = %account.id, label = %label, "Visiting account");
            if let Err(e) = f(ctx, account.clone()).await {
                error!(
                    account = %account.id,
                    label = %label,
                    error = %format!("{:#}", e),
                    "Account visit failed, continuing"
                );
            }
        }
    }

    /// Run `f` once per account x region. The region swap reuses the
    /// account's cached credentials, no re-assume per region.
    pub async fn for_each_account_region<F, Fut>(&self, label: &str, f: F)
    where
        F: Fn(AwsContext, Account, String) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let regions = match self.regions().await {
            Ok(regions) => regions.to_vec(),
            Err(e) => {
                error!(error = %format!("{:#}", e), "Cannot list regions, skipping sweep");
                return;
            }
        };

        self.for_each_account(label, |ctx, account| {
            let regions = regions.clone();
            let f = &f;
            async move {
                for region in &regions {
                    let regional = ctx.with_region(region);
                    if let Err(e) = f(regional, account.clone(), region.clone()).await {
                        error!(
                            account = %account.id,
                            region = %region,
                            error = %format!("{:#}", e),
                            "Region visit failed, continuing"
                        );
                    }
                }
                Ok(())
            }
        })
        .await;
        info!(label = %label, "Sweep complete");
    }
}

/// Enumerate enabled regions via EC2 `DescribeRegions`.
async fn list_regions(ctx: &AwsContext) -> Result<Vec<String>> {
    let response = ctx
        .ec2_client()
        .describe_regions()
        .send()
        .await
        .context("Failed to describe regions")?;

    let mut regions: Vec<String> = response
        .regions()
        .iter()
        .filter_map(|r| r.region_name().map(|s| s.to_string()))
        .collect();
    regions.sort();
    Ok(regions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::Account;
    use std::sync::Mutex;

    fn traversal(regions_override: Option<Vec<String>>) -> Traversal {
        let ctx = AwsContext::from_credentials("AKID", "secret", "token", "us-east-1");
        let cache = Arc::new(CredentialCache::new(ctx, "role", "ext"));
        let directory = Arc::new(AccountDirectory::from_static(
            "111111111111",
            vec![
                Account::new("111111111111", "main"),
                Account::new("222222222222", "alpha"),
            ],
        ));
        Traversal::new(cache, directory, "us-east-1", regions_override)
    }

    #[tokio::test]
    async fn test_region_override_skips_describe_regions() {
        let traversal = traversal(Some(vec!["us-east-1".to_string(), "eu-west-1".to_string()]));
        // The offline context cannot call DescribeRegions; the override
        // must satisfy the lookup without it.
        let regions = traversal.regions().await.unwrap();
        assert_eq!(regions, ["us-east-1", "eu-west-1"]);
    }

    #[tokio::test]
    async fn test_for_each_account_skips_unassumable_accounts() {
        let traversal = traversal(Some(vec!["us-east-1".to_string()]));
        let visited = Mutex::new(Vec::<String>::new());

        // No seeded credentials: every assume-role fails offline, so the
        // callback must never run and the sweep must still terminate.
        traversal
            .for_each_account("test", |_ctx, account| async {
                visited.lock().unwrap().push(account.id);
                Ok(())
            })
            .await;

        assert!(visited.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_for_each_account_visits_in_directory_order() {
        let traversal = traversal(Some(vec!["us-east-1".to_string()]));
        for id in ["111111111111", "222222222222"] {
            traversal.cache.seed(
                id,
                crate::aws::credentials::SessionCredentials {
                    access_key_id: "AKID".to_string(),
                    secret_access_key: "secret".to_string(),
                    session_token: "token".to_string(),
                    expires_at: chrono::Utc::now() + chrono::Duration::seconds(600),
                },
            );
        }
        let visited = Mutex::new(Vec::<String>::new());

        traversal
            .for_each_account("test", |_ctx, account| async {
                visited.lock().unwrap().push(account.id);
                Ok(())
            })
            .await;

        assert_eq!(
            *visited.lock().unwrap(),
            ["111111111111", "222222222222"]
        );
    }

    #[tokio::test]
    async fn test_failing_account_does_not_stop_sweep() {
        let traversal = traversal(Some(vec!["us-east-1".to_string()]));
        for id in ["111111111111", "222222222222"] {
            traversal.cache.seed(
                id,
                crate::aws::credentials::SessionCredentials {
                    access_key_id: "AKID".to_string(),
                    secret_access_key: "secret".to_string(),
                    session_token: "token".to_string(),
                    expires_at: chrono::Utc::now() + chrono::Duration::seconds(600),
                },
            );
        }
        let visited = Mutex::new(Vec::<String>::new());

        traversal
            .for_each_account("test", |_ctx, account| async {
                visited.lock().unwrap().push(account.id.clone());
                anyhow::bail!("visit failed for {}", account.id)
            })
            .await;

        assert_eq!(visited.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_for_each_account_region_covers_the_grid() {
        let traversal = traversal(Some(vec!["us-east-1".to_string(), "eu-west-1".to_string()]));
        for id in ["111111111111", "222222222222"] {
            traversal.cache.seed(
                id,
                crate::aws::credentials::SessionCredentials {
                    access_key_id: "AKID".to_string(),
                    secret_access_key: "secret".to_string(),
                    session_token: "token".to_string(),
                    expires_at: chrono::Utc::now() + chrono::Duration::seconds(600),
                },
            );
        }
        let visited = Mutex::new(Vec::<(String, String)>::new());

        traversal
            .for_each_account_region("test", |ctx, account, region| {
                assert_eq!(ctx.region(), region);
                visited.lock().unwrap().push((account.id, region));
                async { Ok(()) }
            })
            .await;

        assert_eq!(visited.lock().unwrap().len(), 4);
    }
}
