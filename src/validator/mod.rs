//! Validation chain
//!
//! Validators inspect one resource at a time and may buffer tag mutations
//! on it. The chain runs them in registration order, isolates their
//! failures, and commits the resource's buffered mutations exactly once at
//! the end. In pretend mode the commit is skipped and the would-be
//! mutations are logged instead.

pub mod auto_tag_creator;
pub mod counter;

use crate::aws::context::AwsContext;
use crate::aws::error::classify_anyhow_error;
use crate::metrics::MetricsAccumulator;
use crate::resource::event::{resources_from_event, CloudTrailEvent};
use crate::resource::Resource;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// One validation rule.
#[async_trait]
pub trait Validator: Send + Sync {
    /// Rule name, used in logs and failure isolation.
    fn name(&self) -> &str;

    /// Whether this rule applies in the given region and account.
    fn is_enabled_on(&self, _region: &str, _account_id: &str) -> bool {
        true
    }

    /// Inspect `resource`, buffer mutations on it, and return metric
    /// increments to merge into the account's bucket.
    async fn validate(
        &self,
        ctx: &AwsContext,
        account_id: &str,
        resource: &mut Resource,
    ) -> Result<HashMap<String, i64>>;
}

/// Set, replace, or clear one tag on a resource. A missing or empty value
/// clears the tag. No-op when the tag already matches the requested state
/// or the resource cannot be tagged.
pub fn update_tag(resource: &mut Resource, key: &str, value: Option<&str>) {
    if !resource.can_tag() {
        return;
    }
    match value {
        Some(value) if !value.is_empty() => {
            if resource.get_tag(key) != Some(value) {
                resource.tag([(key.to_string(), value.to_string())]);
            }
        }
        _ => {
            if resource.get_tag(key).is_some() {
                resource.untag(&[key.to_string()]);
            }
        }
    }
}

/// Ordered chain of validators with single-commit semantics.
pub struct ValidatorChain {
    validators: Vec<Box<dyn Validator>>,
    pretend: bool,
}

impl ValidatorChain {
    /// A chain in pretend mode logs would-be mutations instead of
    /// committing them. Pretend is the safe default.
    pub fn new(pretend: bool) -> Self {
        Self {
            validators: Vec::new(),
            pretend,
        }
    }

    pub fn register(&mut self, validator: Box<dyn Validator>) {
        self.validators.push(validator);
    }

    pub fn is_pretend(&self) -> bool {
        self.pretend
    }

    /// Run every applicable validator over `resource`, then commit its
    /// buffered mutations once.
    ///
    /// A failing validator is logged and skipped; later validators still
    /// run and still see mutations buffered by the ones before the failure.
    /// Commit failures propagate.
    pub async fn handle_resource(
        &self,
        ctx: &AwsContext,
        account_id: &str,
        account_name: &str,
        resource: &mut Resource,
        metrics: &MetricsAccumulator,
    ) -> Result<()> {
        resource
            .load(ctx)
            .await
            .with_context(|| format!("Failed to load resource {}", resource.id()))?;
        metrics.record_resource(account_id, account_name);

        for validator in &self.validators {
            if !validator.is_enabled_on(ctx.region(), account_id) {
                continue;
            }
            match validator.validate(ctx, account_id, resource).await {
                Ok(increments) => metrics.merge(account_id, account_name, &increments),
                Err(e) => {
                    warn!(
                        validator = %validator.name(),
                        resource = %resource.id(),
                        error = %format!("{:#}", e),
                        "Validator failed, continuing with the rest of the chain"
                    );
                }
            }
        }

        if !resource.has_pending_mutations() {
            return Ok(());
        }
        if self.pretend {
            let (adds, deletes) = resource.pending_view();
            info!(
                resource = %resource.id(),
                adds = ?adds,
                deletes = ?deletes,
                "Pretend mode: skipping tag commit"
            );
            return Ok(());
        }
        resource.commit(ctx).await
    }

    /// Map an event to resources and run the chain over each one
    /// independently. A resource that vanished between the event and
    /// processing is skipped, not an error.
    pub async fn handle_event(
        &self,
        ctx: &AwsContext,
        account_id: &str,
        account_name: &str,
        event: &CloudTrailEvent,
        metrics: &MetricsAccumulator,
    ) -> Result<()> {
        for mut resource in resources_from_event(event) {
            let result = self
                .handle_resource(ctx, account_id, account_name, &mut resource, metrics)
                .await;
            if let Err(e) = result {
                if classify_anyhow_error(&e).is_not_found() {
                    debug!(resource = %resource.id(), "Resource vanished before processing");
                } else {
                    warn!(
                        resource = %resource.id(),
                        event = ?event.event_name(),
                        error = %format!("{:#}", e),
                        "Failed to process event resource"
                    );
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceKind;
    use anyhow::anyhow;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_ctx() -> AwsContext {
        AwsContext::from_credentials("AKID", "secret", "token", "us-east-1")
    }

    struct TaggingValidator;

    #[async_trait]
    impl Validator for TaggingValidator {
        fn name(&self) -> &str {
            "tagging"
        }

        async fn validate(
            &self,
            _ctx: &AwsContext,
            _account_id: &str,
            resource: &mut Resource,
        ) -> Result<HashMap<String, i64>> {
            update_tag(resource, "seen", Some("yes"));
            Ok(HashMap::from([("Tagged".to_string(), 1)]))
        }
    }

    struct FailingValidator {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Validator for FailingValidator {
        fn name(&self) -> &str {
            "failing"
        }

        async fn validate(
            &self,
            _ctx: &AwsContext,
            _account_id: &str,
            _resource: &mut Resource,
        ) -> Result<HashMap<String, i64>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(anyhow!("validator blew up"))
        }
    }

    struct RegionScopedValidator;

    #[async_trait]
    impl Validator for RegionScopedValidator {
        fn name(&self) -> &str {
            "region-scoped"
        }

        fn is_enabled_on(&self, region: &str, _account_id: &str) -> bool {
            region == "eu-west-1"
        }

        async fn validate(
            &self,
            _ctx: &AwsContext,
            _account_id: &str,
            _resource: &mut Resource,
        ) -> Result<HashMap<String, i64>> {
            Ok(HashMap::from([("Scoped".to_string(), 1)]))
        }
    }

    fn loaded_resource() -> Resource {
        Resource::from_json(
            "Volume",
            json!({"VolumeId": "vol-1", "Tags": []}),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_pretend_chain_skips_commit() {
        let mut chain = ValidatorChain::new(true);
        chain.register(Box::new(TaggingValidator));
        let metrics = MetricsAccumulator::new();
        let mut resource = loaded_resource();

        // Pretend mode never reaches the provider, so the offline context
        // must not cause a failure even with mutations pending.
        chain
            .handle_resource(&test_ctx(), "111122223333", "prod", &mut resource, &metrics)
            .await
            .unwrap();

        assert_eq!(resource.get_tag("seen"), Some("yes"));
        assert!(resource.has_pending_mutations());
        assert_eq!(metrics.get("prod", "Tagged"), 1);
        assert_eq!(metrics.get("prod", "Resources"), 1);
    }

    #[tokio::test]
    async fn test_failing_validator_does_not_stop_chain() {
        let mut chain = ValidatorChain::new(true);
        chain.register(Box::new(FailingValidator {
            calls: AtomicUsize::new(0),
        }));
        chain.register(Box::new(TaggingValidator));
        let metrics = MetricsAccumulator::new();
        let mut resource = loaded_resource();

        chain
            .handle_resource(&test_ctx(), "111122223333", "prod", &mut resource, &metrics)
            .await
            .unwrap();

        assert_eq!(metrics.get("prod", "Tagged"), 1);
    }

    #[tokio::test]
    async fn test_disabled_validator_is_skipped() {
        let mut chain = ValidatorChain::new(true);
        chain.register(Box::new(RegionScopedValidator));
        let metrics = MetricsAccumulator::new();
        let mut resource = loaded_resource();

        chain
            .handle_resource(&test_ctx(), "111122223333", "prod", &mut resource, &metrics)
            .await
            .unwrap();

        assert_eq!(metrics.get("prod", "Scoped"), 0);
    }

    #[tokio::test]
    async fn test_handle_event_failed_operation_is_noop() {
        let mut chain = ValidatorChain::new(true);
        chain.register(Box::new(TaggingValidator));
        let metrics = MetricsAccumulator::new();
        let event = CloudTrailEvent::new(json!({
            "eventName": "CreateVolume",
            "errorCode": "Client.UnauthorizedOperation",
            "responseElements": {"volumeId": "vol-1"}
        }));

        chain
            .handle_event(&test_ctx(), "111122223333", "prod", &event, &metrics)
            .await
            .unwrap();

        assert_eq!(metrics.get("prod", "Resources"), 0);
    }

    #[tokio::test]
    async fn test_commit_attempted_after_validator_failure() {
        // Without pretend the chain must reach the commit even when an
        // earlier validator failed. The offline context makes the provider
        // call fail, so an error here proves the commit was attempted with
        // the buffered mutations intact.
        let mut chain = ValidatorChain::new(false);
        chain.register(Box::new(FailingValidator {
            calls: AtomicUsize::new(0),
        }));
        chain.register(Box::new(TaggingValidator));
        let metrics = MetricsAccumulator::new();
        let mut resource = loaded_resource();

        let result = chain
            .handle_resource(&test_ctx(), "111122223333", "prod", &mut resource, &metrics)
            .await;

        assert!(result.is_err(), "commit against the offline provider must fail");
        assert_eq!(metrics.get("prod", "Tagged"), 1);
        assert!(resource.has_pending_mutations());
    }

    #[tokio::test]
    async fn test_non_pretend_chain_without_mutations_never_commits() {
        let mut chain = ValidatorChain::new(false);
        chain.register(Box::new(RegionScopedValidator));
        let metrics = MetricsAccumulator::new();
        let mut resource = loaded_resource();

        // Nothing buffered, so even offline the chain must succeed: the
        // commit is skipped rather than attempted with an empty set.
        chain
            .handle_resource(&test_ctx(), "111122223333", "prod", &mut resource, &metrics)
            .await
            .unwrap();
    }

    #[test]
    fn test_update_tag_noop_when_value_matches() {
        let mut resource = Resource::from_json(
            "Volume",
            json!({"VolumeId": "vol-1", "Tags": [{"Key": "k", "Value": "v"}]}),
        )
        .unwrap();
        update_tag(&mut resource, "k", Some("v"));
        assert!(!resource.has_pending_mutations());

        update_tag(&mut resource, "k", Some("v2"));
        assert!(resource.has_pending_mutations());
        assert_eq!(resource.get_tag("k"), Some("v2"));
    }

    #[test]
    fn test_update_tag_clears_on_missing_or_empty_value() {
        let mut resource = Resource::from_json(
            "Volume",
            json!({"VolumeId": "vol-1", "Tags": [{"Key": "k", "Value": "v"}]}),
        )
        .unwrap();
        update_tag(&mut resource, "k", None);
        assert_eq!(resource.get_tag("k"), None);
        assert!(resource.has_pending_mutations());

        let mut resource = Resource::from_json(
            "Volume",
            json!({"VolumeId": "vol-2", "Tags": [{"Key": "k", "Value": "v"}]}),
        )
        .unwrap();
        update_tag(&mut resource, "k", Some(""));
        assert_eq!(resource.get_tag("k"), None);

        // Clearing an absent tag buffers nothing
        let mut resource =
            Resource::from_json("Volume", json!({"VolumeId": "vol-3", "Tags": []})).unwrap();
        update_tag(&mut resource, "k", None);
        assert!(!resource.has_pending_mutations());
    }

    #[test]
    fn test_update_tag_noop_on_read_only_resource() {
        let mut resource = Resource::from_id(ResourceKind::IamUser, "AIDA123");
        update_tag(&mut resource, "k", Some("v"));
        assert!(!resource.has_pending_mutations());
    }
}
