//! Creator auto-tagging.
//!
//! Resources reached through a `Create*` CloudTrail event get a creator tag
//! recording the identity that created them, so ownership is attributable
//! long after the trail has aged out.

use super::{update_tag, Validator};
use crate::aws::context::AwsContext;
use crate::resource::Resource;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use tracing::debug;

/// Tags resources with the ARN of the identity that created them.
pub struct AutoTagCreatorValidator {
    creator_tag: String,
}

impl AutoTagCreatorValidator {
    /// `tag_prefix` namespaces the governance tags, e.g. `policy:`.
    pub fn new(tag_prefix: &str) -> Self {
        Self {
            creator_tag: format!("{}creator", tag_prefix),
        }
    }
}

#[async_trait]
impl Validator for AutoTagCreatorValidator {
    fn name(&self) -> &str {
        "auto-tag-creator"
    }

    async fn validate(
        &self,
        _ctx: &AwsContext,
        _account_id: &str,
        resource: &mut Resource,
    ) -> Result<HashMap<String, i64>> {
        let mut metrics = HashMap::new();

        // Only creation events attribute a creator; CreateTags manipulates
        // tags on a pre-existing resource.
        let Some(event) = resource.origin_event() else {
            return Ok(metrics);
        };
        let Some(name) = event.event_name() else {
            return Ok(metrics);
        };
        if !name.starts_with("Create") || name == "CreateTags" {
            return Ok(metrics);
        }
        if !resource.can_tag() || resource.get_tag(&self.creator_tag).is_some() {
            return Ok(metrics);
        }
        let Some(arn) = event.user_identity_arn().map(|s| s.to_string()) else {
            debug!(resource = %resource.id(), "Creation event without identity ARN");
            return Ok(metrics);
        };

        update_tag(resource, &self.creator_tag, Some(&arn));
        metrics.insert("CreatorTagged".to_string(), 1);
        Ok(metrics)
    }
}
