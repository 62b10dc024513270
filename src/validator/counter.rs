//! Per-kind resource counter.

use super::Validator;
use crate::aws::context::AwsContext;
use crate::resource::Resource;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;

/// Counts resources by kind: every resource contributes `{<kind name>: 1}`.
pub struct CounterValidator;

#[async_trait]
impl Validator for CounterValidator {
    fn name(&self) -> &str {
        "counter"
    }

    async fn validate(
        &self,
        _ctx: &AwsContext,
        _account_id: &str,
        resource: &mut Resource,
    ) -> Result<HashMap<String, i64>> {
        Ok(HashMap::from([(resource.kind().name().to_string(), 1)]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceKind;

    #[tokio::test]
    async fn test_counts_by_kind_name() {
        let ctx = AwsContext::from_credentials("AKID", "secret", "token", "us-east-1");
        let mut resource = Resource::from_id(ResourceKind::Volume, "vol-1");

        let metrics = CounterValidator
            .validate(&ctx, "111122223333", &mut resource)
            .await
            .unwrap();
        assert_eq!(metrics, HashMap::from([("Volume".to_string(), 1)]));
    }
}
