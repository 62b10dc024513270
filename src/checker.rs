//! Cron check pass
//!
//! One pass sweeps every account (and region) under governance:
//! Configuring runs the registered configurers, Checking enumerates the
//! resource checklists and feeds each resource through the validation
//! chain, Reporting flushes the metrics to the sink. Every stage is
//! best-effort; a broken account, region, or checklist entry is logged
//! and skipped.

use crate::accounts::Account;
use crate::aws::context::AwsContext;
use crate::aws::iteration::Traversal;
use crate::configurer::Configurer;
use crate::metrics::MetricsAccumulator;
use crate::resource::{Resource, ResourceKind};
use crate::sink::Sink;
use crate::validator::ValidatorChain;
use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// Stage of the pass state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PassStage {
    Idle,
    Configuring,
    Checking,
    Reporting,
}

impl fmt::Display for PassStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PassStage::Idle => "idle",
            PassStage::Configuring => "configuring",
            PassStage::Checking => "checking",
            PassStage::Reporting => "reporting",
        };
        f.write_str(name)
    }
}

/// Regional checklist, in fixed order.
const REGIONAL_CHECKLIST: &[ResourceKind] = &[
    ResourceKind::Ec2Instance,
    ResourceKind::Volume,
    ResourceKind::Snapshot,
    ResourceKind::SecurityGroup,
    ResourceKind::Ami,
    ResourceKind::Eip,
    ResourceKind::NetworkInterface,
    ResourceKind::InternetGateway,
    ResourceKind::NatGateway,
    ResourceKind::Subnet,
    ResourceKind::Vpc,
];

/// Global (per-account, region-independent) checklist.
const GLOBAL_CHECKLIST: &[ResourceKind] = &[ResourceKind::S3Bucket, ResourceKind::IamUser];

/// Scheduled pass runner: traversal + configurers + chain + sink.
pub struct CronChecker {
    traversal: Arc<Traversal>,
    chain: Arc<ValidatorChain>,
    configurers: Vec<Box<dyn Configurer>>,
    sink: Arc<dyn Sink>,
    metrics_index: String,
}

impl CronChecker {
    pub fn new(
        traversal: Arc<Traversal>,
        chain: Arc<ValidatorChain>,
        sink: Arc<dyn Sink>,
        metrics_index: &str,
    ) -> Self {
        Self {
            traversal,
            chain,
            configurers: Vec::new(),
            sink,
            metrics_index: metrics_index.to_string(),
        }
    }

    pub fn register_configurer(&mut self, configurer: Box<dyn Configurer>) {
        self.configurers.push(configurer);
    }

    fn enter(&self, stage: PassStage) {
        info!(stage = %stage, "Pass stage");
    }

    /// Run one full pass and return its metrics.
    pub async fn run_check_pass(&self) -> Result<MetricsAccumulator> {
        let started = Utc::now();
        let metrics = MetricsAccumulator::new();

        self.enter(PassStage::Configuring);
        self.run_configurers().await;

        self.enter(PassStage::Checking);
        self.traversal
            .for_each_account_region("regional-checks", |ctx, account, _region| {
                self.check_region(ctx, account, &metrics)
            })
            .await;
        self.traversal
            .for_each_account("global-checks", |ctx, account| {
                self.check_account_global(ctx, account, &metrics)
            })
            .await;

        self.enter(PassStage::Reporting);
        let elapsed = (Utc::now() - started).num_seconds();
        let timestamp = started.to_rfc3339();
        for (account, document) in metrics.documents(&timestamp) {
            let id = format!("{}-{}", started.timestamp(), account);
            self.sink.index(&self.metrics_index, &id, &document).await;
        }
        info!(elapsed_secs = elapsed, "Pass complete\n{}", metrics.report());

        self.enter(PassStage::Idle);
        Ok(metrics)
    }

    /// Configuring stage: global configurers once per account, regional
    /// ones per account x region. A configurer failure never blocks the
    /// Checking stage.
    async fn run_configurers(&self) {
        if self.configurers.is_empty() {
            return;
        }
        self.traversal
            .for_each_account("global-configurers", |ctx, account| async move {
                for configurer in &self.configurers {
                    if !configurer.is_global() || !configurer.is_enabled_on(&account.id, None) {
                        continue;
                    }
                    if let Err(e) = configurer.configure(&ctx, &account, None).await {
                        warn!(
                            configurer = %configurer.name(),
                            account = %account.id,
                            error = %format!("{:#}", e),
                            "Configurer failed"
                        );
                    }
                }
                Ok(())
            })
            .await;
        self.traversal
            .for_each_account_region("regional-configurers", |ctx, account, region| async move {
                for configurer in &self.configurers {
                    if configurer.is_global()
                        || !configurer.is_enabled_on(&account.id, Some(&region))
                    {
                        continue;
                    }
                    if let Err(e) = configurer.configure(&ctx, &account, Some(&region)).await {
                        warn!(
                            configurer = %configurer.name(),
                            account = %account.id,
                            region = %region,
                            error = %format!("{:#}", e),
                            "Configurer failed"
                        );
                    }
                }
                Ok(())
            })
            .await;
    }

    /// Regional checklist for one account x region, each check isolated.
    async fn check_region(
        &self,
        ctx: AwsContext,
        account: Account,
        metrics: &MetricsAccumulator,
    ) -> Result<()> {
        for kind in REGIONAL_CHECKLIST {
            match enumerate_regional(&ctx, *kind).await {
                Ok(raws) => {
                    self.run_resources(&ctx, &account, *kind, raws, metrics)
                        .await;
                }
                Err(e) => {
                    warn!(
                        check = %kind.name(),
                        account = %account.id,
                        region = %ctx.region(),
                        error = %format!("{:#}", e),
                        "Checklist enumeration failed"
                    );
                }
            }
        }
        Ok(())
    }

    /// Global checklist for one account.
    async fn check_account_global(
        &self,
        ctx: AwsContext,
        account: Account,
        metrics: &MetricsAccumulator,
    ) -> Result<()> {
        for kind in GLOBAL_CHECKLIST {
            match enumerate_global(&ctx, *kind).await {
                Ok(raws) => {
                    self.run_resources(&ctx, &account, *kind, raws, metrics)
                        .await;
                }
                Err(e) => {
                    warn!(
                        check = %kind.name(),
                        account = %account.id,
                        error = %format!("{:#}", e),
                        "Checklist enumeration failed"
                    );
                }
            }
        }
        Ok(())
    }

    async fn run_resources(
        &self,
        ctx: &AwsContext,
        account: &Account,
        kind: ResourceKind,
        raws: Vec<Value>,
        metrics: &MetricsAccumulator,
    ) {
        for raw in raws {
            let Some(mut resource) = Resource::from_json(kind.name(), raw) else {
                continue;
            };
            let result = self
                .chain
                .handle_resource(ctx, &account.id, account.display_name(), &mut resource, metrics)
                .await;
            if let Err(e) = result {
                warn!(
                    resource = %resource.id(),
                    account = %account.id,
                    error = %format!("{:#}", e),
                    "Resource check failed"
                );
            }
        }
    }
}

fn ec2_tags_json(tags: &[aws_sdk_ec2::types::Tag]) -> Value {
    Value::Array(
        tags.iter()
            .map(|t| json!({"Key": t.key(), "Value": t.value()}))
            .collect(),
    )
}

/// Enumerate one regional checklist entry into raw payloads.
async fn enumerate_regional(ctx: &AwsContext, kind: ResourceKind) -> Result<Vec<Value>> {
    let client = ctx.ec2_client();
    let raws = match kind {
        ResourceKind::Ec2Instance => {
            let response = client
                .describe_instances()
                .send()
                .await
                .context("Failed to describe instances")?;
            response
                .reservations()
                .iter()
                .flat_map(|r| r.instances())
                .map(|i| {
                    json!({
                        "InstanceId": i.instance_id(),
                        "InstanceType": i.instance_type().map(|t| t.as_str()),
                        "State": i.state().and_then(|s| s.name()).map(|n| n.as_str()),
                        "Tags": ec2_tags_json(i.tags()),
                    })
                })
                .collect()
        }
        ResourceKind::Volume => {
            let response = client
                .describe_volumes()
                .send()
                .await
                .context("Failed to describe volumes")?;
            response
                .volumes()
                .iter()
                .map(|v| {
                    json!({
                        "VolumeId": v.volume_id(),
                        "Size": v.size(),
                        "State": v.state().map(|s| s.as_str()),
                        "Tags": ec2_tags_json(v.tags()),
                    })
                })
                .collect()
        }
        ResourceKind::Snapshot => {
            let response = client
                .describe_snapshots()
                .owner_ids("self")
                .send()
                .await
                .context("Failed to describe snapshots")?;
            response
                .snapshots()
                .iter()
                .map(|s| {
                    json!({
                        "SnapshotId": s.snapshot_id(),
                        "VolumeId": s.volume_id(),
                        "State": s.state().map(|st| st.as_str()),
                        "Tags": ec2_tags_json(s.tags()),
                    })
                })
                .collect()
        }
        ResourceKind::SecurityGroup => {
            let response = client
                .describe_security_groups()
                .send()
                .await
                .context("Failed to describe security groups")?;
            response
                .security_groups()
                .iter()
                .map(|g| {
                    json!({
                        "GroupId": g.group_id(),
                        "GroupName": g.group_name(),
                        "VpcId": g.vpc_id(),
                        "Tags": ec2_tags_json(g.tags()),
                    })
                })
                .collect()
        }
        ResourceKind::Ami => {
            let response = client
                .describe_images()
                .owners("self")
                .send()
                .await
                .context("Failed to describe images")?;
            response
                .images()
                .iter()
                .map(|i| {
                    json!({
                        "ImageId": i.image_id(),
                        "Name": i.name(),
                        "Tags": ec2_tags_json(i.tags()),
                    })
                })
                .collect()
        }
        ResourceKind::Eip => {
            let response = client
                .describe_addresses()
                .send()
                .await
                .context("Failed to describe addresses")?;
            response
                .addresses()
                .iter()
                .map(|a| {
                    json!({
                        "AllocationId": a.allocation_id(),
                        "PublicIp": a.public_ip(),
                        "Tags": ec2_tags_json(a.tags()),
                    })
                })
                .collect()
        }
        ResourceKind::NetworkInterface => {
            let response = client
                .describe_network_interfaces()
                .send()
                .await
                .context("Failed to describe network interfaces")?;
            response
                .network_interfaces()
                .iter()
                .map(|n| {
                    json!({
                        "NetworkInterfaceId": n.network_interface_id(),
                        "Status": n.status().map(|s| s.as_str()),
                        "TagSet": ec2_tags_json(n.tag_set()),
                    })
                })
                .collect()
        }
        ResourceKind::InternetGateway => {
            let response = client
                .describe_internet_gateways()
                .send()
                .await
                .context("Failed to describe internet gateways")?;
            response
                .internet_gateways()
                .iter()
                .map(|g| {
                    json!({
                        "InternetGatewayId": g.internet_gateway_id(),
                        "Tags": ec2_tags_json(g.tags()),
                    })
                })
                .collect()
        }
        ResourceKind::NatGateway => {
            let response = client
                .describe_nat_gateways()
                .send()
                .await
                .context("Failed to describe NAT gateways")?;
            response
                .nat_gateways()
                .iter()
                .map(|g| {
                    json!({
                        "NatGatewayId": g.nat_gateway_id(),
                        "State": g.state().map(|s| s.as_str()),
                        "Tags": ec2_tags_json(g.tags()),
                    })
                })
                .collect()
        }
        ResourceKind::Subnet => {
            let response = client
                .describe_subnets()
                .send()
                .await
                .context("Failed to describe subnets")?;
            response
                .subnets()
                .iter()
                .map(|s| {
                    json!({
                        "SubnetId": s.subnet_id(),
                        "VpcId": s.vpc_id(),
                        "CidrBlock": s.cidr_block(),
                        "Tags": ec2_tags_json(s.tags()),
                    })
                })
                .collect()
        }
        ResourceKind::Vpc => {
            let response = client
                .describe_vpcs()
                .send()
                .await
                .context("Failed to describe VPCs")?;
            response
                .vpcs()
                .iter()
                .map(|v| {
                    json!({
                        "VpcId": v.vpc_id(),
                        "CidrBlock": v.cidr_block(),
                        "IsDefault": v.is_default(),
                        "Tags": ec2_tags_json(v.tags()),
                    })
                })
                .collect()
        }
        _ => Vec::new(),
    };
    Ok(raws)
}

/// Enumerate one global checklist entry into raw payloads.
async fn enumerate_global(ctx: &AwsContext, kind: ResourceKind) -> Result<Vec<Value>> {
    let raws = match kind {
        ResourceKind::S3Bucket => {
            let response = ctx
                .s3_client()
                .list_buckets()
                .send()
                .await
                .context("Failed to list buckets")?;
            response
                .buckets()
                .iter()
                .map(|b| json!({"Name": b.name()}))
                .collect()
        }
        ResourceKind::IamUser => {
            let response = ctx
                .iam_client()
                .list_users()
                .send()
                .await
                .context("Failed to list users")?;
            response
                .users()
                .iter()
                .map(|u| {
                    json!({
                        "UserId": u.user_id(),
                        "UserName": u.user_name(),
                        "Arn": u.arn(),
                    })
                })
                .collect()
        }
        _ => Vec::new(),
    };
    Ok(raws)
}
