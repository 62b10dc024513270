//! cloudwarden: multi-account AWS governance
//!
//! Sweeps every account of an organization for resources, enforces tagging
//! policy through a validator chain, and follows CloudTrail in near real
//! time to catch resources as they appear.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use cloudwarden::accounts::AccountDirectory;
use cloudwarden::aws::context::AwsContext;
use cloudwarden::aws::credentials::CredentialCache;
use cloudwarden::aws::iteration::Traversal;
use cloudwarden::checker::CronChecker;
use cloudwarden::cloudtrail::TrailProcessor;
use cloudwarden::config::Config;
use cloudwarden::resource::event::CloudTrailEvent;
use cloudwarden::sink::{EsSink, NullSink, Sink};
use cloudwarden::validator::auto_tag_creator::AutoTagCreatorValidator;
use cloudwarden::validator::counter::CounterValidator;
use cloudwarden::validator::ValidatorChain;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "cloudwarden")]
#[command(about = "Multi-account AWS resource governance")]
#[command(version)]
struct Args {
    /// Path to the JSON configuration file
    #[arg(short, long, default_value = "cloudwarden.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one full check pass over every account and region
    Check,

    /// Listen for CloudTrail notifications on the configured SQS queue
    Listen,

    /// Replay a single CloudTrail event from a file
    Event {
        /// File containing one CloudTrail event as JSON
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Print the account directory
    Accounts,
}

/// Long-lived services shared by every subcommand.
struct Runtime {
    config: Config,
    cache: Arc<CredentialCache>,
    directory: Arc<AccountDirectory>,
    chain: Arc<ValidatorChain>,
    sink: Arc<dyn Sink>,
}

impl Runtime {
    async fn build(config: Config) -> Self {
        let main_ctx = AwsContext::new(&config.default_region).await;
        let cache = Arc::new(CredentialCache::new(
            main_ctx,
            &config.role.role_name,
            &config.role.external_id,
        ));

        let directory = Arc::new(match &config.accounts {
            Some(accounts) => {
                AccountDirectory::from_static(&config.role.main_account, accounts.clone())
            }
            None => AccountDirectory::dynamic(&config.role.main_account),
        });

        let mut chain = ValidatorChain::new(config.pretend);
        chain.register(Box::new(CounterValidator));
        chain.register(Box::new(AutoTagCreatorValidator::new(&config.tag_prefix)));
        if config.pretend {
            info!("Pretend mode: tag mutations will be logged, not committed");
        }

        let sink: Arc<dyn Sink> = match &config.elasticsearch {
            Some(es) => Arc::new(EsSink::new(&es.endpoint)),
            None => Arc::new(NullSink),
        };

        Self {
            config,
            cache,
            directory,
            chain: Arc::new(chain),
            sink,
        }
    }

    fn traversal(&self) -> Arc<Traversal> {
        Arc::new(Traversal::new(
            self.cache.clone(),
            self.directory.clone(),
            &self.config.default_region,
            self.config.regions.clone(),
        ))
    }

    fn trail_processor(&self) -> TrailProcessor {
        let prefix = self
            .config
            .elasticsearch
            .as_ref()
            .map(|es| es.events_index_prefix.clone())
            .unwrap_or_else(|| "logstash-".to_string());
        TrailProcessor::new(
            self.cache.clone(),
            self.directory.clone(),
            self.chain.clone(),
            self.sink.clone(),
            &prefix,
            &self.config.default_region,
        )
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();
    let config = Config::load(&args.config)?;
    let runtime = Runtime::build(config).await;

    match args.command {
        Command::Check => {
            let metrics_index = runtime
                .config
                .elasticsearch
                .as_ref()
                .map(|es| es.metrics_index.clone())
                .unwrap_or_else(|| "metrics".to_string());
            let checker = CronChecker::new(
                runtime.traversal(),
                runtime.chain.clone(),
                runtime.sink.clone(),
                &metrics_index,
            );
            checker.run_check_pass().await?;
        }
        Command::Listen => {
            let Some(queue_url) = runtime.config.queue_url.clone() else {
                bail!("No queue_url configured");
            };
            runtime.trail_processor().poll_queue(&queue_url).await?;
        }
        Command::Event { file } => {
            let body = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read event file {}", file.display()))?;
            let payload = serde_json::from_str(&body)
                .with_context(|| format!("Failed to parse event file {}", file.display()))?;
            runtime
                .trail_processor()
                .process_event(CloudTrailEvent::new(payload))
                .await;
        }
        Command::Accounts => {
            for account in runtime.directory.get_accounts(&runtime.cache).await {
                println!("{}  {}", account.id, account.display_name());
            }
        }
    }

    Ok(())
}
