//! aidlink - headless listing screen
//!
//! ViewModel を本物のサーバーに対して activate し、snapshot が変わるたびに 1 行出力する。
//! Ctrl-C で deactivate してから終了する。
//!
//! ```text
//! aidlink watch --listing 12 --user 42 --request
//! aidlink --api-url http://10.0.2.2:5000 browse --user 7 --role organization --status completed
//! aidlink browse --user 42 --mine --outcome accepted
//! ```

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use aidlink_core::app::collection_view::{CollectionSnapshot, own_query};
use aidlink_core::app::{Role, Viewer};
use aidlink_core::domain::{CollectionQuery, ListingId, ListingStatus, RequestOutcome, UserId};
use aidlink_core::impls::HttpListingService;
use aidlink_core::ports::{Clock, SystemClock};
use aidlink_core::{ListingCollectionViewModel, ListingSnapshot, ListingViewModel, SyncConfig};
use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "aidlink", version, about = "Follow relief listings and requests from the terminal")]
struct Cli {
    /// Base URL of the listing service (overrides AIDLINK_API_URL).
    #[arg(long, global = true)]
    api_url: Option<Url>,

    /// Per-request HTTP timeout in milliseconds (overrides AIDLINK_TIMEOUT_MS).
    #[arg(long, global = true, value_parser = clap::value_parser!(u64).range(1..))]
    timeout_ms: Option<u64>,

    /// Print snapshots as JSON lines.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch one listing (status, your request, verification).
    Watch(WatchArgs),

    /// Watch the listing collection.
    Browse(BrowseArgs),
}

#[derive(Args, Debug)]
struct ViewerArgs {
    /// Account id of the viewer.
    #[arg(long)]
    user: String,

    #[arg(long, value_enum, default_value_t = RoleArg::Public)]
    role: RoleArg,
}

#[derive(Args, Debug)]
struct WatchArgs {
    #[arg(long)]
    listing: String,

    #[command(flatten)]
    viewer: ViewerArgs,

    /// Submit a request once the first snapshot allows it.
    #[arg(long)]
    request: bool,

    /// Listing poll period in milliseconds (overrides AIDLINK_LISTING_POLL_MS).
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    poll_ms: Option<u64>,
}

#[derive(Args, Debug)]
struct BrowseArgs {
    #[command(flatten)]
    viewer: ViewerArgs,

    /// Status filter for organizations and admins (public users always see nearby listings).
    #[arg(long, value_enum, default_value_t = StatusFilter::All)]
    status: StatusFilter,

    /// Your own tab: requested listings (public users) or created listings (organizations).
    #[arg(long, conflicts_with = "status")]
    mine: bool,

    /// With --mine, only requests with this outcome.
    #[arg(long, value_enum, requires = "mine")]
    outcome: Option<OutcomeFilter>,

    /// Collection poll period in milliseconds (overrides AIDLINK_COLLECTION_POLL_MS).
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    poll_ms: Option<u64>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum RoleArg {
    Public,
    Organization,
    Admin,
}

impl From<RoleArg> for Role {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::Public => Role::PublicUser,
            RoleArg::Organization => Role::Organization,
            RoleArg::Admin => Role::Admin,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum StatusFilter {
    All,
    Active,
    Closed,
    Completed,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum OutcomeFilter {
    Pending,
    Accepted,
    Rejected,
}

impl From<OutcomeFilter> for RequestOutcome {
    fn from(outcome: OutcomeFilter) -> Self {
        match outcome {
            OutcomeFilter::Pending => RequestOutcome::Pending,
            OutcomeFilter::Accepted => RequestOutcome::Accepted,
            OutcomeFilter::Rejected => RequestOutcome::Rejected,
        }
    }
}

impl StatusFilter {
    fn query(self) -> CollectionQuery {
        match self {
            StatusFilter::All => CollectionQuery::All,
            StatusFilter::Active => CollectionQuery::Status(ListingStatus::Active),
            StatusFilter::Closed => CollectionQuery::Status(ListingStatus::Closed),
            StatusFilter::Completed => CollectionQuery::Status(ListingStatus::Completed),
        }
    }
}

impl ViewerArgs {
    fn viewer(&self) -> Viewer {
        Viewer::new(UserId::from(self.user.as_str()), self.role.into())
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<SyncConfig> {
    let mut config = SyncConfig::from_env().context("invalid AIDLINK_* environment")?;
    if let Some(url) = &cli.api_url {
        config.api_url = url.clone();
    }
    if let Some(ms) = cli.timeout_ms {
        config.request_timeout = Duration::from_millis(ms);
    }
    match &cli.command {
        Commands::Watch(args) => {
            if let Some(ms) = args.poll_ms {
                config.listing_poll_interval = Duration::from_millis(ms);
            }
        }
        Commands::Browse(args) => {
            if let Some(ms) = args.poll_ms {
                config.collection_poll_interval = Duration::from_millis(ms);
            }
        }
    }
    config.validate()?;
    Ok(config)
}

fn print_listing(snapshot: &ListingSnapshot, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string(snapshot)?);
        return Ok(());
    }
    let Some(listing) = &snapshot.listing else {
        println!("(waiting for listing)");
        return Ok(());
    };
    let mut line = format!(
        "{} status={} quantity={} request={:?}",
        listing.id,
        listing.status.as_str(),
        listing.quantity,
        snapshot.request
    );
    if let Some(v) = &snapshot.verification {
        line.push_str(&format!(" verified={}", v.is_verified));
    }
    if snapshot.allocation_in_progress {
        line.push_str(" [allocation running]");
    }
    if snapshot.can_view_accepted_users {
        line.push_str(" [accepted users available]");
    }
    if snapshot.stale {
        line.push_str(" [stale]");
    }
    println!("{line}");
    Ok(())
}

fn print_collection(snapshot: &CollectionSnapshot, clock: &dyn Clock, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string(snapshot)?);
        return Ok(());
    }
    println!("{} listings{}", snapshot.items.len(), if snapshot.stale { " [stale]" } else { "" });
    for row in &snapshot.items {
        let window = row.request_window();
        let when = if window.is_open(clock.now()) {
            format!("{} left to request!", window.countdown(clock.now()))
        } else {
            "requests closed".to_string()
        };
        println!(
            "  {} {} x{} @ {} ({when})",
            row.id,
            row.resource_type.as_deref().unwrap_or("-"),
            row.quantity,
            row.location_name.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}

async fn run_watch(args: &WatchArgs, config: SyncConfig, json: bool) -> anyhow::Result<()> {
    let service = Arc::new(HttpListingService::from_config(&config)?);
    let mut vm = ListingViewModel::new(
        service,
        ListingId::from(args.listing.as_str()),
        args.viewer.viewer(),
        config,
    );
    let mut updates = vm.subscribe();
    let mut pending_request = args.request;

    vm.activate()?;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = updates.changed() => {
                changed.context("snapshot channel closed")?;
                let snapshot = updates.borrow_and_update().clone();
                print_listing(&snapshot, json)?;

                if pending_request && snapshot.listing.is_some() && snapshot.verification.is_some() {
                    pending_request = false;
                    match vm.submit_request().await {
                        Ok(outcome) => info!(?outcome, "request submitted"),
                        Err(err) => warn!(error = %err, "request refused"),
                    }
                }
            }
        }
    }
    vm.deactivate();
    info!(stats = ?vm.listing_stats(), "stopped");
    Ok(())
}

async fn run_browse(args: &BrowseArgs, config: SyncConfig, json: bool) -> anyhow::Result<()> {
    let service = Arc::new(HttpListingService::from_config(&config)?);
    let viewer = args.viewer.viewer();
    let public = viewer.role == Role::PublicUser;
    let query = if args.mine {
        let outcome = args.outcome.map(RequestOutcome::from);
        Some(own_query(&viewer, outcome).context("admins have no own listings or requests")?)
    } else if public {
        None
    } else {
        Some(args.status.query())
    };
    let mut vm = ListingCollectionViewModel::new(service, viewer, config);
    if let Some(query) = query {
        vm.set_query(query)?;
    }
    let mut updates = vm.subscribe();
    let clock = SystemClock;

    vm.activate()?;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = updates.changed() => {
                changed.context("snapshot channel closed")?;
                let snapshot = updates.borrow_and_update().clone();
                print_collection(&snapshot, &clock, json)?;
            }
        }
    }
    vm.deactivate();
    info!(stats = ?vm.stats(), "stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let result = match load_config(&cli) {
        Ok(config) => match &cli.command {
            Commands::Watch(args) => run_watch(args, config, cli.json).await,
            Commands::Browse(args) => run_browse(args, config, cli.json).await,
        },
        Err(err) => Err(err),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err:#}");
            ExitCode::from(1)
        }
    }
}
