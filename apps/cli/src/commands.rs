//! CLI command definitions, routing, and tracing setup.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use serde_json::json;
use tastebase_core::workflows::{
    DiscoverShow, DiscoverShowInput, EnrichChef, EnrichChefInput, VerifyRestaurant,
    VerifyRestaurantInput,
};
use tastebase_core::{
    BatchProgress, BatchReport, Engine, NewChef, NewRestaurant, RollbackError, Services,
    WorkerPool, WorkflowRun, verify_all,
};
use tastebase_gateway::{OpenRouterGateway, UsageTracker};
use tastebase_shared::{
    AppConfig, DiscoveryKind, DiscoveryStatus, RestaurantStatus, init_config, load_config,
    load_config_from,
};
use tastebase_storage::{RestaurantFilter, Storage};
use tracing::info;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Tastebase: enrichment and verification for the chef database.
#[derive(Parser)]
#[command(
    name = "tastebase",
    version,
    about = "Enrich chefs, verify restaurants, and discover show casts with cost-gated workflows.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Run lookups but write nothing.
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Database file (defaults to `[database].path` from config).
    #[arg(long, global = true, env = "TASTEBASE_DB")]
    pub db: Option<PathBuf>,

    /// Config file (defaults to ~/.tastebase/tastebase.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Manage chefs.
    Chef {
        #[command(subcommand)]
        action: ChefAction,
    },

    /// Manage restaurants.
    Restaurant {
        #[command(subcommand)]
        action: RestaurantAction,
    },

    /// Research a chef's biography, restaurants, and show appearances.
    EnrichChef {
        /// Chef ID.
        id: String,
    },

    /// Check whether a restaurant is still operating.
    VerifyRestaurant {
        /// Restaurant ID.
        id: String,
    },

    /// Verify every open restaurant in parallel.
    VerifyAll {
        /// Maximum concurrent verifications (1-50, defaults to config).
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Find a show's cast and queue unknown chefs for review.
    DiscoverShow {
        /// Show name.
        name: String,

        /// Restrict to one season.
        #[arg(long)]
        season: Option<u32>,

        /// Broadcast network, stored when the show is new.
        #[arg(long)]
        network: Option<String>,
    },

    /// Review queued discoveries.
    Discoveries {
        #[command(subcommand)]
        action: DiscoveryAction,
    },

    /// Manage the result cache.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub(crate) enum ChefAction {
    /// Add a chef, subject to the duplicate check.
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        city: Option<String>,
        #[arg(long)]
        state: Option<String>,
        #[arg(long)]
        bio: Option<String>,
    },
    /// List chefs.
    List {
        #[arg(long)]
        city: Option<String>,
    },
}

#[derive(Subcommand)]
pub(crate) enum RestaurantAction {
    /// Add a restaurant, subject to the duplicate check.
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        city: Option<String>,
        #[arg(long)]
        state: Option<String>,
        #[arg(long)]
        address: Option<String>,
        /// Owning chef ID.
        #[arg(long)]
        chef_id: Option<String>,
        /// open, closed, or unknown.
        #[arg(long, default_value = "unknown")]
        status: String,
    },
    /// List restaurants.
    List {
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        chef_id: Option<String>,
        #[arg(long)]
        city: Option<String>,
    },
}

#[derive(Subcommand)]
pub(crate) enum DiscoveryAction {
    /// List discoveries.
    List {
        /// pending, approved, rejected, needs_review, or merged.
        #[arg(long)]
        status: Option<String>,
        /// show, chef, or restaurant.
        #[arg(long)]
        kind: Option<String>,
    },
    /// Mark a discovery approved.
    Approve { id: String },
    /// Mark a discovery rejected.
    Reject { id: String },
}

#[derive(Subcommand)]
pub(crate) enum CacheAction {
    /// Drop cached results for one entity.
    Invalidate {
        /// Entity type, e.g. chef or restaurant.
        entity_type: String,
        /// Entity ID.
        entity_id: String,
    },
    /// Delete expired cache rows.
    Purge,
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Create default config file at ~/.tastebase/tastebase.toml.
    Init,
    /// Show current configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "tastebase=info",
        1 => "tastebase=debug",
        _ => "tastebase=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    // Logs go to stderr so stdout stays parseable JSON.
    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Flags shared by every command.
struct Globals {
    dry_run: bool,
    db: Option<PathBuf>,
    config: Option<PathBuf>,
}

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let globals = Globals {
        dry_run: cli.dry_run,
        db: cli.db,
        config: cli.config,
    };

    match cli.command {
        Command::Chef { action } => match action {
            ChefAction::Add {
                name,
                city,
                state,
                bio,
            } => {
                cmd_chef_add(
                    &globals,
                    NewChef {
                        name,
                        city,
                        state,
                        bio,
                    },
                )
                .await
            }
            ChefAction::List { city } => cmd_chef_list(&globals, city.as_deref()).await,
        },
        Command::Restaurant { action } => match action {
            RestaurantAction::Add {
                name,
                city,
                state,
                address,
                chef_id,
                status,
            } => {
                let status: RestaurantStatus = status.parse()?;
                cmd_restaurant_add(
                    &globals,
                    NewRestaurant {
                        name,
                        chef_id,
                        city,
                        state,
                        address,
                        status,
                    },
                )
                .await
            }
            RestaurantAction::List {
                status,
                chef_id,
                city,
            } => {
                let filter = RestaurantFilter {
                    status: status.as_deref().map(str::parse::<RestaurantStatus>).transpose()?,
                    chef_id,
                    city,
                    limit: None,
                };
                cmd_restaurant_list(&globals, &filter).await
            }
        },
        Command::EnrichChef { id } => cmd_enrich_chef(&globals, id).await,
        Command::VerifyRestaurant { id } => cmd_verify_restaurant(&globals, id).await,
        Command::VerifyAll { concurrency } => cmd_verify_all(&globals, concurrency).await,
        Command::DiscoverShow {
            name,
            season,
            network,
        } => {
            cmd_discover_show(
                &globals,
                DiscoverShowInput {
                    show_name: name,
                    season,
                    network,
                },
            )
            .await
        }
        Command::Discoveries { action } => match action {
            DiscoveryAction::List { status, kind } => {
                let status = status.as_deref().map(str::parse::<DiscoveryStatus>).transpose()?;
                let kind = kind.as_deref().map(str::parse::<DiscoveryKind>).transpose()?;
                cmd_discoveries_list(&globals, status, kind).await
            }
            DiscoveryAction::Approve { id } => {
                cmd_discovery_review(&globals, &id, DiscoveryStatus::Approved).await
            }
            DiscoveryAction::Reject { id } => {
                cmd_discovery_review(&globals, &id, DiscoveryStatus::Rejected).await
            }
        },
        Command::Cache { action } => match action {
            CacheAction::Invalidate {
                entity_type,
                entity_id,
            } => cmd_cache_invalidate(&globals, &entity_type, &entity_id).await,
            CacheAction::Purge => cmd_cache_purge(&globals).await,
        },
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show(&globals).await,
        },
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

fn config_for(globals: &Globals) -> Result<AppConfig> {
    let config = match &globals.config {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    Ok(config)
}

async fn open_storage(globals: &Globals, config: &AppConfig) -> Result<Arc<Storage>> {
    let path = match &globals.db {
        Some(path) => path.clone(),
        None => config.database_path()?,
    };
    info!(path = %path.display(), "opening database");
    Ok(Arc::new(Storage::open(&path).await?))
}

/// Full service graph; requires the gateway API key.
async fn open_services(globals: &Globals) -> Result<Services> {
    let config = config_for(globals)?;
    let gateway = Arc::new(OpenRouterGateway::from_config(&config)?);
    let storage = open_storage(globals, &config).await?;
    Ok(Services::new(config, storage, gateway, UsageTracker::new()))
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print a run summary; a failed run becomes a non-zero exit.
fn report_run<O: Serialize>(result: std::result::Result<WorkflowRun<O>, RollbackError>) -> Result<()> {
    match result {
        Ok(run) => {
            print_json(&run.summary())?;
            if run.is_success() {
                Ok(())
            } else {
                Err(eyre!("{} run {} failed", run.workflow, run.id))
            }
        }
        Err(e) => {
            print_json(&e.run)?;
            Err(e.into())
        }
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_chef_add(globals: &Globals, chef: NewChef) -> Result<()> {
    let services = open_services(globals).await?;
    let outcome = services
        .repositories("cli", globals.dry_run)
        .insert_chef(chef)
        .await?;
    print_json(&outcome)
}

async fn cmd_chef_list(globals: &Globals, city: Option<&str>) -> Result<()> {
    let config = config_for(globals)?;
    let storage = open_storage(globals, &config).await?;
    print_json(&storage.list_chefs(city).await?)
}

async fn cmd_restaurant_add(globals: &Globals, restaurant: NewRestaurant) -> Result<()> {
    let services = open_services(globals).await?;
    let outcome = services
        .repositories("cli", globals.dry_run)
        .insert_restaurant(restaurant)
        .await?;
    print_json(&outcome)
}

async fn cmd_restaurant_list(globals: &Globals, filter: &RestaurantFilter) -> Result<()> {
    let config = config_for(globals)?;
    let storage = open_storage(globals, &config).await?;
    print_json(&storage.list_restaurants(filter).await?)
}

async fn cmd_enrich_chef(globals: &Globals, chef_id: String) -> Result<()> {
    let engine = Engine::new(open_services(globals).await?);
    info!(chef_id = %chef_id, dry_run = globals.dry_run, "enriching chef");
    report_run(
        engine
            .run(&EnrichChef, EnrichChefInput { chef_id }, globals.dry_run)
            .await,
    )
}

async fn cmd_verify_restaurant(globals: &Globals, restaurant_id: String) -> Result<()> {
    let engine = Engine::new(open_services(globals).await?);
    report_run(
        engine
            .run(
                &VerifyRestaurant,
                VerifyRestaurantInput { restaurant_id },
                globals.dry_run,
            )
            .await,
    )
}

async fn cmd_verify_all(globals: &Globals, concurrency: Option<usize>) -> Result<()> {
    let services = open_services(globals).await?;
    let pool = WorkerPool::new(concurrency.unwrap_or(services.config.pool.concurrency));
    let engine = Engine::new(services);

    let reporter = CliProgress::new();
    let report = verify_all(&engine, &pool, globals.dry_run, &reporter).await?;

    print_json(&report)?;
    if report.failed > 0 {
        eprintln!(
            "  {} of {} verifications failed (${:.4} spent)",
            report.failed, report.total, report.cost_usd
        );
    }
    Ok(())
}

async fn cmd_discover_show(globals: &Globals, input: DiscoverShowInput) -> Result<()> {
    let engine = Engine::new(open_services(globals).await?);
    report_run(engine.run(&DiscoverShow, input, globals.dry_run).await)
}

async fn cmd_discoveries_list(
    globals: &Globals,
    status: Option<DiscoveryStatus>,
    kind: Option<DiscoveryKind>,
) -> Result<()> {
    let config = config_for(globals)?;
    let storage = open_storage(globals, &config).await?;
    print_json(&storage.list_discoveries(status, kind).await?)
}

async fn cmd_discovery_review(globals: &Globals, id: &str, status: DiscoveryStatus) -> Result<()> {
    let services = open_services(globals).await?;
    let written = services
        .repositories("cli", globals.dry_run)
        .set_discovery_status(id, status)
        .await?;
    print_json(&json!({ "id": id, "status": status, "written": written }))
}

async fn cmd_cache_invalidate(globals: &Globals, entity_type: &str, entity_id: &str) -> Result<()> {
    let services = open_services(globals).await?;
    let removed = services.calls.cache().invalidate(entity_type, entity_id).await?;
    println!("Invalidated {removed} cached result(s) for {entity_type} {entity_id}");
    Ok(())
}

async fn cmd_cache_purge(globals: &Globals) -> Result<()> {
    let services = open_services(globals).await?;
    let removed = services.calls.cache().purge_expired().await?;
    println!("Purged {removed} expired cache row(s)");
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show(globals: &Globals) -> Result<()> {
    let config = config_for(globals)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// Batch progress on an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        spinner.set_style(style);
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }
}

impl BatchProgress for CliProgress {
    fn started(&self, total: usize) {
        self.spinner
            .set_message(format!("Verifying {total} open restaurants"));
    }

    fn task_finished(&self, label: &str, ok: bool, done: usize, total: usize) {
        let mark = if ok { "ok" } else { "failed" };
        self.spinner
            .set_message(format!("Verifying [{done}/{total}] {label} {mark}"));
    }

    fn finished(&self, _report: &BatchReport) {
        self.spinner.finish_and_clear();
    }
}
