//! # LeadFlow — Lead Auto-Transfer Engine
//!
//! Moves idle sales leads from their owners to colleagues on an hourly
//! schedule, following admin-defined transfer rules.
//!
//! Usage:
//!   leadflow run                          # Hourly daemon until Ctrl-C
//!   leadflow execute --rule <ID>          # Run one rule now (all rules without --rule)
//!   leadflow predict <ID>                 # Preview the next cycle, no writes
//!   leadflow rules create --file rule.json
//!   leadflow seed-demo                    # Demo team + idle leads

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use leadflow_core::LeadFlowConfig;
use leadflow_crm::SqliteCrm;
use leadflow_scheduler::rule::{DateRange, RecordStatus};
use leadflow_scheduler::store::{PageRequest, RecordFilter};
use leadflow_scheduler::{
    NotifyRouter, PredictionService, RuleDraft, RulePatch, RuleService, Scheduler,
    SchedulerSettings, TransferDb,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "leadflow",
    version,
    about = "🔁 LeadFlow — rule-driven auto-transfer of idle sales leads"
)]
struct Cli {
    /// Config file (default ~/.leadflow/config.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// JSON log lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// Acting user for rule changes
    #[arg(long = "as", global = true, default_value = "admin")]
    actor: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the hourly scheduler until Ctrl-C
    Run,
    /// Execute rules immediately, ignoring execution windows
    Execute {
        #[arg(long)]
        rule: Option<String>,
    },
    /// Preview what the next cycle of a rule would do
    Predict { rule_id: String },
    /// Manage transfer rules
    Rules {
        #[command(subcommand)]
        action: RulesAction,
    },
    /// Query transfer records
    Records {
        #[arg(long)]
        rule: Option<String>,
        #[arg(long)]
        lead: Option<String>,
        #[arg(long)]
        from_user: Option<String>,
        #[arg(long)]
        to_user: Option<String>,
        /// success | failed
        #[arg(long)]
        status: Option<String>,
        /// RFC3339 lower bound on transfer time
        #[arg(long)]
        since: Option<String>,
        /// RFC3339 upper bound on transfer time
        #[arg(long)]
        until: Option<String>,
        #[arg(long, default_value = "1")]
        page: u32,
        #[arg(long, default_value = "20")]
        limit: u32,
    },
    /// Transfer statistics, overall or for one user
    Stats {
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        since: Option<String>,
        #[arg(long)]
        until: Option<String>,
    },
    /// Populate the CRM with a demo team and idle leads
    SeedDemo,
}

#[derive(Subcommand)]
enum RulesAction {
    List,
    Show { rule_id: String },
    /// Create a rule from a JSON draft
    Create {
        #[arg(long)]
        file: PathBuf,
    },
    /// Apply a JSON patch to a rule
    Update {
        rule_id: String,
        #[arg(long)]
        file: PathBuf,
    },
    Toggle {
        rule_id: String,
        #[arg(long, action = clap::ArgAction::Set)]
        enabled: bool,
    },
    Delete { rule_id: String },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))
}

fn parse_time(s: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    s.map(|s| {
        DateTime::parse_from_rfc3339(s)
            .map(|t| t.with_timezone(&Utc))
            .with_context(|| format!("invalid timestamp '{s}'"))
    })
    .transpose()
}

fn date_range(since: Option<&str>, until: Option<&str>) -> Result<DateRange> {
    Ok(DateRange { start: parse_time(since)?, end: parse_time(until)? })
}

fn init_logging(cli: &Cli) {
    let level = if cli.verbose { "leadflow=debug" } else { "leadflow=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    if cli.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    let config = match &cli.config {
        Some(path) => {
            let path = shellexpand::tilde(path).to_string();
            LeadFlowConfig::load_from(Path::new(&path))?
        }
        None => LeadFlowConfig::load()?,
    };

    let db_path = config.database_file();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let crm = Arc::new(SqliteCrm::open(&db_path)?);
    let db = Arc::new(TransferDb::open(&db_path)?);
    let settings = SchedulerSettings::from_config(&config.scheduler);

    let scheduler = || {
        Scheduler::new(db.clone(), db.clone(), crm.clone())
            .with_notifier(Arc::new(NotifyRouter::from_config(&config.notify)))
            .with_settings(settings)
    };
    let rules = RuleService::new(db.clone(), db.clone(), crm.clone())
        .with_defaults(config.defaults.clone());

    match cli.command {
        Command::Run => {
            if !config.scheduler.enabled {
                tracing::warn!("⏸️ Scheduler disabled in config, nothing to run");
                return Ok(());
            }
            tracing::info!("🚀 LeadFlow daemon using {}", db_path.display());
            let handle = tokio::spawn(leadflow_scheduler::spawn_scheduler(Arc::new(scheduler())));
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("🛑 Shutting down");
                }
                res = handle => {
                    res.context("scheduler task stopped")?;
                }
            }
        }
        Command::Execute { rule } => {
            let sched = scheduler();
            match rule {
                Some(id) => print_json(&sched.execute_rule_now(&id).await?)?,
                None => print_json(&sched.execute_all_now().await)?,
            }
        }
        Command::Predict { rule_id } => {
            let predictor = PredictionService::new(db.clone(), crm.clone())
                .with_directory(crm.clone())
                .with_settings(settings);
            print_json(&predictor.predict(&rule_id).await?)?;
        }
        Command::Rules { action } => match action {
            RulesAction::List => print_json(&rules.list().await?)?,
            RulesAction::Show { rule_id } => print_json(&rules.get(&rule_id).await?)?,
            RulesAction::Create { file } => {
                let draft: RuleDraft = read_json(&file)?;
                print_json(&rules.create(&cli.actor, draft).await?)?;
            }
            RulesAction::Update { rule_id, file } => {
                let patch: RulePatch = read_json(&file)?;
                print_json(&rules.update(&cli.actor, &rule_id, patch).await?)?;
            }
            RulesAction::Toggle { rule_id, enabled } => {
                print_json(&rules.toggle(&cli.actor, &rule_id, enabled).await?)?;
            }
            RulesAction::Delete { rule_id } => {
                rules.delete(&cli.actor, &rule_id).await?;
                println!("🗑️ Deleted rule {rule_id}");
            }
        },
        Command::Records { rule, lead, from_user, to_user, status, since, until, page, limit } => {
            let status = match status.as_deref() {
                None => None,
                Some("success") => Some(RecordStatus::Success),
                Some("failed") => Some(RecordStatus::Failed),
                Some(other) => anyhow::bail!("unknown status '{other}' (success | failed)"),
            };
            let filter = RecordFilter {
                rule_id: rule,
                lead_id: lead,
                from_user_id: from_user,
                to_user_id: to_user,
                status,
                transferred: date_range(since.as_deref(), until.as_deref())?,
            };
            print_json(&rules.records(&filter, PageRequest { page, limit }).await?)?;
        }
        Command::Stats { user, since, until } => {
            let range = date_range(since.as_deref(), until.as_deref())?;
            match user {
                Some(user) => print_json(&rules.user_statistics(&user, &range).await?)?,
                None => print_json(&rules.statistics(&range).await?)?,
            }
        }
        Command::SeedDemo => {
            let inserted = crm.seed_demo(Utc::now())?;
            println!("🌱 Seeded {inserted} demo leads (users: admin, alice, bob, carol)");
        }
    }

    Ok(())
}
