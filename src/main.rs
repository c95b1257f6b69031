// 📒 Margin Ledger CLI
//
// Import ledger records, review allocations and print profitability reports.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use margin_ledger::{
    build_report, db, exclude_transaction, insert_transactions, list_transactions, load_csv,
    load_snapshot, pending, save_allocation, seed_cost_objects,
    set_monthly_distribution, AppConfig, Month, MonthlyDistribution, Period, ProfitabilityReport,
    Split, TransactionId,
};

#[derive(Parser)]
#[command(name = "margin-ledger")]
#[command(about = "Allocation and profitability reporting over a transaction ledger")]
#[command(version)]
struct Cli {
    /// Config file (JSON); defaults to $MARGIN_LEDGER_CONFIG
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database schema
    Init,

    /// Import normalized ledger records from CSV
    Import {
        csv: PathBuf,
    },

    /// Load clients, projects and categories from a JSON seed file
    Seed {
        json: PathBuf,
    },

    /// Profitability report for whole months FROM..=TO
    Report {
        #[arg(long)]
        from: Month,

        #[arg(long)]
        to: Month,

        /// Trailing series length (overrides config)
        #[arg(long)]
        months: Option<usize>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// List transactions awaiting assignment
    Pending {
        #[arg(long)]
        from: Month,

        #[arg(long)]
        to: Month,
    },

    /// Show how a transaction resolves to projects and clients
    Resolve {
        id: String,
    },

    /// Assign a transaction: TARGET=PCT where TARGET is PROJECT, project:ID or client:ID
    Assign {
        id: String,

        #[arg(required = true)]
        splits: Vec<String>,
    },

    /// Exclude a transaction from every aggregate
    Exclude {
        id: String,
    },

    /// Set a month's overhead distribution (PROJECT=PCT...); no pairs clears it
    Distribute {
        month: Month,
        pairs: Vec<String>,
    },
}

const ACTOR: &str = "cli";

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::load(cli.config.as_deref())?;
    debug!(database = ?config.database_path, "configuration loaded");

    let conn = db::open(&config.database_path)
        .with_context(|| format!("Failed to open database: {:?}", config.database_path))?;

    match cli.command {
        Commands::Init => {
            println!("✓ Database ready at {:?}", config.database_path);
            Ok(())
        }
        Commands::Import { csv } => run_import(&conn, &csv),
        Commands::Seed { json } => run_seed(&conn, &json),
        Commands::Report {
            from,
            to,
            months,
            json,
        } => run_report(&conn, &config, from, to, months, json),
        Commands::Pending { from, to } => run_pending(&conn, from, to),
        Commands::Resolve { id } => run_resolve(&conn, &config, &id),
        Commands::Assign { id, splits } => run_assign(&conn, &id, &splits),
        Commands::Exclude { id } => {
            exclude_transaction(&conn, &TransactionId::new(id.as_str()), ACTOR)?;
            println!("✓ {} excluded", id);
            Ok(())
        }
        Commands::Distribute { month, pairs } => run_distribute(&conn, &config, month, &pairs),
    }
}

// ============================================================================
// COMMANDS
// ============================================================================

fn run_import(conn: &Connection, csv: &Path) -> Result<()> {
    println!("📂 Loading {:?}...", csv);
    let transactions = load_csv(csv)?;
    println!("✓ Loaded {} records", transactions.len());

    let stats = insert_transactions(conn, &transactions)?;
    println!("✓ Inserted:   {}", stats.inserted);
    println!("✓ Duplicates: {}", stats.duplicates);
    if stats.rewritten > 0 {
        println!("⚠️  Rewritten upstream (first ingest kept): {}", stats.rewritten);
    }
    if stats.category_mismatches > 0 {
        println!("⚠️  Sign contradicts category: {}", stats.category_mismatches);
    }
    println!("✓ Database contains {} transactions", db::verify_count(conn)?);
    Ok(())
}

fn run_seed(conn: &Connection, json: &Path) -> Result<()> {
    let snapshot = load_snapshot(json)?;
    seed_cost_objects(conn, &snapshot)?;
    println!(
        "✓ Seeded {} clients, {} projects, {} categories",
        snapshot.clients.len(),
        snapshot.projects.len(),
        snapshot.categories.len()
    );
    Ok(())
}

fn month_range(from: Month, to: Month) -> Result<Period> {
    if to < from {
        bail!("--to ({}) is before --from ({})", to, from);
    }
    Ok(Period::months(from, to))
}

fn run_report(
    conn: &Connection,
    config: &AppConfig,
    from: Month,
    to: Month,
    months: Option<usize>,
    json: bool,
) -> Result<()> {
    let period = month_range(from, to)?;
    let mut options = config.aggregate_options();
    if let Some(months) = months {
        options.trailing_months = months;
    }

    let report = build_report(conn, config.overhead_project(), &period, &options)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report, from, to);
    }
    Ok(())
}

fn run_pending(conn: &Connection, from: Month, to: Month) -> Result<()> {
    let period = month_range(from, to)?;
    let transactions = list_transactions(conn, Some(&period))?;
    let queue = pending(&transactions, &period);

    println!("📋 {} transaction(s) awaiting assignment", queue.len());
    for tx in queue {
        println!(
            "  {}  {:>14}  {:<24}  {}",
            tx.occurred_at,
            format_minor(tx.amount_minor),
            tx.id,
            tx.counterparty
        );
    }
    Ok(())
}

fn run_resolve(conn: &Connection, config: &AppConfig, id: &str) -> Result<()> {
    let resolution =
        db::resolve_transaction(conn, &TransactionId::new(id), config.overhead_project())?;

    println!("🧮 {}", resolution.transaction_id);
    for share in &resolution.shares {
        let rollup = share
            .client_id
            .as_ref()
            .map(|c| format!(" (client {})", c))
            .unwrap_or_default();
        let marker = if share.redistributed { " ↳ overhead" } else { "" };
        println!(
            "  {:<28} {:>14}{}{}",
            share.entity.to_string(),
            format_minor(share.amount_minor),
            rollup,
            marker
        );
    }
    if resolution.unallocated_amount_minor != 0 {
        println!(
            "  {:<28} {:>14}",
            "unallocated",
            format_minor(resolution.unallocated_amount_minor)
        );
    }
    for issue in &resolution.issues {
        println!("  ⚠️  {}", serde_json::to_string(issue)?);
    }
    Ok(())
}

fn run_assign(conn: &Connection, id: &str, args: &[String]) -> Result<()> {
    let splits = args
        .iter()
        .map(|arg| parse_split(arg))
        .collect::<Result<Vec<_>>>()?;

    let plan = save_allocation(conn, &TransactionId::new(id), &splits, ACTOR)?;
    println!("✓ {} saved: {}", id, serde_json::to_string(&plan)?);
    Ok(())
}

fn run_distribute(conn: &Connection, config: &AppConfig, month: Month, pairs: &[String]) -> Result<()> {
    let mut distribution = MonthlyDistribution::new(month);
    for pair in pairs {
        let (project, percentage) = parse_pair(pair)?;
        distribution = distribution.with(project, percentage);
    }

    let overhead = config.overhead_project();
    set_monthly_distribution(conn, &distribution, overhead.as_ref(), ACTOR)?;

    if distribution.is_empty() {
        println!("✓ Distribution for {} cleared", month);
    } else {
        println!(
            "✓ Distribution for {} set ({}% redistributed)",
            month,
            distribution.percentage_sum()
        );
    }
    Ok(())
}

// ============================================================================
// ARGUMENT PARSING & FORMATTING
// ============================================================================

fn parse_pair(arg: &str) -> Result<(&str, u32)> {
    let Some((target, percentage)) = arg.rsplit_once('=') else {
        bail!("expected TARGET=PCT, got '{}'", arg);
    };
    let percentage: u32 = percentage
        .trim()
        .parse()
        .with_context(|| format!("invalid percentage in '{}'", arg))?;
    Ok((target.trim(), percentage))
}

fn parse_split(arg: &str) -> Result<Split> {
    let (target, percentage) = parse_pair(arg)?;
    match target.split_once(':') {
        Some(("client", id)) => Ok(Split::client(id, percentage)),
        Some(("project", id)) => Ok(Split::project(id, percentage)),
        Some((kind, _)) => bail!("unknown target kind '{}' in '{}'", kind, arg),
        None => Ok(Split::project(target, percentage)),
    }
}

fn format_minor(amount_minor: i64) -> String {
    let sign = if amount_minor < 0 { "-" } else { "" };
    let abs = amount_minor.unsigned_abs();
    format!("{}{}.{:02}", sign, abs / 100, abs % 100)
}

fn print_report(report: &ProfitabilityReport, from: Month, to: Month) {
    println!("📊 Profitability {} .. {}", from, to);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let totals = &report.totals;
    println!("Income:      {:>14}", format_minor(totals.income));
    println!("Expenses:    {:>14}", format_minor(totals.expenses));
    println!("Net:         {:>14}", format_minor(totals.net));
    println!("Margin:      {:>13.1}%", totals.margin);
    println!("Unallocated: {:>14}", format_minor(totals.unallocated_minor));
    println!(
        "Transactions: {} ({} excluded, {} pending)",
        totals.transaction_count, totals.excluded_count, report.pending.count
    );

    println!("\n🏗️  Projects");
    for (id, p) in &report.by_project {
        println!(
            "  {:<12} {:<24} {:>14} {:>14} {:>7.1}%",
            id.as_str(),
            p.name,
            format_minor(p.income),
            format_minor(p.net),
            p.margin
        );
    }

    println!("\n🤝 Clients");
    for (id, c) in &report.by_client {
        println!(
            "  {:<12} {:<24} {:>14} {:>14} {:>7.1}%",
            id.as_str(),
            c.name,
            format_minor(c.income),
            format_minor(c.net),
            c.margin
        );
    }

    println!("\n🏆 Top clients by income");
    for (rank, entry) in report.rankings.top_clients.iter().enumerate() {
        println!("  {}. {:<24} {:>14}", rank + 1, entry.name, format_minor(entry.income));
    }

    if !report.integrity.is_empty() {
        println!("\n⚠️  {} integrity warning(s)", report.integrity.len());
        for warning in &report.integrity {
            println!("  {}: {:?}", warning.transaction_id, warning.issue);
        }
    }
}
