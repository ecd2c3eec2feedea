use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use regex::Regex;

mod assign;
mod classify;
mod consolidate;
mod llm;
mod looker;
mod models;
mod peaks;

#[derive(Parser)]
#[command(name = "instance-planner")]
#[command(about = "Customer usage pipeline and Looker instance distribution planner", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Merge the July and August extracts into a growth-annotated usage table
    Consolidate {
        #[arg(long)]
        july: PathBuf,
        #[arg(long)]
        august: PathBuf,
        /// Month the August extract covers, as YYYY-MM
        #[arg(long)]
        month: String,
        /// Days of the month the extract has observed so far
        #[arg(long)]
        days_observed: u32,
        #[arg(long, default_value = "output/customer-usage-stats.csv")]
        out: PathBuf,
    },
    /// Bucket customers into usage tiers via the categorization model
    Classify {
        #[arg(long, default_value = "output/customer-usage-stats.csv")]
        usage: PathBuf,
        #[arg(long, default_value = "output/customer-usage-stats-with-categories.csv")]
        out: PathBuf,
    },
    /// Pull each customer's top peak query hours from its Looker instance
    PeakTimes {
        #[arg(long, default_value = "looker-api-keys.csv")]
        credentials: PathBuf,
        #[arg(long, default_value = "output/peak-times.csv")]
        out: PathBuf,
    },
    /// Distribute customers across the instance pool
    Assign {
        #[arg(long, default_value = "output/customer-usage-stats-with-categories.csv")]
        usage: PathBuf,
        #[arg(long, default_value = "output/peak-times.csv")]
        peaks: PathBuf,
        #[arg(long, default_value_t = 30)]
        instances: usize,
        /// Full-name pattern identifying demo accounts
        #[arg(long, default_value = assign::DEFAULT_DEMO_PATTERN)]
        demo_pattern: String,
        #[arg(long, default_value = "output/proposed-instance-distribution.csv")]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Consolidate {
            july,
            august,
            month,
            days_observed,
            out,
        } => {
            let days_in_month = consolidate::days_in_month(&month)?;
            let rows = consolidate::consolidate(&july, &august, days_in_month, days_observed)?;
            ensure_parent(&out)?;
            consolidate::write_usage_stats(&rows, &out)?;
            println!("Consolidated {} customers to {}.", rows.len(), out.display());
        }
        Commands::Classify { usage, out } => {
            let rows = consolidate::read_usage_stats(&usage)?;
            println!("Categorizing {} customers...", rows.len());
            let model = llm::GeminiClient::from_env()?;
            let outcome = classify::classify_usage(&model, &rows).await?;
            ensure_parent(&out)?;
            classify::write_classified(&outcome.classified, &out)?;
            println!(
                "Wrote {} categorized customers to {}.",
                outcome.classified.len(),
                out.display()
            );
            if !outcome.dropped.is_empty() {
                println!(
                    "{} customers came back uncategorized and were dropped.",
                    outcome.dropped.len()
                );
            }
        }
        Commands::PeakTimes { credentials, out } => {
            let instances = peaks::read_credentials(&credentials)?;
            ensure_parent(&out)?;
            let mut writer = peaks::PeakTimesWriter::create(&out)?;
            let mut total = 0;
            for instance in &instances {
                println!(
                    "Analyzing peak times for customers on instance {}:",
                    instance.looker_url
                );
                let client = looker::LookerClient::login(
                    &instance.looker_url,
                    &instance.client_id,
                    &instance.client_secret,
                )
                .await?;
                total += peaks::collect_instance(&client, &instance.customers, &mut writer).await?;
                println!("--------");
            }
            println!("Saved {total} peak-time rows to {}.", out.display());
        }
        Commands::Assign {
            usage,
            peaks: peak_times,
            instances,
            demo_pattern,
            out,
        } => {
            let demo_pattern = Regex::new(&demo_pattern)
                .with_context(|| format!("invalid demo account pattern {demo_pattern:?}"))?;
            let rows = assign::read_categorized(&usage)?;
            let peak_hours = peaks::read_peak_hours(&peak_times)?;
            let loads = assign::build_loads(&rows, &peak_hours);

            let slots = assign::assign(&loads, instances, &demo_pattern);
            ensure_parent(&out)?;
            assign::write_distribution(&slots, &out)?;

            println!("Proposed distribution across {instances} instances:");
            for slot in &slots {
                println!(
                    "- instance {:>2}: {:>3} customers, total usage value {}",
                    slot.id,
                    slot.customers.len(),
                    slot.total_usage_value
                );
            }
            println!("Distribution written to {}.", out.display());
        }
    }

    Ok(())
}

fn ensure_parent(path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }
    Ok(())
}
