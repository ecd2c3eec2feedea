use std::collections::{HashMap, HashSet};
use std::path::Path;

use anyhow::{anyhow, Context};
use log::{debug, warn};

use crate::consolidate::{stats_record, USAGE_COLUMNS};
use crate::llm::UsageModel;
use crate::models::{ClassifiedStats, UsageCategory, UsageStats};

/// The categorization task sent ahead of the usage table. The category
/// boundaries (both-months < 10, August < 250, 70/20/10 weighting) are the
/// delegate's contract; this side only validates labels and audits the one
/// rule it can check locally.
const TASK: &str = r#"Task
----------
Given the below CSV data, assign each customer a "Usage Category" based on the overall query usage of each customer, relative to the entire dataset. Treat any dashes ("-") in column values as 0s. A Usage Category can be one of the following:

- No Usage
- Very Low Usage
- Low Usage
- Medium Usage
- High Usage
- Very High Usage
- Extremely High Usage

All categories should be used. Customers with less than 10 in both "Total Queries (July)" and "Total Queries (Aug)" should be marked as "No Usage". No other customers should be marked as No Usage. Of the remaining customers, those with less than 250 in "Total Queries (Aug)" should be marked as "Very Low Usage". The remaining customers should be categorized based on their data volume and average resource usage, relative to the overall dataset, with the following weighting:

- "Total Queries (Aug)" should contribute 70% to the overall categorization.
- "Avg Execution Secs (Aug)" should contribute 20% to the overall categorization.
- "Avg MB Scanned (Aug)" should contribute 10% to the overall categorization.

Provide the output as a JSON array where each element is a two-element array of the customer and the usage category:

[["CUSTOMER", "Usage Category"], ...]

Do not include any additional text aside from the JSON array. Ensure that every category is represented in the final output.

Examples
----------
[["NYCNGSV", "Very Low Usage"],
 ["MIWLSLS", "Low Usage"],
 ["MOARCOA", "Medium Usage"],
 ["VTARISS", "High Usage"],
 ["PAPYRMD", "Very High Usage"],
 ["MLSTN", "Extremely High Usage"]]

CSV Data
----------"#;

pub struct ClassifyOutcome {
    pub classified: Vec<ClassifiedStats>,
    /// Input customers the classifier response did not cover.
    pub dropped: Vec<String>,
}

/// Sends the usage table to the model and merges the returned categories
/// back onto it. The merge is an inner join in input-row order; anything the
/// response misses is dropped loudly, never silently.
pub async fn classify_usage<M: UsageModel>(
    model: &M,
    rows: &[UsageStats],
) -> anyhow::Result<ClassifyOutcome> {
    let prompt = build_prompt(rows)?;
    let raw = model.categorize(&prompt).await?;
    let pairs = parse_category_pairs(&raw)?;

    let known: HashSet<&str> = rows.iter().map(|row| row.customer.as_str()).collect();
    let mut categories: HashMap<String, UsageCategory> = HashMap::with_capacity(pairs.len());
    for (customer, category) in pairs {
        if !known.contains(customer.as_str()) {
            warn!("classifier returned a customer not in the input: {customer}");
            continue;
        }
        if categories.insert(customer.clone(), category).is_some() {
            debug!("classifier listed {customer} more than once; keeping the last entry");
        }
    }

    let mut classified = Vec::with_capacity(rows.len());
    let mut dropped = Vec::new();
    for row in rows {
        match categories.get(&row.customer) {
            Some(&usage_category) => classified.push(ClassifiedStats {
                stats: row.clone(),
                usage_category,
            }),
            None => dropped.push(row.customer.clone()),
        }
    }
    if !dropped.is_empty() {
        warn!(
            "classifier response missed {} customers, dropping them from the output: {}",
            dropped.len(),
            dropped.join(", ")
        );
    }
    for violation in no_usage_rule_violations(&classified) {
        warn!("{violation}");
    }

    Ok(ClassifyOutcome {
        classified,
        dropped,
    })
}

pub fn build_prompt(rows: &[UsageStats]) -> anyhow::Result<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(USAGE_COLUMNS)?;
    for row in rows {
        writer.write_record(stats_record(row))?;
    }
    let table = String::from_utf8(
        writer
            .into_inner()
            .map_err(|e| anyhow!("failed to render usage table: {e}"))?,
    )
    .context("usage table is not valid UTF-8")?;
    Ok(format!("{TASK}\n{table}"))
}

/// Strict parse of the model's reply: a JSON array of [customer, category]
/// pairs, optionally wrapped in a markdown code fence. Anything else is
/// fatal for the run, as is a label outside the seven-category enum.
pub fn parse_category_pairs(raw: &str) -> anyhow::Result<Vec<(String, UsageCategory)>> {
    let text = strip_code_fence(raw);
    let pairs: Vec<(String, String)> = serde_json::from_str(text)
        .context("classifier response is not a JSON list of [customer, category] pairs")?;
    pairs
        .into_iter()
        .map(|(customer, label)| {
            let category = UsageCategory::parse(&label).ok_or_else(|| {
                anyhow!("classifier returned unknown category {label:?} for {customer}")
            })?;
            Ok((customer, category))
        })
        .collect()
}

fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string ("json") after the opening fence, then the
    // closing fence itself.
    let rest = rest.split_once('\n').map(|(_, body)| body).unwrap_or(rest);
    rest.rsplit_once("```")
        .map(|(body, _)| body)
        .unwrap_or(rest)
        .trim()
}

/// The one delegate rule checkable locally: both monthly totals under 10
/// (dashes reading as 0) must mean No Usage, and nothing else may.
pub fn no_usage_rule_violations(rows: &[ClassifiedStats]) -> Vec<String> {
    let mut violations = Vec::new();
    for row in rows {
        let july = row.stats.july_queries.unwrap_or(0.0);
        let aug = row.stats.aug_queries.unwrap_or(0.0);
        let trivial = july < 10.0 && aug < 10.0;
        let marked_no_usage = row.usage_category == UsageCategory::NoUsage;
        if trivial && !marked_no_usage {
            violations.push(format!(
                "{} has under 10 queries in both months but was classified {}",
                row.stats.customer, row.usage_category
            ));
        } else if !trivial && marked_no_usage {
            violations.push(format!(
                "{} was classified No Usage despite {july} July / {aug} August queries",
                row.stats.customer
            ));
        }
    }
    violations
}

pub fn write_classified(rows: &[ClassifiedStats], path: &Path) -> anyhow::Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    let mut header: Vec<&str> = USAGE_COLUMNS.to_vec();
    header.push("Usage Category");
    writer.write_record(&header)?;
    for row in rows {
        let mut record: Vec<String> = stats_record(&row.stats).to_vec();
        record.push(row.usage_category.label().to_string());
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}
