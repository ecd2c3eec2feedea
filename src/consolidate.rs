use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context};
use chrono::NaiveDate;

use crate::models::{de_metric, metric_cell, GrowthCategory, UsageStats};

pub const USAGE_COLUMNS: [&str; 9] = [
    "Customer",
    "Total Queries (July)",
    "Total Queries (Aug) Adjusted",
    "Total Queries (Aug)",
    "Avg MB Scanned (Aug)",
    "Avg Execution Secs (Aug)",
    "Max Execution Secs (Aug)",
    "Query Growth %",
    "Growth Category",
];

/// Renders one consolidated row in `USAGE_COLUMNS` order.
pub fn stats_record(row: &UsageStats) -> [String; 9] {
    [
        row.customer.clone(),
        metric_cell(row.july_queries),
        metric_cell(row.aug_adjusted),
        metric_cell(row.aug_queries),
        metric_cell(row.avg_mb_scanned),
        metric_cell(row.avg_exec_secs),
        metric_cell(row.max_exec_secs),
        metric_cell(row.growth_pct),
        row.growth_category.label().to_string(),
    ]
}

#[derive(serde::Deserialize)]
struct JulyRow {
    #[serde(rename = "Customer")]
    customer: String,
    #[serde(rename = "Total Queries", deserialize_with = "de_metric")]
    total_queries: Option<f64>,
}

#[derive(serde::Deserialize)]
struct AugustRow {
    #[serde(rename = "Customer")]
    customer: String,
    #[serde(rename = "Total Queries", deserialize_with = "de_metric")]
    total_queries: Option<f64>,
    #[serde(rename = "Avg MB Scanned", deserialize_with = "de_metric")]
    avg_mb_scanned: Option<f64>,
    #[serde(rename = "Avg Execution Secs", deserialize_with = "de_metric")]
    avg_exec_secs: Option<f64>,
    #[serde(rename = "Max Execution Secs", deserialize_with = "de_metric")]
    max_exec_secs: Option<f64>,
}

/// Merges the July and August extracts into growth-annotated usage records.
///
/// The join is a full outer join on customer name; rows come back sorted by
/// customer so reruns and downstream stages see a stable order. August totals
/// are prorated from `days_observed` to the full month before growth is
/// computed.
pub fn consolidate(
    july_path: &Path,
    august_path: &Path,
    days_in_month: u32,
    days_observed: u32,
) -> anyhow::Result<Vec<UsageStats>> {
    if days_observed == 0 {
        bail!("--days-observed must be at least 1");
    }

    let mut merged: BTreeMap<String, (Option<f64>, Option<AugustRow>)> = BTreeMap::new();

    let mut reader = csv::Reader::from_path(july_path)
        .with_context(|| format!("failed to open July extract {}", july_path.display()))?;
    for result in reader.deserialize::<JulyRow>() {
        let row = result.context("malformed row in July extract")?;
        merged.entry(row.customer).or_default().0 = row.total_queries;
    }

    let mut reader = csv::Reader::from_path(august_path)
        .with_context(|| format!("failed to open August extract {}", august_path.display()))?;
    for result in reader.deserialize::<AugustRow>() {
        let row = result.context("malformed row in August extract")?;
        let customer = row.customer.clone();
        merged.entry(customer).or_default().1 = Some(row);
    }

    let rows = merged
        .into_iter()
        .map(|(customer, (july_queries, august))| {
            let august = august.as_ref();
            let aug_queries = august.and_then(|a| a.total_queries);
            let aug_adjusted =
                aug_queries.map(|q| q / days_observed as f64 * days_in_month as f64);
            let growth_pct = query_growth_pct(july_queries, aug_adjusted);

            UsageStats {
                customer,
                july_queries,
                aug_adjusted,
                aug_queries,
                avg_mb_scanned: august.and_then(|a| a.avg_mb_scanned),
                avg_exec_secs: august.and_then(|a| a.avg_exec_secs),
                max_exec_secs: august.and_then(|a| a.max_exec_secs),
                growth_pct,
                growth_category: growth_category(growth_pct, aug_adjusted),
            }
        })
        .collect();

    Ok(rows)
}

/// Growth is only defined when both monthly totals exist. A NaN result
/// (0 observed both months) counts as undefined; ±inf from a zero July
/// baseline is kept and classifies like any extreme growth.
pub fn query_growth_pct(july: Option<f64>, aug_adjusted: Option<f64>) -> Option<f64> {
    match (july, aug_adjusted) {
        (Some(july), Some(adjusted)) => {
            let pct = (adjusted - july) / july * 100.0;
            if pct.is_nan() {
                None
            } else {
                Some(pct)
            }
        }
        _ => None,
    }
}

/// Growth category decision, first match wins.
pub fn growth_category(growth_pct: Option<f64>, aug_adjusted: Option<f64>) -> GrowthCategory {
    let pct = match growth_pct {
        None => return GrowthCategory::NewCustomer,
        Some(pct) => pct,
    };
    let low_volume = aug_adjusted.is_some_and(|adjusted| adjusted <= 100.0);

    if (-15.0..=15.0).contains(&pct) || low_volume {
        GrowthCategory::Stable
    } else if pct < -15.0 {
        GrowthCategory::NegativeGrowth
    } else if pct < 25.0 {
        GrowthCategory::LowGrowth
    } else if pct < 50.0 {
        GrowthCategory::MediumGrowth
    } else {
        GrowthCategory::HighGrowth
    }
}

/// Number of days in the month given as `YYYY-MM`.
pub fn days_in_month(month: &str) -> anyhow::Result<u32> {
    let (year, month) = parse_month(month)?;
    let first = NaiveDate::from_ymd_opt(year, month, 1)
        .with_context(|| format!("invalid month {year}-{month:02}"))?;
    let next_first = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    }
    .context("invalid month arithmetic")?;
    Ok((next_first - first).num_days() as u32)
}

fn parse_month(value: &str) -> anyhow::Result<(i32, u32)> {
    let (year, month) = value
        .split_once('-')
        .with_context(|| format!("expected YYYY-MM, got {value:?}"))?;
    let year: i32 = year
        .parse()
        .with_context(|| format!("invalid year in {value:?}"))?;
    let month: u32 = month
        .parse()
        .with_context(|| format!("invalid month in {value:?}"))?;
    if !(1..=12).contains(&month) {
        bail!("month out of range in {value:?}");
    }
    Ok((year, month))
}

pub fn write_usage_stats(rows: &[UsageStats], path: &Path) -> anyhow::Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    writer.write_record(USAGE_COLUMNS)?;
    for row in rows {
        writer.write_record(stats_record(row))?;
    }
    writer.flush()?;
    Ok(())
}

/// Reads a consolidated table back, for the stages that build on it.
pub fn read_usage_stats(path: &Path) -> anyhow::Result<Vec<UsageStats>> {
    #[derive(serde::Deserialize)]
    struct StatsRow {
        #[serde(rename = "Customer")]
        customer: String,
        #[serde(rename = "Total Queries (July)", deserialize_with = "de_metric")]
        july_queries: Option<f64>,
        #[serde(rename = "Total Queries (Aug) Adjusted", deserialize_with = "de_metric")]
        aug_adjusted: Option<f64>,
        #[serde(rename = "Total Queries (Aug)", deserialize_with = "de_metric")]
        aug_queries: Option<f64>,
        #[serde(rename = "Avg MB Scanned (Aug)", deserialize_with = "de_metric")]
        avg_mb_scanned: Option<f64>,
        #[serde(rename = "Avg Execution Secs (Aug)", deserialize_with = "de_metric")]
        avg_exec_secs: Option<f64>,
        #[serde(rename = "Max Execution Secs (Aug)", deserialize_with = "de_metric")]
        max_exec_secs: Option<f64>,
        #[serde(rename = "Query Growth %", deserialize_with = "de_metric")]
        growth_pct: Option<f64>,
        #[serde(rename = "Growth Category")]
        growth_category: String,
    }

    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("failed to open usage table {}", path.display()))?;
    let mut rows = Vec::new();
    for result in reader.deserialize::<StatsRow>() {
        let row = result.context("malformed row in usage table")?;
        let growth_category = GrowthCategory::parse(&row.growth_category).with_context(|| {
            format!(
                "customer {} has unrecognized growth category {:?}",
                row.customer, row.growth_category
            )
        })?;
        rows.push(UsageStats {
            customer: row.customer,
            july_queries: row.july_queries,
            aug_adjusted: row.aug_adjusted,
            aug_queries: row.aug_queries,
            avg_mb_scanned: row.avg_mb_scanned,
            avg_exec_secs: row.avg_exec_secs,
            max_exec_secs: row.max_exec_secs,
            growth_pct: row.growth_pct,
            growth_category,
        });
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_temp(contents: &str) -> tempfile::NamedTempFile {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn growth_category_follows_priority_order() {
        // 100 -> 105 is stable, 100 -> 200 doubles.
        assert_eq!(
            growth_category(Some(5.0), Some(105.0)),
            GrowthCategory::Stable
        );
        assert_eq!(
            growth_category(Some(100.0), Some(200.0)),
            GrowthCategory::HighGrowth
        );
        assert_eq!(
            growth_category(None, Some(50.0)),
            GrowthCategory::NewCustomer
        );

        assert_eq!(
            growth_category(Some(-15.0), Some(500.0)),
            GrowthCategory::Stable
        );
        assert_eq!(
            growth_category(Some(15.0), Some(500.0)),
            GrowthCategory::Stable
        );
        assert_eq!(
            growth_category(Some(-15.1), Some(500.0)),
            GrowthCategory::NegativeGrowth
        );
        assert_eq!(
            growth_category(Some(24.9), Some(500.0)),
            GrowthCategory::LowGrowth
        );
        assert_eq!(
            growth_category(Some(25.0), Some(500.0)),
            GrowthCategory::MediumGrowth
        );
        assert_eq!(
            growth_category(Some(49.9), Some(500.0)),
            GrowthCategory::MediumGrowth
        );
        assert_eq!(
            growth_category(Some(50.0), Some(500.0)),
            GrowthCategory::HighGrowth
        );
    }

    #[test]
    fn low_volume_august_is_stable_regardless_of_swing() {
        assert_eq!(
            growth_category(Some(900.0), Some(100.0)),
            GrowthCategory::Stable
        );
        assert_eq!(
            growth_category(Some(-80.0), Some(99.0)),
            GrowthCategory::Stable
        );
    }

    #[test]
    fn growth_pct_requires_both_months() {
        assert_eq!(query_growth_pct(None, Some(200.0)), None);
        assert_eq!(query_growth_pct(Some(100.0), None), None);

        let pct = query_growth_pct(Some(100.0), Some(105.0)).unwrap();
        assert!((pct - 5.0).abs() < 1e-9);
    }

    #[test]
    fn zero_july_baseline() {
        // 0 -> something is infinite growth, which lands in High Growth
        // unless the adjusted volume is low enough to read as Stable.
        let pct = query_growth_pct(Some(0.0), Some(500.0)).unwrap();
        assert!(pct.is_infinite());
        assert_eq!(
            growth_category(Some(pct), Some(500.0)),
            GrowthCategory::HighGrowth
        );
        assert_eq!(
            growth_category(Some(pct), Some(80.0)),
            GrowthCategory::Stable
        );

        // 0 -> 0 is undefined, not infinite.
        assert_eq!(query_growth_pct(Some(0.0), Some(0.0)), None);
    }

    #[test]
    fn days_in_month_handles_lengths_and_leap_years() {
        assert_eq!(days_in_month("2024-08").unwrap(), 31);
        assert_eq!(days_in_month("2024-09").unwrap(), 30);
        assert_eq!(days_in_month("2024-02").unwrap(), 29);
        assert_eq!(days_in_month("2023-02").unwrap(), 28);
        assert_eq!(days_in_month("2024-12").unwrap(), 31);
        assert!(days_in_month("2024-13").is_err());
        assert!(days_in_month("august").is_err());
    }

    #[test]
    fn consolidate_outer_joins_and_prorates() {
        let july = write_temp(
            "Customer,Total Queries\n\
             ACME,100\n\
             JULYONLY,40\n\
             DASHES,-\n",
        );
        let august = write_temp(
            "Customer,Total Queries,Avg MB Scanned,Avg Execution Secs,Max Execution Secs\n\
             ACME,130,12.5,1.2,9.8\n\
             AUGONLY,26,3.0,0.5,2.0\n\
             DASHES,52,-,0.1,0.4\n",
        );

        let rows = consolidate(july.path(), august.path(), 31, 26).unwrap();
        let by_name: std::collections::HashMap<&str, &UsageStats> =
            rows.iter().map(|r| (r.customer.as_str(), r)).collect();
        assert_eq!(rows.len(), 4);

        let acme = by_name["ACME"];
        assert!((acme.aug_adjusted.unwrap() - 130.0 / 26.0 * 31.0).abs() < 1e-9);
        assert!((acme.growth_pct.unwrap() - 55.0).abs() < 1e-9);
        assert_eq!(acme.growth_category, GrowthCategory::HighGrowth);

        // Present in July only: no August total, so growth is undefined.
        let july_only = by_name["JULYONLY"];
        assert_eq!(july_only.aug_queries, None);
        assert_eq!(july_only.growth_pct, None);
        assert_eq!(july_only.growth_category, GrowthCategory::NewCustomer);

        // Present in August only: adjusted 26 / 26 * 31 = 31, low volume.
        let aug_only = by_name["AUGONLY"];
        assert_eq!(aug_only.july_queries, None);
        assert_eq!(aug_only.growth_category, GrowthCategory::NewCustomer);
        assert!((aug_only.aug_adjusted.unwrap() - 31.0).abs() < 1e-9);

        // "-" in the July total reads as absent, not zero.
        let dashes = by_name["DASHES"];
        assert_eq!(dashes.july_queries, None);
        assert_eq!(dashes.avg_mb_scanned, None);
        assert_eq!(dashes.growth_category, GrowthCategory::NewCustomer);

        // Outer join output is sorted by customer.
        let names: Vec<&str> = rows.iter().map(|r| r.customer.as_str()).collect();
        assert_eq!(names, vec!["ACME", "AUGONLY", "DASHES", "JULYONLY"]);
    }

    #[test]
    fn consolidate_rejects_zero_days_observed() {
        let july = write_temp("Customer,Total Queries\nACME,1\n");
        let august = write_temp(
            "Customer,Total Queries,Avg MB Scanned,Avg Execution Secs,Max Execution Secs\n",
        );
        assert!(consolidate(july.path(), august.path(), 31, 0).is_err());
    }

    #[test]
    fn written_table_round_trips_with_placeholders() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("customer-usage-stats.csv");

        let rows = vec![
            UsageStats {
                customer: "ACME".to_string(),
                july_queries: Some(100.0),
                aug_adjusted: Some(125.0),
                aug_queries: Some(104.0),
                avg_mb_scanned: Some(12.5),
                avg_exec_secs: Some(1.25),
                max_exec_secs: Some(9.0),
                growth_pct: Some(25.0),
                growth_category: GrowthCategory::MediumGrowth,
            },
            UsageStats {
                customer: "FRESH".to_string(),
                july_queries: None,
                aug_adjusted: Some(50.0),
                aug_queries: Some(42.0),
                avg_mb_scanned: None,
                avg_exec_secs: None,
                max_exec_secs: None,
                growth_pct: None,
                growth_category: GrowthCategory::NewCustomer,
            },
        ];
        write_usage_stats(&rows, &path).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.starts_with("Customer,Total Queries (July),"));
        assert!(raw.contains("FRESH,-,50,42,-,-,-,-,New Customer"));

        let reread = read_usage_stats(&path).unwrap();
        assert_eq!(reread.len(), 2);
        assert_eq!(reread[0].customer, "ACME");
        assert_eq!(reread[1].july_queries, None);
        assert_eq!(reread[1].growth_category, GrowthCategory::NewCustomer);
    }

    #[test]
    fn read_usage_stats_rejects_unknown_growth_label() {
        let table = write_temp(
            "Customer,Total Queries (July),Total Queries (Aug) Adjusted,Total Queries (Aug),\
             Avg MB Scanned (Aug),Avg Execution Secs (Aug),Max Execution Secs (Aug),\
             Query Growth %,Growth Category\n\
             ACME,1,2,3,4,5,6,7,Sideways\n",
        );
        let err = read_usage_stats(table.path()).unwrap_err();
        assert!(err.to_string().contains("ACME"));
    }
}
