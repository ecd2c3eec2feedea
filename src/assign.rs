use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use log::debug;
use regex::Regex;

use crate::models::{CustomerLoad, GrowthCategory, Instance, UsageCategory};

pub const DEFAULT_DEMO_PATTERN: &str = r"^DEMO\d*$";

/// Position weights for a customer's ranked peak hours. Hours past the
/// fifth rank contribute nothing.
const HOUR_WEIGHTS: [f64; 5] = [1.0, 0.8, 0.6, 0.4, 0.2];

const USAGE_WEIGHT: f64 = 0.7;
const OVERLAP_WEIGHT: f64 = 0.3;

/// Combined score for one customer. A customer with no usage contributes
/// nothing regardless of growth, so growth churn on dormant accounts cannot
/// skew instance loads.
pub fn usage_value(usage: UsageCategory, growth: GrowthCategory) -> u32 {
    let usage_score = usage.score();
    if usage_score == 0 {
        0
    } else {
        usage_score + growth.score()
    }
}

/// Sums, over the customer's ranked hours, the weighted count of matching
/// hours already accumulated on the instance.
pub fn weighted_hour_overlap(instance_hours: &[u32], customer_hours: &[u32]) -> f64 {
    customer_hours
        .iter()
        .zip(HOUR_WEIGHTS)
        .map(|(hour, weight)| {
            weight * instance_hours.iter().filter(|&h| h == hour).count() as f64
        })
        .sum()
}

/// Orders names so numeric runs compare by value: DEMO2 before DEMO10.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut a_rest = a;
    let mut b_rest = b;

    loop {
        match (a_rest.chars().next(), b_rest.chars().next()) {
            (None, None) => return a.cmp(b),
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(ca), Some(cb)) => {
                if ca.is_ascii_digit() && cb.is_ascii_digit() {
                    let (a_run, a_tail) = split_digit_run(a_rest);
                    let (b_run, b_tail) = split_digit_run(b_rest);
                    let a_num: u64 = a_run.parse().unwrap_or(u64::MAX);
                    let b_num: u64 = b_run.parse().unwrap_or(u64::MAX);
                    match a_num.cmp(&b_num) {
                        Ordering::Equal => {
                            a_rest = a_tail;
                            b_rest = b_tail;
                        }
                        unequal => return unequal,
                    }
                } else {
                    match ca.cmp(&cb) {
                        Ordering::Equal => {
                            a_rest = &a_rest[ca.len_utf8()..];
                            b_rest = &b_rest[cb.len_utf8()..];
                        }
                        unequal => return unequal,
                    }
                }
            }
        }
    }
}

fn split_digit_run(s: &str) -> (&str, &str) {
    let end = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    s.split_at(end)
}

/// Distributes every customer across `num_instances` slots.
///
/// Three passes in a fixed order: no-usage non-demo accounts round-robin,
/// demo accounts round-robin in natural name order, then everyone else to
/// whichever instance scores cheapest. The round-robin counter carries over
/// from the first pass into the second; resetting it between passes would
/// stack both bucket fronts onto the low-numbered instances.
pub fn assign(
    customers: &[CustomerLoad],
    num_instances: usize,
    demo_pattern: &Regex,
) -> Vec<Instance> {
    let mut instances: Vec<Instance> = (1..=num_instances).map(Instance::new).collect();

    let mut no_usage = Vec::new();
    let mut demos = Vec::new();
    let mut remaining = Vec::new();
    for customer in customers {
        if demo_pattern.is_match(&customer.customer) {
            demos.push(customer);
        } else if customer.usage_category == UsageCategory::NoUsage {
            no_usage.push(customer);
        } else {
            remaining.push(customer);
        }
    }
    demos.sort_by(|a, b| natural_cmp(&a.customer, &b.customer));

    // Pass 1: dormant accounts spread evenly. Their peak hours, if any,
    // are not recorded against the instance.
    let mut assigned = 0usize;
    for customer in no_usage {
        let slot = &mut instances[assigned % num_instances];
        slot.customers.push(customer.customer.clone());
        slot.total_usage_value += customer.usage_value;
        assigned += 1;
    }

    // Pass 2: demo accounts continue the same counter.
    for customer in demos {
        let slot = &mut instances[assigned % num_instances];
        slot.customers.push(customer.customer.clone());
        slot.total_usage_value += customer.usage_value;
        if !customer.peak_hours.is_empty() {
            slot.peak_hours.extend_from_slice(&customer.peak_hours);
        }
        assigned += 1;
    }

    // Pass 3: everyone else chases the cheapest instance. First minimum
    // wins, so equal scores fall to the lowest-indexed slot.
    for customer in remaining {
        let mut best = 0;
        let mut best_score = f64::INFINITY;
        for (index, instance) in instances.iter().enumerate() {
            let score = if customer.peak_hours.is_empty() {
                instance.total_usage_value as f64
            } else {
                USAGE_WEIGHT * instance.total_usage_value as f64
                    + OVERLAP_WEIGHT
                        * weighted_hour_overlap(&instance.peak_hours, &customer.peak_hours)
            };
            if score < best_score {
                best_score = score;
                best = index;
            }
        }

        let slot = &mut instances[best];
        slot.customers.push(customer.customer.clone());
        slot.total_usage_value += customer.usage_value;
        if !customer.peak_hours.is_empty() {
            slot.peak_hours.extend_from_slice(&customer.peak_hours);
        }
    }

    instances
}

/// One assignment-stage input row: just the columns the assigner needs,
/// with both category labels parsed strictly.
#[derive(Debug, Clone)]
pub struct CategorizedRow {
    pub customer: String,
    pub usage_category: UsageCategory,
    pub growth_category: GrowthCategory,
}

/// Reads the categorized usage table. A row with a missing or unknown
/// category fails immediately, naming the customer, instead of surfacing
/// later as an inscrutable lookup failure mid-assignment.
pub fn read_categorized(path: &Path) -> anyhow::Result<Vec<CategorizedRow>> {
    #[derive(serde::Deserialize)]
    struct Row {
        #[serde(rename = "Customer")]
        customer: String,
        #[serde(rename = "Growth Category")]
        growth_category: String,
        #[serde(rename = "Usage Category")]
        usage_category: String,
    }

    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("failed to open categorized usage table {}", path.display()))?;
    let mut rows = Vec::new();
    for result in reader.deserialize::<Row>() {
        let row = result.context("malformed row in categorized usage table")?;
        let usage_category = UsageCategory::parse(&row.usage_category).with_context(|| {
            format!(
                "customer {} has no valid usage category (got {:?})",
                row.customer, row.usage_category
            )
        })?;
        let growth_category = GrowthCategory::parse(&row.growth_category).with_context(|| {
            format!(
                "customer {} has no valid growth category (got {:?})",
                row.customer, row.growth_category
            )
        })?;
        rows.push(CategorizedRow {
            customer: row.customer,
            usage_category,
            growth_category,
        });
    }
    Ok(rows)
}

/// Joins peak hours onto the categorized rows, in row order. Peak-time
/// customers absent from the usage table have nowhere to land and are
/// ignored.
pub fn build_loads(
    rows: &[CategorizedRow],
    peak_hours: &HashMap<String, Vec<u32>>,
) -> Vec<CustomerLoad> {
    let loads: Vec<CustomerLoad> = rows
        .iter()
        .map(|row| CustomerLoad {
            customer: row.customer.clone(),
            usage_category: row.usage_category,
            usage_value: usage_value(row.usage_category, row.growth_category),
            peak_hours: peak_hours.get(&row.customer).cloned().unwrap_or_default(),
        })
        .collect();

    for customer in peak_hours.keys() {
        if !rows.iter().any(|row| &row.customer == customer) {
            debug!("peak-times customer {customer} is not in the usage table; ignoring");
        }
    }
    loads
}

pub const DISTRIBUTION_COLUMNS: [&str; 4] = [
    "Instance No.",
    "Customer Count",
    "Total Usage Value",
    "Customers",
];

pub fn write_distribution(instances: &[Instance], path: &Path) -> anyhow::Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    writer.write_record(DISTRIBUTION_COLUMNS)?;
    for instance in instances {
        writer.write_record([
            instance.id.to_string(),
            instance.customers.len().to_string(),
            instance.total_usage_value.to_string(),
            instance.customers.join(", "),
        ])?;
    }
    writer.flush()?;
    Ok(())
}
