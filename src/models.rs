use std::fmt;

use serde::Deserialize;

/// Month-over-month growth buckets, in ascending score order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrowthCategory {
    NegativeGrowth,
    NewCustomer,
    Stable,
    LowGrowth,
    MediumGrowth,
    HighGrowth,
}

impl GrowthCategory {
    pub fn label(self) -> &'static str {
        match self {
            GrowthCategory::NegativeGrowth => "Negative Growth",
            GrowthCategory::NewCustomer => "New Customer",
            GrowthCategory::Stable => "Stable",
            GrowthCategory::LowGrowth => "Low Growth",
            GrowthCategory::MediumGrowth => "Medium Growth",
            GrowthCategory::HighGrowth => "High Growth",
        }
    }

    pub fn score(self) -> u32 {
        match self {
            GrowthCategory::NegativeGrowth => 0,
            GrowthCategory::NewCustomer => 1,
            GrowthCategory::Stable => 2,
            GrowthCategory::LowGrowth => 3,
            GrowthCategory::MediumGrowth => 4,
            GrowthCategory::HighGrowth => 5,
        }
    }

    pub fn parse(label: &str) -> Option<Self> {
        match label.trim() {
            "Negative Growth" => Some(GrowthCategory::NegativeGrowth),
            "New Customer" => Some(GrowthCategory::NewCustomer),
            "Stable" => Some(GrowthCategory::Stable),
            "Low Growth" => Some(GrowthCategory::LowGrowth),
            "Medium Growth" => Some(GrowthCategory::MediumGrowth),
            "High Growth" => Some(GrowthCategory::HighGrowth),
            _ => None,
        }
    }
}

impl fmt::Display for GrowthCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Usage tiers assigned by the classifier, in ascending score order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageCategory {
    NoUsage,
    VeryLow,
    Low,
    Medium,
    High,
    VeryHigh,
    ExtremelyHigh,
}

impl UsageCategory {
    pub const ALL: [UsageCategory; 7] = [
        UsageCategory::NoUsage,
        UsageCategory::VeryLow,
        UsageCategory::Low,
        UsageCategory::Medium,
        UsageCategory::High,
        UsageCategory::VeryHigh,
        UsageCategory::ExtremelyHigh,
    ];

    pub fn label(self) -> &'static str {
        match self {
            UsageCategory::NoUsage => "No Usage",
            UsageCategory::VeryLow => "Very Low Usage",
            UsageCategory::Low => "Low Usage",
            UsageCategory::Medium => "Medium Usage",
            UsageCategory::High => "High Usage",
            UsageCategory::VeryHigh => "Very High Usage",
            UsageCategory::ExtremelyHigh => "Extremely High Usage",
        }
    }

    pub fn score(self) -> u32 {
        match self {
            UsageCategory::NoUsage => 0,
            UsageCategory::VeryLow => 10,
            UsageCategory::Low => 20,
            UsageCategory::Medium => 30,
            UsageCategory::High => 40,
            UsageCategory::VeryHigh => 50,
            UsageCategory::ExtremelyHigh => 60,
        }
    }

    pub fn parse(label: &str) -> Option<Self> {
        match label.trim() {
            "No Usage" => Some(UsageCategory::NoUsage),
            "Very Low Usage" => Some(UsageCategory::VeryLow),
            "Low Usage" => Some(UsageCategory::Low),
            "Medium Usage" => Some(UsageCategory::Medium),
            "High Usage" => Some(UsageCategory::High),
            "Very High Usage" => Some(UsageCategory::VeryHigh),
            "Extremely High Usage" => Some(UsageCategory::ExtremelyHigh),
            _ => None,
        }
    }
}

impl fmt::Display for UsageCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One consolidated row: July and August extracts joined on customer, with
/// missing numerics carried as `None` (rendered as `-` on disk).
#[derive(Debug, Clone)]
pub struct UsageStats {
    pub customer: String,
    pub july_queries: Option<f64>,
    pub aug_adjusted: Option<f64>,
    pub aug_queries: Option<f64>,
    pub avg_mb_scanned: Option<f64>,
    pub avg_exec_secs: Option<f64>,
    pub max_exec_secs: Option<f64>,
    pub growth_pct: Option<f64>,
    pub growth_category: GrowthCategory,
}

#[derive(Debug, Clone)]
pub struct ClassifiedStats {
    pub stats: UsageStats,
    pub usage_category: UsageCategory,
}

/// One peak-hour record from the Looker activity history.
#[derive(Debug, Clone)]
pub struct PeakTimeRow {
    pub customer: String,
    pub group_name: String,
    pub hour: u32,
    pub query_count: i64,
    pub total_runtime: f64,
    pub average_runtime: f64,
}

/// Assignment-stage view of a customer: categories collapsed into the
/// derived usage value, peak hours in file order (duplicates kept).
#[derive(Debug, Clone)]
pub struct CustomerLoad {
    pub customer: String,
    pub usage_category: UsageCategory,
    pub usage_value: u32,
    pub peak_hours: Vec<u32>,
}

/// Mutable accumulator for one instance slot. `peak_hours` is an ordered
/// multiset: hours append in assignment order and are never deduplicated.
#[derive(Debug, Clone)]
pub struct Instance {
    pub id: usize,
    pub customers: Vec<String>,
    pub total_usage_value: u32,
    pub peak_hours: Vec<u32>,
}

impl Instance {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            customers: Vec::new(),
            total_usage_value: 0,
            peak_hours: Vec::new(),
        }
    }
}

/// Parses a numeric CSV cell where `-` and blank mean absent, not zero.
pub fn de_metric<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    let cell = raw.trim();
    if cell.is_empty() || cell == "-" {
        return Ok(None);
    }
    cell.parse::<f64>()
        .map(Some)
        .map_err(|_| serde::de::Error::custom(format!("invalid numeric cell {raw:?}")))
}

/// Renders an optional metric for persistence, `-` standing in for absent.
pub fn metric_cell(value: Option<f64>) -> String {
    match value {
        Some(v) => v.to_string(),
        None => "-".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn growth_labels_round_trip() {
        for category in [
            GrowthCategory::NegativeGrowth,
            GrowthCategory::NewCustomer,
            GrowthCategory::Stable,
            GrowthCategory::LowGrowth,
            GrowthCategory::MediumGrowth,
            GrowthCategory::HighGrowth,
        ] {
            assert_eq!(GrowthCategory::parse(category.label()), Some(category));
        }
        assert_eq!(GrowthCategory::parse("Sideways"), None);
    }

    #[test]
    fn usage_labels_round_trip() {
        for category in UsageCategory::ALL {
            assert_eq!(UsageCategory::parse(category.label()), Some(category));
        }
        assert_eq!(UsageCategory::parse("Mediumish Usage"), None);
    }

    #[test]
    fn growth_scores_are_ordinal() {
        let scores: Vec<u32> = [
            GrowthCategory::NegativeGrowth,
            GrowthCategory::NewCustomer,
            GrowthCategory::Stable,
            GrowthCategory::LowGrowth,
            GrowthCategory::MediumGrowth,
            GrowthCategory::HighGrowth,
        ]
        .iter()
        .map(|c| c.score())
        .collect();
        assert_eq!(scores, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn usage_scores_step_by_ten() {
        let scores: Vec<u32> = UsageCategory::ALL.iter().map(|c| c.score()).collect();
        assert_eq!(scores, vec![0, 10, 20, 30, 40, 50, 60]);
    }

    #[test]
    fn metric_cell_renders_placeholder() {
        assert_eq!(metric_cell(None), "-");
        assert_eq!(metric_cell(Some(105.0)), "105");
        assert_eq!(metric_cell(Some(12.5)), "12.5");
    }

    #[test]
    fn metric_parse_treats_dash_as_absent() {
        #[derive(Deserialize)]
        struct Row {
            #[serde(deserialize_with = "super::de_metric")]
            value: Option<f64>,
        }

        let mut reader = csv::Reader::from_reader("value\n-\n".as_bytes());
        let row: Row = reader.deserialize().next().unwrap().unwrap();
        assert_eq!(row.value, None);

        let mut reader = csv::Reader::from_reader("value\n42.5\n".as_bytes());
        let row: Row = reader.deserialize().next().unwrap().unwrap();
        assert_eq!(row.value, Some(42.5));

        let mut reader = csv::Reader::from_reader("value\nbogus\n".as_bytes());
        let parsed: Result<Row, _> = reader.deserialize().next().unwrap();
        assert!(parsed.is_err());
    }
}
