use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::looker::PeakQuerySource;
use crate::models::PeakTimeRow;

pub const PEAK_COLUMNS: [&str; 6] = [
    "Customer",
    "Name",
    "Hour",
    "Queries",
    "Total Runtime",
    "Average Runtime",
];

/// One row of the credentials file: a Looker instance and the customers
/// hosted on it.
#[derive(Debug, Clone)]
pub struct InstanceCredentials {
    pub looker_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub customers: Vec<String>,
}

pub fn read_credentials(path: &Path) -> anyhow::Result<Vec<InstanceCredentials>> {
    #[derive(serde::Deserialize)]
    struct CredentialsRow {
        looker_url: String,
        client_id: String,
        client_secret: String,
        /// Comma-separated customer list inside a single cell.
        customers: String,
    }

    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("failed to open credentials file {}", path.display()))?;
    let mut instances = Vec::new();
    for result in reader.deserialize::<CredentialsRow>() {
        let row = result.context("malformed row in credentials file")?;
        instances.push(InstanceCredentials {
            looker_url: row.looker_url,
            client_id: row.client_id,
            client_secret: row.client_secret,
            customers: row
                .customers
                .split(',')
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
                .collect(),
        });
    }
    Ok(instances)
}

/// Incremental writer for the peak-times table. Creating it truncates the
/// output file; the header goes out once, ahead of the first data row, no
/// matter how many instances contribute. Flushes after every customer so an
/// interrupted run keeps what it already pulled.
pub struct PeakTimesWriter {
    writer: csv::Writer<File>,
    path: PathBuf,
    header_written: bool,
}

impl PeakTimesWriter {
    pub fn create(path: &Path) -> anyhow::Result<Self> {
        let writer = csv::Writer::from_path(path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        Ok(Self {
            writer,
            path: path.to_path_buf(),
            header_written: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_customer(&mut self, rows: &[PeakTimeRow]) -> anyhow::Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        if !self.header_written {
            self.writer.write_record(PEAK_COLUMNS)?;
            self.header_written = true;
        }
        for row in rows {
            self.writer.write_record([
                row.customer.clone(),
                row.group_name.clone(),
                row.hour.to_string(),
                row.query_count.to_string(),
                row.total_runtime.to_string(),
                row.average_runtime.to_string(),
            ])?;
        }
        self.writer.flush()?;
        Ok(rows.len())
    }
}

/// Pulls peak times for every customer on one instance and appends them to
/// the shared output file. Customers with no query history are skipped with
/// a notice, which is normal for dormant accounts.
pub async fn collect_instance<S: PeakQuerySource>(
    source: &S,
    customers: &[String],
    writer: &mut PeakTimesWriter,
) -> anyhow::Result<usize> {
    let mut written = 0;
    for customer in customers {
        println!("Retrieving peak times for customer {customer}...");
        let rows = source.peak_times(customer).await?;
        if rows.is_empty() {
            println!("No queries found.\n");
            continue;
        }
        let saved = writer.write_customer(&rows)?;
        written += saved;
        println!("Saved {saved} rows to {}.\n", writer.path().display());
    }
    Ok(written)
}

/// Reads the peak-times table back as hours per customer, in file order.
/// Repeated hours are kept; a customer reported under several groups counts
/// each occurrence.
pub fn read_peak_hours(path: &Path) -> anyhow::Result<HashMap<String, Vec<u32>>> {
    #[derive(serde::Deserialize)]
    struct PeakRow {
        #[serde(rename = "Customer")]
        customer: String,
        #[serde(rename = "Hour")]
        hour: u32,
    }

    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("failed to open peak-times table {}", path.display()))?;
    let mut hours: HashMap<String, Vec<u32>> = HashMap::new();
    for result in reader.deserialize::<PeakRow>() {
        let row = result.context("malformed row in peak-times table")?;
        hours.entry(row.customer).or_default().push(row.hour);
    }
    Ok(hours)
}
