use anyhow::{bail, Context};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::models::PeakTimeRow;

/// Source of per-customer peak-hour records.
///
/// Kept behind a trait so the collector loop tests against canned rows
/// instead of a live Looker instance.
#[allow(async_fn_in_trait)]
pub trait PeakQuerySource {
    async fn peak_times(&self, customer: &str) -> anyhow::Result<Vec<PeakTimeRow>>;
}

/// Authenticated client for one Looker instance's API 4.0.
pub struct LookerClient {
    http: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
    base_url: String,
    token: String,
}

/// Hosted Looker instances only speak TLS, so the connector has to handle
/// `https://` URIs as well as plain `http://` ones.
fn https_client() -> Client<HttpsConnector<HttpConnector>, Full<Bytes>> {
    Client::builder(TokioExecutor::new()).build(HttpsConnector::new())
}

impl LookerClient {
    /// Exchanges API credentials for a bearer token against `/api/4.0/login`.
    pub async fn login(
        base_url: &str,
        client_id: &str,
        client_secret: &str,
    ) -> anyhow::Result<Self> {
        let http = https_client();
        let base_url = base_url.trim_end_matches('/').to_string();
        let url = format!("{base_url}/api/4.0/login");

        let request = http::Request::builder()
            .method("POST")
            .uri(&url)
            .header(
                http::header::CONTENT_TYPE,
                "application/x-www-form-urlencoded",
            )
            .body(Full::new(Bytes::from(format!(
                "client_id={client_id}&client_secret={client_secret}"
            ))))
            .context("failed to build login request")?;

        debug!("authenticating to {base_url}");
        let response = http
            .request(request)
            .await
            .with_context(|| format!("login request to {url} failed"))?;
        let status = response.status();
        let payload = response
            .into_body()
            .collect()
            .await
            .context("failed to read login response")?
            .to_bytes();
        if !status.is_success() {
            bail!(
                "login to {base_url} failed with {status}: {}",
                String::from_utf8_lossy(&payload)
            );
        }

        let token: AccessToken = serde_json::from_slice(&payload)
            .with_context(|| format!("login response from {base_url} is not an access token"))?;
        Ok(Self {
            http,
            base_url,
            token: token.access_token,
        })
    }
}

impl PeakQuerySource for LookerClient {
    /// Top 5 hours-of-day by total runtime across the customer's Viewer and
    /// Writer groups, from the `system__activity` history explore.
    async fn peak_times(&self, customer: &str) -> anyhow::Result<Vec<PeakTimeRow>> {
        let url = format!("{}/api/4.0/queries/run/json", self.base_url);
        let body = serde_json::to_vec(&peak_hours_query(customer))?;

        let request = http::Request::builder()
            .method("POST")
            .uri(&url)
            .header(http::header::CONTENT_TYPE, "application/json")
            .header(
                http::header::AUTHORIZATION,
                format!("Bearer {}", self.token),
            )
            .body(Full::new(Bytes::from(body)))
            .context("failed to build query request")?;

        let response = self
            .http
            .request(request)
            .await
            .with_context(|| format!("query request to {url} failed"))?;
        let status = response.status();
        let payload = response
            .into_body()
            .collect()
            .await
            .context("failed to read query response")?
            .to_bytes();
        if !status.is_success() {
            bail!(
                "history query for {customer} failed with {status}: {}",
                String::from_utf8_lossy(&payload)
            );
        }

        let rows: Vec<HistoryRow> = serde_json::from_slice(&payload)
            .with_context(|| format!("history rows for {customer} are not a JSON row list"))?;
        Ok(rows
            .into_iter()
            .map(|row| PeakTimeRow {
                customer: customer.to_string(),
                group_name: row.group_name,
                hour: row.hour,
                query_count: row.query_run_count,
                total_runtime: row.total_runtime,
                average_runtime: row.average_runtime,
            })
            .collect())
    }
}

#[derive(Deserialize)]
struct AccessToken {
    access_token: String,
}

#[derive(Serialize)]
struct InlineQuery {
    model: &'static str,
    view: &'static str,
    fields: [&'static str; 6],
    filters: QueryFilters,
    sorts: [&'static str; 1],
    limit: &'static str,
    total: bool,
}

#[derive(Serialize)]
struct QueryFilters {
    #[serde(rename = "group.name")]
    group_name: String,
}

fn peak_hours_query(customer: &str) -> InlineQuery {
    InlineQuery {
        model: "system__activity",
        view: "history",
        // results_from_cache is requested alongside the rest but never
        // persisted downstream.
        fields: [
            "group.name",
            "history.created_hour_of_day",
            "history.query_run_count",
            "history.total_runtime",
            "history.average_runtime",
            "history.results_from_cache",
        ],
        filters: QueryFilters {
            group_name: format!("{customer}_Viewer, {customer}_Writer"),
        },
        sorts: ["history.total_runtime desc"],
        limit: "5",
        total: false,
    }
}

/// Row shape of the history explore; Looker keys columns with dotted
/// model.field names. Unrequested or unmapped keys are ignored.
#[derive(Deserialize)]
struct HistoryRow {
    #[serde(rename = "group.name")]
    group_name: String,
    #[serde(rename = "history.created_hour_of_day")]
    hour: u32,
    #[serde(rename = "history.query_run_count")]
    query_run_count: i64,
    #[serde(rename = "history.total_runtime")]
    total_runtime: f64,
    #[serde(rename = "history.average_runtime")]
    average_runtime: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_targets_the_customer_groups() {
        let query = peak_hours_query("ACME");
        let json = serde_json::to_value(&query).unwrap();

        assert_eq!(json["model"], "system__activity");
        assert_eq!(json["view"], "history");
        assert_eq!(json["filters"]["group.name"], "ACME_Viewer, ACME_Writer");
        assert_eq!(json["sorts"][0], "history.total_runtime desc");
        assert_eq!(json["limit"], "5");
        assert_eq!(json["total"], false);
        assert_eq!(json["fields"].as_array().unwrap().len(), 6);
    }

    #[test]
    fn history_rows_parse_dotted_keys() {
        let payload = r#"[
            {"group.name": "ACME_Viewer", "history.created_hour_of_day": 14,
             "history.query_run_count": 120, "history.total_runtime": 88.5,
             "history.average_runtime": 0.73, "history.results_from_cache": "Yes"}
        ]"#;
        let rows: Vec<HistoryRow> = serde_json::from_str(payload).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].group_name, "ACME_Viewer");
        assert_eq!(rows[0].hour, 14);
        assert_eq!(rows[0].query_run_count, 120);
        assert!((rows[0].total_runtime - 88.5).abs() < 1e-9);
    }

    #[test]
    fn client_builds_with_tls_support() {
        // Smoke-checks the TLS-capable connector; a plain HTTP connector
        // would refuse every hosted cloud.looker.com URL at dial time.
        let _client = https_client();
    }

    #[test]
    fn access_token_parse() {
        let token: AccessToken = serde_json::from_str(
            r#"{"access_token": "abc123", "token_type": "Bearer", "expires_in": 3600}"#,
        )
        .unwrap();
        assert_eq!(token.access_token, "abc123");
    }
}
