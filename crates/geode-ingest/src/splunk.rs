//! Splunk search-job client.
//!
//! One page is one blocking search job: create the job for
//! `[earliest, latest]`, read its result count, fetch every result as JSON,
//! then cancel the job to release it on the search head. Searches are
//! sorted ascending by `start` on the search head, so a job truncated at
//! `max_events` holds the earliest results. A page is capped when the job
//! returned `max_events` results or more, which tells the cursor to
//! paginate from the latest start it saw.
//!
//! ```text
//! POST /services/search/jobs                 (exec_mode=blocking) -> sid
//! GET  /services/search/jobs/{sid}           -> resultCount
//! GET  /services/search/jobs/{sid}/results   (count=0)            -> results
//! POST /services/search/jobs/{sid}/control   (action=cancel)
//! ```

use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use geode_core::config::SourceConfig;
use geode_core::source::{ObservationSource, SearchPage, SourceError, StreamQuery};
use geode_types::{RawObservation, RawValue, TIMESTAMP_FORMAT, format_timestamp};
use reqwest::{RequestBuilder, StatusCode};
use serde_json::Value;

use crate::error::IngestError;

/// Connect timeout for the search head.
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Search API client for one search head.
pub struct SplunkSource {
    client: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
    max_events: u32,
}

impl SplunkSource {
    /// Build a client from the `source` configuration section.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::Source`] if the HTTP client cannot be built.
    pub fn new(config: &SourceConfig) -> Result<Self, IngestError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()
            .map_err(|e| IngestError::Source {
                message: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            username: config.username.clone(),
            password: config.password.clone(),
            max_events: config.max_events,
        })
    }

    fn jobs_url(&self, path: &str) -> String {
        format!("{}/services/search/jobs{path}", self.base_url)
    }

    /// Send an authenticated request and decode its JSON body.
    async fn call(&self, request: RequestBuilder, what: &str) -> Result<Value, SourceError> {
        let response = request
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(|e| SourceError::Unavailable(format!("{what} request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response
                .text()
                .await
                .unwrap_or_else(|_| "unable to read error body".to_owned());
            let message = format!("{what} returned {status}: {error_body}");
            return Err(if is_retryable(status) {
                SourceError::Unavailable(message)
            } else {
                SourceError::Rejected(message)
            });
        }

        response
            .json()
            .await
            .map_err(|e| SourceError::Unavailable(format!("{what} response parse failed: {e}")))
    }

    async fn create_job(
        &self,
        search: &str,
        earliest: DateTime<Utc>,
        latest: DateTime<Utc>,
    ) -> Result<String, SourceError> {
        let max_count = self.max_events.to_string();
        let form = [
            ("search", search_string(search)),
            ("exec_mode", "blocking".to_owned()),
            ("output_mode", "json".to_owned()),
            ("time_format", TIMESTAMP_FORMAT.to_owned()),
            ("earliest_time", format_timestamp(earliest)),
            ("latest_time", format_timestamp(latest)),
            ("max_count", max_count),
        ];
        let body = self
            .call(self.client.post(self.jobs_url("")).form(&form), "job creation")
            .await?;
        extract_sid(&body)
    }

    async fn read_job(&self, sid: &str) -> Result<(u64, Vec<RawObservation>), SourceError> {
        let status = self
            .call(
                self.client
                    .get(self.jobs_url(&format!("/{sid}")))
                    .query(&[("output_mode", "json")]),
                "job status",
            )
            .await?;
        let count = extract_result_count(&status)?;

        let results = self
            .call(
                self.client
                    .get(self.jobs_url(&format!("/{sid}/results")))
                    .query(&[("output_mode", "json"), ("count", "0")]),
                "job results",
            )
            .await?;
        Ok((count, extract_results(results)?))
    }

    /// Take ownership of job `sid`; it is cancelled when the handle drops.
    fn job(&self, sid: String) -> SearchJob {
        SearchJob {
            client: self.client.clone(),
            control_url: self.jobs_url(&format!("/{sid}/control")),
            username: self.username.clone(),
            password: self.password.clone(),
            sid,
        }
    }
}

impl ObservationSource for SplunkSource {
    async fn search(
        &self,
        query: &StreamQuery,
        earliest: DateTime<Utc>,
        latest: DateTime<Utc>,
    ) -> Result<SearchPage, SourceError> {
        let sid = self.create_job(&query.search, earliest, latest).await?;
        let job = self.job(sid);
        let (result_count, observations) = self.read_job(&job.sid).await?;

        let capped = result_count >= u64::from(self.max_events);
        tracing::debug!(
            stream = %query.stream,
            sid = %job.sid,
            result_count,
            received = observations.len(),
            capped,
            "Search job finished"
        );
        Ok(SearchPage {
            observations,
            capped,
        })
    }
}

/// A search job on the search head.
///
/// Dropping the handle releases the job, whether the search finished, failed,
/// or was abandoned mid-read by a query timeout. The cancel request runs in
/// the background; failures are logged and the job expires on its own.
struct SearchJob {
    client: reqwest::Client,
    control_url: String,
    username: String,
    password: String,
    sid: String,
}

impl Drop for SearchJob {
    fn drop(&mut self) {
        let sid = std::mem::take(&mut self.sid);
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(%sid, "No runtime left to cancel search job");
            return;
        };
        let request = self
            .client
            .post(&self.control_url)
            .basic_auth(&self.username, Some(&self.password))
            .form(&[("action", "cancel"), ("output_mode", "json")]);

        runtime.spawn(async move {
            match request
                .send()
                .await
                .and_then(reqwest::Response::error_for_status)
            {
                Ok(_) => tracing::debug!(%sid, "Search job cancelled"),
                Err(err) => tracing::warn!(%sid, error = %err, "Failed to cancel search job"),
            }
        });
    }
}

fn is_retryable(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

/// Sort stage appended to every search. Event searches return newest
/// first, and a job truncated at `max_count` must keep the earliest results
/// or the cursor would page past the ones it never saw.
const ASCENDING_BY_START: &str = "| sort 0 start";

/// Searches must start with a command; bare queries get the implicit
/// `search` prepended. Every search ends sorted ascending by `start`.
fn search_string(search: &str) -> String {
    let trimmed = search.trim();
    if trimmed.starts_with("search ") || trimmed.starts_with('|') {
        format!("{trimmed} {ASCENDING_BY_START}")
    } else {
        format!("search {trimmed} {ASCENDING_BY_START}")
    }
}

fn extract_sid(body: &Value) -> Result<String, SourceError> {
    body.get("sid")
        .and_then(Value::as_str)
        .map(ToOwned::to_owned)
        .ok_or_else(|| SourceError::Rejected("job creation response missing sid".to_owned()))
}

/// `resultCount` arrives as a number or, on older search heads, a string.
fn extract_result_count(body: &Value) -> Result<u64, SourceError> {
    let count = body
        .get("entry")
        .and_then(|entries| entries.get(0))
        .and_then(|entry| entry.get("content"))
        .and_then(|content| content.get("resultCount"));

    let parsed = match count {
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| {
        SourceError::Rejected("job status missing entry[0].content.resultCount".to_owned())
    })
}

/// Decode the results array and order it by start, ascending. Rows whose
/// start cannot be read sort first; `normalize` rejects them later.
fn extract_results(mut body: Value) -> Result<Vec<RawObservation>, SourceError> {
    let results = match body.get_mut("results").map(Value::take) {
        Some(Value::Array(results)) => results,
        Some(Value::Null) | None => Vec::new(),
        Some(other) => {
            return Err(SourceError::Rejected(format!(
                "results is not an array: {other}"
            )));
        }
    };

    let mut observations = results
        .into_iter()
        .map(serde_json::from_value::<RawObservation>)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| SourceError::Rejected(format!("malformed result row: {e}")))?;
    observations.sort_by_cached_key(start_of);
    Ok(observations)
}

fn start_of(observation: &RawObservation) -> Option<NaiveDateTime> {
    observation
        .get("start")
        .and_then(RawValue::as_text)
        .and_then(|text| NaiveDateTime::parse_from_str(text.trim(), TIMESTAMP_FORMAT).ok())
}
