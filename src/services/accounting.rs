//! Download accounting: tells the backend API that a version file was served.
//!
//! Reporting is best effort. Every call runs on the background scheduler and
//! its outcome is only logged; it never influences the response the client
//! receives and is never retried.

use crate::{
    models::download::{DownloadEvent, ResourceIdentity},
    services::background::BackgroundTasks,
};
use axum::http::{HeaderMap, HeaderName, StatusCode};
use std::{collections::HashMap, fmt, time::Duration};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Used when the edge did not forward a client address.
pub const DEFAULT_CLIENT_IP: &str = "127.0.0.1";

#[derive(Debug, Error)]
pub enum AccountingError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("backend rejected download count with {status}: {body}")]
    Rejected { status: StatusCode, body: String },
    #[error("`{0}` is not a valid header name")]
    InvalidClientIpHeader(String),
}

/// Connection settings for the accounting backend.
#[derive(Clone)]
pub struct AccountingSettings {
    pub base_url: String,
    pub admin_key: String,
    pub rate_limit_key: String,
    pub client_ip_header: String,
    pub timeout: Duration,
}

impl fmt::Debug for AccountingSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountingSettings")
            .field("base_url", &self.base_url)
            .field("admin_key", &"<redacted>")
            .field("rate_limit_key", &"<redacted>")
            .field("client_ip_header", &self.client_ip_header)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Clone)]
pub struct AccountingReporter {
    client: reqwest::Client,
    endpoint: String,
    admin_key: String,
    rate_limit_key: String,
    client_ip_header: HeaderName,
    tasks: BackgroundTasks,
}

impl AccountingReporter {
    pub fn new(settings: &AccountingSettings, tasks: BackgroundTasks) -> Result<Self, AccountingError> {
        let client_ip_header = HeaderName::try_from(settings.client_ip_header.as_str())
            .map_err(|_| AccountingError::InvalidClientIpHeader(settings.client_ip_header.clone()))?;
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()?;

        Ok(Self {
            client,
            endpoint: count_download_url(&settings.base_url),
            admin_key: settings.admin_key.clone(),
            rate_limit_key: settings.rate_limit_key.clone(),
            client_ip_header,
            tasks,
        })
    }

    /// Assemble the event for a download of `url` by the client that sent `headers`.
    pub fn build_event(
        &self,
        url: &str,
        headers: &HeaderMap,
        identity: ResourceIdentity,
    ) -> DownloadEvent {
        let ip = headers
            .get(&self.client_ip_header)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(DEFAULT_CLIENT_IP)
            .to_string();

        DownloadEvent {
            url: url.to_string(),
            project_id: identity.project_id,
            version_name: identity.version_id,
            ip,
            headers: flatten_headers(headers),
        }
    }

    /// Send the event and wait for the backend's answer.
    pub async fn send(&self, event: &DownloadEvent) -> Result<StatusCode, AccountingError> {
        debug!(endpoint = %self.endpoint, "counting download");

        let response = self
            .client
            .patch(&self.endpoint)
            .header("Modrinth-Admin", &self.admin_key)
            .header("x-ratelimit-key", &self.rate_limit_key)
            .json(event)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(AccountingError::Rejected { status, body });
        }

        debug!(%status, body = %body, "download count accepted");
        Ok(status)
    }

    /// Fire and forget: schedule `send` on the background scheduler and log
    /// whatever happens.
    pub fn dispatch(&self, event: DownloadEvent) {
        info!(
            project_id = %event.project_id,
            version = %event.version_name,
            "Attempting to count download"
        );

        let reporter = self.clone();
        self.tasks.spawn("count-download", async move {
            match reporter.send(&event).await {
                Ok(status) => info!(%status, "Finished counting download"),
                Err(AccountingError::Rejected { status, body }) => {
                    warn!(%status, body = %body, "Non-success response when counting download")
                }
                Err(err) => error!("Error counting download: {}", err),
            }
        });
    }
}

fn count_download_url(base_url: &str) -> String {
    format!("{}/admin/_count-download", base_url.trim_end_matches('/'))
}

/// Copy request headers into a flat map. Repeated headers are joined with `, `.
fn flatten_headers(headers: &HeaderMap) -> HashMap<String, String> {
    let mut flat: HashMap<String, String> = HashMap::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes());
        flat.entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert_with(|| value.into_owned());
    }
    flat
}
