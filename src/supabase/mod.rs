pub mod models;

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{
    header::{HeaderMap, HeaderValue, AUTHORIZATION},
    Client, Method, RequestBuilder, Url,
};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::{config::Config, relay::RelayState, store::MachineStore};

use self::models::{
    ActivationClose, ClearCommand, DeviceRecord, DeviceSnapshot, IdRow, NewActivation,
    PendingCommand, PostgrestError, RowId,
};

/// A single stalled request must not freeze the control loop for long.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Client for the Supabase PostgREST endpoint (`<project>/rest/v1`).
#[derive(Debug)]
pub struct SupabaseClient {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    http: Client,
    rest_url: Url,
    device_table: String,
    history_table: String,
}

impl SupabaseClient {
    pub fn new(config: &Config) -> Result<Self> {
        let rest_url = rest_base(&config.supabase_url)?;

        let mut headers = HeaderMap::new();
        let key = HeaderValue::from_str(&config.supabase_key)
            .context("SUPABASE_KEY contains characters not allowed in a header")?;
        let mut bearer = HeaderValue::from_str(&format!("Bearer {}", config.supabase_key))
            .context("SUPABASE_KEY contains characters not allowed in a header")?;
        bearer.set_sensitive(true);
        headers.insert("apikey", key);
        headers.insert(AUTHORIZATION, bearer);

        let http = Client::builder()
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            inner: Arc::new(Inner {
                http,
                rest_url,
                device_table: config.device_table.clone(),
                history_table: config.history_table.clone(),
            }),
        })
    }

    fn table_url(&self, table: &str, params: &[(&str, String)]) -> Url {
        table_url(&self.inner.rest_url, table, params)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.inner.http.request(method, url)
    }

    /// Send `req` and return the body, mapping non-2xx answers to errors
    /// carrying the PostgREST error envelope.
    async fn send(&self, req: RequestBuilder, what: &str) -> Result<Vec<u8>> {
        let resp = req
            .send()
            .await
            .with_context(|| format!("{what}: request failed"))?;
        let status = resp.status();
        let bytes = resp
            .bytes()
            .await
            .with_context(|| format!("{what}: failed to read response body"))?;

        if !status.is_success() {
            return Err(PostgrestError::from_response(status, &bytes)).context(what.to_owned());
        }
        debug!(what, status = %status, bytes = bytes.len(), "Backend call succeeded");
        Ok(bytes.to_vec())
    }

    /// GET a filtered table and return the first row, if any.
    async fn select_one<T: DeserializeOwned>(&self, url: Url, what: &str) -> Result<Option<T>> {
        let bytes = self.send(self.request(Method::GET, url), what).await?;
        let mut rows: Vec<T> = serde_json::from_slice(&bytes)
            .with_context(|| format!("{what}: failed to deserialize response"))?;
        Ok(if rows.is_empty() {
            None
        } else {
            Some(rows.swap_remove(0))
        })
    }

    fn device_filter(device_id: &str) -> (&'static str, String) {
        ("id", format!("eq.{device_id}"))
    }
}

#[async_trait]
impl MachineStore for SupabaseClient {
    async fn fetch_device(&self, device_id: &str) -> Result<Option<DeviceRecord>> {
        let url = self.table_url(
            &self.inner.device_table,
            &[
                ("select", "*".to_owned()),
                Self::device_filter(device_id),
                ("limit", "1".to_owned()),
            ],
        );
        self.select_one(url, "fetch device").await
    }

    async fn fetch_command(&self, device_id: &str) -> Result<Option<PendingCommand>> {
        let url = self.table_url(
            &self.inner.device_table,
            &[
                ("select", "command,command_user_id".to_owned()),
                Self::device_filter(device_id),
                ("limit", "1".to_owned()),
            ],
        );
        self.select_one(url, "fetch command").await
    }

    async fn clear_command(&self, device_id: &str, state: Option<RelayState>) -> Result<()> {
        let url = self.table_url(&self.inner.device_table, &[Self::device_filter(device_id)]);
        let req = self
            .request(Method::PATCH, url)
            .header("Prefer", "return=minimal")
            .json(&ClearCommand::new(state));
        self.send(req, "clear command").await?;
        Ok(())
    }

    async fn upsert_device(&self, snapshot: &DeviceSnapshot) -> Result<()> {
        let url = self.table_url(&self.inner.device_table, &[]);
        let req = self
            .request(Method::POST, url)
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(snapshot);
        self.send(req, "upsert device").await?;
        Ok(())
    }

    async fn open_activation(&self, record: &NewActivation) -> Result<Option<RowId>> {
        let url = self.table_url(&self.inner.history_table, &[("select", "id".to_owned())]);
        let req = self
            .request(Method::POST, url)
            .header("Prefer", "return=representation")
            .json(record);
        let bytes = self.send(req, "insert activation").await?;

        // Row-level security can let the insert through but hide the row,
        // which comes back as an empty array or an empty body.
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        let rows: Vec<IdRow> = serde_json::from_slice(&bytes)
            .context("insert activation: failed to deserialize response")?;
        Ok(rows.into_iter().next().map(|r| r.id))
    }

    async fn latest_activation(&self, machine_id: &str) -> Result<Option<RowId>> {
        let url = self.table_url(
            &self.inner.history_table,
            &[
                ("select", "id".to_owned()),
                ("machine_id", format!("eq.{machine_id}")),
                ("order", "started_at.desc".to_owned()),
                ("limit", "1".to_owned()),
            ],
        );
        let row: Option<IdRow> = self.select_one(url, "find latest activation").await?;
        Ok(row.map(|r| r.id))
    }

    async fn close_activation(&self, id: &RowId, update: &ActivationClose) -> Result<()> {
        let url = self.table_url(&self.inner.history_table, &[("id", format!("eq.{id}"))]);
        let req = self
            .request(Method::PATCH, url)
            .header("Prefer", "return=minimal")
            .json(update);
        self.send(req, "close activation").await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// URL helpers
// ---------------------------------------------------------------------------

/// `https://xyz.supabase.co` → `https://xyz.supabase.co/rest/v1/`
fn rest_base(project_url: &str) -> Result<Url> {
    let trimmed = project_url.trim().trim_end_matches('/');
    let base = if trimmed.ends_with("/rest/v1") {
        format!("{trimmed}/")
    } else {
        format!("{trimmed}/rest/v1/")
    };
    let url = Url::parse(&base).with_context(|| format!("SUPABASE_URL is not a valid URL: {project_url:?}"))?;
    if url.cannot_be_a_base() {
        anyhow::bail!("SUPABASE_URL must be an http(s) URL, got {project_url:?}");
    }
    Ok(url)
}

fn table_url(base: &Url, table: &str, params: &[(&str, String)]) -> Url {
    let mut url = base.clone();
    if let Ok(mut segments) = url.path_segments_mut() {
        segments.pop_if_empty().push(table);
    }
    if !params.is_empty() {
        let mut query = url.query_pairs_mut();
        for (k, v) in params {
            query.append_pair(k, v);
        }
    }
    url
}
