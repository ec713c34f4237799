//! Credential sources
//!
//! A source returns raw rows for one owner; `filter_rows` turns them into
//! pool credentials. Two sources ship here: a PostgREST-style table over HTTP
//! and a JSON file on disk.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use common::Secret;
use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::pool::{Credential, SourceStatus};

/// Credential values that are really a spreadsheet/table header row.
const HEADER_LIKE_VALUES: &[&str] = &["apikey", "api key", "key"];

/// Columns requested from table sources.
const SELECT_COLUMNS: &str = "owner,credential,status,label";

/// One row from a credential source.
#[derive(Clone, Deserialize)]
pub struct CredentialRow {
    pub owner: String,
    #[serde(default)]
    pub credential: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
}

impl fmt::Debug for CredentialRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialRow")
            .field("owner", &self.owner)
            .field("credential", &"[REDACTED]")
            .field("status", &self.status)
            .field("label", &self.label)
            .finish()
    }
}

/// External tabular source of credentials, queryable by owner.
///
/// Uses `Pin<Box<dyn Future>>` return types so sources can be passed as
/// `&dyn CredentialSource`.
pub trait CredentialSource: Send + Sync {
    /// Identifier of the backing table or file. `None` or blank means the
    /// source is not configured.
    fn source_id(&self) -> Option<&str>;

    /// Fetch rows belonging to `owner`. Sources may return extra rows;
    /// `filter_rows` drops anything not owned by `owner`.
    fn fetch_rows<'a>(
        &'a self,
        owner: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<CredentialRow>>> + Send + 'a>>;
}

/// Turn raw rows into pool credentials for `owner`.
///
/// Drops rows owned by someone else, rows with an empty or header-like
/// credential, and rows whose status is "disabled". Duplicate credentials keep
/// their first occurrence (position and label).
pub fn filter_rows(owner: &str, rows: Vec<CredentialRow>) -> Vec<Credential> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut credentials = Vec::new();

    for row in rows {
        if row.owner != owner {
            continue;
        }
        let key = row.credential.trim();
        if key.is_empty() || is_header_like(key) {
            continue;
        }
        if SourceStatus::parse(row.status.as_deref()) == SourceStatus::Disabled {
            continue;
        }
        if !seen.insert(key.to_string()) {
            continue;
        }
        let label = row
            .label
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty());
        credentials.push(Credential::new(key, label));
    }

    credentials
}

fn is_header_like(value: &str) -> bool {
    HEADER_LIKE_VALUES
        .iter()
        .any(|h| h.eq_ignore_ascii_case(value))
}

/// PostgREST-style table source.
///
/// Issues `GET {base_url}/{table}?owner=eq.{owner}&select=...`, sending the
/// service key as both `apikey` and bearer token when one is configured.
pub struct RestTableSource {
    client: reqwest::Client,
    base_url: String,
    table: Option<String>,
    service_key: Option<Secret<String>>,
}

impl RestTableSource {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        table: Option<String>,
        service_key: Option<Secret<String>>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            table,
            service_key,
        }
    }

    fn table_url(&self, table: &str, owner: &str) -> Result<reqwest::Url> {
        let raw = format!("{}/{}", self.base_url.trim_end_matches('/'), table);
        let mut url = reqwest::Url::parse(&raw)
            .map_err(|e| Error::Config(format!("invalid credential source URL {raw}: {e}")))?;
        url.query_pairs_mut()
            .append_pair("owner", &format!("eq.{owner}"))
            .append_pair("select", SELECT_COLUMNS);
        Ok(url)
    }
}

impl CredentialSource for RestTableSource {
    fn source_id(&self) -> Option<&str> {
        self.table.as_deref()
    }

    fn fetch_rows<'a>(
        &'a self,
        owner: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<CredentialRow>>> + Send + 'a>> {
        Box::pin(async move {
            let table = self
                .table
                .as_deref()
                .ok_or_else(|| Error::Config("no credential table configured".into()))?;
            let url = self.table_url(table, owner)?;

            let mut request = self.client.get(url);
            if let Some(key) = &self.service_key {
                request = request
                    .header("apikey", key.expose())
                    .bearer_auth(key.expose());
            }

            let response = request
                .send()
                .await
                .map_err(|e| Error::Source(format!("querying table {table}: {e}")))?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(Error::Source(format!(
                    "table {table} returned {}: {body}",
                    status.as_u16()
                )));
            }

            let rows: Vec<CredentialRow> = response
                .json()
                .await
                .map_err(|e| Error::Source(format!("decoding rows from {table}: {e}")))?;
            debug!(table, rows = rows.len(), "fetched credential rows");
            Ok(rows)
        })
    }
}

/// JSON file source: an array of `CredentialRow` objects.
pub struct JsonFileSource {
    path: PathBuf,
}

impl JsonFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CredentialSource for JsonFileSource {
    fn source_id(&self) -> Option<&str> {
        self.path.to_str()
    }

    fn fetch_rows<'a>(
        &'a self,
        _owner: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<CredentialRow>>> + Send + 'a>> {
        Box::pin(async move {
            let contents = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
                Error::Source(format!("reading {}: {e}", self.path.display()))
            })?;
            let rows: Vec<CredentialRow> = serde_json::from_str(&contents).map_err(|e| {
                Error::Source(format!("parsing {}: {e}", self.path.display()))
            })?;
            debug!(path = %self.path.display(), rows = rows.len(), "read credential rows");
            Ok(rows)
        })
    }
}
