//! Credential pool state machine and round-robin selection
//!
//! The pool moves between three states as credentials fail:
//! - Clean: nothing marked failed
//! - Degraded: some, but not all, credentials marked failed
//! - AllFailed: every credential marked failed; the next `get_current()`
//!   clears the failed set and returns to Clean
//!
//! All state sits behind one async mutex so index moves and failure marking
//! from concurrent workers never interleave.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;

use common::Secret;
use completion::{CredentialRotator, RotationReason};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::source::{CredentialSource, filter_rows};

/// Status a credential carried in its source row.
///
/// Disabled rows are dropped at load time, so pooled credentials are always
/// `Active`; the variant exists for rows inspected before filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceStatus {
    Active,
    Disabled,
}

impl SourceStatus {
    /// Parse a source row's status column. Only "disabled" (any case) disables.
    pub fn parse(raw: Option<&str>) -> Self {
        match raw {
            Some(s) if s.trim().eq_ignore_ascii_case("disabled") => SourceStatus::Disabled,
            _ => SourceStatus::Active,
        }
    }
}

/// One caller credential. Identity is the key value.
#[derive(Debug, Clone)]
pub struct Credential {
    pub key: Secret<String>,
    pub label: Option<String>,
    pub source_status: SourceStatus,
}

impl Credential {
    pub fn new(key: impl Into<String>, label: Option<String>) -> Self {
        Self {
            key: Secret::new(key.into()),
            label,
            source_status: SourceStatus::Active,
        }
    }

    /// Label if present, otherwise a redacted key hint.
    pub fn display_name(&self) -> String {
        self.label.clone().unwrap_or_else(|| self.key.hint())
    }
}

/// Read-only snapshot of the pool for status displays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub total: usize,
    pub current_position: usize,
    pub failed_count: usize,
    pub current_label: Option<String>,
}

#[derive(Debug, Default)]
struct PoolState {
    credentials: Vec<Credential>,
    current: usize,
    /// Indices into `credentials`. Cleared whenever `credentials` is replaced.
    failed: HashSet<usize>,
}

impl PoolState {
    fn rotate(&mut self) {
        let n = self.credentials.len();
        if n <= 1 {
            return;
        }
        self.current = (self.current + 1) % n;
        metrics::counter!("key_pool_rotations_total").increment(1);
    }

    fn mark_failed(&mut self, index: usize) {
        self.failed.insert(index);
        metrics::counter!("key_pool_failures_total").increment(1);
        metrics::gauge!("key_pool_failed_credentials").set(self.failed.len() as f64);
        self.rotate();
    }
}

/// Round-robin credential pool with failure tracking and self-healing reset.
#[derive(Debug, Default)]
pub struct CredentialPool {
    state: Mutex<PoolState>,
}

impl CredentialPool {
    /// Create an empty pool. Call `load` before first use.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a pool from credentials already in hand.
    ///
    /// Duplicate keys collapse to their first occurrence.
    pub fn from_credentials(credentials: Vec<Credential>) -> Self {
        let mut seen = HashSet::new();
        let credentials: Vec<Credential> = credentials
            .into_iter()
            .filter(|c| seen.insert(c.key.expose().clone()))
            .collect();
        info!(credentials = credentials.len(), "credential pool initialized");
        Self {
            state: Mutex::new(PoolState {
                credentials,
                current: 0,
                failed: HashSet::new(),
            }),
        }
    }

    /// Replace the pool contents with `owner_id`'s credentials from `source`.
    ///
    /// Resets the current position to the first credential and clears the
    /// failed set. Returns the number of credentials loaded.
    pub async fn load(&self, owner_id: &str, source: &dyn CredentialSource) -> Result<usize> {
        let source_id = source
            .source_id()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::Config("no credential source identifier configured".into()))?
            .to_string();

        let rows = source.fetch_rows(owner_id).await?;
        let fetched = rows.len();
        let credentials = filter_rows(owner_id, rows);
        let loaded = credentials.len();

        let mut state = self.state.lock().await;
        state.credentials = credentials;
        state.current = 0;
        state.failed.clear();
        metrics::gauge!("key_pool_failed_credentials").set(0.0);

        info!(
            owner = owner_id,
            source = %source_id,
            rows = fetched,
            credentials = loaded,
            "credentials loaded"
        );
        if loaded == 0 {
            warn!(owner = owner_id, "credential source returned no usable credentials");
        }
        Ok(loaded)
    }

    /// Return the current credential, skipping failed ones.
    ///
    /// Scans at most one full pass from the current position. If every
    /// credential is marked failed, the failed set is cleared and selection
    /// restarts from the first credential.
    pub async fn get_current(&self) -> Result<Credential> {
        let mut state = self.state.lock().await;
        let n = state.credentials.len();
        if n == 0 {
            return Err(Error::NoCredentials);
        }

        let mut checked = 0;
        while state.failed.contains(&state.current) && checked < n {
            state.current = (state.current + 1) % n;
            checked += 1;
        }

        if state.failed.contains(&state.current) {
            info!(
                credentials = n,
                "all credentials marked failed, resetting pool"
            );
            state.failed.clear();
            state.current = 0;
            metrics::counter!("key_pool_resets_total").increment(1);
            metrics::gauge!("key_pool_failed_credentials").set(0.0);
        }

        Ok(state.credentials[state.current].clone())
    }

    /// Advance to the next credential. No-op with fewer than two credentials.
    pub async fn rotate_to_next(&self) {
        let mut state = self.state.lock().await;
        state.rotate();
        debug!(position = state.current, "rotated to next credential");
    }

    /// Mark the current credential failed and advance.
    pub async fn mark_current_failed(&self) {
        let mut state = self.state.lock().await;
        if state.credentials.is_empty() {
            return;
        }
        let index = state.current;
        let name = state.credentials[index].display_name();
        state.mark_failed(index);
        info!(
            credential = %name,
            failed = state.failed.len(),
            total = state.credentials.len(),
            "credential marked failed"
        );
    }

    /// Mark the credential with the given key failed and advance.
    ///
    /// An unknown key is logged and only the rotation happens.
    pub async fn mark_failed(&self, key: &str) {
        let mut state = self.state.lock().await;
        match state.credentials.iter().position(|c| c.key.expose() == key) {
            Some(index) => {
                let name = state.credentials[index].display_name();
                state.mark_failed(index);
                info!(
                    credential = %name,
                    failed = state.failed.len(),
                    total = state.credentials.len(),
                    "credential marked failed"
                );
            }
            None => {
                warn!("mark_failed called with a key not in the pool");
                state.rotate();
            }
        }
    }

    /// Best-effort snapshot for display. Never mutates the pool.
    pub async fn status(&self) -> PoolStatus {
        let state = self.state.lock().await;
        PoolStatus {
            total: state.credentials.len(),
            current_position: state.current,
            failed_count: state.failed.len(),
            current_label: state
                .credentials
                .get(state.current)
                .map(Credential::display_name),
        }
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.credentials.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl CredentialRotator for CredentialPool {
    /// Rate-limit errors condemn the current credential; empty results only
    /// move past it, since they say nothing about its quota.
    fn rotate(&self, reason: RotationReason) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            match reason {
                RotationReason::RateLimited => self.mark_current_failed().await,
                RotationReason::EmptyResult => self.rotate_to_next().await,
            }
        })
    }
}
