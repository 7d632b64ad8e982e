//! RestStore: habit documents over the hosted document API.
//!
//! The API stores flat JSON documents per collection:
//! - `POST  /v1/{collection}` creates a document, returns `{"id", "version"}`
//! - `GET   /v1/{collection}/{id}` returns `{"id", "version", "fields"}`
//! - `PATCH /v1/{collection}/{id}` merges fields, honors `expectedVersion`
//! - `GET   /v1/{collection}?uid=...` lists one user's documents
//!
//! There is no server push; watch streams poll the list endpoint and
//! forward a snapshot whenever the id/version set changes.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use url::Url;

use crate::config::StoreConfig;
use crate::error::{ConfigError, CoreError, StoreError};
use crate::habit::{self, Habit};
use crate::store::{DocumentStore, FieldDelta, Precondition, HABITS_COLLECTION};
use crate::subscription::{HabitSnapshot, HabitStream};

/// Settings for the hosted document API.
#[derive(Debug, Clone)]
pub struct RestStoreConfig {
    /// Base URL of the API, e.g. `https://sync.example.com`
    pub base_url: String,
    /// Bearer token sent with every request
    pub api_token: String,
    /// Collection habits live in
    pub collection: String,
    /// Poll cadence for watch streams, in seconds
    pub poll_interval_secs: u64,
}

impl RestStoreConfig {
    pub fn new(base_url: impl Into<String>, api_token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_token: api_token.into(),
            collection: HABITS_COLLECTION.to_string(),
            poll_interval_secs: 5,
        }
    }
}

impl From<&StoreConfig> for RestStoreConfig {
    fn from(config: &StoreConfig) -> Self {
        Self {
            base_url: config.base_url.clone(),
            api_token: config.api_token.clone(),
            collection: HABITS_COLLECTION.to_string(),
            poll_interval_secs: config.poll_interval_secs,
        }
    }
}

/// Client for the hosted habit document API.
#[derive(Clone)]
pub struct RestStore {
    config: RestStoreConfig,
    /// `{base}/v1/{collection}`, precomputed and validated
    endpoint: String,
    http_client: Client,
}

impl RestStore {
    /// Create a new RestStore. Fails fast on an unparseable base URL.
    pub fn new(config: RestStoreConfig) -> Result<Self, CoreError> {
        Url::parse(&config.base_url).map_err(|err| ConfigError::InvalidValue {
            key: "base_url".to_string(),
            message: err.to_string(),
        })?;
        let endpoint = format!(
            "{}/v1/{}",
            config.base_url.trim_end_matches('/'),
            config.collection
        );
        Ok(Self {
            config,
            endpoint,
            http_client: Client::new(),
        })
    }

    fn doc_url(&self, id: &str) -> String {
        format!("{}/{}", self.endpoint, id)
    }

    /// One user's documents, decoded and sorted newest-first.
    async fn fetch_user_habits(&self, uid: &str) -> Result<Vec<Habit>, StoreError> {
        let resp = self
            .http_client
            .get(&self.endpoint)
            .bearer_auth(&self.config.api_token)
            .query(&[("uid", uid)])
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(StoreError::QueryFailed(format!(
                "list for uid '{uid}' returned {status}"
            )));
        }

        let body: Value = resp.json().await?;
        let documents = body["documents"]
            .as_array()
            .ok_or_else(|| StoreError::FieldDecode {
                id: self.config.collection.clone(),
                message: "missing 'documents' array in list response".to_string(),
            })?;

        let mut habits = Vec::with_capacity(documents.len());
        for document in documents {
            habits.push(decode_envelope(document)?);
        }
        habit::sort_newest_first(&mut habits);
        Ok(habits)
    }
}

/// Decode a `{"id", "version", "fields"}` envelope into a Habit.
fn decode_envelope(envelope: &Value) -> Result<Habit, StoreError> {
    let id = envelope["id"]
        .as_str()
        .ok_or_else(|| StoreError::FieldDecode {
            id: "?".to_string(),
            message: "missing 'id' in document envelope".to_string(),
        })?;
    let fields = envelope
        .get("fields")
        .ok_or_else(|| StoreError::FieldDecode {
            id: id.to_string(),
            message: "missing 'fields' in document envelope".to_string(),
        })?;

    let mut habit: Habit =
        serde_json::from_value(fields.clone()).map_err(|err| StoreError::FieldDecode {
            id: id.to_string(),
            message: err.to_string(),
        })?;
    habit.id = id.to_string();
    habit.version = envelope["version"].as_u64().unwrap_or(0);
    Ok(habit)
}

/// Cheap change detector for poll-based watches.
fn fingerprint(habits: &[Habit]) -> Vec<(String, u64)> {
    habits
        .iter()
        .map(|habit| (habit.id.clone(), habit.version))
        .collect()
}

#[async_trait]
impl DocumentStore for RestStore {
    async fn create(&self, habit: &Habit) -> Result<String, StoreError> {
        let resp = self
            .http_client
            .post(&self.endpoint)
            .bearer_auth(&self.config.api_token)
            .json(habit)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(StoreError::WriteFailed {
                id: self.config.collection.clone(),
                message: format!("create returned {status}: {text}"),
                retryable: status.is_server_error(),
            });
        }

        let body: Value = resp.json().await?;
        let id = body["id"]
            .as_str()
            .ok_or_else(|| StoreError::FieldDecode {
                id: self.config.collection.clone(),
                message: "missing 'id' in create response".to_string(),
            })?;
        Ok(id.to_string())
    }

    async fn get(&self, id: &str) -> Result<Habit, StoreError> {
        let resp = self
            .http_client
            .get(self.doc_url(id))
            .bearer_auth(&self.config.api_token)
            .send()
            .await?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound { id: id.to_string() });
        }
        if !status.is_success() {
            return Err(StoreError::QueryFailed(format!(
                "get '{id}' returned {status}"
            )));
        }

        let envelope: Value = resp.json().await?;
        decode_envelope(&envelope)
    }

    async fn update(
        &self,
        id: &str,
        delta: FieldDelta,
        precondition: Precondition,
    ) -> Result<u64, StoreError> {
        let mut body = json!({ "fields": Value::Object(delta.into_fields()) });
        if let Precondition::Version(expected) = precondition {
            body["expectedVersion"] = expected.into();
        }

        let resp = self
            .http_client
            .patch(self.doc_url(id))
            .bearer_auth(&self.config.api_token)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        match status {
            StatusCode::NOT_FOUND => Err(StoreError::NotFound { id: id.to_string() }),
            StatusCode::CONFLICT => {
                let conflict: Value = resp.json().await.unwrap_or_default();
                let expected = match precondition {
                    Precondition::Version(v) => v,
                    Precondition::None => conflict["expected"].as_u64().unwrap_or(0),
                };
                Err(StoreError::VersionConflict {
                    id: id.to_string(),
                    expected,
                    actual: conflict["actual"].as_u64().unwrap_or(0),
                })
            }
            s if !s.is_success() => {
                let text = resp.text().await.unwrap_or_default();
                Err(StoreError::WriteFailed {
                    id: id.to_string(),
                    message: format!("update returned {s}: {text}"),
                    retryable: s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS,
                })
            }
            _ => {
                let body: Value = resp.json().await?;
                body["version"]
                    .as_u64()
                    .ok_or_else(|| StoreError::FieldDecode {
                        id: id.to_string(),
                        message: "missing 'version' in update response".to_string(),
                    })
            }
        }
    }

    async fn watch(&self, uid: &str) -> Result<HabitStream, StoreError> {
        let initial = self.fetch_user_habits(uid).await?;
        let mut last_seen = fingerprint(&initial);

        let (sender, receiver) = mpsc::unbounded_channel();
        let _ = sender.send(HabitSnapshot {
            habits: initial,
            at: Utc::now(),
        });

        let store = self.clone();
        let uid = uid.to_string();
        let interval = Duration::from_secs(self.config.poll_interval_secs.max(1));
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if sender.is_closed() {
                    break;
                }
                match store.fetch_user_habits(&uid).await {
                    Ok(habits) => {
                        let current = fingerprint(&habits);
                        if current != last_seen {
                            last_seen = current;
                            let snapshot = HabitSnapshot {
                                habits,
                                at: Utc::now(),
                            };
                            if sender.send(snapshot).is_err() {
                                break;
                            }
                        }
                    }
                    Err(err) => {
                        // Keep polling; the next sweep may succeed.
                        tracing::warn!("habit poll for '{uid}' failed: {err}");
                    }
                }
            }
            tracing::debug!("watch for '{uid}' ended");
        });

        Ok(HabitStream::new(receiver))
    }
}
