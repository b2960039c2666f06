// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Remote Data Client boundary.
//!
//! Every read or write the cache runs goes through the `(data, error)`
//! contract modelled here:
//!
//! - `Err(TransportError)`: the call itself failed (the request never got
//!   an answer).
//! - `Ok(RemoteResponse)`: the store answered; exactly one of `data` /
//!   `error` should be set.
//!
//! [`RemoteResponse::into_result`] folds both layers into a single
//! `Result<T, QueryError>`. Payload shape validation also happens here
//! ([`decode`]), so nothing past this boundary trusts raw JSON.
//!
//! [`RemoteStore`] is the table-oriented client the cache is usually fed
//! from; [`InMemoryRemote`] implements it for tests and demos.

pub mod memory;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::error::QueryError;

pub use memory::{Fault, InMemoryRemote};

/// A JSON record owned by the remote store, identified by its `id` field.
pub type Record = Value;

/// The call never produced an answer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct TransportError(pub String);

/// Error object returned by the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub code: String,
    pub message: String,
}

impl RemoteError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// `(data, error)` pair as answered by the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteResponse<T> {
    pub data: Option<T>,
    pub error: Option<RemoteError>,
}

impl<T> RemoteResponse<T> {
    pub fn ok(data: T) -> Self {
        Self { data: Some(data), error: None }
    }

    pub fn err(error: RemoteError) -> Self {
        Self { data: None, error: Some(error) }
    }

    /// A non-null error always wins; neither field set is a contract breach.
    pub fn into_result(self) -> Result<T, QueryError> {
        match (self.data, self.error) {
            (_, Some(error)) => Err(QueryError::Remote {
                code: error.code,
                message: error.message,
            }),
            (Some(data), None) => Ok(data),
            (None, None) => Err(QueryError::Malformed(
                "response carried neither data nor error".into(),
            )),
        }
    }

    /// Fold a full remote call (transport layer included).
    pub fn settle(call: Result<Self, TransportError>) -> Result<T, QueryError> {
        call.map_err(|e| QueryError::Transport(e.0))?.into_result()
    }
}

/// Decode a JSON payload into a typed resource.
pub fn decode<T: DeserializeOwned>(value: Value) -> Result<T, QueryError> {
    serde_json::from_value(value).map_err(|e| QueryError::Malformed(e.to_string()))
}

/// Ordering for [`Filter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub column: String,
    pub ascending: bool,
}

/// Equality filter plus optional ordering for `select`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub eq: Vec<(String, Value)>,
    pub order: Option<OrderBy>,
}

impl Filter {
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.eq.push((column.into(), value.into()));
        self
    }

    #[must_use]
    pub fn order(mut self, column: impl Into<String>, ascending: bool) -> Self {
        self.order = Some(OrderBy { column: column.into(), ascending });
        self
    }

    /// Whether `record` satisfies every equality clause.
    #[must_use]
    pub fn matches(&self, record: &Record) -> bool {
        self.eq
            .iter()
            .all(|(column, value)| record.get(column) == Some(value))
    }
}

/// Table-oriented remote client. Never retries, never caches.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn select(&self, table: &str, filter: &Filter)
        -> Result<RemoteResponse<Vec<Record>>, TransportError>;

    /// Insert one record; an `id` is assigned when missing.
    async fn insert(&self, table: &str, record: Record)
        -> Result<RemoteResponse<Record>, TransportError>;

    /// Merge `patch` into the record with `id`, returning the updated record.
    async fn update(&self, table: &str, id: &str, patch: Record)
        -> Result<RemoteResponse<Record>, TransportError>;

    /// Delete the record with `id`, returning it.
    async fn delete(&self, table: &str, id: &str)
        -> Result<RemoteResponse<Record>, TransportError>;
}
