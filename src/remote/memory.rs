// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use super::{Filter, Record, RemoteError, RemoteResponse, RemoteStore, TransportError};

/// Failure injected into the next call.
#[derive(Debug, Clone)]
pub enum Fault {
    Transport(String),
    Remote(RemoteError),
}

/// In-memory remote store. Tables hold records in insertion order.
pub struct InMemoryRemote {
    tables: DashMap<String, Vec<Record>>,
    calls: DashMap<(String, &'static str), u64>,
    faults: Mutex<VecDeque<Fault>>,
    latency: Mutex<Option<Duration>>,
}

impl InMemoryRemote {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tables: DashMap::new(),
            calls: DashMap::new(),
            faults: Mutex::new(VecDeque::new()),
            latency: Mutex::new(None),
        }
    }

    /// Seed a table, bypassing counters and faults.
    pub fn seed(&self, table: &str, records: Vec<Record>) {
        self.tables.entry(table.to_string()).or_default().extend(records);
    }

    /// Number of records in `table`
    #[must_use]
    pub fn len(&self, table: &str) -> usize {
        self.tables.get(table).map_or(0, |rows| rows.len())
    }

    /// Check if `table` is empty
    #[must_use]
    pub fn is_empty(&self, table: &str) -> bool {
        self.len(table) == 0
    }

    /// How many times `operation` ("select", "insert", ...) hit `table`.
    #[must_use]
    pub fn calls(&self, table: &str, operation: &'static str) -> u64 {
        self.calls
            .get(&(table.to_string(), operation))
            .map_or(0, |count| *count)
    }

    /// Fail the next call (any table, any operation). Faults queue up.
    pub fn fail_next(&self, fault: Fault) {
        self.faults.lock().push_back(fault);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Count the call, apply latency, and pop an injected fault if any.
    async fn enter(&self, table: &str, operation: &'static str) -> Option<Fault> {
        *self.calls.entry((table.to_string(), operation)).or_insert(0) += 1;
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let fault = self.faults.lock().pop_front();
        if let Some(ref fault) = fault {
            debug!(table, operation, ?fault, "Injected remote fault");
        }
        fault
    }
}

impl Default for InMemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

fn record_id(record: &Record) -> Option<&str> {
    record.get("id").and_then(Value::as_str)
}

fn not_found(table: &str, id: &str) -> RemoteError {
    RemoteError::new("PGRST116", format!("no row in {table} with id {id}"))
}

fn compare(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}

macro_rules! check_fault {
    ($self:ident, $table:expr, $op:literal) => {
        match $self.enter($table, $op).await {
            Some(Fault::Transport(message)) => return Err(TransportError(message)),
            Some(Fault::Remote(error)) => return Ok(RemoteResponse::err(error)),
            None => {}
        }
    };
}

#[async_trait]
impl RemoteStore for InMemoryRemote {
    async fn select(&self, table: &str, filter: &Filter)
        -> Result<RemoteResponse<Vec<Record>>, TransportError>
    {
        check_fault!(self, table, "select");

        let mut rows: Vec<Record> = self
            .tables
            .get(table)
            .map(|rows| rows.iter().filter(|r| filter.matches(r)).cloned().collect())
            .unwrap_or_default();

        if let Some(ref order) = filter.order {
            rows.sort_by(|a, b| {
                let ord = compare(a.get(&order.column), b.get(&order.column));
                if order.ascending { ord } else { ord.reverse() }
            });
        }
        Ok(RemoteResponse::ok(rows))
    }

    async fn insert(&self, table: &str, mut record: Record)
        -> Result<RemoteResponse<Record>, TransportError>
    {
        check_fault!(self, table, "insert");

        let Some(fields) = record.as_object_mut() else {
            return Ok(RemoteResponse::err(RemoteError::new(
                "22P02",
                "record must be a JSON object",
            )));
        };
        if !fields.contains_key("id") {
            fields.insert("id".into(), Value::String(uuid::Uuid::new_v4().to_string()));
        }

        let mut rows = self.tables.entry(table.to_string()).or_default();
        let id = record_id(&record).map(str::to_string);
        if id.is_some() && rows.iter().any(|r| record_id(r) == id.as_deref()) {
            return Ok(RemoteResponse::err(RemoteError::new(
                "23505",
                format!("duplicate key value violates unique constraint \"{table}_pkey\""),
            )));
        }
        rows.push(record.clone());
        Ok(RemoteResponse::ok(record))
    }

    async fn update(&self, table: &str, id: &str, patch: Record)
        -> Result<RemoteResponse<Record>, TransportError>
    {
        check_fault!(self, table, "update");

        let Some(mut rows) = self.tables.get_mut(table) else {
            return Ok(RemoteResponse::err(not_found(table, id)));
        };
        let Some(row) = rows.iter_mut().find(|r| record_id(r) == Some(id)) else {
            return Ok(RemoteResponse::err(not_found(table, id)));
        };
        if let (Some(target), Some(changes)) = (row.as_object_mut(), patch.as_object()) {
            for (field, value) in changes {
                if field != "id" {
                    target.insert(field.clone(), value.clone());
                }
            }
        }
        Ok(RemoteResponse::ok(row.clone()))
    }

    async fn delete(&self, table: &str, id: &str)
        -> Result<RemoteResponse<Record>, TransportError>
    {
        check_fault!(self, table, "delete");

        let Some(mut rows) = self.tables.get_mut(table) else {
            return Ok(RemoteResponse::err(not_found(table, id)));
        };
        match rows.iter().position(|r| record_id(r) == Some(id)) {
            Some(index) => Ok(RemoteResponse::ok(rows.remove(index))),
            None => Ok(RemoteResponse::err(not_found(table, id))),
        }
    }
}
