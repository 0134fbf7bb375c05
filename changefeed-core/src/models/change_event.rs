use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// Column name to value mapping carried by a change event
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Kind of row mutation captured upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    /// Symbolic name used on the wire
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One committed data mutation.
///
/// Fields are read-only once the event is built. The only permitted change
/// after construction is [`ChangeEvent::backfill_timestamp`], applied once at
/// the point where the event enters a hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    operation: Operation,
    table: String,
    #[serde(default)]
    data: Row,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    old_data: Row,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timestamp: Option<DateTime<Utc>>,
}

impl ChangeEvent {
    /// Create an event for `table`. Fails when the table name is empty.
    pub fn new(operation: Operation, table: impl Into<String>, data: Row) -> Result<Self> {
        let event = Self {
            operation,
            table: table.into(),
            data,
            old_data: Row::new(),
            timestamp: None,
        };
        event.validate()?;
        Ok(event)
    }

    pub fn insert(table: impl Into<String>, data: Row) -> Result<Self> {
        Self::new(Operation::Insert, table, data)
    }

    pub fn update(table: impl Into<String>, data: Row, old_data: Row) -> Result<Self> {
        Ok(Self::new(Operation::Update, table, data)?.with_old_data(old_data))
    }

    /// `identity` names the deleted row; `old_data` carries its last values.
    pub fn delete(table: impl Into<String>, identity: Row, old_data: Row) -> Result<Self> {
        Ok(Self::new(Operation::Delete, table, identity)?.with_old_data(old_data))
    }

    #[must_use]
    pub fn with_old_data(mut self, old_data: Row) -> Self {
        self.old_data = old_data;
        self
    }

    #[must_use]
    pub const fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Decode a JSON payload and check it is well formed
    pub fn from_json(payload: &[u8]) -> Result<Self> {
        let event: Self = serde_json::from_slice(payload)?;
        event.validate()?;
        Ok(event)
    }

    pub fn validate(&self) -> Result<()> {
        if self.table.trim().is_empty() {
            return Err(Error::InvalidEvent("table name must not be empty".to_string()));
        }
        Ok(())
    }

    /// Set the timestamp to `now` if the producer left it unset.
    /// Returns true when a value was written.
    pub fn backfill_timestamp(&mut self, now: DateTime<Utc>) -> bool {
        if self.timestamp.is_some() {
            return false;
        }
        self.timestamp = Some(now);
        true
    }

    #[must_use]
    pub const fn operation(&self) -> Operation {
        self.operation
    }

    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    #[must_use]
    pub const fn data(&self) -> &Row {
        &self.data
    }

    #[must_use]
    pub const fn old_data(&self) -> &Row {
        &self.old_data
    }

    #[must_use]
    pub const fn timestamp(&self) -> Option<&DateTime<Utc>> {
        self.timestamp.as_ref()
    }
}
