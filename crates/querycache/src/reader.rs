use crate::coercion::FromDbValue;
use crate::snapshot::{ColumnInfo, DataReader, ResultSnapshot};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use querycache_core::{DbValue, QueryCacheError, Result, ValueKind};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use uuid::Uuid;

/// Replays a [`ResultSnapshot`] through the forward-only cursor contract.
///
/// The snapshot is shared, never mutated; each reader only owns its position.
#[derive(Debug, Clone)]
pub struct SnapshotReader {
    snapshot: Arc<ResultSnapshot>,
    position: Option<usize>,
    closed: bool,
}

impl SnapshotReader {
    pub fn new(snapshot: impl Into<Arc<ResultSnapshot>>) -> Self {
        Self {
            snapshot: snapshot.into(),
            position: None,
            closed: false,
        }
    }

    pub fn snapshot(&self) -> &ResultSnapshot {
        &self.snapshot
    }

    pub fn has_rows(&self) -> bool {
        self.snapshot.row_count() > 0
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn close(&mut self) {
        self.closed = true;
    }

    /// Snapshots hold a single result set.
    pub fn next_result(&mut self) -> bool {
        false
    }

    pub fn column(&self, ordinal: usize) -> Result<&ColumnInfo> {
        self.snapshot
            .columns
            .get(ordinal)
            .ok_or(QueryCacheError::OrdinalOutOfRange {
                ordinal,
                field_count: self.snapshot.field_count,
            })
    }

    /// Case-insensitive column lookup.
    pub fn get_ordinal(&self, name: &str) -> Result<usize> {
        self.snapshot
            .columns
            .iter()
            .find(|c| c.name == name)
            .or_else(|| {
                self.snapshot
                    .columns
                    .iter()
                    .find(|c| c.name.eq_ignore_ascii_case(name))
            })
            .map(|c| c.ordinal)
            .ok_or_else(|| QueryCacheError::InvalidArgument(format!("no column named '{}'", name)))
    }

    fn cell(&self, ordinal: usize) -> Result<&DbValue> {
        if self.closed {
            return Err(QueryCacheError::InvalidOperation(
                "reader is closed".to_string(),
            ));
        }
        let row = self
            .position
            .and_then(|p| self.snapshot.rows.get(p))
            .ok_or_else(|| QueryCacheError::InvalidOperation("no current row".to_string()))?;
        row.get(ordinal).ok_or(QueryCacheError::OrdinalOutOfRange {
            ordinal,
            field_count: self.snapshot.field_count,
        })
    }

    /// Coerce the current cell to `T`.
    pub fn get_field_value<T: FromDbValue>(&self, ordinal: usize) -> Result<T> {
        T::from_db_value(self.cell(ordinal)?)
    }

    /// Deserialize a JSON text (or UTF-8 bytes) cell into `T`.
    pub fn get_json<T: DeserializeOwned>(&self, ordinal: usize) -> Result<T> {
        match self.cell(ordinal)? {
            DbValue::String(text) => Ok(serde_json::from_str(text)?),
            DbValue::Bytes(bytes) => Ok(serde_json::from_slice(bytes)?),
            other => Err(QueryCacheError::coercion("json", other)),
        }
    }

    pub fn get_boolean(&self, ordinal: usize) -> Result<bool> {
        self.get_field_value(ordinal)
    }

    pub fn get_byte(&self, ordinal: usize) -> Result<u8> {
        self.get_field_value(ordinal)
    }

    pub fn get_int16(&self, ordinal: usize) -> Result<i16> {
        self.get_field_value(ordinal)
    }

    pub fn get_int32(&self, ordinal: usize) -> Result<i32> {
        self.get_field_value(ordinal)
    }

    pub fn get_int64(&self, ordinal: usize) -> Result<i64> {
        self.get_field_value(ordinal)
    }

    pub fn get_float(&self, ordinal: usize) -> Result<f32> {
        self.get_field_value(ordinal)
    }

    pub fn get_double(&self, ordinal: usize) -> Result<f64> {
        self.get_field_value(ordinal)
    }

    pub fn get_decimal(&self, ordinal: usize) -> Result<Decimal> {
        self.get_field_value(ordinal)
    }

    pub fn get_string(&self, ordinal: usize) -> Result<String> {
        self.get_field_value(ordinal)
    }

    pub fn get_char(&self, ordinal: usize) -> Result<char> {
        self.get_field_value(ordinal)
    }

    pub fn get_guid(&self, ordinal: usize) -> Result<Uuid> {
        self.get_field_value(ordinal)
    }

    pub fn get_date_time(&self, ordinal: usize) -> Result<NaiveDateTime> {
        self.get_field_value(ordinal)
    }

    pub fn get_date_time_offset(&self, ordinal: usize) -> Result<DateTime<FixedOffset>> {
        self.get_field_value(ordinal)
    }

    pub fn get_date(&self, ordinal: usize) -> Result<NaiveDate> {
        self.get_field_value(ordinal)
    }

    pub fn get_time(&self, ordinal: usize) -> Result<NaiveTime> {
        self.get_field_value(ordinal)
    }

    /// Copy the current row into `values`; returns how many were written.
    pub fn get_values(&self, values: &mut [DbValue]) -> Result<usize> {
        let count = values.len().min(self.snapshot.field_count);
        for (ordinal, slot) in values.iter_mut().take(count).enumerate() {
            *slot = self.cell(ordinal)?.clone();
        }
        Ok(count)
    }
}

impl From<ResultSnapshot> for SnapshotReader {
    fn from(snapshot: ResultSnapshot) -> Self {
        Self::new(snapshot)
    }
}

impl DataReader for SnapshotReader {
    fn field_count(&self) -> usize {
        self.snapshot.field_count
    }

    fn visible_field_count(&self) -> usize {
        self.snapshot.visible_field_count
    }

    fn name(&self, ordinal: usize) -> Result<&str> {
        Ok(&self.column(ordinal)?.name)
    }

    fn data_type_name(&self, ordinal: usize) -> Result<&str> {
        Ok(&self.column(ordinal)?.declared_type_name)
    }

    fn field_kind(&self, ordinal: usize) -> Result<ValueKind> {
        Ok(self.column(ordinal)?.storage_kind)
    }

    fn read(&mut self) -> Result<bool> {
        if self.closed {
            return Ok(false);
        }
        let next = self.position.map_or(0, |p| p + 1);
        if next < self.snapshot.row_count() {
            self.position = Some(next);
            Ok(true)
        } else {
            self.position = Some(self.snapshot.row_count());
            Ok(false)
        }
    }

    fn get_value(&self, ordinal: usize) -> Result<DbValue> {
        self.cell(ordinal).cloned()
    }

    fn get_bytes(&self, ordinal: usize) -> Result<Vec<u8>> {
        self.get_field_value(ordinal)
    }

    fn is_db_null(&self, ordinal: usize) -> Result<bool> {
        Ok(self.cell(ordinal)?.is_null())
    }

    fn records_affected(&self) -> i64 {
        self.snapshot.records_affected
    }
}
