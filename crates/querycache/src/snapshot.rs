use querycache_core::{DbValue, QueryCacheError, Result, ValueKind};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

/// Declared type names whose values are read as raw bytes rather than through `get_value`.
const BINARY_GEOMETRY_TYPES: [&str; 2] = ["geography", "geometry"];

/// Forward-only cursor over a tabular result.
///
/// Live driver cursors implement this so they can be captured; [`SnapshotReader`]
/// implements it so a cached result can be handed back in their place.
///
/// [`SnapshotReader`]: crate::reader::SnapshotReader
pub trait DataReader {
    fn field_count(&self) -> usize;

    fn visible_field_count(&self) -> usize {
        self.field_count()
    }

    fn name(&self, ordinal: usize) -> Result<&str>;

    /// Type name the data source declares for the column, e.g. `nvarchar`.
    fn data_type_name(&self, ordinal: usize) -> Result<&str>;

    /// Storage kind of the values in the column.
    fn field_kind(&self, ordinal: usize) -> Result<ValueKind>;

    /// Advance to the next row; false once the cursor is exhausted.
    fn read(&mut self) -> Result<bool>;

    fn get_value(&self, ordinal: usize) -> Result<DbValue>;

    fn get_bytes(&self, ordinal: usize) -> Result<Vec<u8>> {
        match self.get_value(ordinal)? {
            DbValue::Bytes(bytes) => Ok(bytes),
            other => Err(QueryCacheError::coercion("bytes", &other)),
        }
    }

    fn is_db_null(&self, ordinal: usize) -> Result<bool> {
        Ok(self.get_value(ordinal)?.is_null())
    }

    /// Rows changed by the command, -1 for plain selects.
    fn records_affected(&self) -> i64 {
        -1
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub ordinal: usize,
    pub name: String,
    pub declared_type_name: String,
    pub storage_kind: ValueKind,
}

impl ColumnInfo {
    pub fn storage_type_name(&self) -> &'static str {
        self.storage_kind.name()
    }

    pub fn is_binary_geometry(&self) -> bool {
        is_binary_geometry(&self.declared_type_name)
    }
}

fn is_binary_geometry(declared_type_name: &str) -> bool {
    BINARY_GEOMETRY_TYPES
        .iter()
        .any(|t| t.eq_ignore_ascii_case(declared_type_name.trim()))
}

/// Serializable capture of a tabular result, replayable as a cursor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultSnapshot {
    pub columns: Vec<ColumnInfo>,
    pub rows: Vec<Vec<DbValue>>,
    pub field_count: usize,
    pub visible_field_count: usize,
    pub records_affected: i64,
    /// Fresh per snapshot; a stable handle for backends that need one.
    pub identity_tag: Uuid,
}

impl ResultSnapshot {
    /// Assemble a snapshot from already materialized rows.
    pub fn new(columns: Vec<ColumnInfo>, rows: Vec<Vec<DbValue>>) -> Result<Self> {
        let field_count = columns.len();
        let snapshot = Self {
            columns,
            rows,
            field_count,
            visible_field_count: field_count,
            records_affected: -1,
            identity_tag: Uuid::new_v4(),
        };
        snapshot.validate()?;
        Ok(snapshot)
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Every row must be exactly `field_count` wide.
    pub fn validate(&self) -> Result<()> {
        if self.columns.len() != self.field_count {
            return Err(QueryCacheError::InvalidOperation(format!(
                "snapshot declares {} fields but has {} columns",
                self.field_count,
                self.columns.len()
            )));
        }
        if let Some((index, row)) = self
            .rows
            .iter()
            .enumerate()
            .find(|(_, row)| row.len() != self.field_count)
        {
            return Err(QueryCacheError::InvalidOperation(format!(
                "row {} has {} values, expected {}",
                index,
                row.len(),
                self.field_count
            )));
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let snapshot: Self = serde_json::from_slice(bytes)?;
        snapshot.validate()?;
        Ok(snapshot)
    }
}

/// Drain `reader` into a snapshot. The cursor is read exactly once, to the end.
pub fn capture<R: DataReader + ?Sized>(reader: &mut R) -> Result<ResultSnapshot> {
    let field_count = reader.field_count();
    let mut columns = Vec::with_capacity(field_count);

    for ordinal in 0..field_count {
        let declared_type_name = reader.data_type_name(ordinal)?.to_string();
        let storage_kind = if is_binary_geometry(&declared_type_name) {
            ValueKind::Bytes
        } else {
            reader.field_kind(ordinal)?
        };
        columns.push(ColumnInfo {
            ordinal,
            name: reader.name(ordinal)?.to_string(),
            declared_type_name,
            storage_kind,
        });
    }

    let mut rows = Vec::new();
    while reader.read()? {
        let mut row = Vec::with_capacity(field_count);
        for column in &columns {
            let value = if column.is_binary_geometry() {
                read_geometry(reader, column.ordinal)?
            } else if reader.is_db_null(column.ordinal)? {
                DbValue::Null
            } else {
                reader.get_value(column.ordinal)?
            };
            row.push(value);
        }
        rows.push(row);
    }

    debug!("Captured {} rows x {} fields", rows.len(), field_count);

    Ok(ResultSnapshot {
        columns,
        rows,
        field_count,
        visible_field_count: reader.visible_field_count(),
        records_affected: reader.records_affected(),
        identity_tag: Uuid::new_v4(),
    })
}

/// Geometry is read as a byte stream first; only a failed read consults
/// `is_db_null`, which stream-only drivers may not answer.
fn read_geometry<R: DataReader + ?Sized>(reader: &R, ordinal: usize) -> Result<DbValue> {
    match reader.get_bytes(ordinal) {
        Ok(bytes) => Ok(DbValue::Bytes(bytes)),
        Err(e) => match reader.is_db_null(ordinal) {
            Ok(true) => Ok(DbValue::Null),
            _ => Err(e),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Live cursor stand-in that streams geometry only through `get_bytes`.
    struct TableReader {
        columns: Vec<(&'static str, &'static str, ValueKind)>,
        rows: Vec<Vec<DbValue>>,
        position: Option<usize>,
        reads: usize,
    }

    impl TableReader {
        fn current(&self) -> Result<&Vec<DbValue>> {
            self.position
                .and_then(|p| self.rows.get(p))
                .ok_or_else(|| QueryCacheError::InvalidOperation("no current row".into()))
        }
    }

    impl DataReader for TableReader {
        fn field_count(&self) -> usize {
            self.columns.len()
        }

        fn name(&self, ordinal: usize) -> Result<&str> {
            Ok(self.columns[ordinal].0)
        }

        fn data_type_name(&self, ordinal: usize) -> Result<&str> {
            Ok(self.columns[ordinal].1)
        }

        fn field_kind(&self, ordinal: usize) -> Result<ValueKind> {
            Ok(self.columns[ordinal].2)
        }

        fn read(&mut self) -> Result<bool> {
            self.reads += 1;
            let next = self.position.map_or(0, |p| p + 1);
            self.position = Some(next);
            Ok(next < self.rows.len())
        }

        fn get_value(&self, ordinal: usize) -> Result<DbValue> {
            if self.columns[ordinal].1 == "geography" {
                return Err(QueryCacheError::Driver("geography needs a stream".into()));
            }
            Ok(self.current()?[ordinal].clone())
        }

        fn get_bytes(&self, ordinal: usize) -> Result<Vec<u8>> {
            match &self.current()?[ordinal] {
                DbValue::Bytes(b) => Ok(b.clone()),
                other => Err(QueryCacheError::coercion("bytes", other)),
            }
        }

        fn is_db_null(&self, ordinal: usize) -> Result<bool> {
            Ok(self.current()?[ordinal].is_null())
        }
    }

    /// Same cursor without its own `is_db_null`, so null checks go through `get_value`.
    struct StreamOnlyReader(TableReader);

    impl DataReader for StreamOnlyReader {
        fn field_count(&self) -> usize {
            self.0.field_count()
        }

        fn name(&self, ordinal: usize) -> Result<&str> {
            self.0.name(ordinal)
        }

        fn data_type_name(&self, ordinal: usize) -> Result<&str> {
            self.0.data_type_name(ordinal)
        }

        fn field_kind(&self, ordinal: usize) -> Result<ValueKind> {
            self.0.field_kind(ordinal)
        }

        fn read(&mut self) -> Result<bool> {
            self.0.read()
        }

        fn get_value(&self, ordinal: usize) -> Result<DbValue> {
            self.0.get_value(ordinal)
        }

        fn get_bytes(&self, ordinal: usize) -> Result<Vec<u8>> {
            self.0.get_bytes(ordinal)
        }
    }

    fn reader(rows: Vec<Vec<DbValue>>) -> TableReader {
        TableReader {
            columns: vec![
                ("Id", "int", ValueKind::Int32),
                ("Name", "nvarchar", ValueKind::String),
                ("Location", "geography", ValueKind::Object),
            ],
            rows,
            position: None,
            reads: 0,
        }
    }

    #[test]
    fn test_capture_reads_geometry_as_bytes() {
        let mut live = reader(vec![
            vec![DbValue::Int32(1), "Oslo".into(), DbValue::Bytes(vec![0xE6, 0x10])],
            vec![DbValue::Int32(2), DbValue::Null, DbValue::Null],
        ]);
        let snapshot = capture(&mut live).unwrap();

        assert_eq!(snapshot.row_count(), 2);
        assert_eq!(snapshot.field_count, 3);
        assert_eq!(snapshot.columns[2].storage_kind, ValueKind::Bytes);
        assert_eq!(snapshot.columns[1].storage_type_name(), "String");
        assert_eq!(snapshot.rows[0][2], DbValue::Bytes(vec![0xE6, 0x10]));
        assert_eq!(snapshot.rows[1][1], DbValue::Null);
        assert_eq!(live.reads, 3);
    }

    #[test]
    fn test_capture_geometry_without_null_check_support() {
        let mut live = StreamOnlyReader(reader(vec![
            vec![DbValue::Int32(1), "Oslo".into(), DbValue::Bytes(vec![0xE6, 0x10])],
            vec![DbValue::Int32(2), DbValue::Null, DbValue::Bytes(vec![0x01])],
        ]));
        let snapshot = capture(&mut live).unwrap();

        assert_eq!(snapshot.rows[0][2], DbValue::Bytes(vec![0xE6, 0x10]));
        assert_eq!(snapshot.rows[1][1], DbValue::Null);
        assert_eq!(snapshot.rows[1][2], DbValue::Bytes(vec![0x01]));
    }

    #[test]
    fn test_capture_empty_result() {
        let snapshot = capture(&mut reader(Vec::new())).unwrap();
        assert_eq!(snapshot.row_count(), 0);
        assert_eq!(snapshot.columns.len(), 3);
    }

    #[test]
    fn test_identity_tag_is_fresh() {
        let a = capture(&mut reader(Vec::new())).unwrap();
        let b = capture(&mut reader(Vec::new())).unwrap();
        assert_ne!(a.identity_tag, b.identity_tag);
    }

    #[test]
    fn test_bytes_round_trip_keeps_nulls() {
        let snapshot = capture(&mut reader(vec![vec![
            DbValue::Int32(7),
            DbValue::Null,
            DbValue::Bytes(vec![1]),
        ]]))
        .unwrap();
        let restored = ResultSnapshot::from_bytes(&snapshot.to_bytes().unwrap()).unwrap();
        assert_eq!(restored, snapshot);
    }

    #[test]
    fn test_bytes_round_trip_keeps_non_finite() {
        let columns = vec![ColumnInfo {
            ordinal: 0,
            name: "Reading".into(),
            declared_type_name: "float".into(),
            storage_kind: ValueKind::Double,
        }];
        let snapshot = ResultSnapshot::new(
            columns,
            vec![
                vec![DbValue::Double(f64::INFINITY)],
                vec![DbValue::Double(f64::NEG_INFINITY)],
                vec![DbValue::Double(f64::NAN)],
                vec![DbValue::Single(f32::NAN)],
            ],
        )
        .unwrap();

        let restored = ResultSnapshot::from_bytes(&snapshot.to_bytes().unwrap()).unwrap();
        assert_eq!(restored.rows[0][0], DbValue::Double(f64::INFINITY));
        assert_eq!(restored.rows[1][0], DbValue::Double(f64::NEG_INFINITY));
        assert!(matches!(restored.rows[2][0], DbValue::Double(v) if v.is_nan()));
        assert!(matches!(restored.rows[3][0], DbValue::Single(v) if v.is_nan()));
    }

    #[test]
    fn test_ragged_rows_are_rejected() {
        let columns = vec![ColumnInfo {
            ordinal: 0,
            name: "Id".into(),
            declared_type_name: "int".into(),
            storage_kind: ValueKind::Int32,
        }];
        let err = ResultSnapshot::new(columns, vec![vec![DbValue::Int32(1), DbValue::Int32(2)]]).unwrap_err();
        assert!(matches!(err, QueryCacheError::InvalidOperation(_)));
    }
}
