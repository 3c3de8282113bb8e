//! Declarative table schemas and record validation
//!
//! Every sink table is described by a static `TableSchema`: its DDL, column
//! specs, symbol columns, and designated time column. Normalizers produce
//! `RawRecord`s (string-keyed JSON values straight off the wire); validation
//! coerces them into typed `NormalizedRecord`s or rejects them.
//!
//! Coercion rules per column type:
//! - `Double` accepts JSON numbers and numeric strings
//! - `Long` accepts JSON integers and integer strings
//! - `Symbol` accepts strings and numbers (rendered)
//! - `Timestamp` accepts RFC 3339 strings and raw Unix nanoseconds
//! - `DoubleMatrix` accepts rectangular N×2 arrays of numbers
//!
//! Undeclared keys are rejected; missing required columns are rejected;
//! missing optional columns are simply absent from the output record.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value as Json;
use types::time::parse_rfc3339_nanos;

/// A record as produced by a normalizer, before validation.
pub type RawRecord = BTreeMap<String, Json>;

/// Column types supported by the sink tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Double,
    Long,
    Symbol,
    Timestamp,
    /// Rectangular N×2 matrix (book depth rows).
    DoubleMatrix,
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ColumnType::Double => "DOUBLE",
            ColumnType::Long => "LONG",
            ColumnType::Symbol => "SYMBOL",
            ColumnType::Timestamp => "TIMESTAMP",
            ColumnType::DoubleMatrix => "DOUBLE[][]",
        };
        write!(f, "{}", s)
    }
}

/// A typed value after coercion.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Double(f64),
    Long(i64),
    Str(String),
    /// Unix nanoseconds.
    Timestamp(i64),
    /// Book depth rows, each [price, quantity].
    DoubleMatrix(Vec<[f64; 2]>),
}

impl Value {
    /// Short label for error messages.
    pub fn type_label(&self) -> &'static str {
        match self {
            Value::Double(_) => "double",
            Value::Long(_) => "long",
            Value::Str(_) => "string",
            Value::Timestamp(_) => "timestamp",
            Value::DoubleMatrix(_) => "matrix",
        }
    }

    /// Nanosecond value if this is a timestamp.
    pub fn as_timestamp(&self) -> Option<i64> {
        match self {
            Value::Timestamp(nanos) => Some(*nanos),
            _ => None,
        }
    }
}

/// Errors raised by record and batch validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    #[error("table {table}: missing required column {column}")]
    MissingColumn {
        table: &'static str,
        column: &'static str,
    },

    #[error("table {table}: undeclared column {column}")]
    UndeclaredColumn { table: &'static str, column: String },

    #[error("table {table}: column {column} expects {expected}, got {actual}")]
    TypeMismatch {
        table: &'static str,
        column: &'static str,
        expected: ColumnType,
        actual: String,
    },

    #[error("table {table}: batch failed on column {column}: {reason}")]
    BatchViolation {
        table: &'static str,
        column: &'static str,
        reason: String,
    },
}

/// Specification of a single column.
#[derive(Debug, Clone)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub ty: ColumnType,
    pub required: bool,
}

impl ColumnSpec {
    /// A column that must be present in every record.
    pub fn required(name: &'static str, ty: ColumnType) -> Self {
        Self {
            name,
            ty,
            required: true,
        }
    }

    /// A column that may be absent from a record.
    pub fn optional(name: &'static str, ty: ColumnType) -> Self {
        Self {
            name,
            ty,
            required: false,
        }
    }
}

/// A validated record ready for the sink, keyed by declared column name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedRecord {
    values: BTreeMap<&'static str, Value>,
}

impl NormalizedRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a column value, replacing any previous one.
    pub fn set(&mut self, column: &'static str, value: Value) {
        self.values.insert(column, value);
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values.get(column)
    }

    /// Iterate columns in deterministic (sorted) order.
    pub fn columns(&self) -> impl Iterator<Item = (&'static str, &Value)> {
        self.values.iter().map(|(k, v)| (*k, v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Static descriptor of one sink table.
///
/// Every table carries the shared meta columns: `timestamp` (designated by
/// default) and `product_id` (always a symbol column). Table-specific
/// columns, extra symbol columns, and an alternate time column are layered
/// on via the builder methods.
#[derive(Debug, Clone)]
pub struct TableSchema {
    pub table: &'static str,
    pub ddl: &'static str,
    columns: Vec<ColumnSpec>,
    symbol_columns: Vec<&'static str>,
    time_column: &'static str,
}

impl TableSchema {
    /// Create a schema with the shared meta columns plus `columns`.
    pub fn new(table: &'static str, ddl: &'static str, columns: Vec<ColumnSpec>) -> Self {
        let mut all = vec![
            ColumnSpec::required("timestamp", ColumnType::Timestamp),
            ColumnSpec::required("product_id", ColumnType::Symbol),
        ];
        all.extend(columns);
        Self {
            table,
            ddl,
            columns: all,
            symbol_columns: vec!["product_id"],
            time_column: "timestamp",
        }
    }

    /// Declare additional symbol columns beyond `product_id`.
    pub fn with_symbols(mut self, extra: &[&'static str]) -> Self {
        self.symbol_columns.extend_from_slice(extra);
        self
    }

    /// Use a column other than `timestamp` as the designated time column.
    pub fn with_time_column(mut self, column: &'static str) -> Self {
        self.time_column = column;
        self
    }

    pub fn symbol_columns(&self) -> &[&'static str] {
        &self.symbol_columns
    }

    pub fn time_column(&self) -> &'static str {
        self.time_column
    }

    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Validate and coerce a single record.
    pub fn validate_record(&self, raw: &RawRecord) -> Result<NormalizedRecord, SchemaError> {
        for key in raw.keys() {
            if self.column(key).is_none() {
                return Err(SchemaError::UndeclaredColumn {
                    table: self.table,
                    column: key.clone(),
                });
            }
        }

        let mut record = NormalizedRecord::new();
        for spec in &self.columns {
            match raw.get(spec.name) {
                Some(json) => {
                    let value = coerce(self.table, spec, json)?;
                    record.set(spec.name, value);
                }
                None if spec.required => {
                    return Err(SchemaError::MissingColumn {
                        table: self.table,
                        column: spec.name,
                    });
                }
                None => {}
            }
        }
        Ok(record)
    }

    /// Validate and coerce a batch, column by column.
    ///
    /// The first failing column is reported for the whole batch.
    pub fn validate_batch(&self, raws: &[RawRecord]) -> Result<Vec<NormalizedRecord>, SchemaError> {
        for raw in raws {
            for key in raw.keys() {
                if self.column(key).is_none() {
                    return Err(SchemaError::UndeclaredColumn {
                        table: self.table,
                        column: key.clone(),
                    });
                }
            }
        }

        let mut records = vec![NormalizedRecord::new(); raws.len()];
        for spec in &self.columns {
            for (i, raw) in raws.iter().enumerate() {
                match raw.get(spec.name) {
                    Some(json) => {
                        let value = coerce(self.table, spec, json).map_err(|err| {
                            SchemaError::BatchViolation {
                                table: self.table,
                                column: spec.name,
                                reason: err.to_string(),
                            }
                        })?;
                        records[i].set(spec.name, value);
                    }
                    None if spec.required => {
                        return Err(SchemaError::BatchViolation {
                            table: self.table,
                            column: spec.name,
                            reason: format!("missing in record {}", i),
                        });
                    }
                    None => {}
                }
            }
        }
        Ok(records)
    }
}

/// Coerce one JSON value to the column's declared type.
fn coerce(table: &'static str, spec: &ColumnSpec, json: &Json) -> Result<Value, SchemaError> {
    let mismatch = || SchemaError::TypeMismatch {
        table,
        column: spec.name,
        expected: spec.ty,
        actual: short_repr(json),
    };

    match spec.ty {
        ColumnType::Double => json_to_f64(json).map(Value::Double).ok_or_else(mismatch),
        ColumnType::Long => json_to_i64(json).map(Value::Long).ok_or_else(mismatch),
        ColumnType::Symbol => match json {
            Json::String(s) => Ok(Value::Str(s.clone())),
            Json::Number(n) => Ok(Value::Str(n.to_string())),
            _ => Err(mismatch()),
        },
        ColumnType::Timestamp => match json {
            Json::String(s) => parse_rfc3339_nanos(s)
                .map(Value::Timestamp)
                .map_err(|_| mismatch()),
            other => other.as_i64().map(Value::Timestamp).ok_or_else(mismatch),
        },
        ColumnType::DoubleMatrix => {
            let rows = json.as_array().ok_or_else(mismatch)?;
            let mut matrix = Vec::with_capacity(rows.len());
            for row in rows {
                let pair = row.as_array().ok_or_else(mismatch)?;
                if pair.len() != 2 {
                    return Err(mismatch());
                }
                let price = json_to_f64(&pair[0]).ok_or_else(mismatch)?;
                let quantity = json_to_f64(&pair[1]).ok_or_else(mismatch)?;
                matrix.push([price, quantity]);
            }
            Ok(Value::DoubleMatrix(matrix))
        }
    }
}

/// JSON number or numeric string to f64.
pub fn json_to_f64(json: &Json) -> Option<f64> {
    match json {
        Json::Number(n) => n.as_f64(),
        Json::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// JSON integer or integer string to i64.
pub fn json_to_i64(json: &Json) -> Option<i64> {
    match json {
        Json::Number(n) => n.as_i64(),
        Json::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Truncated rendering of a JSON value for error messages.
fn short_repr(json: &Json) -> String {
    let mut s = json.to_string();
    if s.len() > 48 {
        let mut cut = 48;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
        s.push('…');
    }
    s
}
