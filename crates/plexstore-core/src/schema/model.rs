//! Relational model produced by schema ingestion.
//!
//! Tables are immutable once materialized. Rows keep the width they had when
//! inserted; columns added later read as [`Value::Null`] for those rows.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use snafu::prelude::*;

use super::views::ModelViews;

/// Errors raised when downstream builders read the model.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ModelError {
    /// A table required by a builder is absent from the metadata.
    #[snafu(display("Metadata has no '{table}' table"))]
    MissingTable {
        /// Table name.
        table: String,
    },

    /// A required value is null or the column is absent.
    #[snafu(display("Row {row} of table '{table}' has no value for '{column}'"))]
    MissingValue {
        /// Table name.
        table: String,
        /// Column name.
        column: String,
        /// Zero-based row number.
        row: usize,
    },

    /// A value exists but has the wrong type for the caller.
    #[snafu(display("Row {row} of table '{table}': '{column}' value {value} is not {expected}"))]
    WrongType {
        /// Table name.
        table: String,
        /// Column name.
        column: String,
        /// Zero-based row number.
        row: usize,
        /// Offending value, rendered.
        value: String,
        /// Expected kind of value.
        expected: &'static str,
    },
}

/// Result alias for model access.
pub type ModelResult<T> = Result<T, ModelError>;

/// A single cell.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Value {
    /// Absent or empty.
    #[default]
    Null,
    /// Value of an integer-typed (`*_id`) column.
    Integer(i64),
    /// Value of a text column.
    Text(String),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Integer(v) => write!(f, "{v}"),
            Value::Text(s) => write!(f, "'{s}'"),
        }
    }
}

/// Inferred column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    /// `*_id` columns.
    Integer,
    /// Everything else.
    Text,
}

/// Final column definition with its constraints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    /// Column name.
    pub name: String,
    /// Inferred type.
    pub ty: ColumnType,
    /// Whether this column is the table's primary key.
    pub primary_key: bool,
    /// Table referenced by a declared foreign key on this column.
    pub references: Option<String>,
}

/// An immutable table with its primary-key and secondary indices.
#[derive(Debug, Clone)]
pub struct Table {
    pub(crate) name: String,
    pub(crate) columns: Vec<Column>,
    pub(crate) column_index: HashMap<String, usize>,
    pub(crate) rows: Vec<Vec<Value>>,
    pub(crate) primary: Option<HashMap<i64, usize>>,
    pub(crate) indices: HashMap<String, HashMap<i64, Vec<usize>>>,
}

impl Table {
    /// Table name (record group name without the `t_` prefix).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Column definitions in discovery order.
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Look up a column definition.
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.column_index.get(name).map(|&i| &self.columns[i])
    }

    /// Whether the column exists.
    pub fn has_column(&self, name: &str) -> bool {
        self.column_index.contains_key(name)
    }

    /// The primary key column, if one was inferred.
    pub fn primary_key(&self) -> Option<&Column> {
        self.columns.iter().find(|c| c.primary_key)
    }

    /// Declared foreign keys as (column, referenced table) pairs.
    pub fn foreign_keys(&self) -> impl Iterator<Item = (&str, &str)> {
        self.columns
            .iter()
            .filter_map(|c| c.references.as_deref().map(|t| (c.name.as_str(), t)))
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the table has no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows in insertion order.
    pub fn rows(&self) -> impl Iterator<Item = RowRef<'_>> {
        (0..self.rows.len()).map(move |idx| RowRef { table: self, idx })
    }

    /// Row by position.
    pub fn row(&self, idx: usize) -> Option<RowRef<'_>> {
        (idx < self.rows.len()).then_some(RowRef { table: self, idx })
    }

    /// Row by primary key value.
    pub fn by_primary_key(&self, id: i64) -> Option<RowRef<'_>> {
        let idx = *self.primary.as_ref()?.get(&id)?;
        Some(RowRef { table: self, idx })
    }

    /// Whether a secondary index exists on `column`.
    pub fn is_indexed(&self, column: &str) -> bool {
        self.indices.contains_key(column)
    }

    /// Rows whose integer `column` equals `value`, in insertion order.
    ///
    /// Uses the secondary index when one exists, otherwise scans.
    pub fn rows_where(&self, column: &str, value: i64) -> Vec<RowRef<'_>> {
        if let Some(index) = self.indices.get(column) {
            return index
                .get(&value)
                .map(|rows| {
                    rows.iter()
                        .map(|&idx| RowRef { table: self, idx })
                        .collect()
                })
                .unwrap_or_default();
        }
        self.rows()
            .filter(|row| row.int(column) == Some(value))
            .collect()
    }

    pub(crate) fn build_index(&mut self, column: &str) {
        let Some(&col) = self.column_index.get(column) else {
            return;
        };
        let mut index: HashMap<i64, Vec<usize>> = HashMap::new();
        for (idx, row) in self.rows.iter().enumerate() {
            if let Some(Value::Integer(v)) = row.get(col) {
                index.entry(*v).or_default().push(idx);
            }
        }
        self.indices.insert(column.to_string(), index);
    }
}

/// Borrowed view of one row.
#[derive(Debug, Clone, Copy)]
pub struct RowRef<'a> {
    table: &'a Table,
    idx: usize,
}

impl<'a> RowRef<'a> {
    /// Zero-based row position.
    pub fn index(&self) -> usize {
        self.idx
    }

    /// Cell value; [`Value::Null`] for unknown columns and for columns added
    /// after this row was stored.
    pub fn value(&self, column: &str) -> &'a Value {
        static NULL: Value = Value::Null;
        self.table
            .column_index
            .get(column)
            .and_then(|&col| self.table.rows[self.idx].get(col))
            .unwrap_or(&NULL)
    }

    /// Integer value, if present and integer-typed.
    pub fn int(&self, column: &str) -> Option<i64> {
        match self.value(column) {
            Value::Integer(v) => Some(*v),
            _ => None,
        }
    }

    /// Text value, if present and text-typed.
    pub fn text(&self, column: &str) -> Option<&'a str> {
        match self.value(column) {
            Value::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Integer value or a [`ModelError`] naming the row.
    pub fn require_int(&self, column: &str) -> ModelResult<i64> {
        match self.value(column) {
            Value::Integer(v) => Ok(*v),
            Value::Null => self.missing(column),
            other => WrongTypeSnafu {
                table: self.table.name.clone(),
                column,
                row: self.idx,
                value: other.to_string(),
                expected: "an integer",
            }
            .fail(),
        }
    }

    /// Text value or a [`ModelError`] naming the row.
    pub fn require_text(&self, column: &str) -> ModelResult<&'a str> {
        match self.value(column) {
            Value::Text(s) => Ok(s.as_str()),
            Value::Null => self.missing(column),
            other => WrongTypeSnafu {
                table: self.table.name.clone(),
                column,
                row: self.idx,
                value: other.to_string(),
                expected: "text",
            }
            .fail(),
        }
    }

    /// Integer parsed from a text column (for example `key_index.length`).
    pub fn require_int_text(&self, column: &str) -> ModelResult<i64> {
        match self.value(column) {
            Value::Integer(v) => Ok(*v),
            Value::Text(s) => s.trim().parse::<i64>().map_err(|_| ModelError::WrongType {
                table: self.table.name.clone(),
                column: column.to_string(),
                row: self.idx,
                value: format!("'{s}'"),
                expected: "an integer",
            }),
            Value::Null => self.missing(column),
        }
    }

    fn missing<T>(&self, column: &str) -> ModelResult<T> {
        MissingValueSnafu {
            table: self.table.name.clone(),
            column,
            row: self.idx,
        }
        .fail()
    }
}

/// Facts about the document itself rather than its records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelMeta {
    /// Default namespace declared on the root element.
    pub namespace: String,
    /// Local name of the root element.
    pub root_element: String,
    /// Number of records ingested.
    pub record_count: u64,
}

/// The complete relational model of one metadata description.
#[derive(Debug, Clone)]
pub struct RelationalModel {
    pub(crate) meta: ModelMeta,
    pub(crate) tables: BTreeMap<String, Table>,
    pub(crate) views: ModelViews,
}

impl RelationalModel {
    /// Document-level facts.
    pub fn meta(&self) -> &ModelMeta {
        &self.meta
    }

    /// Look up a table.
    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.get(name)
    }

    /// Look up a table that a builder cannot work without.
    pub fn require_table(&self, name: &str) -> ModelResult<&Table> {
        self.tables
            .get(name)
            .context(MissingTableSnafu { table: name })
    }

    /// Fail on the first absent table of `names`.
    pub fn require_tables(&self, names: &[&str]) -> ModelResult<()> {
        for name in names {
            self.require_table(name)?;
        }
        Ok(())
    }

    /// Table names in sorted order.
    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    /// Flattened object and membership lookups.
    pub fn views(&self) -> &ModelViews {
        &self.views
    }
}
