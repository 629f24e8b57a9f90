use snafu::prelude::*;

/// Errors raised while ingesting the metadata description.
///
/// All of them are fatal: the conversion stops before anything is written.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SchemaError {
    /// The document is not well-formed XML, or the stream failed.
    #[snafu(display("Malformed metadata XML near byte {position}: {source}"))]
    Xml {
        /// Byte offset reported by the reader.
        position: u64,
        /// Underlying parser error.
        source: quick_xml::Error,
    },

    /// The stream ended without a root element.
    #[snafu(display("Metadata document has no root element"))]
    MissingRoot,

    /// The root element declares no namespace.
    #[snafu(display("Metadata root element <{root}> declares no namespace"))]
    MissingNamespace {
        /// Local name of the root element.
        root: String,
    },

    /// An integer-typed field holds text that is not an integer.
    #[snafu(display("Record {record} of table '{table}': field '{column}' value '{value}' is not an integer"))]
    MalformedField {
        /// Table name.
        table: String,
        /// Field name.
        column: String,
        /// Offending text.
        value: String,
        /// One-based record number within the table.
        record: usize,
    },

    /// Two records of a table share a primary key value.
    #[snafu(display("Table '{table}' has duplicate primary key {column} = {value}"))]
    DuplicatePrimaryKey {
        /// Table name.
        table: String,
        /// Primary key column.
        column: String,
        /// Duplicated value.
        value: i64,
    },

    /// A record of a table with a primary key has no value for it.
    #[snafu(display("Record {record} of table '{table}' has no '{column}' value"))]
    MissingPrimaryKey {
        /// Table name.
        table: String,
        /// Primary key column.
        column: String,
        /// One-based record number within the table.
        record: usize,
    },

    /// The primary-key-named column first appeared after the table was created.
    #[snafu(display("Table '{table}' gained primary key column '{column}' after its first record"))]
    LatePrimaryKey {
        /// Table name.
        table: String,
        /// Primary key column.
        column: String,
    },
}

/// Result alias for schema ingestion.
pub type SchemaResult<T> = Result<T, SchemaError>;
