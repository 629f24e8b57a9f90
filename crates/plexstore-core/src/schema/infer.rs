//! Streaming record reader and the inference graph it feeds.
//!
//! The graph only accumulates: tables, columns, primary-key positions,
//! foreign-key candidates and rows. Constraints are decided once, in
//! [`InferenceGraph::materialize`], after the whole document has been read.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::BufRead;

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use snafu::prelude::*;
use tracing::debug;

use super::error::{
    DuplicatePrimaryKeySnafu, LatePrimaryKeySnafu, MalformedFieldSnafu, MissingNamespaceSnafu,
    MissingPrimaryKeySnafu, MissingRootSnafu, SchemaResult, XmlSnafu,
};
use super::model::{Column, ColumnType, ModelMeta, Table, Value};

/// Local-name prefix marking a record element.
pub const RECORD_PREFIX: &str = "t_";

/// Suffix of integer-typed identifier fields.
pub const ID_SUFFIX: &str = "_id";

/// Tables whose `<table>_id` field is not unique and therefore not a key.
pub const PK_EXCEPTIONS: &[&str] = &["band"];

/// Whether `column` is the primary key of `table` by naming convention.
pub(crate) fn is_primary_key_name(table: &str, column: &str) -> bool {
    !PK_EXCEPTIONS.contains(&table)
        && column.strip_suffix(ID_SUFFIX) == Some(table)
}

fn column_type(column: &str) -> ColumnType {
    if column.ends_with(ID_SUFFIX) {
        ColumnType::Integer
    } else {
        ColumnType::Text
    }
}

/// Drop characters that XML 1.0 does not allow in text.
fn strip_invalid_chars(text: &str) -> String {
    text.chars().filter(|c| is_xml_char(*c)).collect()
}

/// XML 1.0 `Char` production. Surrogates cannot occur in a `char`.
fn is_xml_char(c: char) -> bool {
    matches!(c, '\t' | '\n' | '\r' | '\u{20}'..='\u{FFFD}' | '\u{10000}'..)
}

#[derive(Debug)]
struct TableDraft {
    name: String,
    columns: Vec<(String, ColumnType)>,
    column_index: HashMap<String, usize>,
    primary: Option<usize>,
    primary_values: HashMap<i64, usize>,
    rows: Vec<Vec<Value>>,
}

impl TableDraft {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            columns: Vec::new(),
            column_index: HashMap::new(),
            primary: None,
            primary_values: HashMap::new(),
            rows: Vec::new(),
        }
    }

    fn add_column(&mut self, column: &str) -> usize {
        let idx = self.columns.len();
        self.columns.push((column.to_string(), column_type(column)));
        self.column_index.insert(column.to_string(), idx);
        idx
    }

    fn parse_value(&self, col: usize, text: Option<String>) -> SchemaResult<Value> {
        let (column, ty) = &self.columns[col];
        let Some(text) = text.map(|t| strip_invalid_chars(&t)).filter(|t| !t.is_empty()) else {
            return Ok(Value::Null);
        };
        match ty {
            ColumnType::Text => Ok(Value::Text(text)),
            ColumnType::Integer => match text.trim().parse::<i64>() {
                Ok(v) => Ok(Value::Integer(v)),
                Err(_) => MalformedFieldSnafu {
                    table: self.name.clone(),
                    column: column.clone(),
                    value: text,
                    record: self.rows.len() + 1,
                }
                .fail(),
            },
        }
    }
}

/// A foreign key implied by an `_id` field, pending a check that its target
/// table exists.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ForeignKeyCandidate {
    table: String,
    column: String,
    target: String,
}

/// Accumulated, unconstrained view of the document.
#[derive(Debug, Default)]
pub(crate) struct InferenceGraph {
    tables: Vec<TableDraft>,
    by_name: HashMap<String, usize>,
    candidates: Vec<ForeignKeyCandidate>,
    meta: ModelMeta,
}

impl InferenceGraph {
    /// Record the root element and its default namespace.
    fn open_root(&mut self, root: &BytesStart<'_>) -> SchemaResult<()> {
        let name = String::from_utf8_lossy(root.local_name().as_ref()).into_owned();
        let mut namespace = None;
        for attr in root.attributes() {
            let attr = attr
                .map_err(quick_xml::Error::from)
                .context(XmlSnafu { position: 0u64 })?;
            if attr.key.as_ref() == b"xmlns" {
                let value = attr.unescape_value().context(XmlSnafu { position: 0u64 })?;
                namespace = Some(value.into_owned());
            }
        }
        let namespace = namespace.context(MissingNamespaceSnafu { root: name.clone() })?;
        debug!(root = %name, %namespace, "metadata root element");
        self.meta.root_element = name;
        self.meta.namespace = namespace;
        Ok(())
    }

    /// Add one record to `table`, creating the table or columns on first sight.
    pub(crate) fn add_record(
        &mut self,
        table: &str,
        fields: Vec<(String, Option<String>)>,
    ) -> SchemaResult<()> {
        let idx = match self.by_name.get(table) {
            Some(&idx) => idx,
            None => {
                self.tables.push(TableDraft::new(table));
                self.by_name.insert(table.to_string(), self.tables.len() - 1);
                self.tables.len() - 1
            }
        };
        let draft = &mut self.tables[idx];
        let first_record = draft.rows.is_empty();

        for (column, _) in &fields {
            if draft.column_index.contains_key(column) {
                continue;
            }
            let primary = is_primary_key_name(table, column);
            if primary && !first_record {
                return LatePrimaryKeySnafu { table, column }.fail();
            }
            let col = draft.add_column(column);
            if primary {
                draft.primary = Some(col);
            } else if let Some(target) = column.strip_suffix(ID_SUFFIX) {
                if target != table {
                    self.candidates.push(ForeignKeyCandidate {
                        table: table.to_string(),
                        column: column.clone(),
                        target: target.to_string(),
                    });
                }
            }
        }

        let mut row = vec![Value::Null; draft.columns.len()];
        for (column, text) in fields {
            let col = draft.column_index[&column];
            row[col] = draft.parse_value(col, text)?;
        }

        if let Some(pk) = draft.primary {
            let column = &draft.columns[pk].0;
            match row[pk] {
                Value::Integer(value) => {
                    if draft.primary_values.insert(value, draft.rows.len()).is_some() {
                        return DuplicatePrimaryKeySnafu {
                            table,
                            column: column.clone(),
                            value,
                        }
                        .fail();
                    }
                }
                _ => {
                    return MissingPrimaryKeySnafu {
                        table,
                        column: column.clone(),
                        record: draft.rows.len() + 1,
                    }
                    .fail();
                }
            }
        }

        draft.rows.push(row);
        self.meta.record_count += 1;
        Ok(())
    }

    /// Emit the final typed tables with every constraint known.
    pub(crate) fn materialize(self) -> (ModelMeta, BTreeMap<String, Table>) {
        let declared: HashSet<(String, String)> = self
            .candidates
            .iter()
            .filter(|c| self.by_name.contains_key(&c.target))
            .map(|c| (c.table.clone(), c.column.clone()))
            .collect();

        let mut tables = BTreeMap::new();
        for draft in self.tables {
            let columns = draft
                .columns
                .into_iter()
                .enumerate()
                .map(|(i, (name, ty))| {
                    let references = declared
                        .contains(&(draft.name.clone(), name.clone()))
                        .then(|| name.trim_end_matches(ID_SUFFIX).to_string());
                    Column {
                        primary_key: draft.primary == Some(i),
                        name,
                        ty,
                        references,
                    }
                })
                .collect();
            let table = Table {
                name: draft.name.clone(),
                columns,
                column_index: draft.column_index,
                rows: draft.rows,
                primary: draft.primary.map(|_| draft.primary_values),
                indices: HashMap::new(),
            };
            tables.insert(draft.name, table);
        }
        (self.meta, tables)
    }
}

struct RecordInProgress {
    table: String,
    fields: Vec<(String, Option<String>)>,
}

struct FieldInProgress {
    name: String,
    text: Option<String>,
}

impl FieldInProgress {
    fn push(&mut self, text: &str) {
        self.text.get_or_insert_with(String::new).push_str(text);
    }
}

fn local_name(element: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(element.local_name().as_ref()).into_owned()
}

/// Stream `source` once, feeding every record into `graph`.
///
/// Depth 1 is the root, depth 2 a record, depth 3 a field. Deeper content and
/// non-record root children are ignored.
pub(crate) fn read_records<R: BufRead>(source: R, graph: &mut InferenceGraph) -> SchemaResult<()> {
    let mut reader = Reader::from_reader(source);
    let mut buf = Vec::new();
    let mut depth = 0usize;
    let mut seen_root = false;
    let mut record: Option<RecordInProgress> = None;
    let mut field: Option<FieldInProgress> = None;

    loop {
        let event = reader.read_event_into(&mut buf).context(XmlSnafu {
            position: reader.buffer_position(),
        })?;
        match event {
            Event::Start(e) => {
                depth += 1;
                match depth {
                    1 => {
                        graph.open_root(&e)?;
                        seen_root = true;
                    }
                    2 => {
                        record = local_name(&e)
                            .strip_prefix(RECORD_PREFIX)
                            .map(|table| RecordInProgress {
                                table: table.to_string(),
                                fields: Vec::new(),
                            });
                    }
                    3 if record.is_some() => {
                        field = Some(FieldInProgress {
                            name: local_name(&e),
                            text: None,
                        });
                    }
                    _ => {}
                }
            }
            Event::Empty(e) => match depth + 1 {
                1 => {
                    graph.open_root(&e)?;
                    seen_root = true;
                }
                2 => {
                    if let Some(table) = local_name(&e).strip_prefix(RECORD_PREFIX) {
                        graph.add_record(table, Vec::new())?;
                    }
                }
                3 => {
                    if let Some(record) = record.as_mut() {
                        record.fields.push((local_name(&e), None));
                    }
                }
                _ => {}
            },
            Event::Text(t) => {
                if let Some(field) = field.as_mut().filter(|_| depth == 3) {
                    let text = t.unescape().context(XmlSnafu {
                        position: reader.buffer_position(),
                    })?;
                    field.push(&text);
                }
            }
            Event::CData(c) => {
                if let Some(field) = field.as_mut().filter(|_| depth == 3) {
                    field.push(&String::from_utf8_lossy(&c));
                }
            }
            Event::End(_) => {
                match depth {
                    3 => {
                        if let (Some(record), Some(done)) = (record.as_mut(), field.take()) {
                            record.fields.push((done.name, done.text));
                        }
                    }
                    2 => {
                        if let Some(done) = record.take() {
                            graph.add_record(&done.table, done.fields)?;
                        }
                    }
                    _ => {}
                }
                depth = depth.saturating_sub(1);
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    ensure!(seen_root, MissingRootSnafu);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn graph_from(xml: &str) -> SchemaResult<InferenceGraph> {
        let mut graph = InferenceGraph::default();
        read_records(xml.as_bytes(), &mut graph)?;
        Ok(graph)
    }

    #[test]
    fn strips_control_characters() {
        assert_eq!(strip_invalid_chars("a\u{8}b\tc"), "ab\tc");
        assert_eq!(strip_invalid_chars("\u{0}x\u{1F}\r\n"), "x\r\n");
    }

    #[test]
    fn keeps_c1_and_delete_characters() {
        let text = "MW\u{7F}\u{80}\u{85}\u{9F}h";
        assert_eq!(strip_invalid_chars(text), text);
        assert_eq!(strip_invalid_chars("a\u{FFFE}b\u{FFFF}c\u{10FFFF}"), "abc\u{10FFFF}");
    }

    #[test]
    fn primary_key_naming_honours_exceptions() {
        assert!(is_primary_key_name("object", "object_id"));
        assert!(!is_primary_key_name("object", "class_id"));
        assert!(!is_primary_key_name("band", "band_id"));
    }

    #[test]
    fn empty_record_elements_are_counted() -> TestResult {
        let graph = graph_from(r#"<Root xmlns="urn:x"><t_note/><t_note><text>hi</text></t_note></Root>"#)?;
        let (meta, tables) = graph.materialize();
        assert_eq!(meta.record_count, 2);
        assert_eq!(tables["note"].len(), 2);
        Ok(())
    }

    #[test]
    fn nested_content_below_fields_is_ignored() -> TestResult {
        let xml = r#"<Root xmlns="urn:x"><t_unit><unit_id>1</unit_id><value>MW<extra>x</extra></value></t_unit></Root>"#;
        let (_, tables) = graph_from(xml)?.materialize();
        let row = tables["unit"].row(0).expect("one row");
        assert_eq!(row.text("value"), Some("MW"));
        assert!(!tables["unit"].has_column("extra"));
        Ok(())
    }
}
