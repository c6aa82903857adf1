//! Input decoding for bulk loads: JSON arrays, newline-delimited JSON and
//! CSV, all surfaced through the [`LineSource`] pull interface so the
//! batcher never cares where lines come from.

use std::io::BufRead;

use serde_json::Value;

use crate::dataset::{Dataset, FieldType};
use crate::ingest::IngestError;
use crate::line::Doc;

/// A pull source of raw lines. Decode failures carry the input line number
/// so the bulk summary can point at the offending row.
pub trait LineSource {
    fn next_line(&mut self) -> Option<Result<Doc, IngestError>>;
}

/// CSV dialect options.
#[derive(Debug, Clone)]
pub struct CsvOptions {
    pub delimiter: u8,
    pub quote: u8,
}

impl Default for CsvOptions {
    fn default() -> Self {
        Self {
            delimiter: b',',
            quote: b'"',
        }
    }
}

/// Parses one CSV record into fields, honoring quoting and doubled-quote
/// escapes. `None` means a malformed record (unclosed quote).
pub fn parse_csv_record(record: &str, opts: &CsvOptions) -> Option<Vec<String>> {
    let mut fields = Vec::new();
    let mut chars = record.chars().peekable();
    let q = opts.quote as char;
    let d = opts.delimiter as char;

    loop {
        if chars.peek() == Some(&q) {
            chars.next();
            let mut field = String::new();
            let mut closed = false;
            while let Some(c) = chars.next() {
                if c == q {
                    if chars.peek() == Some(&q) {
                        chars.next();
                        field.push(q);
                    } else {
                        closed = true;
                        break;
                    }
                } else {
                    field.push(c);
                }
            }
            if !closed {
                return None;
            }
            fields.push(field);
            match chars.next() {
                Some(c) if c == d => {}
                None => break,
                _ => return None,
            }
        } else {
            let mut field = String::new();
            loop {
                match chars.peek() {
                    Some(&c) if c == d => {
                        chars.next();
                        break;
                    }
                    Some(_) => {
                        field.push(chars.next().unwrap());
                    }
                    None => {
                        fields.push(field);
                        return Some(fields);
                    }
                }
            }
            fields.push(field);
        }
    }

    Some(fields)
}

/// Whole-body JSON array source.
pub struct JsonSource {
    lines: std::vec::IntoIter<(usize, Value)>,
}

impl JsonSource {
    /// `body` must be a JSON array of objects, or a single object standing
    /// for one line.
    pub fn new(body: &str) -> Result<Self, IngestError> {
        let value: Value = serde_json::from_str(body).map_err(|e| IngestError::Decode {
            line: 0,
            message: e.to_string(),
        })?;
        let items = match value {
            Value::Array(items) => items,
            Value::Object(doc) => vec![Value::Object(doc)],
            _ => {
                return Err(IngestError::Decode {
                    line: 0,
                    message: "expected a JSON array of lines".to_string(),
                })
            }
        };
        let lines: Vec<(usize, Value)> = items.into_iter().enumerate().collect();
        Ok(Self {
            lines: lines.into_iter(),
        })
    }
}

impl LineSource for JsonSource {
    fn next_line(&mut self) -> Option<Result<Doc, IngestError>> {
        let (n, value) = self.lines.next()?;
        Some(match value {
            Value::Object(doc) => Ok(doc),
            other => Err(IngestError::Decode {
                line: n,
                message: format!("expected an object, got {other}"),
            }),
        })
    }
}

/// Newline-delimited JSON source; blank lines are skipped.
pub struct NdJsonSource<R> {
    reader: R,
    line: usize,
}

impl<R: BufRead> NdJsonSource<R> {
    pub fn new(reader: R) -> Self {
        Self { reader, line: 0 }
    }
}

impl<R: BufRead> LineSource for NdJsonSource<R> {
    fn next_line(&mut self) -> Option<Result<Doc, IngestError>> {
        loop {
            let mut buf = String::new();
            match self.reader.read_line(&mut buf) {
                Ok(0) => return None,
                Ok(_) => {}
                Err(e) => {
                    return Some(Err(IngestError::Decode {
                        line: self.line,
                        message: e.to_string(),
                    }))
                }
            }
            let n = self.line;
            self.line += 1;
            let trimmed = buf.trim();
            if trimmed.is_empty() {
                continue;
            }
            return Some(match serde_json::from_str::<Doc>(trimmed) {
                Ok(doc) => Ok(doc),
                Err(e) => Err(IngestError::Decode {
                    line: n,
                    message: e.to_string(),
                }),
            });
        }
    }
}

/// CSV source: the first record names the columns, subsequent records are
/// coerced to the dataset schema's declared types. Empty cells become
/// absent fields, undeclared columns stay strings.
pub struct CsvSource<R> {
    reader: R,
    opts: CsvOptions,
    header: Option<Vec<String>>,
    types: Vec<(String, FieldType)>,
    line: usize,
}

impl<R: BufRead> CsvSource<R> {
    pub fn new(reader: R, dataset: &Dataset, opts: CsvOptions) -> Self {
        let types = dataset
            .schema
            .iter()
            .map(|f| (f.key.clone(), f.field_type))
            .collect();
        Self {
            reader,
            opts,
            header: None,
            types,
            line: 0,
        }
    }

    fn field_type(&self, key: &str) -> Option<FieldType> {
        self.types
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, t)| *t)
    }

    fn coerce(&self, key: &str, raw: String, line: usize) -> Result<Value, IngestError> {
        let bad = |message: String| IngestError::Decode { line, message };
        match self.field_type(key) {
            Some(FieldType::Integer) => raw
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| bad(format!("invalid integer \"{raw}\" for column \"{key}\""))),
            Some(FieldType::Number) => raw
                .parse::<f64>()
                .map(Value::from)
                .map_err(|_| bad(format!("invalid number \"{raw}\" for column \"{key}\""))),
            Some(FieldType::Boolean) => match raw.as_str() {
                "true" | "1" => Ok(Value::Bool(true)),
                "false" | "0" => Ok(Value::Bool(false)),
                _ => Err(bad(format!(
                    "invalid boolean \"{raw}\" for column \"{key}\""
                ))),
            },
            Some(FieldType::String) | None => Ok(Value::String(raw)),
        }
    }
}

impl<R: BufRead> LineSource for CsvSource<R> {
    fn next_line(&mut self) -> Option<Result<Doc, IngestError>> {
        loop {
            let mut buf = String::new();
            match self.reader.read_line(&mut buf) {
                Ok(0) => return None,
                Ok(_) => {}
                Err(e) => {
                    return Some(Err(IngestError::Decode {
                        line: self.line,
                        message: e.to_string(),
                    }))
                }
            }
            let n = self.line;
            self.line += 1;
            let mut record = buf.trim_end_matches(['\n', '\r']).to_string();
            if record.is_empty() {
                continue;
            }
            // Quoted fields may span physical lines: while a quote is still
            // open (odd quote count; doubled escapes keep it even), pull the
            // next line into the record before giving up on it.
            let fields = loop {
                if let Some(fields) = parse_csv_record(&record, &self.opts) {
                    break fields;
                }
                let quote = self.opts.quote as char;
                if record.matches(quote).count() % 2 == 0 {
                    return Some(Err(IngestError::Decode {
                        line: n,
                        message: "malformed csv record".to_string(),
                    }));
                }
                let mut cont = String::new();
                match self.reader.read_line(&mut cont) {
                    Ok(0) => {
                        return Some(Err(IngestError::Decode {
                            line: n,
                            message: "unclosed quote in csv record".to_string(),
                        }))
                    }
                    Ok(_) => {}
                    Err(e) => {
                        return Some(Err(IngestError::Decode {
                            line: n,
                            message: e.to_string(),
                        }))
                    }
                }
                self.line += 1;
                record.push('\n');
                record.push_str(cont.trim_end_matches(['\n', '\r']));
            };
            let Some(header) = &self.header else {
                self.header = Some(fields);
                continue;
            };
            if fields.len() != header.len() {
                return Some(Err(IngestError::Decode {
                    line: n,
                    message: format!(
                        "expected {} columns, got {}",
                        header.len(),
                        fields.len()
                    ),
                }));
            }
            let header = header.clone();
            let mut doc = Doc::new();
            for (key, raw) in header.iter().zip(fields) {
                if raw.is_empty() {
                    continue;
                }
                match self.coerce(key, raw, n) {
                    Ok(v) => {
                        doc.insert(key.clone(), v);
                    }
                    Err(e) => return Some(Err(e)),
                }
            }
            return Some(Ok(doc));
        }
    }
}

/// In-memory source, mostly for tests and single-call APIs.
pub struct VecSource {
    docs: std::vec::IntoIter<Doc>,
}

impl VecSource {
    pub fn new(docs: Vec<Doc>) -> Self {
        Self {
            docs: docs.into_iter(),
        }
    }
}

impl LineSource for VecSource {
    fn next_line(&mut self) -> Option<Result<Doc, IngestError>> {
        self.docs.next().map(Ok)
    }
}
