// 📋 Raw Tables - delimited files as header + string rows
//
// Every source file is read into a RawTable first. Column names are whatever
// the file claims; reconciliation to canonical names happens on top of this.

use crate::error::Result;
use csv::{ReaderBuilder, WriterBuilder};
use std::fs;
use std::path::Path;

/// Separator used by every file the authority publishes and every file we write.
pub const DELIMITER: u8 = b';';

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawTable {
    /// Column names in file order.
    pub headers: Vec<String>,
    /// One Vec per data row, always `headers.len()` cells long. Empty cell = null.
    pub rows: Vec<Vec<String>>,
}

impl RawTable {
    pub fn new(headers: Vec<String>) -> Self {
        RawTable {
            headers,
            rows: Vec::new(),
        }
    }

    /// Read a delimited file. UTF-8 first, Latin-1 as fallback.
    pub fn read_delimited(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)?;
        Self::from_bytes(&bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let text = decode_text(bytes);
        let text = text.strip_prefix('\u{feff}').unwrap_or(&text);

        let mut reader = ReaderBuilder::new()
            .delimiter(DELIMITER)
            .has_headers(true)
            .flexible(true)
            .from_reader(text.as_bytes());

        let headers: Vec<String> = reader
            .headers()?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();

        let mut table = RawTable::new(headers);
        for result in reader.records() {
            let record = result?;
            let mut row: Vec<String> = record.iter().map(|c| c.trim().to_string()).collect();
            // Short rows are padded, long rows truncated
            row.resize(table.headers.len(), String::new());
            table.rows.push(row);
        }

        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    /// Names from `required` that the table does not have.
    pub fn missing_columns(&self, required: &[&str]) -> Vec<String> {
        required
            .iter()
            .filter(|c| !self.has_column(c))
            .map(|c| c.to_string())
            .collect()
    }

    /// Cell value, `None` for an empty cell or unknown column.
    pub fn get(&self, row: usize, column: &str) -> Option<&str> {
        let idx = self.column_index(column)?;
        self.rows
            .get(row)
            .and_then(|r| r.get(idx))
            .map(|s| s.as_str())
            .filter(|s| !s.is_empty())
    }

    /// Rename a column in place. Returns false when `from` does not exist.
    ///
    /// If `to` already exists the two are merged: cells of `from` fill the
    /// empty cells of `to`, then `from` is dropped.
    pub fn rename_column(&mut self, from: &str, to: &str) -> bool {
        let Some(from_idx) = self.column_index(from) else {
            return false;
        };
        if from == to {
            return true;
        }

        match self.column_index(to) {
            None => {
                self.headers[from_idx] = to.to_string();
            }
            Some(to_idx) => {
                for row in &mut self.rows {
                    if row[to_idx].is_empty() {
                        row[to_idx] = std::mem::take(&mut row[from_idx]);
                    }
                    row.remove(from_idx);
                }
                self.headers.remove(from_idx);
            }
        }
        true
    }

    /// Concatenate tables. Columns are the union in first-seen order; a row
    /// from a table lacking a column gets an empty cell there.
    pub fn concat(tables: Vec<RawTable>) -> RawTable {
        let mut headers: Vec<String> = Vec::new();
        for table in &tables {
            for h in &table.headers {
                if !headers.contains(h) {
                    headers.push(h.clone());
                }
            }
        }

        let mut out = RawTable::new(headers);
        for table in tables {
            let mapping: Vec<Option<usize>> = out
                .headers
                .iter()
                .map(|h| table.column_index(h))
                .collect();

            for row in table.rows {
                let projected = mapping
                    .iter()
                    .map(|idx| idx.map(|i| row[i].clone()).unwrap_or_default())
                    .collect();
                out.rows.push(projected);
            }
        }
        out
    }

    /// Write the table with the standard separator. Output depends only on
    /// headers and rows, so equal tables give equal bytes.
    pub fn write_delimited(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut writer = WriterBuilder::new().delimiter(DELIMITER).from_path(path)?;
        writer.write_record(&self.headers)?;
        for row in &self.rows {
            writer.write_record(row)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Decode file bytes: UTF-8 when valid, otherwise Latin-1 (one byte per char).
pub fn decode_text(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    }
}
