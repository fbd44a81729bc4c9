//! Loading and interning of the raw census file.
//!
//! The raw file is CSV-like with a header row naming at least the declared
//! geographic and query columns. Field values are interned so the rest of
//! the engine works with small `Copy` keys instead of strings.

use crate::basis::ValueTuple;
use crate::{Result, TopDownError};
use csv_core::{ReadFieldResult, ReaderBuilder};
use lasso::{Rodeo, Spur};
use smallvec::SmallVec;
use std::fs::File;
use std::io;
use std::path::Path;
use std::str;

/// One raw individual: the interned values of the geographic columns in
/// hierarchy order, then the interned values of the query columns.
#[derive(Clone, Debug)]
pub struct Record {
    /// Geographic attribute values, coarsest first.
    pub geo: SmallVec<[Spur; 8]>,
    /// Query attribute values in declared order.
    pub query: ValueTuple,
}

/// The loaded raw records together with the interner that owns their
/// values.
#[derive(Debug)]
pub struct Dataset {
    records: Vec<Record>,
    rodeo: Rodeo,
    geo_columns: Vec<String>,
    query_columns: Vec<String>,
}

impl Dataset {
    /// Reads the file at `path`, keeping only the declared columns.
    pub fn from_path(
        path: &Path,
        geo_columns: &[String],
        query_columns: &[String],
        delimiter: u8,
    ) -> Result<Dataset> {
        let file = File::open(path).map_err(|e| {
            TopDownError::Input(format!("cannot open {}: {e}", path.display()))
        })?;
        Dataset::load(file, geo_columns, query_columns, delimiter)
    }

    /// Reads a CSV-like stream, keeping only the declared columns.
    ///
    /// The first record must be a header row; a declared column that does
    /// not appear in it is a configuration error. A record with an empty
    /// value in any declared column is rejected.
    pub fn load<I: io::Read>(
        mut input: I,
        geo_columns: &[String],
        query_columns: &[String],
        delimiter: u8,
    ) -> Result<Dataset> {
        let mut inputbuf = [0; 16384];
        let mut fieldbuf = [0; 1024];
        let mut fieldlen = 0;
        let mut rodeo = Rodeo::new();
        let mut csv = ReaderBuilder::new().delimiter(delimiter).build();

        // Which slot of the record each file column lands in, filled in
        // from the header row. Geographic slots come first.
        let mut header: Vec<String> = Vec::new();
        let mut slots: Vec<Option<usize>> = Vec::new();
        let mut in_header = true;

        let mut records = Vec::new();
        let mut field_idx = 0;
        let width = geo_columns.len() + query_columns.len();
        let mut row: Vec<Option<Spur>> = vec![None; width];

        loop {
            let read = input.read(&mut inputbuf)?;
            let mut bytes = &inputbuf[..read];
            loop {
                let (result, nin, nout) = csv.read_field(bytes, &mut fieldbuf[fieldlen..]);
                bytes = &bytes[nin..];
                fieldlen += nout;
                match result {
                    ReadFieldResult::InputEmpty => break,
                    ReadFieldResult::OutputFull => {
                        return Err(TopDownError::Input(format!(
                            "field too long on line {}",
                            csv.line()
                        )));
                    }
                    ReadFieldResult::Field { record_end } => {
                        let field = str::from_utf8(&fieldbuf[..fieldlen]).map_err(|e| {
                            TopDownError::Input(format!(
                                "invalid utf-8 on line {}: {e}",
                                csv.line()
                            ))
                        })?;
                        fieldlen = 0;

                        if in_header {
                            header.push(field.to_owned());
                        } else {
                            if let Some(Some(slot)) = slots.get(field_idx) {
                                if field.is_empty() {
                                    return Err(TopDownError::Input(format!(
                                        "missing value for column {} on line {}",
                                        header[field_idx],
                                        csv.line()
                                    )));
                                }
                                row[*slot] = Some(rodeo.get_or_intern(field));
                            }
                            field_idx += 1;
                        }

                        if record_end {
                            if in_header {
                                slots = slot_map(&header, geo_columns, query_columns)?;
                                in_header = false;
                            } else {
                                records.push(take_row(
                                    &mut row,
                                    geo_columns.len(),
                                    csv.line(),
                                )?);
                                field_idx = 0;
                            }
                        }
                    }
                    ReadFieldResult::End => {
                        if in_header && header.is_empty() {
                            return Err(TopDownError::Input("empty input file".into()));
                        }
                        records.shrink_to_fit();
                        return Ok(Dataset {
                            records,
                            rodeo,
                            geo_columns: geo_columns.to_vec(),
                            query_columns: query_columns.to_vec(),
                        });
                    }
                }
            }
        }
    }

    /// The loaded records.
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Resolves an interned value back to its string.
    pub fn resolve(&self, value: Spur) -> &str {
        self.rodeo.resolve(&value)
    }

    /// Interns a string, e.g. when rehydrating values from a checkpoint.
    pub fn intern(&mut self, value: &str) -> Spur {
        self.rodeo.get_or_intern(value)
    }

    /// The declared geographic column names, coarsest first.
    pub fn geo_columns(&self) -> &[String] {
        &self.geo_columns
    }

    /// The declared query column names.
    pub fn query_columns(&self) -> &[String] {
        &self.query_columns
    }

    /// The value domain of each query column, ordered lexicographically by
    /// resolved string so the basis order is independent of interning
    /// order.
    pub fn query_domains(&self) -> Vec<Vec<Spur>> {
        (0..self.query_columns.len())
            .map(|k| {
                let mut domain: Vec<Spur> =
                    self.records.iter().map(|r| r.query[k]).collect();
                domain.sort_unstable_by(|a, b| {
                    self.rodeo.resolve(a).cmp(self.rodeo.resolve(b))
                });
                domain.dedup();
                domain
            })
            .collect()
    }

    /// Orders interned values lexicographically by their resolved strings.
    pub fn sort_values(&self, values: &mut [Spur]) {
        values.sort_unstable_by(|a, b| self.rodeo.resolve(a).cmp(self.rodeo.resolve(b)));
    }
}

fn slot_map(
    header: &[String],
    geo_columns: &[String],
    query_columns: &[String],
) -> Result<Vec<Option<usize>>> {
    let mut slots = vec![None; header.len()];
    for (slot, name) in geo_columns.iter().chain(query_columns).enumerate() {
        let position = header
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| TopDownError::Config(format!("unknown attribute {name}")))?;
        slots[position] = Some(slot);
    }
    Ok(slots)
}

fn take_row(row: &mut [Option<Spur>], geo_len: usize, line: u64) -> Result<Record> {
    let mut geo = SmallVec::new();
    let mut query = ValueTuple::new();
    for (slot, value) in row.iter_mut().enumerate() {
        let value = value.take().ok_or_else(|| {
            TopDownError::Input(format!("short record on line {line}"))
        })?;
        if slot < geo_len {
            geo.push(value);
        } else {
            query.push(value);
        }
    }
    Ok(Record { geo, query })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn columns(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn loads_declared_columns_only() {
        let csv = "REGION;COMUNA;P08;IGNORED\n1;101;1;zzz\n1;102;2;zzz\n2;201;1;zzz\n";
        let data = Dataset::load(
            csv.as_bytes(),
            &columns(&["REGION", "COMUNA"]),
            &columns(&["P08"]),
            b';',
        )
        .unwrap();

        assert_eq!(data.records().len(), 3);
        let first = &data.records()[0];
        assert_eq!(data.resolve(first.geo[0]), "1");
        assert_eq!(data.resolve(first.geo[1]), "101");
        assert_eq!(data.resolve(first.query[0]), "1");
    }

    #[test]
    fn header_order_does_not_matter() {
        let csv = "P08;REGION\n2;9\n";
        let data = Dataset::load(
            csv.as_bytes(),
            &columns(&["REGION"]),
            &columns(&["P08"]),
            b';',
        )
        .unwrap();
        assert_eq!(data.resolve(data.records()[0].geo[0]), "9");
        assert_eq!(data.resolve(data.records()[0].query[0]), "2");
    }

    #[test]
    fn missing_column_is_a_config_error() {
        let csv = "REGION;P08\n1;1\n";
        let err = Dataset::load(
            csv.as_bytes(),
            &columns(&["REGION", "COMUNA"]),
            &columns(&["P08"]),
            b';',
        )
        .unwrap_err();
        assert!(matches!(err, TopDownError::Config(_)));
    }

    #[test]
    fn empty_value_is_an_input_error() {
        let csv = "REGION;P08\n1;\n";
        let err = Dataset::load(
            csv.as_bytes(),
            &columns(&["REGION"]),
            &columns(&["P08"]),
            b';',
        )
        .unwrap_err();
        assert!(matches!(err, TopDownError::Input(_)));
    }

    #[test]
    fn query_domains_are_lexicographic() {
        let csv = "REGION;P09\n1;30\n1;10\n1;20\n1;10\n";
        let data = Dataset::load(
            csv.as_bytes(),
            &columns(&["REGION"]),
            &columns(&["P09"]),
            b';',
        )
        .unwrap();
        let domains = data.query_domains();
        let resolved: Vec<&str> = domains[0].iter().map(|v| data.resolve(*v)).collect();
        assert_eq!(resolved, vec!["10", "20", "30"]);
    }
}
