//! Materializes synthetic individual records from the leaf estimates.

use crate::basis::Basis;
use crate::data::Dataset;
use crate::tree::GeoTree;
use crate::{Result, TopDownError};
use std::io::Write;

/// Writes one row per synthetic individual: the geographic path values
/// followed by the query-attribute combination, preceded by a header row.
///
/// Row order is deterministic: leaves in tree order, then basis rows in
/// basis order. Returns the number of individuals written, which equals the
/// sum over all leaf estimates.
pub fn write_microdata<W: Write>(
    tree: &GeoTree,
    basis: &Basis,
    dataset: &Dataset,
    separator: char,
    writer: &mut W,
) -> Result<u64> {
    let mut sep = [0u8; 4];
    let sep = separator.encode_utf8(&mut sep).as_bytes().to_vec();

    let mut header: Vec<&str> = dataset.geo_columns().iter().map(String::as_str).collect();
    header.extend(dataset.query_columns().iter().map(String::as_str));
    write_row(writer, &sep, &header)?;

    let mut written = 0u64;
    let mut fields: Vec<&str> = Vec::with_capacity(header.len());
    for leaf in tree.leaves() {
        let node = tree.node(leaf);
        let estimate = node.v_est.as_ref().ok_or_else(|| {
            TopDownError::State(format!(
                "leaf [{}] has no estimate; estimation has not finished",
                tree.path_string(leaf, dataset)
            ))
        })?;
        for (row, count) in estimate.iter().enumerate() {
            if *count == 0 {
                continue;
            }
            fields.clear();
            fields.extend(node.path.iter().map(|v| dataset.resolve(*v)));
            fields.extend(basis.tuple_of(row).iter().map(|v| dataset.resolve(*v)));
            for _ in 0..*count {
                write_row(writer, &sep, &fields)?;
                written += 1;
            }
        }
    }
    writer.flush()?;
    tracing::info!(individuals = written, "synthetic microdata written");
    Ok(written)
}

fn write_row<W: Write>(writer: &mut W, sep: &[u8], fields: &[&str]) -> Result<()> {
    for (k, field) in fields.iter().enumerate() {
        if k > 0 {
            writer.write_all(sep)?;
        }
        writer.write_all(field.as_bytes())?;
    }
    writer.write_all(b"\n")?;
    Ok(())
}
