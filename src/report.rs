use std::fmt::Write as _;
use std::io::Write;
use std::time::Instant;

use anyhow::Result;
use futures::TryStreamExt;

use crate::configuration::StoreTarget;
use crate::gateway::{RowView, StorageGateway};

pub const DEFAULT_SCAN_LIMIT: usize = 50;

const HEADERS: [&str; 3] = ["ROW KEY", "COLUMN", "VALUE"];

/// Scans at most `limit` rows starting with `prefix` and prints the cells of
/// the target column family as a table. Returns the number of rows printed.
pub async fn scan_and_report(
    gateway: &dyn StorageGateway,
    target: &StoreTarget,
    prefix: &str,
    limit: usize,
    out: &mut dyn Write,
) -> Result<usize> {
    let start = Instant::now();
    let rows: Vec<RowView> = gateway
        .scan_prefix(&target.table, prefix, limit)
        .await?
        .try_collect()
        .await?;
    let elapsed = start.elapsed();

    write_table(&rows, &target.column_family, out)?;
    tracing::info!(
        rows = rows.len(),
        elapsed_ms = elapsed.as_millis() as u64,
        "read rows with prefix {:?}",
        prefix,
    );
    Ok(rows.len())
}

/// Formats bytes as `0x` followed by lowercase hex digits.
pub fn hex_value(value: &[u8]) -> String {
    let mut s = String::with_capacity(2 + 2 * value.len());
    s.push_str("0x");
    for b in value {
        let _ = write!(s, "{:02x}", b);
    }
    s
}

/// Prints rows as a table. The row key is shown only on the first line
/// of each row.
pub fn write_table(rows: &[RowView], family: &str, out: &mut dyn Write) -> Result<()> {
    let mut lines: Vec<[String; 3]> = Vec::new();
    for row in rows {
        let mut key = Some(row.key.clone());
        for cell in row.family_cells(family) {
            lines.push([
                key.take().unwrap_or_default(),
                format!("{}:{}", cell.family, cell.qualifier),
                hex_value(&cell.value),
            ]);
        }
        if let Some(key) = key {
            lines.push([key, String::new(), String::new()]);
        }
    }

    let mut widths = HEADERS.map(str::len);
    for line in &lines {
        for (width, field) in widths.iter_mut().zip(line) {
            *width = (*width).max(field.len());
        }
    }

    writeln!(
        out,
        "{:<w0$} | {:<w1$} | {}",
        HEADERS[0],
        HEADERS[1],
        HEADERS[2],
        w0 = widths[0],
        w1 = widths[1],
    )?;
    writeln!(
        out,
        "{}-+-{}-+-{}",
        "-".repeat(widths[0]),
        "-".repeat(widths[1]),
        "-".repeat(widths[2]),
    )?;
    for [key, column, value] in &lines {
        let line = format!(
            "{:<w0$} | {:<w1$} | {}",
            key,
            column,
            value,
            w0 = widths[0],
            w1 = widths[1],
        );
        writeln!(out, "{}", line.trim_end())?;
    }
    Ok(())
}
