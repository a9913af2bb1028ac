// CSV encoding stage
//
// Shared by both executors: rows go in as cell vectors, encoded CSV chunks
// come out batched, so the transport sees a few large writes instead of
// one write per row. Timestamps use a fixed machine-sortable form so
// output is stable across backends.

use bytes::Bytes;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;

/// Rows coalesced per output chunk before the batch is handed downstream.
pub const DEFAULT_ROW_BATCH: usize = 512;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";

/// Accumulates CSV records and flushes them as byte chunks on batch
/// boundaries.
pub struct CsvBatcher {
    writer: csv::Writer<Vec<u8>>,
    rows_in_batch: usize,
    batch_rows: usize,
}

impl Default for CsvBatcher {
    fn default() -> Self {
        Self::new(DEFAULT_ROW_BATCH)
    }
}

impl CsvBatcher {
    pub fn new(batch_rows: usize) -> Self {
        Self {
            writer: csv::Writer::from_writer(Vec::new()),
            rows_in_batch: 0,
            batch_rows: batch_rows.max(1),
        }
    }

    /// Write the header record. Counts toward the current batch so tiny
    /// result sets still go out as a single chunk.
    pub fn header(&mut self, columns: &[String]) -> Result<(), csv::Error> {
        self.writer.write_record(columns)?;
        self.rows_in_batch += 1;
        Ok(())
    }

    /// Append one row; returns an encoded chunk when the batch is full.
    pub fn push(&mut self, cells: &[String]) -> Result<Option<Bytes>, csv::Error> {
        self.writer.write_record(cells)?;
        self.rows_in_batch += 1;
        if self.rows_in_batch >= self.batch_rows {
            return self.flush().map(Some);
        }
        Ok(None)
    }

    /// Flush whatever remains; `None` when the current batch is empty.
    pub fn finish(mut self) -> Result<Option<Bytes>, csv::Error> {
        if self.rows_in_batch == 0 {
            return Ok(None);
        }
        self.flush().map(Some)
    }

    fn flush(&mut self) -> Result<Bytes, csv::Error> {
        self.writer.flush().map_err(csv::Error::from)?;
        let writer = std::mem::replace(&mut self.writer, csv::Writer::from_writer(Vec::new()));
        let buf = writer
            .into_inner()
            .map_err(|e| csv::Error::from(std::io::Error::other(e.to_string())))?;
        self.rows_in_batch = 0;
        Ok(Bytes::from(buf))
    }
}

pub fn format_timestamp(ts: &NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

pub fn format_timestamp_utc(ts: &DateTime<Utc>) -> String {
    ts.naive_utc().format(TIMESTAMP_FORMAT).to_string()
}

pub fn format_date(date: &NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// Render one warehouse JSON value as a CSV cell. NULL becomes the empty
/// cell, strings pass through unquoted (the CSV writer handles quoting).
pub fn json_cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cells(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_header_then_rows_single_chunk() {
        let mut batcher = CsvBatcher::new(16);
        batcher.header(&cells(&["time", "lat", "lon"])).unwrap();
        assert!(batcher.push(&cells(&["2020-01-01T00:00:00.000", "10.5", "-120.25"])).unwrap().is_none());
        let chunk = batcher.finish().unwrap().unwrap();
        let text = String::from_utf8(chunk.to_vec()).unwrap();
        assert!(text.starts_with("time,lat,lon\n"));
        assert!(text.contains("2020-01-01T00:00:00.000,10.5,-120.25"));
    }

    #[test]
    fn test_batch_boundary_flush() {
        let mut batcher = CsvBatcher::new(2);
        batcher.header(&cells(&["a"])).unwrap();
        // header + first row fills the batch of 2
        let chunk = batcher.push(&cells(&["1"])).unwrap();
        assert!(chunk.is_some());
        assert!(batcher.push(&cells(&["2"])).unwrap().is_none());
        let tail = batcher.finish().unwrap().unwrap();
        assert_eq!(String::from_utf8(tail.to_vec()).unwrap(), "2\n");
    }

    #[test]
    fn test_empty_finish_is_none() {
        let batcher = CsvBatcher::new(4);
        assert!(batcher.finish().unwrap().is_none());
    }

    #[test]
    fn test_cells_with_commas_are_quoted() {
        let mut batcher = CsvBatcher::new(4);
        batcher.push(&cells(&["a,b", "plain"])).unwrap();
        let chunk = batcher.finish().unwrap().unwrap();
        let text = String::from_utf8(chunk.to_vec()).unwrap();
        assert_eq!(text, "\"a,b\",plain\n");
    }

    #[test]
    fn test_timestamp_format_is_sortable() {
        let ts = NaiveDate::from_ymd_opt(2018, 3, 5)
            .unwrap()
            .and_hms_milli_opt(6, 7, 8, 90)
            .unwrap();
        assert_eq!(format_timestamp(&ts), "2018-03-05T06:07:08.090");
    }

    #[test]
    fn test_json_cells() {
        assert_eq!(json_cell(&Value::Null), "");
        assert_eq!(json_cell(&Value::String("abc".to_string())), "abc");
        assert_eq!(json_cell(&serde_json::json!(3.25)), "3.25");
        assert_eq!(json_cell(&Value::Bool(true)), "true");
    }
}
