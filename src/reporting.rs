/// reporting.rs — per-run CSV audit trails and the post-run Excel
/// summary workbook (§6 Persisted artifacts).
///
/// Grounded in `original_source`'s `Logger`/`Printer.store_prophecy_history`:
/// single-writer file sinks behind a mutex (§5's logging requirement),
/// `r2` (round-to-2-decimals) applied only at the serialization
/// boundary, and a `<prefix>_<kind>_<start>_<end>_<wall_ts>.csv`
/// naming scheme rolled up into one workbook per run.
use crate::strategy::DecisionRecord;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::info;

/// Rounds to 2 decimal places — the convention every audit CSV column
/// uses, matching `original_source`'s `r2`.
pub fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct TraderLogRow {
    pub time: DateTime<Utc>,
    pub action: String,
    pub symbol: String,
    pub qty: f64,
    pub price: f64,
    pub avg_price: f64,
    pub cash_change: f64,
    pub profit: f64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct OrderLogRow {
    pub time: DateTime<Utc>,
    pub symbol: String,
    pub side: String,
    pub qty: f64,
    pub client_order_id: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct AccountLogRow {
    pub time: DateTime<Utc>,
    pub cash: f64,
    pub positions_value: f64,
    pub total_value: f64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ProphecyRow {
    pub time: DateTime<Utc>,
    pub symbol: String,
    pub buy: bool,
    pub buy_reason: String,
    pub buy_strength: f64,
    pub sell: bool,
    pub sell_reason: String,
    pub keep_profit: bool,
    pub stop_value: f64,
    pub stop_key: String,
    pub stop_trailing: f64,
    pub trading_value: f64,
    pub current_close: f64,
}

impl From<&DecisionRecord> for ProphecyRow {
    fn from(d: &DecisionRecord) -> Self {
        Self {
            time: d.timestamp,
            symbol: d.symbol.clone(),
            buy: d.buy,
            buy_reason: d.buy_reason.clone(),
            buy_strength: round2(d.buy_strength),
            sell: d.sell,
            sell_reason: d.sell_reason.clone(),
            keep_profit: d.keep_profit,
            stop_value: round2(d.stop_value),
            stop_key: d.stop_key.clone(),
            stop_trailing: round2(d.stop_trailing),
            trading_value: round2(d.trading_value),
            current_close: round2(d.price),
        }
    }
}

/// A single-writer CSV sink behind a mutex, matching the teacher's
/// single-writer-per-destination logging convention.
pub struct CsvSink {
    path: PathBuf,
    writer: Mutex<csv::Writer<std::fs::File>>,
}

impl CsvSink {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = std::fs::File::create(&path)
            .with_context(|| format!("creating audit log {}", path.display()))?;
        Ok(Self { path, writer: Mutex::new(csv::Writer::from_writer(file)) })
    }

    pub fn append<T: serde::Serialize>(&self, row: &T) -> Result<()> {
        let mut w = self.writer.lock().unwrap();
        w.serialize(row).context("writing audit row")?;
        w.flush().context("flushing audit log")?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Owns the four audit CSV sinks for one run, named per
/// `<prefix>_<kind>_<start>_<end>_<wall_ts>.csv`.
pub struct Reporting {
    pub trader: CsvSink,
    pub order: CsvSink,
    pub account: CsvSink,
    pub prophecy: CsvSink,
    results_dir: PathBuf,
    prefix: String,
    start_tag: String,
    end_tag: String,
    wall_ts: String,
}

impl Reporting {
    pub fn new(
        results_dir: impl AsRef<Path>,
        prefix: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        wall_ts: DateTime<Utc>,
    ) -> Result<Self> {
        let results_dir = results_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&results_dir)
            .with_context(|| format!("creating results dir {}", results_dir.display()))?;

        let start_tag = start.format("%Y-%m-%dT%H-%M").to_string();
        let end_tag = end.format("%Y-%m-%dT%H-%M").to_string();
        let wall_tag = wall_ts.format("%Y-%m-%dT%H-%M-%S").to_string();

        let make = |kind: &str| -> Result<CsvSink> {
            let filename = format!("{prefix}_{kind}_{start_tag}_{end_tag}_{wall_tag}.csv");
            CsvSink::create(results_dir.join(filename))
        };

        Ok(Self {
            trader: make("trader")?,
            order: make("order")?,
            account: make("account")?,
            prophecy: make("prophecy")?,
            results_dir,
            prefix: prefix.to_string(),
            start_tag,
            end_tag,
            wall_ts: wall_tag,
        })
    }

    /// Concatenates this run's CSVs into one Excel workbook with
    /// sheets `{account, order, prophecy, trader}`, per §6.
    pub fn export_excel_summary(&self) -> Result<PathBuf> {
        let mut workbook = rust_xlsxwriter::Workbook::new();

        for (kind, sink) in [
            ("account", &self.account),
            ("order", &self.order),
            ("prophecy", &self.prophecy),
            ("trader", &self.trader),
        ] {
            let sheet = workbook.add_worksheet().set_name(kind)?;
            let mut reader = csv::Reader::from_path(sink.path())
                .with_context(|| format!("reading {} for excel export", sink.path().display()))?;

            let headers = reader.headers()?.clone();
            for (col, header) in headers.iter().enumerate() {
                sheet.write_string(0, col as u16, header)?;
            }
            for (row_idx, record) in reader.records().enumerate() {
                let record = record?;
                for (col, value) in record.iter().enumerate() {
                    sheet.write_string((row_idx + 1) as u32, col as u16, value)?;
                }
            }
        }

        let filename = format!(
            "{}_summary_{}_{}_{}.xlsx",
            self.prefix, self.start_tag, self.end_tag, self.wall_ts
        );
        let out_path = self.results_dir.join(filename);
        workbook.save(&out_path)?;
        info!(path = %out_path.display(), "excel summary written");
        Ok(out_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round2_rounds_to_two_decimals() {
        assert_eq!(round2(99.005), 99.01);
        assert_eq!(round2(100.0), 100.0);
    }

    #[test]
    fn csv_sink_appends_rows() {
        let dir = std::env::temp_dir().join(format!("engine_test_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("test.csv");
        let sink = CsvSink::create(&path).unwrap();
        sink.append(&AccountLogRow {
            time: Utc::now(),
            cash: 1000.0,
            positions_value: 0.0,
            total_value: 1000.0,
        })
        .unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("1000"));
    }
}
