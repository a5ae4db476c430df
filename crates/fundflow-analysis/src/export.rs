//! CSV export of the fund-flow ledger.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use eyre::{Context, Result};
use fundflow_data::types::FundFlowRecord;

/// Column header of the ledger CSV.
pub const CSV_HEADER: [&str; 17] = [
    "seed_case",
    "path_id",
    "hop",
    "follow",
    "input",
    "output",
    "wallet_explorer_id",
    "wallet_classification",
    "wallet_label",
    "txid",
    "datetime_CET",
    "mov_type",
    "BTC",
    "classification",
    "BTC_added_to_flow_from_others",
    "BTC_not_followed",
    "notes",
];

/// Placeholder written when a recipient has no cluster.
pub const MISSING_WALLET_ID: &str = "N/A";

const EVENT_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Writes `records` as CSV, ordered by path then hop.
///
/// # Errors
/// Returns error if writing to `out` fails.
pub fn write_csv<W: Write>(records: &[FundFlowRecord], out: W) -> Result<()> {
    let mut sorted: Vec<&FundFlowRecord> = records.iter().collect();
    sorted.sort_by(|a, b| a.path_id.cmp(&b.path_id).then(a.hop.cmp(&b.hop)));

    let mut writer = csv::WriterBuilder::new()
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(out);
    writer.write_record(CSV_HEADER)?;
    for record in sorted {
        writer.write_record([
            record.seed_case.clone(),
            record.path_id.to_string(),
            record.hop.to_string(),
            record.follow.to_string(),
            record.input.clone(),
            record.output.clone(),
            record
                .wallet_id
                .clone()
                .unwrap_or_else(|| MISSING_WALLET_ID.to_string()),
            record.wallet_classification.as_str().to_string(),
            record.wallet_label.clone(),
            record.txid.clone(),
            record
                .event_time
                .map(|t| t.format(EVENT_TIME_FORMAT).to_string())
                .unwrap_or_default(),
            record.mov_type.as_str().to_string(),
            format!("{:.10}", record.btc),
            record.classification.clone(),
            format!("{:.10}", record.btc_added_to_flow_from_others),
            format!("{:.10}", record.btc_not_followed),
            record.notes.clone(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

/// Writes the ledger CSV to `path`, creating parent directories.
///
/// # Errors
/// Returns error if the file cannot be created or written.
pub fn export_csv(records: &[FundFlowRecord], path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .wrap_err_with(|| format!("failed to create {}", parent.display()))?;
    }
    let file =
        File::create(path).wrap_err_with(|| format!("failed to create {}", path.display()))?;
    write_csv(records, file).wrap_err_with(|| format!("failed to write {}", path.display()))?;
    tracing::info!(path = %path.display(), records = records.len(), "CSV exported");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;
    use fundflow_data::types::{ClusterType, MovementType};

    fn record(path_id: u64, hop: u32, notes: &str) -> FundFlowRecord {
        FundFlowRecord {
            seed_case: "1Seed".to_string(),
            path_id,
            hop,
            follow: notes.is_empty(),
            input: "1Seed".to_string(),
            output: format!("1Out{path_id}{hop}"),
            wallet_id: if hop == 1 { Some("00ab".to_string()) } else { None },
            wallet_classification: ClusterType::PersonalWallet,
            wallet_label: String::new(),
            txid: "ff".to_string(),
            event_time: DateTime::parse_from_rfc3339("2021-05-02T12:00:00+02:00").ok(),
            mov_type: MovementType::Out,
            btc: 0.5,
            classification: String::new(),
            btc_added_to_flow_from_others: 0.0,
            btc_not_followed: 0.03,
            notes: notes.to_string(),
        }
    }

    fn render(records: &[FundFlowRecord]) -> String {
        let mut buf = Vec::new();
        write_csv(records, &mut buf).expect("writing to a Vec cannot fail");
        String::from_utf8(buf).expect("CSV is UTF-8")
    }

    #[test]
    fn header_and_row_format() {
        let csv = render(&[record(0, 1, "")]);
        let mut lines = csv.lines();
        assert_eq!(lines.next(), Some(CSV_HEADER.join(",").as_str()));
        assert_eq!(
            lines.next(),
            Some(
                "1Seed,0,1,true,1Seed,1Out01,00ab,personal_wallet,,ff,2021-05-02 12:00:00,OUT,\
                 0.5000000000,,0.0000000000,0.0300000000,"
            )
        );
        assert_eq!(lines.next(), None);
    }

    #[test]
    fn rows_are_sorted_by_path_then_hop() {
        let csv = render(&[record(1, 1, ""), record(0, 2, ""), record(0, 1, "")]);
        let keys: Vec<(String, String)> = csv
            .lines()
            .skip(1)
            .map(|line| {
                let cols: Vec<&str> = line.split(',').collect();
                (cols[1].to_string(), cols[2].to_string())
            })
            .collect();
        assert_eq!(
            keys,
            vec![
                ("0".to_string(), "1".to_string()),
                ("0".to_string(), "2".to_string()),
                ("1".to_string(), "1".to_string()),
            ]
        );
    }

    #[test]
    fn missing_wallet_and_quoted_notes() {
        let csv = render(&[record(0, 2, "not followed: \"exchange\", hot wallet")]);
        let row = csv.lines().nth(1).expect("one data row");
        assert!(row.contains(",N/A,"));
        assert!(row.ends_with(",\"not followed: \"\"exchange\"\", hot wallet\""));
    }

    #[test]
    fn provider_labels_with_delimiters_read_back_intact() {
        let mut row = record(0, 1, "");
        row.wallet_label = "Huobi, \"cold\"\nwallet".to_string();
        let text = render(&[row]);

        let mut reader = csv::Reader::from_reader(text.as_bytes());
        let rows: Vec<csv::StringRecord> = reader
            .records()
            .collect::<Result<_, _>>()
            .expect("output should parse as CSV");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].len(), CSV_HEADER.len());
        assert_eq!(&rows[0][8], "Huobi, \"cold\"\nwallet");
    }

    #[test]
    fn export_creates_parent_directories() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let path = dir.path().join("output").join("fund_flow_records.csv");

        export_csv(&[record(0, 1, "")], &path).expect("export should succeed");
        let written = std::fs::read_to_string(&path).expect("file should exist");
        assert_eq!(written.lines().count(), 2);
    }
}
