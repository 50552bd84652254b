//! Read-only reporting over stored scan results.
//!
//! Pure consumer of the result store: aggregates a hit table into the
//! tabular summary the operator reads after a run. No pipeline state is
//! touched here.

use crate::store::{HitTable, Store};
use anyhow::Result;
use prettytable::{Cell, Row, Table, format};

const TOP_N: usize = 10;

/// Build a display table from column titles and stringly-typed rows.
pub fn rows_to_table(titles: &[&str], rows: &[Vec<String>]) -> Table {
    let mut table = Table::new();
    table.set_format(*format::consts::FORMAT_BOX_CHARS);
    table.set_titles(Row::new(titles.iter().map(|t| Cell::new(t)).collect()));
    for row in rows {
        table.add_row(Row::new(row.iter().map(|v| Cell::new(v)).collect()));
    }
    table
}

fn count_section(title: &str, label: &str, counts: &[(String, i64)], out: &mut String) {
    out.push_str(&format!("[+] {}:\n", title));
    if counts.is_empty() {
        out.push_str("    (no data)\n\n");
        return;
    }
    let rows: Vec<Vec<String>> = counts
        .iter()
        .map(|(value, count)| vec![value.clone(), count.to_string()])
        .collect();
    out.push_str(&rows_to_table(&[label, "Listings"], &rows).to_string());
    out.push('\n');
}

/// Aggregate one hit table into a human-readable threat report.
pub async fn summary_report(store: &Store, table: HitTable) -> Result<String> {
    let title = match table {
        HitTable::Live => "SIA-Scout Live Threat Report",
        HitTable::History => "SIA-Scout Historical Threat Report",
    };

    let total = store.count_hits(table).await?;
    let mut report = format!(
        "=================================================\n\
         {:^49}\n\
         =================================================\n\n",
        title
    );

    if total == 0 {
        report.push_str("No data available. Run a collection first.\n");
        return Ok(report);
    }

    let unique_ips = store.count_unique_ips(table).await?;
    report.push_str(&format!("Total Listings Found: {}\n", total));
    report.push_str(&format!("Unique Listed IPs:    {}\n\n", unique_ips));

    count_section(
        "Top 10 Threat Detections",
        "Detection",
        &store.top_counts(table, "detection", None, TOP_N).await?,
        &mut report,
    );
    count_section(
        "Top 10 Botnet Families",
        "Botname",
        &store.top_counts(table, "botname", None, TOP_N).await?,
        &mut report,
    );
    count_section(
        "Top 10 C2 / Malicious Domains (XBL)",
        "Domain",
        &store
            .top_counts(table, "domain", Some("dataset = 'XBL'"), TOP_N)
            .await?,
        &mut report,
    );
    count_section(
        "Top 10 Detection Heuristics",
        "Heuristic",
        &store.top_counts(table, "heuristic", None, TOP_N).await?,
        &mut report,
    );
    count_section(
        "Top 10 Noisiest ASNs",
        "ASN",
        &store.top_counts(table, "asn", None, TOP_N).await?,
        &mut report,
    );

    report.push_str("================= End of Report =================\n");
    Ok(report)
}
