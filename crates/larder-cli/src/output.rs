use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use larder_core::models::{BatchRunStats, ExtractionResult};

/// Read a URL list: one per line, blank lines and `#` comments ignored.
pub fn read_url_list(path: &Path) -> Result<Vec<String>> {
    let file =
        File::open(path).with_context(|| format!("Failed to open URL list: {}", path.display()))?;
    let mut urls = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.with_context(|| format!("Failed to read {}", path.display()))?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        urls.push(line.to_string());
    }
    Ok(urls)
}

/// One JSON record per line.
pub fn write_ndjson(path: &Path, results: &[ExtractionResult]) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("Failed to create output file: {}", path.display()))?;
    let mut out = BufWriter::new(file);
    for result in results {
        serde_json::to_writer(&mut out, result)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(())
}

pub fn write_report(path: &Path, stats: &BatchRunStats) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("Failed to create report file: {}", path.display()))?;
    let mut out = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut out, &stats.report())?;
    out.flush()?;
    Ok(())
}

/// `url,kind,error` rows for every failed task.
pub fn write_errors_csv(path: &Path, stats: &BatchRunStats) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create CSV file: {}", path.display()))?;
    writer.write_record(["url", "kind", "error"])?;
    for error in &stats.errors {
        writer.write_record([&error.url, &error.kind, &error.error])?;
    }
    writer.flush()?;
    Ok(())
}
