//! Rendering a [`CostReport`] for people and spreadsheets.

use std::fmt;
use std::io::Write;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::ir::graph::TensorDesc;
use crate::report::{CostReport, LayerCostEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReportFormat {
    /// Aligned columns followed by a per-type summary
    #[default]
    Table,
    Csv,
    Markdown,
    Json,
}

impl FromStr for ReportFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "table" => Ok(ReportFormat::Table),
            "csv" => Ok(ReportFormat::Csv),
            "md" | "markdown" => Ok(ReportFormat::Markdown),
            "json" => Ok(ReportFormat::Json),
            other => Err(Error::Config(format!(
                "unknown report format '{other}' (expected table, csv, md or json)"
            ))),
        }
    }
}

impl fmt::Display for ReportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReportFormat::Table => "table",
            ReportFormat::Csv => "csv",
            ReportFormat::Markdown => "md",
            ReportFormat::Json => "json",
        })
    }
}

pub fn write_report(report: &CostReport, format: ReportFormat, out: &mut dyn Write) -> Result<()> {
    match format {
        ReportFormat::Table => write_table(report, out),
        ReportFormat::Csv => write_csv(report, out),
        ReportFormat::Markdown => write_markdown(report, out),
        ReportFormat::Json => {
            serde_json::to_writer_pretty(&mut *out, report).map_err(std::io::Error::from)?;
            writeln!(out)?;
            Ok(())
        }
    }
}

pub fn render(report: &CostReport, format: ReportFormat) -> Result<String> {
    let mut buf = Vec::new();
    write_report(report, format, &mut buf)?;
    String::from_utf8(buf).map_err(|e| Error::Config(e.to_string()))
}

/// `1x32x32x3:f32`, several joined by `;`.
fn shapes(descs: &[TensorDesc]) -> String {
    descs
        .iter()
        .map(|d| {
            let dims: Vec<String> = d.shape.iter().map(usize::to_string).collect();
            let dtype = serde_json::to_value(d.dtype)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default();
            format!("{}:{dtype}", dims.join("x"))
        })
        .collect::<Vec<_>>()
        .join(";")
}

fn row(e: &LayerCostEntry) -> [String; 5] {
    [
        e.label.clone(),
        e.flops.to_string(),
        e.mread.to_string(),
        e.mwrite.to_string(),
        shapes(&e.inputs),
    ]
}

fn cells(r: &[String; 5]) -> [&str; 5] {
    [&r[0], &r[1], &r[2], &r[3], &r[4]]
}

const HEADER: [&str; 5] = ["layer", "flops", "mread", "mwrite", "inputs"];

fn write_table(report: &CostReport, out: &mut dyn Write) -> Result<()> {
    let total = report.totals();
    let mut rows: Vec<[String; 5]> = report.entries().iter().map(row).collect();
    rows.push([
        "total".to_string(),
        total.flops.to_string(),
        total.mread.to_string(),
        total.mwrite.to_string(),
        String::new(),
    ]);

    let mut widths = HEADER.map(str::len);
    for r in &rows {
        for (w, cell) in widths.iter_mut().zip(r) {
            *w = (*w).max(cell.len());
        }
    }

    let line = |out: &mut dyn Write, cells: [&str; 5]| -> std::io::Result<()> {
        writeln!(
            out,
            "{:<w0$}  {:>w1$}  {:>w2$}  {:>w3$}  {}",
            cells[0],
            cells[1],
            cells[2],
            cells[3],
            cells[4],
            w0 = widths[0],
            w1 = widths[1],
            w2 = widths[2],
            w3 = widths[3],
        )
    };

    line(&mut *out, HEADER)?;
    let rule = widths.iter().sum::<usize>() + 2 * (widths.len() - 1);
    if let Some((total_row, body)) = rows.split_last() {
        for r in body {
            line(&mut *out, cells(r))?;
        }
        writeln!(out, "{}", "-".repeat(rule))?;
        line(&mut *out, cells(total_row))?;
    }

    let summary = report.summary();
    if !summary.is_empty() {
        writeln!(out)?;
        writeln!(out, "by op type:")?;
        for s in summary {
            writeln!(
                out,
                "  {} x{}: flops={} mread={} mwrite={}",
                s.op_type, s.count, s.flops, s.mread, s.mwrite
            )?;
        }
    }
    Ok(())
}

fn csv_field(s: &str) -> String {
    if s.contains([',', '"', '\n']) {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

fn write_csv(report: &CostReport, out: &mut dyn Write) -> Result<()> {
    writeln!(out, "label,op_type,occurrence,flops,mread,mwrite,inputs,outputs")?;
    for e in report.entries() {
        writeln!(
            out,
            "{},{},{},{},{},{},{},{}",
            csv_field(&e.label),
            csv_field(e.op_type.as_str()),
            e.occurrence,
            e.flops,
            e.mread,
            e.mwrite,
            csv_field(&shapes(&e.inputs)),
            csv_field(&shapes(&e.outputs)),
        )?;
    }
    Ok(())
}

fn md_cell(s: &str) -> String {
    s.replace('|', "\\|")
}

fn write_markdown(report: &CostReport, out: &mut dyn Write) -> Result<()> {
    writeln!(out, "| layer | flops | mread | mwrite | inputs |")?;
    writeln!(out, "|---|---:|---:|---:|---|")?;
    for e in report.entries() {
        let [label, flops, mread, mwrite, inputs] = row(e);
        writeln!(
            out,
            "| {} | {flops} | {mread} | {mwrite} | {} |",
            md_cell(&label),
            md_cell(&inputs)
        )?;
    }
    let t = report.totals();
    writeln!(out, "| **total** | {} | {} | {} | |", t.flops, t.mread, t.mwrite)?;
    Ok(())
}
