use crate::types::{CellBatch, CellValue, Meta, ValueType};
use serde_json::Value;
use std::collections::HashMap;

// ANSI color codes
pub struct Colors;

impl Colors {
    pub const RESET: &'static str = "\x1b[0m";
    pub const BOLD: &'static str = "\x1b[1m";
    pub const DIM: &'static str = "\x1b[2m";

    pub const WHITE: &'static str = "\x1b[37m";
    pub const GRAY: &'static str = "\x1b[90m";

    // Bright colors
    pub const BRIGHT_RED: &'static str = "\x1b[91m";
    pub const BRIGHT_GREEN: &'static str = "\x1b[92m";
    pub const BRIGHT_YELLOW: &'static str = "\x1b[93m";
    pub const BRIGHT_BLUE: &'static str = "\x1b[94m";
    pub const BRIGHT_CYAN: &'static str = "\x1b[96m";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Csv,
    Json,
    Minimal,
}

impl From<&str> for OutputFormat {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "csv" => OutputFormat::Csv,
            "json" => OutputFormat::Json,
            "minimal" => OutputFormat::Minimal,
            _ => OutputFormat::Table,
        }
    }
}

/// Plain-text rendering of one cell for the clipboard.
///
/// Summaries (cell-mode values) are already strings and pass through. Expanded
/// values are laid out as tab/newline tables so they paste into a spreadsheet.
pub fn clipboard_value(value: &CellValue) -> String {
    if let Value::String(text) = &value.v {
        return text.clone();
    }
    let v = &value.v;
    match value.t {
        Some(ValueType::Matrix2d) | Some(ValueType::Curve) => rows_to_text(v.as_array()),
        Some(ValueType::LabelledMatrix1d) => {
            let mut lines = Vec::new();
            if let Some(labels) = v.get("labels").and_then(Value::as_array) {
                lines.push(join_scalars(labels));
            }
            lines.push(rows_to_text(v.get("data").and_then(Value::as_array)));
            lines.join("\n")
        }
        Some(ValueType::LabelledMatrix2d) | Some(ValueType::SurfaceData) => labelled_matrix(v),
        Some(ValueType::TimeSeries) => {
            let index = v.get("index").and_then(Value::as_array);
            let data = v.get("data").and_then(Value::as_array);
            match (index, data) {
                (Some(index), Some(data)) => index
                    .iter()
                    .zip(data)
                    .map(|(at, value)| format!("{}\t{}", scalar(at), scalar(value)))
                    .collect::<Vec<_>>()
                    .join("\n"),
                _ => v.to_string(),
            }
        }
        _ => scalar(v),
    }
}

fn scalar(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        Value::Number(_) | Value::Bool(_) => value.to_string(),
        other => other.to_string(),
    }
}

fn join_scalars(values: &[Value]) -> String {
    values.iter().map(scalar).collect::<Vec<_>>().join("\t")
}

fn rows_to_text(rows: Option<&Vec<Value>>) -> String {
    rows.map(|rows| {
        rows.iter()
            .map(|row| match row.as_array() {
                Some(cells) => join_scalars(cells),
                None => scalar(row),
            })
            .collect::<Vec<_>>()
            .join("\n")
    })
    .unwrap_or_default()
}

fn labelled_matrix(v: &Value) -> String {
    let x_labels = v.get("xLabels").and_then(Value::as_array);
    let y_labels = v.get("yLabels").and_then(Value::as_array);
    let matrix = v.get("matrix").and_then(Value::as_array);
    let (Some(x_labels), Some(y_labels), Some(matrix)) = (x_labels, y_labels, matrix) else {
        return v.to_string();
    };
    let mut lines = vec![format!("\t{}", join_scalars(x_labels))];
    for (label, row) in y_labels.iter().zip(matrix) {
        let cells = row.as_array().map(|cells| join_scalars(cells)).unwrap_or_default();
        lines.push(format!("{}\t{}", scalar(label), cells));
    }
    lines.join("\n")
}

/// Tab/newline text for the rectangle `rows` x `cols`. Missing cells become
/// empty fields so the pasted shape always matches the selection.
pub fn clipboard_text(
    rows: &[u32],
    cols: &[u32],
    cells: &HashMap<(u32, u32), CellValue>,
) -> String {
    if let ([row], [col]) = (rows, cols) {
        return cells.get(&(*row, *col)).map(clipboard_value).unwrap_or_default();
    }
    rows.iter()
        .map(|row| {
            cols.iter()
                .map(|col| {
                    cells
                        .get(&(*row, *col))
                        .map(|value| clipboard_value(value).replace(['\n', '\t'], " "))
                        .unwrap_or_default()
                })
                .collect::<Vec<_>>()
                .join("\t")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Short single-line rendering for the terminal.
pub fn summary(value: &CellValue) -> String {
    match &value.v {
        Value::Number(number) => match number.as_f64() {
            Some(amount) => format!("{amount:.2}"),
            None => number.to_string(),
        },
        Value::String(text) => text.clone(),
        Value::Null => "-".to_string(),
        other => {
            let text = other.to_string();
            if text.chars().count() > 24 {
                format!("{}...", text.chars().take(21).collect::<String>())
            } else {
                text
            }
        }
    }
}

pub struct BatchFormatter {
    format: OutputFormat,
    colored: bool,
    quiet: bool,
    batch_count: u64,
    cell_count: u64,
}

impl BatchFormatter {
    pub fn new(format: OutputFormat, colored: bool, quiet: bool) -> Self {
        Self {
            format,
            colored,
            quiet,
            batch_count: 0,
            cell_count: 0,
        }
    }

    pub fn batch_count(&self) -> u64 {
        self.batch_count
    }

    pub fn cell_count(&self) -> u64 {
        self.cell_count
    }

    pub fn print_header(&self) {
        if self.quiet {
            return;
        }

        match self.format {
            OutputFormat::Table => {
                let gray = if self.colored { Colors::GRAY } else { "" };
                let reset = if self.colored { Colors::RESET } else { "" };
                println!("{gray}┌────────┬───────┬──────────────────┬──────────────────┬─────────────────────┐{reset}");
                println!(
                    "{gray}│{reset} {:<6} {gray}│{reset} {:<5} {gray}│{reset} {:<16} {gray}│{reset} {:<16} {gray}│{reset} {:<19} {gray}│{reset}",
                    "BATCH", "ROW", "COLUMN", "VALUE", "TYPE"
                );
                println!("{gray}├────────┼───────┼──────────────────┼──────────────────┼─────────────────────┤{reset}");
            }
            OutputFormat::Csv => println!("batch,version,row,col,column,value,type"),
            OutputFormat::Json => {}    // JSON doesn't need headers
            OutputFormat::Minimal => {} // Minimal doesn't need headers
        }
    }

    /// Lines for one batch, in cell order.
    pub fn format_batch(&mut self, batch: &CellBatch, meta: Option<&Meta>) -> Vec<String> {
        self.batch_count += 1;
        self.cell_count += batch.cells.len() as u64;
        let header = |col: u32| {
            meta.and_then(|meta| meta.columns.column(col as usize))
                .map(|column| column.header.clone())
                .unwrap_or_else(|| format!("col {col}"))
        };

        batch
            .cells
            .iter()
            .map(|cell| {
                let value = summary(&cell.value);
                let type_name = cell.value.t.map(|t| format!("{t:?}")).unwrap_or_default();
                match self.format {
                    OutputFormat::Table => {
                        let gray = if self.colored { Colors::GRAY } else { "" };
                        let reset = if self.colored { Colors::RESET } else { "" };
                        let tint = self.value_color(&cell.value);
                        format!(
                            "{gray}│{reset} {:<6} {gray}│{reset} {:<5} {gray}│{reset} {:<16.16} {gray}│{reset} {tint}{:>16.16}{reset} {gray}│{reset} {:<19} {gray}│{reset}",
                            self.batch_count,
                            cell.row,
                            header(cell.col),
                            value,
                            type_name
                        )
                    }
                    OutputFormat::Csv => format!(
                        "{},{},{},{},{},{},{}",
                        self.batch_count,
                        batch.version,
                        cell.row,
                        cell.col,
                        header(cell.col),
                        value.replace(',', " "),
                        type_name
                    ),
                    OutputFormat::Json => {
                        let json_obj = serde_json::json!({
                            "batch": self.batch_count,
                            "viewport_id": batch.viewport_id,
                            "version": batch.version,
                            "row": cell.row,
                            "col": cell.col,
                            "column": header(cell.col),
                            "value": cell.value.v,
                            "type": type_name,
                            "timestamp": batch.timestamp.to_rfc3339(),
                        });
                        serde_json::to_string(&json_obj).unwrap_or_default()
                    }
                    OutputFormat::Minimal => format!(
                        "{} r{}c{} {}",
                        batch.timestamp.with_timezone(&chrono::Local).format("%H:%M:%S"),
                        cell.row,
                        cell.col,
                        value
                    ),
                }
            })
            .collect()
    }

    pub fn print_batch(&mut self, batch: &CellBatch, meta: Option<&Meta>) {
        let lines = self.format_batch(batch, meta);
        if self.quiet {
            return;
        }
        for line in lines {
            println!("{line}");
        }
    }

    fn value_color(&self, value: &CellValue) -> &'static str {
        if !self.colored {
            return "";
        }
        match value.v.as_f64() {
            Some(amount) if amount < 0.0 => Colors::BRIGHT_RED,
            Some(_) => Colors::BRIGHT_GREEN,
            None => Colors::WHITE,
        }
    }

    pub fn print_meta(&self, meta: &Meta, view_id: &str) {
        if self.quiet {
            return;
        }
        let headers: Vec<&str> = meta.columns.columns().map(|c| c.header.as_str()).collect();
        if self.colored {
            println!(
                "{}{}[META]{} {} {} grid | view {}{}{} | {} rows | {} fixed + {} scroll columns",
                Colors::BOLD,
                Colors::BRIGHT_BLUE,
                Colors::RESET,
                meta.grid_type.as_str(),
                if meta.depgraph { "depgraph" } else { "main" },
                Colors::BRIGHT_YELLOW,
                view_id,
                Colors::RESET,
                meta.data_rows,
                meta.columns.fixed_length(),
                meta.columns.scroll_length()
            );
            println!("  {}{}{}", Colors::DIM, headers.join(" | "), Colors::RESET);
        } else {
            println!(
                "[META] {} {} grid | view {} | {} rows | {} fixed + {} scroll columns",
                meta.grid_type.as_str(),
                if meta.depgraph { "depgraph" } else { "main" },
                view_id,
                meta.data_rows,
                meta.columns.fixed_length(),
                meta.columns.scroll_length()
            );
            println!("  {}", headers.join(" | "));
        }
    }

    pub fn print_status(&self, status: &str, message: &str) {
        if self.quiet && status != "ERROR" {
            return;
        }

        let (color, symbol) = if self.colored {
            match status {
                "CONNECTING" => (Colors::BRIGHT_YELLOW, "⚡"),
                "CONNECTED" => (Colors::BRIGHT_GREEN, "✓"),
                "LISTENING" => (Colors::BRIGHT_BLUE, "📡"),
                "ERROR" => (Colors::BRIGHT_RED, "❌"),
                _ => (Colors::WHITE, "•"),
            }
        } else {
            (
                "",
                match status {
                    "CONNECTING" => "*",
                    "CONNECTED" => "+",
                    "LISTENING" => "~",
                    "ERROR" => "!",
                    _ => "-",
                },
            )
        };

        let reset = if self.colored { Colors::RESET } else { "" };

        println!("{color}[{status}]{reset} {symbol} {message}");
    }

    pub fn print_summary(&self, duration_secs: u64) {
        if self.quiet {
            return;
        }

        let rate = if duration_secs > 0 {
            self.batch_count as f64 / duration_secs as f64
        } else {
            0.0
        };

        println!();
        if self.colored {
            println!(
                "{}{}Summary: {} batches ({} cells) in {}s ({:.2} batches/sec){}",
                Colors::BOLD,
                Colors::BRIGHT_CYAN,
                self.batch_count,
                self.cell_count,
                duration_secs,
                rate,
                Colors::RESET
            );
        } else {
            println!(
                "Summary: {} batches ({} cells) in {}s ({:.2} batches/sec)",
                self.batch_count, self.cell_count, duration_secs, rate
            );
        }
    }
}
