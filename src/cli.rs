use crate::types::GridType;
use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "analytics-gridsync",
    about = "viewport synchronisation client for a streaming risk analytics grid, backed by an in-process simulated server",
    version
)]
pub struct Args {
    /// View definition to compute (e.g. "Equity View")
    #[arg(short, long, default_value = "Equity View")]
    pub view: String,

    /// Attach to an existing view id instead of creating one
    #[arg(long)]
    pub view_id: Option<String>,

    /// Grid type (portfolio, primitives); resolved from the server when omitted
    #[arg(short, long)]
    pub grid_type: Option<GridType>,

    /// Aggregators applied to the portfolio, comma separated
    #[arg(short, long, value_delimiter = ',')]
    pub aggregators: Vec<String>,

    /// Live market data source
    #[arg(long, default_value = "Bloomberg")]
    pub market_data: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Output logs in JSON format
    #[arg(long)]
    pub json_logs: bool,

    /// Enable metrics server
    #[arg(long)]
    pub metrics: bool,

    /// Metrics server port
    #[arg(long, default_value = "9090")]
    pub metrics_port: u16,

    /// First visible row (scroll offset in rows)
    #[arg(long, default_value = "0")]
    pub top_row: u32,

    /// Number of visible rows
    #[arg(long, default_value = "10")]
    pub visible_rows: u32,

    /// Visible width of the scrolling pane in pixels
    #[arg(long, default_value = "600")]
    pub width: u32,

    /// Request sparkline history with every value
    #[arg(long)]
    pub sparklines: bool,

    /// Rows in the simulated portfolio
    #[arg(long, default_value = "40")]
    pub sim_rows: u32,

    /// Simulated calculation cycle in milliseconds
    #[arg(long, default_value = "500")]
    pub tick_ms: u64,

    /// Simulated API latency in milliseconds
    #[arg(long, default_value = "0")]
    pub latency_ms: u64,

    /// Copy a cell range through the clipboard once data arrives (e.g. "1:2" or "0:1-4:3")
    #[arg(long)]
    pub copy: Option<String>,

    /// Output format: table, csv, json, minimal
    #[arg(long, default_value = "table")]
    pub format: String,

    /// Disable colored output (useful for piping to files)
    #[arg(long)]
    pub no_color: bool,

    /// Quiet mode - minimal output
    #[arg(long)]
    pub quiet: bool,

    /// Stop after this many batches (0 for unlimited)
    #[arg(long, default_value = "0")]
    pub max_batches: u64,
}
