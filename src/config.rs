/// file: src/config.rs
/// description: runtime configuration assembled from CLI arguments
use crate::{
    cli::Args,
    consumer::ScrollWindow,
    formatter::OutputFormat,
    selection::ROW_HEIGHT,
    sim::SimulatorConfig,
    types::{MarketDataSpec, SourceDescriptor},
};
use anyhow::{Context, Result, bail};
use std::time::Duration;
use tracing::Level;

#[derive(Debug, Clone)]
pub struct Config {
    pub source: SourceDescriptor,
    pub viewport: ViewportConfig,
    pub simulator: SimulatorConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Copy)]
pub struct LoggingConfig {
    pub level: Level,
    pub json: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct ViewportConfig {
    pub top_row: u32,
    pub visible_rows: u32,
    pub width: u32,
    pub sparklines: bool,
}

impl ViewportConfig {
    pub fn window(&self) -> ScrollWindow {
        ScrollWindow {
            top: self.top_row as f64 * ROW_HEIGHT,
            left: 0.0,
            width: self.width as f64,
            height: self.visible_rows as f64 * ROW_HEIGHT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct OutputConfig {
    pub format: OutputFormat,
    pub colored: bool,
    pub quiet: bool,
    pub max_batches: Option<u64>,
    pub copy: Option<CopyRange>,
}

/// Inclusive cell range in display rows and absolute columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyRange {
    pub start: (u32, u32),
    pub end: (u32, u32),
}

impl std::str::FromStr for CopyRange {
    type Err = anyhow::Error;

    /// `row:col` for one cell, `row:col-row:col` for a rectangle.
    fn from_str(s: &str) -> Result<Self> {
        let cell = |text: &str| -> Result<(u32, u32)> {
            let Some((row, col)) = text.trim().split_once(':') else {
                bail!("expected row:col, got '{text}'");
            };
            Ok((
                row.parse().with_context(|| format!("bad row in '{text}'"))?,
                col.parse().with_context(|| format!("bad column in '{text}'"))?,
            ))
        };
        match s.split_once('-') {
            Some((start, end)) => Ok(CopyRange {
                start: cell(start)?,
                end: cell(end)?,
            }),
            None => {
                let start = cell(s)?;
                Ok(CopyRange { start, end: start })
            }
        }
    }
}

impl Config {
    pub fn from_args(args: &Args) -> Result<Self> {
        if args.visible_rows == 0 {
            bail!("--visible-rows must be at least 1");
        }
        let copy = args
            .copy
            .as_deref()
            .map(str::parse::<CopyRange>)
            .transpose()
            .context("invalid --copy range")?;
        let level = args
            .log_level
            .parse::<Level>()
            .with_context(|| format!("invalid --log-level '{}'", args.log_level))?;

        Ok(Config {
            source: SourceDescriptor {
                view_id: args.view_id.clone(),
                view_definition: Some(args.view.clone()),
                aggregators: args.aggregators.clone(),
                market_data: vec![MarketDataSpec::Live {
                    source: args.market_data.clone(),
                }],
                grid_type: args.grid_type,
                ..Default::default()
            },
            viewport: ViewportConfig {
                top_row: args.top_row,
                visible_rows: args.visible_rows,
                width: args.width,
                sparklines: args.sparklines,
            },
            simulator: SimulatorConfig {
                tick: Duration::from_millis(args.tick_ms.max(1)),
                rows: args.sim_rows,
                latency: Duration::from_millis(args.latency_ms),
                auto_run: true,
            },
            logging: LoggingConfig {
                level,
                json: args.json_logs,
            },
            metrics: MetricsConfig {
                enabled: args.metrics,
                port: args.metrics_port,
            },
            output: OutputConfig {
                format: OutputFormat::from(args.format.as_str()),
                colored: !args.no_color,
                quiet: args.quiet,
                max_batches: (args.max_batches > 0).then_some(args.max_batches),
                copy,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn defaults_build_a_live_source() {
        let args = Args::parse_from(["analytics-gridsync"]);
        let config = Config::from_args(&args).unwrap();
        assert_eq!(config.source.view_definition.as_deref(), Some("Equity View"));
        assert_eq!(config.source.grid_type, None);
        assert_eq!(config.output.format, OutputFormat::Table);
        assert_eq!(config.output.max_batches, None);
        assert_eq!(config.viewport.window().height, 10.0 * ROW_HEIGHT);
        assert_eq!(config.logging.level, Level::INFO);
    }

    #[test]
    fn rejects_unknown_log_level() {
        let args = Args::parse_from(["analytics-gridsync", "--log-level", "loud"]);
        assert!(Config::from_args(&args).is_err());
        let args = Args::parse_from(["analytics-gridsync", "--log-level", "warn", "--json-logs"]);
        let logging = Config::from_args(&args).unwrap().logging;
        assert_eq!(logging.level, Level::WARN);
        assert!(logging.json);
    }

    #[test]
    fn parses_grid_type_and_aggregators() {
        let args = Args::parse_from([
            "analytics-gridsync",
            "--grid-type",
            "primitives",
            "--aggregators",
            "Currency,Sector",
            "--max-batches",
            "3",
        ]);
        let config = Config::from_args(&args).unwrap();
        assert_eq!(config.source.grid_type, Some(crate::types::GridType::Primitives));
        assert_eq!(config.source.aggregators, vec!["Currency", "Sector"]);
        assert_eq!(config.output.max_batches, Some(3));
    }

    #[test]
    fn copy_ranges() {
        assert_eq!(
            "2:3".parse::<CopyRange>().unwrap(),
            CopyRange {
                start: (2, 3),
                end: (2, 3)
            }
        );
        assert_eq!(
            "0:1-4:2".parse::<CopyRange>().unwrap(),
            CopyRange {
                start: (0, 1),
                end: (4, 2)
            }
        );
        assert!("4".parse::<CopyRange>().is_err());
        assert!("a:1".parse::<CopyRange>().is_err());

        let args = Args::parse_from(["analytics-gridsync", "--copy", "x"]);
        assert!(Config::from_args(&args).is_err());
    }
}
