/// file: src/ui.rs
/// description: terminal presentation of the events a grid's Data instance fires
use crate::{
    consumer::{GridChange, GridView, ScrollWindow},
    data::DataHandle,
    events::{DataEvent, EventReceiver},
    formatter::{BatchFormatter, Colors, OutputFormat},
};
use tracing::{debug, info};

pub struct UIOptions {
    pub colored: bool,
    pub quiet: bool,
    pub max_batches: Option<u64>,
    pub window: ScrollWindow,
    pub sparklines: bool,
}

/// Feeds events into a `GridView`, keeps the data's viewport matched to the
/// window after every layout change, and prints what arrives.
pub struct UIController {
    event_receiver: EventReceiver<DataEvent>,
    data: DataHandle,
    grid: GridView,
    formatter: BatchFormatter,
    options: UIOptions,
    header_printed: bool,
}

impl UIController {
    pub fn new(
        event_receiver: EventReceiver<DataEvent>,
        data: DataHandle,
        format: OutputFormat,
        options: UIOptions,
    ) -> Self {
        Self {
            event_receiver,
            data,
            grid: GridView::new(),
            formatter: BatchFormatter::new(format, options.colored, options.quiet),
            options,
            header_printed: false,
        }
    }

    pub fn grid(&self) -> &GridView {
        &self.grid
    }

    pub fn formatter(&self) -> &BatchFormatter {
        &self.formatter
    }

    /// Handles the next event. Returns false once the stream ended, a fatal
    /// error arrived, or the batch limit was reached.
    pub async fn next(&mut self) -> bool {
        match self.event_receiver.recv().await {
            Some(event) => self.handle_event(event),
            None => false,
        }
    }

    fn handle_event(&mut self, event: DataEvent) -> bool {
        let change = self.grid.apply(&event);
        match (change, &event) {
            (GridChange::Layout, DataEvent::Meta { meta, connection }) => {
                self.formatter.print_meta(meta, &connection.view_id);
                let viewport =
                    self.grid.viewport_for(&self.options.window, self.options.sparklines);
                match &viewport {
                    Some(viewport) => info!(
                        rows = viewport.rows.len(),
                        cols = viewport.cols.len(),
                        "requesting viewport"
                    ),
                    None => info!("nothing visible, clearing viewport"),
                }
                self.data.viewport(viewport);
            }
            (GridChange::Connection, DataEvent::Meta { connection, .. }) => {
                debug!(view_id = %connection.view_id, "connection refreshed");
            }
            (GridChange::Cells(_), DataEvent::Data(batch)) => {
                if !self.header_printed {
                    self.formatter.print_header();
                    self.header_printed = true;
                }
                self.formatter.print_batch(batch, self.grid.meta().map(|m| m.as_ref()));

                if let Some(max_batches) = self.options.max_batches
                    && self.formatter.batch_count() >= max_batches
                {
                    let reason = format!("Reached configured max batches ({max_batches})");
                    self.formatter.print_status("STOPPING", &reason);
                    return false;
                }
            }
            (GridChange::Cycle(duration_ms), _) => {
                debug!(duration_ms, "calculation cycle");
            }
            (GridChange::Types { portfolio, primitives }, _) => {
                self.formatter.print_status(
                    "LISTENING",
                    &format!("grid types available: portfolio={portfolio} primitives={primitives}"),
                );
            }
            (GridChange::Failed(message), _) => {
                self.print_error("FATAL", &message);
                return false;
            }
            (GridChange::Disconnected, _) => {
                self.formatter.print_status("ERROR", "transport lost, waiting for reconnect");
            }
            (GridChange::Ignored, _) => {}
            (change, event) => debug!(?change, event = event.name(), "unhandled grid change"),
        }
        true
    }

    pub fn print_startup_banner(&self) {
        if self.options.quiet {
            return;
        }

        let (bold, cyan, reset) = if self.options.colored {
            (Colors::BOLD, Colors::BRIGHT_CYAN, Colors::RESET)
        } else {
            ("", "", "")
        };
        println!();
        println!("{bold}{cyan}╔══════════════════════════════════════════════════════════════════════════════╗{reset}");
        println!("{bold}{cyan}║                        ANALYTICS GRID SYNC CLIENT                            ║{reset}");
        println!("{bold}{cyan}╠══════════════════════════════════════════════════════════════════════════════╣{reset}");
        println!(
            "{bold}{cyan}║{reset} Version: {:<8} │ Data: {:<8} │ Window: {:>3} rows x {:>5}px                 {bold}{cyan}║{reset}",
            env!("CARGO_PKG_VERSION"),
            self.data.label(),
            (self.options.window.height / crate::selection::ROW_HEIGHT).round() as u32,
            self.options.window.width as u32,
        );
        println!("{bold}{cyan}╚══════════════════════════════════════════════════════════════════════════════╝{reset}");
        println!();
    }

    fn print_error(&self, error_type: &str, message: &str) {
        if self.options.colored {
            println!(
                "{}{}[{}]{} ! {}{}{}",
                Colors::BOLD,
                Colors::BRIGHT_RED,
                error_type,
                Colors::RESET,
                Colors::BRIGHT_RED,
                message,
                Colors::RESET
            );
        } else {
            println!("[{error_type}] ! {message}");
        }
    }
}
