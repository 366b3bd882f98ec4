use analytics_gridsync::{
    bus::LocalBus,
    cli::Args,
    clipboard::Clipboard,
    config::{Config, CopyRange},
    consumer::GridView,
    data::{Data, DataContext, DataOptions},
    monitoring::setup_metrics,
    selection::{Point, ROW_HEIGHT, Selection},
    sim::SimulatedServer,
    tracing_setup::setup_tracing,
    types::SourceDescriptor,
    ui::{UIController, UIOptions},
};
use anyhow::{Context, Result};
use clap::Parser;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::time::timeout;
use tracing::{error, info, warn};

const COPY_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::from_args(&args)?;

    // Setup tracing/logging
    setup_tracing(&config.logging)?;

    info!("Starting analytics grid sync v{}", env!("CARGO_PKG_VERSION"));

    // Setup metrics server if enabled
    if config.metrics.enabled {
        setup_metrics(config.metrics.port).await?;
        info!("Metrics server started on port {}", config.metrics.port);
    }

    let bus = Arc::new(LocalBus::new());
    let server = SimulatedServer::new(bus.clone(), config.simulator.clone());
    let server_task = server.start();
    let context = DataContext::new(server.clone(), bus.clone());

    let grid = Data::spawn(
        config.source.clone(),
        DataOptions {
            bypass: false,
            label: "grid".to_string(),
        },
        &context,
    );
    let (_, events) = grid.on();
    let mut ui = UIController::new(
        events,
        grid.clone(),
        config.output.format,
        UIOptions {
            colored: config.output.colored,
            quiet: config.output.quiet,
            max_batches: config.output.max_batches,
            window: config.viewport.window(),
            sparklines: config.viewport.sparklines,
        },
    );
    ui.print_startup_banner();

    let started = Instant::now();
    let mut pending_copy = config.output.copy;
    let mut copy_task = None;
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!("Client started. Press Ctrl+C to shutdown...");
    loop {
        tokio::select! {
            running = ui.next() => {
                if !running {
                    break;
                }
                // copy once the grid shows data, so the range maps onto a real layout
                if let Some(range) = pending_copy
                    && ui.grid().cell_count() > 0
                {
                    pending_copy = None;
                    match copy_request(ui.grid(), range, grid.source()) {
                        Some((selection, source)) => {
                            let task = copy(selection, source, context.clone());
                            copy_task = Some(tokio::spawn(task));
                        }
                        None => warn!(?range, "copy range is outside the grid"),
                    }
                }
            }
            _ = &mut shutdown => {
                info!("Ctrl+C received, shutting down");
                break;
            }
        }
    }

    if let Some(task) = copy_task {
        match task.await {
            Ok(Ok(text)) => println!("[COPIED]\n{text}"),
            Ok(Err(e)) => error!("clipboard copy failed: {e:#}"),
            Err(e) => error!("clipboard task failed: {e}"),
        }
    }

    if let Err(e) = grid.disconnect() {
        warn!("grid already closed: {e}");
    }
    context.shutdown();
    server_task.abort();

    ui.formatter().print_summary(started.elapsed().as_secs());
    info!("Client stopped successfully");
    Ok(())
}

/// Selection for `range` (display rows, absolute columns) on the grid's current
/// layout, plus the source the clipboard attaches with.
fn copy_request(
    grid: &GridView,
    range: CopyRange,
    source: &SourceDescriptor,
) -> Option<(Selection, SourceDescriptor)> {
    let connection = grid.connection()?;
    let point = |(row, col): (u32, u32)| Point {
        x: grid.geometry().left(col as usize) + 1.0,
        y: row as f64 * ROW_HEIGHT + 1.0,
    };
    let (selection, regions) = grid.selection_for(point(range.start), point(range.end))?;
    info!(
        rows = selection.rows.len(),
        cols = selection.cols.len(),
        regions = regions.len(),
        "copying selection"
    );
    Some((selection, source.for_connection(connection)))
}

async fn copy(
    selection: Selection,
    source: SourceDescriptor,
    context: DataContext,
) -> Result<String> {
    let clipboard = Clipboard::new(source, &context);
    clipboard.select(&selection);
    let mut text = clipboard.watch_text();
    let copied = timeout(COPY_TIMEOUT, text.wait_for(Option::is_some))
        .await
        .context("no clipboard data in time")?
        .context("clipboard closed before data arrived")?
        .clone()
        .unwrap_or_default();
    clipboard.disconnect()?;
    Ok(copied)
}
