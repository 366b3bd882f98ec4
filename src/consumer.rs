/// file: src/consumer.rs
/// description: consumer-side grid state built only from the events a Data instance fires
use crate::{
    events::DataEvent,
    selection::{ColumnGeometry, Point, ROW_HEIGHT, Region, Selection, select},
    types::{CellBatch, CellValue, Connection, Meta, Viewport},
};
use std::{collections::HashMap, sync::Arc};
use tracing::{debug, warn};

const MAX_ROW_BUFFER: usize = 20;
const COL_BUFFER: usize = 3;

/// Extra rows and columns requested around the visible window so small scrolls
/// render from cache. Sparkline grids keep history per cell, so they get none.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Buffers {
    pub rows: usize,
    pub cols: usize,
}

impl Buffers {
    pub fn new(visible_rows: usize, sparklines: bool) -> Self {
        if sparklines {
            Self { rows: 0, cols: 0 }
        } else {
            Self {
                rows: visible_rows.min(MAX_ROW_BUFFER),
                cols: COL_BUFFER,
            }
        }
    }
}

/// The scrolling pane's offset and visible size in pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ScrollWindow {
    pub top: f64,
    pub left: f64,
    pub width: f64,
    pub height: f64,
}

/// What one applied event changed.
#[derive(Debug, Clone, PartialEq)]
pub enum GridChange {
    /// Row count or column layout changed; cached cells were dropped.
    Layout,
    /// Meta arrived with the same layout.
    Connection,
    Cells(usize),
    Cycle(u64),
    Types { portfolio: bool, primitives: bool },
    Failed(String),
    Disconnected,
    /// Data that arrived before any meta.
    Ignored,
}

/// A grid consumer's picture of the data: meta is the only source of rows and
/// columns, and cells are keyed by data row and absolute column.
#[derive(Debug, Default)]
pub struct GridView {
    meta: Option<Arc<Meta>>,
    connection: Option<Connection>,
    available: Vec<u32>,
    geometry: ColumnGeometry,
    cells: HashMap<(u32, u32), CellValue>,
    types: Option<(bool, bool)>,
    last_cycle_ms: Option<u64>,
    fatal: Option<String>,
    disconnected: bool,
    ignored: u64,
}

impl GridView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, event: &DataEvent) -> GridChange {
        match event {
            DataEvent::Meta { meta, connection } => {
                self.apply_meta(meta.clone(), connection.clone())
            }
            DataEvent::Data(batch) => self.apply_batch(batch),
            DataEvent::Cycle { duration_ms } => {
                self.last_cycle_ms = Some(*duration_ms);
                GridChange::Cycle(*duration_ms)
            }
            DataEvent::Types {
                portfolio,
                primitives,
            } => {
                self.types = Some((*portfolio, *primitives));
                GridChange::Types {
                    portfolio: *portfolio,
                    primitives: *primitives,
                }
            }
            DataEvent::Fatal(message) => {
                self.fatal = Some(message.clone());
                GridChange::Failed(message.clone())
            }
            DataEvent::Disconnect => {
                self.disconnected = true;
                GridChange::Disconnected
            }
        }
    }

    fn apply_meta(&mut self, meta: Arc<Meta>, connection: Connection) -> GridChange {
        self.connection = Some(connection);
        self.disconnected = false;
        let same_layout = self.meta.as_ref().is_some_and(|old| {
            old.data_rows == meta.data_rows
                && old.structure == meta.structure
                && old.columns == meta.columns
        });
        if same_layout {
            self.meta = Some(meta);
            return GridChange::Connection;
        }

        debug!(rows = meta.data_rows, cols = meta.columns.len(), "grid layout changed");
        self.available = meta.available_rows();
        self.geometry = ColumnGeometry::from_layout(&meta.columns);
        self.cells.clear();
        self.meta = Some(meta);
        GridChange::Layout
    }

    fn apply_batch(&mut self, batch: &CellBatch) -> GridChange {
        let Some(meta) = &self.meta else {
            self.ignored += 1;
            warn!(viewport = %batch.viewport_id, "data before meta ignored");
            return GridChange::Ignored;
        };
        let cols = meta.columns.len() as u32;
        let rows = meta.data_rows;
        let mut applied = 0;
        for cell in batch.cells.iter().filter(|cell| cell.row < rows && cell.col < cols) {
            self.cells.insert((cell.row, cell.col), cell.value.clone());
            applied += 1;
        }
        GridChange::Cells(applied)
    }

    pub fn meta(&self) -> Option<&Arc<Meta>> {
        self.meta.as_ref()
    }

    pub fn connection(&self) -> Option<&Connection> {
        self.connection.as_ref()
    }

    pub fn data_rows(&self) -> u32 {
        self.meta.as_ref().map_or(0, |meta| meta.data_rows)
    }

    pub fn available_rows(&self) -> &[u32] {
        &self.available
    }

    pub fn geometry(&self) -> &ColumnGeometry {
        &self.geometry
    }

    pub fn cell(&self, row: u32, col: u32) -> Option<&CellValue> {
        self.cells.get(&(row, col))
    }

    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    pub fn types(&self) -> Option<(bool, bool)> {
        self.types
    }

    pub fn last_cycle_ms(&self) -> Option<u64> {
        self.last_cycle_ms
    }

    pub fn fatal(&self) -> Option<&str> {
        self.fatal.as_deref()
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }

    pub fn ignored_batches(&self) -> u64 {
        self.ignored
    }

    /// Rows that fit in `height` pixels, capped at what is available.
    pub fn visible_rows(&self, height: f64) -> usize {
        ((height.max(0.0) / ROW_HEIGHT).ceil() as usize).min(self.available.len())
    }

    /// The viewport covering `window` plus buffers: every fixed column, the
    /// scroll columns overlapping the window, and the buffered rows around it
    /// in display order. `None` until meta arrived or when nothing would show.
    pub fn viewport_for(&self, window: &ScrollWindow, sparklines: bool) -> Option<Viewport> {
        self.meta.as_ref()?;
        let visible = self.visible_rows(window.height);
        let buffers = Buffers::new(visible, sparklines);

        let row_start = (window.top.max(0.0) / ROW_HEIGHT).floor() as usize;
        let first = row_start.saturating_sub(buffers.rows).min(self.available.len());
        let last = (row_start + visible + buffers.rows).min(self.available.len());
        let rows = self.available[first..last].to_vec();

        let fixed = self.geometry.fixed_length();
        let mut cols: Vec<u32> = (0..fixed as u32).collect();
        cols.extend(
            scroll_columns(self.geometry.scroll_widths(), window.left, window.width, buffers.cols)
                .map(|index| (index + fixed) as u32),
        );

        let mut viewport = Viewport::new(rows, cols);
        viewport.log = sparklines;
        (!viewport.is_nonsensical()).then_some(viewport)
    }

    /// Selection for a drag between two content points.
    pub fn selection_for(&self, start: Point, end: Point) -> Option<(Selection, Vec<Region>)> {
        self.meta.as_ref()?;
        select(&self.geometry, &self.available, start, end)
    }
}

/// Scroll-pane column indices overlapping `[left, left + width]`, padded by
/// `buffer` columns on both sides.
fn scroll_columns(widths: &[u32], left: f64, width: f64, buffer: usize) -> std::ops::Range<usize> {
    let mut edge = 0.0;
    let mut first = None;
    let mut last = widths.len();
    for (index, w) in widths.iter().enumerate() {
        edge += *w as f64;
        if edge < left {
            continue;
        }
        first.get_or_insert(index);
        if edge > left + width {
            last = index + 1;
            break;
        }
    }
    match first {
        Some(first) => first.saturating_sub(buffer)..(last + buffer).min(widths.len()),
        None => 0..0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Column, ColumnLayout, ColumnSet, CellUpdate, GridType, ValueType};
    use chrono::Utc;
    use serde_json::json;

    fn column(header: &str, width: u32) -> Column {
        Column {
            header: header.into(),
            description: String::new(),
            value_type: Some(ValueType::Double),
            width: Some(width),
        }
    }

    fn meta(rows: u32, scroll_cols: usize) -> Arc<Meta> {
        Arc::new(Meta {
            data_rows: rows,
            structure: Vec::new(),
            columns: ColumnLayout {
                fixed: vec![ColumnSet {
                    name: "fixed".into(),
                    columns: vec![column("Position", 250)],
                }],
                scroll: vec![ColumnSet {
                    name: "Risk".into(),
                    columns: (0..scroll_cols).map(|i| column(&format!("c{i}"), 100)).collect(),
                }],
            },
            grid_type: GridType::Portfolio,
            depgraph: false,
        })
    }

    fn meta_event(meta: Arc<Meta>) -> DataEvent {
        DataEvent::Meta {
            meta,
            connection: Connection {
                view_id: "v1".into(),
                grid_type: GridType::Portfolio,
                graph_id: None,
                structure: None,
            },
        }
    }

    fn batch(cells: &[(u32, u32, f64)]) -> DataEvent {
        DataEvent::Data(Arc::new(CellBatch {
            viewport_id: "vp1".into(),
            version: 1,
            cells: cells
                .iter()
                .map(|(row, col, v)| CellUpdate {
                    row: *row,
                    col: *col,
                    value: CellValue {
                        v: json!(v),
                        t: Some(ValueType::Double),
                        h: None,
                    },
                })
                .collect(),
            timestamp: Utc::now(),
            duration_ms: 4,
        }))
    }

    #[test]
    fn data_before_meta_is_ignored() {
        let mut grid = GridView::new();
        assert_eq!(grid.apply(&batch(&[(0, 1, 1.0)])), GridChange::Ignored);
        assert_eq!(grid.ignored_batches(), 1);
        assert_eq!(grid.cell_count(), 0);

        assert_eq!(grid.apply(&meta_event(meta(10, 4))), GridChange::Layout);
        assert_eq!(grid.apply(&batch(&[(0, 1, 1.0), (3, 2, 2.0)])), GridChange::Cells(2));
        assert_eq!(grid.cell(3, 2).map(|c| c.v.clone()), Some(json!(2.0)));
    }

    #[test]
    fn cells_outside_the_layout_are_dropped() {
        let mut grid = GridView::new();
        grid.apply(&meta_event(meta(2, 1)));
        let partly_outside = batch(&[(1, 1, 1.0), (5, 1, 1.0), (0, 9, 1.0)]);
        assert_eq!(grid.apply(&partly_outside), GridChange::Cells(1));
    }

    #[test]
    fn layout_change_clears_cells() {
        let mut grid = GridView::new();
        grid.apply(&meta_event(meta(10, 4)));
        grid.apply(&batch(&[(0, 1, 1.0)]));
        assert_eq!(grid.apply(&meta_event(meta(10, 4))), GridChange::Connection);
        assert_eq!(grid.cell_count(), 1);
        assert_eq!(grid.apply(&meta_event(meta(12, 4))), GridChange::Layout);
        assert_eq!(grid.cell_count(), 0);
        assert_eq!(grid.data_rows(), 12);
    }

    #[test]
    fn disconnect_and_fatal_are_recorded() {
        let mut grid = GridView::new();
        grid.apply(&DataEvent::Disconnect);
        assert!(grid.is_disconnected());
        grid.apply(&DataEvent::Fatal("boom".into()));
        assert_eq!(grid.fatal(), Some("boom"));
        grid.apply(&meta_event(meta(1, 1)));
        assert!(!grid.is_disconnected());
    }

    #[test]
    fn viewport_waits_for_meta() {
        let grid = GridView::new();
        assert!(grid.viewport_for(&ScrollWindow::default(), false).is_none());
    }

    #[test]
    fn viewport_buffers_rows_around_window() {
        let mut grid = GridView::new();
        grid.apply(&meta_event(meta(100, 2)));
        let window = ScrollWindow {
            top: 0.0,
            left: 0.0,
            width: 500.0,
            height: 10.0 * ROW_HEIGHT,
        };
        let viewport = grid.viewport_for(&window, false).unwrap();
        assert_eq!(viewport.rows, (0..20).collect::<Vec<_>>());

        let scrolled = ScrollWindow {
            top: 50.0 * ROW_HEIGHT,
            ..window
        };
        let viewport = grid.viewport_for(&scrolled, false).unwrap();
        assert_eq!(viewport.rows, (40..70).collect::<Vec<_>>());

        let bottom = ScrollWindow {
            top: 95.0 * ROW_HEIGHT,
            ..window
        };
        let viewport = grid.viewport_for(&bottom, false).unwrap();
        assert_eq!(viewport.rows.last(), Some(&99));
    }

    #[test]
    fn viewport_scans_scroll_columns() {
        let mut grid = GridView::new();
        grid.apply(&meta_event(meta(5, 20)));
        // scroll columns are 100px wide; window shows scroll cols 5..=7
        let window = ScrollWindow {
            top: 0.0,
            left: 550.0,
            width: 200.0,
            height: 5.0 * ROW_HEIGHT,
        };
        let viewport = grid.viewport_for(&window, false).unwrap();
        let mut expected = vec![0];
        expected.extend((2..11).map(|i| i + 1));
        assert_eq!(viewport.cols, expected);
        assert!(!viewport.log);

        let sparkline = grid.viewport_for(&window, true).unwrap();
        assert_eq!(sparkline.cols, vec![0, 6, 7, 8]);
        assert_eq!(sparkline.rows, (0..5).collect::<Vec<_>>());
        assert!(sparkline.log);
    }

    #[test]
    fn scroll_columns_clamp_to_the_edges() {
        assert_eq!(scroll_columns(&[100; 4], 0.0, 150.0, 3), 0..4);
        assert_eq!(scroll_columns(&[100; 10], 0.0, 150.0, 0), 0..2);
        assert_eq!(scroll_columns(&[100; 4], 900.0, 100.0, 3), 0..0);
        assert_eq!(scroll_columns(&[], 0.0, 100.0, 3), 0..0);
    }
}
