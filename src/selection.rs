/// file: src/selection.rs
/// description: pixel-to-cell selection over a fixed/scroll split grid, plus drag auto-scroll
use crate::types::{ColumnLayout, ValueType, Viewport, ViewportFormat};
use parking_lot::Mutex;
use std::{sync::Arc, time::Duration};
use tokio::{
    task::JoinHandle,
    time::{Instant, interval_at},
};
use tracing::trace;

pub const ROW_HEIGHT: f64 = 21.0;
pub const AUTO_SCROLL_STEP: f64 = 10.0;
pub const AUTO_SCROLL_INTERVAL: Duration = Duration::from_millis(75);

const LABEL_WIDTH: u32 = 250;
const DEFAULT_WIDTH: u32 = 150;

/// Column widths and their cumulative right edges, fixed columns first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColumnGeometry {
    widths: Vec<u32>,
    scan: Vec<u32>,
    types: Vec<Option<ValueType>>,
    fixed_length: usize,
}

impl ColumnGeometry {
    pub fn new(widths: Vec<u32>, fixed_length: usize) -> Self {
        let types = vec![None; widths.len()];
        Self::build(widths, types, fixed_length)
    }

    /// Widths from the layout; columns without one get the label width (first
    /// fixed column) or the default width.
    pub fn from_layout(layout: &ColumnLayout) -> Self {
        let (widths, types) = layout
            .columns()
            .enumerate()
            .map(|(index, column)| {
                let fallback = if index == 0 { LABEL_WIDTH } else { DEFAULT_WIDTH };
                (column.width.unwrap_or(fallback), column.value_type)
            })
            .unzip();
        Self::build(widths, types, layout.fixed_length())
    }

    fn build(widths: Vec<u32>, types: Vec<Option<ValueType>>, fixed_length: usize) -> Self {
        let scan = widths
            .iter()
            .scan(0, |edge, width| {
                *edge += width;
                Some(*edge)
            })
            .collect();
        Self {
            fixed_length: fixed_length.min(widths.len()),
            widths,
            scan,
            types,
        }
    }

    pub fn len(&self) -> usize {
        self.widths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.widths.is_empty()
    }

    pub fn fixed_length(&self) -> usize {
        self.fixed_length
    }

    pub fn widths(&self) -> &[u32] {
        &self.widths
    }

    pub fn fixed_width(&self) -> f64 {
        self.widths[..self.fixed_length].iter().sum::<u32>() as f64
    }

    pub fn scroll_widths(&self) -> &[u32] {
        &self.widths[self.fixed_length..]
    }

    pub fn value_type(&self, col: usize) -> Option<ValueType> {
        self.types.get(col).copied().flatten()
    }

    pub fn left(&self, col: usize) -> f64 {
        match col {
            0 => 0.0,
            _ => self.scan.get(col - 1).copied().unwrap_or_default() as f64,
        }
    }

    pub fn right(&self, col: usize) -> f64 {
        self.scan.get(col).copied().unwrap_or_default() as f64
    }

    /// Column under content x; past the last edge clamps to the last column.
    pub fn column_at(&self, x: f64) -> Option<usize> {
        if self.is_empty() {
            return None;
        }
        let index = self.scan.partition_point(|edge| (*edge as f64) <= x.max(0.0));
        Some(index.min(self.len() - 1))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ScrollPosition {
    pub top: f64,
    pub left: f64,
}

/// Maps a pointer position (relative to the grid body, below the header) to
/// content coordinates. The fixed pane never scrolls horizontally.
pub fn content_point(geometry: &ColumnGeometry, scroll: ScrollPosition, pointer: Point) -> Point {
    let x = if pointer.x > geometry.fixed_width() {
        pointer.x + scroll.left
    } else {
        pointer.x
    };
    Point {
        x,
        y: pointer.y + scroll.top,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pane {
    Fixed,
    Scroll,
}

/// Overlay rectangle for one pane, in that pane's own coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Region {
    pub pane: Pane,
    pub top: f64,
    pub left: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    /// Data row indices in display order.
    pub rows: Vec<u32>,
    pub cols: Vec<u32>,
    pub types: Vec<Option<ValueType>>,
}

impl Selection {
    pub fn is_single_cell(&self) -> bool {
        self.rows.len() == 1 && self.cols.len() == 1
    }

    /// Exactly the selected window; full values for a single cell, summaries otherwise.
    pub fn to_viewport(&self) -> Viewport {
        let format = if self.is_single_cell() {
            ViewportFormat::Expanded
        } else {
            ViewportFormat::Cell
        };
        Viewport::new(self.rows.clone(), self.cols.clone()).with_format(format)
    }
}

/// Rectangular selection covered by the drag from `start` to `end` (content
/// coordinates), with one overlay region per pane it touches.
pub fn select(
    geometry: &ColumnGeometry,
    available_rows: &[u32],
    start: Point,
    end: Point,
) -> Option<(Selection, Vec<Region>)> {
    if available_rows.is_empty() {
        return None;
    }
    let first_col = geometry.column_at(start.x.min(end.x))?;
    let last_col = geometry.column_at(start.x.max(end.x))?;
    let last_row = available_rows.len() - 1;
    let row_at = |y: f64| ((y.max(0.0) / ROW_HEIGHT).floor() as usize).min(last_row);
    let first_row = row_at(start.y.min(end.y));
    let last_row = row_at(start.y.max(end.y));

    let top = first_row as f64 * ROW_HEIGHT;
    let height = (last_row - first_row + 1) as f64 * ROW_HEIGHT;
    let fixed = geometry.fixed_length();
    let mut regions = Vec::with_capacity(2);
    if first_col < fixed {
        let last = last_col.min(fixed - 1);
        regions.push(Region {
            pane: Pane::Fixed,
            top,
            left: geometry.left(first_col),
            width: geometry.right(last) - geometry.left(first_col),
            height,
        });
    }
    if last_col >= fixed {
        let first = first_col.max(fixed);
        let offset = geometry.fixed_width();
        regions.push(Region {
            pane: Pane::Scroll,
            top,
            left: geometry.left(first) - offset,
            width: geometry.right(last_col) - geometry.left(first),
            height,
        });
    }

    let selection = Selection {
        rows: available_rows[first_row..=last_row].to_vec(),
        cols: (first_col..=last_col).map(|col| col as u32).collect(),
        types: (first_col..=last_col).map(|col| geometry.value_type(col)).collect(),
    };
    Some((selection, regions))
}

/// Visible part of the grid body in pointer coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub top: f64,
    pub bottom: f64,
    pub left: f64,
    pub right: f64,
}

impl Bounds {
    /// -1, 0 or 1 per axis: where the pointer sits relative to the bounds.
    fn direction(&self, pointer: Point) -> (f64, f64) {
        let axis = |value: f64, low: f64, high: f64| {
            if value < low {
                -1.0
            } else if value > high {
                1.0
            } else {
                0.0
            }
        };
        (
            axis(pointer.x, self.left, self.right),
            axis(pointer.y, self.top, self.bottom),
        )
    }
}

/// Nudges the scroll position while a drag is held outside the visible bounds.
///
/// Every pointer move replaces the running timer; mouse-up cancels it. The timer
/// also stops by itself once the scroll position reaches its limits.
pub struct AutoScroller {
    bounds: Bounds,
    limits: ScrollPosition,
    position: Arc<Mutex<ScrollPosition>>,
    task: Option<JoinHandle<()>>,
}

impl AutoScroller {
    pub fn new(
        bounds: Bounds,
        limits: ScrollPosition,
        position: Arc<Mutex<ScrollPosition>>,
    ) -> Self {
        Self {
            bounds,
            limits: ScrollPosition {
                top: limits.top.max(0.0),
                left: limits.left.max(0.0),
            },
            position,
            task: None,
        }
    }

    pub fn position(&self) -> ScrollPosition {
        *self.position.lock()
    }

    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Must be called from within a tokio runtime.
    pub fn on_move(&mut self, pointer: Point) {
        self.cancel();
        let (dx, dy) = self.bounds.direction(pointer);
        if dx == 0.0 && dy == 0.0 {
            return;
        }
        let position = self.position.clone();
        let limits = self.limits;
        self.task = Some(tokio::spawn(async move {
            let start = Instant::now() + AUTO_SCROLL_INTERVAL;
            let mut ticker = interval_at(start, AUTO_SCROLL_INTERVAL);
            loop {
                ticker.tick().await;
                let mut scroll = position.lock();
                let before = *scroll;
                scroll.left = (scroll.left + dx * AUTO_SCROLL_STEP).clamp(0.0, limits.left);
                scroll.top = (scroll.top + dy * AUTO_SCROLL_STEP).clamp(0.0, limits.top);
                trace!(top = scroll.top, left = scroll.left, "auto scroll");
                if *scroll == before {
                    break;
                }
            }
        }));
    }

    pub fn on_mouse_up(&mut self) {
        self.cancel();
    }

    fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for AutoScroller {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry() -> ColumnGeometry {
        // fixed: [0,250) ; scroll: [250,350) [350,450) [450,600)
        ColumnGeometry::new(vec![250, 100, 100, 150], 1)
    }

    fn rows() -> Vec<u32> {
        (0..30).collect()
    }

    #[test]
    fn column_lookup_uses_edges() {
        let geometry = geometry();
        assert_eq!(geometry.column_at(0.0), Some(0));
        assert_eq!(geometry.column_at(249.9), Some(0));
        assert_eq!(geometry.column_at(250.0), Some(1));
        assert_eq!(geometry.column_at(455.0), Some(3));
        assert_eq!(geometry.column_at(10_000.0), Some(3));
        assert_eq!(geometry.fixed_width(), 250.0);
        assert_eq!(ColumnGeometry::default().column_at(3.0), None);
    }

    #[test]
    fn drag_inside_scroll_pane() {
        let (selection, regions) = select(
            &geometry(),
            &rows(),
            Point { x: 360.0, y: 50.0 },
            Point { x: 260.0, y: 5.0 },
        )
        .unwrap();
        assert_eq!(selection.rows, vec![0, 1, 2]);
        assert_eq!(selection.cols, vec![1, 2]);
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].pane, Pane::Scroll);
        assert_eq!(regions[0].left, 0.0);
        assert_eq!(regions[0].width, 200.0);
        assert_eq!(regions[0].height, 3.0 * ROW_HEIGHT);
    }

    #[test]
    fn drag_across_panes_yields_two_regions() {
        let (selection, regions) = select(
            &geometry(),
            &rows(),
            Point { x: 10.0, y: 22.0 },
            Point { x: 300.0, y: 22.0 },
        )
        .unwrap();
        assert_eq!(selection.cols, vec![0, 1]);
        assert_eq!(selection.rows, vec![1]);
        let panes: Vec<Pane> = regions.iter().map(|r| r.pane).collect();
        assert_eq!(panes, vec![Pane::Fixed, Pane::Scroll]);
        assert_eq!(regions[0].width, 250.0);
        assert_eq!(regions[1].left, 0.0);
        assert_eq!(regions[1].top, ROW_HEIGHT);
    }

    #[test]
    fn rows_follow_display_order_and_clamp() {
        let available = vec![0, 4, 5, 9];
        let (selection, _) = select(
            &geometry(),
            &available,
            Point { x: 0.0, y: 25.0 },
            Point { x: 0.0, y: 9_999.0 },
        )
        .unwrap();
        assert_eq!(selection.rows, vec![4, 5, 9]);
        assert!(select(&geometry(), &[], Point::default(), Point::default()).is_none());
    }

    #[test]
    fn single_cell_selection_asks_for_expanded_values() {
        let single = Selection {
            rows: vec![3],
            cols: vec![2],
            types: vec![None],
        };
        assert_eq!(single.to_viewport().format, ViewportFormat::Expanded);
        let range = Selection {
            rows: vec![3, 4],
            cols: vec![2],
            types: vec![None],
        };
        assert_eq!(range.to_viewport().format, ViewportFormat::Cell);
    }

    #[test]
    fn pointer_maps_to_content() {
        let scroll = ScrollPosition {
            top: 42.0,
            left: 100.0,
        };
        let fixed = content_point(&geometry(), scroll, Point { x: 20.0, y: 10.0 });
        assert_eq!(fixed, Point { x: 20.0, y: 52.0 });
        let scrolled = content_point(&geometry(), scroll, Point { x: 300.0, y: 0.0 });
        assert_eq!(scrolled.x, 400.0);
    }

    fn scroller(position: Arc<Mutex<ScrollPosition>>) -> AutoScroller {
        AutoScroller::new(
            Bounds {
                top: 0.0,
                bottom: 200.0,
                left: 0.0,
                right: 400.0,
            },
            ScrollPosition {
                top: 1_000.0,
                left: 500.0,
            },
            position,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn auto_scroll_nudges_on_an_interval() {
        let position = Arc::new(Mutex::new(ScrollPosition::default()));
        let mut scroller = scroller(position.clone());
        scroller.on_move(Point { x: 100.0, y: 250.0 });
        assert!(scroller.is_active());
        tokio::time::sleep(Duration::from_millis(230)).await;
        assert_eq!(scroller.position().top, 30.0);
        assert_eq!(scroller.position().left, 0.0);

        scroller.on_mouse_up();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(scroller.position().top, 30.0);
        assert!(!scroller.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn moving_back_inside_stops_scrolling() {
        let position = Arc::new(Mutex::new(ScrollPosition::default()));
        let mut scroller = scroller(position);
        scroller.on_move(Point { x: 450.0, y: 100.0 });
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(scroller.position().left, 10.0);
        scroller.on_move(Point { x: 200.0, y: 100.0 });
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(scroller.position().left, 10.0);
    }

    #[tokio::test(start_paused = true)]
    async fn scrolling_stops_at_the_limit() {
        let position = Arc::new(Mutex::new(ScrollPosition::default()));
        let mut scroller = scroller(position);
        scroller.on_move(Point { x: 100.0, y: -20.0 });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(scroller.position().top, 0.0);
        assert!(!scroller.is_active());
    }
}
