/// file: src/clipboard.rs
/// description: copy-to-clipboard through a private (bypass) Data instance
use crate::{
    data::{Data, DataContext, DataHandle, DataOptions},
    error::SyncError,
    events::{DataEvent, EventReceiver},
    formatter::clipboard_text,
    selection::Selection,
    types::{CellBatch, CellUpdate, CellValue, Meta, SourceDescriptor},
};
use parking_lot::Mutex;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{Instrument, debug, info_span, warn};

#[derive(Default)]
struct ClipState {
    selection: Option<Selection>,
    cells: HashMap<(u32, u32), CellValue>,
}

/// Keeps a subscription to exactly the current selection and renders whatever it
/// receives as tab/newline text. A new selection replaces the previous
/// subscription; it never adds to it.
pub struct Clipboard {
    data: DataHandle,
    state: Arc<Mutex<ClipState>>,
    text: watch::Sender<Option<String>>,
    listener: JoinHandle<()>,
}

impl Clipboard {
    /// `source` is normally the grid's descriptor resolved against its live
    /// connection, so the clipboard reads from the same view.
    pub fn new(source: SourceDescriptor, context: &DataContext) -> Self {
        let data = Data::spawn(source, DataOptions::bypass("clipboard"), context);
        let state = Arc::new(Mutex::new(ClipState::default()));
        let (text, _) = watch::channel(None);
        let (_, events) = data.on();
        let listener = tokio::spawn(
            listen(events, data.clone(), state.clone(), text.clone())
                .instrument(info_span!("clipboard", id = data.id())),
        );
        Self {
            data,
            state,
            text,
            listener,
        }
    }

    /// Points the subscription at `selection`. Reselecting the same cells keeps
    /// the current data.
    pub fn select(&self, selection: &Selection) {
        {
            let mut state = self.state.lock();
            if state.selection.as_ref() == Some(selection) {
                return;
            }
            state.selection = Some(selection.clone());
            state.cells.clear();
            self.text.send_replace(None);
        }
        debug!(rows = selection.rows.len(), cols = selection.cols.len(), "clipboard selection");
        self.data.viewport(Some(selection.to_viewport()));
    }

    pub fn clear(&self) {
        clear(&self.data, &self.state, &self.text);
    }

    pub fn selection(&self) -> Option<Selection> {
        self.state.lock().selection.clone()
    }

    pub fn text(&self) -> Option<String> {
        self.text.borrow().clone()
    }

    pub fn has_data(&self) -> bool {
        self.text.borrow().is_some()
    }

    /// Receiver that changes whenever the text does.
    pub fn watch_text(&self) -> watch::Receiver<Option<String>> {
        self.text.subscribe()
    }

    pub fn data(&self) -> &DataHandle {
        &self.data
    }

    pub fn disconnect(&self) -> Result<(), SyncError> {
        self.listener.abort();
        self.data.kill()
    }
}

impl Drop for Clipboard {
    fn drop(&mut self) {
        self.listener.abort();
        if let Err(e) = self.data.kill() {
            debug!(error = %e, "clipboard already closed");
        }
    }
}

fn clear(data: &DataHandle, state: &Mutex<ClipState>, text: &watch::Sender<Option<String>>) {
    {
        let mut state = state.lock();
        state.selection = None;
        state.cells.clear();
        text.send_replace(None);
    }
    data.viewport(None);
}

async fn listen(
    mut events: EventReceiver<DataEvent>,
    data: DataHandle,
    state: Arc<Mutex<ClipState>>,
    text: watch::Sender<Option<String>>,
) {
    let mut layout: Option<Arc<Meta>> = None;
    while let Some(event) = events.recv().await {
        match event {
            DataEvent::Data(batch) => absorb(&state, &text, &batch),
            DataEvent::Meta { meta, .. } => {
                // indices are meaningless once rows or columns move
                let moved = layout.as_ref().is_some_and(|old| {
                    old.structure != meta.structure
                        || old.columns != meta.columns
                        || old.data_rows != meta.data_rows
                });
                if moved {
                    debug!("clipboard cleared after structure change");
                    clear(&data, &state, &text);
                }
                layout = Some(meta);
            }
            DataEvent::Fatal(message) => {
                warn!(%message, "clipboard data failed");
                text.send_replace(None);
            }
            DataEvent::Disconnect => {
                text.send_replace(None);
            }
            DataEvent::Cycle { .. } | DataEvent::Types { .. } => {}
        }
    }
}

fn absorb(state: &Mutex<ClipState>, text: &watch::Sender<Option<String>>, batch: &CellBatch) {
    let mut state = state.lock();
    let ClipState { selection, cells } = &mut *state;
    let Some(selection) = selection else {
        return;
    };
    let rows: HashSet<u32> = selection.rows.iter().copied().collect();
    let cols: HashSet<u32> = selection.cols.iter().copied().collect();
    // cells outside the selection belong to a batch for a replaced subscription
    let inside = |c: &CellUpdate| rows.contains(&c.row) && cols.contains(&c.col);
    if batch.cells.is_empty() || !batch.cells.iter().all(inside) {
        debug!(viewport = %batch.viewport_id, "batch for a previous selection ignored");
        return;
    }
    for cell in &batch.cells {
        cells.insert((cell.row, cell.col), cell.value.clone());
    }
    text.send_replace(Some(clipboard_text(&selection.rows, &selection.cols, cells)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CellUpdate, ValueType};
    use chrono::Utc;
    use serde_json::json;

    fn batch(cells: &[(u32, u32, &str)]) -> CellBatch {
        CellBatch {
            viewport_id: "vp".into(),
            version: 1,
            cells: cells
                .iter()
                .map(|(row, col, v)| CellUpdate {
                    row: *row,
                    col: *col,
                    value: CellValue {
                        v: json!(v),
                        t: Some(ValueType::String),
                        h: None,
                    },
                })
                .collect(),
            timestamp: Utc::now(),
            duration_ms: 1,
        }
    }

    fn state(rows: Vec<u32>, cols: Vec<u32>) -> Mutex<ClipState> {
        Mutex::new(ClipState::default().with_selection(rows, cols))
    }

    impl ClipState {
        fn with_selection(mut self, rows: Vec<u32>, cols: Vec<u32>) -> Self {
            let types = vec![None; cols.len()];
            self.selection = Some(Selection { rows, cols, types });
            self
        }
    }

    #[test]
    fn merges_partial_batches() {
        let state = state(vec![0, 1], vec![2]);
        let (text, _) = watch::channel(None);
        absorb(&state, &text, &batch(&[(0, 2, "a")]));
        assert_eq!(text.borrow().as_deref(), Some("a\n"));
        absorb(&state, &text, &batch(&[(1, 2, "b")]));
        assert_eq!(text.borrow().as_deref(), Some("a\nb"));
    }

    #[test]
    fn ignores_batches_for_other_selections() {
        let state = state(vec![0], vec![2]);
        let (text, _) = watch::channel(None);
        absorb(&state, &text, &batch(&[(0, 2, "a"), (5, 5, "stale")]));
        assert!(text.borrow().is_none());
        absorb(&state, &text, &batch(&[]));
        assert!(text.borrow().is_none());
    }

    #[test]
    fn nothing_happens_without_a_selection() {
        let state = Mutex::new(ClipState::default());
        let (text, _) = watch::channel(None);
        absorb(&state, &text, &batch(&[(0, 0, "a")]));
        assert!(text.borrow().is_none());
    }
}
