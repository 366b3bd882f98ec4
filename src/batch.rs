/// file: src/batch.rs
/// description: assembles bracketed cell deltas into atomic batches
use crate::types::{CellBatch, CellUpdate};
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolWarning {
    #[error("cell update received outside of a batch ({cells} cells discarded)")]
    UpdateOutsideBatch { cells: usize },

    #[error("batch end received without a matching start")]
    UnmatchedEnd,

    #[error("batch start received while batch v{open_version} was still open ({discarded} cells discarded)")]
    RestartedBatch { open_version: u64, discarded: usize },
}

#[derive(Debug)]
struct OpenBatch {
    viewport_id: String,
    version: u64,
    cells: Vec<CellUpdate>,
}

/// Cells are queued between a start and an end marker and only ever leave as a
/// complete batch.
#[derive(Debug, Default)]
pub struct BatchAssembler {
    open: Option<OpenBatch>,
}

impl BatchAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }

    /// A new start replaces a batch that never saw its end; the old cells are lost.
    pub fn start(&mut self, viewport_id: &str, version: u64) -> Result<(), ProtocolWarning> {
        let previous = self.open.replace(OpenBatch {
            viewport_id: viewport_id.to_string(),
            version,
            cells: Vec::new(),
        });
        match previous {
            Some(batch) => Err(ProtocolWarning::RestartedBatch {
                open_version: batch.version,
                discarded: batch.cells.len(),
            }),
            None => Ok(()),
        }
    }

    pub fn push(&mut self, cells: Vec<CellUpdate>) -> Result<(), ProtocolWarning> {
        match self.open.as_mut() {
            Some(batch) => {
                batch.cells.extend(cells);
                Ok(())
            }
            None => Err(ProtocolWarning::UpdateOutsideBatch { cells: cells.len() }),
        }
    }

    pub fn end(
        &mut self,
        timestamp: DateTime<Utc>,
        duration_ms: u64,
    ) -> Result<CellBatch, ProtocolWarning> {
        let batch = self.open.take().ok_or(ProtocolWarning::UnmatchedEnd)?;
        Ok(CellBatch {
            viewport_id: batch.viewport_id,
            version: batch.version,
            cells: batch.cells,
            timestamp,
            duration_ms,
        })
    }

    pub fn reset(&mut self) {
        self.open = None;
    }
}
