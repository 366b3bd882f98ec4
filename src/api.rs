/// file: src/api.rs
/// description: request/response operations of the grid/view subsystem
use crate::types::{GridType, Structure, ViewRequest, Viewport};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// The `{error: true, message}` failure every request resolves to when the server
/// rejects it.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{message}")]
pub struct ApiError {
    pub message: String,
}

impl ApiError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Addresses a grid of a view, or a dependency-graph sub-grid of it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GridTarget {
    pub view_id: String,
    pub grid_type: GridType,
    pub graph_id: Option<String>,
}

impl GridTarget {
    pub fn grid(view_id: impl Into<String>, grid_type: GridType) -> Self {
        Self {
            view_id: view_id.into(),
            grid_type,
            graph_id: None,
        }
    }
}

impl fmt::Display for GridTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.graph_id {
            Some(graph) => write!(f, "{}/{}/depgraphs/{}", self.view_id, self.grid_type, graph),
            None => write!(f, "{}/{}", self.view_id, self.grid_type),
        }
    }
}

/// What the server reports about a live viewport registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewportState {
    pub viewport_id: String,
    pub version: u64,
}

/// Black-box async operations against the view subsystem. Failures never cross
/// this boundary as panics; they come back as `ApiError`.
#[async_trait]
pub trait GridApi: Send + Sync {
    async fn create_view(&self, request: &ViewRequest) -> ApiResult<String>;

    async fn delete_view(&self, view_id: &str) -> ApiResult<()>;

    /// With `dry_run` the server answers with whatever structure it has (possibly
    /// empty) and keeps announcing changes on the column-structure channel.
    async fn structure(&self, target: &GridTarget, dry_run: bool) -> ApiResult<Structure>;

    async fn create_viewport(
        &self,
        target: &GridTarget,
        viewport: &Viewport,
        version: u64,
    ) -> ApiResult<String>;

    async fn update_viewport(
        &self,
        target: &GridTarget,
        viewport_id: &str,
        viewport: &Viewport,
        version: u64,
    ) -> ApiResult<()>;

    async fn get_viewport(&self, target: &GridTarget, viewport_id: &str)
    -> ApiResult<ViewportState>;

    async fn delete_viewport(&self, target: &GridTarget, viewport_id: &str) -> ApiResult<()>;

    /// Creates the dependency graph of the cell at `(row, col)` and returns its id.
    async fn create_depgraph(
        &self,
        view_id: &str,
        grid_type: GridType,
        row: u32,
        col: u32,
    ) -> ApiResult<String>;

    async fn delete_depgraph(
        &self,
        view_id: &str,
        grid_type: GridType,
        graph_id: &str,
    ) -> ApiResult<()>;
}
