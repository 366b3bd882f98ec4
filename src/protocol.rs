/// file: src/protocol.rs
/// description: message-bus topics and JSON payloads exchanged with the analytics server
use crate::types::{CellUpdate, GridType, ViewRequest};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod topics {
    // consumed
    pub const TRANSPORT: &str = "/meta/connection";
    pub const STATUS: &str = "/status";
    pub const INIT_DATA: &str = "/initialize";
    pub const CHANGE_VIEW_RESPONSE: &str = "/changeView";
    pub const PORTFOLIO_UPDATES: &str = "/updates/portfolio";
    pub const PRIMITIVES_UPDATES: &str = "/updates/primitives";
    pub const PORTFOLIO_COLUMNS: &str = "/updates/portfolio/columns";
    pub const PRIMITIVES_COLUMNS: &str = "/updates/primitives/columns";
    pub const CONTROL_START: &str = "/updates/control/start";
    pub const CONTROL_END: &str = "/updates/control/end";

    // produced
    pub const CHANGE_VIEW: &str = "/service/changeView";
    pub const PAUSE: &str = "/service/pauseView";
    pub const RESUME: &str = "/service/resumeView";
    pub const GET_INIT_DATA: &str = "/service/initialize";
    pub const UPDATE_REQUEST: &str = "/service/updates";
    pub const CELL_UPDATE_MODE: &str = "/service/updates/mode";
    pub const DEPGRAPH_MODE: &str = "/service/updates/depgraph";

    use crate::types::GridType;

    pub fn updates(grid_type: GridType) -> &'static str {
        match grid_type {
            GridType::Portfolio => PORTFOLIO_UPDATES,
            GridType::Primitives => PRIMITIVES_UPDATES,
        }
    }

    pub fn columns(grid_type: GridType) -> &'static str {
        match grid_type {
            GridType::Portfolio => PORTFOLIO_COLUMNS,
            GridType::Primitives => PRIMITIVES_COLUMNS,
        }
    }
}

/// Transport-level connection state announced by the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportStatus {
    pub connected: bool,
}

/// Running state of a view; published on both the status and init-data channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewStatus {
    pub view_id: String,
    pub running: bool,
}

/// Answer to a change-view request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeViewResponse {
    pub view_id: String,
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
}

/// Server announcement that the column structure of a grid changed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructureChange {
    pub view_id: String,
    pub grid_type: GridType,
    #[serde(default)]
    pub graph_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchStart {
    pub viewport_id: String,
    pub version: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateData {
    pub viewport_id: String,
    pub cells: Vec<CellUpdate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchEnd {
    pub viewport_id: String,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Identifies one live viewport registration in an update request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewportRef {
    pub view_id: String,
    pub viewport_id: String,
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph_id: Option<String>,
}

/// Asks the server for the next update cycle of a viewport.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRequest {
    pub portfolio_viewport: Option<ViewportRef>,
    pub primitive_viewport: Option<ViewportRef>,
    pub dep_graph_viewport: Option<ViewportRef>,
    pub immediate_response: bool,
}

impl UpdateRequest {
    pub fn new(grid_type: GridType, viewport: ViewportRef, immediate: bool) -> Self {
        let mut request = UpdateRequest {
            immediate_response: immediate,
            ..Default::default()
        };
        if viewport.graph_id.is_some() {
            request.dep_graph_viewport = Some(viewport);
        } else {
            match grid_type {
                GridType::Portfolio => request.portfolio_viewport = Some(viewport),
                GridType::Primitives => request.primitive_viewport = Some(viewport),
            }
        }
        request
    }

    pub fn viewports(&self) -> impl Iterator<Item = &ViewportRef> {
        self.portfolio_viewport
            .iter()
            .chain(self.primitive_viewport.iter())
            .chain(self.dep_graph_viewport.iter())
    }
}

/// Re-points an existing view at a different definition or market data.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeViewRequest {
    pub view_id: String,
    pub view: ViewRequest,
}

/// Body of pause, resume and get-init-data.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewCommand {
    pub view_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellUpdateMode {
    /// Every cell of the viewport on every cycle.
    Full,
    /// Only cells whose value changed.
    Delta,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CellUpdateModeRequest {
    pub view_id: String,
    pub viewport_id: String,
    pub mode: CellUpdateMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepgraphModeRequest {
    pub view_id: String,
    pub graph_id: String,
    pub enabled: bool,
}

/// Everything a Data instance publishes.
#[derive(Debug, Clone)]
pub enum Outbound {
    ChangeView(ChangeViewRequest),
    Pause(ViewCommand),
    Resume(ViewCommand),
    GetInitData(ViewCommand),
    Update(UpdateRequest),
    CellUpdateMode(CellUpdateModeRequest),
    DepgraphMode(DepgraphModeRequest),
}

impl Outbound {
    pub fn topic(&self) -> &'static str {
        match self {
            Outbound::ChangeView(_) => topics::CHANGE_VIEW,
            Outbound::Pause(_) => topics::PAUSE,
            Outbound::Resume(_) => topics::RESUME,
            Outbound::GetInitData(_) => topics::GET_INIT_DATA,
            Outbound::Update(_) => topics::UPDATE_REQUEST,
            Outbound::CellUpdateMode(_) => topics::CELL_UPDATE_MODE,
            Outbound::DepgraphMode(_) => topics::DEPGRAPH_MODE,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        match self {
            Outbound::Pause(body) | Outbound::Resume(body) | Outbound::GetInitData(body) => {
                serde_json::to_vec(body)
            }
            Outbound::ChangeView(body) => serde_json::to_vec(body),
            Outbound::Update(body) => serde_json::to_vec(body),
            Outbound::CellUpdateMode(body) => serde_json::to_vec(body),
            Outbound::DepgraphMode(body) => serde_json::to_vec(body),
        }
    }
}
