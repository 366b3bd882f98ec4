/// file: src/sim.rs
/// description: in-process analytics server speaking the grid API and bus protocol
///
/// Backs the demo binary and the integration tests. Views get a portfolio tree
/// and an empty primitives grid; update requests are answered either at once
/// (immediate) or on the next tick while the view is running.
use crate::{
    api::{ApiError, ApiResult, GridApi, GridTarget, ViewportState},
    bus::{Bus, BusMessage, decode, publish_json},
    protocol::{
        BatchEnd, BatchStart, CellUpdateMode, CellUpdateModeRequest, ChangeViewRequest,
        ChangeViewResponse, DepgraphModeRequest, StructureChange, TransportStatus, UpdateData,
        UpdateRequest, ViewCommand, ViewStatus, topics,
    },
    types::{
        CellUpdate, CellValue, Column, ColumnSet, GridType, Node, Structure, ValueType,
        ViewRequest, Viewport, ViewportFormat,
    },
};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Value, json};
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::broadcast,
    task::JoinHandle,
    time::{MissedTickBehavior, interval, sleep},
};
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

/// Cells per update-data message; larger batches span several messages.
const CELLS_PER_MESSAGE: usize = 16;

#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    pub tick: Duration,
    /// Portfolio rows, including the root.
    pub rows: u32,
    /// Delay applied to every API call.
    pub latency: Duration,
    /// Views start running as soon as they are created.
    pub auto_run: bool,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(500),
            rows: 40,
            latency: Duration::ZERO,
            auto_run: true,
        }
    }
}

/// API operations that can be scripted to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimOp {
    CreateView,
    Structure,
    CreateViewport,
    UpdateViewport,
    GetViewport,
    CreateDepgraph,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimCalls {
    pub create_view: usize,
    pub delete_view: usize,
    pub structure: usize,
    pub create_viewport: usize,
    pub update_viewport: usize,
    pub get_viewport: usize,
    pub delete_viewport: usize,
    pub create_depgraph: usize,
    pub delete_depgraph: usize,
    /// Deletes naming something the server no longer knows.
    pub unknown_deletes: usize,
    pub update_requests: usize,
    pub batches: usize,
}

#[derive(Debug)]
struct Registration {
    target: GridTarget,
    viewport: Viewport,
    version: u64,
    pending: bool,
    mode: CellUpdateMode,
}

#[derive(Debug)]
struct SimView {
    definition: String,
    running: bool,
    grids: HashMap<GridType, Structure>,
    depgraphs: HashMap<String, GridType>,
}

#[derive(Debug, Default)]
struct SimState {
    views: HashMap<String, SimView>,
    viewports: HashMap<String, Registration>,
    failures: HashMap<SimOp, VecDeque<String>>,
    calls: SimCalls,
}

impl SimState {
    fn mint(&self, prefix: &str) -> String {
        format!("{prefix}-{}", Uuid::new_v4().simple())
    }

    fn fail(&mut self, op: SimOp) -> ApiResult<()> {
        match self.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(message) => Err(ApiError::new(message)),
            None => Ok(()),
        }
    }

    fn view(&self, view_id: &str) -> ApiResult<&SimView> {
        self.views
            .get(view_id)
            .ok_or_else(|| ApiError::new(format!("unknown view {view_id}")))
    }

    fn structure(&self, target: &GridTarget) -> ApiResult<Structure> {
        let view = self.view(&target.view_id)?;
        match &target.graph_id {
            Some(graph_id) if view.depgraphs.contains_key(graph_id) => Ok(depgraph_structure()),
            Some(graph_id) => Err(ApiError::new(format!("unknown dependency graph {graph_id}"))),
            None => Ok(view.grids.get(&target.grid_type).cloned().unwrap_or_default()),
        }
    }
}

pub struct SimulatedServer {
    bus: Arc<dyn Bus>,
    config: SimulatorConfig,
    state: Mutex<SimState>,
}

impl SimulatedServer {
    pub fn new(bus: Arc<dyn Bus>, config: SimulatorConfig) -> Arc<Self> {
        Arc::new(Self {
            bus,
            config,
            state: Mutex::new(SimState::default()),
        })
    }

    /// Starts serving bus requests and ticking. The task runs until aborted or
    /// the bus closes.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let server = self.clone();
        let mut requests = self.bus.subscribe_all();
        tokio::spawn(
            async move {
                let mut ticker = interval(server.config.tick);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => server.tick(),
                        message = requests.recv() => match message {
                            Ok(message) => server.handle_message(&message),
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                warn!(skipped, "simulator lagged behind the bus");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        },
                    }
                }
            }
            .instrument(info_span!("simulator")),
        )
    }

    pub fn calls(&self) -> SimCalls {
        self.state.lock().calls.clone()
    }

    /// Makes the next call of `op` fail with `message`. Queued per operation.
    pub fn fail_next(&self, op: SimOp, message: impl Into<String>) {
        self.state
            .lock()
            .failures
            .entry(op)
            .or_default()
            .push_back(message.into());
    }

    pub fn view_ids(&self) -> Vec<String> {
        self.state.lock().views.keys().cloned().collect()
    }

    pub fn live_viewports(&self) -> usize {
        self.state.lock().viewports.len()
    }

    pub fn viewport_ids(&self) -> Vec<String> {
        self.state.lock().viewports.keys().cloned().collect()
    }

    /// Replaces a grid's structure and announces it on the column channel.
    pub fn push_structure(&self, view_id: &str, grid_type: GridType, rows: u32) {
        {
            let mut state = self.state.lock();
            let Some(view) = state.views.get_mut(view_id) else {
                warn!(view_id, "structure push for unknown view");
                return;
            };
            view.grids.insert(grid_type, grid_structure(grid_type, rows));
        }
        info!(view_id, %grid_type, rows, "pushing structure change");
        self.publish(
            topics::columns(grid_type),
            &StructureChange {
                view_id: view_id.to_string(),
                grid_type,
                graph_id: None,
            },
        );
    }

    /// Announces transport loss. The server forgets every viewport registration,
    /// as a real server does when the session drops.
    pub fn drop_transport(&self) {
        self.state.lock().viewports.clear();
        self.publish(topics::TRANSPORT, &TransportStatus { connected: false });
    }

    pub fn restore_transport(&self) {
        self.publish(topics::TRANSPORT, &TransportStatus { connected: true });
    }

    /// Publishes an arbitrary message, e.g. a malformed control sequence.
    pub fn publish<T: Serialize>(&self, topic: &str, message: &T) {
        if let Err(e) = publish_json(self.bus.as_ref(), topic, message) {
            warn!(topic, error = %e, "simulator publish failed");
        }
    }

    /// Streams one batch for `viewport_id` carrying `version`, whatever the
    /// registration currently holds.
    pub fn inject_batch(&self, viewport_id: &str, version: u64) {
        let state = self.state.lock();
        match state.viewports.get(viewport_id) {
            Some(registration) => {
                let cells = self.cells(&state, registration);
                self.send_batch(viewport_id, registration.target.grid_type, version, cells);
            }
            None => warn!(viewport_id, "batch injection for unknown viewport"),
        }
    }

    fn tick(&self) {
        let mut state = self.state.lock();
        let due: Vec<String> = state
            .viewports
            .iter()
            .filter(|(_, registration)| registration.pending)
            .filter(|(_, registration)| {
                state
                    .views
                    .get(&registration.target.view_id)
                    .is_some_and(|view| view.running)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for viewport_id in due {
            if let Some(registration) = state.viewports.get_mut(&viewport_id) {
                registration.pending = false;
            }
            self.stream(&mut state, &viewport_id);
        }
    }

    fn handle_message(&self, message: &BusMessage) {
        let handled = match message.topic.as_str() {
            topics::UPDATE_REQUEST => {
                decode(message).map(|request| self.on_update_request(request))
            }
            topics::PAUSE => decode(message).map(|command| self.set_running(command, false)),
            topics::RESUME => decode(message).map(|command| self.set_running(command, true)),
            topics::GET_INIT_DATA => decode(message).map(|command| self.on_init_data(command)),
            topics::CHANGE_VIEW => decode(message).map(|request| self.on_change_view(request)),
            topics::CELL_UPDATE_MODE => {
                decode(message).map(|request| self.on_cell_update_mode(request))
            }
            topics::DEPGRAPH_MODE => decode(message).map(|request: DepgraphModeRequest| {
                debug!(
                    graph_id = %request.graph_id,
                    enabled = request.enabled,
                    "dependency graph mode"
                );
            }),
            _ => Ok(()),
        };
        if let Err(e) = handled {
            warn!(topic = %message.topic, error = %e, "simulator could not decode request");
        }
    }

    fn on_update_request(&self, request: UpdateRequest) {
        let mut state = self.state.lock();
        state.calls.update_requests += 1;
        for reference in request.viewports() {
            let Some(registration) = state.viewports.get_mut(&reference.viewport_id) else {
                debug!(viewport_id = %reference.viewport_id, "update request for unknown viewport");
                continue;
            };
            if request.immediate_response {
                self.stream(&mut state, &reference.viewport_id);
            } else {
                registration.pending = true;
            }
        }
    }

    fn set_running(&self, command: ViewCommand, running: bool) {
        let mut state = self.state.lock();
        if let Some(view) = state.views.get_mut(&command.view_id) {
            view.running = running;
            self.publish(
                topics::STATUS,
                &ViewStatus {
                    view_id: command.view_id,
                    running,
                },
            );
        }
    }

    fn on_init_data(&self, command: ViewCommand) {
        let state = self.state.lock();
        if let Ok(view) = state.view(&command.view_id) {
            self.publish(
                topics::INIT_DATA,
                &ViewStatus {
                    view_id: command.view_id,
                    running: view.running,
                },
            );
        }
    }

    fn on_change_view(&self, request: ChangeViewRequest) {
        let mut state = self.state.lock();
        let response = match state.views.get_mut(&request.view_id) {
            Some(view) if !request.view.view_definition_id.is_empty() => {
                info!(
                    view_id = %request.view_id,
                    from = %view.definition,
                    to = %request.view.view_definition_id,
                    "view definition changed"
                );
                view.definition = request.view.view_definition_id;
                ChangeViewResponse {
                    view_id: request.view_id,
                    success: true,
                    message: None,
                }
            }
            _ => ChangeViewResponse {
                view_id: request.view_id,
                success: false,
                message: Some("cannot change view".to_string()),
            },
        };
        self.publish(topics::CHANGE_VIEW_RESPONSE, &response);
    }

    fn on_cell_update_mode(&self, request: CellUpdateModeRequest) {
        if let Some(registration) = self.state.lock().viewports.get_mut(&request.viewport_id) {
            registration.mode = request.mode;
        }
    }

    fn stream(&self, state: &mut SimState, viewport_id: &str) {
        let Some(registration) = state.viewports.get(viewport_id) else {
            return;
        };
        let cells = self.cells(state, registration);
        let (grid_type, version) = (registration.target.grid_type, registration.version);
        state.calls.batches += 1;
        self.send_batch(viewport_id, grid_type, version, cells);
    }

    fn send_batch(
        &self,
        viewport_id: &str,
        grid_type: GridType,
        version: u64,
        cells: Vec<CellUpdate>,
    ) {
        let started = Utc::now();
        self.publish(
            topics::CONTROL_START,
            &BatchStart {
                viewport_id: viewport_id.to_string(),
                version,
            },
        );
        for chunk in cells.chunks(CELLS_PER_MESSAGE) {
            self.publish(
                topics::updates(grid_type),
                &UpdateData {
                    viewport_id: viewport_id.to_string(),
                    cells: chunk.to_vec(),
                },
            );
        }
        self.publish(
            topics::CONTROL_END,
            &BatchEnd {
                viewport_id: viewport_id.to_string(),
                timestamp: Utc::now(),
                duration_ms: (Utc::now() - started).num_milliseconds().max(0) as u64
                    + fastrand::u64(20..120),
            },
        );
    }

    fn cells(&self, state: &SimState, registration: &Registration) -> Vec<CellUpdate> {
        let Ok(structure) = state.structure(&registration.target) else {
            return Vec::new();
        };
        let columns: Vec<&Column> = structure
            .column_sets
            .iter()
            .flat_map(|set| set.columns.iter())
            .collect();
        let rows = structure.data_rows();
        let viewport = &registration.viewport;
        let wanted: Vec<(u32, u32)> = match &viewport.cells {
            Some(cells) => cells.iter().map(|cell| (cell.row, cell.col)).collect(),
            None => viewport
                .rows
                .iter()
                .flat_map(|row| viewport.cols.iter().map(move |col| (*row, *col)))
                .collect(),
        };
        wanted
            .into_iter()
            .filter(|(row, col)| *row < rows && (*col as usize) < columns.len())
            .filter(|(_, col)| {
                registration.mode == CellUpdateMode::Full || *col == 0 || fastrand::bool()
            })
            .map(|(row, col)| {
                let value_type = columns[col as usize].value_type.unwrap_or(ValueType::Double);
                CellUpdate {
                    row,
                    col,
                    value: cell_value(row, value_type, viewport.format, viewport.log),
                }
            })
            .collect()
    }

    async fn latency(&self) {
        if !self.config.latency.is_zero() {
            sleep(self.config.latency).await;
        }
    }
}

#[async_trait]
impl GridApi for SimulatedServer {
    async fn create_view(&self, request: &ViewRequest) -> ApiResult<String> {
        self.latency().await;
        let mut state = self.state.lock();
        state.calls.create_view += 1;
        state.fail(SimOp::CreateView)?;
        if request.view_definition_id.is_empty() {
            return Err(ApiError::new("view definition is required"));
        }
        let view_id = state.mint("view");
        let grids = HashMap::from([
            (GridType::Portfolio, grid_structure(GridType::Portfolio, self.config.rows)),
            (GridType::Primitives, Structure::default()),
        ]);
        state.views.insert(
            view_id.clone(),
            SimView {
                definition: request.view_definition_id.clone(),
                running: self.config.auto_run,
                grids,
                depgraphs: HashMap::new(),
            },
        );
        info!(%view_id, definition = %request.view_definition_id, "view created");
        if self.config.auto_run {
            self.publish(
                topics::STATUS,
                &ViewStatus {
                    view_id: view_id.clone(),
                    running: true,
                },
            );
        }
        Ok(view_id)
    }

    async fn delete_view(&self, view_id: &str) -> ApiResult<()> {
        self.latency().await;
        let mut state = self.state.lock();
        state.calls.delete_view += 1;
        if state.views.remove(view_id).is_none() {
            state.calls.unknown_deletes += 1;
            return Err(ApiError::new(format!("unknown view {view_id}")));
        }
        state
            .viewports
            .retain(|_, registration| registration.target.view_id != view_id);
        Ok(())
    }

    async fn structure(&self, target: &GridTarget, dry_run: bool) -> ApiResult<Structure> {
        self.latency().await;
        let mut state = self.state.lock();
        state.calls.structure += 1;
        state.fail(SimOp::Structure)?;
        debug!(%target, dry_run, "structure requested");
        state.structure(target)
    }

    async fn create_viewport(
        &self,
        target: &GridTarget,
        viewport: &Viewport,
        version: u64,
    ) -> ApiResult<String> {
        self.latency().await;
        let mut state = self.state.lock();
        state.calls.create_viewport += 1;
        state.fail(SimOp::CreateViewport)?;
        state.structure(target)?;
        let viewport_id = state.mint("viewport");
        state.viewports.insert(
            viewport_id.clone(),
            Registration {
                target: target.clone(),
                viewport: viewport.clone(),
                version,
                pending: false,
                mode: CellUpdateMode::Full,
            },
        );
        Ok(viewport_id)
    }

    async fn update_viewport(
        &self,
        target: &GridTarget,
        viewport_id: &str,
        viewport: &Viewport,
        version: u64,
    ) -> ApiResult<()> {
        self.latency().await;
        let mut state = self.state.lock();
        state.calls.update_viewport += 1;
        state.fail(SimOp::UpdateViewport)?;
        let registration = state
            .viewports
            .get_mut(viewport_id)
            .filter(|registration| registration.target == *target)
            .ok_or_else(|| ApiError::new(format!("unknown viewport {viewport_id}")))?;
        registration.viewport = viewport.clone();
        registration.version = version;
        Ok(())
    }

    async fn get_viewport(
        &self,
        target: &GridTarget,
        viewport_id: &str,
    ) -> ApiResult<ViewportState> {
        self.latency().await;
        let mut state = self.state.lock();
        state.calls.get_viewport += 1;
        state.fail(SimOp::GetViewport)?;
        state
            .viewports
            .get(viewport_id)
            .filter(|registration| registration.target == *target)
            .map(|registration| ViewportState {
                viewport_id: viewport_id.to_string(),
                version: registration.version,
            })
            .ok_or_else(|| ApiError::new(format!("unknown viewport {viewport_id}")))
    }

    async fn delete_viewport(&self, target: &GridTarget, viewport_id: &str) -> ApiResult<()> {
        self.latency().await;
        let mut state = self.state.lock();
        state.calls.delete_viewport += 1;
        match state.viewports.get(viewport_id) {
            Some(registration) if registration.target == *target => {
                state.viewports.remove(viewport_id);
                Ok(())
            }
            _ => {
                state.calls.unknown_deletes += 1;
                Err(ApiError::new(format!("unknown viewport {viewport_id}")))
            }
        }
    }

    async fn create_depgraph(
        &self,
        view_id: &str,
        grid_type: GridType,
        row: u32,
        col: u32,
    ) -> ApiResult<String> {
        self.latency().await;
        let mut state = self.state.lock();
        state.calls.create_depgraph += 1;
        state.fail(SimOp::CreateDepgraph)?;
        state.view(view_id)?;
        let graph_id = state.mint("graph");
        if let Some(view) = state.views.get_mut(view_id) {
            view.depgraphs.insert(graph_id.clone(), grid_type);
        }
        debug!(view_id, %graph_id, row, col, "dependency graph created");
        Ok(graph_id)
    }

    async fn delete_depgraph(
        &self,
        view_id: &str,
        _grid_type: GridType,
        graph_id: &str,
    ) -> ApiResult<()> {
        self.latency().await;
        let mut state = self.state.lock();
        state.calls.delete_depgraph += 1;
        let removed = state
            .views
            .get_mut(view_id)
            .and_then(|view| view.depgraphs.remove(graph_id));
        if removed.is_none() {
            state.calls.unknown_deletes += 1;
            return Err(ApiError::new(format!("unknown dependency graph {graph_id}")));
        }
        Ok(())
    }
}

fn column(header: &str, value_type: ValueType, width: u32) -> Column {
    Column {
        header: header.to_string(),
        description: String::new(),
        value_type: Some(value_type),
        width: Some(width),
    }
}

/// Portfolio grids get a two-level tree; primitives grids are flat.
fn grid_structure(grid_type: GridType, rows: u32) -> Structure {
    let rows = rows.max(1);
    let risk = ColumnSet {
        name: "Risk".to_string(),
        columns: vec![
            column("Present Value", ValueType::Double, 120),
            column("Delta", ValueType::Double, 100),
            column("FX Exposure", ValueType::LabelledMatrix1d, 140),
            column("Discount Curve", ValueType::Curve, 140),
            column("PnL Series", ValueType::TimeSeries, 140),
        ],
    };
    match grid_type {
        GridType::Portfolio => {
            let children = (1..rows)
                .step_by(5)
                .map(|start| Node {
                    start,
                    end: (start + 4).min(rows - 1),
                    children: Vec::new(),
                    collapsed: false,
                })
                .collect();
            Structure {
                row_count: None,
                root_node: Some(Node {
                    start: 0,
                    end: rows - 1,
                    children,
                    collapsed: false,
                }),
                column_sets: vec![
                    ColumnSet {
                        name: "Portfolio".to_string(),
                        columns: vec![column("Position", ValueType::String, 180)],
                    },
                    risk,
                ],
            }
        }
        GridType::Primitives => Structure {
            row_count: Some(rows),
            root_node: None,
            column_sets: vec![
                ColumnSet {
                    name: "Primitives".to_string(),
                    columns: vec![column("Target", ValueType::String, 180)],
                },
                risk,
            ],
        },
    }
}

fn depgraph_structure() -> Structure {
    Structure {
        row_count: None,
        root_node: Some(Node {
            start: 0,
            end: 4,
            children: vec![Node {
                start: 1,
                end: 4,
                children: Vec::new(),
                collapsed: false,
            }],
            collapsed: false,
        }),
        column_sets: vec![
            ColumnSet {
                name: "Node".to_string(),
                columns: vec![column("Target", ValueType::String, 180)],
            },
            ColumnSet {
                name: "Calculation".to_string(),
                columns: vec![
                    column("Value Name", ValueType::String, 140),
                    column("Value", ValueType::Double, 120),
                ],
            },
        ],
    }
}

fn random_amount() -> f64 {
    ((fastrand::f64() - 0.5) * 2_000_000.0).round() / 100.0
}

fn cell_value(row: u32, value_type: ValueType, format: ViewportFormat, log: bool) -> CellValue {
    let expanded = format == ViewportFormat::Expanded;
    let v: Value = match value_type {
        ValueType::String | ValueType::Primitive => json!(format!("Position {row}")),
        ValueType::Double | ValueType::Unknown => json!(random_amount()),
        ValueType::LabelledMatrix1d if expanded => json!({
            "labels": ["Currency", "Amount"],
            "data": [["USD", random_amount()], ["EUR", random_amount()], ["GBP", random_amount()]],
        }),
        ValueType::LabelledMatrix1d => json!("Vector (3)"),
        ValueType::Curve if expanded => json!(
            (1..=5)
                .map(|tenor| json!([tenor as f64, 0.01 + fastrand::f64() * 0.04]))
                .collect::<Vec<_>>()
        ),
        ValueType::Curve => json!("Curve (5)"),
        ValueType::TimeSeries if expanded => {
            let today = Utc::now().date_naive();
            json!({
                "index": (0..4i64)
                    .map(|days| (today - ChronoDuration::days(3 - days)).to_string())
                    .collect::<Vec<_>>(),
                "data": (0..4).map(|_| random_amount()).collect::<Vec<_>>(),
            })
        }
        ValueType::TimeSeries => json!("Time-series (4)"),
        ValueType::Matrix2d if expanded => json!([[1.0, 0.5], [0.5, 1.0]]),
        ValueType::Matrix2d => json!("Matrix (2 x 2)"),
        ValueType::LabelledMatrix2d | ValueType::SurfaceData if expanded => json!({
            "xLabels": ["1Y", "2Y"],
            "yLabels": ["ATM", "25D"],
            "matrix": [[0.21, 0.22], [0.19, 0.2]],
        }),
        ValueType::LabelledMatrix2d | ValueType::SurfaceData => json!("Matrix (2 x 2)"),
    };
    CellValue {
        v,
        t: Some(value_type),
        h: (log && value_type == ValueType::Double)
            .then(|| (0..8).map(|_| random_amount()).collect()),
    }
}
