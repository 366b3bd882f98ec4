/// file: src/session.rs
/// description: per-instance negotiation and viewport state machine, free of I/O
///
/// `Session::handle` is the transition function: it takes one input (a command, a
/// server reply or a bus message), mutates the session and returns the side
/// effects the driver has to perform. Nothing in here awaits.
use crate::{
    api::{ApiResult, GridTarget, ViewportState},
    batch::{BatchAssembler, ProtocolWarning},
    events::DataEvent,
    protocol::{
        BatchEnd, BatchStart, CellUpdateMode, CellUpdateModeRequest, ChangeViewRequest,
        ChangeViewResponse, DepgraphModeRequest, Outbound, StructureChange, TransportStatus,
        UpdateData, UpdateRequest, ViewCommand, ViewStatus, ViewportRef,
    },
    types::{Connection, GridType, Meta, SourceDescriptor, Structure, ViewRequest, Viewport},
    viewport::{Created, SetOutcome, ViewportManager, ViewportRequest},
};
use std::{collections::HashSet, sync::Arc};
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Uninitialized,
    /// Pooled child waiting for its parent's first structure.
    AwaitingParent,
    ViewResolving,
    TypeResolving,
    StructureResolving,
    DepgraphResolving,
    Ready,
    Dead,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub label: String,
    /// False for pooled parents: they negotiate but never stream a viewport.
    pub owns_viewport: bool,
    /// Resolve through a pooled parent instead of talking to the server directly.
    pub has_parent: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            label: "data".to_string(),
            owns_viewport: true,
            has_parent: false,
        }
    }
}

/// Integrity counters, in the spirit of a client's duplicate/gap counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub batches_applied: u64,
    pub stale_batches: u64,
    pub protocol_warnings: u64,
    pub viewport_requests: u64,
}

#[derive(Debug)]
pub enum Input {
    /// `parent` is the pooled parent's connection at the time the child started.
    Start {
        parent: Option<Connection>,
    },
    ParentMeta(Connection),
    ParentFatal(String),
    ViewCreated(ApiResult<String>),
    DryRun {
        seq: u64,
        grid_type: GridType,
        result: ApiResult<Structure>,
    },
    DepgraphCreated {
        seq: u64,
        result: ApiResult<String>,
    },
    StructureFetched {
        seq: u64,
        result: ApiResult<Structure>,
    },
    StructureChanged(StructureChange),
    ChangeView(ViewRequest),
    ChangeViewResponse(ChangeViewResponse),
    SetViewport(Option<Viewport>),
    ViewportCreated {
        version: u64,
        result: ApiResult<String>,
    },
    ViewportUpdated {
        version: u64,
        result: ApiResult<()>,
    },
    ViewportVerified {
        version: u64,
        result: ApiResult<ViewportState>,
    },
    BatchStart(BatchStart),
    Update(UpdateData),
    BatchEnd(BatchEnd),
    ViewStatus(ViewStatus),
    Transport(TransportStatus),
    Pause,
    Resume,
    SetCellUpdateMode(CellUpdateMode),
    SetDepgraphMode(bool),
    Disconnect,
    Kill,
}

impl Input {
    pub fn name(&self) -> &'static str {
        match self {
            Input::Start { .. } => "start",
            Input::ParentMeta(_) => "parent_meta",
            Input::ParentFatal(_) => "parent_fatal",
            Input::ViewCreated(_) => "view_created",
            Input::DryRun { .. } => "dry_run",
            Input::DepgraphCreated { .. } => "depgraph_created",
            Input::StructureFetched { .. } => "structure_fetched",
            Input::StructureChanged(_) => "structure_changed",
            Input::ChangeView(_) => "change_view",
            Input::ChangeViewResponse(_) => "change_view_response",
            Input::SetViewport(_) => "set_viewport",
            Input::ViewportCreated { .. } => "viewport_created",
            Input::ViewportUpdated { .. } => "viewport_updated",
            Input::ViewportVerified { .. } => "viewport_verified",
            Input::BatchStart(_) => "batch_start",
            Input::Update(_) => "update",
            Input::BatchEnd(_) => "batch_end",
            Input::ViewStatus(_) => "view_status",
            Input::Transport(_) => "transport",
            Input::Pause => "pause",
            Input::Resume => "resume",
            Input::SetCellUpdateMode(_) => "set_cell_update_mode",
            Input::SetDepgraphMode(_) => "set_depgraph_mode",
            Input::Disconnect => "disconnect",
            Input::Kill => "kill",
        }
    }
}

/// Side effects requested by the state machine.
#[derive(Debug, Clone)]
pub enum Effect {
    CreateView(ViewRequest),
    DryRun {
        seq: u64,
        target: GridTarget,
    },
    FetchStructure {
        seq: u64,
        target: GridTarget,
    },
    CreateDepgraph {
        seq: u64,
        view_id: String,
        grid_type: GridType,
        row: u32,
        col: u32,
    },
    CreateViewport {
        version: u64,
        target: GridTarget,
        viewport: Viewport,
    },
    UpdateViewport {
        version: u64,
        target: GridTarget,
        viewport_id: String,
        viewport: Viewport,
    },
    VerifyViewport {
        version: u64,
        target: GridTarget,
        viewport_id: String,
    },
    DeleteViewport {
        target: GridTarget,
        viewport_id: String,
    },
    DeleteDepgraph {
        view_id: String,
        grid_type: GridType,
        graph_id: String,
    },
    DeleteView {
        view_id: String,
    },
    Publish(Outbound),
    Emit(DataEvent),
    Shutdown {
        clear_listeners: bool,
    },
}

#[derive(Debug, Default)]
struct TypeProbe {
    portfolio: Option<Structure>,
    primitives: Option<Structure>,
}

pub struct Session {
    source: SourceDescriptor,
    options: SessionOptions,
    phase: Phase,
    view_id: Option<String>,
    grid_type: Option<GridType>,
    graph_id: Option<String>,
    structure: Option<Structure>,
    owns_view: bool,
    following_parent: bool,
    /// Parent meta that overtook `Start`.
    early_parent: Option<Connection>,
    init_requested: bool,
    seq: u64,
    probe: TypeProbe,
    watching: HashSet<GridType>,
    running: bool,
    connected: bool,
    fatal_fired: bool,
    viewports: ViewportManager,
    batches: BatchAssembler,
    stats: SessionStats,
}

impl Session {
    pub fn new(source: SourceDescriptor, options: SessionOptions) -> Self {
        Self {
            source,
            options,
            phase: Phase::Uninitialized,
            view_id: None,
            grid_type: None,
            graph_id: None,
            structure: None,
            owns_view: false,
            following_parent: false,
            early_parent: None,
            init_requested: false,
            seq: 0,
            probe: TypeProbe::default(),
            watching: HashSet::new(),
            running: false,
            connected: true,
            fatal_fired: false,
            viewports: ViewportManager::new(),
            batches: BatchAssembler::new(),
            stats: SessionStats::default(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn label(&self) -> &str {
        &self.options.label
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn view_id(&self) -> Option<&str> {
        self.view_id.as_deref()
    }

    pub fn graph_id(&self) -> Option<&str> {
        self.graph_id.as_deref()
    }

    pub fn viewport_id(&self) -> Option<&str> {
        self.viewports.viewport_id()
    }

    pub fn viewport_version(&self) -> u64 {
        self.viewports.version()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn connection(&self) -> Option<Connection> {
        Some(Connection {
            view_id: self.view_id.clone()?,
            grid_type: self.grid_type?,
            graph_id: self.graph_id.clone(),
            structure: self.structure.clone(),
        })
    }

    pub fn handle(&mut self, input: Input) -> Vec<Effect> {
        let mut fx = Vec::new();
        trace!(
            label = %self.options.label,
            phase = ?self.phase,
            input = input.name(),
            "session input"
        );

        if self.phase == Phase::Dead {
            match input {
                Input::Disconnect => fx.push(Effect::Shutdown {
                    clear_listeners: false,
                }),
                Input::Kill => fx.push(Effect::Shutdown {
                    clear_listeners: true,
                }),
                other => debug!(
                    label = %self.options.label,
                    input = other.name(),
                    "ignoring input for defunct session"
                ),
            }
            return fx;
        }

        match input {
            Input::Start { parent } => self.start(parent, &mut fx),
            Input::ParentMeta(connection) => self.parent_meta(connection, &mut fx),
            Input::ParentFatal(message) => {
                self.fatal(format!("caught fatal error from parent: {message}"), &mut fx)
            }
            Input::ViewCreated(result) => self.view_created(result, &mut fx),
            Input::DryRun {
                seq,
                grid_type,
                result,
            } => self.dry_run_returned(seq, grid_type, result, &mut fx),
            Input::DepgraphCreated { seq, result } => self.depgraph_created(seq, result, &mut fx),
            Input::StructureFetched { seq, result } => {
                self.structure_fetched(seq, result, &mut fx)
            }
            Input::StructureChanged(change) => self.structure_changed(change, &mut fx),
            Input::ChangeView(request) => self.change_view(request, &mut fx),
            Input::ChangeViewResponse(response) => self.change_view_response(response, &mut fx),
            Input::SetViewport(viewport) => self.set_viewport(viewport, &mut fx),
            Input::ViewportCreated { version, result } => {
                self.viewport_created(version, result, &mut fx)
            }
            Input::ViewportUpdated { version, result } => {
                self.viewport_updated(version, result, &mut fx)
            }
            Input::ViewportVerified { version, result } => {
                self.viewport_verified(version, result, &mut fx)
            }
            Input::BatchStart(start) => self.batch_start(start),
            Input::Update(update) => self.batch_update(update),
            Input::BatchEnd(end) => self.batch_end(end, &mut fx),
            Input::ViewStatus(status) => self.view_status(status, &mut fx),
            Input::Transport(status) => self.transport(status, &mut fx),
            Input::Pause => self.view_command(false, &mut fx),
            Input::Resume => self.view_command(true, &mut fx),
            Input::SetCellUpdateMode(mode) => self.cell_update_mode(mode, &mut fx),
            Input::SetDepgraphMode(enabled) => self.depgraph_mode(enabled, &mut fx),
            Input::Disconnect => self.disconnect(false, &mut fx),
            Input::Kill => self.disconnect(true, &mut fx),
        }
        fx
    }

    fn start(&mut self, parent: Option<Connection>, fx: &mut Vec<Effect>) {
        if self.phase != Phase::Uninitialized {
            warn!(label = %self.options.label, phase = ?self.phase, "session already started");
            return;
        }
        if self.options.has_parent {
            match (parent, self.early_parent.take()) {
                (Some(connection), early) => {
                    self.adopt(connection, fx);
                    if let Some(later) = early {
                        self.parent_meta(later, fx);
                    }
                }
                (None, Some(connection)) => self.adopt(connection, fx),
                (None, None) => {
                    debug!(label = %self.options.label, "waiting for pooled parent");
                    self.phase = Phase::AwaitingParent;
                }
            }
            return;
        }
        match (self.source.view_id.clone(), self.source.grid_type) {
            (Some(view_id), Some(grid_type)) => {
                self.view_id = Some(view_id);
                self.grid_type = Some(grid_type);
                self.begin_structure(fx);
            }
            (Some(view_id), None) => {
                self.view_id = Some(view_id);
                self.begin_type_probe(fx);
            }
            (None, _) if self.source.view_definition.is_none() => {
                self.fatal("source has neither a view id nor a view definition", fx);
            }
            (None, _) => {
                self.phase = Phase::ViewResolving;
                fx.push(Effect::CreateView(self.source.view_request()));
            }
        }
    }

    /// Takes over the view of a pooled parent. A plain grid of the parent's type
    /// reuses the parent's structure outright.
    fn adopt(&mut self, connection: Connection, fx: &mut Vec<Effect>) {
        let grid_type = self.source.grid_type.unwrap_or(connection.grid_type);
        self.view_id = Some(connection.view_id);
        self.grid_type = Some(grid_type);
        self.graph_id = None;
        match connection.structure {
            Some(structure) if !self.source.depgraph && grid_type == connection.grid_type => {
                debug!(label = %self.options.label, "reusing pooled structure");
                self.following_parent = true;
                self.apply_structure(structure, fx);
            }
            _ => {
                self.following_parent = false;
                self.begin_structure(fx);
            }
        }
    }

    fn parent_meta(&mut self, connection: Connection, fx: &mut Vec<Effect>) {
        match self.phase {
            Phase::Uninitialized if self.options.has_parent => {
                debug!(label = %self.options.label, "parent meta before start, keeping it");
                self.early_parent = Some(connection);
            }
            Phase::AwaitingParent => self.adopt(connection, fx),
            Phase::Ready if self.following_parent => {
                if self.view_id.as_deref() != Some(connection.view_id.as_str()) {
                    self.invalidate_viewport(fx);
                    self.adopt(connection, fx);
                    return;
                }
                if Some(connection.grid_type) != self.grid_type
                    || connection.structure.is_none()
                    || connection.structure == self.structure
                {
                    return;
                }
                if let Some(structure) = connection.structure {
                    self.invalidate_viewport(fx);
                    self.apply_structure(structure, fx);
                }
            }
            _ => {}
        }
    }

    fn view_created(&mut self, result: ApiResult<String>, fx: &mut Vec<Effect>) {
        if self.phase != Phase::ViewResolving {
            return;
        }
        match result {
            Ok(view_id) => {
                info!(label = %self.options.label, %view_id, "view created");
                self.view_id = Some(view_id);
                self.owns_view = true;
                self.begin_type_probe(fx);
            }
            Err(e) => self.fatal(format!("view creation failed: {e}"), fx),
        }
    }

    fn begin_type_probe(&mut self, fx: &mut Vec<Effect>) {
        let Some(view_id) = self.view_id.clone() else {
            return self.fatal("type resolution without a view", fx);
        };
        self.phase = Phase::TypeResolving;
        self.probe = TypeProbe::default();
        self.seq += 1;
        for grid_type in GridType::ALL {
            fx.push(Effect::DryRun {
                seq: self.seq,
                target: GridTarget::grid(view_id.clone(), grid_type),
            });
        }
    }

    fn dry_run_returned(
        &mut self,
        seq: u64,
        grid_type: GridType,
        result: ApiResult<Structure>,
        fx: &mut Vec<Effect>,
    ) {
        if self.phase != Phase::TypeResolving || seq != self.seq {
            debug!(label = %self.options.label, seq, "stale dry run reply");
            return;
        }
        let structure = match result {
            Ok(structure) => structure,
            Err(e) => return self.fatal(format!("{grid_type} structure dry run failed: {e}"), fx),
        };
        match grid_type {
            GridType::Portfolio => self.probe.portfolio = Some(structure),
            GridType::Primitives => self.probe.primitives = Some(structure),
        }
        let (Some(portfolio), Some(primitives)) = (&self.probe.portfolio, &self.probe.primitives)
        else {
            return;
        };

        let has_portfolio = !portfolio.is_empty();
        let has_primitives = !primitives.is_empty();
        fx.push(Effect::Emit(DataEvent::Types {
            portfolio: has_portfolio,
            primitives: has_primitives,
        }));

        let probe = std::mem::take(&mut self.probe);
        let winner = if has_portfolio {
            probe.portfolio.map(|s| (GridType::Portfolio, s))
        } else if has_primitives {
            probe.primitives.map(|s| (GridType::Primitives, s))
        } else {
            None
        };
        match winner {
            Some((grid_type, structure)) => {
                debug!(label = %self.options.label, %grid_type, "grid type resolved");
                self.grid_type = Some(grid_type);
                self.watching.insert(grid_type);
                if self.source.depgraph {
                    self.begin_structure(fx);
                } else {
                    self.apply_structure(structure, fx);
                }
            }
            None => {
                debug!(
                    label = %self.options.label,
                    "no populated grid yet, waiting for structure push"
                );
                self.watching.extend(GridType::ALL);
            }
        }
    }

    fn begin_structure(&mut self, fx: &mut Vec<Effect>) {
        let (Some(view_id), Some(grid_type)) = (self.view_id.clone(), self.grid_type) else {
            return self.fatal("structure resolution without a view", fx);
        };
        self.watching.insert(grid_type);
        if self.source.depgraph && self.graph_id.is_none() {
            let (Some(row), Some(col)) = (self.source.row, self.source.col) else {
                return self.fatal("dependency graph requested without a row and col", fx);
            };
            self.phase = Phase::DepgraphResolving;
            self.seq += 1;
            fx.push(Effect::CreateDepgraph {
                seq: self.seq,
                view_id,
                grid_type,
                row,
                col,
            });
            return;
        }
        self.phase = Phase::StructureResolving;
        self.seq += 1;
        fx.push(Effect::FetchStructure {
            seq: self.seq,
            target: GridTarget {
                view_id,
                grid_type,
                graph_id: self.graph_id.clone(),
            },
        });
    }

    fn depgraph_created(&mut self, seq: u64, result: ApiResult<String>, fx: &mut Vec<Effect>) {
        if self.phase != Phase::DepgraphResolving || seq != self.seq {
            return;
        }
        match result {
            Ok(graph_id) => {
                debug!(label = %self.options.label, %graph_id, "dependency graph created");
                self.graph_id = Some(graph_id);
                self.begin_structure(fx);
            }
            Err(e) => self.fatal(format!("dependency graph creation failed: {e}"), fx),
        }
    }

    fn structure_fetched(&mut self, seq: u64, result: ApiResult<Structure>, fx: &mut Vec<Effect>) {
        if self.phase != Phase::StructureResolving || seq != self.seq {
            debug!(label = %self.options.label, seq, "stale structure reply");
            return;
        }
        match result {
            Ok(structure) => self.apply_structure(structure, fx),
            Err(e) => self.fatal(format!("structure request failed: {e}"), fx),
        }
    }

    fn apply_structure(&mut self, structure: Structure, fx: &mut Vec<Effect>) {
        let (Some(view_id), Some(grid_type)) = (self.view_id.clone(), self.grid_type) else {
            return self.fatal("structure arrived without a view", fx);
        };
        let meta = Meta::from_structure(&structure, grid_type, self.source.depgraph);
        info!(
            label = %self.options.label,
            %view_id,
            %grid_type,
            rows = meta.data_rows,
            columns = meta.columns.len(),
            "structure applied"
        );
        self.structure = Some(structure.clone());
        self.phase = Phase::Ready;
        fx.push(Effect::Emit(DataEvent::Meta {
            meta: Arc::new(meta),
            connection: Connection {
                view_id: view_id.clone(),
                grid_type,
                graph_id: self.graph_id.clone(),
                structure: Some(structure),
            },
        }));
        if !self.init_requested {
            self.init_requested = true;
            fx.push(Effect::Publish(Outbound::GetInitData(ViewCommand { view_id })));
        }
        self.setup_viewport(fx);
    }

    fn structure_changed(&mut self, change: StructureChange, fx: &mut Vec<Effect>) {
        if self.view_id.as_deref() != Some(change.view_id.as_str())
            || change.graph_id != self.graph_id
            || !self.watching.contains(&change.grid_type)
        {
            return;
        }
        match self.phase {
            Phase::TypeResolving => self.begin_type_probe(fx),
            Phase::Ready | Phase::StructureResolving
                if Some(change.grid_type) == self.grid_type =>
            {
                info!(
                    label = %self.options.label,
                    grid_type = %change.grid_type,
                    "structure changed on server"
                );
                self.invalidate_viewport(fx);
                self.begin_structure(fx);
            }
            _ => {}
        }
    }

    fn change_view(&mut self, request: ViewRequest, fx: &mut Vec<Effect>) {
        match (&self.view_id, self.owns_view) {
            (Some(view_id), true) => fx.push(Effect::Publish(Outbound::ChangeView(
                ChangeViewRequest {
                    view_id: view_id.clone(),
                    view: request,
                },
            ))),
            _ => warn!(
                label = %self.options.label,
                "change view requested on a view this instance does not own"
            ),
        }
    }

    fn change_view_response(&mut self, response: ChangeViewResponse, fx: &mut Vec<Effect>) {
        if self.view_id.as_deref() != Some(response.view_id.as_str()) || !self.owns_view {
            return;
        }
        if !response.success {
            let message = response.message.unwrap_or_else(|| "no reason given".to_string());
            return self.fatal(format!("change view rejected: {message}"), fx);
        }
        self.invalidate_viewport(fx);
        if self.source.grid_type.is_some() || self.source.depgraph {
            self.begin_structure(fx);
        } else {
            self.begin_type_probe(fx);
        }
    }

    fn set_viewport(&mut self, viewport: Option<Viewport>, fx: &mut Vec<Effect>) {
        if !self.options.owns_viewport {
            warn!(
                label = %self.options.label,
                "viewport requested on a pooled connection, ignored"
            );
            return;
        }
        if viewport.is_some() && !self.connected {
            warn!(label = %self.options.label, "transport disconnected, viewport change refused");
            return;
        }
        match self.viewports.set(viewport) {
            SetOutcome::Unchanged => trace!(label = %self.options.label, "viewport unchanged"),
            SetOutcome::Rejected => {
                warn!(label = %self.options.label, "nonsensical viewport (no rows or cols) ignored")
            }
            SetOutcome::Cached => self.setup_viewport(fx),
            SetOutcome::Cleared { delete } => {
                self.batches.reset();
                if let (Some(viewport_id), Some(target)) = (delete, self.target()) {
                    fx.push(Effect::DeleteViewport {
                        target,
                        viewport_id,
                    });
                }
            }
        }
    }

    fn setup_viewport(&mut self, fx: &mut Vec<Effect>) {
        if self.phase != Phase::Ready || !self.connected || !self.options.owns_viewport {
            return;
        }
        if let Some(request) = self.viewports.setup() {
            self.send_viewport(request, fx);
        }
    }

    fn send_viewport(&mut self, request: ViewportRequest, fx: &mut Vec<Effect>) {
        let Some(target) = self.target() else {
            return;
        };
        self.stats.viewport_requests += 1;
        debug!(label = %self.options.label, version = request.version(), "sending viewport");
        fx.push(match request {
            ViewportRequest::Create { version, viewport } => Effect::CreateViewport {
                version,
                target,
                viewport,
            },
            ViewportRequest::Update {
                version,
                viewport_id,
                viewport,
            } => Effect::UpdateViewport {
                version,
                target,
                viewport_id,
                viewport,
            },
        });
    }

    fn viewport_created(&mut self, version: u64, result: ApiResult<String>, fx: &mut Vec<Effect>) {
        let viewport_id = match result {
            Ok(viewport_id) => viewport_id,
            Err(e) => {
                let current = self.viewports.is_current(version);
                self.viewports.creation_failed(version);
                if current {
                    return self.fatal(format!("viewport creation failed: {e}"), fx);
                }
                debug!(label = %self.options.label, version, "superseded viewport creation failed");
                return self.setup_viewport(fx);
            }
        };
        match self.viewports.created(version, viewport_id) {
            Created::Discard { viewport_id } => {
                debug!(label = %self.options.label, %viewport_id, "discarding superseded viewport");
                if let Some(target) = self.target() {
                    fx.push(Effect::DeleteViewport {
                        target,
                        viewport_id,
                    });
                }
                self.setup_viewport(fx);
            }
            Created::Established {
                follow_up: Some(request),
            } => self.send_viewport(request, fx),
            Created::Established { follow_up: None } => self.request_cycle(true, fx),
        }
    }

    fn viewport_updated(&mut self, version: u64, result: ApiResult<()>, fx: &mut Vec<Effect>) {
        if !self.viewports.is_current(version) {
            return;
        }
        match result {
            Ok(()) => self.request_cycle(true, fx),
            Err(e) => self.fatal(format!("viewport update failed: {e}"), fx),
        }
    }

    fn viewport_verified(
        &mut self,
        version: u64,
        result: ApiResult<ViewportState>,
        fx: &mut Vec<Effect>,
    ) {
        if !self.viewports.is_current(version) {
            return;
        }
        match result {
            Ok(state)
                if state.version == version
                    && self.viewports.viewport_id() == Some(state.viewport_id.as_str()) =>
            {
                self.request_cycle(true, fx)
            }
            _ => {
                warn!(
                    label = %self.options.label,
                    "viewport lost across reconnect, registering again"
                );
                self.invalidate_viewport(fx);
                self.setup_viewport(fx);
            }
        }
    }

    fn request_cycle(&mut self, immediate: bool, fx: &mut Vec<Effect>) {
        if self.phase != Phase::Ready || !self.connected {
            return;
        }
        let Some(reference) = self.viewport_ref() else {
            return;
        };
        let Some(grid_type) = self.grid_type else {
            return;
        };
        if self.viewports.request_cycle(immediate) {
            fx.push(Effect::Publish(Outbound::Update(UpdateRequest::new(
                grid_type, reference, immediate,
            ))));
        }
    }

    fn owns_batch(&self, viewport_id: &str) -> bool {
        self.viewports.viewport_id() == Some(viewport_id)
    }

    fn batch_start(&mut self, start: BatchStart) {
        if !self.owns_batch(&start.viewport_id) {
            return;
        }
        if let Err(warning) = self.batches.start(&start.viewport_id, start.version) {
            self.protocol_warning(warning);
        }
    }

    fn batch_update(&mut self, update: UpdateData) {
        if !self.owns_batch(&update.viewport_id) {
            return;
        }
        if let Err(warning) = self.batches.push(update.cells) {
            self.protocol_warning(warning);
        }
    }

    fn batch_end(&mut self, end: BatchEnd, fx: &mut Vec<Effect>) {
        if !self.owns_batch(&end.viewport_id) {
            return;
        }
        let batch = match self.batches.end(end.timestamp, end.duration_ms) {
            Ok(batch) => batch,
            Err(warning) => return self.protocol_warning(warning),
        };
        let deferred = self.viewports.end_cycle();
        if self.viewports.is_current(batch.version) {
            self.stats.batches_applied += 1;
            let duration_ms = batch.duration_ms;
            trace!(
                label = %self.options.label,
                version = batch.version,
                cells = batch.cells.len(),
                "batch applied"
            );
            fx.push(Effect::Emit(DataEvent::Data(Arc::new(batch))));
            fx.push(Effect::Emit(DataEvent::Cycle { duration_ms }));
        } else {
            self.stats.stale_batches += 1;
            debug!(
                label = %self.options.label,
                batch_version = batch.version,
                current_version = self.viewports.version(),
                "dropping stale batch"
            );
        }
        if deferred {
            self.request_cycle(true, fx);
        } else if self.running {
            self.request_cycle(false, fx);
        }
    }

    fn view_status(&mut self, status: ViewStatus, fx: &mut Vec<Effect>) {
        if self.view_id.as_deref() != Some(status.view_id.as_str()) {
            return;
        }
        let was_running = std::mem::replace(&mut self.running, status.running);
        if status.running && !was_running {
            self.request_cycle(false, fx);
        }
    }

    fn transport(&mut self, status: TransportStatus, fx: &mut Vec<Effect>) {
        match (self.connected, status.connected) {
            (true, false) => {
                warn!(label = %self.options.label, "transport lost");
                self.connected = false;
                self.batches.reset();
                self.viewports.clear_cycle();
                fx.push(Effect::Emit(DataEvent::Disconnect));
            }
            (false, true) => {
                info!(label = %self.options.label, "transport restored");
                self.connected = true;
                if self.phase != Phase::Ready {
                    return;
                }
                match (self.viewports.viewport_id().map(str::to_string), self.target()) {
                    (Some(viewport_id), Some(target)) => fx.push(Effect::VerifyViewport {
                        version: self.viewports.version(),
                        target,
                        viewport_id,
                    }),
                    _ => self.setup_viewport(fx),
                }
            }
            _ => {}
        }
    }

    fn view_command(&mut self, resume: bool, fx: &mut Vec<Effect>) {
        let Some(view_id) = self.view_id.clone() else {
            warn!(label = %self.options.label, "pause/resume before the view is resolved");
            return;
        };
        let command = ViewCommand { view_id };
        fx.push(Effect::Publish(if resume {
            Outbound::Resume(command)
        } else {
            Outbound::Pause(command)
        }));
    }

    fn cell_update_mode(&mut self, mode: CellUpdateMode, fx: &mut Vec<Effect>) {
        match (self.view_id.clone(), self.viewports.viewport_id()) {
            (Some(view_id), Some(viewport_id)) => fx.push(Effect::Publish(
                Outbound::CellUpdateMode(CellUpdateModeRequest {
                    view_id,
                    viewport_id: viewport_id.to_string(),
                    mode,
                }),
            )),
            _ => warn!(label = %self.options.label, "cell update mode needs a live viewport"),
        }
    }

    fn depgraph_mode(&mut self, enabled: bool, fx: &mut Vec<Effect>) {
        match (self.view_id.clone(), self.graph_id.clone()) {
            (Some(view_id), Some(graph_id)) => fx.push(Effect::Publish(Outbound::DepgraphMode(
                DepgraphModeRequest {
                    view_id,
                    graph_id,
                    enabled,
                },
            ))),
            _ => warn!(label = %self.options.label, "dependency graph mode needs a resolved graph"),
        }
    }

    /// Releases everything this instance registered, then goes quiet for good.
    fn disconnect(&mut self, kill: bool, fx: &mut Vec<Effect>) {
        info!(label = %self.options.label, kill, "disconnecting");
        if let (Some(viewport_id), Some(target)) =
            (self.viewports.viewport_id().map(str::to_string), self.target())
        {
            fx.push(Effect::DeleteViewport {
                target,
                viewport_id,
            });
        }
        if let (Some(view_id), Some(grid_type), Some(graph_id)) =
            (self.view_id.clone(), self.grid_type, self.graph_id.clone())
        {
            fx.push(Effect::DeleteDepgraph {
                view_id,
                grid_type,
                graph_id,
            });
        }
        if let (Some(view_id), true) = (self.view_id.clone(), self.owns_view) {
            fx.push(Effect::DeleteView { view_id });
        }
        self.clear_identity();
        fx.push(Effect::Shutdown {
            clear_listeners: kill,
        });
    }

    fn fatal(&mut self, message: impl Into<String>, fx: &mut Vec<Effect>) {
        let message = message.into();
        if self.fatal_fired {
            debug!(label = %self.options.label, %message, "fatal already reported, swallowing");
            return;
        }
        self.fatal_fired = true;
        let message = format!(
            "{} [{}]: {}",
            self.options.label,
            self.view_id.as_deref().unwrap_or("unresolved"),
            message
        );
        error!(label = %self.options.label, %message, "fatal data error");
        self.clear_identity();
        fx.push(Effect::Emit(DataEvent::Fatal(message)));
    }

    fn clear_identity(&mut self) {
        self.phase = Phase::Dead;
        self.view_id = None;
        self.graph_id = None;
        self.structure = None;
        self.viewports.reset();
        self.batches.reset();
    }

    fn invalidate_viewport(&mut self, fx: &mut Vec<Effect>) {
        self.batches.reset();
        if let (Some(viewport_id), Some(target)) = (self.viewports.invalidate(), self.target()) {
            fx.push(Effect::DeleteViewport {
                target,
                viewport_id,
            });
        }
    }

    fn protocol_warning(&mut self, warning: ProtocolWarning) {
        self.stats.protocol_warnings += 1;
        warn!(label = %self.options.label, "protocol warning: {}", warning);
    }

    fn target(&self) -> Option<GridTarget> {
        Some(GridTarget {
            view_id: self.view_id.clone()?,
            grid_type: self.grid_type?,
            graph_id: self.graph_id.clone(),
        })
    }

    fn viewport_ref(&self) -> Option<ViewportRef> {
        Some(ViewportRef {
            view_id: self.view_id.clone()?,
            viewport_id: self.viewports.viewport_id()?.to_string(),
            version: self.viewports.version(),
            graph_id: self.graph_id.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        api::ApiError,
        protocol::topics,
        types::{CellUpdate, CellValue, ColumnSet, Column, Node},
    };
    use chrono::Utc;
    use serde_json::json;

    fn structure(rows: u32) -> Structure {
        Structure {
            row_count: None,
            root_node: Some(Node {
                start: 0,
                end: rows - 1,
                children: vec![],
                collapsed: false,
            }),
            column_sets: vec![
                ColumnSet {
                    name: "fixed".into(),
                    columns: vec![Column {
                        header: "Label".into(),
                        description: String::new(),
                        value_type: None,
                        width: None,
                    }],
                },
                ColumnSet {
                    name: "risk".into(),
                    columns: vec![Column {
                        header: "PV".into(),
                        description: String::new(),
                        value_type: None,
                        width: None,
                    }],
                },
            ],
        }
    }

    fn known_source() -> SourceDescriptor {
        SourceDescriptor {
            view_id: Some("v1".into()),
            grid_type: Some(GridType::Portfolio),
            ..Default::default()
        }
    }

    fn events(fx: &[Effect]) -> Vec<&DataEvent> {
        fx.iter()
            .filter_map(|effect| match effect {
                Effect::Emit(event) => Some(event),
                _ => None,
            })
            .collect()
    }

    fn count_events(fx: &[Effect], name: &str) -> usize {
        events(fx).iter().filter(|e| e.name() == name).count()
    }

    fn publishes(fx: &[Effect]) -> Vec<&Outbound> {
        fx.iter()
            .filter_map(|effect| match effect {
                Effect::Publish(message) => Some(message),
                _ => None,
            })
            .collect()
    }

    fn viewport_mutations(fx: &[Effect]) -> usize {
        fx.iter()
            .filter(|e| {
                matches!(
                    e,
                    Effect::CreateViewport { .. } | Effect::UpdateViewport { .. }
                )
            })
            .count()
    }

    fn seq_of(fx: &[Effect]) -> u64 {
        fx.iter()
            .find_map(|effect| match effect {
                Effect::FetchStructure { seq, .. } | Effect::DryRun { seq, .. } => Some(*seq),
                _ => None,
            })
            .expect("structure request")
    }

    fn ready_session() -> Session {
        let mut session = Session::new(known_source(), SessionOptions::default());
        let fx = session.handle(Input::Start { parent: None });
        let seq = seq_of(&fx);
        session.handle(Input::StructureFetched {
            seq,
            result: Ok(structure(10)),
        });
        assert_eq!(session.phase(), Phase::Ready);
        session
    }

    fn window(rows: std::ops::Range<u32>) -> Viewport {
        Viewport::new(rows.collect(), vec![0, 1])
    }

    fn created_version(fx: &[Effect]) -> u64 {
        fx.iter()
            .find_map(|effect| match effect {
                Effect::CreateViewport { version, .. } => Some(*version),
                _ => None,
            })
            .expect("viewport creation")
    }

    /// Ready session with a live registration "vp-1" for rows 0..5.
    fn streaming_session() -> Session {
        let mut session = ready_session();
        let fx = session.handle(Input::SetViewport(Some(window(0..5))));
        let version = created_version(&fx);
        let fx = session.handle(Input::ViewportCreated {
            version,
            result: Ok("vp-1".into()),
        });
        assert_eq!(publishes(&fx).len(), 1);
        session
    }

    fn cells(n: u32) -> Vec<CellUpdate> {
        (0..n)
            .map(|row| CellUpdate {
                row,
                col: 1,
                value: CellValue {
                    v: json!(row as f64 * 1.5),
                    t: None,
                    h: None,
                },
            })
            .collect()
    }

    fn deliver_batch(session: &mut Session, version: u64, n: u32) -> Vec<Effect> {
        session.handle(Input::BatchStart(BatchStart {
            viewport_id: "vp-1".into(),
            version,
        }));
        for cell in cells(n) {
            session.handle(Input::Update(UpdateData {
                viewport_id: "vp-1".into(),
                cells: vec![cell],
            }));
        }
        session.handle(Input::BatchEnd(BatchEnd {
            viewport_id: "vp-1".into(),
            timestamp: Utc::now(),
            duration_ms: 40,
        }))
    }

    #[test]
    fn portfolio_source_resolves_type_then_fires_meta() {
        let source = SourceDescriptor {
            view_definition: Some("Equity View".into()),
            grid_type: Some(GridType::Portfolio),
            ..Default::default()
        };
        let mut session = Session::new(source, SessionOptions::default());
        let fx = session.handle(Input::Start { parent: None });
        assert!(matches!(fx.as_slice(), [Effect::CreateView(_)]));
        assert_eq!(session.phase(), Phase::ViewResolving);

        let fx = session.handle(Input::ViewCreated(Ok("v1".into())));
        let dry_runs: Vec<_> = fx
            .iter()
            .filter_map(|e| match e {
                Effect::DryRun { target, .. } => Some(target.grid_type),
                _ => None,
            })
            .collect();
        assert_eq!(dry_runs, vec![GridType::Portfolio, GridType::Primitives]);
        let seq = seq_of(&fx);

        let fx = session.handle(Input::DryRun {
            seq,
            grid_type: GridType::Primitives,
            result: Ok(Structure::default()),
        });
        assert!(fx.is_empty());
        let fx = session.handle(Input::DryRun {
            seq,
            grid_type: GridType::Portfolio,
            result: Ok(structure(8)),
        });
        let fired = events(&fx);
        assert!(matches!(
            fired[0],
            DataEvent::Types {
                portfolio: true,
                primitives: false
            }
        ));
        match fired[1] {
            DataEvent::Meta { meta, connection } => {
                assert_eq!(meta.data_rows, 8);
                assert_eq!(connection.grid_type, GridType::Portfolio);
                assert_eq!(connection.view_id, "v1");
            }
            other => panic!("expected meta, got {other:?}"),
        }
        assert_eq!(session.phase(), Phase::Ready);
    }

    #[test]
    fn row_count_used_without_root_node() {
        let mut session = Session::new(known_source(), SessionOptions::default());
        let seq = seq_of(&session.handle(Input::Start { parent: None }));
        let mut flat = structure(1);
        flat.root_node = None;
        flat.row_count = Some(42);
        let fx = session.handle(Input::StructureFetched {
            seq,
            result: Ok(flat),
        });
        match events(&fx)[0] {
            DataEvent::Meta { meta, .. } => assert_eq!(meta.data_rows, 42),
            other => panic!("expected meta, got {other:?}"),
        }
    }

    #[test]
    fn primitives_win_when_portfolio_is_empty() {
        let source = SourceDescriptor {
            view_id: Some("v1".into()),
            ..Default::default()
        };
        let mut session = Session::new(source, SessionOptions::default());
        let seq = seq_of(&session.handle(Input::Start { parent: None }));
        assert_eq!(session.phase(), Phase::TypeResolving);
        session.handle(Input::DryRun {
            seq,
            grid_type: GridType::Portfolio,
            result: Ok(Structure::default()),
        });
        session.handle(Input::DryRun {
            seq,
            grid_type: GridType::Primitives,
            result: Ok(structure(3)),
        });
        assert_eq!(
            session.connection().map(|c| c.grid_type),
            Some(GridType::Primitives)
        );
    }

    #[test]
    fn empty_probe_waits_for_structure_push() {
        let source = SourceDescriptor {
            view_id: Some("v1".into()),
            ..Default::default()
        };
        let mut session = Session::new(source, SessionOptions::default());
        let seq = seq_of(&session.handle(Input::Start { parent: None }));
        for grid_type in GridType::ALL {
            session.handle(Input::DryRun {
                seq,
                grid_type,
                result: Ok(Structure::default()),
            });
        }
        assert_eq!(session.phase(), Phase::TypeResolving);
        let fx = session.handle(Input::StructureChanged(StructureChange {
            view_id: "v1".into(),
            grid_type: GridType::Primitives,
            graph_id: None,
        }));
        assert_eq!(
            fx.iter()
                .filter(|e| matches!(e, Effect::DryRun { .. }))
                .count(),
            2
        );
    }

    #[test]
    fn duplicate_viewport_issues_one_mutation() {
        let mut session = ready_session();
        let first = session.handle(Input::SetViewport(Some(window(0..5))));
        let second = session.handle(Input::SetViewport(Some(window(0..5))));
        assert_eq!(viewport_mutations(&first), 1);
        assert_eq!(viewport_mutations(&second), 0);
        assert_eq!(session.stats().viewport_requests, 1);
    }

    #[test]
    fn nonsensical_viewport_is_ignored() {
        let mut session = ready_session();
        let fx = session.handle(Input::SetViewport(Some(Viewport::default())));
        assert!(fx.is_empty());
        assert_eq!(session.viewport_version(), 0);
    }

    #[test]
    fn viewport_waits_for_structure() {
        let mut session = Session::new(known_source(), SessionOptions::default());
        let seq = seq_of(&session.handle(Input::Start { parent: None }));
        let fx = session.handle(Input::SetViewport(Some(window(0..5))));
        assert_eq!(viewport_mutations(&fx), 0);
        let fx = session.handle(Input::StructureFetched {
            seq,
            result: Ok(structure(10)),
        });
        let meta_at = fx
            .iter()
            .position(|e| matches!(e, Effect::Emit(DataEvent::Meta { .. })))
            .unwrap();
        let create_at = fx
            .iter()
            .position(|e| matches!(e, Effect::CreateViewport { .. }))
            .unwrap();
        assert!(meta_at < create_at);
    }

    #[test]
    fn bracketed_batch_fires_once_with_every_cell() {
        let mut session = streaming_session();
        let version = session.viewport_version();
        let fx = deliver_batch(&mut session, version, 4);
        let fired = events(&fx);
        assert_eq!(fired.len(), 2);
        match fired[0] {
            DataEvent::Data(batch) => assert_eq!(batch.cells.len(), 4),
            other => panic!("expected data, got {other:?}"),
        }
        assert!(matches!(fired[1], DataEvent::Cycle { duration_ms: 40 }));
        assert_eq!(session.stats().batches_applied, 1);
    }

    #[test]
    fn unbracketed_update_is_a_warning() {
        let mut session = streaming_session();
        let fx = session.handle(Input::Update(UpdateData {
            viewport_id: "vp-1".into(),
            cells: cells(2),
        }));
        assert_eq!(count_events(&fx, "data"), 0);
        assert_eq!(session.stats().protocol_warnings, 1);
        let fx = session.handle(Input::BatchEnd(BatchEnd {
            viewport_id: "vp-1".into(),
            timestamp: Utc::now(),
            duration_ms: 1,
        }));
        assert_eq!(count_events(&fx, "data"), 0);
        assert_eq!(session.stats().protocol_warnings, 2);
    }

    #[test]
    fn foreign_viewport_messages_are_not_ours() {
        let mut session = streaming_session();
        session.handle(Input::Update(UpdateData {
            viewport_id: "someone-else".into(),
            cells: cells(2),
        }));
        assert_eq!(session.stats().protocol_warnings, 0);
    }

    #[test]
    fn stale_batch_is_dropped() {
        let mut session = streaming_session();
        let v1 = session.viewport_version();
        let fx = session.handle(Input::SetViewport(Some(window(5..10))));
        assert!(fx.iter().any(|e| matches!(e, Effect::UpdateViewport { .. })));
        let v2 = session.viewport_version();
        assert!(v2 > v1);

        let fx = deliver_batch(&mut session, v1, 3);
        assert_eq!(count_events(&fx, "data"), 0);
        assert_eq!(session.stats().stale_batches, 1);

        let fx = deliver_batch(&mut session, v2, 3);
        assert_eq!(count_events(&fx, "data"), 1);
    }

    #[test]
    fn immediate_requests_are_coalesced() {
        let mut session = streaming_session();
        // first immediate request went out when the viewport was established
        let v = session.viewport_version();
        let fx = session.handle(Input::ViewportUpdated {
            version: v,
            result: Ok(()),
        });
        assert!(publishes(&fx).is_empty());
        let fx = session.handle(Input::ViewportUpdated {
            version: v,
            result: Ok(()),
        });
        assert!(publishes(&fx).is_empty());

        let fx = deliver_batch(&mut session, v, 1);
        let sent = publishes(&fx);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].topic(), topics::UPDATE_REQUEST);
        assert!(matches!(sent[0], Outbound::Update(r) if r.immediate_response));

        // nothing pending and not running: the chain stops
        let fx = deliver_batch(&mut session, v, 1);
        assert!(publishes(&fx).is_empty());
    }

    #[test]
    fn running_view_requests_next_cycle() {
        let mut session = streaming_session();
        session.handle(Input::ViewStatus(ViewStatus {
            view_id: "v1".into(),
            running: true,
        }));
        assert!(session.is_running());
        let v = session.viewport_version();
        deliver_batch(&mut session, v, 1);
        let fx = deliver_batch(&mut session, v, 1);
        let sent = publishes(&fx);
        assert_eq!(sent.len(), 1);
        assert!(matches!(sent[0], Outbound::Update(r) if !r.immediate_response));
    }

    #[test]
    fn fatal_fires_once() {
        let source = SourceDescriptor {
            view_id: Some("v1".into()),
            ..Default::default()
        };
        let mut session = Session::new(source, SessionOptions::default());
        let seq = seq_of(&session.handle(Input::Start { parent: None }));
        let first = session.handle(Input::DryRun {
            seq,
            grid_type: GridType::Portfolio,
            result: Err(ApiError::new("boom")),
        });
        let second = session.handle(Input::DryRun {
            seq,
            grid_type: GridType::Primitives,
            result: Err(ApiError::new("boom again")),
        });
        let third = session.handle(Input::ParentFatal("parent died".into()));
        assert_eq!(count_events(&first, "fatal"), 1);
        assert_eq!(count_events(&second, "fatal"), 0);
        assert_eq!(count_events(&third, "fatal"), 0);
        assert_eq!(session.phase(), Phase::Dead);
        assert!(session.view_id().is_none());
        match events(&first)[0] {
            DataEvent::Fatal(message) => assert!(message.starts_with("data [v1]:")),
            other => panic!("expected fatal, got {other:?}"),
        }
    }

    #[test]
    fn parent_fatal_is_wrapped() {
        let options = SessionOptions {
            label: "grid".into(),
            has_parent: true,
            ..Default::default()
        };
        let mut session = Session::new(SourceDescriptor::default(), options);
        session.handle(Input::Start { parent: None });
        assert_eq!(session.phase(), Phase::AwaitingParent);
        let fx = session.handle(Input::ParentFatal("pool [v1]: no".into()));
        match events(&fx)[0] {
            DataEvent::Fatal(message) => {
                assert!(message.contains("caught fatal error from parent"))
            }
            other => panic!("expected fatal, got {other:?}"),
        }
    }

    #[test]
    fn disconnect_releases_and_ignores_late_replies() {
        let mut session = streaming_session();
        let fx = session.handle(Input::Disconnect);
        assert!(fx.iter().any(|e| matches!(e, Effect::DeleteViewport { .. })));
        assert!(matches!(
            fx.last(),
            Some(Effect::Shutdown {
                clear_listeners: false
            })
        ));
        assert!(session.viewport_id().is_none());
        let fx = deliver_batch(&mut session, 1, 2);
        assert!(fx.is_empty());
        let fx = session.handle(Input::StructureFetched {
            seq: 1,
            result: Ok(structure(4)),
        });
        assert!(fx.is_empty());
    }

    #[test]
    fn owned_view_is_deleted_on_disconnect() {
        let source = SourceDescriptor {
            view_definition: Some("Equity View".into()),
            ..Default::default()
        };
        let mut session = Session::new(source, SessionOptions::default());
        session.handle(Input::Start { parent: None });
        session.handle(Input::ViewCreated(Ok("v9".into())));
        let fx = session.handle(Input::Kill);
        assert!(fx
            .iter()
            .any(|e| matches!(e, Effect::DeleteView { view_id } if view_id == "v9")));
        assert!(matches!(
            fx.last(),
            Some(Effect::Shutdown {
                clear_listeners: true
            })
        ));
    }

    #[test]
    fn structure_push_deletes_viewport_before_refetch() {
        let mut session = streaming_session();
        let before = session.viewport_version();
        let fx = session.handle(Input::StructureChanged(StructureChange {
            view_id: "v1".into(),
            grid_type: GridType::Portfolio,
            graph_id: None,
        }));
        let delete_at = fx
            .iter()
            .position(|e| {
                matches!(e, Effect::DeleteViewport { viewport_id, .. } if viewport_id == "vp-1")
            })
            .unwrap();
        let fetch_at = fx
            .iter()
            .position(|e| matches!(e, Effect::FetchStructure { .. }))
            .unwrap();
        assert!(delete_at < fetch_at);
        assert!(session.viewport_id().is_none());

        let seq = seq_of(&fx);
        let fx = session.handle(Input::StructureFetched {
            seq,
            result: Ok(structure(12)),
        });
        assert_eq!(count_events(&fx, "meta"), 1);
        assert!(created_version(&fx) > before);
    }

    #[test]
    fn pooled_child_reuses_parent_structure() {
        let options = SessionOptions {
            has_parent: true,
            ..Default::default()
        };
        let source = SourceDescriptor {
            grid_type: Some(GridType::Portfolio),
            ..Default::default()
        };
        let mut session = Session::new(source, options);
        let fx = session.handle(Input::Start {
            parent: Some(Connection {
                view_id: "v1".into(),
                grid_type: GridType::Portfolio,
                graph_id: None,
                structure: Some(structure(6)),
            }),
        });
        assert_eq!(session.phase(), Phase::Ready);
        assert!(!fx.iter().any(|e| matches!(e, Effect::FetchStructure { .. })));
        assert_eq!(count_events(&fx, "meta"), 1);
    }

    #[test]
    fn parent_meta_ahead_of_start_is_adopted() {
        let options = SessionOptions {
            has_parent: true,
            ..Default::default()
        };
        let source = SourceDescriptor {
            grid_type: Some(GridType::Portfolio),
            ..Default::default()
        };
        let parent = Connection {
            view_id: "v1".into(),
            grid_type: GridType::Portfolio,
            graph_id: None,
            structure: Some(structure(6)),
        };

        let mut session = Session::new(source.clone(), options.clone());
        assert!(session.handle(Input::ParentMeta(parent.clone())).is_empty());
        assert_eq!(session.phase(), Phase::Uninitialized);
        let fx = session.handle(Input::Start { parent: None });
        assert_eq!(session.phase(), Phase::Ready);
        assert_eq!(count_events(&fx, "meta"), 1);
        assert_eq!(session.connection().map(|c| c.view_id), Some("v1".to_string()));

        // the same meta arriving both ways is announced once
        let mut session = Session::new(source, options);
        session.handle(Input::ParentMeta(parent.clone()));
        let fx = session.handle(Input::Start {
            parent: Some(parent),
        });
        assert_eq!(session.phase(), Phase::Ready);
        assert_eq!(count_events(&fx, "meta"), 1);
    }

    #[test]
    fn depgraph_child_creates_graph_then_fetches_structure() {
        let options = SessionOptions {
            has_parent: true,
            ..Default::default()
        };
        let source = SourceDescriptor {
            depgraph: true,
            row: Some(3),
            col: Some(2),
            ..Default::default()
        };
        let mut session = Session::new(source, options);
        session.handle(Input::Start { parent: None });
        let fx = session.handle(Input::ParentMeta(Connection {
            view_id: "v1".into(),
            grid_type: GridType::Portfolio,
            graph_id: None,
            structure: Some(structure(6)),
        }));
        let seq = match fx.as_slice() {
            [Effect::CreateDepgraph { seq, row: 3, col: 2, .. }] => *seq,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(session.phase(), Phase::DepgraphResolving);
        let fx = session.handle(Input::DepgraphCreated {
            seq,
            result: Ok("g1".into()),
        });
        match fx.as_slice() {
            [Effect::FetchStructure { target, .. }] => {
                assert_eq!(target.graph_id.as_deref(), Some("g1"))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn transport_loss_refuses_viewports_until_restored() {
        let mut session = streaming_session();
        let fx = session.handle(Input::Transport(TransportStatus { connected: false }));
        assert_eq!(count_events(&fx, "disconnect"), 1);
        let fx = session.handle(Input::SetViewport(Some(window(3..9))));
        assert!(fx.is_empty());

        let fx = session.handle(Input::Transport(TransportStatus { connected: true }));
        let version = match fx.as_slice() {
            [Effect::VerifyViewport { version, .. }] => *version,
            other => panic!("unexpected {other:?}"),
        };
        let fx = session.handle(Input::ViewportVerified {
            version,
            result: Err(ApiError::new("unknown viewport")),
        });
        assert!(fx.iter().any(|e| matches!(e, Effect::CreateViewport { .. })));
    }

    #[test]
    fn pooled_parent_refuses_viewports() {
        let options = SessionOptions {
            label: "pool".into(),
            owns_viewport: false,
            has_parent: false,
        };
        let mut session = Session::new(known_source(), options);
        let seq = seq_of(&session.handle(Input::Start { parent: None }));
        session.handle(Input::StructureFetched {
            seq,
            result: Ok(structure(3)),
        });
        let fx = session.handle(Input::SetViewport(Some(window(0..2))));
        assert!(fx.is_empty());
    }
}
