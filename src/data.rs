/// file: src/data.rs
/// description: Data instance actor: runs a Session, performs its effects, fans out events
use crate::{
    api::{ApiResult, GridApi},
    bus::{Bus, BusMessage, decode},
    error::SyncError,
    events::{DataEvent, EventHub, EventReceiver, ListenerId},
    monitoring,
    pool::{ConnectionPool, PoolMember},
    protocol::{CellUpdateMode, Outbound, topics},
    session::{Effect, Input, Session, SessionOptions, SessionStats},
    types::{Connection, SourceDescriptor, ViewRequest, Viewport},
};
use bytes::Bytes;
use parking_lot::Mutex;
use std::{
    future::Future,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
};
use tokio::{
    sync::{broadcast, mpsc, watch},
    task::JoinHandle,
};
use tracing::{Instrument, debug, info_span, trace, warn};

pub type DataPool = ConnectionPool<DataHandle>;

static NEXT_DATA_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone)]
pub struct DataOptions {
    /// Skip the pool and negotiate a private connection.
    pub bypass: bool,
    pub label: String,
}

impl Default for DataOptions {
    fn default() -> Self {
        Self {
            bypass: false,
            label: "data".to_string(),
        }
    }
}

impl DataOptions {
    pub fn bypass(label: impl Into<String>) -> Self {
        Self {
            bypass: true,
            label: label.into(),
        }
    }
}

/// Collaborators every Data instance is built against.
#[derive(Clone)]
pub struct DataContext {
    pub api: Arc<dyn GridApi>,
    pub bus: Arc<dyn Bus>,
    pub pool: Arc<DataPool>,
}

impl DataContext {
    pub fn new(api: Arc<dyn GridApi>, bus: Arc<dyn Bus>) -> Self {
        let pool = Arc::new_cyclic(|pool: &Weak<DataPool>| {
            let (api, bus, pool) = (api.clone(), bus.clone(), pool.clone());
            ConnectionPool::new(move |source| {
                spawn_instance(
                    source,
                    Role::Parent,
                    "pool".to_string(),
                    api.clone(),
                    bus.clone(),
                    pool.clone(),
                )
            })
        });
        Self { api, bus, pool }
    }

    pub fn shutdown(&self) {
        self.pool.shutdown();
    }
}

/// Entry point for consumers.
pub struct Data;

impl Data {
    /// Spawns the actor and returns its handle. Must be called inside a tokio runtime.
    pub fn spawn(
        source: SourceDescriptor,
        options: DataOptions,
        context: &DataContext,
    ) -> DataHandle {
        let role = if options.bypass {
            Role::Bypass
        } else {
            Role::Child
        };
        spawn_instance(
            source,
            role,
            options.label,
            context.api.clone(),
            context.bus.clone(),
            Arc::downgrade(&context.pool),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    /// Pooled parent: negotiates on behalf of its children, owns no viewport.
    Parent,
    Child,
    Bypass,
}

#[derive(Debug)]
struct Shared {
    events: EventHub<DataEvent>,
    connection: watch::Sender<Option<Connection>>,
    fatal: Mutex<Option<String>>,
    stats: Mutex<SessionStats>,
}

struct Inner {
    id: u64,
    label: String,
    source: SourceDescriptor,
    role: Role,
    mailbox: mpsc::UnboundedSender<Input>,
    shared: Arc<Shared>,
    pool: Weak<DataPool>,
}

/// Cheap, cloneable handle to a running Data instance. The actor stops once it is
/// disconnected, killed, or every handle is dropped.
#[derive(Clone)]
pub struct DataHandle {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for DataHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataHandle")
            .field("id", &self.inner.id)
            .field("label", &self.inner.label)
            .field("role", &self.inner.role)
            .finish()
    }
}

impl DataHandle {
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn source(&self) -> &SourceDescriptor {
        &self.inner.source
    }

    pub fn is_bypass(&self) -> bool {
        self.inner.role == Role::Bypass
    }

    pub fn on(&self) -> (ListenerId, EventReceiver<DataEvent>) {
        self.inner.shared.events.on()
    }

    pub fn off(&self, listener: ListenerId) -> bool {
        self.inner.shared.events.off(listener)
    }

    /// Sets (or with `None` clears) the visible window. Chainable.
    pub fn viewport(&self, viewport: Option<Viewport>) -> &Self {
        if let Err(e) = self.send(Input::SetViewport(viewport)) {
            debug!(label = %self.inner.label, error = %e, "viewport change dropped");
        }
        self
    }

    pub fn pause(&self) -> Result<(), SyncError> {
        self.send(Input::Pause)
    }

    pub fn resume(&self) -> Result<(), SyncError> {
        self.send(Input::Resume)
    }

    pub fn set_cell_update_mode(&self, mode: CellUpdateMode) -> Result<(), SyncError> {
        self.send(Input::SetCellUpdateMode(mode))
    }

    pub fn set_depgraph_mode(&self, enabled: bool) -> Result<(), SyncError> {
        self.send(Input::SetDepgraphMode(enabled))
    }

    pub fn change_view(&self, request: ViewRequest) -> Result<(), SyncError> {
        self.send(Input::ChangeView(request))
    }

    /// Releases every server-side resource this instance holds, then leaves the
    /// pool (tearing down the parent if this was its last child). The viewport
    /// delete is queued ahead of the parent's view delete.
    pub fn disconnect(&self) -> Result<(), SyncError> {
        let sent = self.send(Input::Disconnect);
        self.leave_pool();
        sent
    }

    /// Like `disconnect`, and drops every listener.
    pub fn kill(&self) -> Result<(), SyncError> {
        let sent = self.send(Input::Kill);
        self.leave_pool();
        sent
    }

    pub fn connection(&self) -> Option<Connection> {
        self.inner.shared.connection.borrow().clone()
    }

    pub fn watch_connection(&self) -> watch::Receiver<Option<Connection>> {
        self.inner.shared.connection.subscribe()
    }

    /// Message of the fatal error, once one has been fired.
    pub fn fatal(&self) -> Option<String> {
        self.inner.shared.fatal.lock().clone()
    }

    pub fn stats(&self) -> SessionStats {
        self.inner.shared.stats.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.mailbox.is_closed()
    }

    /// Resolves once the actor has stopped.
    pub async fn closed(&self) {
        self.inner.mailbox.closed().await
    }

    fn leave_pool(&self) {
        if let Some(pool) = self.inner.pool.upgrade() {
            pool.remove(self.inner.id);
        }
    }

    fn send(&self, input: Input) -> Result<(), SyncError> {
        self.inner
            .mailbox
            .send(input)
            .map_err(|_| SyncError::Closed {
                label: self.inner.label.clone(),
            })
    }
}

impl PoolMember for DataHandle {
    fn id(&self) -> u64 {
        self.inner.id
    }

    fn source(&self) -> &SourceDescriptor {
        &self.inner.source
    }

    fn is_pooled(&self) -> bool {
        self.inner.role == Role::Parent
    }

    fn disconnect_detached(&self) {
        if self.send(Input::Disconnect).is_err() {
            trace!(label = %self.inner.label, "already stopped");
        }
    }
}

fn spawn_instance(
    source: SourceDescriptor,
    role: Role,
    label: String,
    api: Arc<dyn GridApi>,
    bus: Arc<dyn Bus>,
    pool: Weak<DataPool>,
) -> DataHandle {
    let id = NEXT_DATA_ID.fetch_add(1, Ordering::Relaxed);
    let (mailbox, inbox) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        events: EventHub::new(),
        connection: watch::channel(None).0,
        fatal: Mutex::new(None),
        stats: Mutex::new(SessionStats::default()),
    });
    let handle = DataHandle {
        inner: Arc::new(Inner {
            id,
            label: label.clone(),
            source: source.clone(),
            role,
            mailbox: mailbox.clone(),
            shared: shared.clone(),
            pool: pool.clone(),
        }),
    };

    // subscribe before anything is requested so no reply can overtake us
    let mut forwarders = vec![forward_bus(bus.subscribe_all(), mailbox.downgrade())];

    let parent = match role {
        Role::Parent => None,
        Role::Bypass => {
            if let Some(pool) = pool.upgrade() {
                pool.add(handle.clone());
            }
            None
        }
        Role::Child => pool.upgrade().and_then(|pool| pool.parent(&handle)),
    };

    let mut parent_link = None;
    let mut parent_connection = None;
    let mut parent_fatal = None;
    if let Some(parent) = parent {
        let (listener, events) = parent.on();
        forwarders.push(forward_parent(events, mailbox.downgrade()));
        parent_connection = parent.connection();
        parent_fatal = parent.fatal();
        parent_link = Some((parent, listener));
    }

    let options = SessionOptions {
        label: label.clone(),
        owns_viewport: role != Role::Parent,
        has_parent: parent_link.is_some(),
    };
    let _ = mailbox.send(Input::Start {
        parent: parent_connection,
    });
    if let Some(message) = parent_fatal {
        let _ = mailbox.send(Input::ParentFatal(message));
    }

    let actor = DataActor {
        id,
        session: Session::new(source, options),
        shared,
        api,
        bus,
        mailbox: mailbox.downgrade(),
        pool,
        parent: parent_link,
        forwarders,
    };
    drop(mailbox);

    let span = info_span!("data", id, label = %label);
    tokio::spawn(actor.run(inbox).instrument(span));
    handle
}

struct DataActor {
    id: u64,
    session: Session,
    shared: Arc<Shared>,
    api: Arc<dyn GridApi>,
    bus: Arc<dyn Bus>,
    mailbox: mpsc::WeakUnboundedSender<Input>,
    pool: Weak<DataPool>,
    parent: Option<(DataHandle, ListenerId)>,
    forwarders: Vec<JoinHandle<()>>,
}

impl DataActor {
    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<Input>) {
        let mut stopped = false;
        while let Some(input) = inbox.recv().await {
            if self.step(input) {
                stopped = true;
                break;
            }
        }
        if !stopped {
            debug!("every handle dropped, releasing server resources");
            if let Some(pool) = self.pool.upgrade() {
                pool.remove(self.id);
            }
            self.step(Input::Kill);
        }
        self.finish();
    }

    /// Feeds one input through the session. Returns true once the session asked
    /// to shut down.
    fn step(&mut self, input: Input) -> bool {
        let before = self.session.stats().clone();
        let effects = self.session.handle(input);
        let after = self.session.stats();
        monitoring::record_session(&before, after);
        *self.shared.stats.lock() = after.clone();
        self.apply(effects)
    }

    fn apply(&mut self, effects: Vec<Effect>) -> bool {
        for effect in effects {
            match effect {
                Effect::CreateView(request) => {
                    let api = self.api.clone();
                    self.request(
                        async move { Input::ViewCreated(api.create_view(&request).await) },
                    );
                }
                Effect::DryRun { seq, target } => {
                    let api = self.api.clone();
                    self.request(async move {
                        let result = api.structure(&target, true).await;
                        Input::DryRun {
                            seq,
                            grid_type: target.grid_type,
                            result,
                        }
                    });
                }
                Effect::FetchStructure { seq, target } => {
                    let api = self.api.clone();
                    self.request(async move {
                        let result = api.structure(&target, false).await;
                        Input::StructureFetched { seq, result }
                    });
                }
                Effect::CreateDepgraph {
                    seq,
                    view_id,
                    grid_type,
                    row,
                    col,
                } => {
                    let api = self.api.clone();
                    self.request(async move {
                        let result = api.create_depgraph(&view_id, grid_type, row, col).await;
                        Input::DepgraphCreated { seq, result }
                    });
                }
                Effect::CreateViewport {
                    version,
                    target,
                    viewport,
                } => {
                    let api = self.api.clone();
                    self.request(async move {
                        let result = api.create_viewport(&target, &viewport, version).await;
                        Input::ViewportCreated { version, result }
                    });
                }
                Effect::UpdateViewport {
                    version,
                    target,
                    viewport_id,
                    viewport,
                } => {
                    let api = self.api.clone();
                    self.request(async move {
                        let result = api
                            .update_viewport(&target, &viewport_id, &viewport, version)
                            .await;
                        Input::ViewportUpdated { version, result }
                    });
                }
                Effect::VerifyViewport {
                    version,
                    target,
                    viewport_id,
                } => {
                    let api = self.api.clone();
                    self.request(async move {
                        let result = api.get_viewport(&target, &viewport_id).await;
                        Input::ViewportVerified { version, result }
                    });
                }
                Effect::DeleteViewport {
                    target,
                    viewport_id,
                } => {
                    let api = self.api.clone();
                    release(format!("viewport {viewport_id} of {target}"), async move {
                        api.delete_viewport(&target, &viewport_id).await
                    });
                }
                Effect::DeleteDepgraph {
                    view_id,
                    grid_type,
                    graph_id,
                } => {
                    let api = self.api.clone();
                    release(format!("dependency graph {graph_id}"), async move {
                        api.delete_depgraph(&view_id, grid_type, &graph_id).await
                    });
                }
                Effect::DeleteView { view_id } => {
                    let api = self.api.clone();
                    release(format!("view {view_id}"), async move {
                        api.delete_view(&view_id).await
                    });
                }
                Effect::Publish(message) => self.publish(message),
                Effect::Emit(event) => self.emit(event),
                Effect::Shutdown { clear_listeners } => {
                    if clear_listeners {
                        self.shared.events.clear();
                    }
                    return true;
                }
            }
        }
        false
    }

    /// Runs a server call off the actor and posts its reply back as an input.
    /// Replies arriving after shutdown have nowhere to go and are dropped.
    fn request(&self, call: impl Future<Output = Input> + Send + 'static) {
        let mailbox = self.mailbox.clone();
        tokio::spawn(
            async move {
                let input = call.await;
                if let Some(mailbox) = mailbox.upgrade() {
                    let _ = mailbox.send(input);
                }
            }
            .in_current_span(),
        );
    }

    fn publish(&self, message: Outbound) {
        let topic = message.topic();
        let sent = message
            .to_json()
            .map_err(SyncError::from)
            .and_then(|payload| {
                self.bus
                    .publish(topic, Bytes::from(payload))
                    .map_err(SyncError::from)
            });
        match sent {
            Ok(()) => trace!(topic, "published"),
            Err(e) => warn!(topic, error = %e, "publish failed"),
        }
    }

    fn emit(&self, event: DataEvent) {
        match &event {
            DataEvent::Meta { connection, .. } => {
                self.shared.connection.send_replace(Some(connection.clone()));
            }
            DataEvent::Fatal(message) => {
                monitoring::FATAL_COUNTER.increment(1);
                *self.shared.fatal.lock() = Some(message.clone());
                self.shared.connection.send_replace(None);
            }
            _ => {}
        }
        let name = event.name();
        let reached = self.shared.events.fire(event);
        trace!(event = name, reached, "event fired");
    }

    fn finish(&mut self) {
        for forwarder in self.forwarders.drain(..) {
            forwarder.abort();
        }
        if let Some((parent, listener)) = self.parent.take() {
            parent.off(listener);
        }
        self.shared.connection.send_replace(None);
        debug!(stats = ?self.session.stats(), "data instance stopped");
    }
}

/// Fire-and-forget release of a server resource; failures are only logged.
fn release(what: String, call: impl Future<Output = ApiResult<()>> + Send + 'static) {
    tokio::spawn(
        async move {
            match call.await {
                Ok(()) => debug!("released {what}"),
                Err(e) => warn!(error = %e, "failed to release {what}"),
            }
        }
        .in_current_span(),
    );
}

/// Maps a bus message onto a session input. `None` for topics a Data instance
/// does not consume.
fn inbound(message: &BusMessage) -> Option<serde_json::Result<Input>> {
    let input = match message.topic.as_str() {
        topics::TRANSPORT => decode(message).map(Input::Transport),
        topics::STATUS | topics::INIT_DATA => decode(message).map(Input::ViewStatus),
        topics::CHANGE_VIEW_RESPONSE => decode(message).map(Input::ChangeViewResponse),
        topics::PORTFOLIO_UPDATES | topics::PRIMITIVES_UPDATES => {
            decode(message).map(Input::Update)
        }
        topics::PORTFOLIO_COLUMNS | topics::PRIMITIVES_COLUMNS => {
            decode(message).map(Input::StructureChanged)
        }
        topics::CONTROL_START => decode(message).map(Input::BatchStart),
        topics::CONTROL_END => decode(message).map(Input::BatchEnd),
        _ => return None,
    };
    Some(input)
}

fn forward_bus(
    mut messages: broadcast::Receiver<BusMessage>,
    mailbox: mpsc::WeakUnboundedSender<Input>,
) -> JoinHandle<()> {
    tokio::spawn(
        async move {
            loop {
                let message = match messages.recv().await {
                    Ok(message) => message,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "bus subscriber lagged, messages lost");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let input = match inbound(&message) {
                    None => continue,
                    Some(Ok(input)) => input,
                    Some(Err(e)) => {
                        let error = SyncError::InvalidMessage {
                            topic: message.topic.clone(),
                            reason: e.to_string(),
                        };
                        warn!(%error, "discarding bus message");
                        continue;
                    }
                };
                let Some(mailbox) = mailbox.upgrade() else {
                    break;
                };
                if mailbox.send(input).is_err() {
                    break;
                }
            }
        }
        .in_current_span(),
    )
}

fn forward_parent(
    mut events: EventReceiver<DataEvent>,
    mailbox: mpsc::WeakUnboundedSender<Input>,
) -> JoinHandle<()> {
    tokio::spawn(
        async move {
            while let Some(event) = events.recv().await {
                let input = match event {
                    DataEvent::Meta { connection, .. } => Input::ParentMeta(connection),
                    DataEvent::Fatal(message) => Input::ParentFatal(message),
                    _ => continue,
                };
                let Some(mailbox) = mailbox.upgrade() else {
                    break;
                };
                if mailbox.send(input).is_err() {
                    break;
                }
            }
        }
        .in_current_span(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{BatchStart, StructureChange};
    use crate::types::GridType;

    fn message<T: serde::Serialize>(topic: &str, body: &T) -> BusMessage {
        BusMessage {
            topic: topic.to_string(),
            payload: Bytes::from(serde_json::to_vec(body).unwrap()),
        }
    }

    #[test]
    fn inbound_topics_map_to_inputs() {
        let start = message(
            topics::CONTROL_START,
            &BatchStart {
                viewport_id: "vp".into(),
                version: 2,
            },
        );
        assert!(matches!(inbound(&start), Some(Ok(Input::BatchStart(s))) if s.version == 2));

        let change = message(
            topics::PRIMITIVES_COLUMNS,
            &StructureChange {
                view_id: "v1".into(),
                grid_type: GridType::Primitives,
                graph_id: None,
            },
        );
        assert!(matches!(inbound(&change), Some(Ok(Input::StructureChanged(_)))));
    }

    #[test]
    fn produced_topics_are_not_consumed() {
        let request = message(topics::UPDATE_REQUEST, &serde_json::json!({}));
        assert!(inbound(&request).is_none());
    }

    #[test]
    fn malformed_payload_is_an_error() {
        let bad = BusMessage {
            topic: topics::CONTROL_END.to_string(),
            payload: Bytes::from_static(b"{\"viewportId\": 3}"),
        };
        assert!(matches!(inbound(&bad), Some(Err(_))));
    }
}
