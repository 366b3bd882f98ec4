/// file: src/pool.rs
/// description: reference-counted sharing of upstream subscriptions between Data instances
use crate::{
    monitoring,
    types::{PoolKey, SourceDescriptor},
};
use parking_lot::Mutex;
use tracing::{debug, info};

/// What the pool needs to know about the instances it tracks.
pub trait PoolMember: Clone + Send + Sync + 'static {
    fn id(&self) -> u64;
    fn source(&self) -> &SourceDescriptor;
    /// Pooled parents themselves are never pooled again.
    fn is_pooled(&self) -> bool;
    /// Tear down without calling back into the pool.
    fn disconnect_detached(&self);
}

type Factory<M> = Box<dyn Fn(SourceDescriptor) -> M + Send + Sync>;

struct Parent<M> {
    key: PoolKey,
    member: M,
    refcount: Vec<u64>,
}

struct PoolState<M> {
    parents: Vec<Parent<M>>,
    children: Vec<M>,
}

/// Shares one upstream subscription across every child whose source descriptor
/// matches after the viewport-only fields are stripped.
///
/// Each mutation runs entirely under one lock, so a refcount is never observed
/// half-updated. Parent disconnects happen after the lock is released.
pub struct ConnectionPool<M: PoolMember> {
    factory: Factory<M>,
    state: Mutex<PoolState<M>>,
}

impl<M: PoolMember> ConnectionPool<M> {
    pub fn new(factory: impl Fn(SourceDescriptor) -> M + Send + Sync + 'static) -> Self {
        Self {
            factory: Box::new(factory),
            state: Mutex::new(PoolState {
                parents: Vec::new(),
                children: Vec::new(),
            }),
        }
    }

    /// Parent for `child`, created on first use. `None` for pooled instances.
    pub fn parent(&self, child: &M) -> Option<M> {
        if child.is_pooled() {
            return None;
        }
        let key = child.source().pool_key();
        let mut state = self.state.lock();
        if let Some(parent) = state.parents.iter_mut().find(|p| p.key == key) {
            parent.refcount.push(child.id());
            debug!(
                child = child.id(),
                parent = parent.member.id(),
                refs = parent.refcount.len(),
                "joined pooled parent"
            );
            return Some(parent.member.clone());
        }

        let member = (self.factory)(child.source().parent_source());
        info!(child = child.id(), parent = member.id(), "created pooled parent");
        state.parents.push(Parent {
            key,
            member: member.clone(),
            refcount: vec![child.id()],
        });
        monitoring::POOL_PARENTS_GAUGE.set(state.parents.len() as f64);
        Some(member)
    }

    /// Tracks a non-pooled instance so `shutdown` can release it.
    pub fn add(&self, child: M) {
        let mut state = self.state.lock();
        if state.children.iter().all(|c| c.id() != child.id()) {
            state.children.push(child);
        }
    }

    /// Drops `child_id` from whichever parent references it. Returns true when that
    /// was the last reference and the parent was torn down.
    pub fn remove(&self, child_id: u64) -> bool {
        let released = {
            let mut state = self.state.lock();
            state.children.retain(|c| c.id() != child_id);
            let emptied = state.parents.iter_mut().position(|parent| {
                match parent.refcount.iter().position(|id| *id == child_id) {
                    Some(at) => {
                        parent.refcount.remove(at);
                        parent.refcount.is_empty()
                    }
                    None => false,
                }
            });
            let released = emptied.map(|at| state.parents.remove(at).member);
            monitoring::POOL_PARENTS_GAUGE.set(state.parents.len() as f64);
            released
        };

        match released {
            Some(parent) => {
                info!(
                    child = child_id,
                    parent = parent.id(),
                    "last child left, disconnecting pooled parent"
                );
                parent.disconnect_detached();
                true
            }
            None => false,
        }
    }

    /// Releases every parent and tracked child. Each is disconnected once.
    pub fn shutdown(&self) {
        let (parents, children) = {
            let mut state = self.state.lock();
            let parents: Vec<M> = state.parents.drain(..).map(|p| p.member).collect();
            let children: Vec<M> = state.children.drain(..).collect();
            (parents, children)
        };
        monitoring::POOL_PARENTS_GAUGE.set(0.0);
        info!(parents = parents.len(), children = children.len(), "shutting down connection pool");
        for member in children.iter().chain(parents.iter()) {
            member.disconnect_detached();
        }
    }

    pub fn parent_count(&self) -> usize {
        self.state.lock().parents.len()
    }

    pub fn child_count(&self) -> usize {
        self.state.lock().children.len()
    }

    /// Number of children currently sharing the parent with `parent_id`.
    pub fn refcount(&self, parent_id: u64) -> usize {
        self.state
            .lock()
            .parents
            .iter()
            .find(|p| p.member.id() == parent_id)
            .map_or(0, |p| p.refcount.len())
    }
}
