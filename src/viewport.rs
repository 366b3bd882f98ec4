/// file: src/viewport.rs
/// description: viewport subscription bookkeeping: versions, creation guard and cycle backpressure
use crate::types::Viewport;

/// A request the manager wants sent to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewportRequest {
    Create {
        version: u64,
        viewport: Viewport,
    },
    Update {
        version: u64,
        viewport_id: String,
        viewport: Viewport,
    },
}

impl ViewportRequest {
    pub fn version(&self) -> u64 {
        match self {
            ViewportRequest::Create { version, .. } | ViewportRequest::Update { version, .. } => {
                *version
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetOutcome {
    /// Same window as the cached one.
    Unchanged,
    /// Empty rows or cols without an explicit cell list.
    Rejected,
    /// New window cached; a request may follow once the structure is known.
    Cached,
    /// Viewport removed; the server registration (if any) must be deleted.
    Cleared { delete: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Created {
    /// The registration was superseded while it was being minted and must be deleted.
    Discard { viewport_id: String },
    /// The registration is live. `follow_up` carries the newer window cached while
    /// the creation was in flight.
    Established { follow_up: Option<ViewportRequest> },
}

/// Owns the single server-side viewport registration of one Data instance.
///
/// Every create/update bumps `version`; batches are only applied when they carry
/// the current version. While a registration is being minted (`loading`) no
/// further requests go out; the latest cached window is sent once the id exists.
#[derive(Debug, Default)]
pub struct ViewportManager {
    current: Option<Viewport>,
    sent: Option<Viewport>,
    viewport_id: Option<String>,
    loading: Option<u64>,
    discard_loading: bool,
    version: u64,
    immediate_outstanding: bool,
    immediate_pending: bool,
}

impl ViewportManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<&Viewport> {
        self.current.as_ref()
    }

    pub fn viewport_id(&self) -> Option<&str> {
        self.viewport_id.as_deref()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_loading(&self) -> bool {
        self.loading.is_some()
    }

    pub fn is_current(&self, version: u64) -> bool {
        self.version == version
    }

    pub fn set(&mut self, viewport: Option<Viewport>) -> SetOutcome {
        let Some(viewport) = viewport else {
            let delete = self.viewport_id.take();
            self.current = None;
            self.sent = None;
            self.discard_loading = self.loading.is_some();
            self.version += 1;
            self.clear_cycle();
            return SetOutcome::Cleared { delete };
        };
        if viewport.is_nonsensical() {
            return SetOutcome::Rejected;
        }
        if self.current.as_ref() == Some(&viewport) {
            return SetOutcome::Unchanged;
        }
        self.current = Some(viewport);
        SetOutcome::Cached
    }

    /// Next request needed to bring the server in line with the cached window.
    pub fn setup(&mut self) -> Option<ViewportRequest> {
        let viewport = self.current.clone()?;
        if self.loading.is_some() {
            return None;
        }
        match &self.viewport_id {
            None => {
                self.version += 1;
                self.loading = Some(self.version);
                self.sent = Some(viewport.clone());
                Some(ViewportRequest::Create {
                    version: self.version,
                    viewport,
                })
            }
            Some(_) if self.sent.as_ref() == Some(&viewport) => None,
            Some(viewport_id) => {
                self.version += 1;
                self.sent = Some(viewport.clone());
                Some(ViewportRequest::Update {
                    version: self.version,
                    viewport_id: viewport_id.clone(),
                    viewport,
                })
            }
        }
    }

    pub fn created(&mut self, version: u64, viewport_id: String) -> Created {
        if self.loading != Some(version) {
            return Created::Discard { viewport_id };
        }
        self.loading = None;
        if std::mem::take(&mut self.discard_loading) {
            return Created::Discard { viewport_id };
        }
        self.viewport_id = Some(viewport_id);
        let follow_up = if self.current != self.sent {
            self.setup()
        } else {
            None
        };
        Created::Established { follow_up }
    }

    /// The creation request failed; nothing is registered.
    pub fn creation_failed(&mut self, version: u64) {
        if self.loading == Some(version) {
            self.loading = None;
            self.discard_loading = false;
            self.sent = None;
        }
    }

    /// Row/column indices are no longer trustworthy. Keeps the cached window,
    /// forgets the registration and makes everything in flight stale.
    pub fn invalidate(&mut self) -> Option<String> {
        self.sent = None;
        if self.loading.is_some() {
            self.discard_loading = true;
        }
        self.version += 1;
        self.clear_cycle();
        self.viewport_id.take()
    }

    /// Whether an update-request should be published now. At most one immediate
    /// request is outstanding; bursts collapse into a single pending flag.
    pub fn request_cycle(&mut self, immediate: bool) -> bool {
        if self.viewport_id.is_none() {
            return false;
        }
        if !immediate {
            return true;
        }
        if self.immediate_outstanding {
            self.immediate_pending = true;
            return false;
        }
        self.immediate_outstanding = true;
        true
    }

    /// A batch completed. Returns true when a deferred immediate cycle is due.
    pub fn end_cycle(&mut self) -> bool {
        self.immediate_outstanding = false;
        std::mem::take(&mut self.immediate_pending)
    }

    pub fn clear_cycle(&mut self) {
        self.immediate_outstanding = false;
        self.immediate_pending = false;
    }

    pub fn reset(&mut self) {
        let version = self.version;
        *self = Self::default();
        self.version = version + 1;
    }
}
