//! Core lifecycle and the external operation surface.
//!
//! [`WatchCore`] is an explicitly constructed instance owning the fault
//! channel, the event queue, the registry, and the symbol cache. Hosts
//! drive it through the state machine
//!
//! ```text
//! UNINITIALIZED ─initialize→ INITIALIZED ─start→ RUNNING ⇄ PAUSED
//!        │                                   │        │
//!        └──(initialize fails)→ ERROR ←──────┴─stop→ STOPPED
//! ```
//!
//! and register watched pages at any point after initialization; pages
//! registered before `start` are armed when the pipeline comes up.
//! Operations illegal for the current state return a typed [`WatchError`]
//! without side effects, and the message of the most recent failure is
//! retained for [`error_message`](WatchCore::error_message) (the ERROR
//! state pins the first fatal message).

use crate::channel::{FaultChannel, FaultRecord};
use crate::enrich;
use crate::handler;
use crate::ipsource::{InstructionPointerSource, ProcSyscallIpSource};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::queue::EventQueue;
use crate::registry::{RegistryError, VariableRegistry};
use crate::symbols::{BacktraceResolver, SymbolCache, SymbolResolver, DEFAULT_SYMBOL_TTL};
use log::{info, warn};
use pagewatch_events::{EnrichedEvent, FastPathEvent, MutationDepth, PageDescriptor, TrackFlags};
use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;

// ═══════════════════════════════════════════════════════════════════════
//  Public types
// ═══════════════════════════════════════════════════════════════════════

/// Lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreState {
    Uninitialized,
    Initialized,
    Running,
    Paused,
    Stopped,
    Error,
}

impl fmt::Display for CoreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CoreState::Uninitialized => "UNINITIALIZED",
            CoreState::Initialized => "INITIALIZED",
            CoreState::Running => "RUNNING",
            CoreState::Paused => "PAUSED",
            CoreState::Stopped => "STOPPED",
            CoreState::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Typed operation errors.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("Core not initialized")]
    NotInitialized,

    #[error("Core already initialized")]
    AlreadyInitialized,

    #[error("{op} is illegal in state {state}")]
    BadState { op: &'static str, state: CoreState },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("event queue at capacity")]
    ResourceExhausted,

    #[error("os error: {0}")]
    Os(String),

    #[error("unknown variable id {0}")]
    Unknown(String),
}

/// Configuration fixed at initialization.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Directory sinks write under; the core only records it.
    pub output_dir: PathBuf,
    /// Fast-path event queue capacity.
    pub max_queue_size: usize,
    /// Symbol cache entry lifetime.
    pub symbol_ttl: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            max_queue_size: 10_000,
            symbol_ttl: DEFAULT_SYMBOL_TTL,
        }
    }
}

impl CoreConfig {
    /// Config with the given output directory and defaults elsewhere.
    pub fn with_output_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: dir.into(),
            ..Default::default()
        }
    }
}

/// Receiver for enriched events, for hosts that prefer push delivery over
/// polling [`WatchCore::dequeue_enriched_event`].
///
/// `emit` runs on the enrichment thread; failures are counted in
/// `callbacks_failed` and the event is discarded.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: EnrichedEvent) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

// ═══════════════════════════════════════════════════════════════════════
//  Shared pipeline state
// ═══════════════════════════════════════════════════════════════════════

/// State shared between the API surface and the two pipeline threads.
pub(crate) struct CoreShared {
    pub(crate) channel: FaultChannel,
    pub(crate) queue: EventQueue<FastPathEvent>,
    pub(crate) registry: VariableRegistry,
    pub(crate) symbols: SymbolCache,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) running: AtomicBool,
    pub(crate) paused: AtomicBool,
    pub(crate) page_size: usize,
    pub(crate) next_event_id: AtomicU64,
    pub(crate) ip_source: Box<dyn InstructionPointerSource>,
    pub(crate) resolver: Mutex<Option<Box<dyn SymbolResolver>>>,
    pub(crate) sink: Mutex<Option<Box<dyn EventSink>>>,
    pub(crate) enriched: Arc<Mutex<VecDeque<EnrichedEvent>>>,
    pub(crate) sql_context: Mutex<Option<String>>,
}

struct Inner {
    state: CoreState,
    error_message: String,
    output_dir: PathBuf,
    shared: Option<Arc<CoreShared>>,
    // Metrics and the pull buffer outlive the pipeline so drained events
    // and final counters stay observable after stop.
    metrics: Option<Arc<Metrics>>,
    enriched: Option<Arc<Mutex<VecDeque<EnrichedEvent>>>>,
    handler: Option<JoinHandle<()>>,
    worker: Option<JoinHandle<()>>,
}

// ═══════════════════════════════════════════════════════════════════════
//  WatchCore
// ═══════════════════════════════════════════════════════════════════════

/// The mutation tracer core. See the module docs for the state machine.
pub struct WatchCore {
    inner: Mutex<Inner>,
}

impl WatchCore {
    /// A core in UNINITIALIZED state.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: CoreState::Uninitialized,
                error_message: String::new(),
                output_dir: PathBuf::new(),
                shared: None,
                metrics: None,
                enriched: None,
                handler: None,
                worker: None,
            }),
        }
    }

    /// Open the fault channel and build the pipeline. Rejects a second
    /// call; a channel-open or handshake failure is fatal (ERROR).
    pub fn initialize(&self, config: CoreConfig) -> Result<(), WatchError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != CoreState::Uninitialized {
            return Err(fail(&mut inner, WatchError::AlreadyInitialized));
        }

        let channel = match FaultChannel::open() {
            Ok(channel) => channel,
            Err(e) => {
                inner.state = CoreState::Error;
                inner.error_message = e.to_string();
                return Err(WatchError::Os(e.to_string()));
            }
        };
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let metrics = Arc::new(Metrics::default());
        let enriched = Arc::new(Mutex::new(VecDeque::new()));

        inner.shared = Some(Arc::new(CoreShared {
            channel,
            queue: EventQueue::with_capacity(config.max_queue_size),
            registry: VariableRegistry::new(page_size),
            symbols: SymbolCache::new(config.symbol_ttl),
            metrics: Arc::clone(&metrics),
            running: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            page_size,
            next_event_id: AtomicU64::new(1),
            ip_source: Box::new(ProcSyscallIpSource),
            resolver: Mutex::new(Some(Box::new(BacktraceResolver))),
            sink: Mutex::new(None),
            enriched: Arc::clone(&enriched),
            sql_context: Mutex::new(None),
        }));
        inner.metrics = Some(metrics);
        inner.enriched = Some(enriched);
        inner.output_dir = config.output_dir;
        inner.state = CoreState::Initialized;
        info!(
            "core initialized (queue capacity {}, page size {page_size})",
            config.max_queue_size
        );
        Ok(())
    }

    /// Arm all registered ranges and spawn the pipeline threads.
    pub fn start(&self) -> Result<(), WatchError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CoreState::Initialized => {}
            CoreState::Uninitialized => return Err(fail(&mut inner, WatchError::NotInitialized)),
            state => {
                return Err(fail(&mut inner, WatchError::BadState { op: "start", state }));
            }
        }
        let Some(shared) = inner.shared.clone() else {
            return Err(fail(&mut inner, WatchError::NotInitialized));
        };

        // Pages registered before start get armed now; a range the kernel
        // refuses is logged and skipped rather than blocking the rest.
        for (base, len) in shared.registry.ranges() {
            if let Err(e) = shared.channel.arm(base, len) {
                warn!("start: could not arm {base:#x}+{len:#x}: {e}");
            }
        }

        shared.running.store(true, Ordering::Release);
        shared.paused.store(false, Ordering::Release);

        let handler = std::thread::Builder::new()
            .name("pagewatch-fault".to_string())
            .spawn({
                let shared = Arc::clone(&shared);
                move || handler::run(shared)
            });
        let handler = match handler {
            Ok(handle) => handle,
            Err(e) => {
                shared.running.store(false, Ordering::Release);
                return Err(fail(&mut inner, WatchError::Os(e.to_string())));
            }
        };
        let worker = std::thread::Builder::new()
            .name("pagewatch-enrich".to_string())
            .spawn({
                let shared = Arc::clone(&shared);
                move || enrich::run(shared)
            });
        let worker = match worker {
            Ok(handle) => handle,
            Err(e) => {
                shared.running.store(false, Ordering::Release);
                let _ = handler.join();
                return Err(fail(&mut inner, WatchError::Os(e.to_string())));
            }
        };

        inner.handler = Some(handler);
        inner.worker = Some(worker);
        inner.state = CoreState::Running;
        info!("core running");
        Ok(())
    }

    /// Keep draining faults (writers stay unblocked) but drop events.
    pub fn pause(&self) -> Result<(), WatchError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != CoreState::Running {
            let state = inner.state;
            return Err(fail(&mut inner, WatchError::BadState { op: "pause", state }));
        }
        if let Some(shared) = &inner.shared {
            shared.paused.store(true, Ordering::Release);
        }
        inner.state = CoreState::Paused;
        Ok(())
    }

    /// Resume enqueuing after [`pause`](Self::pause).
    pub fn resume(&self) -> Result<(), WatchError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != CoreState::Paused {
            let state = inner.state;
            return Err(fail(&mut inner, WatchError::BadState { op: "resume", state }));
        }
        if let Some(shared) = &inner.shared {
            shared.paused.store(false, Ordering::Release);
        }
        inner.state = CoreState::Running;
        Ok(())
    }

    /// Cooperative shutdown: clear the running flag, join both threads
    /// within `timeout_ms`, drain residual events through enrichment,
    /// disarm every range, close the channel.
    ///
    /// Idempotent from STOPPED and a no-op from UNINITIALIZED. If a thread
    /// fails to exit in time the core transitions to ERROR with the
    /// channel left open — a detached thread must never touch a closed fd.
    pub fn stop(&self, timeout_ms: u64) -> Result<(), WatchError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CoreState::Stopped | CoreState::Uninitialized => return Ok(()),
            CoreState::Error => {
                let state = inner.state;
                return Err(WatchError::BadState { op: "stop", state });
            }
            CoreState::Initialized | CoreState::Running | CoreState::Paused => {}
        }

        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        if let Some(shared) = inner.shared.clone() {
            shared.running.store(false, Ordering::Release);

            let handler = inner.handler.take();
            let worker = inner.worker.take();
            if !join_by(handler, deadline) || !join_by(worker, deadline) {
                // The stragglers still hold the shared Arc, so the channel
                // stays alive for them; ERROR is terminal.
                inner.state = CoreState::Error;
                inner.error_message = "stop timed out waiting for pipeline threads".to_string();
                return Err(WatchError::Os(inner.error_message.clone()));
            }

            while Instant::now() < deadline {
                match shared.queue.dequeue() {
                    Some(event) => enrich::enrich_one(&shared, event),
                    None => break,
                }
            }
            shared.channel.disarm_all();
        }

        inner.shared = None;
        inner.state = CoreState::Stopped;
        info!("core stopped");
        Ok(())
    }

    /// Register a watched page range, returning its variable id.
    ///
    /// The range must be page-aligned, a positive whole number of pages,
    /// already mapped and readable (the host touches it first), and stay
    /// valid until [`unregister_page`](Self::unregister_page) returns. The
    /// range is armed immediately when the core is RUNNING or PAUSED; an
    /// arming failure rolls the registration back.
    pub fn register_page(
        &self,
        base: usize,
        len: usize,
        name: &str,
        flags: TrackFlags,
        depth: MutationDepth,
    ) -> Result<String, WatchError> {
        let (shared, state) = self.pipeline("register_page")?;
        let desc = shared
            .registry
            .prepare(base, len, name, flags, depth)
            .map_err(|e| self.record_err(WatchError::InvalidArgument(e.to_string())))?;
        if matches!(state, CoreState::Running | CoreState::Paused) {
            shared
                .channel
                .arm(desc.base, desc.len)
                .map_err(|e| self.record_err(WatchError::Os(e.to_string())))?;
        }
        Ok(shared.registry.insert(desc))
    }

    /// Remove a watched range, eagerly disarming it.
    pub fn unregister_page(&self, id: &str) -> Result<(), WatchError> {
        let (shared, state) = self.pipeline("unregister_page")?;
        let desc = shared
            .registry
            .remove(id)
            .ok_or_else(|| self.record_err(WatchError::Unknown(id.to_string())))?;
        if matches!(state, CoreState::Running | CoreState::Paused) {
            if let Err(e) = shared.channel.disarm(desc.base, desc.len) {
                warn!("unregister_page: disarm failed: {e}");
            }
        }
        Ok(())
    }

    /// Copy of a variable's stored pre-image.
    pub fn read_snapshot(&self, id: &str) -> Result<Vec<u8>, WatchError> {
        let (shared, _) = self.pipeline("read_snapshot")?;
        shared
            .registry
            .read_snapshot(id)
            .ok_or_else(|| self.record_err(WatchError::Unknown(id.to_string())))
    }

    /// Replace a variable's pre-image; `bytes` must match its length.
    pub fn write_snapshot(&self, id: &str, bytes: &[u8]) -> Result<(), WatchError> {
        let (shared, _) = self.pipeline("write_snapshot")?;
        shared
            .registry
            .write_snapshot(id, bytes)
            .map_err(|e| self.record_err(registry_err(e)))
    }

    /// Wholesale descriptor replacement; id and registration time are
    /// preserved.
    pub fn update_metadata(&self, id: &str, desc: PageDescriptor) -> Result<(), WatchError> {
        let (shared, _) = self.pipeline("update_metadata")?;
        shared
            .registry
            .update_metadata(id, desc)
            .map_err(|e| self.record_err(registry_err(e)))
    }

    /// Non-blocking pull of the next enriched event, for sinks that poll.
    /// `None` when nothing is pending (or no pipeline exists).
    pub fn dequeue_enriched_event(&self) -> Option<EnrichedEvent> {
        let buffer = {
            let inner = self.inner.lock().unwrap();
            inner.enriched.clone()?
        };
        let event = buffer.lock().unwrap().pop_front();
        event
    }

    /// Install (or clear) a push sink for enriched events.
    pub fn set_sink(&self, sink: Option<Box<dyn EventSink>>) -> Result<(), WatchError> {
        let (shared, _) = self.pipeline("set_sink")?;
        *shared.sink.lock().unwrap() = sink;
        Ok(())
    }

    /// Install (or clear) the symbol resolver consulted on cache misses.
    pub fn set_symbol_resolver(
        &self,
        resolver: Option<Box<dyn SymbolResolver>>,
    ) -> Result<(), WatchError> {
        let (shared, _) = self.pipeline("set_symbol_resolver")?;
        *shared.resolver.lock().unwrap() = resolver;
        Ok(())
    }

    /// Set the SQL context id attached to events of SQL-tracking
    /// variables; `None` clears it.
    pub fn set_sql_context(&self, context_id: Option<String>) -> Result<(), WatchError> {
        let (shared, _) = self.pipeline("set_sql_context")?;
        *shared.sql_context.lock().unwrap() = context_id;
        Ok(())
    }

    /// Run one synthetic fault record through the fast-path step, without
    /// touching the fault channel. Diagnostics and test hook: accounting
    /// and queueing behave exactly as for a kernel-delivered fault.
    pub fn inject_fault_record(&self, fault_addr: usize, tid: u32) -> Result<(), WatchError> {
        let (shared, _) = self.pipeline("inject_fault_record")?;
        let record = FaultRecord {
            address: fault_addr as u64,
            tid,
        };
        handler::handle_record(&shared, &record, false);
        Ok(())
    }

    pub fn state(&self) -> CoreState {
        self.inner.lock().unwrap().state
    }

    /// Message of the most recent failure; pinned to the first fatal
    /// error once the core is in ERROR.
    pub fn error_message(&self) -> String {
        self.inner.lock().unwrap().error_message.clone()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        let inner = self.inner.lock().unwrap();
        let depth = inner.shared.as_ref().map_or(0, |s| s.queue.depth());
        match &inner.metrics {
            Some(metrics) => metrics.snapshot(depth),
            None => Metrics::default().snapshot(0),
        }
    }

    /// Directory sinks were configured to write under.
    pub fn output_dir(&self) -> PathBuf {
        self.inner.lock().unwrap().output_dir.clone()
    }

    /// Pipeline handle for states where one exists, with the state it was
    /// observed in.
    fn pipeline(&self, op: &'static str) -> Result<(Arc<CoreShared>, CoreState), WatchError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CoreState::Uninitialized => Err(fail(&mut inner, WatchError::NotInitialized)),
            CoreState::Stopped | CoreState::Error => {
                let state = inner.state;
                Err(fail(&mut inner, WatchError::BadState { op, state }))
            }
            state => match inner.shared.clone() {
                Some(shared) => Ok((shared, state)),
                None => Err(fail(&mut inner, WatchError::NotInitialized)),
            },
        }
    }

    /// Record a non-fatal failure message and pass the error through.
    fn record_err(&self, err: WatchError) -> WatchError {
        let mut inner = self.inner.lock().unwrap();
        fail(&mut inner, err)
    }
}

impl Default for WatchCore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WatchCore {
    fn drop(&mut self) {
        let state = self.state();
        if matches!(state, CoreState::Running | CoreState::Paused) {
            let _ = self.stop(1_000);
        }
    }
}

/// Set the last-error message (ERROR pins the first fatal one) and hand
/// the error back for returning.
fn fail(inner: &mut Inner, err: WatchError) -> WatchError {
    if inner.state != CoreState::Error {
        inner.error_message = err.to_string();
    }
    err
}

fn registry_err(err: RegistryError) -> WatchError {
    match err {
        RegistryError::UnknownId(id) => WatchError::Unknown(id),
        other => WatchError::InvalidArgument(other.to_string()),
    }
}

/// Wait for a thread to finish before `deadline`; true when it joined
/// (or there was nothing to join).
fn join_by(handle: Option<JoinHandle<()>>, deadline: Instant) -> bool {
    let Some(handle) = handle else { return true };
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    if let Err(e) = handle.join() {
        warn!("pipeline thread panicked: {e:?}");
    }
    true
}
