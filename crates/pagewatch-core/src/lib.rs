//! Page-level mutation capture for Linux processes.
//!
//! A host registers memory pages it wants watched; the core write-protects
//! them through `userfaultfd(2)` and turns the first write to each page
//! into a structured mutation event — who wrote (thread id, instruction
//! pointer), where (page, exact address), when, and what changed
//! (pre/post-image byte deltas).
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  Host process                                │
//! │    register_page / unregister_page ──► VariableRegistry
//! │    start / pause / stop ────────────► WatchCore (state machine)
//! └──────────────┬───────────────────────────────┘
//!                │ write to a watched page
//! ═══════════════╪═════════════════════════════════
//!                │ userfaultfd (write-protect mode)
//! ┌──────────────▼───────────────────────────────┐
//! │  fast-path handler thread                    │
//! │    poll → FastPathEvent → SPSC queue         │
//! │    resolve_write (writer unblocked, re-armed)│
//! └──────────────┬───────────────────────────────┘
//!                │ bounded queue, tail-drop
//! ┌──────────────▼───────────────────────────────┐
//! │  enrichment worker thread                    │
//! │    post-image → deltas → symbol cache        │
//! │    → EnrichedEvent → sink / pull buffer      │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! The fast path never waits on enrichment: when the queue is full the
//! event is dropped (and counted) and the writer still proceeds.
//!
//! # Usage
//!
//! ```no_run
//! use pagewatch_core::{CoreConfig, WatchCore};
//! use pagewatch_events::{MutationDepth, TrackFlags};
//!
//! let core = WatchCore::new();
//! core.initialize(CoreConfig::with_output_dir("/tmp/pagewatch")).unwrap();
//!
//! // `page` is a page-aligned, already touched allocation owned by the host.
//! # let page: usize = 0x1000;
//! let id = core
//!     .register_page(page, 4096, "counter", TrackFlags::THREADS, MutationDepth::WholePage)
//!     .unwrap();
//!
//! core.start().unwrap();
//! // ... the host mutates the page ...
//! if let Some(event) = core.dequeue_enriched_event() {
//!     println!("{event}");
//! }
//! core.stop(5_000).unwrap();
//! ```

pub mod channel;
pub mod core;
pub mod ipsource;
pub mod metrics;
pub mod queue;
pub mod registry;
pub mod symbols;

mod enrich;
mod handler;

pub use crate::core::{CoreConfig, CoreState, EventSink, WatchCore, WatchError};
pub use channel::{ChannelError, FaultChannel, FaultRecord};
pub use ipsource::{InstructionPointerSource, NullIpSource, ProcSyscallIpSource};
pub use metrics::MetricsSnapshot;
pub use queue::EventQueue;
pub use registry::{RegistryError, VariableRegistry};
pub use symbols::{BacktraceResolver, ResolvedSymbol, SymbolCache, SymbolResolver};
