//! Slow-path enrichment: post-image capture, byte deltas, symbolization,
//! sink hand-off.
//!
//! One worker per core. Enrichment tolerates a world that moved on since
//! the fault: an unregistered variable yields an event with empty ids and
//! snapshots (the consumer can still correlate by address), and an
//! unresolvable ip yields the `("??", "", 0)` triple.

use crate::core::CoreShared;
use crate::handler::wall_clock_ns;
use log::{debug, trace, warn};
use pagewatch_events::{compute_deltas, Delta, EnrichedEvent, FastPathEvent};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

/// Idle sleep between empty queue polls.
const IDLE_SLEEP: Duration = Duration::from_millis(5);

/// Thread body. Runs until the core clears `running`.
pub(crate) fn run(shared: Arc<CoreShared>) {
    debug!("enrichment worker running");
    while shared.running.load(Ordering::Acquire) {
        match shared.queue.dequeue() {
            Some(event) => enrich_one(&shared, event),
            None => std::thread::sleep(IDLE_SLEEP),
        }
    }
    debug!("enrichment worker exiting");
}

/// Enrich a single fast-path event and hand it off.
pub(crate) fn enrich_one(shared: &CoreShared, fast: FastPathEvent) {
    let variable_ids = shared.registry.lookup_covering(fast.fault_addr);

    // The first covering descriptor (registration order) supplies the
    // images and deltas; hosts wanting per-descriptor deltas register
    // disjoint ranges.
    let mut pre_snapshot = Vec::new();
    let mut post_snapshot = Vec::new();
    let mut deltas: Vec<Delta> = Vec::new();
    let mut wants_sql = false;
    let mut wants_locals = false;
    if let Some(first) = variable_ids.first() {
        if let Some(captured) = shared.registry.capture_and_advance(first) {
            let depth = captured.depth.effective_len(captured.post.len());
            deltas = compute_deltas(&captured.pre, &captured.post, depth);
            wants_sql = captured.flags.tracks_sql();
            wants_locals = captured.flags.tracks_locals();
            pre_snapshot = captured.pre;
            post_snapshot = captured.post;
        } else {
            trace!("variable vanished between lookup and capture");
        }
    }

    let (symbol, file, line, locals) = symbolize(shared, fast.ip);

    let sql_context_id = if wants_sql {
        shared.sql_context.lock().unwrap().clone()
    } else {
        None
    };

    let fault_ns = fast.timestamp_ns;
    let event = EnrichedEvent {
        fast,
        symbol,
        file,
        line,
        pre_snapshot,
        post_snapshot,
        deltas,
        variable_ids,
        sql_context_id,
        locals: if wants_locals { locals } else { Vec::new() },
    };

    deliver(shared, event);
    shared.metrics.add_processed();
    shared
        .metrics
        .record_latency_ms(wall_clock_ns().saturating_sub(fault_ns) as f64 / 1e6);
}

/// Cache → resolver → unresolved fallback.
fn symbolize(shared: &CoreShared, ip: u64) -> (String, String, u32, Vec<String>) {
    if ip == 0 {
        return ("??".to_string(), String::new(), 0, Vec::new());
    }
    if let Some(entry) = shared.symbols.get(ip) {
        return (entry.symbol, entry.file, entry.line, entry.locals);
    }
    let resolver = shared.resolver.lock().unwrap();
    if let Some(resolver) = resolver.as_ref() {
        if let Some(resolved) = resolver.resolve(ip) {
            shared.symbols.set(
                ip,
                resolved.symbol.clone(),
                resolved.file.clone(),
                resolved.line,
                resolved.locals.clone(),
            );
            return (resolved.symbol, resolved.file, resolved.line, resolved.locals);
        }
    }
    ("??".to_string(), String::new(), 0, Vec::new())
}

/// Hand the event to the configured push sink, or park it in the pull
/// buffer for `dequeue_enriched_event`. Sink failures are the sink's
/// problem; they are counted and the event is discarded.
fn deliver(shared: &CoreShared, event: EnrichedEvent) {
    let sink = shared.sink.lock().unwrap();
    match sink.as_ref() {
        Some(sink) => {
            if let Err(e) = sink.emit(event) {
                warn!("sink emit failed: {e}");
                shared.metrics.add_callback_failed();
            }
        }
        None => {
            shared.enriched.lock().unwrap().push_back(event);
        }
    }
}
