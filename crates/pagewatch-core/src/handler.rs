//! Fast-path fault handling: the dedicated thread that drains the fault
//! channel, builds minimal events, and unblocks faulting writers.
//!
//! The per-record step is deliberately small — timestamp, mask, ip
//! recovery, enqueue — and never blocks on the enrichment side. Whatever
//! happens to the event, the page is always write-resolved so the
//! faulting thread proceeds.

use crate::channel::FaultRecord;
use crate::core::CoreShared;
use log::{debug, warn};
use pagewatch_events::FastPathEvent;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Fault-channel poll timeout; also bounds how long stop() waits for the
/// loop to notice the cleared running flag.
pub(crate) const POLL_TIMEOUT_MS: i32 = 100;

/// Thread body. Runs until the core clears `running`.
pub(crate) fn run(shared: Arc<CoreShared>) {
    debug!("fast-path handler running");
    while shared.running.load(Ordering::Acquire) {
        let records = match shared.channel.poll(POLL_TIMEOUT_MS) {
            Ok(records) => records,
            Err(e) => {
                // Read failures lose whatever records the kernel had
                // batched; account for them as a drop.
                warn!("fault channel poll failed: {e}");
                shared.metrics.add_dropped();
                continue;
            }
        };
        for record in &records {
            handle_record(&shared, record, true);
        }
    }
    debug!("fast-path handler exiting");
}

/// Process one fault record: build the event, enqueue (or account for the
/// drop), and let the blocked writer proceed.
///
/// `rearm` is false for synthetic records injected by diagnostics and
/// tests, which have no armed page behind them.
pub(crate) fn handle_record(shared: &CoreShared, record: &FaultRecord, rearm: bool) {
    let timestamp_ns = wall_clock_ns();
    let fault_addr = record.address as usize;
    let page_base = fault_addr & !(shared.page_size - 1);
    let ip = shared.ip_source.instruction_pointer(record.tid);

    let event = FastPathEvent {
        event_id: shared.next_event_id.fetch_add(1, Ordering::Relaxed),
        timestamp_ns,
        page_base,
        fault_addr,
        tid: record.tid,
        ip,
    };

    if shared.paused.load(Ordering::Acquire) {
        shared.metrics.add_dropped_by_pause();
    } else if shared.queue.enqueue(event) {
        shared.metrics.add_received();
    } else {
        shared.metrics.add_dropped();
    }

    // Unblock the writer regardless of the enqueue outcome.
    if rearm {
        if let Err(e) = shared.channel.resolve_write(page_base, shared.page_size) {
            warn!("resolve_write failed for {page_base:#x}: {e}");
        }
    }
}

/// CLOCK_REALTIME in nanoseconds, read once per fault.
pub(crate) fn wall_clock_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: plain out-parameter syscall.
    unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts) };
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}
