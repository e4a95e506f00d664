//! Lifecycle and registry scenarios against a real core.
//!
//! Tests that need the kernel facility skip (with a note) when
//! userfaultfd cannot be opened; pure state-machine checks always run.

mod common;

use common::{current_tid, init_core, PageAlloc};
use pagewatch_core::{CoreConfig, CoreState, WatchCore, WatchError};
use pagewatch_events::{MutationDepth, TrackFlags};

fn test_config() -> CoreConfig {
    CoreConfig::with_output_dir(std::env::temp_dir().join("pagewatch-test"))
}

#[test]
fn start_before_initialize_is_rejected() {
    let core = WatchCore::new();
    let err = core.start().unwrap_err();
    assert!(matches!(err, WatchError::NotInitialized));
    assert!(core.error_message().contains("not initialized"));
    assert_eq!(core.state(), CoreState::Uninitialized);
}

#[test]
fn registry_operations_require_initialization() {
    let core = WatchCore::new();
    assert!(matches!(
        core.register_page(0x1000, 4096, "v", TrackFlags::empty(), MutationDepth::WholePage),
        Err(WatchError::NotInitialized)
    ));
    assert!(matches!(
        core.unregister_page("var-0-0"),
        Err(WatchError::NotInitialized)
    ));
    assert!(core.dequeue_enriched_event().is_none());
}

#[test]
fn stop_without_initialize_is_accepted() {
    let core = WatchCore::new();
    assert!(core.stop(1_000).is_ok());
    assert_eq!(core.state(), CoreState::Uninitialized);
}

#[test]
fn initialize_start_stop_cycle() {
    let Some(core) = init_core(test_config()) else { return };
    assert_eq!(core.state(), CoreState::Initialized);

    core.start().unwrap();
    assert_eq!(core.state(), CoreState::Running);

    core.stop(5_000).unwrap();
    assert_eq!(core.state(), CoreState::Stopped);

    // Idempotent from STOPPED.
    core.stop(5_000).unwrap();
    assert_eq!(core.state(), CoreState::Stopped);
}

#[test]
fn initialize_twice_is_rejected() {
    let Some(core) = init_core(test_config()) else { return };
    let err = core.initialize(test_config()).unwrap_err();
    assert!(matches!(err, WatchError::AlreadyInitialized));
    assert!(core.error_message().contains("already initialized"));
    assert_eq!(core.state(), CoreState::Initialized);
}

#[test]
fn pause_resume_transitions() {
    let Some(core) = init_core(test_config()) else { return };

    // pause is only legal from RUNNING.
    assert!(matches!(core.pause(), Err(WatchError::BadState { .. })));

    core.start().unwrap();
    core.pause().unwrap();
    assert_eq!(core.state(), CoreState::Paused);

    // resume is only legal from PAUSED.
    core.resume().unwrap();
    assert_eq!(core.state(), CoreState::Running);
    assert!(matches!(core.resume(), Err(WatchError::BadState { .. })));

    core.stop(5_000).unwrap();
}

#[test]
fn snapshot_round_trip() {
    let Some(core) = init_core(test_config()) else { return };
    let page = PageAlloc::new(1);

    let id = core
        .register_page(
            page.base(),
            page.len(),
            "v",
            TrackFlags::THREADS,
            MutationDepth::WholePage,
        )
        .unwrap();

    assert_eq!(core.read_snapshot(&id).unwrap()[..4], [0, 0, 0, 0]);

    let replacement = vec![0x41u8; page.len()];
    core.write_snapshot(&id, &replacement).unwrap();
    assert_eq!(core.read_snapshot(&id).unwrap()[0], 0x41);

    core.unregister_page(&id).unwrap();
    assert!(matches!(
        core.read_snapshot(&id),
        Err(WatchError::Unknown(_))
    ));
}

#[test]
fn unknown_ids_are_rejected() {
    let Some(core) = init_core(test_config()) else { return };
    assert!(matches!(
        core.unregister_page("no-such"),
        Err(WatchError::Unknown(_))
    ));
    assert!(matches!(
        core.read_snapshot("no-such"),
        Err(WatchError::Unknown(_))
    ));
    assert!(matches!(
        core.write_snapshot("no-such", &[0u8; 4096]),
        Err(WatchError::Unknown(_))
    ));
}

#[test]
fn register_rejects_bad_ranges() {
    let Some(core) = init_core(test_config()) else { return };
    let page = PageAlloc::new(1);

    let err = core
        .register_page(
            page.base() + 1,
            page.len(),
            "v",
            TrackFlags::empty(),
            MutationDepth::WholePage,
        )
        .unwrap_err();
    assert!(matches!(err, WatchError::InvalidArgument(_)));

    let err = core
        .register_page(page.base(), 0, "v", TrackFlags::empty(), MutationDepth::WholePage)
        .unwrap_err();
    assert!(matches!(err, WatchError::InvalidArgument(_)));
}

#[test]
fn queue_full_drops_are_counted() {
    let mut config = test_config();
    config.max_queue_size = 2;
    let Some(core) = init_core(config) else { return };

    // No workers are running yet, so injected records stay queued.
    let tid = current_tid();
    for i in 0..5 {
        core.inject_fault_record(0x10_0000 + i * 8, tid).unwrap();
    }

    let metrics = core.metrics();
    assert_eq!(metrics.events_received, 2);
    assert_eq!(metrics.events_dropped, 3);
    assert!(metrics.queue_depth <= 2);
    assert_eq!(
        metrics.events_received + metrics.events_dropped,
        5,
        "every record is either enqueued or counted as dropped"
    );
}

#[test]
fn paused_core_counts_injected_faults_separately() {
    let Some(core) = init_core(test_config()) else { return };
    core.start().unwrap();
    core.pause().unwrap();

    core.inject_fault_record(0x20_0000, current_tid()).unwrap();

    // The record is drained but not enqueued.
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
    loop {
        let metrics = core.metrics();
        if metrics.dropped_by_pause == 1 {
            assert_eq!(metrics.events_received, 0);
            assert_eq!(metrics.events_dropped, 0);
            break;
        }
        assert!(std::time::Instant::now() < deadline, "pause drop not counted");
        std::thread::sleep(std::time::Duration::from_millis(5));
    }

    core.stop(5_000).unwrap();
}

#[test]
fn enriched_events_flow_without_registration() {
    let Some(core) = init_core(test_config()) else { return };
    core.start().unwrap();

    // A fault whose covering page was never (or no longer) registered is
    // still emitted, with empty ids and snapshots.
    core.inject_fault_record(0x30_0000, current_tid()).unwrap();

    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    let event = loop {
        if let Some(event) = core.dequeue_enriched_event() {
            break event;
        }
        assert!(std::time::Instant::now() < deadline, "no enriched event");
        std::thread::sleep(std::time::Duration::from_millis(5));
    };

    assert!(event.variable_ids.is_empty());
    assert!(event.pre_snapshot.is_empty());
    assert!(event.post_snapshot.is_empty());
    assert!(event.deltas.is_empty());
    assert_eq!(event.fast.fault_addr, 0x30_0000);

    core.stop(5_000).unwrap();
    let metrics = core.metrics();
    assert!(metrics.events_processed >= 1);
}

#[test]
fn sql_context_attaches_to_tracking_variables() {
    let Some(core) = init_core(test_config()) else { return };
    let page = PageAlloc::new(1);

    let id = core
        .register_page(
            page.base(),
            page.len(),
            "query_buf",
            TrackFlags::THREADS | TrackFlags::SQL,
            MutationDepth::WholePage,
        )
        .unwrap();
    core.set_sql_context(Some("q-7".to_string())).unwrap();
    core.start().unwrap();

    core.inject_fault_record(page.base() + 4, current_tid()).unwrap();

    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    let event = loop {
        if let Some(event) = core.dequeue_enriched_event() {
            break event;
        }
        assert!(std::time::Instant::now() < deadline, "no enriched event");
        std::thread::sleep(std::time::Duration::from_millis(5));
    };

    assert_eq!(event.variable_ids, vec![id]);
    assert_eq!(event.sql_context_id.as_deref(), Some("q-7"));
    assert_eq!(event.post_snapshot.len(), page.len());

    core.stop(5_000).unwrap();
}

#[test]
fn cached_symbols_keep_resolver_locals() {
    struct LocalsResolver;

    impl pagewatch_core::SymbolResolver for LocalsResolver {
        fn resolve(&self, _ip: u64) -> Option<pagewatch_core::ResolvedSymbol> {
            Some(pagewatch_core::ResolvedSymbol {
                symbol: "mutate_counter".to_string(),
                file: "host.rs".to_string(),
                line: 7,
                locals: vec!["counter".to_string(), "tmp".to_string()],
            })
        }
    }

    let Some(core) = init_core(test_config()) else { return };
    let page = PageAlloc::new(1);
    core.register_page(
        page.base(),
        page.len(),
        "v",
        TrackFlags::LOCALS,
        MutationDepth::WholePage,
    )
    .unwrap();
    core.set_symbol_resolver(Some(Box::new(LocalsResolver))).unwrap();
    core.start().unwrap();

    // A thread parked in nanosleep has a recoverable, stable instruction
    // pointer in its /proc/<tid>/syscall file, so two faults attributed
    // to it resolve the same ip — the second through the cache.
    let (tx, rx) = std::sync::mpsc::channel();
    let _sleeper = std::thread::spawn(move || {
        tx.send(current_tid()).unwrap();
        std::thread::sleep(std::time::Duration::from_secs(5));
    });
    let tid = rx.recv().unwrap();
    std::thread::sleep(std::time::Duration::from_millis(50));

    core.inject_fault_record(page.base() + 1, tid).unwrap();
    core.inject_fault_record(page.base() + 2, tid).unwrap();

    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    let mut events = Vec::new();
    while events.len() < 2 {
        match core.dequeue_enriched_event() {
            Some(event) => events.push(event),
            None => {
                assert!(std::time::Instant::now() < deadline, "expected two events");
                std::thread::sleep(std::time::Duration::from_millis(5));
            }
        }
    }

    if events[0].fast.ip == 0 {
        eprintln!("skipping: instruction pointer not recoverable for a sleeping thread");
        core.stop(5_000).unwrap();
        return;
    }
    assert_eq!(events[0].fast.ip, events[1].fast.ip);
    assert_eq!(events[0].locals, ["counter", "tmp"]);
    // The second resolution is a cache hit and must keep the locals.
    assert_eq!(events[1].locals, ["counter", "tmp"]);
    assert_eq!(events[1].symbol, "mutate_counter");

    core.stop(5_000).unwrap();
}

#[test]
fn failing_sink_counts_callbacks_failed() {
    struct FailingSink;

    impl pagewatch_core::EventSink for FailingSink {
        fn emit(
            &self,
            _event: pagewatch_events::EnrichedEvent,
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            Err("sink on fire".into())
        }
    }

    let Some(core) = init_core(test_config()) else { return };
    core.set_sink(Some(Box::new(FailingSink))).unwrap();
    core.start().unwrap();

    core.inject_fault_record(0x50_0000, current_tid()).unwrap();

    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    loop {
        let metrics = core.metrics();
        if metrics.events_processed == 1 {
            assert_eq!(metrics.callbacks_failed, 1);
            // The event went to the sink, not the pull buffer.
            assert!(core.dequeue_enriched_event().is_none());
            break;
        }
        assert!(std::time::Instant::now() < deadline, "sink failure not counted");
        std::thread::sleep(std::time::Duration::from_millis(5));
    }

    core.stop(5_000).unwrap();
}

#[test]
fn metrics_start_at_zero() {
    let Some(core) = init_core(test_config()) else { return };
    let metrics = core.metrics();
    assert_eq!(metrics.events_received, 0);
    assert_eq!(metrics.events_processed, 0);
    assert_eq!(metrics.events_dropped, 0);
    assert_eq!(metrics.dropped_by_pause, 0);
    assert_eq!(metrics.callbacks_failed, 0);
    assert_eq!(metrics.queue_depth, 0);
}
