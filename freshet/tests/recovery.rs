//! Crash-and-resume behavior of the stateful operators.
//!
//! Each scenario runs a flow with a poisoned record that raises on the
//! first run, then disarms the bomb and runs again over the same recovery
//! store. The second run must resume from the last committed epoch:
//! already-snapshotted state carries forward, and only output whose epoch
//! never committed may be emitted twice.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};

use freshet::dataflow::Dataflow;
use freshet::errors::{Error, UserError};
use freshet::execute::{cluster_main, run_main};
use freshet::inputs::{GeneratorSource, SourceMessage, TestingSource};
use freshet::outputs::TestingSink;
use freshet::recovery::mem::InMemStore;
use freshet::recovery::RecoveryConfig;
use freshet::value::Value;
use freshet::window::clock::{ClockConfig, TestingClock};
use freshet::window::TumblingWindower;

fn event(user: &str, typ: &str) -> Value {
    Value::map(vec![("user", user), ("type", typ)])
}

/// A flat_map that raises on "BOOM" while armed and drops it otherwise.
fn add_bomb(flow: &mut Dataflow, armed: &Arc<AtomicBool>) {
    let armed = Arc::clone(armed);
    flow.flat_map(move |item| {
        if item == Value::from("BOOM") {
            if armed.load(Ordering::SeqCst) {
                Err(UserError::new("BOOM"))
            } else {
                Ok(Vec::new())
            }
        } else {
            Ok(vec![item])
        }
    });
}

fn reduce_sessions_flow(
    armed: &Arc<AtomicBool>,
    sink: &TestingSink,
) -> Dataflow {
    let mut flow = Dataflow::new();
    flow.input("inp", TestingSource::new(vec![
        event("a", "login"),
        event("a", "post"),
        Value::from("BOOM"),
        event("b", "login"),
        event("a", "logout"),
        event("b", "logout"),
    ]));
    add_bomb(&mut flow, armed);
    flow.map(|event| {
        let user = event.get("user").unwrap().clone();
        Ok(Value::pair(user, Value::List(vec![event])))
    });
    flow.reduce(
        "sessionizer",
        |session, events| {
            let Value::List(mut session) = session else {
                return Err(UserError::new("session must be a list"));
            };
            let Value::List(events) = events else {
                return Err(UserError::new("events must be a list"));
            };
            session.extend(events);
            Ok(Value::List(session))
        },
        |session| {
            let Value::List(events) = session else { return Ok(false) };
            Ok(events
                .iter()
                .any(|e| e.get("type").and_then(Value::as_text) == Some("logout")))
        },
    );
    flow.capture(sink.clone());
    flow
}

#[test]
fn reduce_resumes_partial_sessions() {
    let store = InMemStore::new();
    let armed = Arc::new(AtomicBool::new(true));
    let sink = TestingSink::new();

    let err = run_main(
        reduce_sessions_flow(&armed, &sink),
        None,
        Some(RecoveryConfig::testing(store.clone())),
    )
    .unwrap_err();
    assert_eq!(err.to_string(), "BOOM");
    // No session had completed before the crash.
    assert!(sink.items().is_empty());

    armed.store(false, Ordering::SeqCst);
    sink.clear();

    run_main(
        reduce_sessions_flow(&armed, &sink),
        None,
        Some(RecoveryConfig::testing(store)),
    )
    .unwrap();
    assert_eq!(
        sink.sorted_items(),
        vec![
            Value::pair(
                "a",
                Value::List(vec![event("a", "login"), event("a", "post"), event("a", "logout")]),
            ),
            Value::pair("b", Value::List(vec![event("b", "login"), event("b", "logout")])),
        ]
    );
}

fn dedupe_flow(armed: &Arc<AtomicBool>, sink: &TestingSink) -> Dataflow {
    let mut flow = Dataflow::new();
    flow.input("inp", TestingSource::new(vec![
        Value::from("a"),
        Value::from("b"),
        Value::from("BOOM"),
        Value::from("b"),
        Value::from("c"),
    ]));
    add_bomb(&mut flow, armed);
    flow.map(|item| Ok(Value::pair(item.clone(), item)));
    flow.stateful_map(
        "build_seen",
        || Ok(Value::List(Vec::new())),
        |seen, value| {
            let Value::List(mut seen) = seen else {
                return Err(UserError::new("seen must be a list"));
            };
            let is_seen = seen.contains(&value);
            if !is_seen {
                seen.push(value);
            }
            Ok((Some(Value::List(seen)), Value::Bool(is_seen)))
        },
    );
    flow.flat_map(|pair| {
        let (key, is_seen) = pair.into_pair().expect("stateful output is a pair");
        Ok(if is_seen == Value::Bool(false) { vec![key] } else { Vec::new() })
    });
    flow.capture(sink.clone());
    flow
}

#[test]
fn stateful_map_dedupes_across_a_crash() {
    let store = InMemStore::new();
    let armed = Arc::new(AtomicBool::new(true));
    let sink = TestingSink::new();

    let err = run_main(
        dedupe_flow(&armed, &sink),
        None,
        Some(RecoveryConfig::testing(store.clone())),
    )
    .unwrap_err();
    assert_eq!(err.to_string(), "BOOM");
    assert_eq!(sink.sorted_items(), vec![Value::from("a"), Value::from("b")]);

    armed.store(false, Ordering::SeqCst);
    sink.clear();

    run_main(
        dedupe_flow(&armed, &sink),
        None,
        Some(RecoveryConfig::testing(store)),
    )
    .unwrap();
    // "b was seen" was snapshotted at its epoch's close before the crash,
    // so the replayed "b" is suppressed and only "c" is new.
    assert_eq!(sink.sorted_items(), vec![Value::from("c")]);
}

/// What a scripted source does between epoch boundaries.
enum Act {
    Emit(Value),
    /// Advance the shared clock and close the epoch.
    Tick(i64),
}

fn scripted(clock: TestingClock, start: DateTime<Utc>, acts: Vec<Act>) -> GeneratorSource<impl Fn() -> Box<dyn Iterator<Item = SourceMessage>> + Send> {
    let acts = Arc::new(acts);
    GeneratorSource::new(move || {
        // Rebuilding the partition replays the script from the top, so the
        // clock resets with it; skipped items re-run their ticks.
        clock.set(start);
        let clock = clock.clone();
        let acts = Arc::clone(&acts);
        let mut i = 0;
        Box::new(std::iter::from_fn(move || {
            let act = acts.get(i)?;
            i += 1;
            Some(match act {
                Act::Emit(value) => SourceMessage::Item(value.clone()),
                Act::Tick(seconds) => {
                    clock.advance(chrono::Duration::seconds(*seconds));
                    SourceMessage::AdvanceEpoch
                }
            })
        }))
    })
}

fn window_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).unwrap()
}

fn fold_window_flow(
    armed: &Arc<AtomicBool>,
    sink: &TestingSink,
    clock: &TestingClock,
) -> Dataflow {
    let start = window_start();
    let mut flow = Dataflow::new();
    flow.input("inp", scripted(clock.clone(), start, vec![
        Act::Emit(event("a", "login")),
        Act::Tick(4),
        Act::Emit(event("a", "post")),
        Act::Tick(4),
        Act::Emit(event("a", "post")),
        Act::Tick(4),
        // The first 10 s window is now closable.
        Act::Emit(event("b", "login")),
        Act::Emit(Value::from("BOOM")),
        Act::Tick(4),
        Act::Emit(event("a", "post")),
        Act::Tick(4),
        // The second 10 s window is now closable.
        Act::Emit(event("b", "post")),
        Act::Tick(4),
        Act::Emit(event("b", "post")),
        Act::Tick(4),
    ]));
    add_bomb(&mut flow, armed);
    flow.map(|event| {
        let user = event.get("user").unwrap().clone();
        let typ = event.get("type").unwrap().clone();
        Ok(Value::List(vec![user, typ]))
    });
    flow.fold_window(
        "count",
        ClockConfig::Testing(clock.clone()),
        TumblingWindower::new(chrono::Duration::seconds(10), start),
        || Ok(Value::map::<&str, Value>(vec![])),
        |mut counts, typ| {
            let typ = typ.as_text().unwrap_or("?").to_string();
            let next = counts.get(&typ).and_then(Value::as_int).unwrap_or(0) + 1;
            counts.insert(typ, next);
            Ok(counts)
        },
    );
    flow.capture(sink.clone());
    flow
}

#[test]
fn fold_window_duplicates_only_the_uncommitted_window() {
    let store = InMemStore::new();
    let armed = Arc::new(AtomicBool::new(true));
    let sink = TestingSink::new();
    let clock = TestingClock::new(window_start());

    let err = run_main(
        fold_window_flow(&armed, &sink, &clock),
        None,
        Some(RecoveryConfig::testing(store.clone())),
    )
    .unwrap_err();
    assert_eq!(err.to_string(), "BOOM");
    // The first window closed and emitted just before the bomb, within
    // the epoch that never committed.
    assert_eq!(
        sink.items(),
        vec![Value::pair("a", Value::map(vec![("login", 1_i64), ("post", 2_i64)]))]
    );

    armed.store(false, Ordering::SeqCst);
    sink.clear();

    run_main(
        fold_window_flow(&armed, &sink, &clock),
        None,
        Some(RecoveryConfig::testing(store)),
    )
    .unwrap();
    // The first window's close replays (accepted duplication); the rest
    // emit once, window closes in ascending (key, window) order.
    assert_eq!(
        sink.items(),
        vec![
            Value::pair("a", Value::map(vec![("login", 1_i64), ("post", 2_i64)])),
            Value::pair("a", Value::map(vec![("post", 1_i64)])),
            Value::pair("b", Value::map(vec![("login", 1_i64)])),
            Value::pair("b", Value::map(vec![("post", 2_i64)])),
        ]
    );
}

fn reduce_window_flow(
    armed: &Arc<AtomicBool>,
    sink: &TestingSink,
    clock: &TestingClock,
) -> Dataflow {
    let start = window_start();
    let mut flow = Dataflow::new();
    flow.input("inp", scripted(clock.clone(), start, vec![
        Act::Emit(Value::pair("ALL", 1_i64)),
        Act::Tick(4),
        Act::Emit(Value::pair("ALL", 1_i64)),
        Act::Tick(4),
        Act::Emit(Value::from("BOOM")),
        Act::Emit(Value::pair("ALL", 1_i64)),
        Act::Tick(4),
        Act::Emit(Value::pair("ALL", 1_i64)),
        Act::Tick(4),
    ]));
    add_bomb(&mut flow, armed);
    flow.reduce_window(
        "add",
        ClockConfig::Testing(clock.clone()),
        TumblingWindower::new(chrono::Duration::seconds(10), start),
        |acc, x| Ok(Value::Int(acc.as_int().unwrap() + x.as_int().unwrap())),
    );
    flow.capture(sink.clone());
    flow
}

#[test]
fn reduce_window_remembers_the_open_window() {
    let store = InMemStore::new();
    let armed = Arc::new(AtomicBool::new(true));
    let sink = TestingSink::new();
    let clock = TestingClock::new(window_start());

    let err = run_main(
        reduce_window_flow(&armed, &sink, &clock),
        None,
        Some(RecoveryConfig::testing(store.clone())),
    )
    .unwrap_err();
    assert_eq!(err.to_string(), "BOOM");
    // No window had closed yet.
    assert!(sink.items().is_empty());

    armed.store(false, Ordering::SeqCst);
    sink.clear();

    run_main(
        reduce_window_flow(&armed, &sink, &clock),
        None,
        Some(RecoveryConfig::testing(store)),
    )
    .unwrap();
    // The first window remembers both pre-crash items; the second flushes
    // at end-of-stream.
    assert_eq!(
        sink.items(),
        vec![Value::pair("ALL", 3_i64), Value::pair("ALL", 1_i64)]
    );
}

#[test]
fn sled_store_recovers_across_runs() {
    let dir = tempfile::tempdir().unwrap();
    let armed = Arc::new(AtomicBool::new(true));
    let sink = TestingSink::new();

    let err = run_main(
        dedupe_flow(&armed, &sink),
        None,
        Some(RecoveryConfig::sled(dir.path())),
    )
    .unwrap_err();
    assert_eq!(err.to_string(), "BOOM");
    assert_eq!(sink.sorted_items(), vec![Value::from("a"), Value::from("b")]);

    armed.store(false, Ordering::SeqCst);
    sink.clear();

    run_main(
        dedupe_flow(&armed, &sink),
        None,
        Some(RecoveryConfig::sled(dir.path())),
    )
    .unwrap();
    assert_eq!(sink.sorted_items(), vec![Value::from("c")]);
}

#[test]
fn resume_refuses_a_changed_worker_count() {
    let store = InMemStore::new();
    let sink = TestingSink::new();

    let sink_in_flow = sink.clone();
    cluster_main(
        move || {
            let mut flow = Dataflow::new();
            flow.input("inp", TestingSource::new(vec![Value::Int(1), Value::Int(2)]));
            flow.capture(sink_in_flow.clone());
            flow
        },
        Vec::new(),
        0,
        2,
        None,
        Some(RecoveryConfig::testing(store.clone())),
    )
    .unwrap();
    assert_eq!(sink.sorted_items(), vec![Value::Int(1), Value::Int(2)]);

    let sink_in_flow = sink.clone();
    let mut flow = Dataflow::new();
    flow.input("inp", TestingSource::new(vec![Value::Int(1)]));
    flow.capture(sink_in_flow);
    let err = run_main(flow, None, Some(RecoveryConfig::testing(store))).unwrap_err();
    assert!(matches!(err, Error::Resume(_)));
}
