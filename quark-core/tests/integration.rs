//! Integration Tests for the Reactive Registry
//!
//! These tests verify that atoms, selectors, listeners and sinks work together
//! correctly through the public registry API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;

use quark_core::reactive::{callback, Callback, Computation, Getter, Observable, Sink};
use quark_core::{
    Action, CellKind, CoalescePolicy, Registry, StateConfig, StateError, Value,
};

fn counter() -> (Arc<AtomicUsize>, Callback) {
    let count = Arc::new(AtomicUsize::new(0));
    let count_clone = count.clone();
    let cb = callback(move |_| {
        count_clone.fetch_add(1, Ordering::SeqCst);
    });
    (count, cb)
}

#[derive(Default)]
struct Widget {
    properties: Mutex<Vec<(String, Value)>>,
    flushes: AtomicUsize,
}

impl Sink for Widget {
    fn set_property(&self, property: &str, value: &Value) {
        self.properties.lock().push((property.to_owned(), value.clone()));
    }

    fn flush(&self) {
        self.flushes.fetch_add(1, Ordering::SeqCst);
    }
}

fn full_name(get: &Getter) -> anyhow::Result<Value> {
    Ok(format!("{} {}", get.get("first")?, get.get("last")?).into())
}

/// Test that reads after writes see the last changed value and that equal
/// writes change nothing.
#[test]
fn no_op_writes_leave_state_untouched() {
    let registry = Registry::new();
    registry.atom("n", 1).unwrap();
    let (count, cb) = counter();
    registry.listen("n", cb, false).unwrap();

    assert!(registry.set("n", 2).unwrap());
    assert!(!registry.set("n", 2).unwrap());
    assert_eq!(registry.get("n").unwrap(), Value::from(2));
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(registry.atom_handle("n").unwrap().listener_count(), 1);

    // Structured data compares deeply
    registry.set("list", vec![1, 2, 3]).unwrap();
    assert!(!registry.set("list", vec![1, 2, 3]).unwrap());
}

/// Test that a selector recomputes once per relevant change and never when
/// nothing it read has moved.
#[test]
fn selector_memoizes_over_its_dependencies() {
    let registry = Registry::new();
    registry.atom("a", 1).unwrap();
    registry.atom("b", 2).unwrap();
    registry.atom("unrelated", 0).unwrap();

    let runs = Arc::new(AtomicUsize::new(0));
    let runs_clone = runs.clone();
    let sum = registry
        .add_selector("sum", move |get| {
            runs_clone.fetch_add(1, Ordering::SeqCst);
            let a = get.get("a")?.as_i64().unwrap_or(0);
            let b = get.get("b")?.as_i64().unwrap_or(0);
            Ok(Value::from(a + b))
        })
        .unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    registry.set("a", 10).unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert_eq!(sum.get(), Value::from(12));

    // Neither dependency changed
    sum.on_dependency_changed().unwrap();
    registry.set("a", 10).unwrap();
    registry.set("unrelated", 5).unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert_eq!(sum.evaluation_count(), 2);
}

/// Test that binding the same sink and property twice yields one update per
/// change.
#[test]
fn duplicate_sink_bindings_update_once() {
    let registry = Registry::new();
    registry.atom("title", "draft").unwrap();
    let widget = Arc::new(Widget::default());

    registry.bind("title", widget.clone(), "text", true).unwrap();
    registry.bind("title", widget.clone(), "text", true).unwrap();
    widget.properties.lock().clear();

    registry.set("title", "final").unwrap();
    assert_eq!(
        *widget.properties.lock(),
        vec![("text".to_owned(), Value::from("final"))]
    );
    // One flush from the initial push, one from the change
    assert_eq!(widget.flushes.load(Ordering::SeqCst), 2);

    assert_eq!(registry.unbind("title", &widget), 1);
}

/// Test that selectors can be bound one way, and refuse two-way bindings.
#[test]
fn selectors_bind_one_way_only() {
    let registry = Registry::new();
    registry.atom("first", "John").unwrap();
    registry.atom("last", "Doe").unwrap();
    registry.add_selector("full", full_name).unwrap();
    let widget = Arc::new(Widget::default());

    registry.bind("full", widget.clone(), "text", false).unwrap();
    registry.set("last", "Roe").unwrap();
    assert_eq!(
        widget.properties.lock().last().map(|(_, v)| v.clone()),
        Some(Value::from("John Roe"))
    );

    assert!(matches!(
        registry.bind_two_way("full", widget, "text", false),
        Err(StateError::SetOnDerived { .. })
    ));
}

/// Test the full state → sink → state round trip of a two-way binding.
#[test]
fn two_way_binding_round_trip() {
    let registry = Registry::new();
    registry.atom("email", "").unwrap();
    let field = Arc::new(Widget::default());

    let write_back = registry.bind_two_way("email", field.clone(), "value", false).unwrap();

    registry.set("email", "ana@example.com").unwrap();
    assert_eq!(
        field.properties.lock().last().map(|(_, v)| v.clone()),
        Some(Value::from("ana@example.com"))
    );

    // The widget's change hook
    assert!(write_back.write("bia@example.com").unwrap());
    assert_eq!(registry.get("email").unwrap(), Value::from("bia@example.com"));
    assert_eq!(
        field.properties.lock().last().map(|(_, v)| v.clone()),
        Some(Value::from("bia@example.com"))
    );

    registry.delete("email");
    assert!(matches!(
        write_back.write("late"),
        Err(StateError::UnknownKey { .. })
    ));
}

fn register_cycle(registry: &Registry) {
    registry.atom("seed", 0).unwrap();
    registry
        .add_selector("b", |get| {
            let seed = get.get("seed")?.as_i64().unwrap_or(0);
            // "a" is only read once the seed is set, which closes the loop
            let a = if seed > 0 {
                get.get("a")?.as_i64().unwrap_or(0)
            } else {
                0
            };
            Ok(Value::from(seed + a))
        })
        .unwrap();
    registry
        .add_selector("a", |get| {
            Ok(Value::from(get.get("b")?.as_i64().unwrap_or(0) + 1))
        })
        .unwrap();
}

/// Test that a runaway cycle is reported instead of overflowing the stack.
#[test]
fn cycle_is_detected_within_the_bound() {
    let registry = Registry::with_config(StateConfig::default().with_max_update_depth(8));
    register_cycle(&registry);

    let err = registry.set("seed", 1).unwrap_err();
    match err {
        StateError::CycleDetected {
            key,
            depth,
            dependencies,
        } => {
            assert_eq!(key, "b");
            assert_eq!(depth, 9);
            assert_eq!(dependencies, vec!["seed", "a"]);
        }
        other => panic!("expected a cycle, got {other:?}"),
    }

    // The registry stays usable once the loop is broken
    registry.set("seed", 0).unwrap();
    assert_eq!(registry.get("b").unwrap(), Value::from(0));
    assert_eq!(registry.get("a").unwrap(), Value::from(1));
}

/// Test the cycle bound with the default configuration on a default-size
/// thread stack.
#[test]
fn cycle_is_detected_with_default_depth() {
    let handle = thread::spawn(|| {
        let registry = Registry::new();
        register_cycle(&registry);
        registry.set("seed", 1)
    });

    let result = handle.join().unwrap();
    assert!(matches!(
        result,
        Err(StateError::CycleDetected { depth: 101, .. })
    ));
}

/// Test the name scenario: one write, one recomputation, new value.
#[test]
fn full_name_follows_first_name() {
    let registry = Registry::new();
    registry.atom("first", "John").unwrap();
    registry.atom("last", "Doe").unwrap();
    let full = registry.selector("full").compute(full_name).unwrap();
    assert_eq!(full.get(), Value::from("John Doe"));

    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = seen.clone();
    registry
        .listen(
            "full",
            callback(move |v| seen_clone.lock().push(v.clone())),
            false,
        )
        .unwrap();

    let before = full.evaluation_count();
    registry.set("first", "Jane").unwrap();

    assert_eq!(registry.get("full").unwrap(), Value::from("Jane Doe"));
    assert_eq!(full.evaluation_count(), before + 1);
    assert_eq!(*seen.lock(), vec![Value::from("Jane Doe")]);
}

/// Test that clearing the registry leaves nothing behind for re-created keys.
#[test]
fn clear_leaves_no_listeners_behind() {
    let registry = Registry::new();
    let old = registry.atom("a", 0).unwrap();
    let (count, cb) = counter();
    registry.listen("a", cb, false).unwrap();

    registry.clear();
    assert!(registry.is_empty());
    assert!(old.is_detached());

    let fresh = registry.atom("a", 0).unwrap();
    assert!(!Arc::ptr_eq(&old, &fresh));
    assert_eq!(fresh.listener_count(), 0);

    registry.set("a", 1).unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 0);
}

/// Test that a selector over a deleted key keeps its last value.
#[test]
fn deleted_dependency_keeps_last_value() {
    let registry = Registry::new();
    let a = registry.atom("a", 3).unwrap();
    registry
        .add_selector("double", |get| {
            Ok(Value::from(get.get("a")?.as_i64().unwrap_or(0) * 2))
        })
        .unwrap();

    registry.delete("a");
    a.set(10).unwrap();
    assert_eq!(registry.get("double").unwrap(), Value::from(6));

    // Forcing a recomputation now fails inside compute, which is logged
    registry.invalidate("double").unwrap();
    assert_eq!(registry.get("double").unwrap(), Value::from(6));
}

/// Test that keys read only on some branches are discovered when first read.
#[test]
fn dependencies_are_discovered_dynamically() {
    let registry = Registry::new();
    registry.atom("use_metric", false).unwrap();
    registry.atom("km", 10).unwrap();
    registry.atom("miles", 6).unwrap();

    let distance = registry
        .add_selector("distance", |get| {
            if get.get("use_metric")?.as_bool().unwrap_or(false) {
                Ok(get.get("km")?)
            } else {
                Ok(get.get("miles")?)
            }
        })
        .unwrap();
    assert_eq!(distance.dependencies(), vec!["use_metric", "miles"]);

    // Not read yet, so not a dependency yet
    registry.set("km", 11).unwrap();
    assert_eq!(distance.evaluation_count(), 1);

    registry.set("use_metric", true).unwrap();
    assert_eq!(distance.get(), Value::from(11));
    assert_eq!(distance.dependencies(), vec!["use_metric", "km"]);

    registry.set("km", 12).unwrap();
    assert_eq!(distance.get(), Value::from(12));
}

/// Test that a selector can depend on another selector.
#[test]
fn selectors_chain() {
    let registry = Registry::new();
    registry.atom("price", 10).unwrap();
    registry.atom("qty", 2).unwrap();
    registry
        .add_selector("subtotal", |get| {
            let price = get.get("price")?.as_i64().unwrap_or(0);
            let qty = get.get("qty")?.as_i64().unwrap_or(0);
            Ok(Value::from(price * qty))
        })
        .unwrap();
    registry
        .add_selector("total", |get| {
            Ok(Value::from(get.get("subtotal")?.as_i64().unwrap_or(0) + 5))
        })
        .unwrap();

    registry.set("qty", 3).unwrap();
    assert_eq!(registry.get("total").unwrap(), Value::from(35));
}

/// Test that a selector computing an equal value does not notify.
#[test]
fn equal_recomputation_does_not_notify() {
    let registry = Registry::new();
    registry.atom("n", 2).unwrap();
    registry
        .add_selector("is_even", |get| {
            Ok(Value::from(get.get("n")?.as_i64().unwrap_or(0) % 2 == 0))
        })
        .unwrap();
    let (count, cb) = counter();
    registry.listen("is_even", cb, false).unwrap();

    registry.set("n", 4).unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 0);

    registry.set("n", 5).unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

/// Test that shared payloads compare through `PartialEq` or identity.
#[test]
fn shared_payloads_use_the_equality_gate() {
    #[derive(PartialEq)]
    struct Point {
        x: i32,
        y: i32,
    }

    let registry = Registry::new();
    registry.atom("origin", Value::shared(Point { x: 0, y: 0 })).unwrap();
    let (count, cb) = counter();
    registry.listen("origin", cb, false).unwrap();

    assert!(!registry.set("origin", Value::shared(Point { x: 0, y: 0 })).unwrap());
    assert!(registry.set("origin", Value::shared(Point { x: 1, y: 0 })).unwrap());
    assert_eq!(count.load(Ordering::SeqCst), 1);

    let handle = Value::opaque(vec![1u8, 2, 3]);
    registry.set("blob", handle.clone()).unwrap();
    assert!(!registry.set("blob", handle).unwrap());
    assert!(registry.set("blob", Value::opaque(vec![1u8, 2, 3])).unwrap());
}

/// Test registry misuse errors.
#[test]
fn misuse_is_reported() {
    let registry = Registry::new();
    registry.atom("a", 1).unwrap();
    registry.add_selector("s", |get| Ok(get.get("a")?)).unwrap();

    assert!(matches!(
        registry.atom("s", 0),
        Err(StateError::KeyKindConflict { existing: CellKind::Selector, .. })
    ));
    assert!(matches!(
        registry.reset("s", 0),
        Err(StateError::ResetOnDerived { .. })
    ));
    assert!(matches!(registry.get("zzz"), Err(StateError::UnknownKey { .. })));
}

/// Test that a panicking listener does not stop the others.
#[test]
fn failing_listener_is_isolated() {
    let registry = Registry::new();
    registry.atom("n", 0).unwrap();
    registry
        .listen("n", callback(|_| panic!("listener bug")), false)
        .unwrap();
    let (count, cb) = counter();
    registry.listen("n", cb, false).unwrap();

    assert!(registry.set("n", 1).unwrap());
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

fn slow_selector(policy: CoalescePolicy) -> (Registry, i64, u64) {
    let registry = Registry::with_config(StateConfig::default().with_coalesce(policy));
    registry.atom("x", 0).unwrap();

    let (entered_tx, entered_rx) = mpsc::channel::<()>();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let entered_tx = Mutex::new(entered_tx);
    let release_rx = Mutex::new(release_rx);

    let slow = registry
        .add_selector("slow", move |get| {
            let x = get.get("x")?.as_i64().unwrap_or(0);
            if x == 1 {
                entered_tx.lock().send(()).ok();
                release_rx.lock().recv().ok();
            }
            Ok(Value::from(x * 10))
        })
        .unwrap();

    let writer = {
        let registry = registry.clone();
        thread::spawn(move || registry.set("x", 1).unwrap())
    };
    entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    // Lands while the writer's recomputation holds the selector
    registry.set("x", 2).unwrap();
    release_tx.send(()).unwrap();
    writer.join().unwrap();

    let value = slow.get().as_i64().unwrap_or(-1);
    (registry, value, slow.evaluation_count())
}

/// Test that a trigger landing mid-update is dropped by default.
#[test]
fn concurrent_trigger_is_coalesced_by_default() {
    let (registry, value, evaluations) = slow_selector(CoalescePolicy::Drop);

    assert_eq!(value, 10);
    assert_eq!(evaluations, 2);

    // The next trigger catches up
    registry.invalidate("slow").unwrap();
    assert_eq!(registry.get("slow").unwrap(), Value::from(20));
}

/// Test that the rerun policy replays a trigger that landed mid-update.
#[test]
fn concurrent_trigger_is_replayed_with_rerun_policy() {
    let (_registry, value, evaluations) = slow_selector(CoalescePolicy::Rerun);

    assert_eq!(value, 20);
    assert_eq!(evaluations, 3);
}

/// Test the async selector lifecycle on an ambient runtime.
#[tokio::test]
async fn async_selector_resolves_and_follows_changes() {
    let registry = Registry::new();
    registry.atom("n", 2).unwrap();

    let square = registry
        .add_async_selector("square", |get| async move {
            tokio::task::yield_now().await;
            let n = get.get("n")?.as_i64().unwrap_or(0);
            Ok::<_, anyhow::Error>(Value::from(n * n))
        })
        .unwrap();
    assert!(square.get().is_unresolved());
    assert!(!square.is_resolved());

    registry.settle("square").await;
    assert_eq!(square.get(), Value::from(4));
    assert_eq!(square.dependencies(), vec!["n"]);

    let (count, cb) = counter();
    registry.listen("square", cb, false).unwrap();

    registry.set("n", 3).unwrap();
    registry.settle_all().await;
    assert_eq!(square.get(), Value::from(9));
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

/// Test that a failing async evaluation keeps the last good value.
#[tokio::test]
async fn async_failure_keeps_last_value() {
    let registry = Registry::new();
    registry.atom("n", 2).unwrap();
    registry
        .add_async_selector("root", |get| async move {
            let n = get.get("n")?.as_i64().unwrap_or(0);
            anyhow::ensure!(n >= 0, "cannot take the root of {n}");
            Ok::<_, anyhow::Error>(Value::from((n as f64).sqrt()))
        })
        .unwrap();
    registry.settle("root").await;

    registry.set("n", -4).unwrap();
    registry.settle("root").await;
    assert_eq!(registry.get("root").unwrap(), Value::from(2f64.sqrt()));

    registry.set("n", 9).unwrap();
    registry.settle("root").await;
    assert_eq!(registry.get("root").unwrap(), Value::from(3.0));
}

/// Test that a write racing the first async resolution is picked up.
#[tokio::test]
async fn write_during_first_resolution_is_caught_up() {
    let registry = Registry::new();
    registry.atom("n", 2).unwrap();

    let runs = Arc::new(AtomicUsize::new(0));
    let read_done = Arc::new(Notify::new());
    let gate = Arc::new(Notify::new());
    let square = {
        let (runs, read_done, gate) = (runs.clone(), read_done.clone(), gate.clone());
        registry
            .add_async_selector("square", move |get| {
                let (runs, read_done, gate) = (runs.clone(), read_done.clone(), gate.clone());
                async move {
                    let run = runs.fetch_add(1, Ordering::SeqCst);
                    let n = get.get("n")?.as_i64().unwrap_or(0);
                    if run == 0 {
                        read_done.notify_one();
                        gate.notified().await;
                    }
                    Ok::<_, anyhow::Error>(Value::from(n * n))
                }
            })
            .unwrap()
    };

    read_done.notified().await;
    // No subscription exists yet, so nothing reacts to this write directly
    registry.set("n", 5).unwrap();
    gate.notify_one();

    square.settle().await;
    assert_eq!(square.get(), Value::from(25));
    assert_eq!(square.evaluation_count(), 2);
}

/// Test that an older async result landing after a newer one is discarded.
#[tokio::test]
async fn older_async_result_landing_last_is_discarded() {
    let registry = Registry::new();
    registry.atom("n", 0).unwrap();

    let gate = Arc::new(Notify::new());
    let latest = {
        let gate = gate.clone();
        registry
            .register_selector(
                "latest",
                Arc::new(move |get: Getter| {
                    let n = get.get("n").ok().and_then(|v| v.as_i64()).unwrap_or(0);
                    let gate = gate.clone();
                    Computation::pending(async move {
                        if n == 1 {
                            gate.notified().await;
                        }
                        Ok::<_, anyhow::Error>(Value::from(n * 10))
                    })
                }),
            )
            .unwrap()
    };
    latest.settle().await;
    assert_eq!(latest.get(), Value::from(0));

    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = seen.clone();
    registry
        .listen("latest", callback(move |v| seen_clone.lock().push(v.clone())), false)
        .unwrap();

    registry.set("n", 1).unwrap();
    registry.set("n", 2).unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while latest.get() != Value::from(20) {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();

    // Let the evaluation for n == 1 finish last
    gate.notify_one();
    latest.settle().await;

    assert_eq!(latest.get(), Value::from(20));
    assert_eq!(*seen.lock(), vec![Value::from(20)]);
    assert_eq!(latest.evaluation_count(), 3);
}

/// Test that late results for a deleted selector are dropped.
#[tokio::test]
async fn late_result_for_deleted_selector_is_dropped() {
    let registry = Registry::new();
    let gate = Arc::new(Notify::new());
    let gate_clone = gate.clone();
    let slow = registry
        .add_async_selector("slow", move |_get| {
            let gate = gate_clone.clone();
            async move {
                gate.notified().await;
                Ok::<_, anyhow::Error>(Value::from("done"))
            }
        })
        .unwrap();

    assert!(registry.delete("slow"));
    gate.notify_one();
    slow.settle().await;

    assert!(slow.get().is_unresolved());
    assert!(slow.is_detached());
}

/// Test async selectors without an ambient runtime.
#[test]
fn async_selector_runs_without_ambient_runtime() {
    let registry = Registry::new();
    registry.atom("name", "quark").unwrap();
    let shout = registry
        .add_async_selector("shout", |get| async move {
            let name = get.get("name")?;
            Ok::<_, anyhow::Error>(Value::from(name.as_str().unwrap_or_default().to_uppercase()))
        })
        .unwrap();

    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    shout.listen(
        callback(move |v| {
            tx.lock().send(v.clone()).ok();
        }),
        false,
    );

    let deadline = Instant::now() + Duration::from_secs(5);
    while shout.get().is_unresolved() {
        assert!(Instant::now() < deadline, "initial evaluation never landed");
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(shout.get(), Value::from("QUARK"));

    registry.set("name", "atom").unwrap();
    // The initial value may or may not have reached the listener first
    let next = loop {
        let value = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        if value != Value::from("QUARK") {
            break value;
        }
    };
    assert_eq!(next, Value::from("ATOM"));
}

/// Test an action driving the registry.
#[test]
fn action_updates_derived_state() {
    let registry = Registry::new();
    registry.atom("first", "John").unwrap();
    registry.atom("last", "Doe").unwrap();
    registry.add_selector("full", full_name).unwrap();

    let rename = Action::new(|registry: &Registry, (first, last): (&str, &str)| {
        registry.set("first", first)?;
        registry.set("last", last)
    });

    rename.run(&registry, ("Ada", "Lovelace")).unwrap();
    assert_eq!(registry.get("full").unwrap(), Value::from("Ada Lovelace"));
}
