//! Integration Tests for the Incremental Engine
//!
//! These tests verify that signals, memos, and effects work together correctly.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use ripple_core::{Effect, Error, Memo, Misuse, Runtime, RuntimeConfig, Signal};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn counter() -> Rc<Cell<usize>> {
    Rc::new(Cell::new(0))
}

/// A memo recomputes once per write and never without one.
#[test]
fn memo_recomputes_once_per_write() {
    init_tracing();
    let rt = Runtime::new();
    let v = Signal::new(&rt, 1);
    let runs = counter();
    let tripled = Memo::new(&rt, {
        let (v, runs) = (v.clone(), runs.clone());
        move || {
            runs.set(runs.get() + 1);
            Ok(v.get() * 3)
        }
    });

    for n in 1..=4 {
        v.set(n).unwrap();
        assert_eq!(tripled.get().unwrap(), n * 3);
        assert_eq!(tripled.get().unwrap(), n * 3);
    }
    assert_eq!(runs.get(), 4);
}

/// Two memos over one cell, observed by one effect: one run per write.
#[test]
fn diamond_notifies_once_per_write() {
    init_tracing();
    let rt = Runtime::new();
    let a = Signal::new(&rt, 0);
    let b = Memo::new(&rt, {
        let a = a.clone();
        move || Ok(a.get() + 1)
    });
    let c = Memo::new(&rt, {
        let a = a.clone();
        move || Ok(a.get() * 2)
    });

    let seen = Rc::new(RefCell::new(Vec::new()));
    let effect = Effect::new(&rt, {
        let (b, c, seen) = (b.clone(), c.clone(), seen.clone());
        move || {
            seen.borrow_mut().push((b.get()?, c.get()?));
            Ok(())
        }
    });

    for n in 1..=5 {
        a.set(n).unwrap();
    }

    assert_eq!(effect.run_count(), 6);
    // Never a mix of old and new inputs.
    for &(b, c) in seen.borrow().iter() {
        assert_eq!((b - 1) * 2, c);
    }
    assert_eq!(seen.borrow().last(), Some(&(6, 10)));
}

/// Writes inside one batch reach a diamond's effect exactly once.
#[test]
fn batched_writes_coalesce() {
    let rt = Runtime::new();
    let a = Signal::new(&rt, 0);
    let b = Signal::new(&rt, 0);
    let sum = Memo::new(&rt, {
        let (a, b) = (a.clone(), b.clone());
        move || Ok(a.get() + b.get())
    });
    let seen = Rc::new(RefCell::new(Vec::new()));
    let _effect = Effect::new(&rt, {
        let (sum, seen) = (sum.clone(), seen.clone());
        move || {
            seen.borrow_mut().push(sum.get()?);
            Ok(())
        }
    });

    let returned = rt.batch(|| {
        for n in 1..=3 {
            a.set(n).unwrap();
            b.set(n * 10).unwrap();
        }
        "done"
    });

    assert_eq!(returned, "done");
    assert_eq!(*seen.borrow(), vec![0, 33]);
}

/// A memo whose output never changes stops a change from spreading.
#[test]
fn stable_memo_short_circuits() {
    let rt = Runtime::new();
    let x = Signal::new(&rt, 0b1010);
    let masked_runs = counter();
    let masked = Memo::new(&rt, {
        let (x, masked_runs) = (x.clone(), masked_runs.clone());
        move || {
            masked_runs.set(masked_runs.get() + 1);
            Ok(x.get() & 0)
        }
    });
    let plus_one = Memo::new(&rt, {
        let masked = masked.clone();
        move || Ok(masked.get()? + 1)
    });
    let effect = Effect::new(&rt, {
        let plus_one = plus_one.clone();
        move || plus_one.get().map(|_| ())
    });

    for n in 0..10 {
        x.set(n * 7 + 1).unwrap();
    }

    assert_eq!(masked_runs.get(), 11);
    assert_eq!(effect.run_count(), 1);
    assert_eq!(plus_one.get().unwrap(), 1);
    assert!(!plus_one.is_invalidated());
}

/// A node invalidated by two sources stays invalidated until both resolve.
#[test]
fn partial_revalidation_keeps_node_invalidated() {
    let rt = Runtime::new();
    let a = Signal::new(&rt, 1);
    let b = Signal::new(&rt, 1);
    let p = Memo::new(&rt, {
        let a = a.clone();
        move || Ok(a.get())
    });
    let q = Memo::new(&rt, {
        let b = b.clone();
        move || Ok(b.get() & 0)
    });
    let t = Memo::new(&rt, {
        let (p, q) = (p.clone(), q.clone());
        move || Ok(p.get()? + q.get()?)
    });
    let seen = Rc::new(RefCell::new(Vec::new()));
    let _effect = Effect::new(&rt, {
        let (t, seen) = (t.clone(), seen.clone());
        move || {
            seen.borrow_mut().push(t.get()?);
            Ok(())
        }
    });

    rt.batch(|| {
        a.set(2).unwrap();
        b.set(3).unwrap();
        assert!(t.is_invalidated());

        // q turns out unchanged; p has not been resolved yet.
        assert_eq!(q.get().unwrap(), 0);
        assert!(t.is_invalidated());

        assert_eq!(p.get().unwrap(), 2);
        assert!(t.is_invalidated());
    });

    assert_eq!(*seen.borrow(), vec![1, 2]);
    assert!(!t.is_invalidated());
}

/// Reverting a cell inside a batch suppresses everything downstream of it.
#[test]
fn reverted_write_is_rolled_back() {
    init_tracing();
    let rt = Runtime::new();
    let v = Signal::new(&rt, 0);
    let d = Memo::new(&rt, {
        let v = v.clone();
        move || Ok(v.get() * 2)
    });
    let log = Rc::new(RefCell::new(Vec::new()));
    let effect = Effect::new(&rt, {
        let (d, log) = (d.clone(), log.clone());
        move || {
            log.borrow_mut().push(d.get()?);
            Ok(())
        }
    });

    rt.batch(|| {
        v.set(5).unwrap();
        // The draft is visible inside the transaction.
        assert_eq!(d.get().unwrap(), 10);
        v.set(0).unwrap();
        assert_eq!(d.get().unwrap(), 0);
    });

    assert_eq!(*log.borrow(), vec![0]);
    assert_eq!(effect.run_count(), 1);
    assert!(rt.stats().rollbacks >= 1);

    // The graph is still live afterwards.
    v.set(4).unwrap();
    assert_eq!(*log.borrow(), vec![0, 8]);
}

/// Any number of writes reverted inside a batch still notify nobody.
#[test]
fn repeated_writes_then_revert_are_silent() {
    let rt = Runtime::new();
    let v = Signal::new(&rt, 0);
    let log = Rc::new(RefCell::new(Vec::new()));
    let effect = Effect::new(&rt, {
        let (v, log) = (v.clone(), log.clone());
        move || {
            log.borrow_mut().push(v.get());
            Ok(())
        }
    });

    rt.batch(|| {
        v.set(1).unwrap();
        v.set(2).unwrap();
        v.set(0).unwrap();
    });

    assert_eq!(*log.borrow(), vec![0]);
    assert_eq!(effect.run_count(), 1);

    v.set(3).unwrap();
    assert_eq!(*log.borrow(), vec![0, 3]);
}

/// A memo read between writes is rolled back when the cell reverts.
#[test]
fn draft_read_between_writes_then_revert_is_silent() {
    let rt = Runtime::new();
    let v = Signal::new(&rt, 0);
    let d = Memo::new(&rt, {
        let v = v.clone();
        move || Ok(v.get() * 2)
    });
    let log = Rc::new(RefCell::new(Vec::new()));
    let effect = Effect::new(&rt, {
        let (d, log) = (d.clone(), log.clone());
        move || {
            log.borrow_mut().push(d.get()?);
            Ok(())
        }
    });

    rt.batch(|| {
        v.set(1).unwrap();
        assert_eq!(d.get().unwrap(), 2);
        v.set(2).unwrap();
        assert_eq!(d.get().unwrap(), 4);
        v.set(3).unwrap();
        v.set(0).unwrap();
    });

    assert_eq!(*log.borrow(), vec![0]);
    assert_eq!(effect.run_count(), 1);
    assert_eq!(d.get().unwrap(), 0);
}

/// A draft that came out unchanged still sees the next write.
#[test]
fn unchanged_draft_sees_the_next_write() {
    let rt = Runtime::new();
    let v = Signal::new(&rt, 0);
    let parity = Memo::new(&rt, {
        let v = v.clone();
        move || Ok(v.get() % 2)
    });
    let log = Rc::new(RefCell::new(Vec::new()));
    let _effect = Effect::new(&rt, {
        let (parity, log) = (parity.clone(), log.clone());
        move || {
            log.borrow_mut().push(parity.get()?);
            Ok(())
        }
    });

    rt.batch(|| {
        v.set(2).unwrap();
        assert_eq!(parity.get().unwrap(), 0);
        v.set(3).unwrap();
        assert_eq!(parity.get().unwrap(), 1);
    });

    assert_eq!(*log.borrow(), vec![0, 1]);
}

/// Both reverting patterns, through a diamond.
#[test]
fn diamond_revert_after_drafts_is_silent() {
    let rt = Runtime::new();
    let a = Signal::new(&rt, 0);
    let b = Memo::new(&rt, {
        let a = a.clone();
        move || Ok(a.get() + 1)
    });
    let c = Memo::new(&rt, {
        let a = a.clone();
        move || Ok(a.get() * 2)
    });
    let sum = Memo::new(&rt, {
        let (b, c) = (b.clone(), c.clone());
        move || Ok(b.get()? + c.get()?)
    });
    let log = Rc::new(RefCell::new(Vec::new()));
    let effect = Effect::new(&rt, {
        let (sum, log) = (sum.clone(), log.clone());
        move || {
            log.borrow_mut().push(sum.get()?);
            Ok(())
        }
    });

    rt.batch(|| {
        a.set(1).unwrap();
        a.set(2).unwrap();
        a.set(0).unwrap();
    });
    assert_eq!(effect.run_count(), 1);

    rt.batch(|| {
        a.set(1).unwrap();
        assert_eq!(sum.get().unwrap(), 4);
        a.set(2).unwrap();
        assert_eq!(sum.get().unwrap(), 7);
        a.set(0).unwrap();
        assert_eq!(sum.get().unwrap(), 1);
    });
    assert_eq!(effect.run_count(), 1);
    assert_eq!(*log.borrow(), vec![1]);

    a.set(5).unwrap();
    assert_eq!(*log.borrow(), vec![1, 16]);
}

/// An unobserved stale memo resets and detaches, cascading upstream.
#[test]
fn unobserved_chain_is_disposed() {
    let rt = Runtime::new();
    let cell = Signal::new(&rt, 1);
    let inner = Memo::new(&rt, {
        let cell = cell.clone();
        move || Ok(cell.get() + 1)
    });
    let outer = Memo::new(&rt, {
        let inner = inner.clone();
        move || Ok(inner.get()? * 10)
    });

    assert_eq!(outer.get().unwrap(), 20);
    assert_eq!(cell.subscriber_count(), 1);
    assert_eq!(inner.subscriber_count(), 1);

    cell.set(2).unwrap();

    assert!(!outer.is_initialized());
    assert!(!inner.is_initialized());
    assert_eq!(outer.source_count(), 0);
    assert_eq!(inner.subscriber_count(), 0);
    assert_eq!(cell.subscriber_count(), 0);
    assert_eq!(rt.stats().disposals, 2);

    assert_eq!(outer.get().unwrap(), 30);
}

/// Disposing an effect releases its sources; the memo it observed is
/// disposed once it goes stale.
#[test]
fn disposed_effect_releases_its_memo() {
    let rt = Runtime::new();
    let cell = Signal::new(&rt, 1);
    let memo = Memo::new(&rt, {
        let cell = cell.clone();
        move || Ok(cell.get())
    });
    let effect = Effect::new(&rt, {
        let memo = memo.clone();
        move || memo.get().map(|_| ())
    });
    assert_eq!(memo.subscriber_count(), 1);

    effect.dispose();
    assert_eq!(memo.subscriber_count(), 0);
    assert!(memo.is_initialized());

    cell.set(2).unwrap();
    assert!(!memo.is_initialized());
    assert_eq!(cell.subscriber_count(), 0);
    assert_eq!(effect.run_count(), 1);
}

/// Dropping the effect handle detaches it.
#[test]
fn dropped_effect_stops_running() {
    let rt = Runtime::new();
    let cell = Signal::new(&rt, 0);
    let runs = counter();
    let effect = Effect::new(&rt, {
        let (cell, runs) = (cell.clone(), runs.clone());
        move || {
            runs.set(runs.get() + 1);
            cell.get();
            Ok(())
        }
    });

    drop(effect);
    assert_eq!(cell.subscriber_count(), 0);
    cell.set(1).unwrap();
    assert_eq!(runs.get(), 1);
}

/// Memos that read each other fail instead of looping.
#[test]
fn transitive_self_read_is_cyclic() {
    let rt = Runtime::new();
    let slot: Rc<RefCell<Option<Memo<i32>>>> = Rc::default();
    let first = Memo::new(&rt, {
        let slot = slot.clone();
        move || match &*slot.borrow() {
            Some(second) => second.get(),
            None => Ok(0),
        }
    });
    let second = Memo::new(&rt, {
        let first = first.clone();
        move || Ok(first.get()? + 1)
    });
    *slot.borrow_mut() = Some(second.clone());

    let err = first.get().unwrap_err();
    assert!(matches!(err, Error::CyclicDependency(id) if id == first.id()));

    // The fault is cached and re-raised as the same outcome.
    assert!(first.get().unwrap_err().same_as(&err));

    slot.borrow_mut().take();
}

/// `v = 0; d = v * 2; effect logs d`.
#[test]
fn doubling_scenario_logs_in_order() {
    init_tracing();
    let rt = Runtime::new();
    let v = Signal::new(&rt, 0);
    let d = Memo::new(&rt, {
        let v = v.clone();
        move || Ok(v.get() * 2)
    });
    let log = Rc::new(RefCell::new(Vec::new()));
    let _effect = Effect::new(&rt, {
        let (d, log) = (d.clone(), log.clone());
        move || {
            log.borrow_mut().push(d.get()?);
            Ok(())
        }
    });
    assert_eq!(*log.borrow(), vec![0]);

    v.set(0).unwrap();
    assert_eq!(*log.borrow(), vec![0]);

    v.set(1).unwrap();
    v.set(2).unwrap();
    assert_eq!(*log.borrow(), vec![0, 2, 4]);
}

/// An effect whose memo faults is reported once and never retried.
#[test]
fn effect_fault_goes_to_handler() {
    init_tracing();
    let rt = Runtime::new();
    let faults = Rc::new(RefCell::new(Vec::new()));
    rt.set_fault_handler({
        let faults = faults.clone();
        move |err: &Error| faults.borrow_mut().push(err.clone())
    });

    let divisor = Signal::new(&rt, 1);
    let quotient = Memo::new(&rt, {
        let divisor = divisor.clone();
        move || match divisor.get() {
            0 => Err(Error::msg("division by zero")),
            d => Ok(100 / d),
        }
    });
    let effect = Effect::new(&rt, {
        let quotient = quotient.clone();
        move || quotient.get().map(|_| ())
    });

    divisor.set(0).unwrap();
    assert!(effect.is_disposed());
    assert_eq!(faults.borrow().len(), 1);
    assert_eq!(faults.borrow()[0].to_string(), "division by zero");

    // The memo re-raises the very same fault.
    let cached = quotient.get().unwrap_err();
    assert!(cached.same_as(&faults.borrow()[0]));

    divisor.set(5).unwrap();
    assert_eq!(faults.borrow().len(), 1);
    assert_eq!(quotient.get().unwrap(), 20);

    // Back to the default handler, which only logs.
    assert!(rt.take_fault_handler().is_some());
}

/// An effect cannot be started from inside a memo.
#[test]
fn effect_inside_memo_is_misuse() {
    let rt = Runtime::new();
    let faults = Rc::new(RefCell::new(Vec::new()));
    rt.set_fault_handler({
        let faults = faults.clone();
        move |err: &Error| faults.borrow_mut().push(err.clone())
    });

    let memo = Memo::new(&rt, {
        let rt = rt.clone();
        move || {
            let effect = Effect::new(&rt, || Ok(()));
            Ok(effect.is_disposed())
        }
    });

    assert!(memo.get().unwrap());
    assert!(matches!(
        faults.borrow()[0],
        Error::ContextMisuse(Misuse::EffectInsideDerived)
    ));
}

/// Reads inside `untracked` do not subscribe the effect.
#[test]
fn untracked_reads_do_not_rerun_effect() {
    let rt = Runtime::new();
    let tracked = Signal::new(&rt, 0);
    let ignored = Signal::new(&rt, 0);
    let effect = Effect::new(&rt, {
        let rt = rt.clone();
        let (tracked, ignored) = (tracked.clone(), ignored.clone());
        move || {
            tracked.get();
            rt.untracked(|| ignored.get())?;
            Ok(())
        }
    });

    ignored.set(1).unwrap();
    assert_eq!(effect.run_count(), 1);
    assert_eq!(ignored.subscriber_count(), 0);

    tracked.set(1).unwrap();
    assert_eq!(effect.run_count(), 2);
}

/// Dependencies follow the branch taken on the latest run.
#[test]
fn dynamic_dependencies_are_retracked() {
    let rt = Runtime::new();
    let use_left = Signal::new(&rt, true);
    let left = Signal::new(&rt, 1);
    let right = Signal::new(&rt, 2);
    let seen = Rc::new(RefCell::new(Vec::new()));
    let effect = Effect::new(&rt, {
        let (use_left, left, right, seen) =
            (use_left.clone(), left.clone(), right.clone(), seen.clone());
        move || {
            let value = if use_left.get() { left.get() } else { right.get() };
            seen.borrow_mut().push(value);
            Ok(())
        }
    });
    assert_eq!(right.subscriber_count(), 0);

    use_left.set(false).unwrap();
    assert_eq!(left.subscriber_count(), 0);
    assert_eq!(right.subscriber_count(), 1);
    assert_eq!(effect.source_count(), 2);

    left.set(10).unwrap();
    right.set(20).unwrap();
    assert_eq!(*seen.borrow(), vec![1, 2, 20]);
}

/// A cascade of effects feeding each other is cut off by the configured limit.
#[test]
fn effect_limit_from_json_config() {
    init_tracing();
    let config = RuntimeConfig::from_json(r#"{ "effect_limit": 8 }"#).unwrap();
    let rt = Runtime::with_config(config);
    let faults = Rc::new(RefCell::new(Vec::new()));
    rt.set_fault_handler({
        let faults = faults.clone();
        move |err: &Error| faults.borrow_mut().push(err.clone())
    });

    let cells: Vec<Signal<i32>> = (0..=12).map(|_| Signal::new(&rt, 0)).collect();
    let _relays: Vec<Effect> = cells
        .windows(2)
        .map(|pair| {
            let (from, to) = (pair[0].clone(), pair[1].clone());
            let writer = rt.clone();
            Effect::new(&rt, move || {
                let n = from.get();
                writer.untracked(|| to.set(n + 1))?
            })
        })
        .collect();
    assert!(faults.borrow().is_empty());

    cells[0].set(100).unwrap();

    assert_eq!(faults.borrow().len(), 1);
    assert!(matches!(faults.borrow()[0], Error::RunawayFlush { limit: 8 }));
    assert_eq!(rt.stats().notifications, 8);
    assert_eq!(cells[8].get(), 108);
    assert_ne!(cells[9].get(), 109);
}

/// Counters serialize for diagnostics.
#[test]
fn stats_serialize_as_json() {
    let rt = Runtime::new();
    let cell = Signal::new(&rt, 0);
    let memo = Memo::new(&rt, {
        let cell = cell.clone();
        move || Ok(cell.get() + 1)
    });
    let _effect = Effect::new(&rt, {
        let memo = memo.clone();
        move || memo.get().map(|_| ())
    });
    cell.set(1).unwrap();

    let json: serde_json::Value = serde_json::to_value(rt.stats()).unwrap();
    assert_eq!(json["recomputes"], 2);
    assert_eq!(json["notifications"], 1);
    assert_eq!(json["settlements"], 1);
}
