use replayfix::errors::FixtureError;
use replayfix::runtime::{FakeFileSystem, ManualScheduler, ProductionFileSystem};
use replayfix::store::{FixtureKey, FixtureStore};
use replayfix::{
    call, method_fn, wrap, ArgValue, FixtureStub, MethodHost, MethodTable, MismatchPolicy, Mode,
    TestContext, WrapOptions,
};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

const METHOD_TO_FIX: &str = "incStateNextTick";

// ── helpers ───────────────────────────────────────────────────────────────────

/// Sets `state` to `arg.val`, then on another thread bumps it and reports it.
struct ThingToTest {
    state: Arc<AtomicI64>,
    methods: MethodTable,
}

impl ThingToTest {
    fn new() -> Arc<Self> {
        let state = Arc::new(AtomicI64::new(0));
        let methods = MethodTable::new();
        let shared = Arc::clone(&state);
        methods.define(
            METHOD_TO_FIX,
            method_fn(move |args, callback| {
                let val = args
                    .first()
                    .and_then(|arg| arg.get("val"))
                    .and_then(|val| val.as_i64())
                    .unwrap_or(0);
                shared.store(val, Ordering::SeqCst);
                let shared = Arc::clone(&shared);
                std::thread::spawn(move || {
                    let next = shared.fetch_add(1, Ordering::SeqCst) + 1;
                    callback(Ok(vec![ArgValue::from(next)]));
                });
                Ok(())
            }),
        );
        Arc::new(Self { state, methods })
    }

    fn state(&self) -> i64 {
        self.state.load(Ordering::SeqCst)
    }
}

impl MethodHost for ThingToTest {
    fn methods(&self) -> &MethodTable {
        &self.methods
    }
}

fn state_arg(val: i64) -> ArgValue {
    ArgValue::object([("val", ArgValue::from(val))])
}

fn circular_arg(val: i64) -> ArgValue {
    let arg = state_arg(val);
    arg.as_object()
        .expect("object")
        .insert("circ", arg.clone());
    arg
}

fn invoke(thing: &ThingToTest, arg: ArgValue) -> i64 {
    let payload = call(thing, METHOD_TO_FIX, vec![arg])
        .expect("call starts")
        .wait()
        .expect("callback fires")
        .expect("success outcome");
    payload
        .first()
        .and_then(ArgValue::as_i64)
        .expect("numeric state")
}

fn wrap_thing(
    thing: &Arc<ThingToTest>,
    mode: Mode,
    dir: &Path,
    ctx: &Arc<TestContext>,
) -> FixtureStub {
    wrap(
        Arc::clone(thing),
        METHOD_TO_FIX,
        WrapOptions::new(mode, dir, Arc::clone(ctx)),
    )
    .expect("wrap")
}

/// First call's callback makes the second call, the way chained callback
/// code does. Returns what the second call reported.
fn chained_calls(thing: &Arc<ThingToTest>) -> Result<i64, FixtureError> {
    let (tx, rx) = std::sync::mpsc::channel();
    let inner = Arc::clone(thing);
    thing.invoke(
        METHOD_TO_FIX,
        vec![state_arg(0)],
        Box::new(move |outcome| {
            let first = outcome
                .ok()
                .and_then(|payload| payload.first().and_then(ArgValue::as_i64))
                .unwrap_or(-1);
            let second = call(&*inner, METHOD_TO_FIX, vec![state_arg(first)])
                .and_then(|pending| pending.wait())
                .map(|outcome| {
                    outcome
                        .ok()
                        .and_then(|payload| payload.first().and_then(ArgValue::as_i64))
                        .unwrap_or(-1)
                });
            let _ = tx.send(second);
        }),
    )?;
    rx.recv()
        .map_err(|_| FixtureError::Abandoned("first callback never ran".to_string()))?
}

fn on_named_thread<T, F>(name: &str, f: F) -> T
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .expect("spawn")
        .join()
        .expect("join")
}

// ── shared scenarios ──────────────────────────────────────────────────────────

fn falls_back_onto_wrapped_method(mode: Mode, dir: &Path, test: &str, expect_target_calls: bool) {
    let thing = ThingToTest::new();
    let ctx = TestContext::new();
    let _scope = ctx.begin_test(test);
    let stub = wrap_thing(&thing, mode, dir, &ctx);

    assert_eq!(invoke(&thing, state_arg(0)), 1);
    assert_eq!(thing.state(), if expect_target_calls { 1 } else { 0 });
    assert_eq!(stub.call_count(), 1);
    assert!(stub.faults().is_empty());
    assert!(stub.restore());
}

fn works_with_multiple_calls(mode: Mode, dir: &Path, test: &str, expect_target_calls: bool) {
    let thing = ThingToTest::new();
    let ctx = TestContext::new();
    let _scope = ctx.begin_test(test);
    let stub = wrap_thing(&thing, mode, dir, &ctx);

    let first = invoke(&thing, state_arg(0));
    let second = invoke(&thing, state_arg(first));
    assert_eq!(second, 2);
    assert_eq!(thing.state(), if expect_target_calls { 2 } else { 0 });
    assert_eq!(stub.call_count(), 2);
    assert!(stub.faults().is_empty());
}

fn works_with_circular_references(
    mode: Mode,
    dir: &Path,
    test: &str,
    expect_target_calls: bool,
) {
    let thing = ThingToTest::new();
    let ctx = TestContext::new();
    let _scope = ctx.begin_test(test);
    let stub = wrap_thing(&thing, mode, dir, &ctx);

    assert_eq!(invoke(&thing, circular_arg(0)), 1);
    assert_eq!(thing.state(), if expect_target_calls { 1 } else { 0 });
    assert_eq!(stub.call_count(), 1);
    assert!(stub.faults().is_empty());
}

// ── live ──────────────────────────────────────────────────────────────────────

#[test]
fn live_falls_back_onto_wrapped_method() {
    let dir = tempfile::tempdir().expect("tempdir");
    falls_back_onto_wrapped_method(Mode::Live, dir.path(), "live::single", true);
}

#[test]
fn live_works_with_multiple_calls() {
    let dir = tempfile::tempdir().expect("tempdir");
    works_with_multiple_calls(Mode::Live, dir.path(), "live::multiple", true);
}

#[test]
fn live_works_with_circular_references() {
    let dir = tempfile::tempdir().expect("tempdir");
    works_with_circular_references(Mode::Live, dir.path(), "live::circular", true);
}

#[test]
fn live_mode_writes_nothing() {
    let dir = tempfile::tempdir().expect("tempdir");
    falls_back_onto_wrapped_method(Mode::Live, dir.path(), "live::nothing", true);
    let entries = std::fs::read_dir(dir.path()).expect("read dir").count();
    assert_eq!(entries, 0);
}

// ── capture ───────────────────────────────────────────────────────────────────

#[test]
fn capture_falls_back_onto_wrapped_method() {
    let dir = tempfile::tempdir().expect("tempdir");
    falls_back_onto_wrapped_method(Mode::Capture, dir.path(), "capture::single", true);
}

#[test]
fn capture_works_with_multiple_calls() {
    let dir = tempfile::tempdir().expect("tempdir");
    works_with_multiple_calls(Mode::Capture, dir.path(), "capture::multiple", true);
}

#[test]
fn capture_works_with_circular_references() {
    let dir = tempfile::tempdir().expect("tempdir");
    works_with_circular_references(Mode::Capture, dir.path(), "capture::circular", true);
}

#[test]
fn capture_records_one_fixture_per_call_in_call_order() {
    let dir = tempfile::tempdir().expect("tempdir");
    let thing = ThingToTest::new();
    let ctx = TestContext::new();
    let _scope = ctx.begin_test("capture::ordinals");
    let stub = wrap_thing(&thing, Mode::Capture, dir.path(), &ctx);

    for _ in 0..3 {
        invoke(&thing, state_arg(0));
    }

    let keys = stub.store().list("capture::ordinals").expect("list");
    assert_eq!(
        keys,
        (0..3)
            .map(|ordinal| FixtureKey::new("capture::ordinals", METHOD_TO_FIX, ordinal))
            .collect::<Vec<_>>()
    );
    let record = stub
        .store()
        .read(&keys[0])
        .expect("read")
        .expect("present");
    assert_eq!(record.result.len(), 2);
}

#[test]
fn capture_is_transparent_to_target_state() {
    let dir = tempfile::tempdir().expect("tempdir");
    let plain = ThingToTest::new();
    let plain_result = invoke(&plain, state_arg(41));

    let wrapped = ThingToTest::new();
    let ctx = TestContext::new();
    let _scope = ctx.begin_test("capture::transparent");
    let _stub = wrap_thing(&wrapped, Mode::Capture, dir.path(), &ctx);
    let wrapped_result = invoke(&wrapped, state_arg(41));

    assert_eq!(wrapped_result, plain_result);
    assert_eq!(wrapped.state(), plain.state());
}

#[test]
fn capture_storage_failure_is_fatal_for_the_call() {
    let fs = FakeFileSystem::default();
    let thing = ThingToTest::new();
    let ctx = TestContext::new();
    let _scope = ctx.begin_test("capture::storage_failure");
    let stub = wrap(
        Arc::clone(&thing),
        METHOD_TO_FIX,
        WrapOptions::new(Mode::Capture, "/fixtures", Arc::clone(&ctx))
            .with_file_system(Arc::new(fs.clone())),
    )
    .expect("wrap");

    fs.set_fail_next(FixtureError::Io("disk full".to_string()));
    let outcome = call(&*thing, METHOD_TO_FIX, vec![state_arg(0)])
        .expect("call starts")
        .wait();

    assert!(matches!(outcome, Err(FixtureError::Abandoned(_))));
    assert_eq!(thing.state(), 1);
    assert_eq!(
        stub.faults(),
        vec![FixtureError::Storage("io error: disk full".to_string())]
    );
    assert!(fs.file_paths().is_empty());
}

#[test]
fn unread_capture_storage_fault_fails_loudly_on_drop() {
    let fs = FakeFileSystem::default();
    let table = Arc::new(MethodTable::new());
    table.define(
        METHOD_TO_FIX,
        method_fn(|_args, callback| {
            callback(Ok(vec![ArgValue::from(1)]));
            Ok(())
        }),
    );
    let ctx = TestContext::new();
    let _scope = ctx.begin_test("capture::unread_fault");
    let stub = wrap(
        Arc::clone(&table),
        METHOD_TO_FIX,
        WrapOptions::new(Mode::Capture, "/fixtures", Arc::clone(&ctx))
            .with_file_system(Arc::new(fs.clone())),
    )
    .expect("wrap");

    fs.set_fail_next(FixtureError::Io("disk full".to_string()));
    let delivered = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&delivered);
    table
        .invoke(
            METHOD_TO_FIX,
            vec![state_arg(0)],
            Box::new(move |_outcome| flag.store(true, Ordering::SeqCst)),
        )
        .expect("call starts");
    assert!(!delivered.load(Ordering::SeqCst));

    let dropped = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || drop(stub)));
    let message = dropped
        .err()
        .and_then(|payload| payload.downcast_ref::<String>().cloned())
        .expect("drop panics with a message");
    assert!(message.contains("unobserved fault"));
    assert!(message.contains("disk full"));
    assert!(!table.methods().get(METHOD_TO_FIX).is_some_and(|m| m.is_stub()));
}

#[test]
fn calls_made_inside_a_callback_keep_the_wrapping_thread_identity() {
    let dir = tempfile::tempdir().expect("tempdir");
    for (mode, expected_state) in [(Mode::Capture, 2), (Mode::Replay, 0)] {
        let path = dir.path().to_path_buf();
        let (second, state, faults, keys) = on_named_thread("suite::chained", move || {
            let thing = ThingToTest::new();
            let ctx = TestContext::new();
            let stub = wrap_thing(&thing, mode, &path, &ctx);
            let second = chained_calls(&thing);
            let keys = stub.store().list("suite::chained").expect("list");
            (second, thing.state(), stub.faults(), keys)
        });
        assert_eq!(second, Ok(2), "{mode}");
        assert_eq!(state, expected_state, "{mode}");
        assert!(faults.is_empty(), "{mode}: {faults:?}");
        assert_eq!(
            keys,
            vec![
                FixtureKey::new("suite::chained", METHOD_TO_FIX, 0),
                FixtureKey::new("suite::chained", METHOD_TO_FIX, 1),
            ]
        );
    }
}

// ── replay ────────────────────────────────────────────────────────────────────

#[test]
fn replay_falls_back_onto_wrapped_method() {
    let dir = tempfile::tempdir().expect("tempdir");
    falls_back_onto_wrapped_method(Mode::Capture, dir.path(), "replay::single", true);
    falls_back_onto_wrapped_method(Mode::Replay, dir.path(), "replay::single", false);
}

#[test]
fn replay_works_with_multiple_calls() {
    let dir = tempfile::tempdir().expect("tempdir");
    works_with_multiple_calls(Mode::Capture, dir.path(), "replay::multiple", true);
    works_with_multiple_calls(Mode::Replay, dir.path(), "replay::multiple", false);
}

#[test]
fn replay_works_with_circular_references() {
    let dir = tempfile::tempdir().expect("tempdir");
    works_with_circular_references(Mode::Capture, dir.path(), "replay::circular", true);
    works_with_circular_references(Mode::Replay, dir.path(), "replay::circular", false);
}

#[test]
fn replay_without_fixture_raises_missing_fixture() {
    let dir = tempfile::tempdir().expect("tempdir");
    let thing = ThingToTest::new();
    let ctx = TestContext::new();
    let _scope = ctx.begin_test("replay::no_mocks");
    let stub = wrap_thing(&thing, Mode::Replay, dir.path(), &ctx);

    let args = vec![ArgValue::object([("foo", ArgValue::from("bar"))])];
    let err = call(&*thing, METHOD_TO_FIX, args)
        .err()
        .expect("missing fixture is raised");

    let FixtureError::MissingFixture {
        test,
        method,
        ordinal,
        ..
    } = &err
    else {
        panic!("unexpected error: {err}");
    };
    assert_eq!(test, "replay::no_mocks");
    assert_eq!(method, METHOD_TO_FIX);
    assert_eq!(*ordinal, 0);
    assert!(err.to_string().contains("incStateNextTick"));
    assert!(err.to_string().contains("call #0"));
    assert_eq!(stub.faults(), vec![err]);
    assert_eq!(stub.call_count(), 1);
    assert_eq!(thing.state(), 0);
}

#[test]
fn replay_runs_out_of_fixtures_after_recorded_calls() {
    let dir = tempfile::tempdir().expect("tempdir");
    falls_back_onto_wrapped_method(Mode::Capture, dir.path(), "replay::exhausted", true);

    let thing = ThingToTest::new();
    let ctx = TestContext::new();
    let _scope = ctx.begin_test("replay::exhausted");
    let _stub = wrap_thing(&thing, Mode::Replay, dir.path(), &ctx);
    assert_eq!(invoke(&thing, state_arg(0)), 1);
    let err = call(&*thing, METHOD_TO_FIX, vec![state_arg(1)]).err();
    assert!(matches!(
        err,
        Some(FixtureError::MissingFixture { ordinal: 1, .. })
    ));
}

#[test]
fn replay_never_completes_on_the_calling_stack() {
    let dir = tempfile::tempdir().expect("tempdir");
    falls_back_onto_wrapped_method(Mode::Capture, dir.path(), "replay::deferred", true);

    let scheduler = ManualScheduler::default();
    let thing = ThingToTest::new();
    let ctx = TestContext::new();
    let _scope = ctx.begin_test("replay::deferred");
    let _stub = wrap(
        Arc::clone(&thing),
        METHOD_TO_FIX,
        WrapOptions::new(Mode::Replay, dir.path(), Arc::clone(&ctx))
            .with_scheduler(Arc::new(scheduler.clone())),
    )
    .expect("wrap");

    let mut pending = call(&*thing, METHOD_TO_FIX, vec![state_arg(0)]).expect("call");
    assert!(pending.try_outcome().is_none());
    assert_eq!(scheduler.run_pending(), 1);
    let payload = pending
        .try_outcome()
        .expect("delivered")
        .expect("not abandoned")
        .expect("success");
    assert_eq!(payload[0].as_i64(), Some(1));
}

#[test]
fn replay_is_keyed_by_test_identity() {
    let dir = tempfile::tempdir().expect("tempdir");
    falls_back_onto_wrapped_method(Mode::Capture, dir.path(), "replay::recorded", true);

    let thing = ThingToTest::new();
    let ctx = TestContext::new();
    let _scope = ctx.begin_test("replay::never_recorded");
    let _stub = wrap_thing(&thing, Mode::Replay, dir.path(), &ctx);
    let err = call(&*thing, METHOD_TO_FIX, vec![state_arg(0)]).err();
    assert!(matches!(err, Some(FixtureError::MissingFixture { .. })));
}

#[test]
fn replay_of_a_corrupt_fixture_is_a_storage_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let test = "replay::corrupt";
    let seeded = FixtureStore::new(dir.path(), Arc::new(ProductionFileSystem));
    let path = seeded.path_for(&FixtureKey::new(test, METHOD_TO_FIX, 0));
    std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
    std::fs::write(&path, "{ not json").expect("seed corrupt fixture");

    let thing = ThingToTest::new();
    let ctx = TestContext::new();
    let _scope = ctx.begin_test(test);
    let stub = wrap_thing(&thing, Mode::Replay, dir.path(), &ctx);
    let err = call(&*thing, METHOD_TO_FIX, vec![state_arg(0)]).err();

    assert!(matches!(&err, Some(FixtureError::Storage(msg)) if msg.contains(".json")));
    assert_eq!(stub.faults(), err.into_iter().collect::<Vec<_>>());
    assert_eq!(stub.call_count(), 1);
    assert_eq!(thing.state(), 0);
}

// ── fingerprint mismatch ──────────────────────────────────────────────────────

type PolicyRun = (Arc<ThingToTest>, FixtureStub, Result<i64, FixtureError>);

fn replay_with_policy(test: &str, policy: MismatchPolicy) -> PolicyRun {
    let dir = tempfile::tempdir().expect("tempdir");
    falls_back_onto_wrapped_method(Mode::Capture, dir.path(), test, true);

    let thing = ThingToTest::new();
    let ctx = TestContext::new();
    let _scope = ctx.begin_test(test);
    let stub = wrap(
        Arc::clone(&thing),
        METHOD_TO_FIX,
        WrapOptions::new(Mode::Replay, dir.path(), Arc::clone(&ctx)).with_mismatch_policy(policy),
    )
    .expect("wrap");
    let result = call(&*thing, METHOD_TO_FIX, vec![state_arg(5)]).map(|pending| {
        pending
            .wait()
            .expect("callback fires")
            .expect("success")
            .first()
            .and_then(ArgValue::as_i64)
            .unwrap_or(-1)
    });
    (thing, stub, result)
}

#[test]
fn mismatch_warn_still_replays_recorded_result() {
    let (thing, stub, result) = replay_with_policy("mismatch::warn", MismatchPolicy::Warn);
    assert_eq!(result, Ok(1));
    assert_eq!(thing.state(), 0);
    assert!(stub.faults().is_empty());
}

#[test]
fn mismatch_ignore_replays_recorded_result() {
    let (_thing, _stub, result) = replay_with_policy("mismatch::ignore", MismatchPolicy::Ignore);
    assert_eq!(result, Ok(1));
}

#[test]
fn mismatch_fail_raises_out_of_band() {
    let (thing, stub, result) = replay_with_policy("mismatch::fail", MismatchPolicy::Fail);
    let expected = FixtureError::FingerprintMismatch {
        test: "mismatch::fail".to_string(),
        method: METHOD_TO_FIX.to_string(),
        ordinal: 0,
    };
    assert_eq!(result, Err(expected.clone()));
    assert_eq!(stub.faults(), vec![expected]);
    assert_eq!(thing.state(), 0);
}

// ── restore ───────────────────────────────────────────────────────────────────

#[test]
fn restore_reinstalls_original_and_stops_counting() {
    let dir = tempfile::tempdir().expect("tempdir");
    let thing = ThingToTest::new();
    let ctx = TestContext::new();
    let _scope = ctx.begin_test("restore::original");
    let stub = wrap_thing(&thing, Mode::Replay, dir.path(), &ctx);

    assert!(stub.restore());
    assert!(!stub.restore());
    assert!(stub.is_restored());

    // Replay would fail with no fixtures; the original runs instead.
    assert_eq!(invoke(&thing, state_arg(4)), 5);
    assert_eq!(thing.state(), 5);
    assert_eq!(stub.call_count(), 0);
}

#[test]
fn dropping_the_handle_restores() {
    let dir = tempfile::tempdir().expect("tempdir");
    let thing = ThingToTest::new();
    let ctx = TestContext::new();
    let _scope = ctx.begin_test("restore::drop");
    let original = thing.methods().get(METHOD_TO_FIX).expect("method");
    {
        let _stub = wrap_thing(&thing, Mode::Live, dir.path(), &ctx);
        assert!(!thing.methods().is_same(METHOD_TO_FIX, &original));
    }
    assert!(thing.methods().is_same(METHOD_TO_FIX, &original));
}

#[test]
fn wrapping_a_wrapped_method_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let thing = ThingToTest::new();
    let ctx = TestContext::new();
    let _scope = ctx.begin_test("restore::double_wrap");
    let original = thing.methods().get(METHOD_TO_FIX).expect("method");

    let live = wrap_thing(&thing, Mode::Live, dir.path(), &ctx);
    let again = wrap(
        Arc::clone(&thing),
        METHOD_TO_FIX,
        WrapOptions::new(Mode::Replay, dir.path(), Arc::clone(&ctx)),
    )
    .err();
    assert_eq!(
        again,
        Some(FixtureError::AlreadyWrapped {
            method: METHOD_TO_FIX.to_string()
        })
    );

    assert!(live.restore());
    assert!(thing.methods().is_same(METHOD_TO_FIX, &original));

    let replay = wrap_thing(&thing, Mode::Replay, dir.path(), &ctx);
    assert!(replay.restore());
    assert!(thing.methods().is_same(METHOD_TO_FIX, &original));
    assert_eq!(invoke(&thing, state_arg(7)), 8);
}

#[test]
fn wrapping_a_missing_method_fails() {
    let dir = tempfile::tempdir().expect("tempdir");
    let thing = ThingToTest::new();
    let ctx = TestContext::new();
    let err = wrap(
        Arc::clone(&thing),
        "noSuchMethod",
        WrapOptions::new(Mode::Live, dir.path(), ctx),
    )
    .err();
    assert_eq!(
        err,
        Some(FixtureError::MethodNotFound {
            method: "noSuchMethod".to_string()
        })
    );
}

#[test]
fn capture_without_any_test_identity_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().to_path_buf();
    // Unnamed threads carry no test identity.
    let outcome = std::thread::spawn(move || {
        let thing = ThingToTest::new();
        let ctx = TestContext::new();
        let stub = wrap_thing(&thing, Mode::Capture, &path, &ctx);
        let err = call(&*thing, METHOD_TO_FIX, vec![state_arg(0)]).err();
        (err, stub.faults(), thing.state())
    })
    .join()
    .expect("join");
    assert_eq!(outcome.0, Some(FixtureError::NoActiveTest));
    assert_eq!(outcome.1, vec![FixtureError::NoActiveTest]);
    assert_eq!(outcome.2, 0);
}
