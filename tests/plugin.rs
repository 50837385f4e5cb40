// Plugin sandbox tests. Plugins are written inline in WebAssembly text
// format; the entry point receives (frame_ptr, frame_len) and the call
// context sits just below frame_ptr.

use std::sync::Arc;

use zenith_core::Codec::{self, Column, DataType, Field, RecordBatch, Schema};
use zenith_core::Plugin::{
    run_chain, Action, CallContext, PluginHost, PluginId, SandboxConfig,
};
use zenith_core::Session::{Published, Session};
use zenith_core::{EngineError, SessionConfig};

const PASS: &str = r#"
(module
  (memory (export "memory") 1)
  (func (export "on_frame") (param i32 i32) (result i32)
    i32.const 0))
"#;

const DROP: &str = r#"
(module
  (memory (export "memory") 1)
  (func (export "on_frame") (param i32 i32) (result i32)
    i32.const 1))
"#;

/// Drops frames whose caller sequence number is odd.
const EVEN_ONLY: &str = r#"
(module
  (memory (export "memory") 1)
  (func (export "even_only") (param $ptr i32) (param $len i32) (result i32)
    (i32.wrap_i64
      (i64.and
        (i64.load (i32.sub (local.get $ptr) (i32.const 8)))
        (i64.const 1)))))
"#;

/// Drops frames from source 7.
const BLOCK_SOURCE_7: &str = r#"
(module
  (memory (export "memory") 1)
  (func (export "on_frame") (param $ptr i32) (param $len i32) (result i32)
    (i32.eq
      (i32.load (i32.sub (local.get $ptr) (i32.const 16)))
      (i32.const 7))))
"#;

/// Doubles the first value of a single non-null int64 column in place.
/// Value bytes start at 8 (fp) + 4 (count) + 1 (tag) + 4 (bitmap len) + 4 (value len).
const DOUBLE_FIRST: &str = r#"
(module
  (memory (export "memory") 1)
  (func (export "double_first") (param $ptr i32) (param $len i32) (result i32)
    (i64.store
      (i32.add (local.get $ptr) (i32.const 21))
      (i64.mul
        (i64.load (i32.add (local.get $ptr) (i32.const 21)))
        (i64.const 2)))
    (i32.store (i32.sub (local.get $ptr) (i32.const 24)) (local.get $ptr))
    (i32.store (i32.sub (local.get $ptr) (i32.const 20)) (local.get $len))
    (i32.const 2)))
"#;

const TRAP: &str = r#"
(module
  (memory (export "memory") 1)
  (func (export "on_frame") (param i32 i32) (result i32)
    unreachable))
"#;

const OUT_OF_BOUNDS: &str = r#"
(module
  (memory (export "memory") 1)
  (func (export "on_frame") (param i32 i32) (result i32)
    (i32.load (i32.const -4))))
"#;

const SPIN: &str = r#"
(module
  (memory (export "memory") 1)
  (func (export "on_frame") (param i32 i32) (result i32)
    (loop $forever (br $forever))
    i32.const 0))
"#;

const SPIN_AT_START: &str = r#"
(module
  (memory (export "memory") 1)
  (func $init (loop $forever (br $forever)))
  (start $init)
  (func (export "on_frame") (param i32 i32) (result i32)
    i32.const 0))
"#;

const GREEDY: &str = r#"
(module
  (memory (export "memory") 1)
  (func (export "on_frame") (param i32 i32) (result i32)
    (drop (memory.grow (i32.const 1000)))
    i32.const 0))
"#;

const BAD_CODE: &str = r#"
(module
  (memory (export "memory") 1)
  (func (export "on_frame") (param i32 i32) (result i32)
    i32.const 7))
"#;

/// Claims a replacement far outside linear memory.
const WILD_REPLACE: &str = r#"
(module
  (memory (export "memory") 1)
  (func (export "on_frame") (param $ptr i32) (param $len i32) (result i32)
    (i32.store (i32.sub (local.get $ptr) (i32.const 24)) (i32.const 0x7fff0000))
    (i32.store (i32.sub (local.get $ptr) (i32.const 20)) (local.get $len))
    (i32.const 2)))
"#;

/// Replaces the frame with three bytes of garbage.
const GARBAGE_REPLACE: &str = r#"
(module
  (memory (export "memory") 1)
  (data (i32.const 0) "\01\02\03")
  (func (export "on_frame") (param $ptr i32) (param $len i32) (result i32)
    (i32.store (i32.sub (local.get $ptr) (i32.const 24)) (i32.const 0))
    (i32.store (i32.sub (local.get $ptr) (i32.const 20)) (i32.const 3))
    (i32.const 2)))
"#;

fn px_schema() -> Arc<Schema> {
    Arc::new(Schema::new("Px", vec![Field::new("px", DataType::Int64, false)]))
}

fn px_batch(values: &[i64]) -> RecordBatch {
    RecordBatch::try_new(px_schema(), vec![Column::from_values(values)]).unwrap()
}

fn session() -> Session {
    Session::open_with(SessionConfig::new(64).with_slot_size(1024)).unwrap()
}

fn host() -> PluginHost {
    PluginHost::new(SandboxConfig::default()).unwrap()
}

#[test]
fn pass_plugin_forwards_frames() {
    let session = session();
    session.load_plugin(PASS.as_bytes()).unwrap();

    let batch = px_batch(&[1, 2, 3]);
    let published = session.publish(&batch, 1, 0).unwrap();
    assert_eq!(published, Published::Sequence(0));

    let delivery = session.poll().unwrap().unwrap();
    assert_eq!(delivery.frame, Codec::encode(&batch));
    let stats = session.get_stats().unwrap();
    assert_eq!(stats.plugin_count, 1);
    assert_eq!(stats.dropped_by_plugin, 0);
}

#[test]
fn drop_plugin_discards_everything() {
    const N: u64 = 25;
    let session = session();
    session.load_plugin(DROP.as_bytes()).unwrap();

    for i in 0..N {
        assert_eq!(session.publish(&px_batch(&[i as i64]), 1, i).unwrap(), Published::Dropped);
    }

    assert!(session.poll().unwrap().is_none());
    let stats = session.get_stats().unwrap();
    assert_eq!(stats.published, N);
    assert_eq!(stats.dropped_by_plugin, N);
    assert_eq!(stats.plugin_faults, 0);
    assert_eq!(stats.buffer_len, 0);

    let plugin = session.plugin_stats().unwrap()[0];
    assert_eq!(plugin.invocations, N);
    assert_eq!(plugin.dropped, N);
}

#[test]
fn filter_sees_caller_sequence_number() {
    let session = session();
    session.load_plugin(EVEN_ONLY.as_bytes()).unwrap();

    for seq_no in 0..10u64 {
        session.publish(&px_batch(&[seq_no as i64]), 1, seq_no).unwrap();
    }

    let delivered: Vec<u64> = std::iter::from_fn(|| session.poll().unwrap())
        .map(|d| d.caller_seq_no)
        .collect();
    assert_eq!(delivered, vec![0, 2, 4, 6, 8]);
    assert_eq!(session.get_stats().unwrap().dropped_by_plugin, 5);
}

#[test]
fn filter_sees_source_id() {
    let session = session();
    session.load_plugin(BLOCK_SOURCE_7.as_bytes()).unwrap();

    assert!(session.publish(&px_batch(&[1]), 7, 0).unwrap().is_dropped());
    assert_eq!(session.publish(&px_batch(&[1]), 8, 0).unwrap(), Published::Sequence(0));
}

#[test]
fn replace_rewrites_frame_and_chains() {
    let session = session();
    session.register_schema(1, (*px_schema()).clone()).unwrap();
    session.load_plugin(DOUBLE_FIRST.as_bytes()).unwrap();

    session.publish(&px_batch(&[21, 5]), 1, 0).unwrap();
    let first = session.decode(&session.poll().unwrap().unwrap()).unwrap();
    assert_eq!(first.column(0).unwrap().value::<i64>(0), Some(42));
    assert_eq!(first.column(0).unwrap().value::<i64>(1), Some(5));

    // the second plugin receives the first plugin's output
    session.load_plugin(DOUBLE_FIRST.as_bytes()).unwrap();
    session.publish(&px_batch(&[3]), 1, 1).unwrap();
    let second = session.decode(&session.poll().unwrap().unwrap()).unwrap();
    assert_eq!(second.column(0).unwrap().value::<i64>(0), Some(12));

    let replaced: Vec<u64> = session
        .plugin_stats()
        .unwrap()
        .iter()
        .map(|s| s.replaced)
        .collect();
    assert_eq!(replaced, vec![2, 1]);
}

#[test]
fn drop_short_circuits_the_chain() {
    let session = session();
    let dropper = session.load_plugin(DROP.as_bytes()).unwrap();
    let after = session.load_plugin(PASS.as_bytes()).unwrap();

    session.publish(&px_batch(&[1]), 1, 0).unwrap();
    let stats = session.plugin_stats().unwrap();
    assert_eq!(stats[0].id, dropper);
    assert_eq!(stats[0].invocations, 1);
    assert_eq!(stats[1].id, after);
    assert_eq!(stats[1].invocations, 0);
}

#[test]
fn faulting_plugins_never_stop_the_pipeline() {
    for (name, module) in [
        ("trap", TRAP),
        ("out of bounds", OUT_OF_BOUNDS),
        ("fuel", SPIN),
        ("memory ceiling", GREEDY),
        ("unknown action", BAD_CODE),
        ("wild replace", WILD_REPLACE),
        ("garbage replace", GARBAGE_REPLACE),
    ] {
        let session = Session::open_with(
            SessionConfig::new(64)
                .with_slot_size(1024)
                .with_sandbox(SandboxConfig {
                    call_fuel: 10_000,
                    memory_limit: 4 * 1024 * 1024,
                    ..SandboxConfig::default()
                }),
        )
        .unwrap();
        let id = session.load_plugin(module.as_bytes()).unwrap();

        for i in 0..5u64 {
            let published = session.publish(&px_batch(&[1]), 1, i).unwrap();
            assert!(published.is_dropped(), "{name}");
        }
        let stats = session.get_stats().unwrap();
        assert_eq!(stats.plugin_faults, 5, "{name}");
        assert_eq!(stats.dropped_by_plugin, 5, "{name}");
        assert_eq!(session.plugin_stats().unwrap()[0].faults, 5, "{name}");

        assert!(session.unload_plugin(id).unwrap());
        assert_eq!(
            session.publish(&px_batch(&[1]), 1, 5).unwrap(),
            Published::Sequence(0),
            "{name}"
        );
    }
}

#[test]
fn fuel_is_reset_for_every_call() {
    let session = Session::open_with(
        SessionConfig::new(1024).with_sandbox(SandboxConfig {
            call_fuel: 100,
            ..SandboxConfig::default()
        }),
    )
    .unwrap();
    session.load_plugin(PASS.as_bytes()).unwrap();

    for i in 0..500u64 {
        assert!(!session.publish(&px_batch(&[1]), 1, i).unwrap().is_dropped());
    }
    assert_eq!(session.get_stats().unwrap().plugin_faults, 0);
}

#[test]
fn unload_removes_plugin_from_future_publishes() {
    let session = session();
    let id = session.load_plugin(DROP.as_bytes()).unwrap();
    assert!(session.publish(&px_batch(&[1]), 1, 0).unwrap().is_dropped());

    assert!(session.unload_plugin(id).unwrap());
    assert!(!session.unload_plugin(id).unwrap());
    assert!(!session.unload_plugin(PluginId(999)).unwrap());
    assert_eq!(session.get_stats().unwrap().plugin_count, 0);
    assert_eq!(session.publish(&px_batch(&[1]), 1, 1).unwrap(), Published::Sequence(0));
}

#[test]
fn in_flight_snapshot_survives_unload() {
    let host = host();
    let plugin = Arc::new(host.load(PluginId(1), DROP.as_bytes(), 1024).unwrap());
    let chain = vec![Arc::clone(&plugin)];
    let frame = Codec::encode(&px_batch(&[1]));

    // the owner lets go; the snapshot still runs
    drop(plugin);
    let action = run_chain(&chain, &frame, CallContext::default()).unwrap();
    assert_eq!(action, Action::Drop);
}

#[test]
fn start_function_runs_under_init_fuel() {
    let err = host().load(PluginId(1), SPIN_AT_START.as_bytes(), 1024).unwrap_err();
    assert!(matches!(err, EngineError::PluginInitTimeout));

    let session = session();
    let err = session.load_plugin(SPIN_AT_START.as_bytes()).unwrap_err();
    assert!(matches!(err, EngineError::PluginInitTimeout));
    assert_eq!(session.get_stats().unwrap().plugin_count, 0);
}

#[test]
fn malformed_modules_are_invalid() {
    let cases: [(&str, &[u8]); 6] = [
        ("garbage", b"\0asm\x01\0\0\0\xff\xff"),
        (
            "imports",
            br#"(module
                  (import "env" "log" (func $log (param i32)))
                  (memory (export "memory") 1)
                  (func (export "f") (param i32 i32) (result i32) i32.const 0))"#,
        ),
        (
            "no memory",
            br#"(module (func (export "f") (param i32 i32) (result i32) i32.const 0))"#,
        ),
        (
            "no entry",
            br#"(module (memory (export "memory") 1))"#,
        ),
        (
            "wrong signature",
            br#"(module
                  (memory (export "memory") 1)
                  (func (export "f") (param i64 i32) (result i32) i32.const 0))"#,
        ),
        (
            "two entries",
            br#"(module
                  (memory (export "memory") 1)
                  (func (export "a") (param i32 i32) (result i32) i32.const 0)
                  (func (export "b") (param i32 i32) (result i32) i32.const 1))"#,
        ),
    ];

    let host = host();
    for (name, bytes) in cases {
        match host.load(PluginId(1), bytes, 1024) {
            Err(EngineError::InvalidPlugin(reason)) => println!("{name}: {reason}"),
            other => panic!("{name}: expected InvalidPlugin, got {other:?}"),
        }
    }
}

#[test]
fn io_window_must_fit_memory_limit() {
    let host = PluginHost::new(SandboxConfig {
        memory_limit: 64 * 1024,
        ..SandboxConfig::default()
    })
    .unwrap();
    let err = host.load(PluginId(1), PASS.as_bytes(), 1024).unwrap_err();
    assert!(matches!(err, EngineError::InvalidPlugin(_)));

    let bigger = PluginHost::new(SandboxConfig {
        memory_limit: 2 * 64 * 1024,
        ..SandboxConfig::default()
    })
    .unwrap();
    assert!(bigger.load(PluginId(1), PASS.as_bytes(), 1024).is_ok());
}
