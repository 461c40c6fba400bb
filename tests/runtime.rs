//! End-to-end runtime scenarios: reference counting discipline, weak
//! reference auto-nil, try/catch/retry, tuple arguments, table ordering and
//! heap growth under deep recursion.
//!
//! Bytecode is assembled with `FunctionBuilder`, standing in for the
//! external compiler.

use eel_vm::value::WEAKREF_UNWIRED;
use eel_vm::{
    Arg, ClassId, Exception, FunctionBuilder, Metamethod, ObjId, Opcode, Operator, Value, Vm,
    VmConfig,
};

fn open() -> Box<Vm> {
    Vm::open(VmConfig::default()).expect("vm opens")
}

// ---------------------------------------------------------------------
// Scenario: refcount discipline and the string cache
// ---------------------------------------------------------------------

#[test]
fn string_refcount_and_cache_resurrection() {
    let mut vm = open();

    let s = vm.intern("hello").unwrap();
    assert_eq!(vm.object(s).refcount, 1);

    vm.own_object(s);
    vm.own_object(s);
    vm.disown_object(s);
    vm.disown_object(s);
    // Two owns and two disowns later the string is still alive.
    assert!(vm.is_live(s));
    assert_eq!(vm.object(s).refcount, 1);

    // The final disown does not free it: it becomes a cache resident.
    let cached_before = vm.string_cache_len();
    vm.disown_object(s);
    assert!(vm.is_live(s));
    assert_eq!(vm.object(s).refcount, 0);
    assert_eq!(vm.string_cache_len(), cached_before + 1);

    // Interning the same contents resurrects the cached instance.
    let s2 = vm.intern("hello").unwrap();
    assert_eq!(s2, s);
    assert_eq!(vm.object(s2).refcount, 1);
    assert_eq!(vm.string_cache_len(), cached_before);
    vm.disown_object(s2);
}

#[test]
fn string_cache_spills_oldest_beyond_bound() {
    let mut vm = Vm::open(VmConfig {
        string_cache_max: 4,
        ..VmConfig::default()
    })
    .unwrap();

    let mut ids = Vec::new();
    for i in 0..10 {
        let s = vm.intern(&format!("churn-{i}")).unwrap();
        ids.push(s);
    }
    for s in ids {
        vm.disown_object(s);
    }
    // The cache holds at most its bound; the oldest residents were freed.
    assert!(vm.string_cache_len() <= 4);
    assert!(vm.find_interned("churn-9").is_some());
    assert!(vm.find_interned("churn-0").is_none());
}

#[test]
fn copy_then_disown_preserves_refcount() {
    let mut vm = open();
    let s = vm.intern("balance").unwrap();
    let before = vm.object(s).refcount;

    let v = Value::ObjRef(s);
    let copied = vm.copy_value(v, eel_vm::CellAddr::Heap(usize::MAX));
    assert_eq!(vm.object(s).refcount, before + 1);
    vm.disown_value(copied);
    assert_eq!(vm.object(s).refcount, before);
    vm.disown_object(s);
}

// ---------------------------------------------------------------------
// Scenario: weak reference auto-nil
// ---------------------------------------------------------------------

#[test]
fn weakrefs_nil_out_when_target_dies() {
    let mut vm = open();

    let arr_v = vm.construct(ClassId::ARRAY, &[]).unwrap();
    let arr = arr_v.object().unwrap();
    let target_v = vm.construct(ClassId::TABLE, &[]).unwrap();
    let target = target_v.object().unwrap();

    // Four unwired weakrefs, attached as they land in the array.
    for i in 0..4 {
        let key = Value::Integer(i);
        let mut wr = Value::WeakRef {
            target,
            index: WEAKREF_UNWIRED,
        };
        vm.metamethod(arr, Metamethod::SetIndex, Some(&key), Some(&mut wr))
            .unwrap();
    }
    assert_eq!(vm.object(target).weakrefs.len(), 4);
    // Weak references do not pin: one strong reference only.
    assert_eq!(vm.object(target).refcount, 1);

    vm.disown_object(target);
    assert!(!vm.is_live(target));
    let values = vm.array(arr).unwrap();
    assert_eq!(values.len(), 4);
    assert!(values.iter().all(|v| *v == Value::Nil));

    vm.disown_object(arr);
}

#[test]
fn weakref_attach_detach_round_trip() {
    let mut vm = open();
    let arr_v = vm.construct(ClassId::ARRAY, &[]).unwrap();
    let arr = arr_v.object().unwrap();
    let target_v = vm.construct(ClassId::TABLE, &[]).unwrap();
    let target = target_v.object().unwrap();

    let before = vm.object(target).weakrefs.len();
    let key = Value::Integer(0);
    let mut wr = Value::WeakRef {
        target,
        index: WEAKREF_UNWIRED,
    };
    vm.metamethod(arr, Metamethod::SetIndex, Some(&key), Some(&mut wr))
        .unwrap();
    assert_eq!(vm.object(target).weakrefs.len(), before + 1);

    // Overwriting the cell detaches the weak reference again.
    let mut nil = Value::Nil;
    vm.metamethod(arr, Metamethod::SetIndex, Some(&key), Some(&mut nil))
        .unwrap();
    assert_eq!(vm.object(target).weakrefs.len(), before);

    vm.disown_object(target);
    vm.disown_object(arr);
}

#[test]
fn weakref_back_indices_survive_swap_remove() {
    let mut vm = open();
    let arr_v = vm.construct(ClassId::ARRAY, &[]).unwrap();
    let arr = arr_v.object().unwrap();
    let target_v = vm.construct(ClassId::TABLE, &[]).unwrap();
    let target = target_v.object().unwrap();

    for i in 0..3 {
        let key = Value::Integer(i);
        let mut wr = Value::WeakRef {
            target,
            index: WEAKREF_UNWIRED,
        };
        vm.metamethod(arr, Metamethod::SetIndex, Some(&key), Some(&mut wr))
            .unwrap();
    }
    // Detach the middle one; the moved entry's back-index must be fixed.
    let key = Value::Integer(1);
    let mut nil = Value::Nil;
    vm.metamethod(arr, Metamethod::SetIndex, Some(&key), Some(&mut nil))
        .unwrap();
    for (i, cell) in vm.array(arr).unwrap().clone().iter().enumerate() {
        if let Value::WeakRef { target: t, index } = cell {
            assert_eq!(*t, target);
            let recorded = vm.object(target).weakrefs[*index as usize];
            assert_eq!(
                recorded,
                eel_vm::CellAddr::ArrayItem { array: arr, index: i }
            );
        }
    }

    vm.disown_object(target);
    vm.disown_object(arr);
}

// ---------------------------------------------------------------------
// Scenario: try / catch / retry
// ---------------------------------------------------------------------

/// Builds `function main() { try { throw 42 } except { return-normal 99 } }`
/// and runs it, expecting 99.
#[test]
fn try_catch_delivers_catcher_result() {
    let mut vm = open();
    let module = vm.create_module("t").unwrap();

    let mut bb = FunctionBuilder::new("block").xblock();
    bb.emit(Opcode::LdI, &[0, 42]).unwrap();
    bb.emit(Opcode::Throw, &[0]).unwrap();
    let block = bb.framesize(1).finish(&mut vm, module).unwrap();

    // The catcher gets the exception value in R[0] and writes 99 to the
    // inherited result index.
    let mut cb = FunctionBuilder::new("catcher").xblock().results(1);
    cb.emit(Opcode::LdI, &[1, 99]).unwrap();
    cb.emit(Opcode::ReturnR, &[1]).unwrap();
    let catcher = cb.framesize(2).finish(&mut vm, module).unwrap();

    let mut mb = FunctionBuilder::new("main").results(1);
    let ci_catch = mb.constant(Value::ObjRef(catcher));
    let ci_block = mb.constant(Value::ObjRef(block));
    mb.emit(Opcode::Try, &[ci_catch as i32, ci_block as i32])
        .unwrap();
    mb.emit(Opcode::Return, &[]).unwrap();
    let main = mb.finish(&mut vm, module).unwrap();

    let r = vm.call_args(main, &[], true).unwrap();
    assert_eq!(r, Some(Value::Integer(99)));
}

/// The catcher sees the thrown value in R[0].
#[test]
fn catcher_receives_thrown_value() {
    let mut vm = open();
    let module = vm.create_module("t").unwrap();

    let mut bb = FunctionBuilder::new("block").xblock();
    bb.emit(Opcode::LdI, &[0, 1234]).unwrap();
    bb.emit(Opcode::Throw, &[0]).unwrap();
    let block = bb.framesize(1).finish(&mut vm, module).unwrap();

    // Return the exception value itself.
    let mut cb = FunctionBuilder::new("catcher").xblock().results(1);
    cb.emit(Opcode::ReturnR, &[0]).unwrap();
    let catcher = cb.framesize(1).finish(&mut vm, module).unwrap();

    let mut mb = FunctionBuilder::new("main").results(1);
    let ci_catch = mb.constant(Value::ObjRef(catcher));
    let ci_block = mb.constant(Value::ObjRef(block));
    mb.emit(Opcode::Try, &[ci_catch as i32, ci_block as i32])
        .unwrap();
    mb.emit(Opcode::Return, &[]).unwrap();
    let main = mb.finish(&mut vm, module).unwrap();

    let r = vm.call_args(main, &[], true).unwrap();
    assert_eq!(r, Some(Value::Integer(1234)));
}

/// An uncaught throw surfaces as the mapped exception kind.
#[test]
fn uncaught_throw_aborts_the_call() {
    let mut vm = open();
    let module = vm.create_module("t").unwrap();

    let mut mb = FunctionBuilder::new("main");
    mb.emit(Opcode::LdI, &[0, Exception::DivByZero.code() as i32])
        .unwrap();
    mb.emit(Opcode::Throw, &[0]).unwrap();
    let main = mb.framesize(1).finish(&mut vm, module).unwrap();

    let r = vm.call_args(main, &[], false);
    assert_eq!(r, Err(Exception::DivByZero));
}

/// RETRY re-enters the protected block; a static variable flipped by the
/// catcher makes the second attempt succeed.
#[test]
fn retry_reruns_the_try_block() {
    let mut vm = open();
    let module = vm.create_module("t").unwrap();
    let flag_slot = vm.module_add_static(module, Value::Integer(0)).unwrap() as i32;

    // block: if sv[0] is set, finish quietly; otherwise throw.
    let mut bb = FunctionBuilder::new("block").xblock();
    bb.emit(Opcode::GetVar, &[0, flag_slot]).unwrap();
    let j = bb.emit(Opcode::JumpNZ, &[0, 0]).unwrap();
    bb.emit(Opcode::LdI, &[0, 5]).unwrap();
    bb.emit(Opcode::Throw, &[0]).unwrap();
    let after = bb.here();
    bb.patch_s16(j, 2, (after - (j + Opcode::JumpNZ.size())) as i32)
        .unwrap();
    bb.emit(Opcode::Return, &[]).unwrap();
    let block = bb.framesize(1).finish(&mut vm, module).unwrap();

    // catcher: sv[0] = 1; retry.
    let mut cb = FunctionBuilder::new("catcher").xblock();
    cb.emit(Opcode::LdI, &[1, 1]).unwrap();
    cb.emit(Opcode::SetVar, &[1, flag_slot]).unwrap();
    cb.emit(Opcode::Retry, &[]).unwrap();
    let catcher = cb.framesize(2).finish(&mut vm, module).unwrap();

    let mut mb = FunctionBuilder::new("main").results(1);
    let ci_catch = mb.constant(Value::ObjRef(catcher));
    let ci_block = mb.constant(Value::ObjRef(block));
    mb.emit(Opcode::Try, &[ci_catch as i32, ci_block as i32])
        .unwrap();
    mb.emit(Opcode::GetVar, &[0, flag_slot]).unwrap();
    mb.emit(Opcode::ReturnR, &[0]).unwrap();
    let main = mb.framesize(1).finish(&mut vm, module).unwrap();

    let r = vm.call_args(main, &[], true).unwrap();
    assert_eq!(r, Some(Value::Integer(1)));
}

/// RETX from inside a try block forces the containing function to return.
#[test]
fn retxr_returns_from_within_try() {
    let mut vm = open();
    let module = vm.create_module("t").unwrap();

    let mut bb = FunctionBuilder::new("block").xblock().results(1);
    bb.emit(Opcode::LdI, &[0, 7]).unwrap();
    bb.emit(Opcode::RetXR, &[0]).unwrap();
    let block = bb.framesize(1).finish(&mut vm, module).unwrap();

    let mut cb = FunctionBuilder::new("catcher").xblock();
    cb.emit(Opcode::Return, &[]).unwrap();
    let catcher = cb.framesize(1).finish(&mut vm, module).unwrap();

    let mut mb = FunctionBuilder::new("main").results(1);
    let ci_catch = mb.constant(Value::ObjRef(catcher));
    let ci_block = mb.constant(Value::ObjRef(block));
    mb.emit(Opcode::Try, &[ci_catch as i32, ci_block as i32])
        .unwrap();
    // Never reached: the forced return bypasses the rest of main.
    mb.emit(Opcode::LdI, &[0, 1]).unwrap();
    mb.emit(Opcode::ReturnR, &[0]).unwrap();
    let main = mb.framesize(1).finish(&mut vm, module).unwrap();

    let r = vm.call_args(main, &[], true).unwrap();
    assert_eq!(r, Some(Value::Integer(7)));
}

// ---------------------------------------------------------------------
// Scenario: tuple arguments
// ---------------------------------------------------------------------

fn tuple_probe(vm: &mut Vm, module: ObjId) -> ObjId {
    // f(required=1, tuple=2) { return tuples-count }
    let mut fb = FunctionBuilder::new("probe").results(1).args(1, 0, 2);
    fb.emit(Opcode::TupC, &[0]).unwrap();
    fb.emit(Opcode::ReturnR, &[0]).unwrap();
    fb.framesize(1).finish(vm, module).unwrap()
}

#[test]
fn tuple_argument_counting() {
    let mut vm = open();
    let module = vm.create_module("t").unwrap();
    let f = tuple_probe(&mut vm, module);

    // 1 required + two whole tuples.
    let r = vm
        .call_args(
            f,
            &[
                Arg::Int(1),
                Arg::Int(2),
                Arg::Int(3),
                Arg::Int(4),
                Arg::Int(5),
            ],
            true,
        )
        .unwrap();
    assert_eq!(r, Some(Value::Integer(2)));

    // Just the required argument: zero tuples.
    let r = vm.call_args(f, &[Arg::Int(1)], true).unwrap();
    assert_eq!(r, Some(Value::Integer(0)));
}

#[test]
fn incomplete_tuples_are_rejected() {
    let mut vm = open();
    let module = vm.create_module("t").unwrap();
    let f = tuple_probe(&mut vm, module);

    // One stray argument beyond the required one: half a tuple.
    let r = vm.call_args(f, &[Arg::Int(1), Arg::Int(2)], true);
    assert_eq!(r, Err(Exception::TupleArgs));
}

#[test]
fn argc_reports_supplied_arguments() {
    let mut vm = open();
    let module = vm.create_module("t").unwrap();

    let mut fb = FunctionBuilder::new("argc").results(1).args(1, 0, 2);
    fb.emit(Opcode::ArgC, &[0]).unwrap();
    fb.emit(Opcode::ReturnR, &[0]).unwrap();
    let f = fb.framesize(1).finish(&mut vm, module).unwrap();

    let r = vm
        .call_args(
            f,
            &[
                Arg::Int(1),
                Arg::Int(2),
                Arg::Int(3),
                Arg::Int(4),
                Arg::Int(5),
            ],
            true,
        )
        .unwrap();
    assert_eq!(r, Some(Value::Integer(5)));
}

#[test]
fn missing_required_arguments_are_rejected() {
    let mut vm = open();
    let module = vm.create_module("t").unwrap();
    let f = tuple_probe(&mut vm, module);
    assert_eq!(vm.call_args(f, &[], true), Err(Exception::FewArgs));
}

// ---------------------------------------------------------------------
// Scenario: table ordering
// ---------------------------------------------------------------------

#[test]
fn table_keeps_hash_order_across_delete() {
    let mut vm = open();
    let tv = vm.construct(ClassId::TABLE, &[]).unwrap();
    let t = tv.object().unwrap();

    for key in ["a", "b", "c"] {
        vm.table_set_str(t, key, Value::Integer(key.as_bytes()[0] as i32))
            .unwrap();
    }
    let b = vm.intern("b").unwrap();
    vm.table_delete(t, &Value::ObjRef(b)).unwrap();
    vm.disown_object(b);

    let items = vm.table(t).unwrap().clone();
    assert_eq!(items.len(), 2);
    // Hash order is non-decreasing across the index order.
    assert!(items.windows(2).all(|w| w[0].hash <= w[1].hash));
    let mut keys: Vec<String> = items
        .iter()
        .map(|it| {
            let o = it.key.object().unwrap();
            String::from_utf8_lossy(vm.string_bytes(o)).into_owned()
        })
        .collect();
    keys.sort();
    assert_eq!(keys, ["a", "c"]);

    vm.disown_object(t);
}

#[test]
fn table_lookup_by_string_identity_and_value() {
    let mut vm = open();
    let tv = vm.construct(ClassId::TABLE, &[]).unwrap();
    let t = tv.object().unwrap();

    vm.table_set_str(t, "answer", Value::Integer(42)).unwrap();
    vm.table_set(t, Value::Integer(5), Value::Integer(55))
        .unwrap();
    vm.table_set(t, Value::Nil, Value::Integer(0)).unwrap();

    assert_eq!(vm.table_get_str(t, "answer"), Ok(Value::Integer(42)));
    assert_eq!(vm.table_get(t, &Value::Integer(5)), Ok(Value::Integer(55)));
    assert_eq!(vm.table_get(t, &Value::Nil), Ok(Value::Integer(0)));
    assert_eq!(
        vm.table_get(t, &Value::Integer(6)),
        Err(Exception::WrongIndex)
    );

    // Overwrite does not duplicate.
    vm.table_set_str(t, "answer", Value::Integer(43)).unwrap();
    assert_eq!(vm.table(t).unwrap().len(), 3);
    assert_eq!(vm.table_get_str(t, "answer"), Ok(Value::Integer(43)));

    vm.disown_object(t);
}

#[test]
fn table_scales_past_the_binary_search_threshold() {
    let mut vm = open();
    let tv = vm.construct(ClassId::TABLE, &[]).unwrap();
    let t = tv.object().unwrap();

    for i in 0..64 {
        vm.table_set_str(t, &format!("key-{i}"), Value::Integer(i))
            .unwrap();
    }
    let items = vm.table(t).unwrap();
    assert_eq!(items.len(), 64);
    assert!(items.windows(2).all(|w| w[0].hash <= w[1].hash));
    drop(items);
    for i in 0..64 {
        assert_eq!(
            vm.table_get_str(t, &format!("key-{i}")),
            Ok(Value::Integer(i))
        );
    }
    vm.disown_object(t);
}

// ---------------------------------------------------------------------
// Scenario: heap growth under deep recursion
// ---------------------------------------------------------------------

#[test]
fn deep_call_chain_grows_heap_and_keeps_limbo_sound() {
    let mut vm = Vm::open(VmConfig {
        heap_initial: 64,
        ..VmConfig::default()
    })
    .unwrap();
    let module = vm.create_module("deep").unwrap();
    let live_before = vm.live_objects();
    let heap_before = vm.heap_size();

    // Leaf returns 0; every other level allocates an intermediate table
    // (parked in limbo), calls down and adds one.
    let mut leaf = FunctionBuilder::new("leaf-100").results(1);
    leaf.emit(Opcode::LdI, &[0, 0]).unwrap();
    leaf.emit(Opcode::ReturnR, &[0]).unwrap();
    let mut next = leaf.framesize(1).finish(&mut vm, module).unwrap();

    for depth in (0..100).rev() {
        let mut fb = FunctionBuilder::new(&format!("level-{depth}")).results(1);
        let callee = fb.constant(Value::ObjRef(next));
        // An intermediate container that stays in limbo across the call.
        fb.emit(Opcode::New, &[1, ClassId::TABLE.raw() as i32])
            .unwrap();
        fb.emit(Opcode::CCallR, &[0, 0, callee as i32]).unwrap();
        fb.emit(Opcode::BopI, &[0, 0, Operator::Add as i32, 1])
            .unwrap();
        fb.emit(Opcode::ReturnR, &[0]).unwrap();
        next = fb.framesize(8).finish(&mut vm, module).unwrap();
    }

    let live_mid = vm.live_objects();
    let r = vm.call_args(next, &[], true).unwrap();
    assert_eq!(r, Some(Value::Integer(100)));

    // The combined frames forced the heap to double at least once, and
    // every limbo-parked intermediate was released on frame exit.
    assert!(vm.heap_size() > heap_before);
    assert_eq!(vm.live_objects(), live_mid);
    assert!(vm.live_objects() >= live_before);
    assert_eq!(vm.sp, vm.sbase);
}

// ---------------------------------------------------------------------
// Loops, indexing, operators
// ---------------------------------------------------------------------

/// sum = 0; for i = 1..10 step 1 { sum += i }; return sum
#[test]
fn counted_loop_sums() {
    let mut vm = open();
    let module = vm.create_module("t").unwrap();

    let mut fb = FunctionBuilder::new("sum").results(1);
    fb.emit(Opcode::InitI, &[0, 1]).unwrap(); // i
    fb.emit(Opcode::InitI, &[1, 1]).unwrap(); // step
    fb.emit(Opcode::InitI, &[2, 10]).unwrap(); // limit
    fb.emit(Opcode::InitI, &[3, 0]).unwrap(); // sum
    let preloop = fb.emit(Opcode::PreLoop, &[0, 1, 2, 0]).unwrap();
    let body = fb.here();
    fb.emit(Opcode::Bop, &[3, 3, Operator::Add as i32, 0])
        .unwrap();
    let loop_at = fb
        .emit(Opcode::Loop, &[0, 1, 2, 0])
        .unwrap();
    let exit = fb.here();
    fb.patch_s16(
        preloop,
        4,
        (exit - (preloop + Opcode::PreLoop.size())) as i32,
    )
    .unwrap();
    fb.patch_s16(loop_at, 4, body as i32 - (loop_at + Opcode::Loop.size()) as i32)
        .unwrap();
    fb.emit(Opcode::ReturnR, &[3]).unwrap();
    let f = fb.framesize(4).cleansize(4).finish(&mut vm, module).unwrap();

    let r = vm.call_args(f, &[], true).unwrap();
    // The loop machinery runs on reals.
    assert_eq!(r, Some(Value::Real(55.0)));
}

#[test]
fn array_indexing_through_the_vm() {
    let mut vm = open();
    let module = vm.create_module("t").unwrap();

    let mut fb = FunctionBuilder::new("index").results(1);
    fb.emit(Opcode::New, &[0, ClassId::ARRAY.raw() as i32])
        .unwrap();
    fb.emit(Opcode::LdI, &[1, 7]).unwrap();
    fb.emit(Opcode::IndSetI, &[1, 0, 0]).unwrap(); // a[0] = R1
    fb.emit(Opcode::IndGetI, &[2, 0, 0]).unwrap(); // R2 = a[0]
    fb.emit(Opcode::ReturnR, &[2]).unwrap();
    let f = fb.framesize(3).finish(&mut vm, module).unwrap();

    let r = vm.call_args(f, &[], true).unwrap();
    assert_eq!(r, Some(Value::Integer(7)));
}

#[test]
fn string_concatenation_via_bop() {
    let mut vm = open();
    let module = vm.create_module("t").unwrap();

    let hello = vm.intern("hello ").unwrap();
    let world = vm.intern("world").unwrap();
    let mut fb = FunctionBuilder::new("concat").results(1);
    let c1 = fb.constant(Value::ObjRef(hello));
    let c2 = fb.constant(Value::ObjRef(world));
    fb.emit(Opcode::LdC, &[0, c1 as i32]).unwrap();
    fb.emit(Opcode::LdC, &[1, c2 as i32]).unwrap();
    fb.emit(Opcode::Add, &[2, 0, 1]).unwrap();
    fb.emit(Opcode::ReturnR, &[2]).unwrap();
    let f = fb.framesize(3).finish(&mut vm, module).unwrap();
    vm.disown_object(hello);
    vm.disown_object(world);

    let r = vm.call_args(f, &[], true).unwrap().unwrap();
    let o = r.object().expect("string result");
    assert_eq!(vm.string_bytes(o), b"hello world");
    vm.disown_value(r);
}

#[test]
fn division_always_yields_real() {
    let mut vm = open();
    let module = vm.create_module("t").unwrap();

    let mut fb = FunctionBuilder::new("div").results(1).args(2, 0, 0);
    fb.emit(Opcode::GetArgI, &[0, 0]).unwrap();
    fb.emit(Opcode::GetArgI, &[1, 1]).unwrap();
    fb.emit(Opcode::Div, &[2, 0, 1]).unwrap();
    fb.emit(Opcode::ReturnR, &[2]).unwrap();
    let f = fb.framesize(3).finish(&mut vm, module).unwrap();

    let r = vm
        .call_args(f, &[Arg::Int(7), Arg::Int(2)], true)
        .unwrap();
    assert_eq!(r, Some(Value::Real(3.5)));

    let r = vm.call_args(f, &[Arg::Int(1), Arg::Int(0)], true);
    assert_eq!(r, Err(Exception::DivByZero));
}

#[test]
fn switch_dispatches_through_constant_table() {
    let mut vm = open();
    let module = vm.create_module("t").unwrap();

    // The jump table maps case values to absolute code offsets. Build the
    // code first with a placeholder table, then fill the table in.
    let arr_v = vm.construct(ClassId::ARRAY, &[]).unwrap();
    let arr = arr_v.object().unwrap();

    let mut fb = FunctionBuilder::new("switch").results(1).args(1, 0, 0);
    let ci_tab = fb.constant(Value::ObjRef(arr));
    fb.emit(Opcode::GetArgI, &[0, 0]).unwrap();
    let sw = fb.emit(Opcode::Switch, &[0, ci_tab as i32, 0]).unwrap();
    let case0 = fb.here();
    fb.emit(Opcode::LdI, &[1, 100]).unwrap();
    fb.emit(Opcode::ReturnR, &[1]).unwrap();
    let case1 = fb.here();
    fb.emit(Opcode::LdI, &[1, 200]).unwrap();
    fb.emit(Opcode::ReturnR, &[1]).unwrap();
    let default = fb.here();
    fb.emit(Opcode::LdI, &[1, -1]).unwrap();
    fb.emit(Opcode::ReturnR, &[1]).unwrap();
    fb.patch_s16(sw, 4, (default - (sw + Opcode::Switch.size())) as i32)
        .unwrap();
    let f = fb.framesize(2).finish(&mut vm, module).unwrap();

    vm.array_set(arr, 0, Value::Integer(case0 as i32)).unwrap();
    vm.array_set(arr, 1, Value::Integer(case1 as i32)).unwrap();

    assert_eq!(
        vm.call_args(f, &[Arg::Int(0)], true).unwrap(),
        Some(Value::Integer(100))
    );
    assert_eq!(
        vm.call_args(f, &[Arg::Int(1)], true).unwrap(),
        Some(Value::Integer(200))
    );
    assert_eq!(
        vm.call_args(f, &[Arg::Int(9)], true).unwrap(),
        Some(Value::Integer(-1))
    );
    vm.disown_object(arr);
}

// ---------------------------------------------------------------------
// Upvalues
// ---------------------------------------------------------------------

/// A nested function reads a variable of its enclosing function through
/// the static-scope upvalue chain.
#[test]
fn nested_function_reads_upvalue() {
    let mut vm = open();
    let module = vm.create_module("t").unwrap();

    // inner() { return R[0] one level up }
    let mut ib = FunctionBuilder::new("inner").results(1).upvalues();
    ib.emit(Opcode::GetUVal, &[0, 0, 1]).unwrap();
    ib.emit(Opcode::ReturnR, &[0]).unwrap();
    let inner = ib.framesize(1).finish(&mut vm, module).unwrap();

    // outer() { local v = 77; return inner() }
    let mut ob = FunctionBuilder::new("outer").results(1);
    let ci = ob.constant(Value::ObjRef(inner));
    ob.emit(Opcode::InitI, &[0, 77]).unwrap();
    ob.emit(Opcode::CCallR, &[0, 1, ci as i32]).unwrap();
    ob.emit(Opcode::ReturnR, &[1]).unwrap();
    let outer = ob
        .framesize(2)
        .cleansize(1)
        .finish(&mut vm, module)
        .unwrap();

    let r = vm.call_args(outer, &[], true).unwrap();
    assert_eq!(r, Some(Value::Integer(77)));
}

#[test]
fn upvalue_writes_reach_the_outer_frame() {
    let mut vm = open();
    let module = vm.create_module("t").unwrap();

    // inner() { R[0] one level up = 5 }
    let mut ib = FunctionBuilder::new("inner").upvalues();
    ib.emit(Opcode::LdI, &[0, 5]).unwrap();
    ib.emit(Opcode::SetUVal, &[0, 0, 1]).unwrap();
    ib.emit(Opcode::Return, &[]).unwrap();
    let inner = ib.framesize(1).finish(&mut vm, module).unwrap();

    let mut ob = FunctionBuilder::new("outer").results(1);
    let ci = ob.constant(Value::ObjRef(inner));
    ob.emit(Opcode::InitI, &[0, 0]).unwrap();
    ob.emit(Opcode::CCall, &[0, ci as i32]).unwrap();
    ob.emit(Opcode::ReturnR, &[0]).unwrap();
    let outer = ob
        .framesize(1)
        .cleansize(1)
        .finish(&mut vm, module)
        .unwrap();

    let r = vm.call_args(outer, &[], true).unwrap();
    assert_eq!(r, Some(Value::Integer(5)));
}

// ---------------------------------------------------------------------
// Native functions and marshalling
// ---------------------------------------------------------------------

fn native_sum(vm: &mut Vm) -> eel_vm::VmResult<()> {
    let mut sum = 0i32;
    for i in 0..vm.argc {
        sum += vm.arg(i)?.as_int().ok_or(Exception::WrongType)?;
    }
    vm.set_result(Value::Integer(sum));
    Ok(())
}

#[test]
fn native_function_roundtrip() {
    let mut vm = open();
    let module = vm.create_module("host").unwrap();
    vm.export_cfunction(module, 1, "sum", 0, -1, 0, native_sum)
        .unwrap();

    let r = vm
        .call_named(
            module,
            "sum",
            &[Arg::Int(1), Arg::Int(2), Arg::Int(3)],
            true,
        )
        .unwrap();
    assert_eq!(r, Some(Value::Integer(6)));
}

#[test]
fn bytecode_calls_native_and_back() {
    let mut vm = open();
    let module = vm.create_module("host").unwrap();
    let sum = vm
        .export_cfunction(module, 1, "sum", 0, -1, 0, native_sum)
        .unwrap();

    let mut fb = FunctionBuilder::new("caller").results(1);
    let ci = fb.constant(Value::ObjRef(sum));
    fb.emit(Opcode::PushI, &[10]).unwrap();
    fb.emit(Opcode::PushI, &[20]).unwrap();
    fb.emit(Opcode::CCallR, &[0, 0, ci as i32]).unwrap();
    fb.emit(Opcode::ReturnR, &[0]).unwrap();
    let f = fb.framesize(1).finish(&mut vm, module).unwrap();

    let r = vm.call_args(f, &[], true).unwrap();
    assert_eq!(r, Some(Value::Integer(30)));
    // The argument region was fully cleared by the return.
    assert_eq!(vm.sp, vm.sbase);
}

#[test]
fn module_exports_are_read_only_from_scripts() {
    let mut vm = open();
    let module = vm.create_module("ro").unwrap();
    let key = Value::Integer(1);
    let mut val = Value::Integer(2);
    let r = vm.metamethod(module, Metamethod::SetIndex, Some(&key), Some(&mut val));
    assert_eq!(r, Err(Exception::CantWrite));
}

// ---------------------------------------------------------------------
// Casts and cloning
// ---------------------------------------------------------------------

#[test]
fn casts_between_primitives_and_strings() {
    let mut vm = open();

    let v = vm.cast_value(&Value::Integer(42), ClassId::STRING).unwrap();
    let o = v.object().unwrap();
    assert_eq!(vm.string_bytes(o), b"42");
    vm.disown_value(v);

    let s = vm.intern("3.5").unwrap();
    let r = vm
        .cast_value(&Value::ObjRef(s), ClassId::REAL)
        .unwrap();
    assert_eq!(r, Value::Real(3.5));
    vm.disown_object(s);

    // Cast to the same primitive class is the identity.
    assert_eq!(
        vm.cast_value(&Value::Integer(5), ClassId::INTEGER).unwrap(),
        Value::Integer(5)
    );
}

#[test]
fn container_clone_is_deep_for_the_spine() {
    let mut vm = open();
    let av = vm
        .construct(
            ClassId::ARRAY,
            &[Value::Integer(1), Value::Integer(2), Value::Integer(3)],
        )
        .unwrap();
    let a = av.object().unwrap();

    let cv = vm.cast_value(&av, ClassId::ARRAY).unwrap();
    let c = cv.object().unwrap();
    assert_ne!(a, c);
    assert_eq!(vm.array(c).unwrap(), vm.array(a).unwrap());

    // Mutating the clone leaves the original alone.
    vm.array_set(c, 0, Value::Integer(9)).unwrap();
    assert_eq!(vm.array(a).unwrap()[0], Value::Integer(1));

    vm.disown_object(a);
    vm.disown_object(c);
}

#[test]
fn insert_delete_round_trip_restores_array() {
    let mut vm = open();
    let av = vm
        .construct(
            ClassId::ARRAY,
            &[Value::Integer(1), Value::Integer(2), Value::Integer(3)],
        )
        .unwrap();
    let a = av.object().unwrap();

    let key = Value::Integer(1);
    let mut v = Value::Integer(99);
    vm.metamethod(a, Metamethod::Insert, Some(&key), Some(&mut v))
        .unwrap();
    assert_eq!(
        vm.array(a).unwrap(),
        &vec![
            Value::Integer(1),
            Value::Integer(99),
            Value::Integer(2),
            Value::Integer(3)
        ]
    );
    vm.metamethod(a, Metamethod::Delete, Some(&key), None)
        .unwrap();
    assert_eq!(
        vm.array(a).unwrap(),
        &vec![Value::Integer(1), Value::Integer(2), Value::Integer(3)]
    );
    vm.disown_object(a);
}

// ---------------------------------------------------------------------
// Typed vectors
// ---------------------------------------------------------------------

#[test]
fn vector_base_class_constructs_the_default_subclass() {
    let mut vm = open();
    let v = vm
        .construct(
            ClassId::VECTOR,
            &[Value::Real(1.5), Value::Integer(2), Value::Nil],
        )
        .unwrap();
    let o = v.object().unwrap();
    assert_eq!(vm.object(o).classid, ClassId::VECTOR_D);
    let data = vm.vector(o).unwrap();
    assert_eq!(data.get_real(0), 1.5);
    assert_eq!(data.get_real(1), 2.0);
    assert_eq!(data.get_real(2), 0.0);
    vm.disown_object(o);
}

#[test]
fn vector_arithmetic_broadcasts_and_pairs() {
    let mut vm = open();
    let v = vm
        .construct(
            ClassId::VECTOR_S32,
            &[Value::Integer(10), Value::Integer(20)],
        )
        .unwrap();
    let o = v.object().unwrap();

    // Scalar broadcast through the element-wise add metamethod.
    let out = vm
        .metamethod_value(o, Metamethod::VAdd, Some(&Value::Integer(5)))
        .unwrap();
    let oo = out.object().unwrap();
    assert_eq!(vm.vector(oo).unwrap().get_int(0), 15);
    assert_eq!(vm.vector(oo).unwrap().get_int(1), 25);
    vm.disown_value(out);

    // Truncating write path.
    let wv = vm
        .construct(ClassId::VECTOR_U8, &[Value::Real(300.9)])
        .unwrap();
    let wo = wv.object().unwrap();
    assert_eq!(vm.vector(wo).unwrap().get_int(0), 44);
    vm.disown_object(wo);

    vm.disown_object(o);
}

// ---------------------------------------------------------------------
// Modules and the refsum idiom
// ---------------------------------------------------------------------

#[test]
fn sealed_module_unloads_despite_internal_cycles() {
    let mut vm = open();
    let live_before = vm.live_objects();

    let module = vm.create_module("cyclic").unwrap();
    // A function whose constant pool references a sibling in the same
    // module: the classic module<->function cycle.
    let mut fa = FunctionBuilder::new("a").results(1);
    fa.emit(Opcode::LdI, &[0, 1]).unwrap();
    fa.emit(Opcode::ReturnR, &[0]).unwrap();
    let a = fa.framesize(1).finish(&mut vm, module).unwrap();

    let mut fbld = FunctionBuilder::new("b").results(1);
    let ci = fbld.constant(Value::ObjRef(a));
    fbld.emit(Opcode::CCallR, &[0, 0, ci as i32]).unwrap();
    fbld.emit(Opcode::ReturnR, &[0]).unwrap();
    let b = fbld.framesize(1).finish(&mut vm, module).unwrap();

    vm.export_constant(module, "b", Value::ObjRef(b)).unwrap();
    vm.module_seal(module).unwrap();

    let r = vm.call_args(b, &[], true).unwrap();
    assert_eq!(r, Some(Value::Integer(1)));

    // Dropping the host reference lets the module GC reclaim everything,
    // cycles and all, because the live refsum matches the snapshot. The
    // only survivors are refcount-zero strings parked in the cache.
    vm.disown_object(module);
    assert!(vm.get_module("cyclic").is_none());
    assert!(vm.live_objects() <= live_before + vm.string_cache_len());
}

#[test]
fn disassembly_lists_every_instruction() {
    let mut vm = open();
    let module = vm.create_module("t").unwrap();
    let mut fb = FunctionBuilder::new("listing").results(1);
    fb.emit(Opcode::LdI, &[0, 41]).unwrap();
    fb.emit(Opcode::BopI, &[0, 0, Operator::Add as i32, 1])
        .unwrap();
    fb.emit(Opcode::ReturnR, &[0]).unwrap();
    let f = fb.framesize(1).finish(&mut vm, module).unwrap();

    let text = vm.disassemble(f).unwrap();
    assert!(text.contains("LdI"));
    assert!(text.contains("BopI"));
    assert!(text.contains("ReturnR"));

    let r = vm.call_args(f, &[], true).unwrap();
    assert_eq!(r, Some(Value::Integer(42)));
}
