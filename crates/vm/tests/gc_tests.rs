//! Process heap collection tests
//!
//! These go through the public `Process` API. Every collection scenario
//! runs once with the scavenger and once with the mark-sweep collector, so
//! both are covered whichever one the `mark-sweep` feature makes the default.

use std::collections::BTreeMap;
use std::sync::Arc;

use isle_vm::{Address, CollectorKind, Failure, Process, Program, ProgramBuilder, RuntimeConfig, Value};

const STATIC_SLOTS: usize = 4;

const COLLECTORS: [CollectorKind; 2] = [CollectorKind::Scavenge, CollectorKind::MarkSweep];

fn program_with(config: RuntimeConfig) -> (Arc<Program>, Address) {
    let mut builder = ProgramBuilder::new(config).unwrap();
    for _ in 0..STATIC_SLOTS {
        builder.add_static_field(Value::Smi(0));
    }
    let function = builder.define_function(2, vec![0; 32], vec![]).unwrap();
    builder.add_static_method(function);
    builder.set_entry(function, 0);
    (builder.build(), function)
}

fn program() -> (Arc<Program>, Address) {
    program_with(RuntimeConfig::default())
}

fn root(process: &mut Process, index: usize, address: Address) {
    process.set_static_field(index, Value::Ref(address)).unwrap();
}

fn rooted(process: &Process, index: usize) -> Address {
    process.static_field(index).and_then(Value::as_address).unwrap()
}

// ============================================================================
// Reachability
// ============================================================================

#[test]
fn test_object_reachable_twice_is_kept_once() {
    COLLECTORS.into_iter().for_each(object_reachable_twice_is_kept_once);
}

fn object_reachable_twice_is_kept_once(kind: CollectorKind) {
    let (program, _) = program();
    let process = program.spawn_process(None).unwrap();
    let mut process = process.lock();
    let shared = process.new_array_from(vec![Value::Smi(11)], false).unwrap();
    root(&mut process, 0, shared);
    root(&mut process, 1, shared);

    process.collect_mutable_garbage_with(kind).unwrap();
    assert_eq!(rooted(&process, 0), rooted(&process, 1));
    assert_eq!(process.field(rooted(&process, 0), 0), Some(Value::Smi(11)));
    assert_eq!(process.gc_count(), 1);
}

#[test]
fn test_cycles_survive_collection() {
    COLLECTORS.into_iter().for_each(cycles_survive_collection);
}

fn cycles_survive_collection(kind: CollectorKind) {
    let (program, _) = program();
    let process = program.spawn_process(None).unwrap();
    let mut process = process.lock();
    let a = process.new_array(1).unwrap();
    let b = process.new_array_from(vec![Value::Ref(a)], false).unwrap();
    process.store_field(a, 0, Value::Ref(b)).unwrap();
    root(&mut process, 0, a);

    process.collect_mutable_garbage_with(kind).unwrap();
    process.collect_mutable_garbage_with(kind).unwrap();
    let a = rooted(&process, 0);
    let b = process.field(a, 0).and_then(Value::as_address).unwrap();
    assert_eq!(process.field(b, 0), Some(Value::Ref(a)));
}

#[test]
fn test_unreachable_objects_are_reclaimed() {
    COLLECTORS.into_iter().for_each(unreachable_objects_are_reclaimed);
}

fn unreachable_objects_are_reclaimed(kind: CollectorKind) {
    let (program, _) = program();
    let process = program.spawn_process(None).unwrap();
    let mut process = process.lock();
    let kept = process.new_array_from(vec![Value::Smi(1); 8], false).unwrap();
    root(&mut process, 0, kept);
    process.collect_mutable_garbage_with(kind).unwrap();
    let baseline = process.heap().used();

    for _ in 0..100 {
        process.new_array(16).unwrap();
    }
    assert!(process.heap().used() > baseline);
    process.collect_mutable_garbage_with(kind).unwrap();
    assert!(process.heap().used() <= baseline);
}

/// Node ids and outgoing edges (by id) of everything reachable from the
/// statics.
fn reachable_graph(process: &Process) -> BTreeMap<i64, Vec<Option<i64>>> {
    let mut graph = BTreeMap::new();
    let mut pending: Vec<Address> = (0..STATIC_SLOTS)
        .filter_map(|i| process.static_field(i).and_then(Value::as_address))
        .collect();
    while let Some(node) = pending.pop() {
        let Some(Value::Smi(id)) = process.field(node, 0) else {
            panic!("node {} lost its id", node);
        };
        if graph.contains_key(&id) {
            continue;
        }
        let mut edges = Vec::new();
        for slot in 1..3 {
            match process.field(node, slot) {
                Some(Value::Ref(target)) => {
                    edges.push(process.field(target, 0).and_then(Value::as_smi));
                    pending.push(target);
                }
                _ => edges.push(None),
            }
        }
        graph.insert(id, edges);
    }
    graph
}

#[test]
fn test_random_graphs_keep_their_shape() {
    COLLECTORS.into_iter().for_each(random_graphs_keep_their_shape);
}

fn random_graphs_keep_their_shape(kind: CollectorKind) {
    let (program, _) = program();
    let process = program.spawn_process(None).unwrap();
    let mut process = process.lock();
    let mut rng = fastrand::Rng::with_seed(0x5eed);

    let nodes: Vec<Address> = (0..200)
        .map(|id| process.new_array_from(vec![Value::Smi(id), Value::Smi(0), Value::Smi(0)], false).unwrap())
        .collect();
    for &node in &nodes {
        for slot in 1..3 {
            if rng.bool() {
                let target = nodes[rng.usize(..nodes.len())];
                process.store_field(node, slot, Value::Ref(target)).unwrap();
            }
        }
    }
    for slot in 0..STATIC_SLOTS {
        root(&mut process, slot, nodes[rng.usize(..nodes.len())]);
    }
    let expected = reachable_graph(&process);

    for _ in 0..3 {
        for _ in 0..rng.usize(10..50) {
            process.new_array(rng.usize(1..8)).unwrap();
        }
        process.collect_mutable_garbage_with(kind).unwrap();
        assert_eq!(reachable_graph(&process), expected);
    }
    assert!(process.heap().space().object_count() <= expected.len() + 1);
}

#[test]
fn test_pointers_into_immutable_part_are_tracked() {
    COLLECTORS.into_iter().for_each(pointers_into_immutable_part_are_tracked);
}

fn pointers_into_immutable_part_are_tracked(kind: CollectorKind) {
    let (program, _) = program();
    let process = program.spawn_process(None).unwrap();
    let mut process = process.lock();
    let text = process.new_one_byte_string(b"kept".to_vec()).unwrap();
    let holder = process.new_array(1).unwrap();
    process.store_field(holder, 0, Value::Ref(text)).unwrap();
    assert!(process.store_buffer().contains(holder));
    root(&mut process, 0, holder);

    process.collect_mutable_garbage_with(kind).unwrap();
    let holder = rooted(&process, 0);
    assert!(process.store_buffer().contains(holder));
    assert_eq!(process.field(holder, 0), Some(Value::Ref(text)));

    // Dropping the only pointer out of the heap drops the entry on the
    // next collection.
    process.store_field(holder, 0, Value::Smi(0)).unwrap();
    process.collect_mutable_garbage_with(kind).unwrap();
    assert!(!process.store_buffer().contains(rooted(&process, 0)));
}

#[test]
fn test_allocation_failure_retries_after_collection() {
    let mut config = RuntimeConfig::default();
    config.gc.process_heap_initial_bytes = 1024;
    config.gc.process_heap_budget_bytes = 4096;
    let (program, _) = program_with(config);
    let process = program.spawn_process(None).unwrap();
    let mut process = process.lock();

    let mut failed = false;
    for _ in 0..10_000 {
        match process.new_array(8) {
            Ok(_) => {}
            Err(failure) => {
                assert_eq!(failure, Failure::RetryAfterGc);
                failed = true;
                break;
            }
        }
    }
    assert!(failed);
    let array = process.allocate_with_retry("array", |p| p.new_array(8)).unwrap();
    assert!(process.heap().includes(array));
    assert!(process.gc_count() >= 1);
}

// ============================================================================
// Stacks
// ============================================================================

#[test]
fn test_frames_survive_collection() {
    COLLECTORS.into_iter().for_each(frames_survive_collection);
}

fn frames_survive_collection(kind: CollectorKind) {
    let (program, function) = program();
    let process = program.spawn_process(None).unwrap();
    let mut process = process.lock();
    process.setup_entry(function, &[]).unwrap();
    for i in 0..5 {
        process.invoke(function, &[Value::Smi(i), Value::Smi(-i)]).unwrap();
    }
    let frames = process.frames();
    let locals = process.frame_locals(1);
    assert_eq!(locals, Some(vec![Value::Smi(-4), Value::Smi(4)]));

    process.collect_mutable_garbage_with(kind).unwrap();
    assert_eq!(process.frames(), frames);
    assert_eq!(process.frame_locals(1), locals);
    assert_eq!(process.frame_count(), 6);
}

#[test]
fn test_stack_growth_interleaved_with_collection() {
    COLLECTORS.into_iter().for_each(stack_growth_interleaved_with_collection);
}

fn stack_growth_interleaved_with_collection(kind: CollectorKind) {
    let (program, function) = program();
    let process = program.spawn_process(None).unwrap();
    let mut process = process.lock();
    process.setup_entry(function, &[]).unwrap();
    let initial = process.stack().unwrap().length();

    for i in 0..300 {
        process.invoke(function, &[Value::Smi(i), Value::Smi(i)]).unwrap();
        if i % 50 == 0 {
            process.collect_mutable_garbage_with(kind).unwrap();
        }
    }
    assert!(process.stack().unwrap().length() > initial);
    assert_eq!(process.frame_count(), 301);
    assert_eq!(process.frame_locals(1), Some(vec![Value::Smi(299), Value::Smi(299)]));

    for i in (0..300).rev() {
        assert!(process.return_from_frame(2, Value::Smi(i)).unwrap());
    }
    assert_eq!(process.frame_count(), 1);
}

#[test]
fn test_stack_chaining_counts_every_live_stack() {
    COLLECTORS.into_iter().for_each(stack_chaining_counts_every_live_stack);
}

fn stack_chaining_counts_every_live_stack(kind: CollectorKind) {
    let (program, function) = program();
    let process = program.spawn_process(None).unwrap();
    let mut process = process.lock();
    process.setup_entry(function, &[]).unwrap();
    assert_eq!(process.collect_garbage_and_chain_stacks_with(kind).unwrap(), 1);
    process.cook_stacks(1).unwrap();
    process.uncook_and_unchain_stacks().unwrap();

    let parked = process.new_stack(32).unwrap();
    root(&mut process, 0, parked);
    process.new_stack(32).unwrap();
    assert_eq!(process.collect_garbage_and_chain_stacks_with(kind).unwrap(), 2);
    process.cook_stacks(2).unwrap();
    process.uncook_and_unchain_stacks().unwrap();
}

fn cook_round_trip(kind: CollectorKind, frames: usize) {
    let (program, function) = program();
    let process = program.spawn_process(None).unwrap();
    let mut process = process.lock();
    process.setup_entry(function, &[]).unwrap();
    for i in 0..frames {
        process.invoke(function, &[Value::Smi(i as i64), Value::Smi(0)]).unwrap();
    }
    let frames_before = process.frames();

    let stacks = process.collect_garbage_and_chain_stacks_with(kind).unwrap();
    process.cook_stacks(stacks).unwrap();
    process.uncook_and_unchain_stacks().unwrap();
    assert_eq!(process.frames(), frames_before);
    assert_eq!(process.frame_count(), frames + 1);
}

#[test]
fn test_cook_uncook_frame_counts() {
    for kind in COLLECTORS {
        for frames in [0, 1, 2, 120] {
            cook_round_trip(kind, frames);
        }
    }
}

#[test]
fn test_cook_without_stacks_is_noop() {
    COLLECTORS.into_iter().for_each(cook_without_stacks_is_noop);
}

fn cook_without_stacks_is_noop(kind: CollectorKind) {
    let (program, _) = program();
    let process = program.spawn_process(None).unwrap();
    let mut process = process.lock();
    assert_eq!(process.collect_garbage_and_chain_stacks_with(kind).unwrap(), 0);
    process.cook_stacks(0).unwrap();
    process.uncook_and_unchain_stacks().unwrap();
}
