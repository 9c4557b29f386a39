//! Heap validation, run after collections when `validate_heaps` is set.
//!
//! Checks the reference discipline between heaps:
//! - process heap objects may point into their own heap, their immutable
//!   part, the shared heap and the program heap
//! - shared heap objects may point into the shared heap and the program heap
//! - program heap objects may only point into the program heap

use parking_lot::MutexGuard;

use crate::error::RuntimeError;
use crate::object::Address;
use crate::process::Process;
use crate::program::Program;
use crate::space::Space;

/// Check that every reference in `space` resolves to an object in `space`
/// or in one of `allowed`.
pub fn validate_space(name: &str, space: &Space, allowed: &[&Space]) -> Result<(), RuntimeError> {
    let resolves = |address: Address| {
        space.object(address).is_some() || allowed.iter().any(|other| other.object(address).is_some())
    };
    for (address, object) in space.iter() {
        if object.forwarding_address().is_some() {
            return Err(RuntimeError::invariant(format!(
                "{}: object {} is still forwarded",
                name, address
            )));
        }
        let mut dangling = None;
        object.for_each_pointer(|target| {
            if dangling.is_none() && !resolves(target) {
                dangling = Some(target);
            }
        });
        if let Some(target) = dangling {
            return Err(RuntimeError::invariant(format!(
                "{}: object {} references {} outside its allowed heaps",
                name, address, target
            )));
        }
    }
    Ok(())
}

/// Validate the program heap, the shared heap and every process heap.
pub fn validate_program_heaps(program: &Program, processes: &mut [MutexGuard<'_, Process>]) -> Result<(), RuntimeError> {
    let program_heap = program.heap();
    let shared = program.shared_heap().lock();
    validate_space("program heap", program_heap.space(), &[])?;
    validate_space("shared heap", shared.space(), &[program_heap.space()])?;
    for process in processes.iter() {
        let name = format!("process {}", process.id());
        let mut allowed = vec![shared.space(), program_heap.space()];
        if let Some(part) = process.immutable_heap() {
            validate_space(&name, part.space(), &[shared.space(), program_heap.space()])?;
            allowed.push(part.space());
        }
        validate_space(&name, process.heap().space(), &allowed)?;
    }
    log::trace!("validated {} process heaps", processes.len());
    Ok(())
}
