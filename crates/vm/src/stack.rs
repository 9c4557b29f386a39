//! Stack frames.
//!
//! Stacks grow downward. While a process is suspended the two slots at the
//! top of its stack hold the interpreter registers:
//!
//! ```text
//!   slots[top]     Frame(fp)     link of the innermost frame
//!   slots[top + 1] Code(bcp)     where the innermost frame resumes
//! ```
//!
//! A call stores the caller's registers the same way, so every frame is
//! described by a link pair `(slots[link], slots[link + 1])`: the first
//! slot points at the next link down the stack, the second is the frame's
//! bytecode pointer. The bottom of the stack is a sentinel pair of empty
//! slots. A frame's locals and operands sit between its link pair and the
//! next link.
//!
//! Frame pointers are slot indices, so moving the live region to a longer
//! stack requires relinking them. Bytecode pointers are raw program heap
//! addresses; before the program heap moves they are "cooked" into a
//! function reference plus a recorded delta and "uncooked" afterwards.

use crate::error::RuntimeError;
use crate::object::{Address, FunctionObject, StackObject, Value};

/// Slots between the real stack limit and the start of the stack, so any
/// frame that passed the stack check can finish its prologue.
pub const GUARANTEED_FRAME_SIZE: usize = 32;

/// Slots in a link pair.
pub const FRAME_HEADER_SLOTS: usize = 2;

/// Smallest amount a stack grows by.
pub const MIN_STACK_GROWTH: usize = 256;

/// Length of a freshly created stack.
pub const INITIAL_STACK_SIZE: usize = 256;

/// Walks frames from the innermost outward.
pub struct Frame<'a> {
    stack: &'a StackObject,
    link: Option<usize>,
}

impl<'a> Frame<'a> {
    pub fn new(stack: &'a StackObject) -> Self {
        Self { stack, link: None }
    }

    /// Step to the next outer frame. Returns false past the bottom frame.
    pub fn move_previous(&mut self) -> bool {
        let next = match self.link {
            None if self.stack.top + FRAME_HEADER_SLOTS <= self.stack.length() => {
                Some(self.stack.top)
            }
            None => None,
            Some(link) => self.stack.get(link).as_frame(),
        };
        match next {
            Some(link) if !self.stack.get(link + 1).is_empty() => {
                self.link = Some(link);
                true
            }
            _ => false,
        }
    }

    /// Slot index of this frame's link pair.
    pub fn link(&self) -> usize {
        self.link.unwrap_or(self.stack.top)
    }

    /// Slot index of this frame's bytecode pointer.
    pub fn bytecode_pointer_slot(&self) -> usize {
        self.link() + 1
    }

    pub fn bytecode_pointer(&self) -> Value {
        self.stack.get(self.bytecode_pointer_slot())
    }

    /// Link of the next outer frame, which is also this frame's frame
    /// pointer.
    pub fn frame_pointer(&self) -> Option<usize> {
        self.stack.get(self.link()).as_frame()
    }

    /// Locals and operands of this frame, innermost first.
    pub fn locals(&self) -> &'a [Value] {
        let start = self.link() + FRAME_HEADER_SLOTS;
        let end = self.frame_pointer().unwrap_or(start).max(start);
        &self.stack.slots[start..end]
    }
}

/// Slot indices of every frame's bytecode pointer, innermost first.
pub fn frame_bytecode_slots(stack: &StackObject) -> Vec<usize> {
    let mut frame = Frame::new(stack);
    let mut slots = Vec::new();
    while frame.move_previous() {
        slots.push(frame.bytecode_pointer_slot());
    }
    slots
}

pub fn frame_count(stack: &StackObject) -> usize {
    frame_bytecode_slots(stack).len()
}

// ============================================================================
// Register save and restore
// ============================================================================

/// Build the bottom of a fresh stack for an entry function taking `arity`
/// arguments and suspend it at `entry`.
pub fn setup_entry_frame(stack: &mut StackObject, arity: usize, entry: Address) {
    stack.push(Value::Smi(arity as i64));
    stack.push(Value::Empty);
    stack.push(Value::Empty);
    let bottom = stack.top;
    suspend(stack, bottom, entry);
}

/// Save interpreter registers on top of the stack.
pub fn suspend(stack: &mut StackObject, frame_pointer: usize, bcp: Address) {
    stack.push(Value::Code(bcp));
    stack.push(Value::Frame(frame_pointer));
}

/// Pop the registers saved by [`suspend`].
pub fn resume(stack: &mut StackObject) -> Option<(usize, Address)> {
    let frame_pointer = stack.get(stack.top).as_frame()?;
    let bcp = stack.get(stack.top + 1).as_code()?;
    stack.pop();
    stack.pop();
    Some((frame_pointer, bcp))
}

/// Perform a call on a suspended stack: the current frame pushes
/// `arguments`, then control enters a callee that is suspended at `bcp`.
/// Returns the callee's frame pointer.
pub fn push_frame(stack: &mut StackObject, bcp: Address, arguments: &[Value]) -> Option<usize> {
    if stack.top < arguments.len() + 2 * FRAME_HEADER_SLOTS {
        return None;
    }
    let (frame_pointer, return_bcp) = resume(stack)?;
    for &argument in arguments {
        stack.push(argument);
    }
    stack.push(Value::Code(return_bcp));
    stack.push(Value::Frame(frame_pointer));
    let callee = stack.top;
    suspend(stack, callee, bcp);
    Some(callee)
}

// ============================================================================
// Growth
// ============================================================================

/// New length for a stack of `length` slots that needs `extra` more.
pub fn grown_length(length: usize, extra: usize) -> usize {
    length + MIN_STACK_GROWTH.max(extra.next_power_of_two())
}

/// Copy the live region of `old` into the tail of `new` and relink the
/// frame pointer chain. `new` must be at least as long as `old`.
pub fn copy_live_region(old: &StackObject, new: &mut StackObject) {
    debug_assert!(new.length() >= old.length());
    let delta = new.length() - old.length();
    new.top = old.top + delta;
    new.slots[new.top..].copy_from_slice(old.live());
    update_frame_pointers(new, delta);
}

/// Shift every frame pointer on the link chain by `delta` slots.
fn update_frame_pointers(stack: &mut StackObject, delta: usize) {
    if stack.top + FRAME_HEADER_SLOTS > stack.length() {
        return;
    }
    let mut link = stack.top;
    while let Value::Frame(pointer) = stack.get(link) {
        let moved = pointer + delta;
        stack.set(link, Value::Frame(moved));
        if moved <= link || moved + 1 >= stack.length() {
            break;
        }
        link = moved;
    }
}

// ============================================================================
// Cooking
// ============================================================================

/// Replace every frame's raw bytecode pointer with a reference to its
/// function and return the offsets, innermost frame first. `function_of`
/// maps a bytecode pointer to the function containing it.
pub fn cook_stack(
    stack: &mut StackObject,
    function_of: impl Fn(Address) -> Option<Address>,
) -> Result<Vec<usize>, RuntimeError> {
    let slots = frame_bytecode_slots(stack);
    let mut deltas = Vec::with_capacity(slots.len());
    for slot in slots {
        let bcp = stack
            .get(slot)
            .as_code()
            .ok_or_else(|| RuntimeError::invariant(format!("frame slot {} is not a bytecode pointer", slot)))?;
        let function = function_of(bcp)
            .ok_or_else(|| RuntimeError::invariant(format!("no function contains bytecode {}", bcp)))?;
        deltas.push(FunctionObject::bytecode_index_of(function, bcp));
        stack.set(slot, Value::Ref(function));
    }
    Ok(deltas)
}

/// Inverse of [`cook_stack`]: rebuild raw bytecode pointers from the
/// (possibly moved) function references and the recorded offsets.
pub fn uncook_stack(stack: &mut StackObject, deltas: &[usize]) -> Result<(), RuntimeError> {
    let slots = frame_bytecode_slots(stack);
    if slots.len() != deltas.len() {
        return Err(RuntimeError::invariant(format!(
            "cooked {} frames but found {}",
            deltas.len(),
            slots.len()
        )));
    }
    for (slot, &delta) in slots.into_iter().zip(deltas) {
        let function = stack
            .get(slot)
            .as_address()
            .ok_or_else(|| RuntimeError::invariant(format!("frame slot {} is not cooked", slot)))?;
        stack.set(slot, Value::Code(FunctionObject::bytecode_address_for(function, delta)));
    }
    Ok(())
}
