//! Messaging natives.
//!
//! These are the entry points the interpreter calls for port sends and
//! mailbox reads. They return [`Failure`] sentinels; the caller retries
//! allocation failures through [`Process::allocate_with_retry`].
//!
//! # Usage
//!
//! ```ignore
//! let value = process.allocate_with_retry("message", natives::process_queue_get_message)?;
//! ```

use std::sync::Arc;

use crate::error::Failure;
use crate::heap::{Finalizer, ForeignMemory};
use crate::mailbox::MessageKind;
use crate::object::{HeapObject, Value};
use crate::port::Port;
use crate::process::Process;
use crate::signal::{ProcessHandle, SignalKind};

/// Owned copy of the current message's payload.
enum Pending {
    Value(Value),
    LargeInteger(i64),
    Foreign {
        address: usize,
        length: usize,
        finalized: bool,
    },
    Exit(Value),
    Death(Arc<ProcessHandle>, SignalKind),
}

fn pending_of(kind: &MessageKind) -> Pending {
    match kind {
        MessageKind::Immediate(value) => Pending::Value(*value),
        MessageKind::ImmutableObject(address) => Pending::Value(Value::Ref(*address)),
        MessageKind::LargeInteger(value) => Pending::LargeInteger(*value),
        MessageKind::Foreign {
            address,
            length,
            finalized,
        } => Pending::Foreign {
            address: *address,
            length: *length,
            finalized: *finalized,
        },
        MessageKind::Exit { value, .. } => Pending::Exit(*value),
        MessageKind::ProcessDeathSignal(signal) => Pending::Death(signal.handle().clone(), signal.kind()),
    }
}

// ============================================================================
// Receiving
// ============================================================================

/// Materialize the current message as a value and advance past it. An
/// empty mailbox yields null. On failure the message stays current so the
/// call can be retried after a collection.
pub fn process_queue_get_message(process: &mut Process) -> Result<Value, Failure> {
    let Some(pending) = process
        .mailbox_mut()
        .current_message()
        .map(|message| pending_of(message.kind()))
    else {
        return Ok(process.program().roots().null());
    };

    let value = match pending {
        Pending::Value(value) => value,
        Pending::LargeInteger(value) => process.new_integer(value)?,
        Pending::Foreign {
            address,
            length,
            finalized,
        } => {
            let class = process.program().roots().foreign_memory_class;
            let fields = vec![Value::Smi(address as i64), Value::Smi(length as i64)];
            let instance = process.new_instance_from(class, fields, false)?;
            if finalized {
                process.register_finalizer(instance, Finalizer::ForeignMemory)?;
                process.heap_mut().allocated_foreign_memory(length);
                if let Some(message) = process.mailbox_mut().current_message_mut() {
                    message.take_foreign_ownership();
                }
            }
            Value::Ref(instance)
        }
        Pending::Exit(value) => {
            process.merge_current_child_heap();
            value
        }
        Pending::Death(handle, kind) => {
            let (process_class, death_class) = {
                let roots = process.program().roots();
                (roots.process_class, roots.process_death_class)
            };
            let id = handle.id();
            let dead = process.new_instance_from(process_class, vec![Value::Smi(id.0 as i64)], true)?;
            process.register_finalizer(dead, Finalizer::ProcessHandle(handle))?;
            let death = process.new_instance_from(
                death_class,
                vec![Value::Ref(dead), Value::Smi(kind.as_smi())],
                true,
            )?;
            Value::Ref(death)
        }
    };

    process.mailbox_mut().advance_current_message();
    Ok(value)
}

/// The channel of the current message, skipping messages whose channel has
/// been collected. The message itself stays current. Null when no message
/// with a live channel is queued.
pub fn process_queue_get_channel(process: &mut Process) -> Value {
    loop {
        let channel = match process.mailbox_mut().current_message() {
            None => return process.program().roots().null(),
            Some(message) => message.port().channel(),
        };
        match channel {
            Some(channel) => return Value::Ref(channel),
            None => {
                if let Some(dropped) = process.mailbox_mut().advance_current_message() {
                    log::trace!("dropped message for dead channel on {}", dropped.port().id());
                }
            }
        }
    }
}

// ============================================================================
// Sending
// ============================================================================

/// Classify `value` for sending. Mutable process objects cannot be sent.
fn message_kind_for(process: &Process, value: Value) -> Result<MessageKind, Failure> {
    let Value::Ref(address) = value else {
        return match value {
            Value::Smi(_) => Ok(MessageKind::Immediate(value)),
            _ => Err(Failure::WrongArgumentType),
        };
    };
    if process.heap().includes(address) {
        return Err(Failure::WrongArgumentType);
    }
    if process.program().heap().includes(address) {
        return Ok(MessageKind::Immediate(value));
    }
    let in_part = process.immutable_heap().and_then(|part| part.object(address).map(HeapObject::as_large_integer));
    let large_integer = match in_part {
        Some(large) => large,
        None => {
            let shared = process.program().shared_heap().lock();
            match shared.object(address) {
                Some(object) => object.as_large_integer(),
                None => return Err(Failure::WrongArgumentType),
            }
        }
    };
    Ok(match large_integer {
        Some(value) => MessageKind::LargeInteger(value),
        None => MessageKind::ImmutableObject(address),
    })
}

/// Send `value` to `port`. Returns the receiver's handle when the message
/// was queued, so the caller can wake it; `None` when the receiver is gone.
pub fn port_send(process: &Process, port: &Arc<Port>, value: Value) -> Result<Option<Arc<ProcessHandle>>, Failure> {
    let kind = message_kind_for(process, value)?;
    Ok(port.send(kind))
}

/// Send a native buffer of `length` bytes. With `finalized` the receiver
/// takes ownership and frees the buffer when its instance dies; a buffer
/// that is never received is freed with the message.
pub fn port_send_foreign(
    port: &Arc<Port>,
    address: usize,
    length: usize,
    finalized: bool,
) -> Option<Arc<ProcessHandle>> {
    let receiver = port.send(MessageKind::Foreign {
        address,
        length,
        finalized,
    });
    if receiver.is_none() && finalized {
        // SAFETY: the caller handed over ownership of the buffer and the
        // message that would have owned it was never created.
        unsafe { ForeignMemory::free(address, length) };
    }
    receiver
}

/// Send the final value of `process` to `port`, moving its heap along when
/// needed. The process must terminate afterwards.
pub fn port_send_exit(process: &mut Process, port: &Arc<Port>, value: Value) -> bool {
    process.send_exit(port, value)
}
