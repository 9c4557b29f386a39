//! Process mailboxes.
//!
//! # Design
//!
//! Senders on any thread push onto the receiver's [`Inbox`], a lock-free
//! queue owned by the receiver's handle. Only the receiving process drains
//! it, into the local FIFO of its [`Mailbox`]. The front of that FIFO is
//! the current message; [`Mailbox::advance_current_message`] is the only
//! way to move past it.
//!
//! An `Exit` message may carry the whole heap of the process that sent it.
//! That heap is not copied: the receiver merges it into its own heap the
//! next time it collects garbage or reads the message, whichever is first.

use std::collections::VecDeque;
use std::sync::Arc;

use crossbeam::queue::SegQueue;

use crate::collector::PointerVisitor;
use crate::heap::{ForeignMemory, Heap};
use crate::object::{Address, Value};
use crate::port::Port;
use crate::signal::Signal;
use crate::store_buffer::StoreBuffer;

/// The heap and store buffer of a terminated process, in transit.
#[derive(Debug)]
pub struct ChildHeap {
    pub heap: Heap,
    pub store_buffer: StoreBuffer,
}

#[derive(Debug)]
pub enum MessageKind {
    /// A small integer or a reference to a program heap object.
    Immediate(Value),
    /// A reference into the shared heap.
    ImmutableObject(Address),
    /// A native buffer. When `finalized` the message owns the buffer until
    /// it is received.
    Foreign {
        address: usize,
        length: usize,
        finalized: bool,
    },
    LargeInteger(i64),
    /// Final value of a terminated process, with its heap if the value
    /// points into it.
    Exit {
        heap: Option<ChildHeap>,
        value: Value,
    },
    ProcessDeathSignal(Arc<Signal>),
}

#[derive(Debug)]
pub struct Message {
    port: Arc<Port>,
    kind: MessageKind,
}

impl Message {
    pub fn new(port: Arc<Port>, kind: MessageKind) -> Self {
        Self { port, kind }
    }

    pub fn port(&self) -> &Arc<Port> {
        &self.port
    }

    pub fn kind(&self) -> &MessageKind {
        &self.kind
    }

    pub fn kind_mut(&mut self) -> &mut MessageKind {
        &mut self.kind
    }

    /// The value an `Exit` message reports.
    pub fn exit_reference(&self) -> Option<Value> {
        match self.kind {
            MessageKind::Exit { value, .. } => Some(value),
            _ => None,
        }
    }

    /// Take ownership of a finalized foreign buffer. Afterwards dropping
    /// the message leaves the buffer alone.
    pub fn take_foreign_ownership(&mut self) {
        if let MessageKind::Foreign { finalized, .. } = &mut self.kind {
            *finalized = false;
        }
    }

    fn take_child_heap(&mut self) -> Option<ChildHeap> {
        match &mut self.kind {
            MessageKind::Exit { heap, .. } => heap.take(),
            _ => None,
        }
    }
}

impl Drop for Message {
    fn drop(&mut self) {
        if let MessageKind::Foreign {
            address,
            length,
            finalized: true,
        } = self.kind
        {
            // SAFETY: a finalized foreign message is the sole owner of a
            // buffer from ForeignMemory::allocate until it is received.
            unsafe { ForeignMemory::free(address, length) };
        }
    }
}

// ============================================================================
// Inbox
// ============================================================================

/// Multi-producer queue of incoming messages.
#[derive(Debug, Default)]
pub struct Inbox {
    queue: SegQueue<Message>,
}

impl Inbox {
    pub fn enqueue(&self, message: Message) {
        self.queue.push(message);
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }
}

// ============================================================================
// Mailbox
// ============================================================================

/// Receiving side of a process's message queue.
#[derive(Debug)]
pub struct Mailbox {
    inbox: Arc<Inbox>,
    messages: VecDeque<Message>,
}

impl Mailbox {
    pub fn new(inbox: Arc<Inbox>) -> Self {
        Self {
            inbox,
            messages: VecDeque::new(),
        }
    }

    /// Move everything that arrived since the last drain into the local
    /// queue, preserving arrival order.
    fn drain(&mut self) {
        while let Some(message) = self.inbox.queue.pop() {
            self.messages.push_back(message);
        }
    }

    pub fn current_message(&mut self) -> Option<&Message> {
        self.drain();
        self.messages.front()
    }

    pub fn current_message_mut(&mut self) -> Option<&mut Message> {
        self.drain();
        self.messages.front_mut()
    }

    /// Retire the current message and hand it back to the caller.
    pub fn advance_current_message(&mut self) -> Option<Message> {
        self.drain();
        let message = self.messages.pop_front();
        if let Some(message) = &message {
            log::trace!("advanced past message on {}", message.port().id());
        }
        message
    }

    pub fn len(&mut self) -> usize {
        self.drain();
        self.messages.len()
    }

    pub fn is_empty(&mut self) -> bool {
        self.len() == 0
    }

    /// Merge the heaps of every queued `Exit` message into `heap`. Must run
    /// before a collection scans the mailbox.
    pub fn merge_all_child_heaps(&mut self, heap: &mut Heap, store_buffer: &mut StoreBuffer) -> usize {
        self.drain();
        let mut merged = 0;
        for message in &mut self.messages {
            if let Some(child) = message.take_child_heap() {
                heap.merge(child.heap);
                store_buffer.merge(child.store_buffer);
                merged += 1;
            }
        }
        merged
    }

    /// Merge the heap carried by the current message, if any.
    pub fn merge_current_child_heap(&mut self, heap: &mut Heap, store_buffer: &mut StoreBuffer) -> bool {
        let Some(child) = self.current_message_mut().and_then(Message::take_child_heap) else {
            return false;
        };
        heap.merge(child.heap);
        store_buffer.merge(child.store_buffer);
        true
    }

    /// Visit every heap reference held by queued messages.
    pub fn visit_pointers(&mut self, visitor: &mut dyn PointerVisitor) {
        self.drain();
        for message in &mut self.messages {
            match &mut message.kind {
                MessageKind::Immediate(value) => visitor.visit(value),
                MessageKind::ImmutableObject(address) => visitor.visit_address(address),
                MessageKind::Exit { value, .. } => visitor.visit(value),
                MessageKind::Foreign { .. }
                | MessageKind::LargeInteger(_)
                | MessageKind::ProcessDeathSignal(_) => {}
            }
        }
    }
}
