//! Ports.
//!
//! A port is the sending end of a channel. The channel itself is an
//! instance in the owning process's heap; the port only holds its address
//! weakly and follows it across collections. Once the channel dies the
//! receiver drops anything still addressed to the port.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::mailbox::{Message, MessageKind};
use crate::object::Address;
use crate::signal::ProcessHandle;
use crate::space::Space;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortId(pub u64);

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "port#{}", self.0)
    }
}

static NEXT_PORT_ID: AtomicU64 = AtomicU64::new(1);

pub struct Port {
    id: PortId,
    owner: Mutex<Option<Arc<ProcessHandle>>>,
    channel: Mutex<Option<Address>>,
}

impl Port {
    pub fn new(owner: Arc<ProcessHandle>, channel: Address) -> Arc<Port> {
        Arc::new(Port {
            id: PortId(NEXT_PORT_ID.fetch_add(1, Ordering::Relaxed)),
            owner: Mutex::new(Some(owner)),
            channel: Mutex::new(Some(channel)),
        })
    }

    pub fn id(&self) -> PortId {
        self.id
    }

    /// The channel instance, or `None` once it has been collected.
    pub fn channel(&self) -> Option<Address> {
        *self.channel.lock()
    }

    pub fn owner(&self) -> Option<Arc<ProcessHandle>> {
        self.owner.lock().clone()
    }

    /// Queue a message for the owner. Returns the owner's handle when the
    /// message was queued; `None` means the owner is gone and the message
    /// was dropped.
    pub fn send(self: &Arc<Self>, kind: MessageKind) -> Option<Arc<ProcessHandle>> {
        let owner = self.owner.lock().clone()?;
        if !owner.is_alive() {
            return None;
        }
        owner.inbox().enqueue(Message::new(self.clone(), kind));
        Some(owner)
    }

    pub fn owner_process_terminating(&self) {
        *self.owner.lock() = None;
    }

    /// Follow the channel across a collection of `space`. The channel
    /// survives if it was copied (forwarding address) or marked. Returns
    /// whether the channel is still alive.
    pub fn update_channel_after_gc(&self, space: &Space) -> bool {
        let mut channel = self.channel.lock();
        if let Some(address) = *channel {
            if let Some(object) = space.object(address) {
                *channel = match object.forwarding_address() {
                    Some(to) => Some(to),
                    None if object.is_marked() => Some(address),
                    None => None,
                };
            } else if space.includes(address) {
                *channel = None;
            }
        }
        channel.is_some()
    }
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Port")
            .field("id", &self.id)
            .field("channel", &self.channel())
            .finish()
    }
}

/// Update every port after a collection of `space`, and forget ports that
/// lost their channel and that nobody else references.
pub fn cleanup_ports(ports: &mut Vec<Arc<Port>>, space: &Space) {
    ports.retain(|port| {
        let alive = port.update_channel_after_gc(space);
        alive || Arc::strong_count(port) > 1
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{HeapObject, ObjectBody, Value};
    use crate::program::ProcessId;

    fn channel(space: &mut Space) -> Address {
        space
            .allocate(HeapObject::new(Address(0x8), ObjectBody::Instance(vec![Value::Smi(0)])))
            .unwrap()
    }

    #[test]
    fn test_send_to_live_owner() {
        let owner = ProcessHandle::new(ProcessId(1), None);
        let port = Port::new(owner.clone(), Address(0x10));
        assert!(port.send(MessageKind::Immediate(Value::Smi(5))).is_some());
        assert!(!owner.inbox().is_empty());
    }

    #[test]
    fn test_send_after_owner_terminated_is_dropped() {
        let owner = ProcessHandle::new(ProcessId(1), None);
        let port = Port::new(owner.clone(), Address(0x10));
        port.owner_process_terminating();
        assert!(port.send(MessageKind::Immediate(Value::Smi(5))).is_none());
        assert!(owner.inbox().is_empty());
    }

    #[test]
    fn test_channel_follows_forwarding_and_dies() {
        let mut space = Space::new(4096);
        let live = channel(&mut space);
        let dead = channel(&mut space);
        let owner = ProcessHandle::new(ProcessId(1), None);
        let live_port = Port::new(owner.clone(), live);
        let dead_port = Port::new(owner, dead);

        space.object_mut(live).unwrap().set_forwarding_address(Address(0x9999_0000));
        let mut ports = vec![live_port.clone(), dead_port.clone()];
        drop(dead_port);
        cleanup_ports(&mut ports, &space);

        assert_eq!(ports.len(), 1);
        assert_eq!(live_port.channel(), Some(Address(0x9999_0000)));
    }

    #[test]
    fn test_referenced_port_kept_without_channel() {
        let mut space = Space::new(4096);
        let dead = channel(&mut space);
        let port = Port::new(ProcessHandle::new(ProcessId(1), None), dead);
        let mut ports = vec![port.clone()];
        cleanup_ports(&mut ports, &space);
        assert_eq!(ports.len(), 1);
        assert_eq!(port.channel(), None);
    }

    #[test]
    fn test_channel_outside_space_untouched() {
        let space = Space::new(4096);
        let port = Port::new(ProcessHandle::new(ProcessId(1), None), Address(0x10));
        assert!(port.update_channel_after_gc(&space));
        assert_eq!(port.channel(), Some(Address(0x10)));
    }
}
