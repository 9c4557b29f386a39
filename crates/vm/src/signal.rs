//! Process handles, death signals, and links.
//!
//! A [`ProcessHandle`] is the part of a process other threads may touch:
//! its stack limit word (for interrupts), its signal slot, its inbox, and
//! its links. It is reference counted and outlives the [`Process`] it
//! describes, so linked and monitoring processes can still be told about a
//! death after the process itself is gone.
//!
//! [`Process`]: crate::process::Process

use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::mailbox::{Inbox, MessageKind};
use crate::port::{Port, PortId};
use crate::process::ProcessState;
use crate::program::ProcessId;
use crate::stack_limit::{InterruptFlags, StackLimit};

/// Why a process died.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SignalKind {
    /// Normal termination.
    Terminated = 0,
    CompileTimeError = 1,
    UncaughtException = 2,
    /// Killed by a signal from a linked process.
    UnhandledSignal = 3,
    Killed = 4,
}

impl SignalKind {
    pub fn as_smi(self) -> i64 {
        self as u8 as i64
    }

    pub fn is_normal(self) -> bool {
        self == SignalKind::Terminated
    }
}

/// A death notification.
#[derive(Debug)]
pub struct Signal {
    handle: Arc<ProcessHandle>,
    kind: SignalKind,
}

impl Signal {
    pub fn new(handle: Arc<ProcessHandle>, kind: SignalKind) -> Arc<Signal> {
        Arc::new(Signal { handle, kind })
    }

    /// Handle of the process that died.
    pub fn handle(&self) -> &Arc<ProcessHandle> {
        &self.handle
    }

    pub fn kind(&self) -> SignalKind {
        self.kind
    }
}

// ============================================================================
// Signal slot
// ============================================================================

/// A single slot filled by compare-and-swap. The first signal wins; later
/// ones are handed back to the caller and released.
pub struct SignalSlot {
    signal: AtomicPtr<Signal>,
}

impl Default for SignalSlot {
    fn default() -> Self {
        Self {
            signal: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

impl SignalSlot {
    pub fn install(&self, signal: Arc<Signal>) -> Result<(), Arc<Signal>> {
        let raw = Arc::into_raw(signal) as *mut Signal;
        match self
            .signal
            .compare_exchange(ptr::null_mut(), raw, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(()),
            // SAFETY: `raw` came from Arc::into_raw above and was not stored.
            Err(_) => Err(unsafe { Arc::from_raw(raw) }),
        }
    }

    pub fn take(&self) -> Option<Arc<Signal>> {
        let raw = self.signal.swap(ptr::null_mut(), Ordering::AcqRel);
        if raw.is_null() {
            None
        } else {
            // SAFETY: every non-null value in the slot came from
            // Arc::into_raw in `install`, and the swap gives us sole
            // ownership of it.
            Some(unsafe { Arc::from_raw(raw) })
        }
    }

    pub fn is_set(&self) -> bool {
        !self.signal.load(Ordering::Acquire).is_null()
    }
}

impl Drop for SignalSlot {
    fn drop(&mut self) {
        drop(self.take());
    }
}

impl fmt::Debug for SignalSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalSlot").field("set", &self.is_set()).finish()
    }
}

// ============================================================================
// Links
// ============================================================================

/// Processes to signal and ports to notify when a process dies.
#[derive(Debug, Default)]
pub struct Links {
    linked: Vec<Arc<ProcessHandle>>,
    monitors: Vec<Arc<Port>>,
}

impl Links {
    pub fn linked_count(&self) -> usize {
        self.linked.len()
    }

    pub fn monitor_count(&self) -> usize {
        self.monitors.len()
    }
}

// ============================================================================
// Process handle
// ============================================================================

/// Shared, reference-counted part of a process.
pub struct ProcessHandle {
    id: ProcessId,
    parent: Option<Arc<ProcessHandle>>,
    stack_limit: StackLimit,
    signal: SignalSlot,
    inbox: Arc<Inbox>,
    state: AtomicU8,
    alive: AtomicBool,
    /// This process plus its live descendants.
    triangle_count: AtomicUsize,
    links: Mutex<Links>,
    profile_ticks: AtomicUsize,
}

impl ProcessHandle {
    pub fn new(id: ProcessId, parent: Option<Arc<ProcessHandle>>) -> Arc<Self> {
        Arc::new(Self {
            id,
            parent,
            stack_limit: StackLimit::new(),
            signal: SignalSlot::default(),
            inbox: Arc::new(Inbox::default()),
            state: AtomicU8::new(ProcessState::Sleeping as u8),
            alive: AtomicBool::new(true),
            triangle_count: AtomicUsize::new(1),
            links: Mutex::new(Links::default()),
            profile_ticks: AtomicUsize::new(0),
        })
    }

    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn parent(&self) -> Option<&Arc<ProcessHandle>> {
        self.parent.as_ref()
    }

    pub fn stack_limit(&self) -> &StackLimit {
        &self.stack_limit
    }

    pub fn inbox(&self) -> &Arc<Inbox> {
        &self.inbox
    }

    // ------------------------------------------------------------------
    // Interrupts, callable from any thread
    // ------------------------------------------------------------------

    pub fn preempt(&self) {
        self.stack_limit.set_interrupt(InterruptFlags::PREEMPT);
    }

    pub fn debug_interrupt(&self) {
        self.stack_limit.set_interrupt(InterruptFlags::DEBUG_INTERRUPT);
    }

    pub fn profile(&self) {
        self.stack_limit.set_interrupt(InterruptFlags::PROFILE);
    }

    pub(crate) fn record_profile_tick(&self) {
        self.profile_ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn profile_ticks(&self) -> usize {
        self.profile_ticks.load(Ordering::Relaxed)
    }

    // ------------------------------------------------------------------
    // Signals
    // ------------------------------------------------------------------

    /// Deliver a death signal. Only one signal is kept; if one is already
    /// pending the new one is released and `false` returned. The process
    /// notices the signal at its next stack check.
    pub fn send_signal(&self, signal: Arc<Signal>) -> bool {
        match self.signal.install(signal) {
            Ok(()) => {
                self.preempt();
                true
            }
            Err(dropped) => {
                log::warn!(
                    "process {} already has a pending signal, dropping {:?} from process {}",
                    self.id,
                    dropped.kind(),
                    dropped.handle().id()
                );
                false
            }
        }
    }

    pub fn take_signal(&self) -> Option<Arc<Signal>> {
        self.signal.take()
    }

    pub fn has_signal(&self) -> bool {
        self.signal.is_set()
    }

    // ------------------------------------------------------------------
    // State
    // ------------------------------------------------------------------

    pub fn state(&self) -> ProcessState {
        ProcessState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: ProcessState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Atomically move from `from` to `to`. Returns whether it happened.
    pub fn change_state(&self, from: ProcessState, to: ProcessState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Called while the process is being cleaned up. Sends to its ports
    /// are dropped from now on.
    pub fn owner_process_terminating(&self) {
        self.alive.store(false, Ordering::Release);
    }

    pub fn triangle_count(&self) -> usize {
        self.triangle_count.load(Ordering::Acquire)
    }

    pub(crate) fn increment_triangle_count(&self) {
        self.triangle_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns the count after decrementing.
    pub(crate) fn decrement_triangle_count(&self) -> usize {
        self.triangle_count.fetch_sub(1, Ordering::AcqRel) - 1
    }

    // ------------------------------------------------------------------
    // Links and monitors
    // ------------------------------------------------------------------

    /// Link two processes both ways.
    pub fn link(a: &Arc<ProcessHandle>, b: &Arc<ProcessHandle>) {
        if Arc::ptr_eq(a, b) {
            return;
        }
        a.links.lock().linked.push(b.clone());
        b.links.lock().linked.push(a.clone());
    }

    pub fn unlink(a: &Arc<ProcessHandle>, b: &Arc<ProcessHandle>) {
        a.links.lock().linked.retain(|h| !Arc::ptr_eq(h, b));
        b.links.lock().linked.retain(|h| !Arc::ptr_eq(h, a));
    }

    pub fn monitor(&self, port: Arc<Port>) {
        self.links.lock().monitors.push(port);
    }

    pub fn demonitor(&self, port: PortId) {
        self.links.lock().monitors.retain(|p| p.id() != port);
    }

    pub fn linked_count(&self) -> usize {
        self.links.lock().linked_count()
    }

    /// Signal every linked process that `this` died. Links are consumed.
    /// Returns how many signals were accepted.
    pub fn notify_linked_processes(this: &Arc<ProcessHandle>, kind: SignalKind) -> usize {
        let linked = std::mem::take(&mut this.links.lock().linked);
        let mut delivered = 0;
        for other in linked {
            other.links.lock().linked.retain(|h| !Arc::ptr_eq(h, this));
            if other.is_alive() && other.send_signal(Signal::new(this.clone(), kind)) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Send a process-death message to every monitoring port.
    pub fn notify_monitors(this: &Arc<ProcessHandle>, kind: SignalKind) -> usize {
        let monitors = std::mem::take(&mut this.links.lock().monitors);
        let mut delivered = 0;
        for port in monitors {
            let signal = Signal::new(this.clone(), kind);
            if port.send(MessageKind::ProcessDeathSignal(signal)).is_some() {
                delivered += 1;
            }
        }
        delivered
    }
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("alive", &self.is_alive())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;

    fn handle(id: u64) -> Arc<ProcessHandle> {
        ProcessHandle::new(ProcessId(id), None)
    }

    #[test]
    fn test_first_signal_wins() {
        let target = handle(1);
        let a = Signal::new(handle(2), SignalKind::UncaughtException);
        let b = Signal::new(handle(3), SignalKind::Killed);
        let b_probe = b.clone();

        assert!(target.send_signal(a));
        assert!(!target.send_signal(b));
        // The losing signal was released by the slot.
        assert_eq!(Arc::strong_count(&b_probe), 1);

        let kept = target.take_signal().unwrap();
        assert_eq!(kept.kind(), SignalKind::UncaughtException);
        assert!(!target.has_signal());
        // Delivery requested a preempt so the process notices.
        assert!(target.stack_limit().pending().contains(InterruptFlags::PREEMPT));
    }

    #[test]
    fn test_concurrent_signals_single_delivery() {
        let target = handle(1);
        let senders = 16;
        let barrier = Arc::new(Barrier::new(senders));
        let signals: Vec<Arc<Signal>> = (0..senders)
            .map(|i| Signal::new(handle(100 + i as u64), SignalKind::Killed))
            .collect();

        let threads: Vec<_> = signals
            .iter()
            .map(|signal| {
                let target = target.clone();
                let signal = signal.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    target.send_signal(signal)
                })
            })
            .collect();
        let accepted = threads
            .into_iter()
            .map(|t| t.join().unwrap())
            .filter(|accepted| *accepted)
            .count();
        assert_eq!(accepted, 1);

        // Exactly one extra reference is held, by the slot.
        let retained: usize = signals.iter().map(|s| Arc::strong_count(s) - 1).sum();
        assert_eq!(retained, 1);
        drop(target.take_signal());
        assert!(signals.iter().all(|s| Arc::strong_count(s) == 1));
    }

    #[test]
    fn test_slot_releases_on_drop() {
        let signal = Signal::new(handle(2), SignalKind::Terminated);
        {
            let slot = SignalSlot::default();
            slot.install(signal.clone()).unwrap();
            assert_eq!(Arc::strong_count(&signal), 2);
        }
        assert_eq!(Arc::strong_count(&signal), 1);
    }

    #[test]
    fn test_links_are_symmetric_and_consumed() {
        let a = handle(1);
        let b = handle(2);
        let c = handle(3);
        ProcessHandle::link(&a, &b);
        ProcessHandle::link(&a, &c);
        assert_eq!(a.linked_count(), 2);
        assert_eq!(b.linked_count(), 1);

        c.owner_process_terminating();
        assert_eq!(ProcessHandle::notify_linked_processes(&a, SignalKind::UncaughtException), 1);
        assert_eq!(a.linked_count(), 0);
        assert_eq!(b.linked_count(), 0);
        let signal = b.take_signal().unwrap();
        assert_eq!(signal.handle().id(), ProcessId(1));
        assert!(c.take_signal().is_none());
    }

    #[test]
    fn test_state_transitions() {
        let a = handle(1);
        assert_eq!(a.state(), ProcessState::Sleeping);
        assert!(a.change_state(ProcessState::Sleeping, ProcessState::Ready));
        assert!(!a.change_state(ProcessState::Sleeping, ProcessState::Ready));
        assert_eq!(a.state(), ProcessState::Ready);
    }
}
