//! The stack limit word.
//!
//! The interpreter compares the stack top against one word before every
//! call and loop back-edge. Other threads request attention by replacing
//! the real limit with pending interrupt flags, which makes that check fail
//! and routes the process into
//! [`Process::handle_stack_overflow`](crate::process::Process::handle_stack_overflow).
//!
//! The word is one `AtomicU64`. Bit 63 tags it as interrupted; the low
//! bits then hold [`InterruptFlags`]. Otherwise the word is the real limit,
//! a slot index into the current stack.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

const INTERRUPTED_TAG: u64 = 1 << 63;

/// Pending interrupt requests.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct InterruptFlags(u8);

impl InterruptFlags {
    pub const NONE: InterruptFlags = InterruptFlags(0);
    pub const PREEMPT: InterruptFlags = InterruptFlags(1);
    pub const PROFILE: InterruptFlags = InterruptFlags(2);
    pub const DEBUG_INTERRUPT: InterruptFlags = InterruptFlags(4);

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: InterruptFlags) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn union(self, other: InterruptFlags) -> InterruptFlags {
        InterruptFlags(self.0 | other.0)
    }

    pub fn without(self, other: InterruptFlags) -> InterruptFlags {
        InterruptFlags(self.0 & !other.0)
    }

    /// The flag to handle first: preempt, then debug interrupt, then profile.
    pub fn highest_priority(self) -> Option<InterruptFlags> {
        [Self::PREEMPT, Self::DEBUG_INTERRUPT, Self::PROFILE]
            .into_iter()
            .find(|flag| self.contains(*flag))
    }
}

impl fmt::Debug for InterruptFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(Self::PREEMPT) {
            names.push("PREEMPT");
        }
        if self.contains(Self::DEBUG_INTERRUPT) {
            names.push("DEBUG_INTERRUPT");
        }
        if self.contains(Self::PROFILE) {
            names.push("PROFILE");
        }
        write!(f, "InterruptFlags({})", names.join(" | "))
    }
}

/// Decoded contents of the stack limit word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StackLimitState {
    /// No interrupt pending. The stack overflows below this slot index.
    Limit(usize),
    /// Interrupts pending. Every stack check fails until they are handled.
    Interrupted(InterruptFlags),
}

impl StackLimitState {
    fn encode(self) -> u64 {
        match self {
            StackLimitState::Limit(limit) => limit as u64 & !INTERRUPTED_TAG,
            StackLimitState::Interrupted(flags) => INTERRUPTED_TAG | flags.bits() as u64,
        }
    }

    fn decode(word: u64) -> Self {
        if word & INTERRUPTED_TAG != 0 {
            StackLimitState::Interrupted(InterruptFlags(word as u8))
        } else {
            StackLimitState::Limit(word as usize)
        }
    }
}

/// Atomic stack limit shared between the owning process and any thread
/// that wants to interrupt it.
#[derive(Debug)]
pub struct StackLimit {
    word: AtomicU64,
}

impl Default for StackLimit {
    fn default() -> Self {
        Self::new()
    }
}

impl StackLimit {
    /// An interrupted word with no flags, so the first stack check installs
    /// the real limit.
    pub fn new() -> Self {
        Self {
            word: AtomicU64::new(StackLimitState::Interrupted(InterruptFlags::NONE).encode()),
        }
    }

    pub fn load(&self) -> StackLimitState {
        StackLimitState::decode(self.word.load(Ordering::Acquire))
    }

    /// Pending flags; empty when a real limit is installed.
    pub fn pending(&self) -> InterruptFlags {
        match self.load() {
            StackLimitState::Interrupted(flags) => flags,
            StackLimitState::Limit(_) => InterruptFlags::NONE,
        }
    }

    /// Whether a stack top at slot `top` passes the check.
    pub fn check(&self, top: usize) -> bool {
        matches!(self.load(), StackLimitState::Limit(limit) if top >= limit)
    }

    /// Request `flag`. Safe from any thread; setting a set flag is a no-op.
    pub fn set_interrupt(&self, flag: InterruptFlags) {
        let mut current = self.word.load(Ordering::Acquire);
        loop {
            let flags = match StackLimitState::decode(current) {
                StackLimitState::Interrupted(flags) => flags,
                StackLimitState::Limit(_) => InterruptFlags::NONE,
            };
            let updated = StackLimitState::Interrupted(flags.union(flag)).encode();
            if updated == current {
                return;
            }
            match self
                .word
                .compare_exchange_weak(current, updated, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// Clear `flag` if it is pending. Returns whether it was.
    pub fn clear_interrupt(&self, flag: InterruptFlags) -> bool {
        let mut current = self.word.load(Ordering::Acquire);
        loop {
            let flags = match StackLimitState::decode(current) {
                StackLimitState::Interrupted(flags) if flags.contains(flag) => flags,
                _ => return false,
            };
            let updated = StackLimitState::Interrupted(flags.without(flag)).encode();
            match self
                .word
                .compare_exchange_weak(current, updated, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Install `limit` unless interrupts are still pending. Returns whether
    /// the real limit is now in place.
    pub fn update_limit(&self, limit: usize) -> bool {
        let mut current = self.word.load(Ordering::Acquire);
        loop {
            match StackLimitState::decode(current) {
                StackLimitState::Interrupted(flags) if !flags.is_empty() => return false,
                _ => {}
            }
            let updated = StackLimitState::Limit(limit).encode();
            match self
                .word
                .compare_exchange_weak(current, updated, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }
}
