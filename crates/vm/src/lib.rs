//! Isle Virtual Machine runtime core
//!
//! Runtime for many lightweight, isolated processes:
//! - Per-process heaps with a scavenging or mark-sweep collector
//! - An immutable shared heap for values that cross process boundaries
//! - Store buffers tracking pointers out of process heaps
//! - Cooperative stack growth and interrupts through the stack limit word
//! - Mailboxes and ports, including heap transfer on process exit
//! - Program heap collection with stack cooking
//! - Breakpoints and stepping hooks for a debugger
//!
//! The interpreter is supplied by the embedder through the
//! [`Interpreter`] trait.
//!
//! The `mark-sweep` feature only picks the default process heap collector;
//! both collectors are always built, and the integration tests run every
//! process collection scenario under each through
//! [`Process::collect_mutable_garbage_with`].

pub mod bytecode;
pub mod collector;
pub mod config;
pub mod debug;
pub mod error;
pub mod heap;
pub mod lookup_cache;
pub mod mailbox;
pub mod mark_sweep;
pub mod natives;
pub mod object;
pub mod platform;
pub mod port;
pub mod process;
pub mod program;
pub mod scheduler;
pub mod signal;
pub mod space;
pub mod stack;
pub mod stack_limit;
pub mod store_buffer;
pub mod thread_state;
pub mod validator;

pub use bytecode::{BytecodeBuilder, Opcode, Selector, SelectorKind};
pub use collector::{CollectorKind, PointerVisitor, ScavengeVisitor};
pub use config::{Flags, GcConfig, RuntimeConfig, SchedulerConfig};
pub use debug::{Breakpoint, BreakpointId, DebugInfo, NO_BREAKPOINT_ID};
pub use error::{Failure, RuntimeError};
pub use heap::{Finalizer, ForeignMemory, Heap, SharedHeap};
pub use lookup_cache::{LookupCache, LookupEntry, LookupTag};
pub use mailbox::{Mailbox, Message, MessageKind};
pub use object::{Address, ClassObject, FunctionObject, HeapObject, ObjectBody, StackObject, Value};
pub use platform::{HostPlatform, Platform};
pub use port::{Port, PortId};
pub use process::{HeapUsage, Process, ProcessState, StackCheckResult};
pub use program::{ProcessId, ProcessRef, Program, ProgramBuilder, ProgramRoots, ProgramStatistics};
pub use scheduler::{Interpreter, Interruption, Scheduler};
pub use signal::{ProcessHandle, Signal, SignalKind};
pub use space::Space;
pub use stack_limit::{InterruptFlags, StackLimit, StackLimitState};
pub use store_buffer::StoreBuffer;
pub use thread_state::ThreadState;
