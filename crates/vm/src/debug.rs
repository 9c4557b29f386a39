//! Breakpoints and stepping state of a process under a debugger.
//!
//! A breakpoint names a (function, bytecode index) pair and is indexed by
//! the raw bytecode address so the interpreter can test it cheaply. The
//! index is derived from function addresses and has to be rebuilt after
//! the program heap moves; [`DebugInfo::update_breakpoints`] does that.

use std::collections::{BTreeMap, HashMap};

use crate::collector::PointerVisitor;
use crate::object::{Address, FunctionObject};

pub type BreakpointId = i64;

/// Id reported when execution stops because of stepping.
pub const NO_BREAKPOINT_ID: BreakpointId = -1;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Breakpoint {
    pub id: BreakpointId,
    pub function: Address,
    pub bytecode_index: usize,
    pub one_shot: bool,
    /// Only break while this coroutine is running.
    pub coroutine: Option<Address>,
    /// Only break at this stack height.
    pub stack_height: Option<usize>,
}

impl Breakpoint {
    pub fn bytecode_address(&self) -> Address {
        FunctionObject::bytecode_address_for(self.function, self.bytecode_index)
    }
}

#[derive(Debug)]
pub struct DebugInfo {
    next_id: BreakpointId,
    breakpoints: BTreeMap<BreakpointId, Breakpoint>,
    by_address: HashMap<Address, BreakpointId>,
    stepping: bool,
    at_breakpoint: bool,
    current_breakpoint: BreakpointId,
}

impl Default for DebugInfo {
    fn default() -> Self {
        Self::new()
    }
}

impl DebugInfo {
    pub fn new() -> Self {
        Self {
            next_id: 0,
            breakpoints: BTreeMap::new(),
            by_address: HashMap::new(),
            stepping: false,
            at_breakpoint: false,
            current_breakpoint: NO_BREAKPOINT_ID,
        }
    }

    pub fn set_breakpoint(&mut self, function: Address, bytecode_index: usize, one_shot: bool) -> BreakpointId {
        self.set_conditional_breakpoint(function, bytecode_index, one_shot, None, None)
    }

    pub fn set_conditional_breakpoint(
        &mut self,
        function: Address,
        bytecode_index: usize,
        one_shot: bool,
        coroutine: Option<Address>,
        stack_height: Option<usize>,
    ) -> BreakpointId {
        let id = self.next_id;
        self.next_id += 1;
        let breakpoint = Breakpoint {
            id,
            function,
            bytecode_index,
            one_shot,
            coroutine,
            stack_height,
        };
        self.by_address.insert(breakpoint.bytecode_address(), id);
        self.breakpoints.insert(id, breakpoint);
        id
    }

    pub fn delete_breakpoint(&mut self, id: BreakpointId) -> bool {
        match self.breakpoints.remove(&id) {
            Some(breakpoint) => {
                let address = breakpoint.bytecode_address();
                if self.by_address.get(&address) == Some(&id) {
                    self.by_address.remove(&address);
                }
                true
            }
            None => false,
        }
    }

    pub fn breakpoint(&self, id: BreakpointId) -> Option<&Breakpoint> {
        self.breakpoints.get(&id)
    }

    pub fn breakpoint_count(&self) -> usize {
        self.breakpoints.len()
    }

    pub fn breakpoints(&self) -> impl Iterator<Item = &Breakpoint> {
        self.breakpoints.values()
    }

    pub fn set_stepping(&mut self) {
        self.stepping = true;
    }

    pub fn clear_stepping(&mut self) {
        self.stepping = false;
    }

    pub fn is_stepping(&self) -> bool {
        self.stepping
    }

    pub fn is_at_breakpoint(&self) -> bool {
        self.at_breakpoint
    }

    pub fn current_breakpoint(&self) -> BreakpointId {
        self.current_breakpoint
    }

    /// Resume after a break.
    pub fn clear_current_breakpoint(&mut self) {
        self.at_breakpoint = false;
        self.current_breakpoint = NO_BREAKPOINT_ID;
    }

    /// Called by the interpreter before executing the bytecode at `bcp`.
    /// A matching breakpoint (or stepping mode) records the stop and
    /// returns true. One-shot breakpoints are removed when they fire.
    pub fn should_break(&mut self, bcp: Address, stack_height: usize, coroutine: Option<Address>) -> bool {
        if let Some(&id) = self.by_address.get(&bcp) {
            let hit = self.breakpoints.get(&id).is_some_and(|breakpoint| {
                breakpoint.coroutine.map_or(true, |c| Some(c) == coroutine)
                    && breakpoint.stack_height.map_or(true, |h| h == stack_height)
            });
            if hit {
                let one_shot = self.breakpoints.get(&id).is_some_and(|b| b.one_shot);
                if one_shot {
                    self.delete_breakpoint(id);
                }
                self.record_stop(id);
                return true;
            }
        }
        if self.stepping {
            self.record_stop(NO_BREAKPOINT_ID);
            return true;
        }
        false
    }

    fn record_stop(&mut self, id: BreakpointId) {
        self.at_breakpoint = true;
        self.current_breakpoint = id;
    }

    // ------------------------------------------------------------------
    // Collection support
    // ------------------------------------------------------------------

    /// Visit breakpoint functions, which live in the program heap.
    pub fn visit_program_pointers(&mut self, visitor: &mut dyn PointerVisitor) {
        for breakpoint in self.breakpoints.values_mut() {
            visitor.visit_address(&mut breakpoint.function);
        }
    }

    /// Visit breakpoint coroutines, which live in the process heap.
    pub fn visit_process_pointers(&mut self, visitor: &mut dyn PointerVisitor) {
        for breakpoint in self.breakpoints.values_mut() {
            if let Some(coroutine) = breakpoint.coroutine.as_mut() {
                visitor.visit_address(coroutine);
            }
        }
    }

    /// Rebuild the address index after functions moved.
    pub fn update_breakpoints(&mut self) {
        self.by_address = self
            .breakpoints
            .values()
            .map(|breakpoint| (breakpoint.bytecode_address(), breakpoint.id))
            .collect();
    }
}
