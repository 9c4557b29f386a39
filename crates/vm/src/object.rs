//! Object model shared by every heap.
//!
//! Objects live in [`Space`](crate::space::Space) chunks and are named by
//! their [`Address`]. Addresses are unique across all spaces in the VM, so a
//! reference can point from a process heap into the shared heap or the
//! program heap without any extra tagging. A [`Value`] is what a field or a
//! stack slot holds.

use std::fmt;

use crate::collector::PointerVisitor;

/// Bytes per word. Object sizes are whole words.
pub const WORD_SIZE: usize = 8;

/// Words in every object header (class reference and flags).
pub const HEADER_WORDS: usize = 2;

/// Byte offset of the first bytecode inside a function object.
pub const FUNCTION_BYTECODE_OFFSET: usize = 5 * WORD_SIZE;

/// Byte address of an object inside the VM's address space.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(pub usize);

impl Address {
    pub fn offset(self, bytes: usize) -> Address {
        Address(self.0 + bytes)
    }

    pub fn raw(self) -> usize {
        self.0
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({:#x})", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Contents of a field or stack slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Value {
    /// Unused slot.
    #[default]
    Empty,
    /// Small integer.
    Smi(i64),
    /// Reference to a heap object.
    Ref(Address),
    /// Saved frame pointer: a slot index into the stack holding it.
    Frame(usize),
    /// Raw bytecode pointer into a function in the program heap.
    Code(Address),
}

impl Value {
    pub const SMI_MIN: i64 = -(1 << 62);
    pub const SMI_MAX: i64 = (1 << 62) - 1;

    pub fn is_valid_smi(value: i64) -> bool {
        (Self::SMI_MIN..=Self::SMI_MAX).contains(&value)
    }

    pub fn as_address(self) -> Option<Address> {
        match self {
            Value::Ref(address) => Some(address),
            _ => None,
        }
    }

    pub fn as_smi(self) -> Option<i64> {
        match self {
            Value::Smi(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_frame(self) -> Option<usize> {
        match self {
            Value::Frame(index) => Some(index),
            _ => None,
        }
    }

    pub fn as_code(self) -> Option<Address> {
        match self {
            Value::Code(address) => Some(address),
            _ => None,
        }
    }

    pub fn is_empty(self) -> bool {
        matches!(self, Value::Empty)
    }
}

/// Functions whose bodies the dispatcher can replace with a fast path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Intrinsic {
    ObjectEquals,
    GetField,
    SetField,
    ListIndexGet,
    ListIndexSet,
    ListLength,
}

/// A growable execution stack. Grows downward: the live region is
/// `slots[top..]`.
#[derive(Clone, Debug, PartialEq)]
pub struct StackObject {
    pub slots: Vec<Value>,
    pub top: usize,
    /// Scratch link used to chain stacks during collection. `Smi(0)` when
    /// the stack is not chained.
    pub next: Value,
}

impl StackObject {
    pub fn new(length: usize) -> Self {
        Self {
            slots: vec![Value::Empty; length],
            top: length,
            next: Value::Smi(0),
        }
    }

    pub fn length(&self) -> usize {
        self.slots.len()
    }

    /// Number of live slots.
    pub fn height(&self) -> usize {
        self.slots.len() - self.top
    }

    pub fn get(&self, index: usize) -> Value {
        self.slots[index]
    }

    pub fn set(&mut self, index: usize, value: Value) {
        self.slots[index] = value;
    }

    /// Push below the current top.
    pub fn push(&mut self, value: Value) {
        self.top -= 1;
        self.slots[self.top] = value;
    }

    pub fn pop(&mut self) -> Value {
        let value = self.slots[self.top];
        self.slots[self.top] = Value::Empty;
        self.top += 1;
        value
    }

    pub fn live(&self) -> &[Value] {
        &self.slots[self.top..]
    }
}

/// A class in the program heap.
#[derive(Clone, Debug, PartialEq)]
pub struct ClassObject {
    pub id: i32,
    /// Superclass reference, or `Empty` for the root class.
    pub super_class: Value,
    /// Array of alternating `Smi(selector)` and function references, sorted
    /// by selector.
    pub methods: Value,
    pub instance_fields: usize,
}

/// A compiled function in the program heap.
#[derive(Clone, Debug, PartialEq)]
pub struct FunctionObject {
    pub arity: usize,
    pub bytecodes: Vec<u8>,
    pub literals: Vec<Value>,
    pub intrinsic: Option<Intrinsic>,
}

impl FunctionObject {
    /// Address of bytecode `index` of the function object at `function`.
    pub fn bytecode_address_for(function: Address, index: usize) -> Address {
        function.offset(FUNCTION_BYTECODE_OFFSET + index)
    }

    /// Bytecode index of `bcp` inside the function object at `function`.
    pub fn bytecode_index_of(function: Address, bcp: Address) -> usize {
        bcp.raw() - Self::bytecode_address_for(function, 0).raw()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ObjectBody {
    Instance(Vec<Value>),
    Array(Vec<Value>),
    ByteArray(Vec<u8>),
    OneByteString(Vec<u8>),
    TwoByteString(Vec<u16>),
    Double(f64),
    LargeInteger(i64),
    Boxed(Value),
    Stack(StackObject),
    Class(ClassObject),
    Function(FunctionObject),
}

fn words_for_bytes(bytes: usize) -> usize {
    bytes.div_ceil(WORD_SIZE)
}

impl ObjectBody {
    fn size_in_words(&self) -> usize {
        HEADER_WORDS
            + match self {
                ObjectBody::Instance(fields) => fields.len(),
                ObjectBody::Array(values) => 1 + values.len(),
                ObjectBody::ByteArray(bytes) | ObjectBody::OneByteString(bytes) => {
                    1 + words_for_bytes(bytes.len())
                }
                ObjectBody::TwoByteString(units) => 1 + words_for_bytes(units.len() * 2),
                ObjectBody::Double(_) | ObjectBody::LargeInteger(_) | ObjectBody::Boxed(_) => 1,
                ObjectBody::Stack(stack) => 3 + stack.length(),
                ObjectBody::Class(_) => 4,
                ObjectBody::Function(function) => {
                    3 + words_for_bytes(function.bytecodes.len()) + function.literals.len()
                }
            }
    }
}

/// An object stored in a space.
#[derive(Clone, Debug, PartialEq)]
pub struct HeapObject {
    /// Class of the object, always in the program heap.
    pub class: Address,
    pub body: ObjectBody,
    pub immutable: bool,
    marked: bool,
    forwarding: Option<Address>,
}

impl HeapObject {
    pub fn new(class: Address, body: ObjectBody) -> Self {
        Self {
            class,
            body,
            immutable: false,
            marked: false,
            forwarding: None,
        }
    }

    pub fn immutable(class: Address, body: ObjectBody) -> Self {
        Self {
            immutable: true,
            ..Self::new(class, body)
        }
    }

    /// Size in bytes.
    pub fn size(&self) -> usize {
        self.body.size_in_words() * WORD_SIZE
    }

    // ------------------------------------------------------------------
    // Collector state
    // ------------------------------------------------------------------

    pub fn forwarding_address(&self) -> Option<Address> {
        self.forwarding
    }

    pub fn set_forwarding_address(&mut self, to: Address) {
        debug_assert!(self.forwarding.is_none(), "object forwarded twice");
        self.forwarding = Some(to);
    }

    pub fn is_marked(&self) -> bool {
        self.marked
    }

    pub fn set_mark(&mut self) {
        self.marked = true;
    }

    pub fn clear_mark(&mut self) {
        self.marked = false;
    }

    /// A copy suitable for placing in a to-space.
    pub fn clone_for_copy(&self) -> HeapObject {
        HeapObject {
            class: self.class,
            body: self.body.clone(),
            immutable: self.immutable,
            marked: false,
            forwarding: None,
        }
    }

    // ------------------------------------------------------------------
    // Pointer iteration
    // ------------------------------------------------------------------

    /// Visit the class reference and every value slot that can hold a
    /// reference. Only the live region of a stack is visited.
    pub fn visit_pointers(&mut self, visitor: &mut dyn PointerVisitor) {
        visitor.visit_address(&mut self.class);
        match &mut self.body {
            ObjectBody::Instance(values) | ObjectBody::Array(values) => visitor.visit_block(values),
            ObjectBody::Boxed(value) => visitor.visit(value),
            ObjectBody::Stack(stack) => {
                let top = stack.top;
                visitor.visit_block(&mut stack.slots[top..]);
                visitor.visit(&mut stack.next);
            }
            ObjectBody::Class(class) => {
                visitor.visit(&mut class.super_class);
                visitor.visit(&mut class.methods);
            }
            ObjectBody::Function(function) => visitor.visit_block(&mut function.literals),
            ObjectBody::ByteArray(_)
            | ObjectBody::OneByteString(_)
            | ObjectBody::TwoByteString(_)
            | ObjectBody::Double(_)
            | ObjectBody::LargeInteger(_) => {}
        }
    }

    /// Visit the value slots only, skipping the class reference.
    pub fn visit_value_pointers(&mut self, visitor: &mut dyn PointerVisitor) {
        self.visit_pointers(&mut SkipFirst { inner: visitor, skipped: false });
    }

    /// Call `f` for every referenced address, class included.
    pub fn for_each_pointer(&self, mut f: impl FnMut(Address)) {
        f(self.class);
        let mut each = |values: &[Value]| {
            for value in values {
                if let Value::Ref(address) = value {
                    f(*address);
                }
            }
        };
        match &self.body {
            ObjectBody::Instance(values) | ObjectBody::Array(values) => each(values),
            ObjectBody::Boxed(value) => each(std::slice::from_ref(value)),
            ObjectBody::Stack(stack) => {
                each(stack.live());
                each(std::slice::from_ref(&stack.next));
            }
            ObjectBody::Class(class) => each(&[class.super_class, class.methods]),
            ObjectBody::Function(function) => each(&function.literals),
            _ => {}
        }
    }

    // ------------------------------------------------------------------
    // Typed access
    // ------------------------------------------------------------------

    pub fn as_stack(&self) -> Option<&StackObject> {
        match &self.body {
            ObjectBody::Stack(stack) => Some(stack),
            _ => None,
        }
    }

    pub fn as_stack_mut(&mut self) -> Option<&mut StackObject> {
        match &mut self.body {
            ObjectBody::Stack(stack) => Some(stack),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&FunctionObject> {
        match &self.body {
            ObjectBody::Function(function) => Some(function),
            _ => None,
        }
    }

    pub fn as_class(&self) -> Option<&ClassObject> {
        match &self.body {
            ObjectBody::Class(class) => Some(class),
            _ => None,
        }
    }

    pub fn as_class_mut(&mut self) -> Option<&mut ClassObject> {
        match &mut self.body {
            ObjectBody::Class(class) => Some(class),
            _ => None,
        }
    }

    /// Fields of an instance or elements of an array.
    pub fn values(&self) -> Option<&[Value]> {
        match &self.body {
            ObjectBody::Instance(values) | ObjectBody::Array(values) => Some(values),
            _ => None,
        }
    }

    pub fn values_mut(&mut self) -> Option<&mut Vec<Value>> {
        match &mut self.body {
            ObjectBody::Instance(values) | ObjectBody::Array(values) => Some(values),
            _ => None,
        }
    }

    pub fn as_large_integer(&self) -> Option<i64> {
        match self.body {
            ObjectBody::LargeInteger(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_stack(&self) -> bool {
        matches!(self.body, ObjectBody::Stack(_))
    }
}

/// Forwards every visit except the first address, which is the class slot.
struct SkipFirst<'a> {
    inner: &'a mut dyn PointerVisitor,
    skipped: bool,
}

impl PointerVisitor for SkipFirst<'_> {
    fn visit_address(&mut self, slot: &mut Address) {
        if self.skipped {
            self.inner.visit_address(slot);
        } else {
            self.skipped = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Collect(Vec<Address>);

    impl PointerVisitor for Collect {
        fn visit_address(&mut self, slot: &mut Address) {
            self.0.push(*slot);
        }
    }

    #[test]
    fn test_smi_range() {
        assert!(Value::is_valid_smi(0));
        assert!(Value::is_valid_smi(Value::SMI_MAX));
        assert!(!Value::is_valid_smi(Value::SMI_MAX + 1));
        assert!(!Value::is_valid_smi(i64::MIN));
    }

    #[test]
    fn test_sizes_are_whole_words() {
        let class = Address(0x1000);
        let string = HeapObject::new(class, ObjectBody::OneByteString(b"hello world".to_vec()));
        assert_eq!(string.size(), (HEADER_WORDS + 1 + 2) * WORD_SIZE);

        let stack = HeapObject::new(class, ObjectBody::Stack(StackObject::new(16)));
        assert_eq!(stack.size(), (HEADER_WORDS + 3 + 16) * WORD_SIZE);
    }

    #[test]
    fn test_bytecode_addresses_stay_inside_function() {
        let function = FunctionObject {
            arity: 0,
            bytecodes: vec![0; 9],
            literals: vec![],
            intrinsic: None,
        };
        let object = HeapObject::new(Address(0), ObjectBody::Function(function));
        let base = Address(0x2000);
        let last = FunctionObject::bytecode_address_for(base, 8);
        assert!(last.raw() < base.raw() + object.size());
        assert_eq!(FunctionObject::bytecode_index_of(base, last), 8);
    }

    #[test]
    fn test_stack_visit_covers_live_region_only() {
        let mut stack = StackObject::new(4);
        stack.set(0, Value::Ref(Address(0x10))); // dead slot below top
        stack.push(Value::Ref(Address(0x20)));
        stack.push(Value::Smi(3));
        let mut object = HeapObject::new(Address(0x1), ObjectBody::Stack(stack));

        let mut collect = Collect(Vec::new());
        object.visit_value_pointers(&mut collect);
        assert_eq!(collect.0, vec![Address(0x20)]);
        assert_eq!(object.class, Address(0x1));
    }

    #[test]
    fn test_for_each_pointer_includes_class() {
        let object = HeapObject::new(
            Address(0x8),
            ObjectBody::Array(vec![Value::Smi(1), Value::Ref(Address(0x18))]),
        );
        let mut seen = Vec::new();
        object.for_each_pointer(|a| seen.push(a));
        assert_eq!(seen, vec![Address(0x8), Address(0x18)]);
    }
}
