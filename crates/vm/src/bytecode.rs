//! Bytecode metadata used by the runtime.
//!
//! The interpreter owns opcode semantics. The runtime only needs to know
//! how long each instruction is, its static stack effect, and how to decode
//! the target of an invoke so the debugger can predict where a call
//! returns.

use std::fmt;

use num_enum::TryFromPrimitive;

/// Encoded method selector: `id << 10 | kind << 8 | arity`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Selector(i32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum SelectorKind {
    Method = 0,
    Getter = 1,
    Setter = 2,
}

impl Selector {
    const ARITY_BITS: u32 = 8;
    const KIND_BITS: u32 = 2;
    const KIND_SHIFT: u32 = Self::ARITY_BITS;
    const ID_SHIFT: u32 = Self::ARITY_BITS + Self::KIND_BITS;

    pub fn encode(id: i32, kind: SelectorKind, arity: usize) -> Self {
        debug_assert!(arity < (1 << Self::ARITY_BITS));
        Selector((id << Self::ID_SHIFT) | ((kind as i32) << Self::KIND_SHIFT) | arity as i32)
    }

    pub fn from_raw(raw: i32) -> Self {
        Selector(raw)
    }

    pub fn raw(self) -> i32 {
        self.0
    }

    pub fn id(self) -> i32 {
        self.0 >> Self::ID_SHIFT
    }

    pub fn kind(self) -> SelectorKind {
        let bits = ((self.0 >> Self::KIND_SHIFT) & ((1 << Self::KIND_BITS) - 1)) as u8;
        SelectorKind::try_from(bits).unwrap_or(SelectorKind::Method)
    }

    /// Arguments excluding the receiver.
    pub fn arity(self) -> usize {
        (self.0 & ((1 << Self::ARITY_BITS) - 1)) as usize
    }
}

impl fmt::Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Selector({}, {:?}, {})", self.id(), self.kind(), self.arity())
    }
}

/// Selector id reserved for the no-such-method trampoline.
pub const NO_SUCH_METHOD_TRAMPOLINE_ID: i32 = 0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, TryFromPrimitive)]
#[repr(u8)]
pub enum Opcode {
    LoadLocal0 = 0,
    LoadLocal1,
    LoadLocal2,
    LoadLocal,
    LoadBoxed,
    LoadStatic,
    LoadField,
    LoadConst,
    LoadLiteralNull,
    LoadLiteralTrue,
    LoadLiteralFalse,
    LoadLiteral,
    LoadLiteralWide,
    StoreLocal,
    StoreBoxed,
    StoreStatic,
    StoreField,
    Pop,
    Return,
    ReturnNull,
    BranchWide,
    BranchIfTrueWide,
    BranchIfFalseWide,
    BranchBack,
    InvokeMethod,
    InvokeMethodUnfold,
    InvokeNoSuchMethod,
    InvokeTestNoSuchMethod,
    InvokeStatic,
    InvokeStaticUnfold,
    InvokeFactory,
    InvokeFactoryUnfold,
    InvokeNative,
    Allocate,
    AllocateImmutable,
    Identical,
    Throw,
    ProcessYield,
    CoroutineChange,
    StackOverflowCheck,
    MethodEnd,
}

/// How an invoke names its target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InvokeTarget {
    /// Dynamic dispatch on the receiver.
    Selector(Selector),
    /// Index into the program's static methods.
    StaticMethod(usize),
    /// Index into the calling function's literals.
    Literal(usize),
}

impl Opcode {
    pub fn decode(byte: u8) -> Option<Opcode> {
        Opcode::try_from(byte).ok()
    }

    /// Instruction length in bytes, opcode included.
    pub fn size(self) -> usize {
        use Opcode::*;
        match self {
            LoadLocal0 | LoadLocal1 | LoadLocal2 | LoadLiteralNull | LoadLiteralTrue
            | LoadLiteralFalse | Pop | ReturnNull | Identical | Throw | ProcessYield
            | CoroutineChange => 1,
            LoadLocal | LoadBoxed | LoadField | LoadLiteral | StoreLocal | StoreBoxed
            | StoreField | Return | BranchBack => 2,
            InvokeNative => 3,
            LoadStatic | LoadConst | LoadLiteralWide | StoreStatic | BranchWide
            | BranchIfTrueWide | BranchIfFalseWide | InvokeMethod | InvokeMethodUnfold
            | InvokeNoSuchMethod | InvokeTestNoSuchMethod | InvokeStatic | InvokeStaticUnfold
            | InvokeFactory | InvokeFactoryUnfold | Allocate | AllocateImmutable
            | StackOverflowCheck | MethodEnd => 5,
        }
    }

    /// Static stack effect, or `None` when it depends on the operand.
    pub fn stack_diff(self) -> Option<i32> {
        use Opcode::*;
        match self {
            LoadLocal0 | LoadLocal1 | LoadLocal2 | LoadLocal | LoadBoxed | LoadStatic
            | LoadConst | LoadLiteralNull | LoadLiteralTrue | LoadLiteralFalse | LoadLiteral
            | LoadLiteralWide | InvokeNative => Some(1),
            LoadField | StoreLocal | StoreBoxed | StoreStatic | BranchWide | BranchBack
            | InvokeTestNoSuchMethod | Throw | ProcessYield | StackOverflowCheck | MethodEnd => {
                Some(0)
            }
            StoreField | Pop | BranchIfTrueWide | BranchIfFalseWide | Identical
            | CoroutineChange => Some(-1),
            Return | ReturnNull | InvokeMethod | InvokeMethodUnfold | InvokeNoSuchMethod
            | InvokeStatic | InvokeStaticUnfold | InvokeFactory | InvokeFactoryUnfold
            | Allocate | AllocateImmutable => None,
        }
    }

    pub fn is_invoke(self) -> bool {
        self.invoke_target(0).is_some()
    }

    /// Interpret `operand` as the target of this invoke.
    fn invoke_target(self, operand: i32) -> Option<InvokeTarget> {
        use Opcode::*;
        match self {
            InvokeMethod | InvokeMethodUnfold | InvokeNoSuchMethod => {
                Some(InvokeTarget::Selector(Selector::from_raw(operand)))
            }
            InvokeStatic | InvokeFactory => Some(InvokeTarget::StaticMethod(operand as usize)),
            InvokeStaticUnfold | InvokeFactoryUnfold => Some(InvokeTarget::Literal(operand as usize)),
            _ => None,
        }
    }
}

/// Little-endian 32-bit operand at `at`.
pub fn read_i32(bytecodes: &[u8], at: usize) -> Option<i32> {
    let bytes = bytecodes.get(at..at + 4)?;
    Some(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Decode the invoke at `index`, if the instruction there is one.
pub fn decode_invoke(bytecodes: &[u8], index: usize) -> Option<(Opcode, InvokeTarget)> {
    let opcode = Opcode::decode(*bytecodes.get(index)?)?;
    if !opcode.is_invoke() {
        return None;
    }
    let target = opcode.invoke_target(read_i32(bytecodes, index + 1)?)?;
    Some((opcode, target))
}

/// Small assembler for building bytecode in images and tests.
#[derive(Debug, Default, Clone)]
pub struct BytecodeBuilder {
    bytes: Vec<u8>,
}

impl BytecodeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(mut self, opcode: Opcode) -> Self {
        self.bytes.push(opcode as u8);
        self.bytes.resize(self.bytes.len() + opcode.size() - 1, 0);
        self
    }

    pub fn emit_u8(mut self, opcode: Opcode, operand: u8) -> Self {
        debug_assert_eq!(opcode.size(), 2);
        self.bytes.push(opcode as u8);
        self.bytes.push(operand);
        self
    }

    pub fn emit_i32(mut self, opcode: Opcode, operand: i32) -> Self {
        debug_assert_eq!(opcode.size(), 5);
        self.bytes.push(opcode as u8);
        self.bytes.extend_from_slice(&operand.to_le_bytes());
        self
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn build(self) -> Vec<u8> {
        self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_fields() {
        let selector = Selector::encode(1234, SelectorKind::Setter, 3);
        assert_eq!(selector.id(), 1234);
        assert_eq!(selector.kind(), SelectorKind::Setter);
        assert_eq!(selector.arity(), 3);
    }

    #[test]
    fn test_every_opcode_has_metadata() {
        for byte in 0..=u8::MAX {
            if let Some(opcode) = Opcode::decode(byte) {
                assert!(opcode.size() >= 1);
                if opcode.is_invoke() {
                    assert_eq!(opcode.size(), 5);
                    assert!(opcode.stack_diff().is_none());
                }
            }
        }
        assert_eq!(Opcode::decode(Opcode::MethodEnd as u8 + 1), None);
    }

    #[test]
    fn test_decode_invoke() {
        let selector = Selector::encode(7, SelectorKind::Method, 2);
        let code = BytecodeBuilder::new()
            .emit(Opcode::LoadLocal0)
            .emit_i32(Opcode::InvokeMethod, selector.raw())
            .emit_i32(Opcode::InvokeStatic, 4)
            .emit_i32(Opcode::InvokeFactoryUnfold, 1)
            .emit_u8(Opcode::Return, 1)
            .build();
        assert_eq!(decode_invoke(&code, 0), None);
        assert_eq!(
            decode_invoke(&code, 1),
            Some((Opcode::InvokeMethod, InvokeTarget::Selector(selector)))
        );
        assert_eq!(
            decode_invoke(&code, 6),
            Some((Opcode::InvokeStatic, InvokeTarget::StaticMethod(4)))
        );
        assert_eq!(
            decode_invoke(&code, 11),
            Some((Opcode::InvokeFactoryUnfold, InvokeTarget::Literal(1)))
        );
        assert_eq!(code.len(), 18);
    }
}
