//! Cell representation.
//!
//! Every runtime object is one fixed-size [`Cell`] drawn from the value
//! pool. A cell is a small header (alive flag, GC mark flag) plus a
//! tagged payload. References between cells are 16-bit pool offsets
//! ([`ValueRef`]), never host pointers, so the whole object graph fits in
//! compressed form and survives relocation of the pool as a block.

use crate::interns::InternRef;
use crate::interp::Interp;
use crate::platform::ScratchBufferRef;

/// A compressed reference: an index into the value pool. The empty list,
/// the out-of-memory sentinel, and every other runtime value are all
/// addressed this way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ValueRef(pub(crate) u16);

/// Signature of a host-supplied primitive. Receives the interpreter and
/// the argument count; arguments are read from the operand stack by
/// positional offset, and the returned value replaces them.
pub type NativeFn = fn(&mut Interp, u8) -> ValueRef;

/// Error kinds carried by error cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    OutOfMemory,
    UndefinedVariableAccess,
    InvalidArgc,
    InvalidArgumentType,
    ValueNotCallable,
    InvalidSyntax,
    MismatchedParens,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::OutOfMemory => "out-of-memory",
            ErrorCode::UndefinedVariableAccess => "undefined-variable-access",
            ErrorCode::InvalidArgc => "invalid-argc",
            ErrorCode::InvalidArgumentType => "invalid-argument-type",
            ErrorCode::ValueNotCallable => "value-not-callable",
            ErrorCode::InvalidSyntax => "invalid-syntax",
            ErrorCode::MismatchedParens => "mismatched-parentheses",
        }
    }
}

/// Cell payload. Function cells come in three modes, flattened here into
/// separate variants; [`TypeTag`] folds them back into one observable
/// `Function` type.
pub enum CellValue {
    /// Free-list link. Only valid while the cell is not alive.
    HeapNode { next: Option<ValueRef> },
    Nil,
    Integer(i32),
    Cons { car: ValueRef, cdr: ValueRef },
    NativeFunction(NativeFn),
    /// Interpreted function: expression list plus captured lexical
    /// binding chain.
    SourceFunction { code: ValueRef, bindings: ValueRef },
    /// Compiled function: an `(offset . databuffer)` pair plus captured
    /// lexical binding chain.
    BytecodeFunction { code: ValueRef, bindings: ValueRef },
    Error { code: ErrorCode, context: ValueRef },
    Symbol(InternRef),
    /// Opaque host word. The collector neither follows nor frees it.
    UserData(usize),
    /// Owns one host scratch buffer; the handle drops when the cell is
    /// swept.
    DataBuffer(ScratchBufferRef),
    /// NUL-terminated bytes inside a data buffer.
    String { buffer: ValueRef, offset: u16 },
    /// Reserved for a future byte/codepoint value. Preserved by the
    /// reader and collector, never constructed from source text.
    #[allow(dead_code)]
    Character(u8),
}

/// Observable value types, as reported by the `type` primitive and the
/// disassembler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeTag {
    HeapNode,
    Nil,
    Integer,
    Cons,
    Function,
    Error,
    Symbol,
    UserData,
    DataBuffer,
    String,
    Character,
}

impl CellValue {
    pub fn type_tag(&self) -> TypeTag {
        match self {
            CellValue::HeapNode { .. } => TypeTag::HeapNode,
            CellValue::Nil => TypeTag::Nil,
            CellValue::Integer(_) => TypeTag::Integer,
            CellValue::Cons { .. } => TypeTag::Cons,
            CellValue::NativeFunction(_)
            | CellValue::SourceFunction { .. }
            | CellValue::BytecodeFunction { .. } => TypeTag::Function,
            CellValue::Error { .. } => TypeTag::Error,
            CellValue::Symbol(_) => TypeTag::Symbol,
            CellValue::UserData(_) => TypeTag::UserData,
            CellValue::DataBuffer(_) => TypeTag::DataBuffer,
            CellValue::String { .. } => TypeTag::String,
            CellValue::Character(_) => TypeTag::Character,
        }
    }
}

/// One pool slot: header flags plus payload.
pub struct Cell {
    pub(crate) alive: bool,
    pub(crate) marked: bool,
    pub(crate) value: CellValue,
}

// The pool only works if cells stay small and uniform. The payload packs
// into two machine words on 64-bit hosts; the header flags ride in the
// trailing bytes.
#[cfg(target_pointer_width = "64")]
const _: () = assert!(std::mem::size_of::<CellValue>() == 16);
#[cfg(target_pointer_width = "64")]
const _: () = assert!(std::mem::size_of::<Cell>() == 24);

const _: () = assert!(std::mem::size_of::<ValueRef>() == 2);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_tags() {
        assert_eq!(CellValue::Nil.type_tag(), TypeTag::Nil);
        assert_eq!(CellValue::Integer(42).type_tag(), TypeTag::Integer);
        assert_eq!(
            CellValue::Cons {
                car: ValueRef(0),
                cdr: ValueRef(0)
            }
            .type_tag(),
            TypeTag::Cons
        );
        assert_eq!(
            CellValue::Error {
                code: ErrorCode::OutOfMemory,
                context: ValueRef(0)
            }
            .type_tag(),
            TypeTag::Error
        );
        assert_eq!(CellValue::Character(0).type_tag(), TypeTag::Character);
    }

    #[test]
    fn test_error_code_names() {
        assert_eq!(ErrorCode::OutOfMemory.as_str(), "out-of-memory");
        assert_eq!(
            ErrorCode::MismatchedParens.as_str(),
            "mismatched-parentheses"
        );
        assert_eq!(ErrorCode::InvalidArgc.as_str(), "invalid-argc");
    }
}
