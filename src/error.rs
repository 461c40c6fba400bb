//! Exception kinds and the result type used throughout the runtime core.
//!
//! Script-level `throw` can raise any value; thrown primitive integers are
//! mapped onto this dense, contiguous enumeration of exception kinds, and
//! everything else becomes [`Exception::Other`]. The enumeration is fixed at
//! build time and its textual names and one-line descriptions are queryable
//! at runtime.

use thiserror::Error;

/// VM exception kinds.
///
/// The numeric values are part of the bytecode contract: a `THROW` of the
/// integer `n` is routed to the handler search as the kind with code `n`.
/// Code `0` is "no exception" and never appears as an `Err`.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-types", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum Exception {
    /// Voluntary reschedule point; resumes execution.
    #[error("yield")]
    Yield = 1,

    /// VM work exhausted; the root frame was reached.
    #[error("end of VM work")]
    End,

    /// Forced return from within a try or catch block.
    #[error("return from exception block")]
    Return,

    /// A destructor refused to destroy its object.
    #[error("destruction refused")]
    Refuse,

    /// A non-integer value was thrown.
    #[error("non-integer exception value")]
    Other,

    /// Internal error in the runtime core itself. Never caught by script
    /// handlers.
    #[error("internal error")]
    Internal,

    /// Bytecode failed a VM consistency check.
    #[error("VM consistency check failed")]
    VmCheck,

    /// Illegal instruction.
    #[error("illegal instruction")]
    Illegal,

    /// The thrown value itself was unusable as an exception.
    #[error("illegal exception value")]
    BadException,

    /// Operation not implemented for these operands.
    #[error("operation not implemented")]
    NotImplemented,

    /// Out of memory.
    #[error("out of memory")]
    Memory,

    /// Unexpected end of input.
    #[error("unexpected end of data")]
    Eof,

    /// Malformed arguments to an instruction or call.
    #[error("invalid arguments")]
    Arguments,

    /// Too few arguments.
    #[error("too few arguments")]
    FewArgs,

    /// Too many arguments.
    #[error("too many arguments")]
    ManyArgs,

    /// Trailing arguments do not form whole tuples.
    #[error("incomplete argument tuple")]
    TupleArgs,

    /// A result was requested from a function that has none.
    #[error("function has no result")]
    NoResult,

    /// An object reference was required.
    #[error("object required")]
    NeedObject,

    /// A callable object was required.
    #[error("callable object required")]
    NeedCallable,

    /// A string was required.
    #[error("string required")]
    NeedString,

    /// An even number of initializers was required.
    #[error("even number of values required")]
    NeedEven,

    /// Operand has the wrong type for this operation.
    #[error("wrong operand type")]
    WrongType,

    /// Value is of a type that the operation cannot even consider.
    #[error("illegal operand type")]
    BadType,

    /// The value cannot be indexed.
    #[error("object cannot be indexed")]
    CantIndex,

    /// Index below the valid range.
    #[error("index below range")]
    LowIndex,

    /// Index above the valid range.
    #[error("index above range")]
    HighIndex,

    /// Index or key not valid for this container.
    #[error("no such index or key")]
    WrongIndex,

    /// Read access denied.
    #[error("cannot read")]
    CantRead,

    /// Write access denied.
    #[error("cannot write")]
    CantWrite,

    /// Delete not possible.
    #[error("cannot delete")]
    CantDelete,

    /// Integer division or modulo by zero.
    #[error("division by zero")]
    DivByZero,

    /// Arithmetic overflow.
    #[error("arithmetic overflow")]
    Overflow,

    /// The class does not implement the requested metamethod.
    #[error("metamethod not implemented")]
    NoMetamethod,

    /// The class cannot be instantiated.
    #[error("class has no constructor")]
    NoConstructor,

    /// The constructor failed.
    #[error("constructor failed")]
    Constructor,

    /// Upvalue access walked off the call frame chain.
    #[error("upvalue access failed")]
    Upvalue,

    /// Named object not found.
    #[error("object not found")]
    NotFound,

    /// Module initialization failed.
    #[error("module initialization failed")]
    ModuleInit,

    /// No cast path between the classes involved.
    #[error("cast failed")]
    CastFailed,
}

/// Highest valid exception code.
pub const EXCEPTION_LAST: u8 = Exception::CastFailed as u8;

impl Exception {
    /// Maps a thrown integer onto an exception kind.
    ///
    /// Codes outside the enumeration collapse to [`Exception::Other`], the
    /// same route a thrown non-integer value takes. `None` is returned for
    /// code 0, which means "no exception" (a bare reschedule).
    pub fn from_code(code: i32) -> Option<Self> {
        if code == 0 {
            return None;
        }
        if code < 0 || code > EXCEPTION_LAST as i32 {
            return Some(Exception::Other);
        }
        Some(ALL_EXCEPTIONS[(code - 1) as usize])
    }

    /// The numeric code of this kind.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// The stable symbolic name of this kind.
    pub fn name(self) -> &'static str {
        match self {
            Exception::Yield => "Yield",
            Exception::End => "End",
            Exception::Return => "Return",
            Exception::Refuse => "Refuse",
            Exception::Other => "Other",
            Exception::Internal => "Internal",
            Exception::VmCheck => "VmCheck",
            Exception::Illegal => "Illegal",
            Exception::BadException => "BadException",
            Exception::NotImplemented => "NotImplemented",
            Exception::Memory => "Memory",
            Exception::Eof => "Eof",
            Exception::Arguments => "Arguments",
            Exception::FewArgs => "FewArgs",
            Exception::ManyArgs => "ManyArgs",
            Exception::TupleArgs => "TupleArgs",
            Exception::NoResult => "NoResult",
            Exception::NeedObject => "NeedObject",
            Exception::NeedCallable => "NeedCallable",
            Exception::NeedString => "NeedString",
            Exception::NeedEven => "NeedEven",
            Exception::WrongType => "WrongType",
            Exception::BadType => "BadType",
            Exception::CantIndex => "CantIndex",
            Exception::LowIndex => "LowIndex",
            Exception::HighIndex => "HighIndex",
            Exception::WrongIndex => "WrongIndex",
            Exception::CantRead => "CantRead",
            Exception::CantWrite => "CantWrite",
            Exception::CantDelete => "CantDelete",
            Exception::DivByZero => "DivByZero",
            Exception::Overflow => "Overflow",
            Exception::NoMetamethod => "NoMetamethod",
            Exception::NoConstructor => "NoConstructor",
            Exception::Constructor => "Constructor",
            Exception::Upvalue => "Upvalue",
            Exception::NotFound => "NotFound",
            Exception::ModuleInit => "ModuleInit",
            Exception::CastFailed => "CastFailed",
        }
    }

    /// One-line description, as shown in diagnostics.
    pub fn description(self) -> &'static str {
        DESCRIPTIONS[(self as u8 - 1) as usize]
    }

    /// True for the kinds that exist to steer the scheduler rather than to
    /// signal a script-visible error.
    pub fn is_control(self) -> bool {
        matches!(self, Exception::Yield | Exception::End | Exception::Return)
    }
}

/// All exception kinds in code order.
pub const ALL_EXCEPTIONS: [Exception; EXCEPTION_LAST as usize] = [
    Exception::Yield,
    Exception::End,
    Exception::Return,
    Exception::Refuse,
    Exception::Other,
    Exception::Internal,
    Exception::VmCheck,
    Exception::Illegal,
    Exception::BadException,
    Exception::NotImplemented,
    Exception::Memory,
    Exception::Eof,
    Exception::Arguments,
    Exception::FewArgs,
    Exception::ManyArgs,
    Exception::TupleArgs,
    Exception::NoResult,
    Exception::NeedObject,
    Exception::NeedCallable,
    Exception::NeedString,
    Exception::NeedEven,
    Exception::WrongType,
    Exception::BadType,
    Exception::CantIndex,
    Exception::LowIndex,
    Exception::HighIndex,
    Exception::WrongIndex,
    Exception::CantRead,
    Exception::CantWrite,
    Exception::CantDelete,
    Exception::DivByZero,
    Exception::Overflow,
    Exception::NoMetamethod,
    Exception::NoConstructor,
    Exception::Constructor,
    Exception::Upvalue,
    Exception::NotFound,
    Exception::ModuleInit,
    Exception::CastFailed,
];

const DESCRIPTIONS: [&str; EXCEPTION_LAST as usize] = [
    "yield",
    "end of VM work",
    "return from exception block",
    "destruction refused",
    "non-integer exception value",
    "internal error",
    "VM consistency check failed",
    "illegal instruction",
    "illegal exception value",
    "operation not implemented",
    "out of memory",
    "unexpected end of data",
    "invalid arguments",
    "too few arguments",
    "too many arguments",
    "incomplete argument tuple",
    "function has no result",
    "object required",
    "callable object required",
    "string required",
    "even number of values required",
    "wrong operand type",
    "illegal operand type",
    "object cannot be indexed",
    "index below range",
    "index above range",
    "no such index or key",
    "cannot read",
    "cannot write",
    "cannot delete",
    "division by zero",
    "arithmetic overflow",
    "metamethod not implemented",
    "class has no constructor",
    "constructor failed",
    "upvalue access failed",
    "object not found",
    "module initialization failed",
    "cast failed",
];

/// Result type for runtime core operations.
pub type VmResult<T> = std::result::Result<T, Exception>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_round_trip() {
        for (i, x) in ALL_EXCEPTIONS.iter().enumerate() {
            assert_eq!(x.code() as usize, i + 1);
            assert_eq!(Exception::from_code(x.code() as i32), Some(*x));
        }
    }

    #[test]
    fn zero_is_no_exception() {
        assert_eq!(Exception::from_code(0), None);
    }

    #[test]
    fn unknown_codes_become_other() {
        assert_eq!(Exception::from_code(-7), Some(Exception::Other));
        assert_eq!(Exception::from_code(1000), Some(Exception::Other));
    }

    #[test]
    fn names_and_descriptions_are_dense() {
        for x in ALL_EXCEPTIONS {
            assert!(!x.name().is_empty());
            assert!(!x.description().is_empty());
            assert_eq!(x.to_string(), x.description());
        }
    }
}
