//! # EEL runtime core
//!
//! The runtime core of the EEL scripting language: the value and object
//! model, the reference-counted memory manager with weak references, the
//! register-based bytecode virtual machine with its call and exception
//! machinery, and the built-in container and string classes the VM depends
//! on.
//!
//! The compiler is an external collaborator: this crate consumes compiled
//! functions (bytecode plus constant pools and arity metadata) and class
//! registrations, and exposes value construction, object lifecycle,
//! metamethod dispatch, function invocation and exception propagation.
//!
//! ## Architecture
//!
//! - **[`Vm`]**: one VM instance owning its heap, object slab, class table,
//!   cast matrix and string pool. Instances share nothing.
//! - **[`Value`]**: the seven-case tagged union all registers and container
//!   slots hold. Plain data; ownership is explicit through the memory
//!   manager.
//! - **[`Exception`]**: the dense enumeration thrown integers map onto;
//!   also the error type of every fallible core operation.
//! - **[`Opcode`]**: the instruction set, with statically determined
//!   operand layouts.
//! - **[`FunctionBuilder`]**: how embedders (and tests) assemble bytecode
//!   functions in lieu of the external compiler.
//!
//! ## Example
//!
//! ```no_run
//! use eel_vm::{Arg, Vm, VmConfig};
//!
//! # fn example() -> eel_vm::VmResult<()> {
//! let mut vm = Vm::open(VmConfig::default())?;
//! let module = vm.create_module("main")?;
//! // ... attach compiled functions to the module ...
//! let result = vm.call_named(module, "main", &[Arg::Int(42)], true)?;
//! if let Some(v) = result {
//!     println!("result: {}", vm.value_repr(&v));
//!     vm.disown_value(v);
//! }
//! # Ok(())
//! # }
//! ```

/// Bytecode assembly and disassembly.
pub mod asm;
/// The array class.
pub mod array;
/// The typecast matrix.
pub mod cast;
/// Class registry and metamethod dispatch.
pub mod class;
/// Runtime configuration.
pub mod config;
/// The mutable byte-string class.
pub mod dstring;
/// Exception kinds and results.
pub mod error;
/// The function class.
pub mod function;
/// Object slab, reference counting, weak references, limbo lists.
pub mod memory;
/// The diagnostic message log.
pub mod messages;
/// The module class and module GC.
pub mod module;
/// Object headers and payloads.
pub mod object;
/// Instruction encoding.
pub mod opcode;
/// Operator evaluation.
pub mod operate;
/// The interned string class and string pool.
pub mod strings;
/// The table class.
pub mod table;
/// The value representation.
pub mod value;
/// Typed numeric vectors.
pub mod vector;
/// The virtual machine.
pub mod vm;

pub use asm::FunctionBuilder;
pub use class::{CastSelector, ClassId, Metamethod};
pub use config::{LoadFlags, VmConfig};
pub use error::{Exception, VmResult};
pub use function::{FunctionFlags, NativeCallback};
pub use messages::{Message, MessageKind, MessageLog};
pub use object::{CellAddr, Object, ObjectLink, Payload};
pub use opcode::{Opcode, OperandLayout};
pub use operate::Operator;
pub use value::{ObjId, Value};
pub use vm::{Arg, CallFrame, FrameFlags, LoaderCallback, Vm};
