//! In-memory representation of program modules.
//!
//! This module contains the metadata graph everything else in the crate operates on: the
//! module with its definition and reference tables, type and method signatures, decoded custom
//! attributes, native declaration and marshal descriptors, and method bodies with their
//! instruction set.
//!
//! # Key Components
//!
//! - [`module`] - The [`Module`](module::Module) graph, lookups and deduplicating imports
//! - [`typesystem`] - [`TypeSig`](typesystem::TypeSig) and [`MethodSig`](typesystem::MethodSig)
//! - [`body`] - Method bodies keyed by instruction offset
//! - [`opcodes`] - The CIL instruction table
//! - [`emitter`] - Label based body construction
//! - [`walk`] - Reference traversal, retargeting and pruning
//!
//! # Examples
//!
//! ```rust
//! use dotbind::metadata::{
//!     attributes::{MethodAttributes, TypeAttributes},
//!     members::{MethodDef, TypeDef},
//!     module::Module,
//!     typesystem::{MethodSig, TypeSig},
//! };
//!
//! let mut module = Module::new("Native.dll", "Native");
//! let object = module.core_type("System", "Object", false);
//! let owner = module.add_type(TypeDef::new("Native", "Libc", TypeAttributes::PUBLIC, Some(object)));
//! module.add_method(MethodDef::new(
//!     owner,
//!     "getpid",
//!     MethodAttributes::STATIC | MethodAttributes::PINVOKE_IMPL,
//!     MethodSig::new_static(TypeSig::I4, vec![]),
//! ));
//! assert_eq!(module.methods_named(owner, "getpid").len(), 1);
//! ```

/// Attribute bitmasks of types, members and parameters
pub mod attributes;
/// Method bodies, instructions, locals and exception handlers
pub mod body;
/// Decoded custom attributes
pub mod customattributes;
/// Label based method body construction
pub mod emitter;
/// Marshal descriptors
pub mod marshalling;
/// Type, method, field and property definitions
pub mod members;
/// The module graph
pub mod module;
/// The CIL opcode table
pub mod opcodes;
/// Native declaration descriptors
pub mod pinvoke;
/// Type, member, module and assembly references
pub mod references;
/// Typed row ids
pub mod token;
/// Type and method signatures
pub mod typesystem;
/// Reference traversal
pub mod walk;
