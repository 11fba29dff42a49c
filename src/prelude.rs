//! # dotbind Prelude
//!
//! Re-exports of the types most callers need to load, rewrite and inspect modules.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all dotbind operations
pub use crate::Error;

/// The result type used throughout dotbind
pub use crate::Result;

// ================================================================================================
// Main Entry Points
// ================================================================================================

/// The module graph
pub use crate::Module;

/// The support module
pub use crate::Support;

/// Drivers and their configuration
pub use crate::processor::{
    rewrite_file, rewrite_files, BindingMode, ModuleProcessor, RewriteConfig, RewriteReport,
};

/// Declaration selection
pub use crate::filter::{Candidate, FilterPolicy, FilterStrategy};

// ================================================================================================
// Metadata
// ================================================================================================

/// Row identifiers
pub use crate::metadata::token::{
    AssemblyRefId, FieldId, MemberRefId, MethodId, ModuleRefId, PropertyId, TypeId, TypeRefId,
};

/// Signatures
pub use crate::metadata::typesystem::{CallingConvention, MethodSig, TypeSig};

/// Definitions
pub use crate::metadata::members::{FieldDef, MethodDef, ParamDef, PropertyDef, TypeDef};

/// References and handles
pub use crate::metadata::references::{
    AssemblyRef, FieldHandle, MemberRef, MethodHandle, ResolutionScope, TypeRef, Version,
};

/// Attribute flags
pub use crate::metadata::attributes::{
    FieldAttributes, MemberAccess, MethodAttributes, MethodImplAttributes, TypeAttributes,
};

/// Native declarations and marshal descriptors
pub use crate::metadata::{
    marshalling::{MarshalInfo, NATIVE_TYPE},
    pinvoke::{CharSet, PInvokeAttributes, PInvokeInfo},
};

/// Custom attributes
pub use crate::metadata::customattributes::{AttributeArgument, CustomAttribute};

/// Method bodies
pub use crate::metadata::{
    body::{Instruction, MethodBody, Operand},
    emitter::BodyEmitter,
    opcodes::OpCode,
};

// ================================================================================================
// Runtime
// ================================================================================================

/// Binding runtime
pub use crate::runtime::{BindingError, BindingScope, LazyBinding, LibraryLoader};
