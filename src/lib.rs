// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![allow(clippy::too_many_arguments)]
// - 'file/physical.rs' uses mmap to map a file into memory
// - 'runtime' calls into the platform loader and through resolved function pointers

//! # dotbind
//!
//! A post-build rewriter for .NET foreign-function declarations. `dotbind` scans a compiled
//! module for body-less native declarations and replaces each one with self-contained binding
//! code: the owning library is loaded on first use through a pluggable loader, the symbol is
//! resolved once under a per-type lock and cached in a function pointer field, and every later
//! call goes straight through that pointer. Parameters and return values carrying a marshal
//! descriptor get the matching marshaler inlined around the native call.
//!
//! ## Using the Prelude
//!
//! ```rust,no_run
//! use dotbind::prelude::*;
//! use std::path::Path;
//!
//! let support = Support::builtin()?;
//! let config = RewriteConfig::lazy();
//! let report = rewrite_file(Path::new("Native.dbm"), Path::new("Native.out.dbm"), &support, &config)?;
//! println!("rewrote {} declarations", report.declarations);
//! # Ok::<(), dotbind::Error>(())
//! ```
//!
//! ## Architecture
//!
//! - [`metadata`] - the module graph: types, members, references, signatures, method bodies,
//!   the opcode table, a label based body emitter and a reference walker
//! - [`file`] - the persisted module image, read through memory maps
//! - [`verify`] - stack depth verification of method bodies
//! - [`interop`] - the support module with loader contract, annotations and marshalers
//! - [`cloner`] - identity preserving copies of entities between modules
//! - [`filter`] - selection of the declarations to rewrite
//! - [`marshal`] - marshaler selection, settings construction and body inlining
//! - [`rewriter`] - synthesis of load routines, lazy resolvers and initializers
//! - [`processor`] - module and batch drivers, support embedding, pruning
//! - [`runtime`] - the binding semantics of the generated code, for Rust hosts
//! - [`Error`] and [`Result`] - error handling
//!
//! ## Generated code
//!
//! For a declaration `Name` in library `lib` the rewriter adds to the declaring type:
//!
//! | Member | Purpose |
//! |--------|---------|
//! | `_<lib>` | cached library handle |
//! | `<Load_lib>` | loads the library once, throws `DllNotFoundException` on failure |
//! | `_<Name_fnptr>` | the function pointer every call goes through |
//! | `<Name_Lazy>` | lazy resolver with the native signature, initial pointer target |
//! | `<InitName>` | stores the initial pointer |
//! | `_<lockObject>`, `<Init>` | lock object and type initializer shared by all declarations |

#[macro_use]
pub(crate) mod error;

/// Identity preserving copies of entities between modules
pub mod cloner;
/// Module image input and output
pub mod file;
/// Selection of the declarations to rewrite
pub mod filter;
/// The support module shipped with the rewriter
pub mod interop;
/// Marshaling pipeline injection
pub mod marshal;
/// The in-memory module graph
pub mod metadata;
/// Commonly used types
pub mod prelude;
/// Module and batch drivers
pub mod processor;
/// Foreign-call rewriting
pub mod rewriter;
/// Binding runtime for Rust hosts
pub mod runtime;
/// Stack depth verification
pub mod verify;

pub use error::Error;
/// `dotbind` Result type
pub type Result<T> = std::result::Result<T, Error>;

pub use filter::{FilterPolicy, FilterStrategy};
pub use interop::Support;
pub use metadata::module::Module;
pub use processor::{rewrite_file, rewrite_files, ModuleProcessor, RewriteConfig, RewriteReport};
