//! Binding runtime for Rust hosts.
//!
//! The rewritten code binds symbols through an `ILibraryLoader` under a per-type lock. This
//! module offers the same semantics to Rust code: a [`LibraryLoader`] contract with a
//! [`PlatformLoader`] over `dlopen` or `LoadLibraryW`, and a [`BindingScope`] that plays the
//! role of one rewritten type. A scope hands out [`LazyBinding`]s; the first [`BindingScope::resolve`] of a binding loads
//! the library once per scope, looks up the symbol and publishes the address, every later
//! resolve is a single atomic load. Failures are reported as [`BindingError`] and never
//! cached, so a later attempt retries.
//!
//! [`CStringMarshaler`] mirrors the C-string marshaler of the support module for hosts that
//! call the resolved functions directly.
//!
//! # Example
//!
//! ```rust,no_run
//! # #[cfg(unix)]
//! # fn main() -> Result<(), dotbind::runtime::BindingError> {
//! use dotbind::runtime::{BindingScope, PlatformLoader};
//!
//! let scope = BindingScope::new(PlatformLoader::new());
//! let cos = scope.declare("libm.so.6", "cos");
//! let address = scope.resolve(cos)?;
//! let cos: extern "C" fn(f64) -> f64 = unsafe { std::mem::transmute(address.get()) };
//! assert_eq!(cos(0.0), 1.0);
//! # Ok(())
//! # }
//! # #[cfg(not(unix))]
//! # fn main() {}
//! ```

mod error;
mod loader;
mod scope;
mod strings;

pub use error::BindingError;
#[cfg(any(unix, windows))]
pub use loader::PlatformLoader;
pub use loader::LibraryLoader;
pub use scope::{BindingScope, LazyBinding};
pub use strings::{CStringMarshaler, NativeString, StringEncoding};
