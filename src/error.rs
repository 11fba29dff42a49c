use thiserror::Error;

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

macro_rules! out_of_bounds_error {
    () => {
        crate::Error::OutOfBounds {
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// Every error produced while rewriting is fatal for the module being processed: the
/// orchestration layer never writes a partially rewritten module. The variants are grouped
/// by the stage that raises them.
///
/// # Error Categories
///
/// ## Image Errors
/// - [`Error::Malformed`] - Corrupted or invalid module image
/// - [`Error::OutOfBounds`] - Attempted to read beyond the image boundaries
/// - [`Error::NotSupported`] - Unknown image magic or format version
/// - [`Error::PortableExecutable`] - A PE/CLI file was given where a metadata image is expected
/// - [`Error::FileError`] - Filesystem I/O errors
///
/// ## Graph Resolution Errors
/// - [`Error::TypeNotFound`] - A referenced type has no definition where it should have one
/// - [`Error::MemberNotFound`] - A referenced method, field or property is missing
/// - [`Error::AmbiguousMatch`] - More than one candidate matched a lookup
/// - [`Error::MissingFactory`] - A loader or marshaler lacks its `GetInstance(string)` factory
/// - [`Error::SettingsConstruction`] - No settings constructor could be satisfied
///
/// ## Declarative Errors
/// - [`Error::UnsupportedCallingConvention`] - The native descriptor names an unusable convention
/// - [`Error::UnsupportedRepresentation`] - No marshaler covers a requested native representation
/// - [`Error::MissingDescriptor`] - A body-less method has no native descriptor
///
/// ## Code Generation Errors
/// - [`Error::InvalidMarshalerBody`] - A marshaler body cannot be inlined
/// - [`Error::InvalidBody`] - A method body failed stack verification
///
/// # Examples
///
/// ```rust,no_run
/// use dotbind::{Error, Module};
/// use std::path::Path;
///
/// match Module::from_file(Path::new("Native.dbm")) {
///     Ok(module) => println!("loaded {}", module.name),
///     Err(Error::Malformed { message, file, line }) => {
///         eprintln!("Malformed image: {} ({}:{})", message, file, line);
///     }
///     Err(e) => eprintln!("Other error: {}", e),
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// The module image is damaged and could not be parsed.
    ///
    /// The error includes the source location where the malformation was detected.
    ///
    /// # Fields
    ///
    /// * `message` - Detailed description of what was malformed
    /// * `file` - Source file where the error was detected
    /// * `line` - Source line where the error was detected
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// An out of bound access was attempted while parsing the image.
    #[error("Out of Bound read would have occurred - {file}:{line}")]
    OutOfBounds {
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// The image format is not supported.
    ///
    /// Raised for a wrong magic value or an image written by a newer format version.
    #[error("This file type is not supported")]
    NotSupported,

    /// The file is a PE/CLI executable rather than a metadata image.
    ///
    /// Compiled assemblies have to be exported to a metadata image before they can be
    /// rewritten, and the result imported back.
    #[error("PE/CLI executables are not read directly, export the module to a metadata image first")]
    PortableExecutable,

    /// File I/O error.
    #[error("{0}")]
    FileError(#[from] std::io::Error),

    /// A type reference could not be resolved to its defining type.
    ///
    /// Carries the fully qualified name of the missing type.
    #[error("Type not found - {0}")]
    TypeNotFound(String),

    /// A method, field or property could not be found on its owner.
    ///
    /// # Fields
    ///
    /// * `owner` - Fully qualified name of the owning type
    /// * `member` - Name of the member that was searched for
    #[error("Member not found - {owner}::{member}")]
    MemberNotFound {
        /// The type that was searched
        owner: String,
        /// The member name that was searched for
        member: String,
    },

    /// A lookup that must be unique matched more than one candidate.
    #[error("Ambiguous match - {0}")]
    AmbiguousMatch(String),

    /// A loader or marshaler type does not expose `static GetInstance(string)`.
    #[error("Missing factory method - {0} does not define a static GetInstance(string)")]
    MissingFactory(String),

    /// The native descriptor requests a calling convention that cannot be expressed as an
    /// unmanaged call site.
    #[error("Unsupported calling convention on {method}: {convention}")]
    UnsupportedCallingConvention {
        /// The declaration being rewritten
        method: String,
        /// The rejected convention
        convention: String,
    },

    /// No marshaler supports the native representation requested by a slot.
    #[error("Unsupported representation on {slot}: {representation}")]
    UnsupportedRepresentation {
        /// The parameter or return slot description
        slot: String,
        /// The requested native representation
        representation: String,
    },

    /// A method without a body carries no native descriptor and cannot be rewritten.
    #[error("Missing native descriptor - {0}")]
    MissingDescriptor(String),

    /// None of the constructors of a marshaler settings type could be satisfied from the
    /// rewrite context.
    #[error("Cannot construct marshaler settings {0}")]
    SettingsConstruction(String),

    /// A marshaler conversion body cannot be spliced into a call site.
    #[error("Invalid marshaler body in {method}: {reason}")]
    InvalidMarshalerBody {
        /// The marshaler method whose body was rejected
        method: String,
        /// What made the body unusable
        reason: String,
    },

    /// A method body failed stack verification.
    #[error("Invalid method body in {method} at IL_{offset:04x}: {reason}")]
    InvalidBody {
        /// The method whose body was rejected
        method: String,
        /// Offset of the offending instruction
        offset: u32,
        /// What the verifier rejected
        reason: String,
    },

    /// The rewrite configuration or the batch job description is unusable.
    #[error("Configuration error - {0}")]
    Configuration(String),

    /// Generic error for miscellaneous failures.
    #[error("{0}")]
    Error(String),
}
