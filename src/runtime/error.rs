use thiserror::Error;

/// Why a binding could not be resolved.
///
/// Both kinds carry the text the loader reported for the failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BindingError {
    /// The library could not be loaded.
    #[error("dotbind: cannot load {library}: {message}")]
    LibraryNotFound {
        /// Library name as declared
        library: String,
        /// Loader error text
        message: String,
    },

    /// The library was loaded but does not export the symbol.
    #[error("dotbind: cannot resolve {symbol} in {library}: {message}")]
    SymbolNotFound {
        /// Library name as declared
        library: String,
        /// Entry point
        symbol: String,
        /// Loader error text
        message: String,
    },
}
