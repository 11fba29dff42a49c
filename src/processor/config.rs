//! Rewrite configuration.

use std::{fmt, sync::Arc};

use crate::{
    filter::{FilterPolicy, FilterStrategy},
    rewriter::BindingMode,
};

/// How modules are rewritten.
///
/// The defaults match the command line without flags: annotations can exclude types and
/// declarations, the support types are embedded and symbols are bound lazily.
#[derive(Clone)]
pub struct RewriteConfig {
    /// Selects the declarations to rewrite
    pub filter: Arc<dyn FilterStrategy>,
    /// Embed the support types instead of referencing the support assembly
    pub embed: bool,
    /// When symbols are resolved
    pub binding: BindingMode,
}

impl fmt::Debug for RewriteConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RewriteConfig")
            .field("embed", &self.embed)
            .field("binding", &self.binding)
            .finish_non_exhaustive()
    }
}

impl Default for RewriteConfig {
    fn default() -> Self {
        Self {
            filter: Arc::new(FilterPolicy::Exclude),
            embed: true,
            binding: BindingMode::Lazy,
        }
    }
}

impl RewriteConfig {
    /// Lazy binding, the default.
    #[must_use]
    pub fn lazy() -> Self {
        Self::default()
    }

    /// Every symbol is resolved from the static constructor of its declaring type.
    #[must_use]
    pub fn eager() -> Self {
        Self {
            binding: BindingMode::Eager,
            ..Self::default()
        }
    }

    /// Replaces the filter.
    #[must_use]
    pub fn with_filter<F: FilterStrategy + 'static>(mut self, filter: F) -> Self {
        self.filter = Arc::new(filter);
        self
    }

    /// Sets whether the support types are embedded.
    #[must_use]
    pub fn with_embed(mut self, embed: bool) -> Self {
        self.embed = embed;
        self
    }

    /// Sets the binding mode.
    #[must_use]
    pub fn with_binding(mut self, binding: BindingMode) -> Self {
        self.binding = binding;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets() {
        let lazy = RewriteConfig::lazy();
        assert!(lazy.embed);
        assert_eq!(lazy.binding, BindingMode::Lazy);

        let eager = RewriteConfig::eager().with_embed(false);
        assert!(!eager.embed);
        assert_eq!(eager.binding, BindingMode::Eager);
        assert_eq!(
            format!("{eager:?}"),
            "RewriteConfig { embed: false, binding: Eager, .. }"
        );
    }
}
