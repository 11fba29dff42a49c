//! Names of the members synthesized next to a declaration.

use std::collections::HashMap;

use crate::metadata::{module::Module, token::TypeId};

/// Shared lock object of a declaring type.
pub const LOCK_FIELD: &str = "_<lockObject>";
/// Type initializer called from the static constructor.
pub const TYPE_INIT: &str = "<Init>";

/// `_<Name_fnptr>`
#[must_use]
pub fn function_pointer(name: &str) -> String {
    format!("_<{name}_fnptr>")
}

/// `<Name_Lazy>`
#[must_use]
pub fn lazy_resolver(name: &str) -> String {
    format!("<{name}_Lazy>")
}

/// `<InitName>`
#[must_use]
pub fn initializer(name: &str) -> String {
    format!("<Init{name}>")
}

/// `_<lib>`
#[must_use]
pub fn library_handle(library: &str) -> String {
    format!("_<{library}>")
}

/// `<Load_lib>`
#[must_use]
pub fn library_loader(library: &str) -> String {
    format!("<Load_{library}>")
}

/// Returns `base`, or `base_1`, `base_2`, ... if a member of `owner` already has that name.
#[must_use]
pub fn unique(module: &Module, owner: TypeId, base: &str) -> String {
    let ty = module.ty(owner);
    let taken = |name: &str| {
        ty.methods.iter().any(|id| module.method(*id).name == name)
            || ty.fields.iter().any(|id| module.field(*id).name == name)
    };
    if !taken(base) {
        return base.to_string();
    }
    (1..)
        .map(|ordinal| format!("{base}_{ordinal}"))
        .find(|name| !taken(name))
        .unwrap_or_else(|| base.to_string())
}

/// Hands out `Name`, `Name_1`, `Name_2`, ... for declarations sharing a name.
#[derive(Debug, Default)]
pub struct Ordinals {
    seen: HashMap<String, usize>,
}

impl Ordinals {
    /// The disambiguated name of the next declaration called `name`.
    pub fn next(&mut self, name: &str) -> String {
        let count = self.seen.entry(name.to_string()).or_insert(0);
        let assigned = match *count {
            0 => name.to_string(),
            ordinal => format!("{name}_{ordinal}"),
        };
        *count += 1;
        assigned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{
        attributes::{FieldAttributes, TypeAttributes},
        members::{FieldDef, TypeDef},
        typesystem::TypeSig,
    };

    #[test]
    fn mangled_names() {
        assert_eq!(function_pointer("puts"), "_<puts_fnptr>");
        assert_eq!(lazy_resolver("puts_1"), "<puts_1_Lazy>");
        assert_eq!(initializer("puts"), "<Initputs>");
        assert_eq!(library_handle("libc.so.6"), "_<libc.so.6>");
        assert_eq!(library_loader("libc.so.6"), "<Load_libc.so.6>");
    }

    #[test]
    fn overloads_get_ordinals() {
        let mut ordinals = Ordinals::default();
        assert_eq!(ordinals.next("write"), "write");
        assert_eq!(ordinals.next("read"), "read");
        assert_eq!(ordinals.next("write"), "write_1");
        assert_eq!(ordinals.next("write"), "write_2");
    }

    #[test]
    fn unique_skips_taken_members() {
        let mut module = Module::new("App.dll", "App");
        let owner = module.add_type(TypeDef::new("App", "Native", TypeAttributes::PUBLIC, None));
        assert_eq!(unique(&module, owner, "_<libc>"), "_<libc>");
        module.add_field(FieldDef::new(owner, "_<libc>", FieldAttributes::STATIC, TypeSig::I));
        assert_eq!(unique(&module, owner, "_<libc>"), "_<libc>_1");
    }
}
