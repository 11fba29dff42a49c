//! The marshalers available to a target module, indexed by native representation.

use crate::{
    interop::{Home, Imports, CUSTOM_MARSHALER_ADAPTER, INTEROP_NAMESPACE, MARSHALER_TYPE_ATTRIBUTE},
    metadata::{module::Module, token::TypeId},
};

/// Native representations a marshaler type declares through `MarshalerTypeAttribute`.
#[must_use]
pub fn declared_representations(module: &Module, id: TypeId) -> Vec<u8> {
    module
        .attributes_of(&module.ty(id).custom_attributes, INTEROP_NAMESPACE, MARSHALER_TYPE_ATTRIBUTE)
        .filter_map(|attribute| attribute.fixed_args.first().and_then(|arg| arg.as_integer()))
        .filter_map(|value| u8::try_from(value).ok())
        .collect()
}

/// One marshaler of the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Where the marshaler is defined
    pub home: Home,
    /// Representations it declares
    pub representations: Vec<u8>,
}

/// Marshalers in lookup order: support marshalers first, then those of the target, each in
/// declaration order.
///
/// Generic marshalers are only reachable through a custom marshaler descriptor and are left
/// out.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    entries: Vec<Entry>,
}

impl Catalog {
    /// Collects the marshalers visible from `target`.
    #[must_use]
    pub fn build(imports: &Imports<'_>, target: &Module) -> Catalog {
        let mut support_entries = Vec::new();
        let mut target_entries = Vec::new();

        if !imports.embeds() {
            let module = imports.support().module();
            support_entries.extend(entries(module, Home::Support));
        }
        for entry in entries(target, Home::Target) {
            let Home::Target(id) = entry.home else {
                continue;
            };
            if target.ty(id).namespace == INTEROP_NAMESPACE {
                support_entries.push(entry);
            } else {
                target_entries.push(entry);
            }
        }
        support_entries.extend(target_entries);
        Catalog {
            entries: support_entries,
        }
    }

    /// The first marshaler declaring `native_type`.
    #[must_use]
    pub fn select(&self, native_type: u8) -> Option<&Entry> {
        self.entries
            .iter()
            .find(|entry| entry.representations.contains(&native_type))
    }

    /// All entries in lookup order.
    #[must_use]
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }
}

fn entries(module: &Module, home: fn(TypeId) -> Home) -> Vec<Entry> {
    module
        .type_ids()
        .filter(|id| {
            let ty = module.ty(*id);
            ty.generic_params.is_empty() && ty.name != CUSTOM_MARSHALER_ADAPTER
        })
        .filter_map(|id| {
            let representations = declared_representations(module, id);
            (!representations.is_empty()).then(|| Entry {
                home: home(id),
                representations,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        interop::{Support, CSTRING_MARSHALER},
        metadata::marshalling::NATIVE_TYPE,
        Result,
    };

    #[test]
    fn string_representations_select_the_cstring_marshaler() -> Result<()> {
        let support = Support::builtin()?;
        let target = Module::new("App.dll", "App");
        let imports = Imports::new(&support, false);
        let catalog = Catalog::build(&imports, &target);
        let cstring = support.find(CSTRING_MARSHALER).map(Home::Support);
        for native_type in [NATIVE_TYPE::LPSTR, NATIVE_TYPE::LPWSTR, NATIVE_TYPE::LPUTF8STR] {
            assert_eq!(catalog.select(native_type).map(|entry| entry.home), cstring);
        }
        assert!(catalog.select(NATIVE_TYPE::BSTR).is_none());
        assert!(catalog.select(NATIVE_TYPE::CUSTOMMARSHALER).is_none());
        Ok(())
    }

    #[test]
    fn embedded_support_marshalers_come_first() -> Result<()> {
        let support = Support::builtin()?;
        let mut target = Module::new("App.dll", "App");
        let mut imports = Imports::new(&support, true);
        imports.embed_all(&mut target)?;
        let catalog = Catalog::build(&imports, &target);
        let first = catalog.entries().first().map(|entry| entry.home);
        let expected = target.find_type(INTEROP_NAMESPACE, CSTRING_MARSHALER).map(Home::Target);
        assert_eq!(first, expected);
        Ok(())
    }
}
