use std::{
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex, PoisonError,
    },
};

use dashmap::DashMap;

use super::{BindingError, LibraryLoader};

/// A declared symbol of a [`BindingScope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LazyBinding {
    index: usize,
}

impl LazyBinding {
    /// Position of the binding in declaration order.
    #[must_use]
    pub fn index(self) -> usize {
        self.index
    }
}

struct Slot {
    library: String,
    symbol: String,
    address: AtomicUsize,
}

/// A set of lazily resolved symbols sharing one loader, one handle cache and one lock.
pub struct BindingScope<L: LibraryLoader> {
    loader: L,
    prepared: AtomicBool,
    handles: DashMap<String, NonZeroUsize>,
    slots: boxcar::Vec<Slot>,
    cold: Mutex<()>,
}

impl<L: LibraryLoader> BindingScope<L> {
    /// Creates an empty scope.
    pub fn new(loader: L) -> Self {
        BindingScope {
            loader,
            prepared: AtomicBool::new(false),
            handles: DashMap::new(),
            slots: boxcar::Vec::new(),
            cold: Mutex::new(()),
        }
    }

    /// The loader of this scope.
    pub fn loader(&self) -> &L {
        &self.loader
    }

    /// Declares `symbol` of `library` without resolving it.
    pub fn declare(&self, library: &str, symbol: &str) -> LazyBinding {
        let index = self.slots.push(Slot {
            library: library.to_string(),
            symbol: symbol.to_string(),
            address: AtomicUsize::new(0),
        });
        LazyBinding { index }
    }

    /// Number of declared bindings.
    pub fn len(&self) -> usize {
        self.slots.count()
    }

    /// Returns `true` if nothing was declared.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` once `binding` has been resolved successfully.
    pub fn is_resolved(&self, binding: LazyBinding) -> bool {
        self.slots
            .get(binding.index)
            .is_some_and(|slot| slot.address.load(Ordering::Acquire) != 0)
    }

    /// The address of `binding`, resolving it on first use.
    ///
    /// Concurrent first calls resolve once; the others wait on the scope lock and observe the
    /// published address.
    ///
    /// # Errors
    /// [`BindingError::LibraryNotFound`] or [`BindingError::SymbolNotFound`]. Nothing is
    /// cached for a failure.
    ///
    /// # Panics
    /// If `binding` was declared by another scope with fewer bindings.
    pub fn resolve(&self, binding: LazyBinding) -> Result<NonZeroUsize, BindingError> {
        let slot = &self.slots[binding.index];
        if let Some(address) = NonZeroUsize::new(slot.address.load(Ordering::Acquire)) {
            return Ok(address);
        }

        let _guard = self.cold.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(address) = NonZeroUsize::new(slot.address.load(Ordering::Acquire)) {
            return Ok(address);
        }
        if !self.prepared.swap(true, Ordering::AcqRel) {
            self.loader.prepare();
        }

        let library = self.library(&slot.library)?;
        let address = self
            .loader
            .get_proc_address(library, &slot.symbol)
            .ok_or_else(|| BindingError::SymbolNotFound {
                library: slot.library.clone(),
                symbol: slot.symbol.clone(),
                message: self.loader.error(),
            })?;
        slot.address.store(address.get(), Ordering::Release);
        log::debug!("bound {} in {}", slot.symbol, slot.library);
        Ok(address)
    }

    /// Resolves every declared binding, stopping at the first failure.
    ///
    /// # Errors
    /// See [`BindingScope::resolve`].
    pub fn resolve_all(&self) -> Result<(), BindingError> {
        for (index, _) in &self.slots {
            self.resolve(LazyBinding { index })?;
        }
        Ok(())
    }

    /// The cached handle of `library`, loading it first if needed. Called under the lock.
    fn library(&self, library: &str) -> Result<NonZeroUsize, BindingError> {
        if let Some(handle) = self.handles.get(library) {
            return Ok(*handle);
        }
        let handle = self
            .loader
            .load_library(library)
            .ok_or_else(|| BindingError::LibraryNotFound {
                library: library.to_string(),
                message: self.loader.error(),
            })?;
        self.handles.insert(library.to_string(), handle);
        Ok(handle)
    }
}

impl<L: LibraryLoader> Drop for BindingScope<L> {
    fn drop(&mut self) {
        for entry in self.handles.iter() {
            self.loader.free_library(*entry.value());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashSet,
        sync::{atomic::AtomicUsize, Arc, Barrier},
        thread,
    };

    use super::*;

    /// Resolves `lib`'s symbols to fixed addresses and counts every call.
    #[derive(Default)]
    struct CountingLoader {
        loads: AtomicUsize,
        lookups: AtomicUsize,
        prepares: AtomicUsize,
        frees: Arc<AtomicUsize>,
        missing: Mutex<HashSet<String>>,
    }

    impl LibraryLoader for CountingLoader {
        fn load_library(&self, name: &str) -> Option<NonZeroUsize> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            (name == "lib").then_some(NonZeroUsize::MIN)
        }

        fn get_proc_address(&self, _: NonZeroUsize, symbol: &str) -> Option<NonZeroUsize> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            if self.missing.lock().unwrap().contains(symbol) {
                return None;
            }
            NonZeroUsize::new(0x1000 + symbol.len())
        }

        fn free_library(&self, _: NonZeroUsize) -> bool {
            self.frees.fetch_add(1, Ordering::SeqCst);
            true
        }

        fn error(&self) -> String {
            "not here".to_string()
        }

        fn prepare(&self) {
            self.prepares.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn concurrent_first_calls_resolve_once() {
        let scope = Arc::new(BindingScope::new(CountingLoader::default()));
        let binding = scope.declare("lib", "sym");
        let barrier = Arc::new(Barrier::new(8));

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let scope = Arc::clone(&scope);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    scope.resolve(binding)
                })
            })
            .collect();
        for worker in workers {
            assert_eq!(worker.join().unwrap().map(NonZeroUsize::get), Ok(0x1003));
        }

        assert_eq!(scope.loader().loads.load(Ordering::SeqCst), 1);
        assert_eq!(scope.loader().lookups.load(Ordering::SeqCst), 1);
        assert_eq!(scope.loader().prepares.load(Ordering::SeqCst), 1);
        assert!(scope.is_resolved(binding));
    }

    #[test]
    fn bindings_share_the_library_handle() {
        let frees = Arc::new(AtomicUsize::new(0));
        let scope = BindingScope::new(CountingLoader {
            frees: Arc::clone(&frees),
            ..CountingLoader::default()
        });
        scope.declare("lib", "a");
        scope.declare("lib", "bb");
        assert_eq!(scope.len(), 2);
        assert!(scope.resolve_all().is_ok());
        assert_eq!(scope.loader().loads.load(Ordering::SeqCst), 1);
        assert_eq!(scope.loader().lookups.load(Ordering::SeqCst), 2);

        drop(scope);
        assert_eq!(frees.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failures_are_not_cached() {
        let scope = BindingScope::new(CountingLoader::default());
        scope.loader().missing.lock().unwrap().insert("late".to_string());
        let late = scope.declare("lib", "late");

        assert_eq!(
            scope.resolve(late),
            Err(BindingError::SymbolNotFound {
                library: "lib".to_string(),
                symbol: "late".to_string(),
                message: "not here".to_string(),
            })
        );
        assert!(!scope.is_resolved(late));

        scope.loader().missing.lock().unwrap().clear();
        assert!(scope.resolve(late).is_ok());
        assert_eq!(scope.loader().lookups.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unknown_libraries_are_retried() {
        let scope = BindingScope::new(CountingLoader::default());
        let binding = scope.declare("other", "sym");
        for _ in 0..2 {
            assert!(matches!(
                scope.resolve(binding),
                Err(BindingError::LibraryNotFound { ref library, .. }) if library == "other"
            ));
        }
        assert_eq!(scope.loader().loads.load(Ordering::SeqCst), 2);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn resolved_addresses_are_callable() {
        use crate::{interop::LOADER_SENTINEL, runtime::PlatformLoader};

        let scope = BindingScope::new(PlatformLoader::new());
        let abs = scope.declare(LOADER_SENTINEL, "abs");
        let address = scope.resolve(abs).unwrap();
        let abs: extern "C" fn(i32) -> i32 = unsafe { std::mem::transmute(address.get()) };
        assert_eq!(abs(-7), 7);

        let missing = scope.declare(LOADER_SENTINEL, "dotbind_no_such_symbol");
        assert!(matches!(scope.resolve(missing), Err(BindingError::SymbolNotFound { .. })));
    }
}
