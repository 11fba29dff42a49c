use std::num::NonZeroUsize;

/// The loader contract every binding goes through.
///
/// Mirrors `ILibraryLoader` of the support module. Handles and addresses are opaque non-zero
/// words; `None` signals a failure whose description [`LibraryLoader::error`] returns.
pub trait LibraryLoader: Send + Sync {
    /// Loads `name`, or the running program for the `"<loader>"` sentinel.
    fn load_library(&self, name: &str) -> Option<NonZeroUsize>;

    /// Looks up `symbol` in a loaded library.
    fn get_proc_address(&self, library: NonZeroUsize, symbol: &str) -> Option<NonZeroUsize>;

    /// Releases a library handle.
    fn free_library(&self, library: NonZeroUsize) -> bool;

    /// Describes the most recent failure.
    fn error(&self) -> String;

    /// Called once per scope before the first binding is resolved.
    fn prepare(&self) {}
}

#[cfg(unix)]
mod platform {
    use std::{
        ffi::{CStr, CString},
        num::NonZeroUsize,
        ptr,
    };

    use crate::interop::LOADER_SENTINEL;

    use super::LibraryLoader;

    /// `dlopen`/`dlsym` based loader, the counterpart of `LibLoader`.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct PlatformLoader;

    impl PlatformLoader {
        /// Creates the loader.
        #[must_use]
        pub fn new() -> Self {
            PlatformLoader
        }
    }

    impl LibraryLoader for PlatformLoader {
        fn load_library(&self, name: &str) -> Option<NonZeroUsize> {
            let handle = if name == LOADER_SENTINEL {
                unsafe { libc::dlopen(ptr::null(), libc::RTLD_NOW) }
            } else {
                let path = CString::new(name).ok()?;
                unsafe { libc::dlopen(path.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL) }
            };
            NonZeroUsize::new(handle as usize)
        }

        fn get_proc_address(&self, library: NonZeroUsize, symbol: &str) -> Option<NonZeroUsize> {
            let symbol = CString::new(symbol).ok()?;
            let address = unsafe { libc::dlsym(library.get() as *mut libc::c_void, symbol.as_ptr()) };
            NonZeroUsize::new(address as usize)
        }

        fn free_library(&self, library: NonZeroUsize) -> bool {
            unsafe { libc::dlclose(library.get() as *mut libc::c_void) == 0 }
        }

        fn error(&self) -> String {
            // dlerror clears the message it returns
            let message = unsafe { libc::dlerror() };
            if message.is_null() {
                "unknown error".to_string()
            } else {
                unsafe { CStr::from_ptr(message) }.to_string_lossy().into_owned()
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn the_program_exports_libc() {
            let loader = PlatformLoader::new();
            let program = loader.load_library(LOADER_SENTINEL);
            assert!(program.is_some());
            let abs = program.and_then(|handle| loader.get_proc_address(handle, "abs"));
            assert!(abs.is_some());
        }

        #[test]
        fn missing_libraries_describe_themselves() {
            let loader = PlatformLoader::new();
            assert!(loader.load_library("libdoes-not-exist.so.42").is_none());
            assert!(loader.error().contains("libdoes-not-exist.so.42"));
            assert!(loader.load_library("nul\0inside").is_none());
        }
    }
}

#[cfg(windows)]
mod platform {
    use std::{
        ffi::{c_char, c_void, CString},
        num::NonZeroUsize,
        ptr,
    };

    use widestring::U16CString;

    use crate::interop::LOADER_SENTINEL;

    use super::LibraryLoader;

    const FORMAT_MESSAGE_IGNORE_INSERTS: u32 = 0x0000_0200;
    const FORMAT_MESSAGE_FROM_SYSTEM: u32 = 0x0000_1000;
    const MESSAGE_CAPACITY: u32 = 512;

    extern "system" {
        fn LoadLibraryW(filename: *const u16) -> *mut c_void;
        fn GetModuleHandleExW(flags: u32, name: *const u16, module: *mut *mut c_void) -> i32;
        fn GetProcAddress(module: *mut c_void, name: *const c_char) -> *mut c_void;
        fn FreeLibrary(module: *mut c_void) -> i32;
        fn GetLastError() -> u32;
        fn FormatMessageW(
            flags: u32,
            source: *const c_void,
            message_id: u32,
            language_id: u32,
            buffer: *mut u16,
            size: u32,
            arguments: *const c_void,
        ) -> u32;
    }

    /// `LoadLibraryW`/`GetProcAddress` based loader, the counterpart of `LibLoader`.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct PlatformLoader;

    impl PlatformLoader {
        /// Creates the loader.
        #[must_use]
        pub fn new() -> Self {
            PlatformLoader
        }
    }

    impl LibraryLoader for PlatformLoader {
        fn load_library(&self, name: &str) -> Option<NonZeroUsize> {
            let handle = if name == LOADER_SENTINEL {
                // flags 0 takes a reference, so free_library stays balanced
                let mut module = ptr::null_mut();
                if unsafe { GetModuleHandleExW(0, ptr::null(), &mut module) } == 0 {
                    return None;
                }
                module
            } else {
                let path = U16CString::from_str(name).ok()?;
                unsafe { LoadLibraryW(path.as_ptr()) }
            };
            NonZeroUsize::new(handle as usize)
        }

        fn get_proc_address(&self, library: NonZeroUsize, symbol: &str) -> Option<NonZeroUsize> {
            let symbol = CString::new(symbol).ok()?;
            let address = unsafe { GetProcAddress(library.get() as *mut c_void, symbol.as_ptr()) };
            NonZeroUsize::new(address as usize)
        }

        fn free_library(&self, library: NonZeroUsize) -> bool {
            unsafe { FreeLibrary(library.get() as *mut c_void) != 0 }
        }

        fn error(&self) -> String {
            let code = unsafe { GetLastError() };
            let mut buffer = [0u16; MESSAGE_CAPACITY as usize];
            let written = unsafe {
                FormatMessageW(
                    FORMAT_MESSAGE_FROM_SYSTEM | FORMAT_MESSAGE_IGNORE_INSERTS,
                    ptr::null(),
                    code,
                    0,
                    buffer.as_mut_ptr(),
                    MESSAGE_CAPACITY,
                    ptr::null(),
                )
            };
            if written == 0 {
                return format!("unknown error (0x{code:x})");
            }
            let message = String::from_utf16_lossy(&buffer[..written as usize]);
            message.trim_end_matches(|c: char| c.is_whitespace() || c == '.').to_string()
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn the_program_exports_kernel32() {
            let loader = PlatformLoader::new();
            let kernel32 = loader.load_library("kernel32.dll");
            assert!(kernel32.is_some());
            let last_error = kernel32.and_then(|handle| loader.get_proc_address(handle, "GetLastError"));
            assert!(last_error.is_some());
            assert!(kernel32.is_some_and(|handle| loader.free_library(handle)));

            let program = loader.load_library(LOADER_SENTINEL);
            assert!(program.is_some_and(|handle| loader.free_library(handle)));
        }

        #[test]
        fn missing_libraries_describe_themselves() {
            let loader = PlatformLoader::new();
            assert!(loader.load_library("does-not-exist-42.dll").is_none());
            assert!(!loader.error().is_empty());
            assert!(loader.load_library("nul\0inside").is_none());
        }
    }
}

#[cfg(any(unix, windows))]
pub use platform::PlatformLoader;
