use std::ffi::{c_char, c_void, CStr, CString};

use widestring::{U16CStr, U16CString};

use crate::metadata::marshalling::NATIVE_TYPE;

/// Encodings the C-string marshaler converts between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StringEncoding {
    /// `LPStr`, the platform narrow encoding (UTF-8 on unix)
    Ansi,
    /// `LPWStr`, NUL terminated UTF-16
    Wide,
    /// `LPUTF8Str`
    Utf8,
}

impl StringEncoding {
    /// The encoding of a native representation, `None` for non-string representations.
    #[must_use]
    pub fn from_native_type(native: u8) -> Option<Self> {
        match native {
            NATIVE_TYPE::LPSTR => Some(StringEncoding::Ansi),
            NATIVE_TYPE::LPWSTR => Some(StringEncoding::Wide),
            NATIVE_TYPE::LPUTF8STR => Some(StringEncoding::Utf8),
            _ => None,
        }
    }
}

/// A marshaled string, freed when dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeString {
    /// Narrow, NUL terminated
    Narrow(CString),
    /// UTF-16, NUL terminated
    Wide(U16CString),
}

impl NativeString {
    /// The pointer handed to native code; valid while `self` lives.
    #[must_use]
    pub fn as_ptr(&self) -> *const c_void {
        match self {
            NativeString::Narrow(s) => s.as_ptr().cast(),
            NativeString::Wide(s) => s.as_ptr().cast(),
        }
    }
}

/// Host side counterpart of the support module's `CStringMarshaler`.
///
/// Strings are cut at their first NUL, as native code would see them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CStringMarshaler {
    encoding: StringEncoding,
}

impl CStringMarshaler {
    /// Creates a marshaler for `encoding`.
    #[must_use]
    pub fn new(encoding: StringEncoding) -> Self {
        CStringMarshaler { encoding }
    }

    /// The marshaler for a native representation, if it is a string representation.
    #[must_use]
    pub fn for_native_type(native: u8) -> Option<Self> {
        StringEncoding::from_native_type(native).map(Self::new)
    }

    /// The encoding in use.
    #[must_use]
    pub fn encoding(&self) -> StringEncoding {
        self.encoding
    }

    /// Host to native; `None` stays a null pointer.
    #[must_use]
    pub fn marshal_managed(&self, value: Option<&str>) -> Option<NativeString> {
        let value = value?;
        Some(match self.encoding {
            StringEncoding::Wide => NativeString::Wide(U16CString::from_str_truncate(value)),
            StringEncoding::Ansi | StringEncoding::Utf8 => {
                let end = value.find('\0').unwrap_or(value.len());
                NativeString::Narrow(CString::new(&value[..end]).unwrap_or_default())
            }
        })
    }

    /// Native to host; a null pointer yields `None`.
    ///
    /// # Safety
    /// A non-null `ptr` must point to a NUL terminated string of this marshaler's encoding.
    #[must_use]
    pub unsafe fn marshal_native(&self, ptr: *const c_void) -> Option<String> {
        if ptr.is_null() {
            return None;
        }
        Some(match self.encoding {
            StringEncoding::Wide => U16CStr::from_ptr_str(ptr.cast()).to_string_lossy(),
            StringEncoding::Ansi | StringEncoding::Utf8 => {
                CStr::from_ptr(ptr.cast::<c_char>()).to_string_lossy().into_owned()
            }
        })
    }
}
