//! The native declaration descriptor carried by foreign-function declarations.

use strum::{Display, EnumString};

use crate::{
    metadata::{token::ModuleRefId, typesystem::CallingConvention},
    Result,
};

#[allow(non_snake_case)]
/// All possible flags for `PInvokeAttributes`
pub mod PInvokeAttributes {
    /// `PInvoke` is to use the member name as specified
    pub const NO_MANGLE: u16 = 0x0001;
    /// Character set not specified
    pub const CHAR_SET_NOT_SPEC: u16 = 0x0000;
    /// Strings are marshaled as ANSI
    pub const CHAR_SET_ANSI: u16 = 0x0002;
    /// Strings are marshaled as UTF-16
    pub const CHAR_SET_UNICODE: u16 = 0x0004;
    /// Strings are marshaled with the platform default
    pub const CHAR_SET_AUTO: u16 = 0x0006;
    /// Character set mask
    pub const CHAR_SET_MASK: u16 = 0x0006;
    /// Information about target function. Not relevant for fields
    pub const SUPPORTS_LAST_ERROR: u16 = 0x0040;
    /// Calling convention mask
    pub const CALL_CONV_MASK: u16 = 0x0700;
    /// Calling convention = `WinAPI`
    pub const CALL_CONV_WINAPI: u16 = 0x0100;
    /// Calling convention = C
    pub const CALL_CONV_CDECL: u16 = 0x0200;
    /// Calling convention = `StdCall`
    pub const CALL_CONV_STDCALL: u16 = 0x0300;
    /// Calling convention = `ThisCall`
    pub const CALL_CONV_THISCALL: u16 = 0x0400;
    /// Calling convention = `FastCall`
    pub const CALL_CONV_FASTCALL: u16 = 0x0500;
}

/// Character set policy of a native declaration.
///
/// The discriminants match `System.Runtime.InteropServices.CharSet`, which is the value handed
/// to marshaler settings constructors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[repr(i32)]
pub enum CharSet {
    /// Not specified, treated as ANSI
    None = 1,
    /// Single byte characters
    Ansi = 2,
    /// UTF-16 characters
    Unicode = 3,
    /// Platform default
    Auto = 4,
}

/// The native declaration descriptor (an `ImplMap` row).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PInvokeInfo {
    /// `PInvokeAttributes` bitmask
    pub flags: u16,
    /// Symbol name, `None` means the method name
    pub entry_point: Option<String>,
    /// The library the symbol lives in
    pub module: ModuleRefId,
}

impl PInvokeInfo {
    /// Returns the character set policy.
    #[must_use]
    pub fn char_set(&self) -> CharSet {
        match self.flags & PInvokeAttributes::CHAR_SET_MASK {
            PInvokeAttributes::CHAR_SET_ANSI => CharSet::Ansi,
            PInvokeAttributes::CHAR_SET_UNICODE => CharSet::Unicode,
            PInvokeAttributes::CHAR_SET_AUTO => CharSet::Auto,
            _ => CharSet::None,
        }
    }

    /// Returns the symbol to resolve for a declaration named `method_name`.
    #[must_use]
    pub fn symbol<'a>(&'a self, method_name: &'a str) -> &'a str {
        self.entry_point.as_deref().unwrap_or(method_name)
    }

    /// Maps the declared calling convention onto the call site convention.
    ///
    /// `WinAPI` and an unspecified convention both select the platform default.
    ///
    /// # Errors
    /// Returns [`crate::Error::UnsupportedCallingConvention`] for values outside the defined
    /// range.
    pub fn calling_convention(&self, method_name: &str) -> Result<CallingConvention> {
        match self.flags & PInvokeAttributes::CALL_CONV_MASK {
            0 | PInvokeAttributes::CALL_CONV_WINAPI => Ok(CallingConvention::Unmanaged),
            PInvokeAttributes::CALL_CONV_CDECL => Ok(CallingConvention::C),
            PInvokeAttributes::CALL_CONV_STDCALL => Ok(CallingConvention::StdCall),
            PInvokeAttributes::CALL_CONV_THISCALL => Ok(CallingConvention::ThisCall),
            PInvokeAttributes::CALL_CONV_FASTCALL => Ok(CallingConvention::FastCall),
            other => Err(crate::Error::UnsupportedCallingConvention {
                method: method_name.to_string(),
                convention: format!("0x{other:04x}"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(flags: u16) -> PInvokeInfo {
        PInvokeInfo {
            flags,
            entry_point: None,
            module: ModuleRefId(0),
        }
    }

    #[test]
    fn calling_conventions() -> Result<()> {
        assert_eq!(
            info(PInvokeAttributes::CALL_CONV_CDECL).calling_convention("f")?,
            CallingConvention::C
        );
        assert_eq!(
            info(PInvokeAttributes::CALL_CONV_WINAPI).calling_convention("f")?,
            CallingConvention::Unmanaged
        );
        assert!(matches!(
            info(0x0600).calling_convention("f"),
            Err(crate::Error::UnsupportedCallingConvention { .. })
        ));
        Ok(())
    }

    #[test]
    fn entry_point_defaults_to_method_name() {
        let mut descriptor = info(PInvokeAttributes::CHAR_SET_UNICODE);
        assert_eq!(descriptor.symbol("strlen"), "strlen");
        assert_eq!(descriptor.char_set(), CharSet::Unicode);
        descriptor.entry_point = Some("wcslen".to_string());
        assert_eq!(descriptor.symbol("strlen"), "wcslen");
    }
}
