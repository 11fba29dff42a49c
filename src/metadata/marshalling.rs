//! Marshal descriptors (`FieldMarshal` rows) attached to parameters, return values and fields.

#[allow(non_snake_case)]
/// Native representations of ECMA-335 II.23.4, numbered like `UnmanagedType`
pub mod NATIVE_TYPE {
    /// Not specified
    pub const END: u8 = 0x00;
    /// 4 byte boolean
    pub const BOOLEAN: u8 = 0x02;
    /// Signed 8 bit integer
    pub const I1: u8 = 0x03;
    /// Unsigned 8 bit integer
    pub const U1: u8 = 0x04;
    /// Signed 16 bit integer
    pub const I2: u8 = 0x05;
    /// Unsigned 16 bit integer
    pub const U2: u8 = 0x06;
    /// Signed 32 bit integer
    pub const I4: u8 = 0x07;
    /// Unsigned 32 bit integer
    pub const U4: u8 = 0x08;
    /// Signed 64 bit integer
    pub const I8: u8 = 0x09;
    /// Unsigned 64 bit integer
    pub const U8: u8 = 0x0a;
    /// 32 bit float
    pub const R4: u8 = 0x0b;
    /// 64 bit float
    pub const R8: u8 = 0x0c;
    /// COM BSTR
    pub const BSTR: u8 = 0x13;
    /// Null terminated single byte string
    pub const LPSTR: u8 = 0x14;
    /// Null terminated UTF-16 string
    pub const LPWSTR: u8 = 0x15;
    /// Null terminated platform string
    pub const LPTSTR: u8 = 0x16;
    /// Native sized signed integer
    pub const INT: u8 = 0x1f;
    /// Native sized unsigned integer
    pub const UINT: u8 = 0x20;
    /// Function pointer
    pub const FUNC: u8 = 0x26;
    /// C style array
    pub const ARRAY: u8 = 0x2a;
    /// User supplied custom marshaler
    pub const CUSTOMMARSHALER: u8 = 0x2c;
    /// Null terminated UTF-8 string
    pub const LPUTF8STR: u8 = 0x30;
}

/// Returns a display name for a native representation.
#[must_use]
pub fn native_type_name(native_type: u8) -> String {
    match native_type {
        NATIVE_TYPE::BOOLEAN => "Bool".to_string(),
        NATIVE_TYPE::I4 => "I4".to_string(),
        NATIVE_TYPE::BSTR => "BStr".to_string(),
        NATIVE_TYPE::LPSTR => "LPStr".to_string(),
        NATIVE_TYPE::LPWSTR => "LPWStr".to_string(),
        NATIVE_TYPE::LPTSTR => "LPTStr".to_string(),
        NATIVE_TYPE::FUNC => "FunctionPtr".to_string(),
        NATIVE_TYPE::ARRAY => "LPArray".to_string(),
        NATIVE_TYPE::CUSTOMMARSHALER => "CustomMarshaler".to_string(),
        NATIVE_TYPE::LPUTF8STR => "LPUTF8Str".to_string(),
        other => format!("0x{other:02x}"),
    }
}

/// User supplied marshaler named by a marshal descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomMarshalerSpec {
    /// The marshaler type
    pub marshaler: crate::metadata::typesystem::TypeSig,
    /// Opaque cookie passed to the marshaler factory
    pub cookie: String,
}

/// A marshal descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct MarshalInfo {
    /// Requested native representation, one of [`NATIVE_TYPE`]
    pub native_type: u8,
    /// Element representation for arrays
    pub element_type: Option<u8>,
    /// Custom marshaler, present iff `native_type` is `CUSTOMMARSHALER`
    pub custom: Option<CustomMarshalerSpec>,
}

impl MarshalInfo {
    /// Creates a descriptor for a plain native representation.
    #[must_use]
    pub fn native(native_type: u8) -> Self {
        MarshalInfo {
            native_type,
            element_type: None,
            custom: None,
        }
    }

    /// Creates a custom marshaler descriptor.
    #[must_use]
    pub fn custom(marshaler: crate::metadata::typesystem::TypeSig, cookie: &str) -> Self {
        MarshalInfo {
            native_type: NATIVE_TYPE::CUSTOMMARSHALER,
            element_type: None,
            custom: Some(CustomMarshalerSpec {
                marshaler,
                cookie: cookie.to_string(),
            }),
        }
    }
}
