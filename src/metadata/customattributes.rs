//! Custom attributes in decoded form.
//!
//! Attributes are kept as a constructor handle plus decoded fixed and named arguments, so that
//! the rewriter can read annotation values directly and the cloner can rebind type-valued
//! arguments into the destination module.

use crate::metadata::{references::MethodHandle, typesystem::TypeSig};

/// A decoded custom attribute argument.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeArgument {
    /// `bool`
    Bool(bool),
    /// `char`
    Char(u16),
    /// `int8`
    I1(i8),
    /// `unsigned int8`
    U1(u8),
    /// `int16`
    I2(i16),
    /// `unsigned int16`
    U2(u16),
    /// `int32`
    I4(i32),
    /// `unsigned int32`
    U4(u32),
    /// `int64`
    I8(i64),
    /// `unsigned int64`
    U8(u64),
    /// `float32`
    R4(f32),
    /// `float64`
    R8(f64),
    /// `string`, `None` for a null reference
    String(Option<String>),
    /// `System.Type`, `None` for a null reference
    Type(Option<TypeSig>),
    /// Enum value with its underlying 32 bit value
    Enum {
        /// The enum type
        enum_type: TypeSig,
        /// The value
        value: i32,
    },
    /// Single dimensional array, `None` for a null reference
    Array(Option<Vec<AttributeArgument>>),
}

impl AttributeArgument {
    /// Returns the value of a `bool` argument.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttributeArgument::Bool(value) => Some(*value),
            _ => None,
        }
    }

    /// Returns the value of a non-null `string` argument.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeArgument::String(Some(value)) => Some(value),
            _ => None,
        }
    }

    /// Returns the value of an integral or enum argument widened to `i64`.
    #[must_use]
    pub fn as_integer(&self) -> Option<i64> {
        Some(match self {
            AttributeArgument::I1(v) => i64::from(*v),
            AttributeArgument::U1(v) => i64::from(*v),
            AttributeArgument::I2(v) => i64::from(*v),
            AttributeArgument::U2(v) => i64::from(*v),
            AttributeArgument::I4(v) => i64::from(*v),
            AttributeArgument::U4(v) => i64::from(*v),
            AttributeArgument::I8(v) => *v,
            AttributeArgument::Enum { value, .. } => i64::from(*value),
            _ => return None,
        })
    }
}

/// A named field or property assignment of a custom attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct NamedArgument {
    /// `true` for a field, `false` for a property
    pub is_field: bool,
    /// Field or property name
    pub name: String,
    /// Assigned value
    pub value: AttributeArgument,
}

/// A custom attribute attached to a type, member, parameter, return value or the module.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomAttribute {
    /// The attribute constructor
    pub constructor: MethodHandle,
    /// Constructor arguments in order
    pub fixed_args: Vec<AttributeArgument>,
    /// Named arguments
    pub named_args: Vec<NamedArgument>,
}

impl CustomAttribute {
    /// Creates an attribute with positional arguments only.
    #[must_use]
    pub fn new(constructor: MethodHandle, fixed_args: Vec<AttributeArgument>) -> Self {
        CustomAttribute {
            constructor,
            fixed_args,
            named_args: Vec::new(),
        }
    }

    /// Finds a named argument by name.
    #[must_use]
    pub fn named(&self, name: &str) -> Option<&AttributeArgument> {
        self.named_args
            .iter()
            .find(|arg| arg.name == name)
            .map(|arg| &arg.value)
    }
}
