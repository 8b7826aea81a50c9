use std::fmt;
use std::mem::size_of;
use std::str::FromStr;

use thiserror::Error;

use crate::pointer::RawPointer;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValueParseError {
    #[error("unknown value kind: {0:?}")]
    UnknownKind(String),
    #[error("invalid {kind} value: {input:?}")]
    InvalidValue { kind: ValueKind, input: String },
}

macro_rules! values {
    ($($variant:ident => $type:ty, $name:literal;)*) => {
        /// A primitive read from or written to memory whose type is chosen at runtime.
        #[derive(Debug, Clone, Copy, PartialEq)]
        pub enum Value {
            $($variant($type),)*
            Pointer(RawPointer<u8>),
        }

        /// The closed set of types [`Value`] can carry.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum ValueKind {
            $($variant,)*
            Pointer,
        }

        impl ValueKind {
            pub const ALL: &'static [ValueKind] = &[$(ValueKind::$variant,)* ValueKind::Pointer];

            pub const fn size(self) -> usize {
                match self {
                    $(ValueKind::$variant => size_of::<$type>(),)*
                    ValueKind::Pointer => size_of::<usize>(),
                }
            }

            pub const fn name(self) -> &'static str {
                match self {
                    $(ValueKind::$variant => $name,)*
                    ValueKind::Pointer => "ptr",
                }
            }
        }

        impl Value {
            pub const fn kind(&self) -> ValueKind {
                match self {
                    $(Value::$variant(_) => ValueKind::$variant,)*
                    Value::Pointer(_) => ValueKind::Pointer,
                }
            }

            /// Decodes `bytes` in native byte order. `None` if the length is not `kind.size()`.
            pub fn from_ne_bytes(kind: ValueKind, bytes: &[u8]) -> Option<Self> {
                Some(match kind {
                    $(ValueKind::$variant => Value::$variant(<$type>::from_ne_bytes(bytes.try_into().ok()?)),)*
                    ValueKind::Pointer => {
                        Value::Pointer(RawPointer::new(usize::from_ne_bytes(bytes.try_into().ok()?)))
                    }
                })
            }

            pub fn to_ne_bytes(&self) -> Vec<u8> {
                match self {
                    $(Value::$variant(value) => value.to_ne_bytes().to_vec(),)*
                    Value::Pointer(pointer) => pointer.address().to_ne_bytes().to_vec(),
                }
            }

            /// Parses `input` as a value of `kind`. Pointers accept hex (`0x...`) or decimal.
            pub fn parse(kind: ValueKind, input: &str) -> Result<Self, ValueParseError> {
                let invalid = || ValueParseError::InvalidValue {
                    kind,
                    input: input.to_string(),
                };
                let text = input.trim();

                Ok(match kind {
                    $(ValueKind::$variant => Value::$variant(text.parse::<$type>().map_err(|_| invalid())?),)*
                    ValueKind::Pointer => Value::Pointer(text.parse().map_err(|_| invalid())?),
                })
            }
        }

        impl fmt::Display for Value {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self {
                    $(Value::$variant(value) => write!(f, "{value}"),)*
                    Value::Pointer(pointer) => write!(f, "{pointer}"),
                }
            }
        }
    };
}

values! {
    U8 => u8, "u8";
    I8 => i8, "i8";
    U16 => u16, "u16";
    I16 => i16, "i16";
    U32 => u32, "u32";
    I32 => i32, "i32";
    U64 => u64, "u64";
    I64 => i64, "i64";
    F32 => f32, "f32";
    F64 => f64, "f64";
    Usize => usize, "usize";
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ValueKind {
    type Err = ValueParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_ascii_lowercase();
        if name == "pointer" {
            return Ok(ValueKind::Pointer);
        }

        ValueKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.name() == name)
            .ok_or_else(|| ValueParseError::UnknownKind(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_match_primitives() {
        assert_eq!(ValueKind::U8.size(), 1);
        assert_eq!(ValueKind::I16.size(), 2);
        assert_eq!(ValueKind::F32.size(), 4);
        assert_eq!(ValueKind::U64.size(), 8);
        assert_eq!(ValueKind::Pointer.size(), size_of::<usize>());
    }

    #[test]
    fn decodes_only_exact_lengths() {
        let bytes = 0x1234_5678u32.to_ne_bytes();
        assert_eq!(
            Value::from_ne_bytes(ValueKind::U32, &bytes),
            Some(Value::U32(0x1234_5678))
        );
        assert_eq!(Value::from_ne_bytes(ValueKind::U32, &bytes[..3]), None);
        assert_eq!(Value::from_ne_bytes(ValueKind::U16, &bytes), None);
    }

    #[test]
    fn parses_kinds_and_values() {
        assert_eq!("F64".parse::<ValueKind>().unwrap(), ValueKind::F64);
        assert_eq!("pointer".parse::<ValueKind>().unwrap(), ValueKind::Pointer);
        assert!("u128".parse::<ValueKind>().is_err());

        assert_eq!(Value::parse(ValueKind::I8, "-5").unwrap(), Value::I8(-5));
        assert_eq!(
            Value::parse(ValueKind::Pointer, "0x40").unwrap(),
            Value::Pointer(RawPointer::new(0x40))
        );
        assert!(matches!(
            Value::parse(ValueKind::U8, "256"),
            Err(ValueParseError::InvalidValue { kind: ValueKind::U8, .. })
        ));
    }

    #[test]
    fn kind_follows_variant() {
        for kind in ValueKind::ALL {
            let zero = vec![0u8; kind.size()];
            let value = Value::from_ne_bytes(*kind, &zero).unwrap();
            assert_eq!(value.kind(), *kind);
            assert_eq!(value.to_ne_bytes(), zero);
        }
    }
}
