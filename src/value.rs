// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Protocol independent values

use std::{collections::BTreeMap, fmt, str::FromStr};

use crate::{Error, Result};

/// A value read from or written to a device.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum PlcValue {
    #[default]
    Null,
    Bool(bool),
    Byte(u8),
    Word(u16),
    DWord(u32),
    LWord(u64),
    SInt(i8),
    USInt(u8),
    Int(i16),
    UInt(u16),
    DInt(i32),
    UDInt(u32),
    LInt(i64),
    ULInt(u64),
    Real(f32),
    LReal(f64),
    Char(char),
    String(String),
    List(Vec<PlcValue>),
    Struct(BTreeMap<String, PlcValue>),
}

impl PlcValue {
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Widens any integer value.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Self::Byte(v) | Self::USInt(v) => Some(v.into()),
            Self::Word(v) | Self::UInt(v) => Some(v.into()),
            Self::DWord(v) | Self::UDInt(v) => Some(v.into()),
            Self::LWord(v) | Self::ULInt(v) => i64::try_from(v).ok(),
            Self::SInt(v) => Some(v.into()),
            Self::Int(v) => Some(v.into()),
            Self::DInt(v) => Some(v.into()),
            Self::LInt(v) => Some(v),
            _ => None,
        }
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Self::Real(v) => Some(v.into()),
            Self::LReal(v) => Some(v),
            _ => self.as_i64().map(|v| v as f64),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(v) => Some(v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_list(&self) -> Option<&[PlcValue]> {
        match self {
            Self::List(v) => Some(v),
            _ => None,
        }
    }

    /// The type of a scalar value.
    #[must_use]
    pub fn value_type(&self) -> Option<PlcValueType> {
        let value_type = match self {
            Self::Bool(_) => PlcValueType::Bool,
            Self::Byte(_) => PlcValueType::Byte,
            Self::Word(_) => PlcValueType::Word,
            Self::DWord(_) => PlcValueType::DWord,
            Self::LWord(_) => PlcValueType::LWord,
            Self::SInt(_) => PlcValueType::SInt,
            Self::USInt(_) => PlcValueType::USInt,
            Self::Int(_) => PlcValueType::Int,
            Self::UInt(_) => PlcValueType::UInt,
            Self::DInt(_) => PlcValueType::DInt,
            Self::UDInt(_) => PlcValueType::UDInt,
            Self::LInt(_) => PlcValueType::LInt,
            Self::ULInt(_) => PlcValueType::ULInt,
            Self::Real(_) => PlcValueType::Real,
            Self::LReal(_) => PlcValueType::LReal,
            Self::Char(_) => PlcValueType::Char,
            Self::String(_) => PlcValueType::String,
            Self::Null | Self::List(_) | Self::Struct(_) => return None,
        };
        Some(value_type)
    }
}

impl fmt::Display for PlcValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Byte(v) | Self::USInt(v) => write!(f, "{v}"),
            Self::Word(v) | Self::UInt(v) => write!(f, "{v}"),
            Self::DWord(v) | Self::UDInt(v) => write!(f, "{v}"),
            Self::LWord(v) | Self::ULInt(v) => write!(f, "{v}"),
            Self::SInt(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::DInt(v) => write!(f, "{v}"),
            Self::LInt(v) => write!(f, "{v}"),
            Self::Real(v) => write!(f, "{v}"),
            Self::LReal(v) => write!(f, "{v}"),
            Self::Char(v) => write!(f, "{v}"),
            Self::String(v) => write!(f, "{v}"),
            Self::List(values) => {
                f.write_str("[")?;
                for (i, value) in values.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{value}")?;
                }
                f.write_str("]")
            }
            Self::Struct(fields) => {
                f.write_str("{")?;
                for (i, (name, value)) in fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{name}: {value}")?;
                }
                f.write_str("}")
            }
        }
    }
}

impl From<bool> for PlcValue {
    fn from(from: bool) -> Self {
        Self::Bool(from)
    }
}

impl From<i16> for PlcValue {
    fn from(from: i16) -> Self {
        Self::Int(from)
    }
}

impl From<i32> for PlcValue {
    fn from(from: i32) -> Self {
        Self::DInt(from)
    }
}

impl From<f32> for PlcValue {
    fn from(from: f32) -> Self {
        Self::Real(from)
    }
}

impl From<f64> for PlcValue {
    fn from(from: f64) -> Self {
        Self::LReal(from)
    }
}

impl From<&str> for PlcValue {
    fn from(from: &str) -> Self {
        Self::String(from.to_owned())
    }
}

impl From<String> for PlcValue {
    fn from(from: String) -> Self {
        Self::String(from)
    }
}

impl From<Vec<PlcValue>> for PlcValue {
    fn from(from: Vec<PlcValue>) -> Self {
        Self::List(from)
    }
}

/// IEC 61131-3 elementary data types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlcValueType {
    Bool,
    Byte,
    Word,
    DWord,
    LWord,
    SInt,
    USInt,
    Int,
    UInt,
    DInt,
    UDInt,
    LInt,
    ULInt,
    Real,
    LReal,
    Char,
    String,
}

impl PlcValueType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Bool => "BOOL",
            Self::Byte => "BYTE",
            Self::Word => "WORD",
            Self::DWord => "DWORD",
            Self::LWord => "LWORD",
            Self::SInt => "SINT",
            Self::USInt => "USINT",
            Self::Int => "INT",
            Self::UInt => "UINT",
            Self::DInt => "DINT",
            Self::UDInt => "UDINT",
            Self::LInt => "LINT",
            Self::ULInt => "ULINT",
            Self::Real => "REAL",
            Self::LReal => "LREAL",
            Self::Char => "CHAR",
            Self::String => "STRING",
        }
    }
}

impl FromStr for PlcValueType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let value_type = match s.to_ascii_uppercase().as_str() {
            "BOOL" => Self::Bool,
            "BYTE" => Self::Byte,
            "WORD" => Self::Word,
            "DWORD" => Self::DWord,
            "LWORD" => Self::LWord,
            "SINT" => Self::SInt,
            "USINT" => Self::USInt,
            "INT" => Self::Int,
            "UINT" => Self::UInt,
            "DINT" => Self::DInt,
            "UDINT" => Self::UDInt,
            "LINT" => Self::LInt,
            "ULINT" => Self::ULInt,
            "REAL" => Self::Real,
            "LREAL" => Self::LReal,
            "CHAR" => Self::Char,
            "STRING" => Self::String,
            _ => return Err(Error::InvalidRequest(format!("unknown data type '{s}'"))),
        };
        Ok(value_type)
    }
}

impl fmt::Display for PlcValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-tag outcome of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseCode {
    Ok,
    NotFound,
    AccessDenied,
    InvalidAddress,
    InvalidDatatype,
    InvalidData,
    InternalError,
    RemoteBusy,
    RemoteError,
    Unsupported,
    ResponsePending,
}

impl ResponseCode {
    #[must_use]
    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ok => "OK",
            Self::NotFound => "NOT_FOUND",
            Self::AccessDenied => "ACCESS_DENIED",
            Self::InvalidAddress => "INVALID_ADDRESS",
            Self::InvalidDatatype => "INVALID_DATATYPE",
            Self::InvalidData => "INVALID_DATA",
            Self::InternalError => "INTERNAL_ERROR",
            Self::RemoteBusy => "REMOTE_BUSY",
            Self::RemoteError => "REMOTE_ERROR",
            Self::Unsupported => "UNSUPPORTED",
            Self::ResponsePending => "RESPONSE_PENDING",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_value_types_case_insensitively() {
        assert_eq!("dint".parse::<PlcValueType>().unwrap(), PlcValueType::DInt);
        assert_eq!("LREAL".parse::<PlcValueType>().unwrap(), PlcValueType::LReal);
        assert!("FLOAT".parse::<PlcValueType>().is_err());
    }

    #[test]
    fn widen_integers() {
        assert_eq!(PlcValue::Word(0xFFFF).as_i64(), Some(65535));
        assert_eq!(PlcValue::SInt(-3).as_i64(), Some(-3));
        assert_eq!(PlcValue::ULInt(u64::MAX).as_i64(), None);
        assert_eq!(PlcValue::Int(7).as_f64(), Some(7.0));
        assert_eq!(PlcValue::Bool(true).as_i64(), None);
    }

    #[test]
    fn display_nested_values() {
        let value = PlcValue::List(vec![PlcValue::Bool(true), PlcValue::DInt(-1)]);
        assert_eq!(value.to_string(), "[true, -1]");
        let value = PlcValue::Struct(BTreeMap::from([
            ("a".to_owned(), PlcValue::from("x")),
            ("b".to_owned(), PlcValue::Null),
        ]));
        assert_eq!(value.to_string(), "{a: x, b: null}");
    }

    #[test]
    fn scalar_value_types() {
        assert_eq!(PlcValue::Real(1.5).value_type(), Some(PlcValueType::Real));
        assert_eq!(PlcValue::Null.value_type(), None);
        assert_eq!(PlcValueType::UDInt.to_string(), "UDINT");
    }
}
