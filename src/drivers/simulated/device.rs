// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Simulated device and its tag addresses

use std::{
    collections::HashMap,
    fmt,
    str::FromStr,
    sync::{Mutex, PoisonError},
};

use rand::{distributions::Alphanumeric, Rng};

use crate::{
    value::{PlcValue, PlcValueType, ResponseCode},
    Error, Result,
};

/// Where a simulated tag gets its value from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagKind {
    /// A new random value on every read. Writes are rejected.
    Random,
    /// Stores written values in the device.
    State,
    /// Prints written values. Reads are not supported.
    Stdout,
}

impl TagKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Random => "RANDOM",
            Self::State => "STATE",
            Self::Stdout => "STDOUT",
        }
    }
}

impl fmt::Display for TagKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TagKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "RANDOM" => Ok(Self::Random),
            "STATE" => Ok(Self::State),
            "STDOUT" => Ok(Self::Stdout),
            _ => Err(Error::InvalidRequest(format!("unknown tag kind '{s}'"))),
        }
    }
}

/// A parsed tag address: `<KIND>/<name>:<TYPE>[<quantity>]`.
///
/// The quantity is optional and defaults to 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedTag {
    pub kind: TagKind,
    pub name: String,
    pub value_type: PlcValueType,
    pub quantity: usize,
}

impl FromStr for SimulatedTag {
    type Err = Error;

    fn from_str(address: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidRequest(format!("invalid tag address '{address}': {reason}"));
        let (kind, rest) = address.split_once('/').ok_or_else(|| invalid("missing '/'"))?;
        let (name, data_type) = rest.split_once(':').ok_or_else(|| invalid("missing ':'"))?;
        if name.is_empty() {
            return Err(invalid("empty name"));
        }
        let (data_type, quantity) = match data_type.split_once('[') {
            Some((data_type, quantity)) => {
                let quantity = quantity
                    .strip_suffix(']')
                    .and_then(|quantity| quantity.parse::<usize>().ok())
                    .filter(|quantity| *quantity > 0)
                    .ok_or_else(|| invalid("invalid quantity"))?;
                (data_type, quantity)
            }
            None => (data_type, 1),
        };
        Ok(Self {
            kind: kind.parse()?,
            name: name.to_owned(),
            value_type: data_type.parse()?,
            quantity,
        })
    }
}

impl fmt::Display for SimulatedTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.kind, self.name, self.value_type)?;
        if self.quantity != 1 {
            write!(f, "[{}]", self.quantity)?;
        }
        Ok(())
    }
}

/// In-memory device behind a simulated connection.
#[derive(Debug, Default)]
pub struct Device {
    name: String,
    state: Mutex<HashMap<String, PlcValue>>,
}

impl Device {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::default(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn read(&self, tag: &SimulatedTag) -> (ResponseCode, PlcValue) {
        match tag.kind {
            TagKind::Random => (ResponseCode::Ok, random_value(tag)),
            TagKind::State => {
                let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
                match state.get(&tag.name) {
                    Some(value) => (ResponseCode::Ok, value.clone()),
                    None => (ResponseCode::NotFound, PlcValue::Null),
                }
            }
            TagKind::Stdout => (ResponseCode::Unsupported, PlcValue::Null),
        }
    }

    pub fn write(&self, tag: &SimulatedTag, value: &PlcValue) -> ResponseCode {
        match tag.kind {
            TagKind::Random => ResponseCode::AccessDenied,
            TagKind::State => {
                if !matches_tag(tag, value) {
                    return ResponseCode::InvalidDatatype;
                }
                self.state
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(tag.name.clone(), value.clone());
                ResponseCode::Ok
            }
            TagKind::Stdout => {
                println!("TEST PLC STDOUT [{}]: {value}", tag.name);
                ResponseCode::Ok
            }
        }
    }
}

fn matches_tag(tag: &SimulatedTag, value: &PlcValue) -> bool {
    if tag.quantity == 1 {
        return value.value_type() == Some(tag.value_type);
    }
    value.as_list().is_some_and(|items| {
        items.len() == tag.quantity && items.iter().all(|item| item.value_type() == Some(tag.value_type))
    })
}

fn random_value(tag: &SimulatedTag) -> PlcValue {
    let mut rng = rand::thread_rng();
    if tag.quantity == 1 {
        return random_scalar(&mut rng, tag.value_type);
    }
    PlcValue::List(
        (0..tag.quantity)
            .map(|_| random_scalar(&mut rng, tag.value_type))
            .collect(),
    )
}

fn random_scalar(rng: &mut impl Rng, value_type: PlcValueType) -> PlcValue {
    match value_type {
        PlcValueType::Bool => PlcValue::Bool(rng.gen()),
        PlcValueType::Byte => PlcValue::Byte(rng.gen()),
        PlcValueType::Word => PlcValue::Word(rng.gen()),
        PlcValueType::DWord => PlcValue::DWord(rng.gen()),
        PlcValueType::LWord => PlcValue::LWord(rng.gen()),
        PlcValueType::SInt => PlcValue::SInt(rng.gen()),
        PlcValueType::USInt => PlcValue::USInt(rng.gen()),
        PlcValueType::Int => PlcValue::Int(rng.gen()),
        PlcValueType::UInt => PlcValue::UInt(rng.gen()),
        PlcValueType::DInt => PlcValue::DInt(rng.gen()),
        PlcValueType::UDInt => PlcValue::UDInt(rng.gen()),
        PlcValueType::LInt => PlcValue::LInt(rng.gen()),
        PlcValueType::ULInt => PlcValue::ULInt(rng.gen()),
        PlcValueType::Real => PlcValue::Real(rng.gen()),
        PlcValueType::LReal => PlcValue::LReal(rng.gen()),
        PlcValueType::Char => PlcValue::Char(char::from(rng.sample(Alphanumeric))),
        PlcValueType::String => PlcValue::String(
            (0..10)
                .map(|_| char::from(rng.sample(Alphanumeric)))
                .collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_tag_addresses() {
        let tag: SimulatedTag = "STATE/counter:DINT".parse().unwrap();
        assert_eq!(tag.kind, TagKind::State);
        assert_eq!(tag.name, "counter");
        assert_eq!(tag.value_type, PlcValueType::DInt);
        assert_eq!(tag.quantity, 1);
        assert_eq!(tag.to_string(), "STATE/counter:DINT");

        let tag: SimulatedTag = "RANDOM/temp:REAL[4]".parse().unwrap();
        assert_eq!(tag.kind, TagKind::Random);
        assert_eq!(tag.quantity, 4);
        assert_eq!(tag.to_string(), "RANDOM/temp:REAL[4]");

        for invalid in [
            "counter:DINT",
            "STATE/counter",
            "STATE/:DINT",
            "FOO/counter:DINT",
            "STATE/counter:FOO",
            "STATE/counter:DINT[0]",
            "STATE/counter:DINT[x]",
        ] {
            assert!(invalid.parse::<SimulatedTag>().is_err(), "{invalid}");
        }
    }

    #[test]
    fn state_tags_keep_written_values() {
        let device = Device::new("hurz");
        let tag: SimulatedTag = "STATE/counter:DINT".parse().unwrap();
        assert_eq!(device.read(&tag).0, ResponseCode::NotFound);

        assert_eq!(device.write(&tag, &PlcValue::DInt(42)), ResponseCode::Ok);
        assert_eq!(device.read(&tag), (ResponseCode::Ok, PlcValue::DInt(42)));

        assert_eq!(
            device.write(&tag, &PlcValue::Bool(true)),
            ResponseCode::InvalidDatatype
        );
    }

    #[test]
    fn random_tags_yield_values_of_the_requested_type() {
        let device = Device::new("hurz");
        let tag: SimulatedTag = "RANDOM/flags:BOOL[3]".parse().unwrap();
        let (code, value) = device.read(&tag);
        assert!(code.is_ok());
        let items = value.as_list().unwrap();
        assert_eq!(items.len(), 3);
        assert!(items.iter().all(|item| item.as_bool().is_some()));

        let tag: SimulatedTag = "RANDOM/name:STRING".parse().unwrap();
        assert_eq!(device.read(&tag).1.as_str().map(str::len), Some(10));
        assert_eq!(
            device.write(&tag, &PlcValue::from("x")),
            ResponseCode::AccessDenied
        );
    }

    #[test]
    fn stdout_tags_are_write_only() {
        let device = Device::new("hurz");
        let tag: SimulatedTag = "STDOUT/log:STRING".parse().unwrap();
        assert_eq!(device.read(&tag).0, ResponseCode::Unsupported);
        assert_eq!(device.write(&tag, &PlcValue::from("hello")), ResponseCode::Ok);
    }
}
