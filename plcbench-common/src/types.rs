use crate::error::BenchError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Width of one LTIME value in controller memory
pub const LTIME_WIDTH_BYTES: usize = 8;

/// Kind of controller variable a scenario exercises
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableKind {
    Bool,
    Int16,
    Int32,
    BulkBlock,
}

impl VariableKind {
    pub fn is_bulk(&self) -> bool {
        matches!(self, VariableKind::BulkBlock)
    }

    /// Encoded size of one value of this kind in controller memory
    pub fn width_bytes(&self) -> usize {
        match self {
            VariableKind::Bool => 1,
            VariableKind::Int16 => 2,
            VariableKind::Int32 => 4,
            VariableKind::BulkBlock => LTIME_WIDTH_BYTES,
        }
    }
}

impl fmt::Display for VariableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VariableKind::Bool => write!(f, "bool"),
            VariableKind::Int16 => write!(f, "int16"),
            VariableKind::Int32 => write!(f, "int32"),
            VariableKind::BulkBlock => write!(f, "bulk_block"),
        }
    }
}

impl FromStr for VariableKind {
    type Err = BenchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bool" | "boolean" => Ok(VariableKind::Bool),
            "int16" | "int" => Ok(VariableKind::Int16),
            "int32" | "dint" => Ok(VariableKind::Int32),
            "bulk" | "bulk_block" => Ok(VariableKind::BulkBlock),
            other => Err(BenchError::config(format!("unknown variable kind '{}'", other))),
        }
    }
}

/// A single scalar value written to or read from the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PlcValue {
    Bool(bool),
    Int16(i16),
    Int32(i32),
}

impl PlcValue {
    pub fn kind(&self) -> VariableKind {
        match self {
            PlcValue::Bool(_) => VariableKind::Bool,
            PlcValue::Int16(_) => VariableKind::Int16,
            PlcValue::Int32(_) => VariableKind::Int32,
        }
    }

    /// JSON representation used by the Web API
    pub fn to_json(&self) -> serde_json::Value {
        match *self {
            PlcValue::Bool(v) => serde_json::Value::Bool(v),
            PlcValue::Int16(v) => serde_json::Value::from(v),
            PlcValue::Int32(v) => serde_json::Value::from(v),
        }
    }
}

impl fmt::Display for PlcValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlcValue::Bool(v) => write!(f, "{}", v),
            PlcValue::Int16(v) => write!(f, "{}", v),
            PlcValue::Int32(v) => write!(f, "{}", v),
        }
    }
}

/// Controller long-duration value (LTIME), nanosecond resolution.
///
/// The textual form is the controller literal `LT#<nanos>ns`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LTime(pub i64);

impl LTime {
    pub fn from_nanos(nanos: i64) -> Self {
        LTime(nanos)
    }

    pub fn as_nanos(&self) -> i64 {
        self.0
    }

    /// Big-endian memory image as stored in a data block
    pub fn to_be_bytes(&self) -> [u8; LTIME_WIDTH_BYTES] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for LTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LT#{}ns", self.0)
    }
}

impl FromStr for LTime {
    type Err = BenchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s
            .strip_prefix("LT#")
            .and_then(|rest| rest.strip_suffix("ns"))
            .ok_or_else(|| BenchError::Serialization(format!("invalid LTIME literal '{}'", s)))?;
        digits
            .parse::<i64>()
            .map(LTime)
            .map_err(|e| BenchError::Serialization(format!("invalid LTIME literal '{}': {}", s, e)))
    }
}

/// Parse a sequence of LTIME literals, as handed to `write_bulk`
pub fn parse_ltimes(values: &[String]) -> Result<Vec<LTime>, BenchError> {
    values.iter().map(|v| v.parse()).collect()
}
