//! # Modbus Value Types
//!
//! Typed result of decoding one register definition out of a response payload.

use std::collections::HashMap;
use std::fmt;

use half::f16;
use serde::Serialize;

/// Decoded register value.
///
/// # Register Mapping
///
/// | Type | Registers | Description |
/// |------|-----------|-------------|
/// | U8/I8 | 1 | Low byte of one register |
/// | U16/I16/F16 | 1 | Single 16-bit register |
/// | U32/I32/F32 | 2 | Two consecutive registers |
/// | U64/I64/F64 | 4 | Four consecutive registers |
/// | Bits | 1..4 | Raw bit-field, unsigned |
///
/// # Example
///
/// ```rust
/// use voltage_collector::ModbusValue;
///
/// let voltage = ModbusValue::F32(220.3699);
/// assert_eq!(voltage.rounded(), 220.37);
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ModbusValue {
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    U64(u64),
    I64(i64),
    /// IEEE 754 half precision (1 register)
    F16(f16),
    F32(f32),
    F64(f64),
    /// Raw bit-field, kept unsigned
    Bits(u64),
}

impl ModbusValue {
    /// Convert the value to f64 for uniform numeric handling.
    #[inline]
    pub fn as_f64(&self) -> f64 {
        match self {
            ModbusValue::U8(v) => f64::from(*v),
            ModbusValue::I8(v) => f64::from(*v),
            ModbusValue::U16(v) => f64::from(*v),
            ModbusValue::I16(v) => f64::from(*v),
            ModbusValue::U32(v) => f64::from(*v),
            ModbusValue::I32(v) => f64::from(*v),
            ModbusValue::U64(v) => *v as f64,
            ModbusValue::I64(v) => *v as f64,
            ModbusValue::F16(v) => v.to_f64(),
            ModbusValue::F32(v) => f64::from(*v),
            ModbusValue::F64(v) => *v,
            ModbusValue::Bits(v) => *v as f64,
        }
    }

    /// Numeric value rounded to 2 decimal places, as stored in a measurement.
    #[inline]
    pub fn rounded(&self) -> f64 {
        round2(self.as_f64())
    }

    /// Returns the type name as a string for logging/debugging.
    pub fn type_name(&self) -> &'static str {
        match self {
            ModbusValue::U8(_) => "uint8",
            ModbusValue::I8(_) => "int8",
            ModbusValue::U16(_) => "uint16",
            ModbusValue::I16(_) => "int16",
            ModbusValue::U32(_) => "uint32",
            ModbusValue::I32(_) => "int32",
            ModbusValue::U64(_) => "uint64",
            ModbusValue::I64(_) => "int64",
            ModbusValue::F16(_) => "float16",
            ModbusValue::F32(_) => "float32",
            ModbusValue::F64(_) => "float64",
            ModbusValue::Bits(_) => "bits",
        }
    }
}

/// Round to 2 decimal places; values too large to scale are returned as-is.
#[inline]
pub fn round2(value: f64) -> f64 {
    let scaled = value * 100.0;
    if scaled.is_finite() {
        scaled.round() / 100.0
    } else {
        value
    }
}

impl fmt::Display for ModbusValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModbusValue::U8(v) => write!(f, "{}", v),
            ModbusValue::I8(v) => write!(f, "{}", v),
            ModbusValue::U16(v) => write!(f, "{}", v),
            ModbusValue::I16(v) => write!(f, "{}", v),
            ModbusValue::U32(v) => write!(f, "{}", v),
            ModbusValue::I32(v) => write!(f, "{}", v),
            ModbusValue::U64(v) => write!(f, "{}", v),
            ModbusValue::I64(v) => write!(f, "{}", v),
            ModbusValue::F16(v) => write!(f, "{}", v),
            ModbusValue::F32(v) => write!(f, "{}", v),
            ModbusValue::F64(v) => write!(f, "{}", v),
            ModbusValue::Bits(v) => write!(f, "{:#b}", v),
        }
    }
}

/// Register name → rounded value for one device and one collection cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct DecodedMeasurement {
    values: HashMap<String, f64>,
}

impl DecodedMeasurement {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a decoded value under `name`, rounded to 2 decimals.
    pub fn insert(&mut self, name: impl Into<String>, value: ModbusValue) {
        self.values.insert(name.into(), value.rounded());
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn into_inner(self) -> HashMap<String, f64> {
        self.values
    }
}
