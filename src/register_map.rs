//! # Register Map
//!
//! Register definitions of one device model, loaded from a tabular source.
//!
//! ## CSV schema
//!
//! Columns are matched case-insensitively after trimming:
//!
//! | Column | Meaning |
//! |--------|---------|
//! | `register` | measurement name the value is stored under |
//! | `address` | first register address |
//! | `size` | register count |
//! | `type` | `uint8..uint64`, `int8..int64`, `float16/32/64`, `bits` |
//! | `group` | `minutely`, `quarterly`, `monthly`, `datetime` |
//! | `byteorder` | framing-specific order hint (optional) |
//! | `datamodel` or `function` | holding or input registers (optional, holding) |
//! | `active` | `t`, `y`, `true`, `yes`, `1` enable the row (optional, enabled) |
//!
//! Inactive rows are skipped without being validated.

use std::fmt;
use std::fs::File;
use std::io;
use std::path::Path;

use csv::{ReaderBuilder, StringRecord, Trim};
use tracing::debug;

use crate::constants::{FC_READ_HOLDING_REGISTERS, FC_READ_INPUT_REGISTERS};
use crate::error::{ModbusError, ModbusResult};

/// Declared numeric type of a register definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterType {
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Int8,
    Int16,
    Int32,
    Int64,
    Float16,
    Float32,
    Float64,
    /// Raw bit-field spanning 1 to 4 registers
    Bits,
}

impl RegisterType {
    /// Parse a type name (case-insensitive, a few common aliases).
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "uint8" | "u8" => Some(Self::Uint8),
            "uint16" | "u16" => Some(Self::Uint16),
            "uint32" | "u32" => Some(Self::Uint32),
            "uint64" | "u64" => Some(Self::Uint64),
            "int8" | "i8" => Some(Self::Int8),
            "int16" | "i16" => Some(Self::Int16),
            "int32" | "i32" => Some(Self::Int32),
            "int64" | "i64" => Some(Self::Int64),
            "float16" | "f16" => Some(Self::Float16),
            "float32" | "f32" | "float" => Some(Self::Float32),
            "float64" | "f64" | "double" => Some(Self::Float64),
            "bits" | "bitfield" => Some(Self::Bits),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uint8 => "uint8",
            Self::Uint16 => "uint16",
            Self::Uint32 => "uint32",
            Self::Uint64 => "uint64",
            Self::Int8 => "int8",
            Self::Int16 => "int16",
            Self::Int32 => "int32",
            Self::Int64 => "int64",
            Self::Float16 => "float16",
            Self::Float32 => "float32",
            Self::Float64 => "float64",
            Self::Bits => "bits",
        }
    }

    /// Number of registers one value of this type occupies.
    ///
    /// `Bits` has no fixed width and reports `None`.
    pub fn register_count(&self) -> Option<u16> {
        match self {
            Self::Uint8 | Self::Int8 | Self::Uint16 | Self::Int16 | Self::Float16 => Some(1),
            Self::Uint32 | Self::Int32 | Self::Float32 => Some(2),
            Self::Uint64 | Self::Int64 | Self::Float64 => Some(4),
            Self::Bits => None,
        }
    }

    /// Whether `size` registers can hold one value of this type.
    pub fn accepts_size(&self, size: u16) -> bool {
        match self.register_count() {
            Some(count) => size == count,
            None => (1..=4).contains(&size),
        }
    }
}

impl fmt::Display for RegisterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cadence a register is collected at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollectionGroup {
    Minutely,
    Quarterly,
    Monthly,
    /// Device clock registers, collected with every other group.
    Datetime,
}

impl CollectionGroup {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "minutely" => Some(Self::Minutely),
            "quarterly" => Some(Self::Quarterly),
            "monthly" => Some(Self::Monthly),
            "datetime" => Some(Self::Datetime),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Minutely => "minutely",
            Self::Quarterly => "quarterly",
            Self::Monthly => "monthly",
            Self::Datetime => "datetime",
        }
    }
}

impl fmt::Display for CollectionGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Register space a definition is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReadFunction {
    #[default]
    ReadHoldingRegister,
    ReadInputRegister,
}

impl ReadFunction {
    /// Resolve a read-function name.
    ///
    /// Unknown names are a [`ModbusError::NotImplemented`]: the codec has no
    /// function code for them.
    pub fn from_name(name: &str) -> ModbusResult<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "" | "holding" | "read_holding_register" | "read_holding_registers" => {
                Ok(Self::ReadHoldingRegister)
            }
            "input" | "read_input_register" | "read_input_registers" => {
                Ok(Self::ReadInputRegister)
            }
            _ => Err(ModbusError::not_implemented(name.trim())),
        }
    }

    /// Modbus function code.
    pub fn function_code(&self) -> u8 {
        match self {
            Self::ReadHoldingRegister => FC_READ_HOLDING_REGISTERS,
            Self::ReadInputRegister => FC_READ_INPUT_REGISTERS,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReadHoldingRegister => "read_holding_register",
            Self::ReadInputRegister => "read_input_register",
        }
    }
}

/// One row of a register map.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterDefinition {
    pub name: String,
    pub address: u16,
    /// Register count.
    pub size: u16,
    pub register_type: RegisterType,
    pub group: CollectionGroup,
    /// Raw `byteorder` column; interpreted by the device framing.
    pub byte_order: String,
    pub read_function: ReadFunction,
    pub active: bool,
}

impl RegisterDefinition {
    /// Active minutely holding register of the natural size for its type.
    pub fn new(name: impl Into<String>, address: u16, register_type: RegisterType) -> Self {
        Self {
            name: name.into(),
            address,
            size: register_type.register_count().unwrap_or(1),
            register_type,
            group: CollectionGroup::Minutely,
            byte_order: String::new(),
            read_function: ReadFunction::default(),
            active: true,
        }
    }

    pub fn with_size(mut self, size: u16) -> Self {
        self.size = size;
        self
    }

    pub fn with_group(mut self, group: CollectionGroup) -> Self {
        self.group = group;
        self
    }

    pub fn with_byte_order(mut self, byte_order: impl Into<String>) -> Self {
        self.byte_order = byte_order.into();
        self
    }

    pub fn with_read_function(mut self, read_function: ReadFunction) -> Self {
        self.read_function = read_function;
        self
    }

    /// First address after this register.
    #[inline]
    pub fn end_address(&self) -> u32 {
        u32::from(self.address) + u32::from(self.size)
    }
}

/// Column positions resolved from the header row.
struct Columns {
    register: usize,
    address: usize,
    size: usize,
    register_type: usize,
    group: usize,
    byte_order: Option<usize>,
    function: Option<usize>,
    active: Option<usize>,
}

impl Columns {
    fn resolve(headers: &StringRecord) -> ModbusResult<Self> {
        let names: Vec<String> = headers
            .iter()
            .map(|h| h.trim().to_ascii_lowercase())
            .collect();
        let find = |wanted: &[&str]| names.iter().position(|n| wanted.contains(&n.as_str()));
        let require = |wanted: &str| {
            find(&[wanted][..]).ok_or_else(|| {
                ModbusError::configuration(format!("register map has no '{}' column", wanted))
            })
        };

        Ok(Self {
            register: require("register")?,
            address: require("address")?,
            size: require("size")?,
            register_type: require("type")?,
            group: require("group")?,
            byte_order: find(&["byteorder"][..]),
            function: find(&["datamodel", "function"][..]),
            active: find(&["active"][..]),
        })
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "t" | "y" | "true" | "yes" | "1"
    )
}

/// Every active register definition of one device model.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegisterMap {
    registers: Vec<RegisterDefinition>,
}

impl RegisterMap {
    /// Build a map from already parsed definitions; inactive ones are dropped.
    pub fn new(registers: Vec<RegisterDefinition>) -> Self {
        Self {
            registers: registers.into_iter().filter(|r| r.active).collect(),
        }
    }

    /// Parse a CSV register map. Any malformed active row fails the whole load.
    pub fn from_csv_reader<R: io::Read>(reader: R) -> ModbusResult<Self> {
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .trim(Trim::All)
            .from_reader(reader);
        let columns = Columns::resolve(reader.headers()?)?;

        let mut registers = Vec::new();
        for (index, record) in reader.records().enumerate() {
            let record = record?;
            let row = index + 1;
            let field = |i: usize| record.get(i).unwrap_or("").trim();

            if let Some(active) = columns.active {
                if !is_truthy(field(active)) {
                    continue;
                }
            }

            let name = field(columns.register);
            if name.is_empty() {
                return Err(ModbusError::config_row(row, "empty register name"));
            }
            let address: u16 = field(columns.address).parse().map_err(|_| {
                ModbusError::config_row(
                    row,
                    format!("invalid address '{}'", field(columns.address)),
                )
            })?;
            let size: u16 = field(columns.size).parse().map_err(|_| {
                ModbusError::config_row(row, format!("invalid size '{}'", field(columns.size)))
            })?;
            let register_type = RegisterType::from_name(field(columns.register_type))
                .ok_or_else(|| {
                    ModbusError::config_row(
                        row,
                        format!("unknown type '{}'", field(columns.register_type)),
                    )
                })?;
            if !register_type.accepts_size(size) {
                return Err(ModbusError::config_row(
                    row,
                    format!("size {} does not fit type {}", size, register_type),
                ));
            }
            if u32::from(address) + u32::from(size) > u32::from(u16::MAX) + 1 {
                return Err(ModbusError::config_row(
                    row,
                    format!("address {} + size {} exceeds register space", address, size),
                ));
            }
            let group = CollectionGroup::from_name(field(columns.group)).ok_or_else(|| {
                ModbusError::config_row(row, format!("unknown group '{}'", field(columns.group)))
            })?;
            let read_function = match columns.function {
                Some(i) => ReadFunction::from_name(field(i)).map_err(|err| match err {
                    ModbusError::NotImplemented { function } => ModbusError::NotImplemented {
                        function: format!("{} (row {})", function, row),
                    },
                    other => other,
                })?,
                None => ReadFunction::default(),
            };
            let byte_order = columns.byte_order.map(field).unwrap_or("").to_string();

            registers.push(RegisterDefinition {
                name: name.to_string(),
                address,
                size,
                register_type,
                group,
                byte_order,
                read_function,
                active: true,
            });
        }

        debug!("Loaded {} active register definitions", registers.len());
        Ok(Self { registers })
    }

    /// Load a CSV register map from disk.
    pub fn from_csv_path(path: impl AsRef<Path>) -> ModbusResult<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|err| {
            ModbusError::configuration(format!("cannot open {}: {}", path.display(), err))
        })?;
        Self::from_csv_reader(file)
    }

    /// Registers collected with `group`: its own rows plus every `datetime`
    /// row, sorted by ascending address.
    ///
    /// Overlapping address ranges are rejected.
    pub fn for_group(&self, group: CollectionGroup) -> ModbusResult<Vec<RegisterDefinition>> {
        let mut selected: Vec<RegisterDefinition> = self
            .registers
            .iter()
            .filter(|r| r.group == group || r.group == CollectionGroup::Datetime)
            .cloned()
            .collect();
        selected.sort_by_key(|r| r.address);

        for pair in selected.windows(2) {
            if pair[0].end_address() > u32::from(pair[1].address) {
                return Err(ModbusError::configuration(format!(
                    "registers '{}' and '{}' overlap at address {}",
                    pair[0].name, pair[1].name, pair[1].address
                )));
            }
        }
        Ok(selected)
    }

    pub fn len(&self) -> usize {
        self.registers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisterDefinition> {
        self.registers.iter()
    }
}
