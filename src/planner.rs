//! # Register Block Planning
//!
//! Turns a device's register definitions for one collection group into the
//! minimal list of contiguous read blocks.
//!
//! ## How It Works
//!
//! A single greedy pass over the definitions (sorted by address). A register
//! joins the current block when all hold:
//! - it starts right where the block ends (contiguity)
//! - it has the block's type
//! - it has the block's unit size
//! - it is read with the block's function
//! - the block holds fewer than `max_block_size` definitions
//!
//! Otherwise the block is closed and a new one starts at that register.
//!
//! ## Example
//!
//! ```rust
//! use voltage_collector::{BlockPlanner, RegisterDefinition, RegisterType};
//!
//! let registers = vec![
//!     RegisterDefinition::new("v_a", 100, RegisterType::Int16),
//!     RegisterDefinition::new("v_b", 101, RegisterType::Int16),
//!     RegisterDefinition::new("freq", 105, RegisterType::Int16),
//! ];
//!
//! let request = BlockPlanner::new(10).plan(&registers).unwrap();
//! assert_eq!(request.len(), 2);
//! assert_eq!(request.blocks()[0].size, 2);
//! ```

use tracing::debug;

use crate::device_limits::DeviceLimits;
use crate::error::{ModbusError, ModbusResult};
use crate::register_map::{ReadFunction, RegisterDefinition, RegisterType};

/// Where a closed block takes its `byte_order` and `read_function` from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttributeSource {
    /// The register that ended the block (the last input register for the
    /// final block). Matches the output of deployed collectors.
    #[default]
    FollowingRegister,
    /// The block's own first member.
    BlockHead,
}

/// Contiguous run of same-typed registers read with one request.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterBlock {
    pub start_address: u16,
    /// Total register count.
    pub size: u16,
    /// Register count of each member.
    pub unit_size: u16,
    pub register_type: RegisterType,
    pub byte_order: String,
    pub read_function: ReadFunction,
    /// Member register names in address order.
    pub members: Vec<String>,
}

impl RegisterBlock {
    fn start(register: &RegisterDefinition) -> Self {
        Self {
            start_address: register.address,
            size: register.size,
            unit_size: register.size,
            register_type: register.register_type,
            byte_order: register.byte_order.clone(),
            read_function: register.read_function,
            members: vec![register.name.clone()],
        }
    }

    #[inline]
    fn end_address(&self) -> u32 {
        u32::from(self.start_address) + u32::from(self.size)
    }

    fn accepts(&self, register: &RegisterDefinition, max_block_size: usize) -> bool {
        u32::from(register.address) == self.end_address()
            && register.register_type == self.register_type
            && register.size == self.unit_size
            && register.read_function == self.read_function
            && self.members.len() < max_block_size
    }

    fn push(&mut self, register: &RegisterDefinition) {
        self.size += register.size;
        self.members.push(register.name.clone());
    }

    fn close_with(mut self, source: &RegisterDefinition) -> Self {
        self.byte_order = source.byte_order.clone();
        self.read_function = source.read_function;
        self
    }

    /// Register offset of member `index` inside the block payload.
    #[inline]
    pub fn member_offset(&self, index: usize) -> usize {
        index * usize::from(self.unit_size)
    }
}

/// Ordered blocks for one device and group, reusable across cycles.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CollectionRequest {
    blocks: Vec<RegisterBlock>,
}

impl CollectionRequest {
    pub fn blocks(&self) -> &[RegisterBlock] {
        &self.blocks
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Registers read per cycle.
    pub fn total_registers(&self) -> usize {
        self.blocks.iter().map(|b| usize::from(b.size)).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisterBlock> {
        self.blocks.iter()
    }
}

/// Greedy block planner.
#[derive(Debug, Clone, Copy)]
pub struct BlockPlanner {
    max_block_size: usize,
    attribute_source: AttributeSource,
}

impl BlockPlanner {
    /// Planner merging at most `max_block_size` definitions per block.
    pub fn new(max_block_size: u16) -> Self {
        Self {
            max_block_size: usize::from(max_block_size.max(1)),
            attribute_source: AttributeSource::default(),
        }
    }

    pub fn from_limits(limits: &DeviceLimits) -> Self {
        Self::new(limits.max_block_size)
    }

    pub fn with_attribute_source(mut self, source: AttributeSource) -> Self {
        self.attribute_source = source;
        self
    }

    /// Plan blocks for registers already sorted by ascending address.
    pub fn plan(&self, registers: &[RegisterDefinition]) -> ModbusResult<CollectionRequest> {
        let (first, rest) = registers
            .split_first()
            .ok_or(ModbusError::EmptyRegisterSet)?;

        let mut blocks = Vec::new();
        let mut current = RegisterBlock::start(first);
        let mut head = first;

        for register in rest {
            if current.accepts(register, self.max_block_size) {
                current.push(register);
                continue;
            }
            blocks.push(self.close(current, head, register));
            current = RegisterBlock::start(register);
            head = register;
        }

        let last = registers.last().unwrap_or(first);
        blocks.push(self.close(current, head, last));

        debug!(
            "Planned {} registers into {} blocks (max_block_size={})",
            registers.len(),
            blocks.len(),
            self.max_block_size
        );
        Ok(CollectionRequest { blocks })
    }

    fn close(
        &self,
        block: RegisterBlock,
        head: &RegisterDefinition,
        following: &RegisterDefinition,
    ) -> RegisterBlock {
        match self.attribute_source {
            AttributeSource::FollowingRegister => block.close_with(following),
            AttributeSource::BlockHead => block.close_with(head),
        }
    }
}

impl Default for BlockPlanner {
    fn default() -> Self {
        Self::from_limits(&DeviceLimits::default())
    }
}

// ============================================================================
// Tests
// ============================================================================
