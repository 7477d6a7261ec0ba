//! # Byte Order Handling for Modbus
//!
//! Unified byte/word order representation for metering devices.
//! Supports ABCD, DCBA, CDAB, BADC patterns found across transductor vendors.
//!
//! ## Terminology
//!
//! - **Byte order**: Order of bytes within one 16-bit register
//! - **Word order**: Order of 16-bit registers when combining to form 32/64-bit values
//!
//! ## Naming Convention
//!
//! Uses ABCD notation where:
//! - A = Most significant byte (MSB)
//! - B = Second byte
//! - C = Third byte
//! - D = Least significant byte (LSB)
//!
//! For 32-bit value `0x12345678`:
//! - `BigEndian (ABCD)`: \[0x12, 0x34, 0x56, 0x78\]
//! - `LittleEndian (DCBA)`: \[0x78, 0x56, 0x34, 0x12\]
//! - `BigEndianSwap (CDAB)`: \[0x56, 0x78, 0x12, 0x34\] (RTU transductors)
//! - `LittleEndianSwap (BADC)`: \[0x34, 0x12, 0x78, 0x56\]
//!
//! ## Register map column
//!
//! The `byteorder` column of a register map is interpreted per framing:
//! RTU devices always send the most significant word last, and swap bytes
//! inside each word when the column starts with `msb` or `f2`. TCP devices
//! name their order explicitly (`ABCD`, `CDAB`, ...).

use std::fmt;

/// Unified byte/word order representation for 16/32/64-bit values.
///
/// # Example
///
/// ```rust
/// use voltage_collector::ByteOrder;
///
/// let order = ByteOrder::from_str("CDAB").unwrap();
/// assert_eq!(order, ByteOrder::BigEndianSwap);
/// assert!(order.has_word_swap());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ByteOrder {
    /// Big-endian: ABCD (most significant byte first)
    BigEndian,

    /// Little-endian: DCBA (least significant byte first)
    LittleEndian,

    /// Big-endian with swapped words: CDAB
    ///
    /// Bytes are big-endian inside each register, the most significant
    /// register comes last.
    BigEndianSwap,

    /// Little-endian with swapped words: BADC
    LittleEndianSwap,

    /// 16-bit big-endian: AB
    BigEndian16,

    /// 16-bit little-endian: BA
    LittleEndian16,
}

impl ByteOrder {
    /// Convert from register map string formats.
    ///
    /// - "ABCD", "AB-CD", "BE", "BIG_ENDIAN" → BigEndian
    /// - "DCBA", "LE", "LITTLE_ENDIAN" → LittleEndian
    /// - "CDAB" → BigEndianSwap
    /// - "BADC" → LittleEndianSwap
    /// - "AB" → BigEndian16
    /// - "BA" → LittleEndian16
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        let normalized: String = s
            .trim()
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .map(|c| c.to_ascii_uppercase())
            .collect();
        match normalized.as_str() {
            "ABCD" | "BE" | "BIGENDIAN" | "ABCDEFGH" => Some(Self::BigEndian),
            "DCBA" | "LE" | "LITTLEENDIAN" | "HGFEDCBA" => Some(Self::LittleEndian),
            "CDAB" | "BIGENDIANSWAP" => Some(Self::BigEndianSwap),
            "BADC" | "LITTLEENDIANSWAP" => Some(Self::LittleEndianSwap),
            "AB" => Some(Self::BigEndian16),
            "BA" => Some(Self::LittleEndian16),
            _ => None,
        }
    }

    /// Byte order of an RTU device from its `byteorder` column.
    ///
    /// Word order is fixed (most significant word last); the column only
    /// selects whether bytes inside each word are swapped.
    ///
    /// ```rust
    /// use voltage_collector::ByteOrder;
    ///
    /// assert_eq!(ByteOrder::for_rtu_column("msb_lsb"), ByteOrder::LittleEndian);
    /// assert_eq!(ByteOrder::for_rtu_column("F2"), ByteOrder::LittleEndian);
    /// assert_eq!(ByteOrder::for_rtu_column("lsb"), ByteOrder::BigEndianSwap);
    /// ```
    pub fn for_rtu_column(column: &str) -> Self {
        let column = column.trim().to_ascii_lowercase();
        if column.starts_with("msb") || column.starts_with("f2") {
            Self::LittleEndian
        } else {
            Self::BigEndianSwap
        }
    }

    /// Byte order of a TCP device from its `byteorder` column.
    ///
    /// Unrecognized or empty values fall back to network order.
    pub fn for_tcp_column(column: &str) -> Self {
        Self::from_str(column).unwrap_or_default()
    }

    /// Get descriptive name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BigEndian => "ABCD (Big-Endian)",
            Self::LittleEndian => "DCBA (Little-Endian)",
            Self::BigEndianSwap => "CDAB (Big-Endian Swap)",
            Self::LittleEndianSwap => "BADC (Little-Endian Swap)",
            Self::BigEndian16 => "AB (Big-Endian 16)",
            Self::LittleEndian16 => "BA (Little-Endian 16)",
        }
    }

    /// Check if this is a little-endian variant (bytes swapped inside a word).
    #[inline]
    pub fn is_little_endian(&self) -> bool {
        matches!(
            self,
            Self::LittleEndian | Self::LittleEndianSwap | Self::LittleEndian16
        )
    }

    /// Check if words are swapped (for 32/64-bit values).
    #[inline]
    pub fn has_word_swap(&self) -> bool {
        matches!(self, Self::BigEndianSwap | Self::LittleEndianSwap)
    }
}

impl fmt::Display for ByteOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Default for ByteOrder {
    /// Default to big-endian (network byte order).
    fn default() -> Self {
        Self::BigEndian
    }
}

// ============================================================================
// Register to Bytes Conversions
// ============================================================================

/// Convert 2 u16 registers to 4 bytes, most significant byte first.
///
/// # Example
///
/// ```rust
/// use voltage_collector::{ByteOrder, regs_to_bytes_4};
///
/// let regs = [0x1234, 0x5678];
/// assert_eq!(regs_to_bytes_4(&regs, ByteOrder::BigEndian), [0x12, 0x34, 0x56, 0x78]);
/// assert_eq!(regs_to_bytes_4(&regs, ByteOrder::BigEndianSwap), [0x56, 0x78, 0x12, 0x34]);
/// ```
#[inline]
pub fn regs_to_bytes_4(regs: &[u16; 2], order: ByteOrder) -> [u8; 4] {
    let [h0, h1] = [regs[0].to_be_bytes(), regs[1].to_be_bytes()];

    match order {
        ByteOrder::BigEndian | ByteOrder::BigEndian16 => [h0[0], h0[1], h1[0], h1[1]], // ABCD
        ByteOrder::LittleEndian | ByteOrder::LittleEndian16 => [h1[1], h1[0], h0[1], h0[0]], // DCBA
        ByteOrder::BigEndianSwap => [h1[0], h1[1], h0[0], h0[1]],                      // CDAB
        ByteOrder::LittleEndianSwap => [h0[1], h0[0], h1[1], h1[0]],                   // BADC
    }
}

/// Convert 4 u16 registers to 8 bytes, most significant byte first.
#[inline]
pub fn regs_to_bytes_8(regs: &[u16; 4], order: ByteOrder) -> [u8; 8] {
    let [h0, h1, h2, h3] = [
        regs[0].to_be_bytes(),
        regs[1].to_be_bytes(),
        regs[2].to_be_bytes(),
        regs[3].to_be_bytes(),
    ];

    match order {
        ByteOrder::BigEndian | ByteOrder::BigEndian16 => [
            h0[0], h0[1], h1[0], h1[1], h2[0], h2[1], h3[0], h3[1], // ABCDEFGH
        ],
        ByteOrder::LittleEndian | ByteOrder::LittleEndian16 => [
            h3[1], h3[0], h2[1], h2[0], h1[1], h1[0], h0[1], h0[0], // HGFEDCBA
        ],
        ByteOrder::BigEndianSwap => [
            h3[0], h3[1], h2[0], h2[1], h1[0], h1[1], h0[0], h0[1], // GHEFCDAB
        ],
        ByteOrder::LittleEndianSwap => [
            h0[1], h0[0], h1[1], h1[0], h2[1], h2[0], h3[1], h3[0], // BADCFEHG
        ],
    }
}

/// Convert a single register to u16, swapping bytes for little-endian orders.
#[inline]
pub fn reg_to_u16(reg: u16, order: ByteOrder) -> u16 {
    if order.is_little_endian() {
        reg.swap_bytes()
    } else {
        reg
    }
}

/// Split a big-endian payload into 16-bit registers.
///
/// A trailing odd byte is ignored.
pub fn bytes_to_regs(payload: &[u8]) -> Vec<u16> {
    payload
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect()
}

/// Lay out a big-endian 4-byte value as 2 registers for the given order.
///
/// Inverse of [`regs_to_bytes_4`]; used to build device replies in tests and demos.
#[inline]
pub fn bytes_4_to_regs(bytes: &[u8; 4], order: ByteOrder) -> [u16; 2] {
    match order {
        ByteOrder::BigEndian | ByteOrder::BigEndian16 => [
            u16::from_be_bytes([bytes[0], bytes[1]]),
            u16::from_be_bytes([bytes[2], bytes[3]]),
        ],
        ByteOrder::LittleEndian | ByteOrder::LittleEndian16 => [
            u16::from_be_bytes([bytes[3], bytes[2]]),
            u16::from_be_bytes([bytes[1], bytes[0]]),
        ],
        ByteOrder::BigEndianSwap => [
            u16::from_be_bytes([bytes[2], bytes[3]]),
            u16::from_be_bytes([bytes[0], bytes[1]]),
        ],
        ByteOrder::LittleEndianSwap => [
            u16::from_be_bytes([bytes[1], bytes[0]]),
            u16::from_be_bytes([bytes[3], bytes[2]]),
        ],
    }
}

/// Convert f32 to 2 registers with specified byte order.
#[inline]
pub fn f32_to_regs(value: f32, order: ByteOrder) -> [u16; 2] {
    bytes_4_to_regs(&value.to_be_bytes(), order)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_str_valid() {
        assert_eq!(ByteOrder::from_str("ABCD"), Some(ByteOrder::BigEndian));
        assert_eq!(ByteOrder::from_str("AB-CD"), Some(ByteOrder::BigEndian));
        assert_eq!(ByteOrder::from_str(" be "), Some(ByteOrder::BigEndian));
        assert_eq!(ByteOrder::from_str("DCBA"), Some(ByteOrder::LittleEndian));
        assert_eq!(ByteOrder::from_str("cdab"), Some(ByteOrder::BigEndianSwap));
        assert_eq!(
            ByteOrder::from_str("BADC"),
            Some(ByteOrder::LittleEndianSwap)
        );
        assert_eq!(ByteOrder::from_str("BA"), Some(ByteOrder::LittleEndian16));
    }

    #[test]
    fn test_from_str_invalid() {
        assert_eq!(ByteOrder::from_str("invalid"), None);
        assert_eq!(ByteOrder::from_str(""), None);
    }

    #[test]
    fn test_rtu_column() {
        assert_eq!(ByteOrder::for_rtu_column("msb"), ByteOrder::LittleEndian);
        assert_eq!(ByteOrder::for_rtu_column(" MSB-LSB"), ByteOrder::LittleEndian);
        assert_eq!(ByteOrder::for_rtu_column("f2_10"), ByteOrder::LittleEndian);
        assert_eq!(ByteOrder::for_rtu_column("lsb"), ByteOrder::BigEndianSwap);
        assert_eq!(ByteOrder::for_rtu_column(""), ByteOrder::BigEndianSwap);
        // "f1" is not "f2"
        assert_eq!(ByteOrder::for_rtu_column("f1"), ByteOrder::BigEndianSwap);
    }

    #[test]
    fn test_tcp_column() {
        assert_eq!(ByteOrder::for_tcp_column("CDAB"), ByteOrder::BigEndianSwap);
        assert_eq!(ByteOrder::for_tcp_column("msb"), ByteOrder::BigEndian);
        assert_eq!(ByteOrder::for_tcp_column(""), ByteOrder::BigEndian);
    }

    #[test]
    fn test_regs_to_bytes_4_all_orders() {
        let regs = [0x1234, 0x5678];

        assert_eq!(
            regs_to_bytes_4(&regs, ByteOrder::BigEndian),
            [0x12, 0x34, 0x56, 0x78]
        );
        assert_eq!(
            regs_to_bytes_4(&regs, ByteOrder::LittleEndian),
            [0x78, 0x56, 0x34, 0x12]
        );
        assert_eq!(
            regs_to_bytes_4(&regs, ByteOrder::BigEndianSwap),
            [0x56, 0x78, 0x12, 0x34]
        );
        assert_eq!(
            regs_to_bytes_4(&regs, ByteOrder::LittleEndianSwap),
            [0x34, 0x12, 0x78, 0x56]
        );
    }

    #[test]
    fn test_regs_to_bytes_8_word_swap() {
        let regs = [0x1234, 0x5678, 0x9ABC, 0xDEF0];

        assert_eq!(
            regs_to_bytes_8(&regs, ByteOrder::BigEndianSwap),
            [0xDE, 0xF0, 0x9A, 0xBC, 0x56, 0x78, 0x12, 0x34]
        );
        assert_eq!(
            regs_to_bytes_8(&regs, ByteOrder::LittleEndian),
            [0xF0, 0xDE, 0xBC, 0x9A, 0x78, 0x56, 0x34, 0x12]
        );
    }

    #[test]
    fn test_reg_to_u16_swaps_only_little_endian() {
        assert_eq!(reg_to_u16(0x1234, ByteOrder::BigEndian), 0x1234);
        assert_eq!(reg_to_u16(0x1234, ByteOrder::BigEndianSwap), 0x1234);
        assert_eq!(reg_to_u16(0x1234, ByteOrder::LittleEndian), 0x3412);
        assert_eq!(reg_to_u16(0x1234, ByteOrder::LittleEndian16), 0x3412);
    }

    #[test]
    fn test_bytes_to_regs() {
        assert_eq!(bytes_to_regs(&[0x43, 0x5C, 0x5E, 0xB8]), vec![0x435C, 0x5EB8]);
        assert_eq!(bytes_to_regs(&[0x01, 0x02, 0x03]), vec![0x0102]);
    }

    #[test]
    fn test_f32_layout_matches_decode() {
        for order in [
            ByteOrder::BigEndian,
            ByteOrder::LittleEndian,
            ByteOrder::BigEndianSwap,
            ByteOrder::LittleEndianSwap,
        ] {
            let regs = f32_to_regs(220.37, order);
            let decoded = f32::from_be_bytes(regs_to_bytes_4(&regs, order));
            assert_eq!(decoded, 220.37, "layout mismatch for {:?}", order);
        }
    }
}
