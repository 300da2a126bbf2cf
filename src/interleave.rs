use crate::{address, config, config::ConfigError};
use itertools::Itertools;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

#[must_use]
pub fn is_power_of_two(n: u64) -> bool {
    n != 0 && (n & (n - 1)) == 0
}

/// Lowest and highest (exclusive) set bit of `mask`.
#[must_use]
pub fn mask_limit(mask: address) -> (u8, u8) {
    let mut high = 64;
    let mut low = 0;
    let mut low_found = false;

    for i in 0..64 {
        if (mask & (1u64 << i)) != 0 {
            high = i + 1;
            if !low_found {
                low = i;
                low_found = true;
            }
        }
    }
    (low, high)
}

/// Gathers the bits of `val` selected by `mask` into the low bits of the result.
#[must_use]
pub fn packbits(mask: address, val: address, low: u8, high: u8) -> address {
    let mut pos = 0;
    let mut res: address = 0;
    let low = low.min(64);
    let high = high.min(64);
    for i in low..high {
        if mask & (1u64 << i) != 0 {
            res |= ((val & (1u64 << i)) >> i) << pos;
            pos += 1;
        }
    }
    res
}

/// Inverse of [`packbits`]: scatters the low bits of `val` onto the set bits of `mask`.
#[must_use]
pub fn unpackbits(mask: address, val: address, low: u8, high: u8) -> address {
    let mut pos = 0;
    let mut res: address = 0;
    let low = low.min(64);
    let high = high.min(64);
    for i in low..high {
        if mask & (1u64 << i) != 0 {
            res |= ((val >> pos) & 1) << i;
            pos += 1;
        }
    }
    res
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Mask {
    pub mask: address,
    pub low: u8,
    pub high: u8,
}

impl From<address> for Mask {
    fn from(mask: address) -> Self {
        let (low, high) = mask_limit(mask);
        Self { mask, low, high }
    }
}

impl std::fmt::Debug for Mask {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mut out = f.debug_struct("Mask");
        out.field("mask", &format!("{:016x}", self.mask));
        out.field("low", &self.low);
        out.field("high", &self.high);
        out.finish()
    }
}

impl Mask {
    /// Mask of `width` contiguous bits starting at `start`.
    #[must_use]
    pub fn contiguous(start: u32, width: u32) -> Self {
        if width == 0 {
            return Self::from(0);
        }
        let ones = if width >= 64 {
            u64::MAX
        } else {
            (1u64 << width) - 1
        };
        Self::from(ones << start)
    }

    #[must_use]
    pub fn extract(&self, addr: address) -> u64 {
        packbits(self.mask, addr, self.low, self.high)
    }

    #[must_use]
    pub fn insert(&self, value: u64) -> address {
        unpackbits(self.mask, value, self.low, self.high)
    }
}

/// A field of the physical address layout.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    strum::EnumString,
    strum::Display,
    Serialize,
    Deserialize,
)]
pub enum Field {
    #[strum(serialize = "Ro")]
    Row,
    #[strum(serialize = "Ra")]
    Rank,
    #[strum(serialize = "Ba")]
    Bank,
    #[strum(serialize = "Co")]
    Column,
    #[strum(serialize = "Ch")]
    Channel,
}

static INTERLEAVE_ORDER_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:Ro|Ra|Ba|Co|Ch){5}$").unwrap());

/// Parses an interleave permutation such as `RoRaBaCoCh`.
///
/// Fields are listed from the most to the least significant bits.
pub fn parse_order(order: impl AsRef<str>) -> Result<[Field; 5], ConfigError> {
    let order = order.as_ref().trim();
    let invalid = |reason: &str| ConfigError::InvalidInterleaveOrder {
        order: order.to_string(),
        reason: reason.to_string(),
    };
    if !INTERLEAVE_ORDER_REGEX.is_match(order) {
        return Err(invalid(
            "expected a permutation of the five fields Ro, Ra, Ba, Co and Ch",
        ));
    }

    let mut fields = [Field::Row; 5];
    for (i, token) in order.as_bytes().chunks(2).enumerate() {
        let token = std::str::from_utf8(token).map_err(|_| invalid("not ascii"))?;
        fields[i] = token.parse().map_err(|_| invalid("unknown field"))?;
    }
    if !fields.iter().all_unique() {
        return Err(invalid("each field must appear exactly once"));
    }
    Ok(fields)
}

/// Decoded location of an address.
#[derive(
    Default, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct PhysicalAddress {
    pub channel: u64,
    pub rank: u64,
    pub bank: u64,
    pub row: u64,
    /// Byte offset within the row buffer
    pub column: u64,
}

impl std::fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "(ch={}, ra={}, ba={}, ro={}, co={})",
            self.channel, self.rank, self.bank, self.row, self.column
        )
    }
}

impl PhysicalAddress {
    /// Index of the bank within its channel, counting banks of all ranks.
    #[must_use]
    pub fn bank_index(&self, banks_per_rank: usize) -> usize {
        self.rank as usize * banks_per_rank + self.bank as usize
    }
}

/// Maps addresses to (channel, rank, bank, row, column).
///
/// The layout is fixed at construction. Decoding is pure and, for addresses
/// inside the configured range, exactly inverted by [`AddressInterleaver::encode`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AddressInterleaver {
    order: [Field; 5],
    base: address,
    memory_size: u64,
    num_channels: u64,
    num_ranks: u64,
    num_banks: u64,

    channel: Mask,
    rank: Mask,
    bank: Mask,
    row: Mask,
    column: Mask,

    channel_xor: Option<Mask>,
    bank_xor: bool,
}

impl std::fmt::Display for AddressInterleaver {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("AddressInterleaver")
            .field("order", &self.order.iter().join(""))
            .field("num_channels", &self.num_channels)
            .field("num_ranks", &self.num_ranks)
            .field("num_banks", &self.num_banks)
            .finish()
    }
}

impl AddressInterleaver {
    pub fn new(config: &config::Config) -> Result<Self, ConfigError> {
        let order = parse_order(&config.address_interleave_order)?;
        for (name, value) in [
            ("channel_count", config.channel_count as u64),
            ("banks_per_channel", config.banks_per_channel as u64),
            ("ranks_per_channel", config.ranks_per_channel as u64),
            ("line_size", config.line_size),
            ("row_buffer_size", config.row_buffer_size),
        ] {
            if !is_power_of_two(value) {
                return Err(ConfigError::NotPowerOfTwo { name, value });
            }
        }
        if config.row_buffer_size < config.line_size {
            return Err(ConfigError::RowBufferTooSmall {
                row_buffer_size: config.row_buffer_size,
                line_size: config.line_size,
            });
        }

        let offset_bits = config.line_size.ilog2();
        let width = |field: Field| -> u32 {
            match field {
                Field::Channel => (config.channel_count as u64).ilog2(),
                Field::Rank => (config.ranks_per_channel as u64).ilog2(),
                Field::Bank => (config.banks_per_channel as u64).ilog2(),
                Field::Column => (config.row_buffer_size / config.line_size).ilog2(),
                Field::Row => 0,
            }
        };
        let fixed_bits: u32 = offset_bits + order.iter().copied().map(width).sum::<u32>();
        let total_bits = config
            .memory_size
            .checked_next_power_of_two()
            .map_or(64, u64::ilog2);
        if config.memory_size == 0 || total_bits < fixed_bits {
            return Err(ConfigError::RangeTooSmall {
                memory_size: config.memory_size,
                required_bits: fixed_bits,
            });
        }
        let row_bits = total_bits - fixed_bits;

        let mut masks = [Mask::from(0); 5];
        let mut pos = offset_bits;
        for field in order.iter().rev() {
            let bits = match field {
                Field::Row => row_bits,
                other => width(*other),
            };
            masks[*field as usize] = Mask::contiguous(pos, bits);
            pos += bits;
        }
        let offset = Mask::contiguous(0, offset_bits);
        let column = Mask::from(masks[Field::Column as usize].mask | offset.mask);
        let channel = masks[Field::Channel as usize];

        let channel_bits = width(Field::Channel);
        let channel_xor = match config.channel_xor_low_bit {
            Some(low) if channel_bits > 0 => {
                let high = low + channel_bits;
                let xor = Mask::contiguous(low, channel_bits);
                if high > total_bits || xor.mask & channel.mask != 0 {
                    return Err(ConfigError::InvalidXorBits { low, high });
                }
                Some(xor)
            }
            _ => None,
        };

        log::debug!(
            "interleave {}: offset={} channel={:?} rank={:?} bank={:?} row={:?} column={:?}",
            order.iter().join(""),
            offset_bits,
            channel,
            masks[Field::Rank as usize],
            masks[Field::Bank as usize],
            masks[Field::Row as usize],
            column,
        );

        Ok(Self {
            order,
            base: config.base_address,
            memory_size: config.memory_size,
            num_channels: config.channel_count as u64,
            num_ranks: config.ranks_per_channel as u64,
            num_banks: config.banks_per_channel as u64,
            channel,
            rank: masks[Field::Rank as usize],
            bank: masks[Field::Bank as usize],
            row: masks[Field::Row as usize],
            column,
            channel_xor,
            bank_xor: config.bank_xor,
        })
    }

    #[must_use]
    pub fn order(&self) -> &[Field; 5] {
        &self.order
    }

    #[must_use]
    pub fn contains(&self, addr: address) -> bool {
        addr >= self.base && addr - self.base < self.memory_size
    }

    #[must_use]
    pub fn num_rows(&self) -> u64 {
        1u64 << self.row.mask.count_ones()
    }

    /// Bytes per row buffer.
    #[must_use]
    pub fn row_size(&self) -> u64 {
        1u64 << self.column.mask.count_ones()
    }

    #[must_use]
    pub fn num_channels(&self) -> u64 {
        self.num_channels
    }

    #[must_use]
    pub fn num_ranks(&self) -> u64 {
        self.num_ranks
    }

    /// Banks per rank.
    #[must_use]
    pub fn num_banks(&self) -> u64 {
        self.num_banks
    }

    /// Decodes an address.
    ///
    /// Bits above the configured range are ignored.
    #[must_use]
    pub fn decode(&self, addr: address) -> PhysicalAddress {
        let local = addr.wrapping_sub(self.base);
        let mut tlx = PhysicalAddress {
            channel: self.channel.extract(local),
            rank: self.rank.extract(local),
            bank: self.bank.extract(local),
            row: self.row.extract(local),
            column: self.column.extract(local),
        };
        if let Some(xor) = self.channel_xor {
            tlx.channel ^= xor.extract(local);
        }
        if self.bank_xor {
            tlx.bank ^= tlx.row & (self.num_banks - 1);
        }
        debug_assert!(tlx.channel < self.num_channels);
        debug_assert!(tlx.rank < self.num_ranks);
        debug_assert!(tlx.bank < self.num_banks);
        tlx
    }

    /// Encodes a physical location back into an address.
    #[must_use]
    pub fn encode(&self, tlx: &PhysicalAddress) -> address {
        let mut bank = tlx.bank & (self.num_banks - 1);
        if self.bank_xor {
            bank ^= tlx.row & (self.num_banks - 1);
        }
        let mut local = self.rank.insert(tlx.rank)
            | self.bank.insert(bank)
            | self.row.insert(tlx.row)
            | self.column.insert(tlx.column);
        let mut channel = tlx.channel & (self.num_channels - 1);
        if let Some(xor) = self.channel_xor {
            // the xor source bits are disjoint from the channel field
            channel ^= xor.extract(local);
        }
        local |= self.channel.insert(channel);
        self.base.wrapping_add(local)
    }
}

#[cfg(test)]
mod tests {
    use super::{AddressInterleaver, Field, PhysicalAddress};
    use crate::config::{Config, ConfigError};
    use color_eyre::eyre;

    fn bit_str(n: u64) -> String {
        format!("{n:064b}")
    }

    #[test]
    fn test_parse_order() -> eyre::Result<()> {
        assert_eq!(
            super::parse_order("RoRaBaCoCh")?,
            [
                Field::Row,
                Field::Rank,
                Field::Bank,
                Field::Column,
                Field::Channel
            ]
        );
        assert!(super::parse_order("RoRaBaChCo").is_ok());
        assert!(super::parse_order("RoRoBaCoCh").is_err());
        assert!(super::parse_order("RoRaBaCo").is_err());
        assert!(super::parse_order("rorabacoch").is_err());
        assert!(super::parse_order("RoRaBaCoChRo").is_err());
        Ok(())
    }

    #[test]
    fn test_mask_limit() {
        assert_eq!(super::mask_limit(0), (0, 64));
        assert_eq!(super::mask_limit(0b0111_0000_1000_0000), (7, 15));
        assert_eq!(super::mask_limit(0b1_1111), (0, 5));
    }

    #[test]
    fn test_packbits() {
        use super::{packbits, unpackbits};
        assert_eq!(packbits(0, 0xFFFF_FFFF_FFFF_FFFF, 0, 64), 0);
        assert_eq!(packbits(0xFFFF_FFFF_FFFF_FFFF, 15, 0, 4), 15);
        assert_eq!(packbits(0b1010_0000, 0b1000_0000, 5, 8), 0b10);
        assert_eq!(unpackbits(0b1010_0000, 0b10, 5, 8), 0b1000_0000);
        assert_eq!(
            packbits(0xFFFF_FFFF_FFFF_FFFF, 0xFFFF_FFFF_FFFF_FFFF, 64, 255),
            0
        );
    }

    #[test]
    fn test_ro_ra_ba_co_ch_layout() -> eyre::Result<()> {
        let config = Config {
            channel_count: 4,
            banks_per_channel: 8,
            line_size: 64,
            row_buffer_size: 1024,
            memory_size: 1 << 20,
            address_interleave_order: "RoRaBaCoCh".to_string(),
            ..Config::default()
        };
        let interleaver = AddressInterleaver::new(&config)?;
        // 6 offset bits, 2 channel bits, 4 column bits, 3 bank bits, 5 row bits
        assert_eq!(
            bit_str(interleaver.channel.mask),
            bit_str(0b0000_0000_0000_1100_0000)
        );
        assert_eq!(
            bit_str(interleaver.column.mask),
            bit_str(0b0000_0000_1111_0011_1111)
        );
        assert_eq!(
            bit_str(interleaver.bank.mask),
            bit_str(0b0000_0111_0000_0000_0000)
        );
        assert_eq!(
            bit_str(interleaver.row.mask),
            bit_str(0b1111_1000_0000_0000_0000)
        );
        assert_eq!(interleaver.rank.mask, 0);

        // consecutive lines go to consecutive channels
        for line in 0..8u64 {
            let tlx = interleaver.decode(line * 64);
            assert_eq!(tlx.channel, line % 4);
            assert_eq!(tlx.column, (line / 4) * 64);
        }
        Ok(())
    }

    #[test]
    fn test_ro_ra_ba_ch_co_layout() -> eyre::Result<()> {
        let config = Config {
            channel_count: 2,
            banks_per_channel: 4,
            row_buffer_size: 1024,
            memory_size: 1 << 20,
            address_interleave_order: "RoRaBaChCo".to_string(),
            ..Config::default()
        };
        let interleaver = AddressInterleaver::new(&config)?;
        // a whole row buffer maps to the same channel and bank
        let first = interleaver.decode(0);
        let last = interleaver.decode(1023);
        assert_eq!((first.channel, first.bank, first.row), (0, 0, 0));
        assert_eq!((last.channel, last.bank, last.row), (0, 0, 0));
        assert_eq!(last.column, 1023);
        assert_eq!(interleaver.decode(1024).channel, 1);
        assert_eq!(interleaver.decode(2048).bank, 1);
        Ok(())
    }

    #[test]
    fn test_decode_is_deterministic_and_invertible() -> eyre::Result<()> {
        let configs = [
            Config {
                channel_count: 4,
                banks_per_channel: 8,
                ranks_per_channel: 2,
                memory_size: 1 << 24,
                ..Config::default()
            },
            Config {
                channel_count: 8,
                banks_per_channel: 16,
                memory_size: 1 << 26,
                base_address: 0x8000_0000,
                address_interleave_order: "RoCoRaBaCh".to_string(),
                channel_xor_low_bit: Some(20),
                bank_xor: true,
                ..Config::default()
            },
        ];
        for config in configs {
            let interleaver = AddressInterleaver::new(&config)?;
            let mut addr = config.base_address;
            let end = config.base_address + config.memory_size;
            while addr < end {
                let tlx = interleaver.decode(addr);
                assert_eq!(tlx, interleaver.decode(addr));
                assert_eq!(interleaver.encode(&tlx), addr, "{tlx}");
                // co-prime stride to visit many different bit patterns
                addr += 4093;
            }
        }
        Ok(())
    }

    #[test]
    fn test_channel_xor_spreads_strides() -> eyre::Result<()> {
        let base = Config {
            channel_count: 4,
            memory_size: 1 << 24,
            address_interleave_order: "RoRaBaCoCh".to_string(),
            ..Config::default()
        };
        let plain = AddressInterleaver::new(&base)?;
        let xored = AddressInterleaver::new(&Config {
            channel_xor_low_bit: Some(16),
            ..base
        })?;
        // a stride of 64KiB always hits the same channel without xor
        let stride = 1u64 << 16;
        let plain_channels: std::collections::HashSet<_> =
            (0..4).map(|i| plain.decode(i * stride).channel).collect();
        let xored_channels: std::collections::HashSet<_> =
            (0..4).map(|i| xored.decode(i * stride).channel).collect();
        assert_eq!(plain_channels.len(), 1);
        assert_eq!(xored_channels.len(), 4);
        Ok(())
    }

    #[test]
    fn test_invalid_xor_bits() {
        let config = Config {
            channel_count: 4,
            address_interleave_order: "RoRaBaCoCh".to_string(),
            channel_xor_low_bit: Some(6),
            ..Config::default()
        };
        assert_eq!(
            AddressInterleaver::new(&config),
            Err(ConfigError::InvalidXorBits { low: 6, high: 8 })
        );
    }

    #[test]
    fn test_range_too_small() {
        let config = Config {
            channel_count: 4,
            memory_size: 1024,
            ..Config::default()
        };
        assert!(matches!(
            AddressInterleaver::new(&config),
            Err(ConfigError::RangeTooSmall { .. })
        ));
    }

    #[test]
    fn test_contains() -> eyre::Result<()> {
        let config = Config {
            base_address: 0x1000_0000,
            memory_size: 1 << 20,
            ..Config::default()
        };
        let interleaver = AddressInterleaver::new(&config)?;
        assert!(!interleaver.contains(0x0FFF_FFFF));
        assert!(interleaver.contains(0x1000_0000));
        assert!(interleaver.contains(0x1000_0000 + (1 << 20) - 1));
        assert!(!interleaver.contains(0x1000_0000 + (1 << 20)));
        Ok(())
    }

    #[test]
    fn test_bank_index() {
        let tlx = PhysicalAddress {
            rank: 1,
            bank: 3,
            ..PhysicalAddress::default()
        };
        assert_eq!(tlx.bank_index(8), 11);
    }
}
