//! Bitfield descriptors and the module/group/channel/trigger parameter
//! tables used to turn a logical configuration value into a register
//! read-modify-write.
//!
//! This crate performs no I/O: it is the "compile-time parameter table"
//! called for by the design notes, consumed by a generic driver that does
//! own a transport (`sis3316-device`).

use std::fmt;

pub const GROUP_COUNT: usize = 4;
pub const CHAN_PER_GROUP: usize = 4;
pub const CHAN_TOTAL: usize = GROUP_COUNT * CHAN_PER_GROUP;
pub const TRIGGER_TOTAL: usize = CHAN_TOTAL;
pub const SUM_TRIGGER_TOTAL: usize = GROUP_COUNT;

/// Per-group register stride, in words. Illustrative: the actual value is
/// part of the device's register catalog, a data table external to this
/// crate's mechanism (see the parameter tables below).
pub const GROUP_REG_STRIDE: u32 = 0x1000;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RegsError {
    /// A value doesn't fit `mask`, or a positional index is out of range.
    InvalidArgument,
}

impl fmt::Display for RegsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegsError::InvalidArgument => write!(f, "invalid argument"),
        }
    }
}

impl std::error::Error for RegsError {}

/// How a raw register value maps to the value exposed to callers.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Scale {
    /// Exposed value equals the raw field value.
    Identity,
    /// Raw field stores `exposed / n`; e.g. a delay field stored as
    /// `value / 2` on the wire (see `intern_trig_delay` in the original
    /// driver's channel parameter table).
    DivBy(u32),
}

impl Scale {
    pub fn to_raw(self, exposed: u32) -> u32 {
        match self {
            Scale::Identity => exposed,
            Scale::DivBy(n) => exposed / n,
        }
    }

    pub fn from_raw(self, raw: u32) -> u32 {
        match self {
            Scale::Identity => raw,
            Scale::DivBy(n) => raw * n,
        }
    }
}

/// `(register, offset, mask, doc)` plus optional scaling, as described by
/// the data model: reads return `(word >> offset) & mask`, descaled; writes
/// validate the scaled value against `mask` and read-modify-write.
#[derive(Copy, Clone, Debug)]
pub struct BitfieldDescriptor {
    pub reg: u32,
    pub offset: u32,
    pub mask: u32,
    pub scale: Scale,
    pub doc: &'static str,
}

impl BitfieldDescriptor {
    pub const fn new(reg: u32, offset: u32, mask: u32, doc: &'static str) -> Self {
        Self {
            reg,
            offset,
            mask,
            scale: Scale::Identity,
            doc,
        }
    }

    pub const fn scaled(mut self, scale: Scale) -> Self {
        self.scale = scale;
        self
    }

    /// Extract and descale this field from an already-read register word.
    pub fn get_field(&self, word: u32) -> u32 {
        let raw = (word >> self.offset) & self.mask;
        self.scale.from_raw(raw)
    }

    /// Produce the new register word to write, given the previously-read
    /// `word` and the exposed (unscaled) `value`. Fails with
    /// `InvalidArgument` if the scaled value doesn't fit `mask`.
    pub fn set_field(&self, word: u32, value: u32) -> Result<u32, RegsError> {
        let raw = self.scale.to_raw(value);
        if raw & !self.mask != 0 {
            return Err(RegsError::InvalidArgument);
        }
        let cleared = word & !(self.mask << self.offset);
        Ok(cleared | ((raw & self.mask) << self.offset))
    }
}

/// Positional identity of a group (0..GROUP_COUNT).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct GroupIndex(pub u8);

impl GroupIndex {
    pub fn new(idx: u8) -> Result<Self, RegsError> {
        if (idx as usize) < GROUP_COUNT {
            Ok(Self(idx))
        } else {
            Err(RegsError::InvalidArgument)
        }
    }

    /// The address of `base_reg` as instantiated for this group.
    pub fn reg(&self, base_reg: u32) -> u32 {
        base_reg + self.0 as u32 * GROUP_REG_STRIDE
    }
}

/// Positional identity of a channel: group index 0..3, channel-within-group
/// index 0..3. `global()` is `group*4 + chan`, matching the data model.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct ChannelIndex {
    pub group: GroupIndex,
    pub chan: u8,
}

impl ChannelIndex {
    pub fn new(group: u8, chan: u8) -> Result<Self, RegsError> {
        if (chan as usize) >= CHAN_PER_GROUP {
            return Err(RegsError::InvalidArgument);
        }
        Ok(Self {
            group: GroupIndex::new(group)?,
            chan,
        })
    }

    pub fn from_global(global: u8) -> Result<Self, RegsError> {
        if global as usize >= CHAN_TOTAL {
            return Err(RegsError::InvalidArgument);
        }
        Self::new(global / CHAN_PER_GROUP as u8, global % CHAN_PER_GROUP as u8)
    }

    pub fn global(&self) -> u8 {
        self.group.0 * CHAN_PER_GROUP as u8 + self.chan
    }

    /// Channels within a group commonly share one register, packed into
    /// `bits_per_channel`-wide lanes (e.g. the analog control register packs
    /// four channels' gain/termination bits into one 32-bit word per
    /// group). This returns the bit offset of this channel's lane.
    pub fn lane_offset(&self, bits_per_channel: u32) -> u32 {
        self.chan as u32 * bits_per_channel
    }
}

/// A named channel-scoped parameter: register + per-channel lane layout.
#[derive(Copy, Clone, Debug)]
pub struct ChannelParam {
    pub name: &'static str,
    base_reg: u32,
    /// Bit offset of channel 0's lane; other channels are
    /// `lane_offset + chan * bits_per_channel`.
    lane_offset: u32,
    bits_per_channel: u32,
    mask: u32,
    scale: Scale,
    pub doc: &'static str,
}

impl ChannelParam {
    pub const fn new(
        name: &'static str,
        base_reg: u32,
        lane_offset: u32,
        bits_per_channel: u32,
        mask: u32,
        doc: &'static str,
    ) -> Self {
        Self {
            name,
            base_reg,
            lane_offset,
            bits_per_channel,
            mask,
            scale: Scale::Identity,
            doc,
        }
    }

    pub const fn scaled(mut self, scale: Scale) -> Self {
        self.scale = scale;
        self
    }

    /// The concrete bitfield descriptor for a given channel's instance of
    /// this parameter.
    pub fn descriptor(&self, ch: ChannelIndex) -> BitfieldDescriptor {
        BitfieldDescriptor {
            reg: ch.group.reg(self.base_reg),
            offset: self.lane_offset + ch.lane_offset(self.bits_per_channel),
            mask: self.mask,
            scale: self.scale,
            doc: self.doc,
        }
    }
}

/// Register addresses used by more than one parameter table, illustrative
/// of the external "register catalog" the data model refers to.
pub mod addr {
    pub const ANALOG_CTRL_REG: u32 = 0x0100;
    pub const EVENT_CONFIG_REG: u32 = 0x0104;
    pub const DATAFORMAT_CONFIG_REG: u32 = 0x0108;
    pub const ADC_TRIGGER_DELAY_REG: u32 = 0x010C;
    pub const LINK_ARBITRATION_REG: u32 = 0x0000;
}

/// Channel-scoped configuration parameters, mirroring the original driver's
/// per-channel property table (gain/termination/flags/format/delay).
pub mod channel_params {
    use super::*;

    pub const GAIN: ChannelParam =
        ChannelParam::new("gain", addr::ANALOG_CTRL_REG, 0, 8, 0b11, "ADC input gain switch (0=5V,1=2V,2=1.9V)");

    pub const TERMINATION: ChannelParam =
        ChannelParam::new("termination", addr::ANALOG_CTRL_REG, 3, 8, 0b1, "50 ohm input termination enable");

    pub const FLAGS: ChannelParam =
        ChannelParam::new("flags", addr::EVENT_CONFIG_REG, 0, 8, 0xFF, "trigger/gate/veto source flag bits");

    pub const EVENT_FORMAT_MASK: ChannelParam = ChannelParam::new(
        "event_format_mask",
        addr::DATAFORMAT_CONFIG_REG,
        0,
        8,
        0xF,
        "event sub-block selector (fmt nibble)",
    );

    pub const EVENT_MAW_ENA: ChannelParam =
        ChannelParam::new("event_maw_ena", addr::DATAFORMAT_CONFIG_REG, 4, 8, 0b1, "attach MAW trailer to events");

    /// Stored on the wire as `value / 2`.
    pub const INTERN_TRIG_DELAY: ChannelParam =
        ChannelParam::new("intern_trig_delay", addr::ADC_TRIGGER_DELAY_REG, 0, 16, 0xFFF, "internal trigger delay")
            .scaled(Scale::DivBy(2));

    pub const ALL: &[ChannelParam] = &[
        GAIN,
        TERMINATION,
        FLAGS,
        EVENT_FORMAT_MASK,
        EVENT_MAW_ENA,
        INTERN_TRIG_DELAY,
    ];

    pub fn by_name(name: &str) -> Option<&'static ChannelParam> {
        ALL.iter().find(|p| p.name == name)
    }
}

/// Group-scoped parameters (one instance per group, not per channel).
pub mod group_params {
    use super::*;

    pub const MAW_TRAILER_LEN_WORDS: BitfieldDescriptor =
        BitfieldDescriptor::new(addr::DATAFORMAT_CONFIG_REG, 16, 0xFFFF, "configured MAW trailer length, in words");
}

/// Module-scoped (global) parameters.
pub mod module_params {
    use super::*;

    pub const LINK_GRANT: BitfieldDescriptor =
        BitfieldDescriptor::new(addr::LINK_ARBITRATION_REG, 20, 0b1, "link interface grant bit");
}

/// A named trigger: a set of channels that must all fire within a
/// coincidence window. Construction rejects an empty set per the testable
/// property "empty trigger channel-set: reject at config time".
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Trigger {
    pub name: String,
    pub channels: Vec<u8>,
}

impl Trigger {
    pub fn new(name: impl Into<String>, channels: Vec<u8>) -> Result<Self, RegsError> {
        if channels.is_empty() {
            return Err(RegsError::InvalidArgument);
        }
        for &c in &channels {
            if c as usize >= CHAN_TOTAL {
                return Err(RegsError::InvalidArgument);
            }
        }
        Ok(Self {
            name: name.into(),
            channels,
        })
    }

    pub fn is_subset_of(&self, present: &[u8]) -> bool {
        self.channels.iter().all(|c| present.contains(c))
    }
}

/// A per-group sum trigger, summing across that group's four channels.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SumTrigger {
    pub group: GroupIndex,
    pub threshold: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitfield_round_trip_scenario() {
        let d = BitfieldDescriptor::new(0x100, 8, 0xF, "test field");
        let word = 0xDEAD_BEEFu32;
        let updated = d.set_field(word, 0xA).unwrap();
        assert_eq!(updated, 0xDEAD_BAEF);
        assert_eq!(d.get_field(updated), 0xA);
    }

    #[test]
    fn set_field_rejects_value_outside_mask() {
        let d = BitfieldDescriptor::new(0x100, 0, 0xF, "nibble");
        assert_eq!(d.set_field(0, 0x10), Err(RegsError::InvalidArgument));
    }

    #[test]
    fn set_field_preserves_bits_outside_mask() {
        let d = BitfieldDescriptor::new(0x100, 4, 0x3, "two bits");
        let word = 0b1111_0000_1111u32;
        let updated = d.set_field(word, 0b10).unwrap();
        assert_eq!(updated & !(0x3 << 4), word & !(0x3 << 4));
    }

    #[test]
    fn divby_scale_round_trips() {
        let d = channel_params::INTERN_TRIG_DELAY.descriptor(ChannelIndex::new(0, 0).unwrap());
        let updated = d.set_field(0, 40).unwrap();
        // 40 exposed -> 20 raw
        assert_eq!((updated >> d.offset) & d.mask, 20);
        assert_eq!(d.get_field(updated), 40);
    }

    #[test]
    fn channel_lanes_do_not_overlap_within_a_group() {
        let word = 0u32;
        let c0 = ChannelIndex::new(0, 0).unwrap();
        let c1 = ChannelIndex::new(0, 1).unwrap();
        let d0 = channel_params::GAIN.descriptor(c0);
        let d1 = channel_params::GAIN.descriptor(c1);
        let w = d0.set_field(word, 0b10).unwrap();
        let w = d1.set_field(w, 0b01).unwrap();
        assert_eq!(d0.get_field(w), 0b10);
        assert_eq!(d1.get_field(w), 0b01);
    }

    #[test]
    fn channel_global_index_matches_group_times_four_plus_chan() {
        let c = ChannelIndex::new(2, 3).unwrap();
        assert_eq!(c.global(), 11);
        assert_eq!(ChannelIndex::from_global(11).unwrap(), c);
    }

    #[test]
    fn empty_trigger_channel_set_is_rejected() {
        assert_eq!(
            Trigger::new("T", vec![]).unwrap_err(),
            RegsError::InvalidArgument
        );
    }

    #[test]
    fn trigger_subset_matching() {
        let t = Trigger::new("T", vec![5, 9]).unwrap();
        assert!(t.is_subset_of(&[3, 5, 9]));
        assert!(!t.is_subset_of(&[5]));
    }

    proptest::proptest! {
        #[test]
        fn bitfield_set_then_get_round_trips(
            offset in 0u32..28,
            mask_bits in 1u32..4,
            value_seed in 0u32..16,
            word in proptest::prelude::any::<u32>(),
        ) {
            let mask = (1u32 << mask_bits) - 1;
            let value = value_seed & mask;
            let d = BitfieldDescriptor::new(0x100, offset, mask, "prop field");
            let updated = d.set_field(word, value).unwrap();
            proptest::prop_assert_eq!(d.get_field(updated), value);
            proptest::prop_assert_eq!(
                updated & !(mask << offset),
                word & !(mask << offset)
            );
        }
    }
}
