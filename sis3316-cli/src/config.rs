//! Configuration document: a `serde`-derived mirror of the nested
//! key/value module configuration. Loading/saving lives only here —
//! `sis3316-regs` stays I/O-free — but validation is delegated to it so the
//! same `InvalidArgument` rule applies whether a value came from this file
//! or from a running program.

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use serde::Deserialize;

use sis3316_regs::{channel_params, ChannelIndex, GroupIndex, SumTrigger, Trigger};

#[derive(Debug, Deserialize, Default)]
pub struct ModuleConfig {
    /// Host-chosen link-arbitration timeout, informational at this layer.
    #[serde(default)]
    pub link_timeout_ms: Option<u64>,
    #[serde(default)]
    pub groups: BTreeMap<u8, GroupConfig>,
    #[serde(default)]
    pub channels: BTreeMap<u8, ChannelConfig>,
    #[serde(default)]
    pub triggers: BTreeMap<String, TriggerConfig>,
    #[serde(default)]
    pub sum_triggers: BTreeMap<u8, SumTriggerConfig>,
}

#[derive(Debug, Deserialize, Default)]
pub struct GroupConfig {
    pub maw_trailer_len_words: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
pub struct ChannelConfig {
    pub gain: Option<u32>,
    pub termination: Option<u32>,
    pub flags: Option<u32>,
    pub event_format_mask: Option<u32>,
    pub event_maw_ena: Option<u32>,
    pub intern_trig_delay: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct TriggerConfig {
    pub channels: Vec<u8>,
}

#[derive(Debug, Deserialize)]
pub struct SumTriggerConfig {
    pub threshold: u32,
}

impl ModuleConfig {
    /// Check every entry against the parameter tables without touching the
    /// network: out-of-range group/channel indices, mask-violating values,
    /// and empty trigger channel-sets are all rejected here, before a run
    /// ever opens a socket.
    pub fn validate(&self) -> Result<()> {
        for (&global, chan) in &self.channels {
            let idx = ChannelIndex::from_global(global)
                .map_err(|_| anyhow::anyhow!("channel {global} out of range"))?;
            chan.validate(idx)?;
        }
        for &group in self.groups.keys() {
            GroupIndex::new(group).map_err(|_| anyhow::anyhow!("group {group} out of range"))?;
        }
        for (name, t) in &self.triggers {
            Trigger::new(name.clone(), t.channels.clone())
                .map_err(|_| anyhow::anyhow!("trigger {name:?}: invalid or empty channel set"))?;
        }
        for (&group, t) in &self.sum_triggers {
            let idx = GroupIndex::new(group).map_err(|_| anyhow::anyhow!("sum trigger group {group} out of range"))?;
            let _ = SumTrigger {
                group: idx,
                threshold: t.threshold,
            };
        }
        Ok(())
    }
}

impl ChannelConfig {
    fn validate(&self, ch: ChannelIndex) -> Result<()> {
        let checks: &[(&str, Option<u32>, &sis3316_regs::ChannelParam)] = &[
            ("gain", self.gain, &channel_params::GAIN),
            ("termination", self.termination, &channel_params::TERMINATION),
            ("flags", self.flags, &channel_params::FLAGS),
            (
                "event_format_mask",
                self.event_format_mask,
                &channel_params::EVENT_FORMAT_MASK,
            ),
            (
                "event_maw_ena",
                self.event_maw_ena,
                &channel_params::EVENT_MAW_ENA,
            ),
            (
                "intern_trig_delay",
                self.intern_trig_delay,
                &channel_params::INTERN_TRIG_DELAY,
            ),
        ];
        for (name, value, param) in checks {
            let Some(value) = value else { continue };
            let d = param.descriptor(ch);
            if d.set_field(0, *value).is_err() {
                bail!("channel {}: {name} = {value} does not fit its field", ch.global());
            }
        }
        Ok(())
    }
}
