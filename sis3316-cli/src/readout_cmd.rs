//! `sis3316 readout`: the live bank-toggle drain loop, wired to a real UDP
//! socket and one append-only file per global channel.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use log::info;

use sis3316_device::{Bank, BankController, RegisterService};
use sis3316_regs::{module_params, ChannelIndex};
use sis3316_transport::{FileSink, StdUdpSocket, Transport};

use crate::config::ModuleConfig;

const DEFAULT_LOCAL_BIND: &str = "0.0.0.0:0";

pub fn run(
    host: &str,
    port: u16,
    channels: &[u8],
    output_prefix: &str,
    config: Option<&ModuleConfig>,
) -> Result<()> {
    let channels: Vec<u8> = if channels.is_empty() {
        (0..sis3316_regs::CHAN_TOTAL as u8).collect()
    } else {
        channels.to_vec()
    };

    let remote = format!("{host}:{port}");
    let sock = StdUdpSocket::connect(DEFAULT_LOCAL_BIND, &remote)
        .with_context(|| format!("connecting to {remote}"))?;
    let transport = Transport::new(sock, false);
    let mut regs = RegisterService::new(transport);

    let grant_mask = module_params::LINK_GRANT.mask << module_params::LINK_GRANT.offset;
    regs.transport_mut()
        .open_link(sis3316_regs::addr::LINK_ARBITRATION_REG, grant_mask)
        .context("opening link interface")?;

    if let Some(config) = config {
        apply_config(&mut regs, config)?;
    }

    let mut sinks = open_sinks(&channels, output_prefix)?;
    let mut ctrl = BankController::new(regs);
    ctrl.arm(Bank::Bank0)?;

    let stop = Arc::new(AtomicBool::new(false));
    let stop_writer = stop.clone();
    ctrlc::set_handler(move || stop_writer.store(true, Ordering::SeqCst))
        .context("installing SIGINT handler")?;

    info!("readout started on {remote}, draining {} channel(s)", channels.len());
    while !stop.load(Ordering::SeqCst) {
        ctrl.mem_toggle()?;
        for &global in &channels {
            let idx = ChannelIndex::from_global(global)
                .map_err(|_| anyhow::anyhow!("channel {global} out of range"))?;
            let sink = sinks.get_mut(&global).expect("sink opened for every requested channel");
            match ctrl.drain_channel(idx.group.0, global, sink) {
                Ok(n) if n > 0 => info!("channel {global}: drained {n} bytes"),
                Ok(_) => {}
                Err(e) => log::warn!("channel {global}: drain failed: {e}"),
            }
        }
    }

    ctrl.regs_mut()
        .transport_mut()
        .close_link(sis3316_regs::addr::LINK_ARBITRATION_REG)
        .context("closing link interface")?;
    info!("readout stopped");
    Ok(())
}

fn apply_config(regs: &mut RegisterService<StdUdpSocket>, config: &ModuleConfig) -> Result<()> {
    for (&global, chan_cfg) in &config.channels {
        let idx = ChannelIndex::from_global(global)
            .map_err(|_| anyhow::anyhow!("channel {global} out of range"))?;
        apply_channel_config(regs, idx, chan_cfg)?;
    }
    for (&group, group_cfg) in &config.groups {
        let idx = sis3316_regs::GroupIndex::new(group)
            .map_err(|_| anyhow::anyhow!("group {group} out of range"))?;
        if let Some(words) = group_cfg.maw_trailer_len_words {
            let base = sis3316_regs::group_params::MAW_TRAILER_LEN_WORDS;
            let d = sis3316_regs::BitfieldDescriptor {
                reg: idx.reg(base.reg),
                ..base
            };
            regs.set_field(&d, words)?;
        }
    }
    Ok(())
}

fn apply_channel_config(
    regs: &mut RegisterService<StdUdpSocket>,
    ch: ChannelIndex,
    cfg: &crate::config::ChannelConfig,
) -> Result<()> {
    use sis3316_regs::channel_params;
    let fields: &[(Option<u32>, &sis3316_regs::ChannelParam)] = &[
        (cfg.gain, &channel_params::GAIN),
        (cfg.termination, &channel_params::TERMINATION),
        (cfg.flags, &channel_params::FLAGS),
        (cfg.event_format_mask, &channel_params::EVENT_FORMAT_MASK),
        (cfg.event_maw_ena, &channel_params::EVENT_MAW_ENA),
        (cfg.intern_trig_delay, &channel_params::INTERN_TRIG_DELAY),
    ];
    for (value, param) in fields {
        if let Some(value) = value {
            regs.set_field(&param.descriptor(ch), *value)?;
        }
    }
    Ok(())
}

fn open_sinks(channels: &[u8], prefix: &str) -> Result<HashMap<u8, FileSink>> {
    let mut sinks = HashMap::new();
    for &global in channels {
        let path = PathBuf::from(format!("{prefix}{global:02}.dat"));
        let sink = FileSink::create_or_append(&path)
            .with_context(|| format!("opening {}", path.display()))?;
        sinks.insert(global, sink);
    }
    Ok(sinks)
}
