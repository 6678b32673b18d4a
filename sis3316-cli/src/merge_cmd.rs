//! `sis3316 merge`: k-way merge several raw event files, optionally grouped
//! into coincidences and filtered by named triggers.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use anyhow::{Context, Result};

use sis3316_codec::ParsedEvent;
use sis3316_readout::{CoincidenceEngine, DelayTable, EndBehavior, FilteredCoincidence, Merger};
use sis3316_regs::Trigger;

pub fn run(
    files: &[std::path::PathBuf],
    trigger_specs: &[String],
    coinc: bool,
    window: i64,
    delay_specs: &[String],
) -> Result<()> {
    let delays = parse_delays(delay_specs)?;
    let triggers = trigger_specs
        .iter()
        .map(|s| parse_trigger(s))
        .collect::<Result<Vec<_>>>()?;

    let readers = files
        .iter()
        .map(|f| open_reader(f))
        .collect::<Result<Vec<_>>>()?;

    let merger = Merger::new(readers, delays.clone(), EndBehavior::Finite);

    if coinc || !triggers.is_empty() {
        let mut engine = CoincidenceEngine::new(merger, window, move |e: &ParsedEvent| {
            e.ts as i64 - delays.get(&e.chan).copied().unwrap_or(0)
        });
        if triggers.is_empty() {
            while let Some(group) = engine.next_group() {
                print_group(&group);
            }
        } else {
            for (name, event) in FilteredCoincidence::new(engine, triggers) {
                println!("{name} chan={} ts={}", event.chan, event.ts);
            }
        }
    } else {
        for event in merger {
            println!("chan={} ts={}", event.chan, event.ts);
        }
    }
    Ok(())
}

fn print_group(group: &[ParsedEvent]) {
    let rendered: Vec<String> = group
        .iter()
        .map(|e| format!("(chan={},ts={})", e.chan, e.ts))
        .collect();
    println!("group: {}", rendered.join(" "));
}

fn open_reader(path: &Path) -> Result<Box<dyn Iterator<Item = ParsedEvent>>> {
    let f = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let len = f.metadata()?.len();
    let reader = sis3316_readout::ChannelReader::with_total_len(BufReader::new(f), len);
    Ok(Box::new(reader))
}

/// Parses repeated `chan:delay` arguments into a `DelayTable`.
fn parse_delays(specs: &[String]) -> Result<DelayTable> {
    let mut table = DelayTable::new();
    for spec in specs {
        let (chan, delay) = spec
            .split_once(':')
            .with_context(|| format!("delay spec {spec:?} must be chan:delay"))?;
        let chan: u16 = chan.parse().with_context(|| format!("bad channel in {spec:?}"))?;
        let delay: i64 = delay.parse().with_context(|| format!("bad delay in {spec:?}"))?;
        table.insert(chan, delay);
    }
    Ok(table)
}

/// Parses one `name:ch1,ch2,...` trigger argument.
fn parse_trigger(spec: &str) -> Result<Trigger> {
    let (name, chans) = spec
        .split_once(':')
        .with_context(|| format!("trigger spec {spec:?} must be name:ch1,ch2,..."))?;
    let channels = chans
        .split(',')
        .map(|c| c.trim().parse::<u8>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("bad channel list in {spec:?}"))?;
    Trigger::new(name, channels).map_err(|_| anyhow::anyhow!("trigger {name:?}: empty channel set"))
}
