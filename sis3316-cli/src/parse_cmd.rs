//! `sis3316 parse`: decode one raw event file and print events as text.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use anyhow::{Context, Result};

use sis3316_codec::ParsedEvent;
use sis3316_readout::ChannelReader;

const DEFAULT_FIELDS: &[&str] = &["chan", "ts", "n_raw", "n_avg"];

pub fn run(file: &Path, fields: &[String]) -> Result<()> {
    let f = File::open(file).with_context(|| format!("opening {}", file.display()))?;
    let len = f.metadata()?.len();
    let reader = ChannelReader::with_total_len(BufReader::new(f), len);

    let fields: Vec<&str> = if fields.is_empty() {
        DEFAULT_FIELDS.to_vec()
    } else {
        fields.iter().map(String::as_str).collect()
    };

    for event in reader {
        println!("{}", format_event(&event, &fields));
    }
    Ok(())
}

fn format_event(e: &ParsedEvent, fields: &[&str]) -> String {
    fields
        .iter()
        .map(|&field| format_field(e, field))
        .collect::<Vec<_>>()
        .join(" ")
}

fn format_field(e: &ParsedEvent, field: &str) -> String {
    match field {
        "chan" => format!("chan={}", e.chan),
        "ts" => format!("ts={}", e.ts),
        "n_raw" => format!("n_raw={}", e.raw.len()),
        "n_avg" => format!("n_avg={}", e.avg.len()),
        "maw_ena" => format!("maw_ena={}", e.maw_ena),
        "size" => format!("size={}", e.size_in_bytes),
        "raw" => format!(
            "raw=[{}]",
            e.raw.iter().map(i16::to_string).collect::<Vec<_>>().join(",")
        ),
        "avg" => format!(
            "avg=[{}]",
            e.avg.iter().map(i16::to_string).collect::<Vec<_>>().join(",")
        ),
        "peak" => match &e.sub_blocks.peak_accum {
            Some(p) => format!("peak={}", p.peak),
            None => "peak=".to_string(),
        },
        "maw_max" => match &e.sub_blocks.maw {
            Some(m) => format!("maw_max={}", m.maw_max),
            None => "maw_max=".to_string(),
        },
        other => format!("{other}=?"),
    }
}
