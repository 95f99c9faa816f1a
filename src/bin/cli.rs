//! modbridge CLI: decode a module file and describe what came out.
//!
//! Usage:
//!   mb-cli path/to/file.dmf
//!   mb-cli path/to/file.s3m --order 3
//!   RUST_LOG=debug mb-cli path/to/file.a2m

#[path = "cli/cell_format.rs"]
mod cell_format;

use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use mb_formats::LoadOptions;
use mb_ir::{InstrumentBody, Song, Subsong};
use mb_master::Loader;

/// Inspect a tracker module through the modbridge importer
#[derive(Parser)]
#[command(name = "mb-cli", version, about, long_about = None)]
struct Cli {
    /// Module file to read
    #[arg(value_name = "FILE")]
    file: PathBuf,

    /// Dump the rows at this order position
    #[arg(long, value_name = "POS")]
    order: Option<usize>,

    /// Subsong to inspect
    #[arg(long, default_value_t = 0)]
    subsong: usize,

    /// List every instrument and sample
    #[arg(long)]
    instruments: bool,

    /// Effect columns a channel may grow to
    #[arg(long, default_value_t = 8, value_parser = clap::value_parser!(u8).range(1..=8))]
    max_effect_columns: u8,

    /// Do not guess formats from the file extension
    #[arg(long)]
    no_extension_probe: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let data = fs::read(&cli.file).with_context(|| format!("reading {}", cli.file.display()))?;
    tracing::debug!("read {} bytes from {}", data.len(), cli.file.display());

    let loader = Loader::with_options(LoadOptions {
        max_effect_columns: usize::from(cli.max_effect_columns),
        trust_extension: !cli.no_extension_probe,
        ..LoadOptions::default()
    });
    let hint = cli.file.file_name().and_then(|n| n.to_str());
    let format = loader
        .load(data, hint)
        .with_context(|| format!("decoding {}", cli.file.display()))?;

    println!("Format:      {format}");
    loader.with_song(|song| report(song, &cli))?;

    let warnings = loader.warnings();
    if !warnings.is_empty() {
        println!();
        println!("Warnings ({}):", warnings.len());
        for w in &warnings {
            println!("  {w}");
        }
    }
    Ok(())
}

fn report(song: &Song, cli: &Cli) -> Result<()> {
    println!("Title:       {}", song.name);
    if !song.author.is_empty() {
        println!("Author:      {}", song.author);
    }
    for system in &song.systems {
        println!("System:      {} ({} channels)", system.chip.name(), system.chip.channels());
    }
    println!("Subsongs:    {}", song.subsongs.len());

    let Some(sub) = song.subsongs.get(cli.subsong) else {
        bail!("subsong {} does not exist", cli.subsong);
    };
    let speeds: Vec<String> = sub.speeds.iter().map(u8::to_string).collect();
    println!("Tick rate:   {} Hz, speed {}", sub.hz, speeds.join("/"));
    println!("Channels:    {}", sub.channels.iter().filter(|c| c.visible).count());
    println!("Orders:      {}", sub.orders_len);
    println!("Patterns:    {} of {} rows", sub.pattern_count(), sub.pat_len);
    println!(
        "Instruments: {}, samples: {}, wavetables: {}",
        song.instruments.len(),
        song.samples.len(),
        song.wavetables.len()
    );

    if cli.instruments {
        list_instruments(song);
    }
    if let Some(pos) = cli.order {
        dump_order(sub, pos)?;
    }
    Ok(())
}

fn list_instruments(song: &Song) {
    println!();
    for (i, ins) in song.instruments.iter().enumerate() {
        let kind = match &ins.body {
            InstrumentBody::Fm(patch) => format!("FM {:?}, {} ops", patch.kind, patch.ops),
            InstrumentBody::Sample(_) => "sample".to_string(),
            InstrumentBody::Std(kind) => format!("{kind:?}"),
            InstrumentBody::GameBoy(_) => "Game Boy".to_string(),
            InstrumentBody::C64(_) => "C64".to_string(),
        };
        println!("  {:02X} {:<24} {} ({} macros)", i, ins.name.as_str(), kind, ins.macros.len());
    }
    for (i, s) in song.samples.iter().enumerate().filter(|(_, s)| !s.is_empty()) {
        println!("  S{:02X} {:<23} {} frames at {} Hz", i, s.name.as_str(), s.len(), s.rate);
    }
}

fn dump_order(sub: &Subsong, pos: usize) -> Result<()> {
    if pos >= sub.orders_len {
        bail!("order {} is past the end ({} orders)", pos, sub.orders_len);
    }
    let channels: Vec<_> = sub.channels.iter().enumerate().filter(|(_, c)| c.visible).collect();
    println!();
    let header: Vec<String> = channels
        .iter()
        .map(|(_, c)| format!("{:02X}", c.orders.get(pos).copied().unwrap_or(0)))
        .collect();
    println!("Order {:02X}, patterns {}", pos, header.join(" "));
    for row in 0..sub.pat_len {
        let cells: Vec<String> = channels
            .iter()
            .map(|&(ch, c)| match sub.row_at(ch, pos, row) {
                Some(r) => cell_format::format_row(r, usize::from(c.effect_cols)),
                None => String::new(),
            })
            .collect();
        println!("{:02X} | {}", row, cells.join(" | "));
    }
    Ok(())
}
