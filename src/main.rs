mod args;
mod baseline;
mod block;
mod config;
mod emitter;
mod output;
mod pipeline;
mod plot;
mod rational;
mod rawfile;
mod runfile;
mod spectral;
mod sync;
mod telemetry;
mod transit;
mod utils;

use std::path::{Path, PathBuf};

use clap::{CommandFactory, Parser};
use tracing::{info, warn};

use block::{BlockSource, CHANNEL_NAMES, NUM_CHANNELS, REFERENCE_CHANNEL};
use config::Config;
use output::{write_spectra_table, MergedRecordWriter};
use pipeline::{capture_base_seconds, Pipeline};
use rawfile::{resolve_data_dir_paths, RawBlockSource};
use runfile::{parse_run_file, RunFileData};
use transit::{scan_merged_file, TransitConfig};
use utils::{available_cores, DynError};

fn resolve_inputs(args: &args::Args, run_file: &RunFileData) -> Result<Vec<PathBuf>, DynError> {
    if !args.input.is_empty() {
        if args.input.len() != NUM_CHANNELS {
            return Err(format!(
                "--input needs {NUM_CHANNELS} files ({}), got {}",
                CHANNEL_NAMES.join(","),
                args.input.len()
            )
            .into());
        }
        return check_inputs(args.input.clone());
    }
    if let Some(dir) = &args.data {
        return resolve_data_dir_paths(dir);
    }
    if let Some(paths) = run_file.complete_inputs() {
        return check_inputs(paths);
    }
    if let Some(dir) = &run_file.data_dir {
        return resolve_data_dir_paths(dir);
    }
    if run_file.inputs.iter().any(Option::is_some) {
        let missing: Vec<&str> = run_file
            .inputs
            .iter()
            .zip(CHANNEL_NAMES.iter())
            .filter(|(p, _)| p.is_none())
            .map(|(_, name)| *name)
            .collect();
        return Err(format!("run file is missing channel inputs: {}", missing.join(",")).into());
    }
    Err("no inputs: pass --input, --data, or a --config naming the channel files".into())
}

fn check_inputs(paths: Vec<PathBuf>) -> Result<Vec<PathBuf>, DynError> {
    for (path, name) in paths.iter().zip(CHANNEL_NAMES.iter()) {
        if !path.is_file() {
            return Err(format!("input for {name} not found: {}", path.display()).into());
        }
    }
    Ok(paths)
}

fn record_path(output_dir: &Path, workers: usize, worker: usize) -> PathBuf {
    if workers > 1 {
        output_dir.join(format!("ac_serial.w{worker}.acs"))
    } else {
        output_dir.join("ac_serial.acs")
    }
}

fn main() -> Result<(), DynError> {
    if std::env::args_os().len() == 1 {
        args::Args::command().print_help()?;
        println!();
        return Ok(());
    }

    let args = args::Args::parse();
    telemetry::init(args.verbose);

    let run_file = match &args.config {
        Some(path) => parse_run_file(path)?,
        None => RunFileData::default(),
    };
    let cfg = Config::from_layers(&args.overrides(), &run_file.overrides)?;
    let inputs = resolve_inputs(&args, &run_file)?;

    let cores = available_cores();
    if args.workers > cores {
        return Err(format!(
            "--workers value ({}) exceeds the number of available cores ({cores})",
            args.workers
        )
        .into());
    }
    if args.workers == 0 {
        return Err("--workers must be at least 1".into());
    }
    let transit_channel = args::parse_channel(&args.transit_channel)?;

    let mut source = RawBlockSource::open(&inputs)?;
    let reference_len = source.channel_len(REFERENCE_CHANNEL);
    if reference_len == 0 {
        return Err("reference channel holds no blocks".into());
    }
    if args.start_block >= reference_len {
        return Err(format!(
            "--start-block {} is past the reference channel ({reference_len} blocks)",
            args.start_block
        )
        .into());
    }
    let end_block = args
        .blocks
        .map_or(reference_len, |n| args.start_block.saturating_add(n).min(reference_len));
    let base_seconds = capture_base_seconds(&mut source, args.start_block)?;
    let channel_lens: Vec<usize> = (0..NUM_CHANNELS).map(|c| source.channel_len(c)).collect();
    drop(source);

    std::fs::create_dir_all(&args.output)?;
    rayon::ThreadPoolBuilder::new()
        .num_threads(args.workers)
        .build_global()
        .map_err(|_| "Failed to initialise rayon thread pool")?;

    let grid = cfg.frequency_grid();
    println!("Starting ac_serial with the following arguments:");
    println!("--------------------------------------------------");
    for ((path, name), len) in inputs.iter().zip(CHANNEL_NAMES.iter()).zip(channel_lens.iter()) {
        println!("  {name}:        {} ({len} blocks)", path.display());
    }
    println!(
        "  steps:      {}..{} (base second {base_seconds})",
        args.start_block, end_block
    );
    println!(
        "  sync:       window {:.3} s, budget {} steps",
        cfg.sync_window_s, cfg.sync_max_steps
    );
    println!(
        "  gates:      beam-on > {} nA, quiescent < {} nA, baseline memory {}",
        cfg.current_threshold, cfg.quiescent_threshold, cfg.baseline_memory
    );
    println!(
        "  spectra:    {} bins of {:.6} Hz up to {} Hz, ncoherent {}",
        grid.bins, grid.df_hz, cfg.max_frequency_hz, cfg.ncoherent
    );
    if cfg.accumulation_window.start.is_finite() || cfg.accumulation_window.end.is_finite() {
        println!(
            "  window:     {} .. {} s",
            cfg.accumulation_window.start, cfg.accumulation_window.end
        );
    }
    println!(
        "  offsets:    {}",
        if cfg.apply_sample_offsets { "whole-sample shift" } else { "off" }
    );
    println!("  workers:    {}", args.workers);
    println!("  output:     {}", args.output.display());
    println!("--------------------------------------------------");

    let pipeline = Pipeline::new(&cfg);
    let (mut state, sinks) = pipeline.run_partitioned(
        base_seconds,
        args.start_block..end_block,
        args.workers,
        || RawBlockSource::open(&inputs),
        |k| {
            MergedRecordWriter::create(
                &record_path(&args.output, args.workers, k),
                base_seconds,
                cfg.sample_interval_s,
            )
        },
    )?;

    let mut record_files = Vec::with_capacity(sinks.len());
    for sink in sinks {
        let rows = sink.rows_written();
        let path = sink.finalize()?;
        info!("[output] {} rows -> {}", rows, path.display());
        record_files.push(path);
    }

    state.spectra.finalize();
    let table_path = args.output.join("spectra.txt");
    write_spectra_table(&table_path, &state.spectra)?;
    info!(
        "[spectra] {} folds over {} steps -> {}",
        state.spectra.folds(),
        state.spectra.steps(),
        table_path.display()
    );
    if !args.no_plot {
        let plot_path = args.output.join("spectra.png");
        match plot_path.to_str() {
            Some(name) => {
                if let Err(e) = plot::plot_spectra(&state.spectra, name) {
                    warn!("[plot] spectrum not written: {e}");
                }
            }
            None => warn!("[plot] non UTF-8 output path {}", plot_path.display()),
        }
    }

    state.drift.log_summary(cfg.drift_precision);

    let mut transits = 0usize;
    if args.transits {
        let transit_cfg = TransitConfig {
            channel: transit_channel,
            threshold: args.transit_threshold,
            ..TransitConfig::default()
        };
        for (k, path) in record_files.iter().enumerate() {
            let prefix = if record_files.len() > 1 {
                format!("w{k}_")
            } else {
                String::new()
            };
            let found = scan_merged_file(
                path,
                transit_cfg.clone(),
                &args.output,
                &prefix,
                args.transit_plots,
            )?;
            transits += found.len();
        }
    }

    let stats = state.stats;
    println!("--------------------------------------------------");
    println!("  steps:        {}", stats.steps);
    println!("  beam-on:      {}", stats.beam_on);
    println!("  quiescent:    {}", stats.quiescent);
    println!("  dead zone:    {}", stats.dead_zone);
    println!(
        "  sync failed:  {} (exhausted {}, no sync {})",
        stats.sync_failures(),
        stats.search_exhausted,
        stats.no_sync
    );
    println!("  rows:         {}", stats.rows);
    println!("  baseline:     {} updates", stats.baseline_updates);
    if args.transits {
        println!("  transits:     {transits}");
    }
    println!("--------------------------------------------------");
    Ok(())
}
