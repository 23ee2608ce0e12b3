//! vmdkraw CLI - Convert streamOptimized VMDK extents to raw disk images.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;
use vmdkraw_core::vmdk::LayoutOrigin;
use vmdkraw_core::{
    convert_disk, CancelToken, DecodeOptions, DecodeProgress, DecodeSummary, DiskDescriptor,
    GrainLengthPolicy, ProgressCallback, VmdkDecoder, ZeroGrainSize,
};

/// Fast, multithreaded decoder for streamOptimized VMDK disks.
#[derive(Parser)]
#[command(name = "vmdkraw")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug). RUST_LOG overrides.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert a streamOptimized VMDK extent to a raw disk image.
    Convert {
        /// Path to the VMDK extent.
        input: PathBuf,

        /// Output raw image path. Defaults to the input name with .raw extension.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Number of inflate threads (0 = auto-detect, 1 = sequential).
        #[arg(short, long, default_value = "1")]
        threads: usize,

        /// Read chunk size in kilobytes for grain payloads.
        #[arg(long, default_value = "64")]
        chunk_size: usize,

        /// Expected disk capacity in bytes; a mismatch is reported.
        #[arg(long)]
        capacity: Option<u64>,

        /// Emit 64 KiB for every unallocated grain, whatever the grain size.
        #[arg(long)]
        legacy_zero_grain: bool,

        /// Fail when a grain inflates to the wrong length.
        #[arg(long)]
        strict_grain_length: bool,

        /// Suppress progress output.
        #[arg(short, long)]
        quiet: bool,
    },

    /// Display the layout of a VMDK extent.
    Info {
        /// Path to the VMDK extent.
        input: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    match cli.command {
        Commands::Convert {
            input,
            output,
            threads,
            chunk_size,
            capacity,
            legacy_zero_grain,
            strict_grain_length,
            quiet,
        } => {
            let mut options = DecodeOptions::parallel(threads);
            options.read_chunk_size = chunk_size.saturating_mul(1024);
            if legacy_zero_grain {
                options.zero_grain = ZeroGrainSize::Legacy;
            }
            if strict_grain_length {
                options.grain_length = GrainLengthPolicy::Strict;
            }
            install_cancel_handler(options.cancel.clone())?;
            run_convert(&input, output.as_deref(), capacity, &options, quiet)?;
        }
        Commands::Info { input } => {
            show_info(&input)?;
        }
    }

    Ok(())
}

/// Logs go to stderr so they never mix with the summary on stdout.
fn init_logging(verbose: u8) -> Result<()> {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .try_init()
        .map_err(|err| anyhow::anyhow!("failed to initialize logger: {err}"))
}

/// Ctrl-C and SIGTERM cancel the running job; the partial output is then removed.
fn install_cancel_handler(cancel: CancelToken) -> Result<()> {
    ctrlc::set_handler(move || {
        tracing::warn!("interrupted; cancelling conversion");
        cancel.cancel();
    })
    .context("failed to install signal handler")
}

/// Converts `disk` into a new file at `output_path`, removing the file if
/// the conversion fails or is cancelled.
fn convert_to_file(
    disk: &DiskDescriptor,
    output_path: &Path,
    options: &DecodeOptions,
    callback: Option<ProgressCallback>,
) -> Result<DecodeSummary> {
    let file = File::create(output_path)
        .with_context(|| format!("failed to create {}", output_path.display()))?;

    match convert_disk(disk, BufWriter::new(file), options, callback) {
        Ok(summary) => Ok(summary),
        Err(err) => {
            // A partial image is never valid output.
            let _ = std::fs::remove_file(output_path);
            Err(err).with_context(|| format!("failed to convert {}", disk.input.display()))
        }
    }
}

fn run_convert(
    input: &Path,
    output: Option<&Path>,
    capacity: Option<u64>,
    options: &DecodeOptions,
    quiet: bool,
) -> Result<()> {
    let output_path = match output {
        Some(path) => path.to_path_buf(),
        None => input.with_extension("raw"),
    };

    let mut disk = DiskDescriptor::vmdk(input);
    disk.capacity_bytes = capacity;

    // Open once up front for the header details and the progress total.
    let decoder = VmdkDecoder::open(input)
        .with_context(|| format!("failed to open {}", input.display()))?;
    let total = decoder.capacity_bytes();
    drop(decoder);

    if !quiet {
        println!("VMDK Convert");
        println!("------------");
        println!("Input:     {}", input.display());
        println!("Output:    {}", output_path.display());
        println!("Capacity:  {}", format_bytes(total));
        println!("Threads:   {}", describe_threads(options.threads));
        println!();
    }

    let progress_bar = if quiet {
        None
    } else {
        let pb = ProgressBar::new(total);
        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta}) {msg}")?
            .progress_chars("#>-");
        pb.set_style(style);
        Some(pb)
    };

    let callback: Option<ProgressCallback> = progress_bar.clone().map(|pb| {
        Box::new(move |progress: DecodeProgress| {
            pb.set_position(progress.bytes_emitted);
            pb.set_message(format!("{} tables", progress.tables_processed));
        }) as ProgressCallback
    });

    let summary = match convert_to_file(&disk, &output_path, options, callback) {
        Ok(summary) => summary,
        Err(err) => {
            if let Some(pb) = progress_bar {
                pb.abandon_with_message("Failed");
            }
            return Err(err);
        }
    };

    if let Some(pb) = progress_bar {
        pb.finish_with_message("Complete!");
    }

    if !quiet {
        println!();
        println!("Conversion completed successfully: {}", output_path.display());
        println!("Written:   {}", format_bytes(summary.bytes_emitted));
        println!(
            "Grains:    {} decoded, {} zero",
            summary.grains_decoded, summary.zero_grains
        );
        println!("Tables:    {}", summary.tables);
        if summary.anomalies > 0 {
            println!("Skipped:   {} unknown markers", summary.anomalies);
        }
    }
    println!("{}  {}", summary.sha256, output_path.display());

    Ok(())
}

fn show_info(input: &Path) -> Result<()> {
    let decoder = VmdkDecoder::open(input)
        .with_context(|| format!("failed to open {}", input.display()))?;
    let header = decoder.header();
    let layout = decoder.layout();

    println!("VMDK Information");
    println!("================");
    println!();
    println!("File:        {}", input.display());
    println!("Version:     {}", header.version);
    println!("Capacity:    {} ({} sectors)", format_bytes(layout.capacity_bytes()), layout.capacity_sectors);
    println!("Grain size:  {}", format_bytes(layout.grain_size_bytes()));
    println!("GTEs per GT: {}", layout.num_gtes_per_gt);
    println!("Tables:      {}", layout.num_grain_tables());
    println!("Compressed:  {}", header.is_compressed());
    println!("Markers:     {}", header.has_markers());
    match layout.origin {
        LayoutOrigin::Header => println!("Layout from: header"),
        LayoutOrigin::Footer { offset } => println!("Layout from: footer at offset {}", offset),
    }
    if layout.gd_offset_sectors != 0 && layout.gd_offset_sectors != vmdkraw_core::vmdk::GD_AT_END {
        println!("GD sector:   {}", layout.gd_offset_sectors);
    }

    match decoder.descriptor() {
        Ok(Some(descriptor)) => {
            println!();
            println!("Descriptor:");
            println!("  createType:  {}", descriptor.create_type().unwrap_or("(none)"));
            if let Some(adapter) = descriptor.adapter_type() {
                println!("  adapterType: {}", adapter);
            }
            if let Some(cid) = descriptor.cid() {
                println!("  CID:         {:08x}", cid);
            }
            for (i, extent) in descriptor.extents.iter().enumerate() {
                println!(
                    "  {}. {} {} {:?} \"{}\"",
                    i + 1,
                    extent.access,
                    format_bytes(extent.size_sectors.saturating_mul(vmdkraw_core::vmdk::SECTOR_SIZE)),
                    extent.kind,
                    extent.filename
                );
            }
        }
        Ok(None) => {
            println!();
            println!("Descriptor:  None");
        }
        Err(err) => {
            println!();
            println!("Descriptor:  unreadable ({})", err);
        }
    }

    Ok(())
}

fn describe_threads(threads: usize) -> String {
    match threads {
        0 => "auto".to_string(),
        1 => "1 (sequential)".to_string(),
        n => n.to_string(),
    }
}

/// Format bytes as human-readable string.
fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
