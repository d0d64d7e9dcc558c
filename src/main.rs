//! BML CLI - Command-line tool for converting Alien: Isolation BML files.
//!
//! This is the main entry point for the `bml` command-line application.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use glob::{MatchOptions, Pattern};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

use bml_codec::{BmlTree, Encoder, ImportOptions};

/// BML - Alien: Isolation binary XML converter
#[derive(Parser)]
#[command(name = "bml")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert a BML file to XML
    ToXml {
        /// Input BML file
        #[arg(short, long, env = "BML_INPUT")]
        input: PathBuf,

        /// Output XML file
        #[arg(short, long, env = "BML_OUTPUT")]
        output: PathBuf,
    },

    /// Convert an XML file to BML
    ToBml {
        /// Input XML file
        #[arg(short, long, env = "BML_INPUT")]
        input: PathBuf,

        /// Output BML file
        #[arg(short, long, env = "BML_OUTPUT")]
        output: PathBuf,

        /// Line ending stored for closing-tag spacing
        #[arg(long, value_enum, env = "BML_LINE_ENDING", default_value_t = LineEnding::Crlf)]
        line_ending: LineEnding,
    },

    /// Convert in whichever direction the input calls for
    Convert {
        /// Input BML or XML file
        #[arg(short, long, env = "BML_INPUT")]
        input: PathBuf,

        /// Output file (defaults to the input with .bml/.xml swapped)
        #[arg(short, long, env = "BML_OUTPUT")]
        output: Option<PathBuf>,

        /// Line ending stored for closing-tag spacing
        #[arg(long, value_enum, env = "BML_LINE_ENDING", default_value_t = LineEnding::Crlf)]
        line_ending: LineEnding,
    },

    /// Show the layout of a BML file
    Info {
        /// Input BML file
        #[arg(short, long, env = "BML_INPUT")]
        input: PathBuf,
    },

    /// Convert every matching file under a directory
    Batch {
        /// Input directory
        #[arg(short, long, env = "BML_INPUT")]
        input: PathBuf,

        /// Filter pattern for file names (glob-style, case-insensitive)
        #[arg(short, long, default_value = "*.bml")]
        filter: String,

        /// Line ending stored for closing-tag spacing
        #[arg(long, value_enum, env = "BML_LINE_ENDING", default_value_t = LineEnding::Crlf)]
        line_ending: LineEnding,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LineEnding {
    Crlf,
    Lf,
}

impl LineEnding {
    fn import_options(self) -> ImportOptions {
        match self {
            LineEnding::Crlf => ImportOptions::with_line_ending("\r\n"),
            LineEnding::Lf => ImportOptions::with_line_ending("\n"),
        }
    }
}

/// Which way a file was converted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    ToXml,
    ToBml,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::ToXml { input, output } => {
            cmd_to_xml(&input, &output)?;
        }
        Commands::ToBml {
            input,
            output,
            line_ending,
        } => {
            cmd_to_bml(&input, &output, &line_ending.import_options())?;
        }
        Commands::Convert {
            input,
            output,
            line_ending,
        } => {
            cmd_convert(&input, output.as_deref(), &line_ending.import_options())?;
        }
        Commands::Info { input } => {
            cmd_info(&input)?;
        }
        Commands::Batch {
            input,
            filter,
            line_ending,
        } => {
            cmd_batch(&input, &filter, &line_ending.import_options())?;
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn cmd_to_xml(input: &Path, output: &Path) -> Result<()> {
    info!("Converting: {} -> {}", input.display(), output.display());
    bml_to_xml(input, output)?;
    info!("Conversion complete");
    Ok(())
}

fn cmd_to_bml(input: &Path, output: &Path, options: &ImportOptions) -> Result<()> {
    info!("Converting: {} -> {}", input.display(), output.display());
    xml_to_bml(input, output, options)?;
    info!("Conversion complete");
    Ok(())
}

fn cmd_convert(input: &Path, output: Option<&Path>, options: &ImportOptions) -> Result<()> {
    let data = fs::read(input).context("Failed to read input file")?;
    let direction = detect_direction(&data);
    let output = match output {
        Some(path) => path.to_path_buf(),
        None => default_output(input, direction),
    };

    info!(
        "Converting ({:?}): {} -> {}",
        direction,
        input.display(),
        output.display()
    );
    convert_bytes(&data, &output, direction, options)?;
    info!("Conversion complete");

    Ok(())
}

fn cmd_info(input: &Path) -> Result<()> {
    let data = fs::read(input).context("Failed to read input file")?;

    if !BmlTree::is_bml(&data) {
        anyhow::bail!("Input file is not a BML file");
    }

    let tree = BmlTree::parse(&data).context("Failed to parse BML")?;
    let header = BmlTree::read_header(&data)?;
    let names = header.names_region();
    let text = header.text_region();

    println!("File:               {}", input.display());
    println!("Size:               {} bytes", data.len());
    println!("Node block:         16..{}", header.block_data());
    println!("Names pool:         {}..{} ({} bytes)", names.start, names.end, names.len());
    println!("Text pool:          {}..{} ({} bytes)", text.start, text.end, text.len());
    println!("Line endings block: {}", header.block_line_endings());
    println!("Nodes:              {}", tree.len());
    println!("Depth:              {}", tree.depth());

    // A file that re-encodes to the same bytes uses the canonical layout.
    let encoder = Encoder::new(&tree).context("Failed to lay out tree")?;
    let canonical = encoder.encode()? == data;
    println!("Canonical layout:   {}", if canonical { "yes" } else { "no" });

    Ok(())
}

fn cmd_batch(input: &Path, filter: &str, options: &ImportOptions) -> Result<()> {
    let pattern = Pattern::new(filter).context("Invalid filter pattern")?;
    let match_options = MatchOptions {
        case_sensitive: false,
        ..MatchOptions::new()
    };

    let files: Vec<PathBuf> = WalkDir::new(input)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .map(|name| pattern.matches_with(name, match_options))
                .unwrap_or(false)
        })
        .map(|entry| entry.into_path())
        .collect();

    info!("Converting {} files under {}...", files.len(), input.display());

    let pb = ProgressBar::new(files.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")?
            .progress_chars("#>-"),
    );

    let start = Instant::now();
    let converted = AtomicUsize::new(0);
    let errors = AtomicUsize::new(0);

    files.par_iter().for_each(|path| {
        let result = fs::read(path)
            .context("Failed to read input file")
            .and_then(|data| {
                let direction = detect_direction(&data);
                let output = default_output(path, direction);
                convert_bytes(&data, &output, direction, options)
            });

        match result {
            Ok(()) => {
                converted.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                pb.suspend(|| error!("Error converting {}: {:#}", path.display(), e));
                errors.fetch_add(1, Ordering::Relaxed);
            }
        }

        pb.inc(1);
    });

    pb.finish_with_message("Done");
    info!(
        "Converted {} files in {:?} ({} errors)",
        converted.load(Ordering::Relaxed),
        start.elapsed(),
        errors.load(Ordering::Relaxed)
    );

    Ok(())
}

fn bml_to_xml(input: &Path, output: &Path) -> Result<()> {
    let data = fs::read(input).context("Failed to read input file")?;
    convert_bytes(&data, output, Direction::ToXml, &ImportOptions::default())
}

fn xml_to_bml(input: &Path, output: &Path, options: &ImportOptions) -> Result<()> {
    let data = fs::read(input).context("Failed to read input file")?;
    convert_bytes(&data, output, Direction::ToBml, options)
}

fn convert_bytes(
    data: &[u8],
    output: &Path,
    direction: Direction,
    options: &ImportOptions,
) -> Result<()> {
    let bytes = match direction {
        Direction::ToXml => {
            if !BmlTree::is_bml(data) {
                anyhow::bail!("Input file is not a BML file");
            }
            let tree = BmlTree::parse(data).context("Failed to parse BML")?;
            debug!("Decoded {} nodes", tree.len());
            tree.to_xml_string()
                .context("Failed to convert to XML")?
                .into_bytes()
        }
        Direction::ToBml => {
            let xml = std::str::from_utf8(data).context("Input XML is not valid UTF-8")?;
            let tree = bml_codec::bridge::from_xml_str(xml, options)
                .context("Failed to parse XML")?;
            debug!("Built tree of {} nodes", tree.len());
            tree.to_bytes().context("Failed to encode BML")?
        }
    };

    fs::write(output, bytes).context("Failed to write output file")?;
    Ok(())
}

fn detect_direction(data: &[u8]) -> Direction {
    if BmlTree::is_bml(data) {
        Direction::ToXml
    } else {
        Direction::ToBml
    }
}

/// Swap the extension for the target format, keeping the original casing style.
fn default_output(input: &Path, direction: Direction) -> PathBuf {
    let upper = input
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.chars().all(|c| !c.is_ascii_lowercase()))
        .unwrap_or(false);

    let extension = match (direction, upper) {
        (Direction::ToXml, false) => "xml",
        (Direction::ToXml, true) => "XML",
        (Direction::ToBml, false) => "bml",
        (Direction::ToBml, true) => "BML",
    };
    input.with_extension(extension)
}
