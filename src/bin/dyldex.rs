//! Extracts a single dylib from a dyld shared cache, or lists the
//! images inside one.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use dyldex::extraction::LogStatusReporter;
use dyldex::{DyldCache, ExtractError, ExtractorOptions};

#[derive(Parser)]
#[command(name = "dyldex", about = "Extract a dylib from the dyld shared cache")]
struct Args {
    /// Path to the main shared cache file.
    cache: PathBuf,

    /// Name of the framework or dylib to extract.
    #[arg(short = 'f', long = "framework", required_unless_present = "list")]
    framework: Option<String>,

    /// Where to write the extracted image. Defaults to the framework
    /// name in the working directory.
    #[arg(short = 'o', long = "output")]
    output: Option<PathBuf>,

    /// List the images in the cache instead of extracting.
    #[arg(short = 'l', long = "list", conflicts_with = "framework")]
    list: bool,

    /// Only list images whose path contains this term.
    #[arg(long, requires = "list")]
    filter: Option<String>,

    /// Verbosity, 0 (errors only) to 3 (debug).
    #[arg(short = 'v', long = "verbosity", default_value_t = 1)]
    verbosity: u8,
}

fn verbosity_filter(level: u8) -> log::LevelFilter {
    match level {
        0 => log::LevelFilter::Error,
        1 => log::LevelFilter::Warn,
        2 => log::LevelFilter::Info,
        _ => log::LevelFilter::Debug,
    }
}

fn run(args: Args) -> Result<(), ExtractError> {
    let mut cache = DyldCache::open(&args.cache)?;

    if args.list {
        let filter = args.filter.unwrap_or_default().to_lowercase();
        for (index, _, path) in cache.list_images() {
            if filter.is_empty() || path.to_lowercase().contains(&filter) {
                println!("{index}: {path}");
            }
        }
        return Ok(());
    }

    let framework = args.framework.expect("clap enforces -f without -l");
    let Some(index) = cache.image_index_by_name(&framework) else {
        return Err(ExtractError::ContainerParse(format!(
            "no image named {framework} in the cache"
        )));
    };

    let output = args.output.unwrap_or_else(|| PathBuf::from(&framework));

    let mut status = LogStatusReporter::default();
    let program = dyldex::extract_image(
        &mut cache,
        index,
        ExtractorOptions::default(),
        &mut status,
    )?;

    let mut out = std::fs::File::create(&output)?;
    program.write_to(&cache, &mut out)?;

    log::info!("Extracted {framework} to {}", output.display());
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(verbosity_filter(args.verbosity))
        .init();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
