//! Extracts every image in a dyld shared cache, with a worker thread
//! pool where each worker owns its own copy-on-write view of the
//! cache.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicUsize, Ordering};

use clap::Parser;

use dyldex::{DyldCache, ExtractError, ExtractorOptions, NullStatusReporter};

#[derive(Parser)]
#[command(name = "dyldex_all", about = "Extract every dylib from the dyld shared cache")]
struct Args {
    /// Path to the main shared cache file.
    cache: PathBuf,

    /// Directory the extracted images are written into, mirroring
    /// their install paths.
    #[arg(short = 'o', long = "output", default_value = "binaries")]
    output: PathBuf,

    /// Number of worker threads.
    #[arg(short = 'j', long = "jobs", default_value_t = 4)]
    jobs: usize,

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

fn extract_one(
    cache: &mut DyldCache,
    index: usize,
    path: &str,
    out_dir: &std::path::Path,
) -> Result<(), ExtractError> {
    let mut status = NullStatusReporter;
    let program = dyldex::extract_image(cache, index, ExtractorOptions::default(), &mut status)?;

    let out_path = out_dir.join(path.trim_start_matches('/'));
    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut out = std::fs::File::create(&out_path)?;
    program.write_to(cache, &mut out)?;
    Ok(())
}

fn run(args: Args) -> Result<(), ExtractError> {
    let cache = DyldCache::open(&args.cache)?;
    let images = cache.list_images();
    let total = images.len();
    drop(cache);

    let next_image = AtomicUsize::new(0);
    let failures = AtomicUsize::new(0);

    std::thread::scope(|scope| {
        for _ in 0..args.jobs.max(1) {
            scope.spawn(|| {
                // every worker mutates its own copy-on-write view
                let mut cache = match DyldCache::open(&args.cache) {
                    Ok(cache) => cache,
                    Err(e) => {
                        log::error!("Worker could not open the cache: {e}");
                        failures.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                };

                loop {
                    let i = next_image.fetch_add(1, Ordering::Relaxed);
                    let Some((index, name, path)) = images.get(i) else {
                        break;
                    };

                    log::info!("{}/{total}: {name}", i + 1);
                    if let Err(e) = extract_one(&mut cache, *index, path, &args.output) {
                        log::error!("Failed to extract {path}: {e}");
                        failures.fetch_add(1, Ordering::Relaxed);
                    }

                    // a fresh view for the next image; converters have
                    // scribbled all over this one
                    cache = match cache.reopen() {
                        Ok(cache) => cache,
                        Err(e) => {
                            log::error!("Worker could not reopen the cache: {e}");
                            failures.fetch_add(1, Ordering::Relaxed);
                            return;
                        }
                    };
                }
            });
        }
    });

    let failed = failures.load(Ordering::Relaxed);
    if failed > 0 {
        return Err(ExtractError::ContainerParse(format!(
            "{failed} of {total} images failed to extract"
        )));
    }
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
