//! Extracts individual dylibs out of the dyld shared cache.
//!
//! Apple merges the system libraries into one monolithic cache file:
//! linkedit data is pooled, pointers are rewritten into chained form,
//! selector references point into other images, and stubs branch
//! straight to their resolved targets. [`extract_image`] runs the
//! converter pipeline that undoes those optimizations for one image and
//! returns a [`WriteProgram`] a writer can turn into a standalone,
//! loadable Mach-O file.
//!
//! ```no_run
//! use dyldex::{DyldCache, ExtractorOptions, NullStatusReporter};
//!
//! let mut cache = DyldCache::open("dyld_shared_cache_arm64e")?;
//! let index = cache.image_index_by_name("CoreFoundation").unwrap();
//!
//! let mut status = NullStatusReporter;
//! let program = dyldex::extract_image(
//!     &mut cache,
//!     index,
//!     ExtractorOptions::default(),
//!     &mut status,
//! )?;
//!
//! let mut out = std::fs::File::create("CoreFoundation")?;
//! program.write_to(&cache, &mut out)?;
//! # Ok::<(), dyldex::ExtractError>(())
//! ```

pub mod builder;
pub mod cache;
pub mod converter;
pub mod error;
pub mod extraction;
pub mod leb128;
pub mod macho;
pub mod objc;
pub mod writer;

use log::error;

pub use cache::DyldCache;
pub use converter::macho_offset::{CopySource, WriteProcedure};
pub use error::{ExtractError, Result};
pub use extraction::{ExtractorOptions, NullStatusReporter, StatusReporter};
pub use writer::WriteProgram;

use extraction::ExtractionContext;
use macho::MachO;
use macho::structs::MachHeader64;

/// Lists `(index, name, path)` for every image in the cache.
pub fn list_images(cache: &DyldCache) -> Vec<(usize, String, String)> {
    cache.list_images()
}

/// Runs the extraction pipeline for one image.
///
/// The phases run in a fixed order: slide-info rebase, linkedit
/// optimization, stub fixing, ObjC fixing, rebase generation, offset
/// layout. The first four are independently recoverable; when one
/// fails its error is logged and the remaining phases still run, which
/// can still produce a usable (if imperfect) file. Parse failures on
/// the image itself are fatal.
pub fn extract_image(
    cache: &mut DyldCache,
    image_index: usize,
    options: ExtractorOptions,
    status: &mut dyn StatusReporter,
) -> Result<WriteProgram> {
    let image = *cache.images.get(image_index).ok_or_else(|| {
        ExtractError::ContainerParse(format!("image index {image_index} out of range"))
    })?;
    let (file_index, offset) = cache
        .resolve_addr(image.address)
        .ok_or(ExtractError::MappingMiss(image.address))?;

    let macho = MachO::parse(cache, file_index, offset)?;
    let mut ctx = ExtractionContext::new(macho, options, status);

    if ctx.options.fix_slide {
        if let Err(e) = converter::slide_info::process_slide_info(cache, &mut ctx) {
            error!("Unable to process slide info, reason: {e}");
        }
    }

    if ctx.options.optimize_linkedit {
        if let Err(e) = converter::linkedit_optimizer::optimize_linkedit(cache, &mut ctx) {
            error!("Unable to optimize linkedit, reason: {e}");
        }
    }

    if ctx.options.fix_stubs {
        if let Err(e) = converter::stub_fixer::fix_stubs(cache, &mut ctx) {
            error!("Unable to fix stubs, reason: {e}");
        }
    }

    if ctx.options.fix_objc {
        if let Err(e) = converter::objc_fixer::fix_objc(cache, &mut ctx) {
            error!("Unable to fix ObjC, reason: {e}");
        }
    }

    if ctx.options.generate_rebase {
        converter::rebase_generator::generate_rebase_info(cache, &mut ctx)?;
    }

    let procedures = if ctx.options.layout_offsets {
        converter::macho_offset::optimize_offsets(cache, &mut ctx)?
    } else {
        Vec::new()
    };

    let header_len = MachHeader64::SIZE + ctx.macho.header.sizeofcmds as usize;
    let header = cache
        .read_bytes(ctx.macho.file_index, ctx.macho.file_offset, header_len)?
        .to_vec();

    Ok(WriteProgram {
        procedures,
        extra_data: ctx.extra_data,
        header,
    })
}
