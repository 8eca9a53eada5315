//! Per-image extraction state shared by the converter phases.

use std::collections::BTreeSet;

use crate::macho::MachO;

/// The name of the synthesized segment that receives ObjC data living
/// outside the image.
pub const EXTRA_SEGMENT_NAME: &[u8] = b"__EXTRA_OBJC";

/// Progress callbacks injected by the driver. `unit` names the phase,
/// `status` the current step inside it.
pub trait StatusReporter {
    fn update(&mut self, unit: Option<&str>, status: Option<&str>);
}

/// The default reporter: silence.
#[derive(Default)]
pub struct NullStatusReporter;

impl StatusReporter for NullStatusReporter {
    fn update(&mut self, _unit: Option<&str>, _status: Option<&str>) {}
}

/// Reports phase and step transitions through the `log` facade, which
/// is all the CLI drivers need.
#[derive(Default)]
pub struct LogStatusReporter {
    unit: String,
    status: String,
}

impl StatusReporter for LogStatusReporter {
    fn update(&mut self, unit: Option<&str>, status: Option<&str>) {
        if let Some(unit) = unit {
            if unit != self.unit {
                log::info!("{unit}");
                self.unit = unit.to_owned();
            }
        }
        if let Some(status) = status {
            if status != self.status {
                log::debug!("{}: {status}", self.unit);
                self.status = status.to_owned();
            }
        }
    }
}

/// Which converter phases to run. The order is fixed regardless.
#[derive(Debug, Clone, Copy)]
pub struct ExtractorOptions {
    pub fix_slide: bool,
    pub optimize_linkedit: bool,
    pub fix_stubs: bool,
    pub fix_objc: bool,
    pub generate_rebase: bool,
    pub layout_offsets: bool,
}

impl Default for ExtractorOptions {
    fn default() -> Self {
        ExtractorOptions {
            fix_slide: true,
            optimize_linkedit: true,
            fix_stubs: true,
            fix_objc: true,
            generate_rebase: true,
            layout_offsets: true,
        }
    }
}

/// An ordered set of every vmaddr the extractor determined holds a
/// relocatable pointer. Filled by the slide-info rebaser, drained by
/// the rebase generator.
#[derive(Default)]
pub struct PointerTracker {
    locations: BTreeSet<u64>,
}

impl PointerTracker {
    pub fn add(&mut self, vmaddr: u64) {
        self.locations.insert(vmaddr);
    }

    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }

    /// Pointer locations in ascending address order.
    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.locations.iter().copied()
    }
}

/// State threaded through the converter phases of one image.
pub struct ExtractionContext<'a> {
    pub macho: MachO,
    pub options: ExtractorOptions,
    pub ptr_tracker: PointerTracker,

    /// Set by the LINKEDIT optimizer when zeroed indirect-symbol
    /// entries were found; the stub fixer then mints replacement
    /// symbols for them.
    pub has_redacted_indirect: bool,

    /// Contents of the `__EXTRA_OBJC` segment, owned in memory until
    /// the write program hands them to the writer.
    pub extra_data: Vec<u8>,

    pub status: &'a mut dyn StatusReporter,
}

impl<'a> ExtractionContext<'a> {
    pub fn new(
        macho: MachO,
        options: ExtractorOptions,
        status: &'a mut dyn StatusReporter,
    ) -> Self {
        ExtractionContext {
            macho,
            options,
            ptr_tracker: PointerTracker::default(),
            has_redacted_indirect: false,
            extra_data: Vec::new(),
            status,
        }
    }
}
