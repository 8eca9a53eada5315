//! Executes a [`WriteProgram`] against an output file.

use std::io::{Seek, SeekFrom, Write};

use crate::cache::DyldCache;
use crate::converter::macho_offset::{CopySource, WriteProcedure};
use crate::error::{ExtractError, Result};

/// Everything needed to materialize the extracted image: the ordered
/// copy procedures, the `__EXTRA_OBJC` bytes some of them read from,
/// and the final header/load-command bytes for offset zero.
pub struct WriteProgram {
    pub procedures: Vec<WriteProcedure>,
    pub extra_data: Vec<u8>,
    pub header: Vec<u8>,
}

impl WriteProgram {
    /// Writes the image to `out`, reading segment bytes out of the
    /// cache's (already converted) in-memory view.
    pub fn write_to(&self, cache: &DyldCache, out: &mut (impl Write + Seek)) -> Result<()> {
        for procedure in &self.procedures {
            let bytes = match procedure.source {
                CopySource::CacheFile(file) => {
                    cache.read_bytes(file, procedure.read_offset, procedure.size as usize)?
                }
                CopySource::ExtraData => {
                    let start = procedure.read_offset as usize;
                    self.extra_data
                        .get(start..start + procedure.size as usize)
                        .ok_or_else(|| {
                            ExtractError::ContainerParse(
                                "write procedure reads beyond the extra data".into(),
                            )
                        })?
                }
            };

            out.seek(SeekFrom::Start(procedure.write_offset))?;
            out.write_all(bytes)?;
        }

        // the header was mutated in memory after the segment copies
        // were planned; writing it last keeps it authoritative
        out.seek(SeekFrom::Start(0))?;
        out.write_all(&self.header)?;

        Ok(())
    }
}
