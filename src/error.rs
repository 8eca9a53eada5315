use thiserror::Error;

pub type Result<T> = std::result::Result<T, ExtractError>;

/// Errors produced while extracting an image from the shared cache.
///
/// Only [`ExtractError::ContainerParse`] raised while opening a cache or
/// parsing an image header is fatal to that image; the converter phases
/// are independently recoverable and the driver keeps going with the
/// remaining phases when one of them fails.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unable to parse container: {0}")]
    ContainerParse(String),

    #[error("address {0:#x} is not covered by any cache mapping")]
    MappingMiss(u64),

    #[error("corrupt rebase chain: {0}")]
    ChainCorrupt(String),

    #[error("unable to find a symbol for address {0:#x}")]
    SymbolLookup(u64),

    #[error("load commands need {needed} more bytes and nothing can be dropped")]
    InsufficientHeaderSpace { needed: u64 },

    #[error("extra ObjC data ({size:#x} bytes) exceeds the segment gap ({max:#x} bytes)")]
    ExtraSegmentOverflow { size: u64, max: u64 },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Data(#[from] scroll::Error),
}
