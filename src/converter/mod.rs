//! The per-image converter phases, in their pipeline order.

pub mod arm64;
pub mod slide_info;
pub mod linkedit_optimizer;
pub mod stub_fixer;
pub mod objc_fixer;
pub mod rebase_generator;
pub mod macho_offset;
