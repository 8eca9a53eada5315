pub mod linkedit_builder;

pub use linkedit_builder::LinkeditBuilder;
