pub mod fmt;

/// Descriptor of the debug console every process starts with.
pub const STDOUT: u32 = 1;
