pub mod vlt5;
pub mod with_tracing;
