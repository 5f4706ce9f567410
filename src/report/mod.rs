//! Answer rendering.

pub mod composer;

pub use composer::compose_markdown;
