//! driftless source: reading a git-sync checkout and parsing its manifests.

#![forbid(unsafe_code)]

use driftless_core::{DesiredObject, MultiError, SourceState};

pub mod parser;
pub mod reader;

pub use parser::ManifestParser;
pub use reader::DirReader;

/// Produces a consistent snapshot of the source repository.
pub trait SourceReader: Send + Sync {
    /// Fails when the checkout moved to another commit during the read.
    fn read(&self) -> anyhow::Result<SourceState>;
}

/// Turns a source snapshot into declared objects.
pub trait Parser: Send + Sync {
    /// Objects that parsed cleanly are returned even when others failed.
    fn parse(&self, source: &SourceState) -> (Vec<DesiredObject>, MultiError);
}
