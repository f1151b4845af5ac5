//! The architecture-specific relocation backend of a static linker: given per-object relocation
//! records, it decides what GOT slots, PLT entries and dynamic relocations the output needs
//! (the scan pass), then computes final values and rewrites instruction sequences into the output
//! image (the apply pass).
//!
//! The two passes are separated by construction: an [`Applier`] can only be built from the
//! [`ScanComplete`] returned by [`Scanner::finish`], so no relocation can be applied while GOT or
//! PLT offsets could still move.
//!
//! Container parsing, symbol resolution, layout and file I/O are this crate's collaborators, not
//! its concern; see the `input` module for the shapes it consumes from them.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

pub mod apply;
pub mod arch;
pub mod args;
pub mod diagnostics;
pub mod dynamic_reloc;
pub mod error;
pub mod got;
pub mod i386;
pub mod input;
pub mod plt;
pub mod scan;
pub mod symbol_facts;
pub mod x86_64;

pub use apply::Applier;
pub use apply::SectionApplyTask;
pub use arch::Arch;
pub use arch::Architecture;
pub use args::Args;
pub use args::OutputKind;
pub use args::PltVariant;
pub use args::RelocationModel;
pub use diagnostics::DiagnosticSink;
pub use scan::ScanComplete;
pub use scan::Scanner;

/// Installs a default `tracing` subscriber controlled by `RUST_LOG`. Intended for drivers and
/// tests; embedders that already have a subscriber should skip this.
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();
}
