//! The data the engine consumes from its collaborators: parsed relocation records, per-object
//! symbol registration, and the addresses that layout assigned. Container parsing and address
//! assignment happen elsewhere; these are the already-digested shapes.

use crate::error::Result;
use crate::symbol_facts::SymbolIdRange;
use anyhow::Context as _;
use rivet_utils::elf::SectionFlags;
use std::ops::Range;

/// One relocation record, as parsed out of an input section. Read-only once parsed; the addend is
/// explicit even for REL-format inputs (the parser extracts it from the relocated field).
#[derive(Debug, Clone, Copy)]
pub struct Relocation {
    pub r_type: u32,
    pub offset: u64,

    /// Index into the owning object's symbol table.
    pub symbol: u32,

    pub addend: i64,
}

/// An input section whose relocations are being processed.
#[derive(Debug, Clone, Copy)]
pub struct SectionInfo<'data> {
    pub index: u32,
    pub flags: SectionFlags,

    /// The section's (unrelocated) contents. The scan pass only reads these to look at opcode
    /// windows; the apply pass receives a separate mutable copy placed in the output image.
    pub data: &'data [u8],
}

#[derive(Debug, Clone)]
pub struct InputObject {
    pub name: String,
    pub file_id: u32,
    pub symbol_id_range: SymbolIdRange,
}

/// Identifies an input section across the whole link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionKey {
    pub file_id: u32,
    pub section_index: u32,
}

/// Addresses assigned by layout. Only built once the scan pass has finished, since GOT/PLT sizes
/// feed into layout.
#[derive(Debug, Clone)]
pub struct ImageLayout {
    pub got_address: u64,
    pub plt_address: u64,
    pub dynamic_section_address: Option<u64>,

    /// The TLS segment's address range, if the output has one.
    pub tls: Option<Range<u64>>,

    /// Output address of each input section that has relocations pointing at it.
    pub section_addresses: Vec<(SectionKey, u64)>,
}

impl ImageLayout {
    pub fn section_address(&self, key: SectionKey) -> Result<u64> {
        Ok(self
            .section_addresses
            .iter()
            .find(|(k, _)| *k == key)
            .with_context(|| {
                format!(
                    "No address assigned to section {} of file {}",
                    key.section_index, key.file_id
                )
            })?
            .1)
    }

    pub fn tls_range(&self) -> Result<&Range<u64>> {
        self.tls
            .as_ref()
            .context("TLS relocation but output has no TLS segment")
    }
}
