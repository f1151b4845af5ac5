//! The procedure linkage table. Entry order is part of the binary contract: the reserved resolver
//! entry first, then regular entries, then IRELATIVE entries, then (if any TLS descriptor
//! survived optimization) the single reserved TLS-descriptor resolver entry, strictly last.
//!
//! Allocating a PLT entry and registering its dynamic relocation happen in one operation. A PLT
//! entry with no matching relocation is dead weight the loader will never populate, and a
//! relocation with no matching entry is a dangling reference, so the two must never be separated.

use crate::arch::PltFormat;
use crate::arch::PltPatchContext;
use crate::dynamic_reloc::DynamicRelocSink;
use crate::error::Result;
use crate::got::GotRef;
use crate::got::GotTable;
use crate::input::ImageLayout;
use crate::symbol_facts::SymbolFacts;
use crate::symbol_facts::SymbolId;
use anyhow::Context as _;
use anyhow::bail;

/// A stable reference to one PLT entry. Final byte offsets of IRELATIVE entries depend on the
/// final regular-entry count and are only meaningful once the table is frozen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PltRef {
    irelative: bool,
    index: u32,
}

#[derive(Debug, Clone, Copy)]
struct PltEntry {
    symbol: SymbolId,
    got: GotRef,

    /// Position of the entry's relocation within its sink sub-list.
    reloc_position: u32,
}

#[derive(Debug)]
pub struct PltTable {
    format: &'static PltFormat,
    regular: Vec<PltEntry>,
    irelative: Vec<PltEntry>,
    needs_tlsdesc_resolver: bool,
    frozen: bool,
}

impl PltTable {
    #[must_use]
    pub fn new(format: &'static PltFormat) -> Self {
        Self {
            format,
            regular: Vec::new(),
            irelative: Vec::new(),
            needs_tlsdesc_resolver: false,
            frozen: false,
        }
    }

    /// Returns the symbol's PLT entry, allocating it on first request. Allocation picks the
    /// IRELATIVE sub-table when the symbol is an ifunc whose resolver address can be expressed as
    /// a relative relocation, and unconditionally registers the matching JUMP_SLOT or IRELATIVE
    /// dynamic relocation.
    pub fn ensure_entry(
        &mut self,
        facts: &mut SymbolFacts,
        got: &mut GotTable,
        sink: &mut DynamicRelocSink,
        symbol: SymbolId,
    ) -> Result<PltRef> {
        if let Some(existing) = facts.plt_ref(symbol) {
            return Ok(existing);
        }
        debug_assert!(!self.frozen, "PLT allocation after freeze");

        let flags = facts.value_flags(symbol);
        let use_irelative = flags.is_ifunc() && !flags.is_interposable() && !flags.is_dynamic();

        let plt_ref = if use_irelative {
            let got_ref = got.add_irelative_slot(symbol);
            let reloc_position = sink.push_irelative(got_ref, symbol);
            let index = self.irelative.len() as u32;
            self.irelative.push(PltEntry {
                symbol,
                got: got_ref,
                reloc_position,
            });
            PltRef {
                irelative: true,
                index,
            }
        } else {
            let got_ref = got.add_jump_slot(symbol);
            let reloc_position = sink.push_jump_slot(got_ref, symbol);
            let index = self.regular.len() as u32;
            self.regular.push(PltEntry {
                symbol,
                got: got_ref,
                reloc_position,
            });
            PltRef {
                irelative: false,
                index,
            }
        };

        facts.record_plt(symbol, plt_ref)?;
        Ok(plt_ref)
    }

    /// Requests the reserved TLS-descriptor resolver entry and its GOT slot.
    pub fn ensure_tlsdesc_resolver(&mut self, got: &mut GotTable) -> Result {
        if self.format.tlsdesc.is_none() {
            bail!("TLS descriptors are not supported by the selected PLT layout");
        }
        self.needs_tlsdesc_resolver = true;
        got.ensure_tlsdesc_resolver();
        Ok(())
    }

    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    /// Byte offset of the entry within the PLT. Regular entries follow the reserved resolver
    /// entry; IRELATIVE entries are offset by the final regular count as well.
    #[must_use]
    pub fn offset_of(&self, plt_ref: PltRef) -> u64 {
        let reserved = 1;
        let index = if plt_ref.irelative {
            debug_assert!(self.frozen, "IRELATIVE PLT offsets queried before freeze");
            self.regular.len() as u64 + u64::from(plt_ref.index)
        } else {
            u64::from(plt_ref.index)
        };
        (index + reserved) * self.format.entry_size
    }

    fn tlsdesc_entry_offset(&self) -> u64 {
        (1 + self.regular.len() as u64 + self.irelative.len() as u64) * self.format.entry_size
    }

    #[must_use]
    pub fn entry_size(&self) -> u64 {
        self.format.entry_size
    }

    /// Offset of the first non-reserved entry, used for dynamic-tag emission.
    #[must_use]
    pub fn first_plt_entry_offset(&self) -> u64 {
        self.format.entry_size
    }

    #[must_use]
    pub fn entry_count(&self) -> usize {
        1 + self.regular.len()
            + self.irelative.len()
            + usize::from(self.needs_tlsdesc_resolver)
    }

    #[must_use]
    pub fn regular_entry_count(&self) -> usize {
        self.regular.len()
    }

    #[must_use]
    pub fn irelative_entry_count(&self) -> usize {
        self.irelative.len()
    }

    #[must_use]
    pub fn size_in_bytes(&self) -> u64 {
        self.entry_count() as u64 * self.format.entry_size
    }

    pub(crate) fn lazy_resume_offset(&self) -> u64 {
        self.format.lazy_resume_offset
    }

    /// Checks the coupling invariant: every entry's recorded relocation still targets the
    /// entry's own GOT slot.
    pub(crate) fn validate(&self, sink: &DynamicRelocSink) -> Result {
        for entry in &self.regular {
            sink.check_jump_slot(entry.reloc_position, entry.got, entry.symbol)?;
        }
        for entry in &self.irelative {
            sink.check_irelative(entry.reloc_position, entry.got, entry.symbol)?;
        }
        Ok(())
    }

    /// Emits the trampoline bytes.
    pub fn write(
        &self,
        got: &GotTable,
        sink: &DynamicRelocSink,
        layout: &ImageLayout,
        out: &mut [u8],
    ) -> Result {
        if out.len() as u64 != self.size_in_bytes() {
            bail!(
                "PLT buffer is {} bytes, expected {}",
                out.len(),
                self.size_in_bytes()
            );
        }

        let entry_size = self.format.entry_size as usize;
        let got_base_address = layout.got_address + got.base_offset();
        let base_ctx = PltPatchContext {
            got_base_address,
            plt_address: layout.plt_address,
            ..Default::default()
        };

        let (resolver_bytes, rest) = out.split_at_mut(entry_size);
        self.format
            .resolver
            .fill(&base_ctx, self.format.reloc_entry_size, resolver_bytes)?;

        let mut chunks = rest.chunks_exact_mut(entry_size);
        for (list_is_irelative, entries) in [(false, &self.regular), (true, &self.irelative)] {
            for (index, entry) in entries.iter().enumerate() {
                let chunk = chunks.next().context("PLT buffer sized above")?;
                let plt_ref = PltRef {
                    irelative: list_is_irelative,
                    index: index as u32,
                };
                let reloc_index = if list_is_irelative {
                    sink.regular_count() as u64 + u64::from(entry.reloc_position)
                } else {
                    u64::from(entry.reloc_position)
                };
                let ctx = PltPatchContext {
                    got_slot_address: layout.got_address + got.offset_of(entry.got),
                    entry_offset: self.offset_of(plt_ref),
                    reloc_index,
                    ..base_ctx
                };
                self.format
                    .entry
                    .fill(&ctx, self.format.reloc_entry_size, chunk)?;
            }
        }

        if self.needs_tlsdesc_resolver {
            let chunk = chunks.next().context("PLT buffer sized above")?;
            let template = self
                .format
                .tlsdesc
                .context("TLS descriptor entry requested but layout has no template")?;
            let resolver_slot = got
                .tlsdesc_resolver_slot()
                .context("TLS descriptor entry without reserved GOT slot")?;
            let ctx = PltPatchContext {
                entry_offset: self.tlsdesc_entry_offset(),
                tlsdesc_got_address: layout.got_address + got.offset_of(resolver_slot),
                ..base_ctx
            };
            template.fill(&ctx, self.format.reloc_entry_size, chunk)?;
        }

        Ok(())
    }
}
