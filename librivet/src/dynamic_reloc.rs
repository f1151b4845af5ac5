//! Relocations the dynamic loader will apply. They accumulate during the scan pass in three
//! ordered lists (regular, IRELATIVE, TLSDESC) and are emitted as one table in exactly that
//! order. The order is a correctness requirement: the loader must have resolved the global and
//! ifunc values an IRELATIVE resolver may read before it runs the resolver, and TLSDESC records
//! point into their own dedicated GOT sub-region.

use crate::arch::Arch;
use crate::error::Result;
use crate::got::GotRef;
use crate::got::GotTable;
use crate::input::ImageLayout;
use crate::input::SectionKey;
use crate::symbol_facts::SymbolFacts;
use crate::symbol_facts::SymbolId;
use anyhow::bail;
use bytemuck::Pod;
use bytemuck::Zeroable;
use itertools::chain;
use rivet_utils::elf::DynamicRelocationKind;

/// Where a dynamic relocation will be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DynPlace {
    Got(GotRef),
    Section { key: SectionKey, offset: u64 },

    /// The symbol's own (copied) storage in the output image.
    Symbol(SymbolId),
}

/// The record's addend. Values that depend on layout are kept symbolic until emission.
#[derive(Debug, Clone, Copy)]
pub(crate) enum DynAddend {
    Constant(i64),

    /// The symbol's link-time value plus a constant.
    SymbolPlus(SymbolId, i64),

    /// The symbol's offset within the TLS segment plus a constant.
    TlsBlockOffset(SymbolId, i64),

    /// The absolute address of a GOT slot (for sites that hold a slot address).
    GotSlotAddress(GotRef),
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct DynamicReloc {
    pub(crate) kind: DynamicRelocationKind,
    pub(crate) place: DynPlace,
    pub(crate) symbol: Option<SymbolId>,
    pub(crate) addend: DynAddend,
}

#[derive(Debug, Default)]
pub struct DynamicRelocSink {
    regular: Vec<DynamicReloc>,
    irelative: Vec<DynamicReloc>,
    tlsdesc: Vec<DynamicReloc>,
}

#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct Rela64 {
    r_offset: u64,
    r_info: u64,
    r_addend: i64,
}

#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct Rel32 {
    r_offset: u32,
    r_info: u32,
}

pub(crate) const RELA_ENTRY_SIZE: u64 = size_of::<Rela64>() as u64;
pub(crate) const REL_ENTRY_SIZE: u64 = size_of::<Rel32>() as u64;

impl DynamicRelocSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push_regular(
        &mut self,
        kind: DynamicRelocationKind,
        place: DynPlace,
        symbol: Option<SymbolId>,
        addend: DynAddend,
    ) -> u32 {
        let position = self.regular.len() as u32;
        self.regular.push(DynamicReloc {
            kind,
            place,
            symbol,
            addend,
        });
        position
    }

    pub(crate) fn push_jump_slot(&mut self, got: GotRef, symbol: SymbolId) -> u32 {
        self.push_regular(
            DynamicRelocationKind::JumpSlot,
            DynPlace::Got(got),
            Some(symbol),
            DynAddend::Constant(0),
        )
    }

    pub(crate) fn push_irelative(&mut self, got: GotRef, symbol: SymbolId) -> u32 {
        let position = self.irelative.len() as u32;
        self.irelative.push(DynamicReloc {
            kind: DynamicRelocationKind::Irelative,
            place: DynPlace::Got(got),
            symbol: None,
            // The resolver function's address.
            addend: DynAddend::SymbolPlus(symbol, 0),
        });
        position
    }

    pub(crate) fn push_irelative_at(&mut self, key: SectionKey, offset: u64, symbol: SymbolId) {
        self.irelative.push(DynamicReloc {
            kind: DynamicRelocationKind::Irelative,
            place: DynPlace::Section { key, offset },
            symbol: None,
            addend: DynAddend::SymbolPlus(symbol, 0),
        });
    }

    pub(crate) fn push_tlsdesc(&mut self, got: GotRef, symbol: Option<SymbolId>, addend: DynAddend) {
        self.tlsdesc.push(DynamicReloc {
            kind: DynamicRelocationKind::TlsDesc,
            place: DynPlace::Got(got),
            symbol,
            addend,
        });
    }

    #[must_use]
    pub fn regular_count(&self) -> usize {
        self.regular.len()
    }

    #[must_use]
    pub fn irelative_count(&self) -> usize {
        self.irelative.len()
    }

    #[must_use]
    pub fn tlsdesc_count(&self) -> usize {
        self.tlsdesc.len()
    }

    #[must_use]
    pub fn total_count(&self) -> usize {
        self.regular.len() + self.irelative.len() + self.tlsdesc.len()
    }

    pub(crate) fn iter_in_output_order(&self) -> impl Iterator<Item = &DynamicReloc> {
        chain!(&self.regular, &self.irelative, &self.tlsdesc)
    }

    pub(crate) fn check_jump_slot(
        &self,
        position: u32,
        got: GotRef,
        symbol: SymbolId,
    ) -> Result {
        let Some(reloc) = self.regular.get(position as usize) else {
            bail!("PLT entry references missing dynamic relocation {position}");
        };
        if reloc.kind != DynamicRelocationKind::JumpSlot
            || reloc.place != DynPlace::Got(got)
            || reloc.symbol != Some(symbol)
        {
            bail!("PLT entry and dynamic relocation {position} disagree: {reloc:?}");
        }
        Ok(())
    }

    pub(crate) fn check_irelative(&self, position: u32, got: GotRef, symbol: SymbolId) -> Result {
        let Some(reloc) = self.irelative.get(position as usize) else {
            bail!("IRELATIVE PLT entry references missing dynamic relocation {position}");
        };
        let addend_matches = matches!(reloc.addend, DynAddend::SymbolPlus(s, 0) if s == symbol);
        if reloc.kind != DynamicRelocationKind::Irelative
            || reloc.place != DynPlace::Got(got)
            || !addend_matches
        {
            bail!("IRELATIVE PLT entry and dynamic relocation {position} disagree: {reloc:?}");
        }
        Ok(())
    }

    #[must_use]
    pub fn record_size<A: Arch>() -> u64 {
        if A::uses_rela() {
            RELA_ENTRY_SIZE
        } else {
            REL_ENTRY_SIZE
        }
    }

    #[must_use]
    pub fn size_in_bytes<A: Arch>(&self) -> u64 {
        self.total_count() as u64 * Self::record_size::<A>()
    }

    fn resolve_place(
        reloc: &DynamicReloc,
        facts: &SymbolFacts,
        got: &GotTable,
        layout: &ImageLayout,
    ) -> Result<u64> {
        Ok(match reloc.place {
            DynPlace::Got(got_ref) => layout.got_address + got.offset_of(got_ref),
            DynPlace::Section { key, offset } => layout.section_address(key)? + offset,
            DynPlace::Symbol(symbol) => facts.value(symbol),
        })
    }

    fn resolve_addend(
        reloc: &DynamicReloc,
        facts: &SymbolFacts,
        got: &GotTable,
        layout: &ImageLayout,
    ) -> Result<i64> {
        Ok(match reloc.addend {
            DynAddend::Constant(value) => value,
            DynAddend::SymbolPlus(symbol, value) => facts.value(symbol) as i64 + value,
            DynAddend::TlsBlockOffset(symbol, value) => {
                facts.value(symbol).wrapping_sub(layout.tls_range()?.start) as i64 + value
            }
            DynAddend::GotSlotAddress(got_ref) => {
                (layout.got_address + got.offset_of(got_ref)) as i64
            }
        })
    }

    /// Emits the concatenated relocation table.
    pub fn write<A: Arch>(
        &self,
        facts: &SymbolFacts,
        got: &GotTable,
        layout: &ImageLayout,
        out: &mut [u8],
    ) -> Result {
        if out.len() as u64 != self.size_in_bytes::<A>() {
            bail!(
                "dynamic relocation buffer is {} bytes, expected {}",
                out.len(),
                self.size_in_bytes::<A>()
            );
        }

        // The output buffer has no alignment guarantee, so records are staged and copied rather
        // than cast in place.
        if A::uses_rela() {
            let chunks = out.chunks_exact_mut(RELA_ENTRY_SIZE as usize);
            for (chunk, reloc) in chunks.zip(self.iter_in_output_order()) {
                let symbol_index = match reloc.symbol {
                    Some(symbol) => facts.dynamic_symbol_index(symbol)?,
                    None => 0,
                };
                let record = Rela64 {
                    r_offset: Self::resolve_place(reloc, facts, got, layout)?,
                    r_info: u64::from(symbol_index) << 32
                        | u64::from(A::dynamic_relocation_type(reloc.kind)),
                    r_addend: Self::resolve_addend(reloc, facts, got, layout)?,
                };
                chunk.copy_from_slice(bytemuck::bytes_of(&record));
            }
        } else {
            // REL format: the addend has already been folded into the relocated field by the
            // table writers; only offset and info are emitted.
            let chunks = out.chunks_exact_mut(REL_ENTRY_SIZE as usize);
            for (chunk, reloc) in chunks.zip(self.iter_in_output_order()) {
                let symbol_index = match reloc.symbol {
                    Some(symbol) => facts.dynamic_symbol_index(symbol)?,
                    None => 0,
                };
                let record = Rel32 {
                    r_offset: Self::resolve_place(reloc, facts, got, layout)? as u32,
                    r_info: symbol_index << 8 | A::dynamic_relocation_type(reloc.kind),
                };
                chunk.copy_from_slice(bytemuck::bytes_of(&record));
            }
        }

        Ok(())
    }
}
