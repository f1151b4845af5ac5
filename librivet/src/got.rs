//! The global offset table, built during the scan pass and emitted during the apply pass. The
//! table is made of four sub-regions laid out in a fixed output order:
//!
//! 1. `.got`: standard address slots and TLS slots. These sit *before* the GOT base symbol, so
//!    their offsets relative to the base are negative.
//! 2. `.got.plt`: three reserved header words (the dynamic section pointer plus two words owned
//!    by the loader), then one jump slot per regular PLT entry. The GOT base points at the start
//!    of this region.
//! 3. The IRELATIVE jump-slot region, contiguous and strictly after all regular jump slots.
//! 4. The TLS-descriptor sub-region.
//!
//! Slots are allocated monotonically and never freed. Idempotence is keyed by symbol identity
//! through `SymbolFacts`, so the second request for the same (symbol, kind) returns the existing
//! slot.

use crate::args::OutputKind;
use crate::error::Result;
use crate::input::ImageLayout;
use crate::plt::PltTable;
use crate::symbol_facts::GotSlotKind;
use crate::symbol_facts::SymbolFacts;
use crate::symbol_facts::SymbolId;
use anyhow::bail;

/// The module ID of the executable itself is always 1.
pub(crate) const CURRENT_EXE_TLS_MOD: u64 = 1;

/// Number of loader-owned words at the start of `.got.plt`.
pub(crate) const GOT_PLT_HEADER_SLOTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GotRegion {
    Got,
    GotPlt,
    GotIrelative,
    GotTlsDesc,
}

/// A stable reference to one GOT slot: region plus slot index within the region. Byte offsets are
/// only meaningful once the table is frozen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GotRef {
    region: GotRegion,
    index: u32,
}

#[derive(Debug, Clone, Copy)]
enum GotSlot {
    /// The first `.got.plt` header word: the address of the dynamic section.
    DynamicPointer,

    /// A loader-owned `.got.plt` header word.
    Reserved,

    /// A jump slot owned by a regular PLT entry. Initialized to point back into the PLT entry so
    /// that the first call goes through the resolver.
    JumpSlot(SymbolId),

    /// A jump slot owned by an IRELATIVE PLT entry, filled by the IRELATIVE relocation.
    IrelativeSlot(SymbolId),

    /// The symbol's address.
    Standard(SymbolId),

    /// The symbol's static TLS offset.
    TlsOffset(SymbolId),

    /// First word of a general-dynamic pair: the module ID.
    TlsModule(SymbolId),

    /// Second word of a general-dynamic pair: the offset within the module's TLS block.
    TlsPairOffset(SymbolId),

    /// The shared local-dynamic module-ID pair.
    LdModule,
    LdOffset,

    /// First word of a TLS-descriptor pair: the resolver function, always loader-filled.
    TlsDescFn(SymbolId),

    /// Second word of a TLS-descriptor pair: the resolver's argument.
    TlsDescArg(SymbolId),

    /// The word the lazy TLS-descriptor trampoline jumps through.
    TlsDescResolver,
}

#[derive(Debug)]
pub struct GotTable {
    entry_size: u64,
    got: Vec<GotSlot>,
    got_plt: Vec<GotSlot>,
    irelative: Vec<GotSlot>,
    tlsdesc: Vec<GotSlot>,
    ld_module: Option<GotRef>,
    tlsdesc_resolver: Option<GotRef>,
    frozen: bool,
}

impl GotTable {
    #[must_use]
    pub fn new(entry_size: u64) -> Self {
        Self {
            entry_size,
            got: Vec::new(),
            got_plt: {
                let mut header = vec![GotSlot::Reserved; GOT_PLT_HEADER_SLOTS];
                header[0] = GotSlot::DynamicPointer;
                header
            },
            irelative: Vec::new(),
            tlsdesc: Vec::new(),
            ld_module: None,
            tlsdesc_resolver: None,
            frozen: false,
        }
    }

    fn push(&mut self, region: GotRegion, slot: GotSlot) -> GotRef {
        debug_assert!(!self.frozen, "GOT allocation after freeze");
        let list = match region {
            GotRegion::Got => &mut self.got,
            GotRegion::GotPlt => &mut self.got_plt,
            GotRegion::GotIrelative => &mut self.irelative,
            GotRegion::GotTlsDesc => &mut self.tlsdesc,
        };
        let index = list.len() as u32;
        list.push(slot);
        GotRef { region, index }
    }

    /// Returns the symbol's standard GOT slot and whether this call allocated it. Dynamic
    /// relocations for a slot are registered only by the caller that saw `true`.
    pub fn ensure_standard(
        &mut self,
        facts: &mut SymbolFacts,
        symbol: SymbolId,
    ) -> Result<(GotRef, bool)> {
        if let Some(existing) = facts.got_ref(symbol, GotSlotKind::Standard) {
            return Ok((existing, false));
        }
        let got_ref = self.push(GotRegion::Got, GotSlot::Standard(symbol));
        facts.record_got(symbol, GotSlotKind::Standard, got_ref)?;
        Ok((got_ref, true))
    }

    pub fn ensure_tls_offset(
        &mut self,
        facts: &mut SymbolFacts,
        symbol: SymbolId,
    ) -> Result<(GotRef, bool)> {
        if let Some(existing) = facts.got_ref(symbol, GotSlotKind::TlsOffset) {
            return Ok((existing, false));
        }
        let got_ref = self.push(GotRegion::Got, GotSlot::TlsOffset(symbol));
        facts.record_got(symbol, GotSlotKind::TlsOffset, got_ref)?;
        Ok((got_ref, true))
    }

    /// Allocates the module/offset pair for general-dynamic access. The returned slot is the
    /// module word; the following slot is reserved for the offset and is never handed out on its
    /// own.
    pub fn ensure_tls_pair(
        &mut self,
        facts: &mut SymbolFacts,
        symbol: SymbolId,
    ) -> Result<(GotRef, bool)> {
        if let Some(existing) = facts.got_ref(symbol, GotSlotKind::TlsPair) {
            return Ok((existing, false));
        }
        let got_ref = self.push(GotRegion::Got, GotSlot::TlsModule(symbol));
        self.push(GotRegion::Got, GotSlot::TlsPairOffset(symbol));
        facts.record_got(symbol, GotSlotKind::TlsPair, got_ref)?;
        Ok((got_ref, true))
    }

    pub fn ensure_tls_desc(
        &mut self,
        facts: &mut SymbolFacts,
        symbol: SymbolId,
    ) -> Result<(GotRef, bool)> {
        if let Some(existing) = facts.got_ref(symbol, GotSlotKind::TlsDesc) {
            return Ok((existing, false));
        }
        let got_ref = self.push(GotRegion::GotTlsDesc, GotSlot::TlsDescFn(symbol));
        self.push(GotRegion::GotTlsDesc, GotSlot::TlsDescArg(symbol));
        facts.record_got(symbol, GotSlotKind::TlsDesc, got_ref)?;
        Ok((got_ref, true))
    }

    /// The slot reserved alongside a pair-allocating slot (the offset word of a TLS pair, or the
    /// argument word of a TLS descriptor).
    #[must_use]
    pub fn pair_second_slot(got_ref: GotRef) -> GotRef {
        GotRef {
            region: got_ref.region,
            index: got_ref.index + 1,
        }
    }

    /// The process-wide local-dynamic module-ID pair.
    pub fn ensure_ld_module(&mut self) -> (GotRef, bool) {
        if let Some(existing) = self.ld_module {
            return (existing, false);
        }
        let got_ref = self.push(GotRegion::Got, GotSlot::LdModule);
        self.push(GotRegion::Got, GotSlot::LdOffset);
        self.ld_module = Some(got_ref);
        (got_ref, true)
    }

    #[must_use]
    pub fn ld_module_slot(&self) -> Option<GotRef> {
        self.ld_module
    }

    /// The slot the lazy TLS-descriptor trampoline indirects through.
    pub fn ensure_tlsdesc_resolver(&mut self) -> GotRef {
        if let Some(existing) = self.tlsdesc_resolver {
            return existing;
        }
        let got_ref = self.push(GotRegion::GotTlsDesc, GotSlot::TlsDescResolver);
        self.tlsdesc_resolver = Some(got_ref);
        got_ref
    }

    #[must_use]
    pub fn tlsdesc_resolver_slot(&self) -> Option<GotRef> {
        self.tlsdesc_resolver
    }

    pub(crate) fn add_jump_slot(&mut self, symbol: SymbolId) -> GotRef {
        self.push(GotRegion::GotPlt, GotSlot::JumpSlot(symbol))
    }

    pub(crate) fn add_irelative_slot(&mut self, symbol: SymbolId) -> GotRef {
        self.push(GotRegion::GotIrelative, GotSlot::IrelativeSlot(symbol))
    }

    /// Ends allocation. Offsets handed out by `offset_of` and `base_offset` are only stable from
    /// this point on.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    fn region_start(&self, region: GotRegion) -> u64 {
        debug_assert!(self.frozen, "GOT offsets queried before freeze");
        let slots = match region {
            GotRegion::Got => 0,
            GotRegion::GotPlt => self.got.len(),
            GotRegion::GotIrelative => self.got.len() + self.got_plt.len(),
            GotRegion::GotTlsDesc => self.got.len() + self.got_plt.len() + self.irelative.len(),
        };
        slots as u64 * self.entry_size
    }

    /// Byte offset of the slot from the start of the table.
    #[must_use]
    pub fn offset_of(&self, got_ref: GotRef) -> u64 {
        self.region_start(got_ref.region) + u64::from(got_ref.index) * self.entry_size
    }

    /// Byte offset of the GOT base symbol (`_GLOBAL_OFFSET_TABLE_`), which points at the start of
    /// `.got.plt`. Standard and TLS slots are addressed by negative distances from here.
    #[must_use]
    pub fn base_offset(&self) -> u64 {
        self.region_start(GotRegion::GotPlt)
    }

    #[must_use]
    pub fn entry_size(&self) -> u64 {
        self.entry_size
    }

    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.got.len() + self.got_plt.len() + self.irelative.len() + self.tlsdesc.len()
    }

    #[must_use]
    pub fn size_in_bytes(&self) -> u64 {
        self.entry_count() as u64 * self.entry_size
    }

    /// Fills in the link-time contents of every slot.
    pub fn write(
        &self,
        facts: &SymbolFacts,
        plt: &PltTable,
        layout: &ImageLayout,
        output_kind: OutputKind,
        out: &mut [u8],
    ) -> Result {
        if out.len() as u64 != self.size_in_bytes() {
            bail!(
                "GOT buffer is {} bytes, expected {}",
                out.len(),
                self.size_in_bytes()
            );
        }

        let entry_size = self.entry_size as usize;
        let regions = [&self.got, &self.got_plt, &self.irelative, &self.tlsdesc];
        let mut chunks = out.chunks_exact_mut(entry_size);

        for slot in regions.into_iter().flatten() {
            let chunk = chunks.next().expect("sized above");
            let value = self.slot_value(*slot, facts, plt, layout, output_kind)?;
            chunk.copy_from_slice(&value.to_le_bytes()[..entry_size]);
        }

        Ok(())
    }

    fn slot_value(
        &self,
        slot: GotSlot,
        facts: &SymbolFacts,
        plt: &PltTable,
        layout: &ImageLayout,
        output_kind: OutputKind,
    ) -> Result<u64> {
        let value = match slot {
            GotSlot::DynamicPointer => layout.dynamic_section_address.unwrap_or(0),
            GotSlot::Reserved => 0,
            GotSlot::JumpSlot(symbol) => {
                let plt_ref = facts
                    .plt_ref(symbol)
                    .ok_or_else(|| anyhow::anyhow!("jump slot without PLT entry"))?;
                layout.plt_address + plt.offset_of(plt_ref) + plt.lazy_resume_offset()
            }
            // The resolver's address doubles as the relocation addend for REL-format output; the
            // loader replaces it with the resolver's result.
            GotSlot::IrelativeSlot(symbol) => facts.value(symbol),
            GotSlot::Standard(symbol) => {
                let flags = facts.value_flags(symbol);
                if flags.is_dynamic() {
                    0
                } else if flags.is_ifunc() {
                    // Address-equality for the ifunc: the canonical address is its PLT entry.
                    match facts.plt_ref(symbol) {
                        Some(plt_ref) => layout.plt_address + plt.offset_of(plt_ref),
                        None => 0,
                    }
                } else {
                    facts.value(symbol)
                }
            }
            GotSlot::TlsOffset(symbol) => {
                let flags = facts.value_flags(symbol);
                if !flags.is_final() {
                    0
                } else if output_kind.is_executable() {
                    let tls = layout.tls_range()?;
                    facts.value(symbol).wrapping_sub(tls.end)
                } else {
                    // A TPOFF relocation adjusts this at load time; until then it holds the
                    // symbol's offset within the TLS segment, which is also the REL-format
                    // addend.
                    let tls = layout.tls_range()?;
                    facts.value(symbol).wrapping_sub(tls.start)
                }
            }
            GotSlot::TlsModule(symbol) => {
                if output_kind.is_executable() && !facts.value_flags(symbol).is_dynamic() {
                    CURRENT_EXE_TLS_MOD
                } else {
                    0
                }
            }
            GotSlot::TlsPairOffset(symbol) => {
                let flags = facts.value_flags(symbol);
                if flags.is_final() {
                    let tls = layout.tls_range()?;
                    facts.value(symbol).wrapping_sub(tls.start)
                } else {
                    0
                }
            }
            GotSlot::LdModule => {
                if output_kind.is_executable() {
                    CURRENT_EXE_TLS_MOD
                } else {
                    0
                }
            }
            GotSlot::LdOffset => 0,
            GotSlot::TlsDescFn(_) | GotSlot::TlsDescResolver => 0,
            GotSlot::TlsDescArg(symbol) => {
                let flags = facts.value_flags(symbol);
                if flags.is_final() {
                    let tls = layout.tls_range()?;
                    facts.value(symbol).wrapping_sub(tls.start)
                } else {
                    0
                }
            }
        };
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbol_facts::ValueFlags;

    #[test]
    fn allocation_is_idempotent() {
        let mut facts = SymbolFacts::new();
        let sym = facts.add_symbol(Some("x"), ValueFlags::NON_INTERPOSABLE);
        let mut got = GotTable::new(8);

        let (first, new) = got.ensure_standard(&mut facts, sym).unwrap();
        assert!(new);
        let (second, new) = got.ensure_standard(&mut facts, sym).unwrap();
        assert!(!new);
        assert_eq!(first, second);
        assert_eq!(got.entry_count(), 1 + GOT_PLT_HEADER_SLOTS);

        let (pair, _) = got.ensure_tls_pair(&mut facts, sym).unwrap();
        assert_eq!(got.ensure_tls_pair(&mut facts, sym).unwrap().0, pair);
        // The pair reserves its follow-on slot.
        assert_eq!(got.entry_count(), 3 + GOT_PLT_HEADER_SLOTS);
        assert_eq!(GotTable::pair_second_slot(pair).index, pair.index + 1);
    }

    #[test]
    fn regions_are_ordered() {
        let mut facts = SymbolFacts::new();
        let a = facts.add_symbol(Some("a"), ValueFlags::NON_INTERPOSABLE);
        let b = facts.add_symbol(Some("b"), ValueFlags::NON_INTERPOSABLE | ValueFlags::IFUNC);
        let mut got = GotTable::new(8);

        let (standard, _) = got.ensure_standard(&mut facts, a).unwrap();
        let jump = got.add_jump_slot(a);
        let irelative = got.add_irelative_slot(b);
        let (desc, _) = got.ensure_tls_desc(&mut facts, a).unwrap();
        got.freeze();

        // .got sits below the base, .got.plt at the base, IRELATIVE after all regular jump
        // slots, TLSDESC last.
        assert_eq!(got.offset_of(standard), 0);
        assert_eq!(got.base_offset(), 8);
        assert_eq!(
            got.offset_of(jump),
            8 + GOT_PLT_HEADER_SLOTS as u64 * 8
        );
        assert!(got.offset_of(irelative) > got.offset_of(jump));
        assert!(got.offset_of(desc) > got.offset_of(irelative));
    }

    #[test]
    fn ld_module_slot_is_shared() {
        let mut got = GotTable::new(8);
        let (first, new) = got.ensure_ld_module();
        assert!(new);
        let (second, new) = got.ensure_ld_module();
        assert!(!new);
        assert_eq!(first, second);
        assert_eq!(got.entry_count(), 2 + GOT_PLT_HEADER_SLOTS);
    }
}
