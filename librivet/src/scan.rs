//! The scan pass. Walks every relocation of every input section once, classifies it, runs the
//! TLS optimizer, and allocates whatever the apply pass will need: GOT slots, PLT entries and
//! dynamic relocations. All allocation decisions land in `SymbolFacts`, keyed by symbol identity,
//! so repeated references to one symbol share their slots.
//!
//! Scanning must finish for *all* objects before anything is applied: GOT and PLT offsets only
//! stop moving once no more slots will be allocated. That ordering is enforced by construction:
//! the only way to obtain a `ScanComplete` (which the applier requires) is `Scanner::finish`,
//! which consumes the scanner and freezes the tables.

use crate::arch::Arch;
use crate::arch::Relaxation as _;
use crate::arch::expected_tls_optimization;
use crate::args::Args;
use crate::diagnostics::DiagnosticSink;
use crate::dynamic_reloc::DynAddend;
use crate::dynamic_reloc::DynPlace;
use crate::dynamic_reloc::DynamicRelocSink;
use crate::error::OpcodePatternMismatch;
use crate::error::Result;
use crate::error::TlsModelConflict;
use crate::error::UnexpectedRuntimeRelocation;
use crate::error::UnsupportedRelocation;
use crate::got::GotTable;
use crate::input::InputObject;
use crate::input::Relocation;
use crate::input::SectionInfo;
use crate::input::SectionKey;
use crate::plt::PltTable;
use crate::symbol_facts::SymbolFacts;
use crate::symbol_facts::SymbolId;
use crate::symbol_facts::ValueFlags;
use anyhow::Error;
use anyhow::bail;
use rivet_utils::elf::DynamicRelocationKind;
use rivet_utils::elf::ReferenceFlags;
use rivet_utils::elf::RelocationKind;
use rivet_utils::elf::RelocationKindInfo;
use rivet_utils::elf::shf;
use rivet_utils::relaxation::RelocationModifier;
use rivet_utils::tls::TlsOptimization;

/// Which local-dynamic TLS convention a section has committed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LocalDynamicConvention {
    Unknown,
    Gnu,
    Sun,
}

pub struct Scanner<'a, A: Arch> {
    args: &'a Args,
    diagnostics: &'a DiagnosticSink,
    facts: SymbolFacts,
    got: GotTable,
    plt: PltTable,
    dynamic: DynamicRelocSink,
    _arch: std::marker::PhantomData<A>,
}

impl<'a, A: Arch> Scanner<'a, A> {
    #[must_use]
    pub fn new(args: &'a Args, facts: SymbolFacts, diagnostics: &'a DiagnosticSink) -> Self {
        Self {
            args,
            diagnostics,
            facts,
            got: GotTable::new(A::got_entry_size()),
            plt: PltTable::new(A::plt_format(args)),
            dynamic: DynamicRelocSink::new(),
            _arch: std::marker::PhantomData,
        }
    }

    #[must_use]
    pub fn facts(&self) -> &SymbolFacts {
        &self.facts
    }

    /// Scans one section's relocations in program order. A bad relocation is reported against the
    /// owning object and scanning continues, so that one run gathers every diagnostic.
    pub fn scan_relocations(
        &mut self,
        object: &InputObject,
        section: &SectionInfo,
        relocations: &[Relocation],
    ) -> Result {
        let _span = tracing::trace_span!("scan_section", object = %object.name).entered();

        let mut modifier = RelocationModifier::Normal;
        let mut ld_convention = LocalDynamicConvention::Unknown;

        for rel in relocations {
            if modifier == RelocationModifier::SkipNextRelocation {
                modifier = RelocationModifier::Normal;
                if let Err(error) = check_companion::<A>(object, rel) {
                    self.diagnostics.report_error(error);
                }
                continue;
            }
            match self.scan_relocation(object, section, rel, &mut ld_convention) {
                Ok(next) => modifier = next,
                Err(error) => {
                    self.diagnostics.report_error(error);
                    modifier = RelocationModifier::Normal;
                }
            }
        }
        Ok(())
    }

    fn scan_relocation(
        &mut self,
        object: &InputObject,
        section: &SectionInfo,
        rel: &Relocation,
        ld_convention: &mut LocalDynamicConvention,
    ) -> Result<RelocationModifier> {
        let r_type = rel.r_type;

        if A::is_dynamic_only(r_type) {
            return Err(Error::new(UnexpectedRuntimeRelocation {
                rel_type: A::rel_type_to_string(r_type).into_owned(),
                object: object.name.clone(),
            }));
        }

        if A::is_sun_tls(r_type) {
            if *ld_convention == LocalDynamicConvention::Gnu {
                return Err(Error::new(TlsModelConflict {
                    object: object.name.clone(),
                }));
            }
            *ld_convention = LocalDynamicConvention::Sun;
            // Conflict detection aside, the Sun convention is not implemented.
            return Err(Error::new(UnsupportedRelocation {
                rel_type: A::rel_type_to_string(r_type).into_owned(),
                object: object.name.clone(),
            }));
        }

        let Some(orig_info) = A::relocation_from_raw(r_type) else {
            return Err(Error::new(UnsupportedRelocation {
                rel_type: A::rel_type_to_string(r_type).into_owned(),
                object: object.name.clone(),
            }));
        };

        if matches!(
            orig_info.kind,
            RelocationKind::TlsLd | RelocationKind::TlsLdGotBase
        ) {
            if *ld_convention == LocalDynamicConvention::Sun {
                return Err(Error::new(TlsModelConflict {
                    object: object.name.clone(),
                }));
            }
            *ld_convention = LocalDynamicConvention::Gnu;
        }

        let symbol = self
            .facts
            .definition(object.symbol_id_range.input_to_id(rel.symbol as usize));
        let value_flags = self.facts.value_flags(symbol);
        let output_kind = self.args.output_kind();

        // The same relaxation decision is recomputed during apply; both sides must see identical
        // inputs, which is why the decision depends only on flags and bytes, never on addresses.
        let relaxation = A::Relaxation::new(
            r_type,
            section.data,
            rel.offset,
            value_flags,
            output_kind,
            section.flags,
        )
        .filter(|relaxation| self.args.relax || relaxation.is_mandatory());

        if orig_info.kind.is_tls()
            && requires_tls_rewrite(orig_info.kind)
            && expected_tls_optimization(orig_info.kind, value_flags, output_kind)
                != TlsOptimization::None
            && relaxation.is_none()
        {
            return Err(Error::new(OpcodePatternMismatch {
                rel_type: A::rel_type_to_string(r_type).into_owned(),
                object: object.name.clone(),
                offset: rel.offset,
            }));
        }

        let (rel_info, next_modifier) = match &relaxation {
            Some(relaxation) => (relaxation.rel_info(), relaxation.next_modifier()),
            None => (orig_info, RelocationModifier::Normal),
        };

        tracing::trace!(
            rel_type = %A::rel_type_to_string(r_type),
            ?rel_info.kind,
            %value_flags,
            symbol = %self.facts.symbol_debug(symbol),
            "scan relocation"
        );

        // An ifunc whose address escapes needs a PLT entry: the entry is the symbol's canonical
        // address.
        let reference_flags = rel_info.kind.reference_flags();
        if value_flags.is_ifunc()
            && reference_flags.intersects(
                ReferenceFlags::ABSOLUTE | ReferenceFlags::RELATIVE | ReferenceFlags::FUNCTION_CALL,
            )
        {
            self.plt
                .ensure_entry(&mut self.facts, &mut self.got, &mut self.dynamic, symbol)?;
        }

        let key = SectionKey {
            file_id: object.file_id,
            section_index: section.index,
        };

        match rel_info.kind {
            RelocationKind::Absolute => {
                self.scan_absolute(object, section, key, rel, rel_info, symbol, value_flags)?;
            }
            RelocationKind::Relative => {
                self.scan_pc_relative(object, symbol, value_flags)?;
            }
            RelocationKind::SymRelGotBase => {}
            RelocationKind::GotRelGotBase | RelocationKind::GotRelative => {
                self.scan_got_reference(symbol, value_flags)?;
            }
            RelocationKind::PltRelative | RelocationKind::PltRelGotBase => {
                if !value_flags.can_bypass_got() {
                    self.plt.ensure_entry(
                        &mut self.facts,
                        &mut self.got,
                        &mut self.dynamic,
                        symbol,
                    )?;
                }
            }
            RelocationKind::TlsGd | RelocationKind::TlsGdGotBase => {
                self.scan_tls_general_dynamic(symbol, value_flags)?;
            }
            RelocationKind::TlsLd | RelocationKind::TlsLdGotBase => {
                self.scan_tls_local_dynamic();
            }
            RelocationKind::DtpOff => {}
            RelocationKind::GotTpOff
            | RelocationKind::GotTpOffGot
            | RelocationKind::GotTpOffGotBase => {
                let slot = self.scan_tls_initial_exec(symbol, value_flags)?;
                // A site holding the slot's absolute address must itself be relocated when the
                // output can move.
                if rel_info.kind == RelocationKind::GotTpOffGot && output_kind.is_relocatable() {
                    self.dynamic.push_regular(
                        DynamicRelocationKind::Relative,
                        DynPlace::Section {
                            key,
                            offset: rel.offset,
                        },
                        None,
                        DynAddend::GotSlotAddress(slot),
                    );
                }
            }
            RelocationKind::TpOff | RelocationKind::TpOffNegated => {
                if output_kind.is_shared_object() {
                    bail!(
                        "{}: local-exec TLS relocation {} cannot be used in a shared object",
                        object.name,
                        A::rel_type_to_string(r_type)
                    );
                }
            }
            RelocationKind::TlsDesc | RelocationKind::TlsDescGotBase => {
                self.scan_tls_descriptor(symbol, value_flags)?;
            }
            RelocationKind::TlsDescCall => {}
            RelocationKind::None => {}
        }

        Ok(next_modifier)
    }

    fn scan_absolute(
        &mut self,
        object: &InputObject,
        section: &SectionInfo,
        key: SectionKey,
        rel: &Relocation,
        rel_info: RelocationKindInfo,
        symbol: SymbolId,
        value_flags: ValueFlags,
    ) -> Result {
        let output_kind = self.args.output_kind();

        if !output_kind.is_relocatable() {
            if value_flags.is_dynamic() {
                if value_flags.is_function() {
                    // The symbol's address must be unique across the process: give it a canonical
                    // PLT entry here and let the dynamic symbol resolve to it.
                    self.plt.ensure_entry(
                        &mut self.facts,
                        &mut self.got,
                        &mut self.dynamic,
                        symbol,
                    )?;
                } else if self.args.allow_copy_relocations {
                    // Copy the object into our own writable storage instead of paying a runtime
                    // relocation on every load.
                    if self.facts.record_copy_relocation(symbol) {
                        self.dynamic.push_regular(
                            DynamicRelocationKind::Copy,
                            DynPlace::Symbol(symbol),
                            Some(symbol),
                            DynAddend::Constant(0),
                        );
                    }
                } else {
                    bail!(
                        "Direct relocation ({}) to dynamic symbol {}, but copy relocations are \
                        disabled",
                        A::rel_type_to_string(rel.r_type),
                        self.facts.symbol_debug(symbol),
                    );
                }
            }
            return Ok(());
        }

        // Relocatable output.
        if value_flags.is_ifunc() {
            self.dynamic.push_irelative_at(key, rel.offset, symbol);
        } else if value_flags.is_dynamic() {
            // The value is only known at load time; materialize it once in the GOT.
            self.scan_got_reference(symbol, value_flags)?;
        } else if value_flags.is_address() {
            if rel_info.size.byte_size() < A::got_entry_size() as usize {
                bail!(
                    "Cannot apply relocation {} in relocatable output: the field is narrower \
                    than a pointer. Please recompile with -fPIC",
                    A::rel_type_to_string(rel.r_type),
                );
            }
            if !section.flags.contains(shf::WRITE) {
                bail!(
                    "Cannot apply relocation {} to read-only section in {}. Please recompile \
                    with -fPIC",
                    A::rel_type_to_string(rel.r_type),
                    object.name,
                );
            }
            self.dynamic.push_regular(
                DynamicRelocationKind::Relative,
                DynPlace::Section {
                    key,
                    offset: rel.offset,
                },
                None,
                DynAddend::SymbolPlus(symbol, rel.addend),
            );
        }
        // Absolute non-address values (constants, undefined weak) are fixed at link time.

        Ok(())
    }

    fn scan_pc_relative(
        &mut self,
        object: &InputObject,
        symbol: SymbolId,
        value_flags: ValueFlags,
    ) -> Result {
        if !value_flags.is_dynamic() {
            return Ok(());
        }
        if value_flags.is_function() {
            // A PC-relative reference to a preemptible function goes through the PLT; the apply
            // pass substitutes the entry's address.
            self.plt
                .ensure_entry(&mut self.facts, &mut self.got, &mut self.dynamic, symbol)?;
            return Ok(());
        }
        if !self.args.output_kind().is_relocatable() && self.args.allow_copy_relocations {
            if self.facts.record_copy_relocation(symbol) {
                self.dynamic.push_regular(
                    DynamicRelocationKind::Copy,
                    DynPlace::Symbol(symbol),
                    Some(symbol),
                    DynAddend::Constant(0),
                );
            }
            return Ok(());
        }
        bail!(
            "{}: PC-relative reference to dynamic symbol {} cannot be resolved at link time",
            object.name,
            self.facts.symbol_debug(symbol),
        )
    }

    fn scan_got_reference(&mut self, symbol: SymbolId, value_flags: ValueFlags) -> Result {
        let (slot, is_new) = self.got.ensure_standard(&mut self.facts, symbol)?;
        if !is_new {
            return Ok(());
        }
        let output_kind = self.args.output_kind();

        if value_flags.is_ifunc() {
            if value_flags.is_interposable() || value_flags.is_dynamic() {
                self.dynamic.push_regular(
                    DynamicRelocationKind::GotEntry,
                    DynPlace::Got(slot),
                    Some(symbol),
                    DynAddend::Constant(0),
                );
            } else {
                // A local ifunc's slot is resolved by running the resolver.
                self.dynamic.push_irelative(slot, symbol);
            }
        } else if value_flags.is_dynamic()
            || (value_flags.is_interposable()
                && !value_flags.is_undefined()
                && output_kind.needs_dynsym())
            || (value_flags.is_undefined() && output_kind.is_shared_object())
        {
            // The slot may be satisfied by a different definition at load time.
            self.dynamic.push_regular(
                DynamicRelocationKind::GotEntry,
                DynPlace::Got(slot),
                Some(symbol),
                DynAddend::Constant(0),
            );
        } else if value_flags.is_address() && output_kind.is_relocatable() {
            self.dynamic.push_regular(
                DynamicRelocationKind::Relative,
                DynPlace::Got(slot),
                None,
                DynAddend::SymbolPlus(symbol, 0),
            );
        }
        // Otherwise the link-time value goes straight into the slot.

        Ok(())
    }

    fn scan_tls_general_dynamic(&mut self, symbol: SymbolId, value_flags: ValueFlags) -> Result {
        let (slot, is_new) = self.got.ensure_tls_pair(&mut self.facts, symbol)?;
        if !is_new {
            return Ok(());
        }
        let output_kind = self.args.output_kind();
        let interposed = value_flags.is_dynamic()
            || (value_flags.is_interposable() && output_kind.needs_dynsym());

        // The module ID is only a link-time constant in an executable linking its own variable.
        if !output_kind.is_executable() || value_flags.is_dynamic() {
            self.dynamic.push_regular(
                DynamicRelocationKind::DtpMod,
                DynPlace::Got(slot),
                interposed.then_some(symbol),
                DynAddend::Constant(0),
            );
        }
        if interposed {
            self.dynamic.push_regular(
                DynamicRelocationKind::DtpOff,
                DynPlace::Got(GotTable::pair_second_slot(slot)),
                Some(symbol),
                DynAddend::Constant(0),
            );
        }
        Ok(())
    }

    fn scan_tls_local_dynamic(&mut self) {
        let (slot, is_new) = self.got.ensure_ld_module();
        if is_new && !self.args.output_kind().is_executable() {
            self.dynamic.push_regular(
                DynamicRelocationKind::DtpMod,
                DynPlace::Got(slot),
                None,
                DynAddend::Constant(0),
            );
        }
    }

    fn scan_tls_initial_exec(
        &mut self,
        symbol: SymbolId,
        value_flags: ValueFlags,
    ) -> Result<crate::got::GotRef> {
        let (slot, is_new) = self.got.ensure_tls_offset(&mut self.facts, symbol)?;
        if !is_new {
            return Ok(slot);
        }
        let output_kind = self.args.output_kind();

        if value_flags.is_dynamic()
            || (value_flags.is_interposable()
                && !value_flags.is_undefined()
                && output_kind.needs_dynsym())
        {
            self.dynamic.push_regular(
                DynamicRelocationKind::TpOff,
                DynPlace::Got(slot),
                Some(symbol),
                DynAddend::Constant(0),
            );
        } else if output_kind.is_shared_object() {
            // Locally resolved, but the segment's base offset within static TLS is only known at
            // load time.
            self.dynamic.push_regular(
                DynamicRelocationKind::TpOff,
                DynPlace::Got(slot),
                None,
                DynAddend::TlsBlockOffset(symbol, 0),
            );
        }
        // In an executable with a final value the slot is filled directly.

        Ok(slot)
    }

    fn scan_tls_descriptor(&mut self, symbol: SymbolId, value_flags: ValueFlags) -> Result {
        if self.args.output_kind().is_static_executable() {
            bail!(
                "Cannot create TLS descriptor for {} in a static executable: there is no loader \
                to run the resolver",
                self.facts.symbol_debug(symbol),
            );
        }
        let (slot, is_new) = self.got.ensure_tls_desc(&mut self.facts, symbol)?;
        if !is_new {
            return Ok(());
        }
        self.plt.ensure_tlsdesc_resolver(&mut self.got)?;

        let interposed = value_flags.is_dynamic()
            || (value_flags.is_interposable() && self.args.output_kind().needs_dynsym());
        let addend = if interposed {
            DynAddend::Constant(0)
        } else {
            DynAddend::TlsBlockOffset(symbol, 0)
        };
        self.dynamic
            .push_tlsdesc(slot, interposed.then_some(symbol), addend);
        Ok(())
    }

    /// Ends the scan phase. Freezes the tables (no further allocation is possible), checks the
    /// PLT/relocation coupling invariant, and returns the token the applier requires.
    pub fn finish(mut self) -> Result<ScanComplete<A>> {
        self.got.freeze();
        self.plt.freeze();
        self.plt.validate(&self.dynamic)?;

        Ok(ScanComplete {
            args: self.args.clone(),
            facts: self.facts,
            got: self.got,
            plt: self.plt,
            dynamic: self.dynamic,
            _arch: std::marker::PhantomData,
        })
    }
}

/// After a rewritten general/local-dynamic sequence, the following relocation is the call to
/// `__tls_get_addr` that the rewrite consumed. It must look like one.
pub(crate) fn check_companion<A: Arch>(object: &InputObject, rel: &Relocation) -> Result {
    let info = A::relocation_from_raw(rel.r_type);
    let ok = matches!(
        info.map(|i| i.kind),
        Some(
            RelocationKind::PltRelative
                | RelocationKind::PltRelGotBase
                | RelocationKind::GotRelative
                | RelocationKind::GotRelGotBase
        )
    );
    if !ok {
        return Err(Error::new(OpcodePatternMismatch {
            rel_type: A::rel_type_to_string(rel.r_type).into_owned(),
            object: object.name.clone(),
            offset: rel.offset,
        }));
    }
    Ok(())
}

/// TLS relocation kinds whose downgrade requires rewriting the instruction sequence, as opposed
/// to kinds whose field arithmetic already produces the right value.
pub(crate) fn requires_tls_rewrite(kind: RelocationKind) -> bool {
    matches!(
        kind,
        RelocationKind::TlsGd
            | RelocationKind::TlsGdGotBase
            | RelocationKind::TlsLd
            | RelocationKind::TlsLdGotBase
            | RelocationKind::GotTpOff
            | RelocationKind::GotTpOffGot
            | RelocationKind::GotTpOffGotBase
            | RelocationKind::TlsDesc
            | RelocationKind::TlsDescGotBase
            | RelocationKind::TlsDescCall
    )
}

/// Proof that the scan phase has finished: holds the frozen tables. The applier can only be
/// built from one of these, which makes "scan everything, then apply everything" a property of
/// the types rather than of call-site discipline.
pub struct ScanComplete<A: Arch> {
    pub(crate) args: Args,
    pub(crate) facts: SymbolFacts,
    pub(crate) got: GotTable,
    pub(crate) plt: PltTable,
    pub(crate) dynamic: DynamicRelocSink,
    _arch: std::marker::PhantomData<A>,
}

impl<A: Arch> ScanComplete<A> {
    #[must_use]
    pub fn facts(&self) -> &SymbolFacts {
        &self.facts
    }

    /// Layout runs between scan and apply; it feeds symbol addresses back in through here.
    pub fn facts_mut(&mut self) -> &mut SymbolFacts {
        &mut self.facts
    }

    #[must_use]
    pub fn got(&self) -> &GotTable {
        &self.got
    }

    #[must_use]
    pub fn plt(&self) -> &PltTable {
        &self.plt
    }

    #[must_use]
    pub fn dynamic_relocations(&self) -> &DynamicRelocSink {
        &self.dynamic
    }

    #[must_use]
    pub fn plt_entry_count(&self) -> usize {
        self.plt.entry_count()
    }

    #[must_use]
    pub fn got_entry_count(&self) -> usize {
        self.got.entry_count()
    }

    #[must_use]
    pub fn first_plt_entry_offset(&self) -> u64 {
        self.plt.first_plt_entry_offset()
    }

    #[must_use]
    pub fn plt_entry_size(&self) -> u64 {
        self.plt.entry_size()
    }
}
