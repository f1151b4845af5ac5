//! The apply pass. Runs after scanning has finished for every object: all GOT/PLT offsets are
//! frozen, so each relocation can be computed to a final number (or an instruction rewrite) and
//! written into the output image.
//!
//! There is no shared mutable state here. Each call writes only into its own section's bytes, so
//! sections can be applied in parallel; within one section relocations are processed in file
//! order because a rewritten TLS sequence consumes its companion relocation.

use crate::arch::Arch;
use crate::arch::Relaxation as _;
use crate::arch::expected_tls_optimization;
use crate::diagnostics::DiagnosticSink;
use crate::error::Error;
use crate::error::OpcodePatternMismatch;
use crate::error::RelocationOverflow;
use crate::error::Result;
use crate::error::UnexpectedRuntimeRelocation;
use crate::error::UnsupportedRelocation;
use crate::input::ImageLayout;
use crate::input::InputObject;
use crate::input::Relocation;
use crate::input::SectionInfo;
use crate::input::SectionKey;
use crate::scan::ScanComplete;
use crate::scan::check_companion;
use crate::scan::requires_tls_rewrite;
use crate::symbol_facts::GotSlotKind;
use crate::symbol_facts::SymbolId;
use anyhow::Context as _;
use rayon::prelude::*;
use rivet_utils::elf::RelocationKind;
use rivet_utils::elf::RelocationKindInfo;
use rivet_utils::relaxation::RelocationModifier;
use rivet_utils::tls::TlsOptimization;

pub struct Applier<'a, A: Arch> {
    scan: &'a ScanComplete<A>,
    layout: &'a ImageLayout,
    diagnostics: &'a DiagnosticSink,
}

/// One section's worth of relocation work, for the parallel driver.
pub struct SectionApplyTask<'data, 'out> {
    pub object: &'data InputObject,
    pub section: SectionInfo<'data>,
    pub relocations: &'data [Relocation],

    /// The section's bytes in the output image.
    pub out: &'out mut [u8],
}

impl<'a, A: Arch> Applier<'a, A> {
    /// Requires a `ScanComplete`: the type-level witness that no further GOT/PLT allocation can
    /// happen.
    #[must_use]
    pub fn new(
        scan: &'a ScanComplete<A>,
        layout: &'a ImageLayout,
        diagnostics: &'a DiagnosticSink,
    ) -> Self {
        Self {
            scan,
            layout,
            diagnostics,
        }
    }

    /// Applies one section's relocations into `out`. Overflows and other per-relocation errors
    /// are reported and processing continues; the link fails overall once anything was reported.
    pub fn apply_relocations(
        &self,
        object: &InputObject,
        section: &SectionInfo,
        relocations: &[Relocation],
        out: &mut [u8],
    ) -> Result {
        let key = SectionKey {
            file_id: object.file_id,
            section_index: section.index,
        };
        let section_address = self.layout.section_address(key)?;
        let _span =
            tracing::trace_span!("apply_section", object = %object.name, section_address).entered();

        let mut modifier = RelocationModifier::Normal;
        for rel in relocations {
            if modifier == RelocationModifier::SkipNextRelocation {
                modifier = RelocationModifier::Normal;
                if let Err(error) = check_companion::<A>(object, rel) {
                    self.diagnostics.report_error(error);
                }
                continue;
            }
            match self.apply_relocation(object, section, rel, section_address, out) {
                Ok(next) => modifier = next,
                Err(error) => {
                    self.diagnostics.report_error(error);
                    modifier = RelocationModifier::Normal;
                }
            }
        }
        Ok(())
    }

    /// Applies many sections concurrently. Ordering only matters within a section, never across
    /// sections.
    pub fn apply_sections(&self, tasks: &mut [SectionApplyTask]) -> Result
    where
        A: Sync,
    {
        tasks.par_iter_mut().try_for_each(|task| {
            self.apply_relocations(task.object, &task.section, task.relocations, task.out)
        })
    }

    fn apply_relocation(
        &self,
        object: &InputObject,
        section: &SectionInfo,
        rel: &Relocation,
        section_address: u64,
        out: &mut [u8],
    ) -> Result<RelocationModifier> {
        let r_type = rel.r_type;
        let facts = &self.scan.facts;
        let got = &self.scan.got;
        let plt = &self.scan.plt;
        let output_kind = self.scan.args.output_kind();

        if A::is_dynamic_only(r_type) {
            return Err(Error::new(UnexpectedRuntimeRelocation {
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

        let symbol = facts.definition(object.symbol_id_range.input_to_id(rel.symbol as usize));
        let value_flags = facts.value_flags(symbol);
        let mut offset_in_section = rel.offset;
        let mut addend = rel.addend;

        // Recompute the same decision the scan pass made. The inputs are identical by
        // construction, so the two passes cannot disagree about what was allocated.
        let relaxation = A::Relaxation::new(
            r_type,
            out,
            offset_in_section,
            value_flags,
            output_kind,
            section.flags,
        )
        .filter(|relaxation| self.scan.args.relax || relaxation.is_mandatory());

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

        let mut next_modifier = RelocationModifier::Normal;
        let rel_info;
        if let Some(relaxation) = &relaxation {
            rel_info = relaxation.rel_info();
            relaxation.apply(out, &mut offset_in_section, &mut addend);
            next_modifier = relaxation.next_modifier();
            tracing::trace!(
                relaxation_kind = ?relaxation.debug_kind(),
                %value_flags,
                symbol = %facts.symbol_debug(symbol),
                "relaxation applied"
            );
        } else {
            rel_info = orig_info;
        }

        // The place IP-relative relocations are relative to; the rewrite may have moved the
        // field.
        let place = section_address + offset_in_section;

        let got_base = || self.layout.got_address + got.base_offset();
        let got_slot_address = |kind: GotSlotKind| -> Result<u64> {
            let slot = facts.got_ref(symbol, kind).with_context(|| {
                format!("Missing {kind:?} GOT slot for {}", facts.symbol_debug(symbol))
            })?;
            Ok(self.layout.got_address + got.offset_of(slot))
        };
        let plt_address = |symbol: SymbolId| -> Result<u64> {
            let plt_ref = facts.plt_ref(symbol).with_context(|| {
                format!("Missing PLT entry for {}", facts.symbol_debug(symbol))
            })?;
            Ok(self.layout.plt_address + plt.offset_of(plt_ref))
        };
        // The value the reference resolves to: the PLT entry's address when the symbol must be
        // reached (or identified) through the PLT, the real value otherwise.
        let effective_value = || -> Result<u64> {
            if facts.plt_ref(symbol).is_some() && !value_flags.can_bypass_got() {
                plt_address(symbol)
            } else {
                Ok(facts.value(symbol))
            }
        };
        let ld_slot_address = || -> Result<u64> {
            let slot = got
                .ld_module_slot()
                .context("Local-dynamic relocation without module-ID GOT slot")?;
            Ok(self.layout.got_address + got.offset_of(slot))
        };

        let value = match rel_info.kind {
            RelocationKind::Absolute => {
                if value_flags.is_ifunc() {
                    if output_kind.is_relocatable() {
                        // The site carries an IRELATIVE relocation; until the loader runs the
                        // resolver, the field holds the resolver's address (which is also the
                        // implicit addend in REL-format output).
                        facts.value(symbol).wrapping_add(addend as u64)
                    } else {
                        plt_address(symbol)?.wrapping_add(addend as u64)
                    }
                } else if value_flags.is_dynamic() {
                    if facts.needs_copy_relocation(symbol) {
                        facts.value(symbol).wrapping_add(addend as u64)
                    } else if let Some(plt_ref) = facts.plt_ref(symbol) {
                        (self.layout.plt_address + plt.offset_of(plt_ref))
                            .wrapping_add(addend as u64)
                    } else {
                        // Left for the loader.
                        0
                    }
                } else {
                    facts.value(symbol).wrapping_add(addend as u64)
                }
            }
            RelocationKind::Relative => effective_value()?
                .wrapping_add(addend as u64)
                .wrapping_sub(place),
            RelocationKind::SymRelGotBase => facts
                .value(symbol)
                .wrapping_add(addend as u64)
                .wrapping_sub(got_base()),
            RelocationKind::GotRelGotBase => got_slot_address(GotSlotKind::Standard)?
                .wrapping_add(addend as u64)
                .wrapping_sub(got_base()),
            RelocationKind::GotRelative => got_slot_address(GotSlotKind::Standard)?
                .wrapping_add(addend as u64)
                .wrapping_sub(place),
            RelocationKind::PltRelative => effective_value()?
                .wrapping_add(addend as u64)
                .wrapping_sub(place),
            RelocationKind::PltRelGotBase => effective_value()?
                .wrapping_add(addend as u64)
                .wrapping_sub(got_base()),
            RelocationKind::TlsGd => got_slot_address(GotSlotKind::TlsPair)?
                .wrapping_add(addend as u64)
                .wrapping_sub(place),
            RelocationKind::TlsGdGotBase => got_slot_address(GotSlotKind::TlsPair)?
                .wrapping_add(addend as u64)
                .wrapping_sub(got_base()),
            RelocationKind::TlsLd => ld_slot_address()?
                .wrapping_add(addend as u64)
                .wrapping_sub(place),
            RelocationKind::TlsLdGotBase => ld_slot_address()?
                .wrapping_add(addend as u64)
                .wrapping_sub(got_base()),
            RelocationKind::DtpOff => {
                let tls = self.layout.tls_range()?;
                if output_kind.is_shared_object() {
                    facts
                        .value(symbol)
                        .wrapping_sub(tls.start)
                        .wrapping_add(addend as u64)
                } else {
                    facts
                        .value(symbol)
                        .wrapping_sub(tls.end)
                        .wrapping_add(addend as u64)
                }
            }
            RelocationKind::GotTpOff => got_slot_address(GotSlotKind::TlsOffset)?
                .wrapping_add(addend as u64)
                .wrapping_sub(place),
            RelocationKind::GotTpOffGot => {
                got_slot_address(GotSlotKind::TlsOffset)?.wrapping_add(addend as u64)
            }
            RelocationKind::GotTpOffGotBase => got_slot_address(GotSlotKind::TlsOffset)?
                .wrapping_add(addend as u64)
                .wrapping_sub(got_base()),
            RelocationKind::TpOff => {
                let tls = self.layout.tls_range()?;
                facts
                    .value(symbol)
                    .wrapping_sub(tls.end)
                    .wrapping_add(addend as u64)
            }
            RelocationKind::TpOffNegated => {
                let tls = self.layout.tls_range()?;
                tls.end
                    .wrapping_sub(facts.value(symbol))
                    .wrapping_add(addend as u64)
            }
            RelocationKind::TlsDesc => got_slot_address(GotSlotKind::TlsDesc)?
                .wrapping_add(addend as u64)
                .wrapping_sub(place),
            RelocationKind::TlsDescGotBase => got_slot_address(GotSlotKind::TlsDesc)?
                .wrapping_add(addend as u64)
                .wrapping_sub(got_base()),
            RelocationKind::TlsDescCall | RelocationKind::None => 0,
        };

        tracing::trace!(
            rel_type = %A::rel_type_to_string(r_type),
            ?rel_info.kind,
            value,
            symbol = %facts.symbol_debug(symbol),
            "relocation applied"
        );

        write_relocation_to_buffer(
            rel_info,
            value,
            &mut out[offset_in_section as usize..],
            || facts.symbol_debug(symbol),
        )?;

        Ok(next_modifier)
    }

    /// Emits the GOT contents.
    pub fn write_got(&self, out: &mut [u8]) -> Result {
        self.scan.got.write(
            &self.scan.facts,
            &self.scan.plt,
            self.layout,
            self.scan.args.output_kind(),
            out,
        )
    }

    /// Emits the PLT trampolines.
    pub fn write_plt(&self, out: &mut [u8]) -> Result {
        self.scan
            .plt
            .write(&self.scan.got, &self.scan.dynamic, self.layout, out)
    }

    /// Emits the dynamic relocation table: regular, then IRELATIVE, then TLSDESC.
    pub fn write_dynamic_relocations(&self, out: &mut [u8]) -> Result {
        self.scan
            .dynamic
            .write::<A>(&self.scan.facts, &self.scan.got, self.layout, out)
    }
}

/// Writes a computed relocation value into the output, checking that it fits the field. A value
/// out of range is a `RelocationOverflow` naming the symbol; the caller accumulates it and keeps
/// going.
pub(crate) fn write_relocation_to_buffer(
    rel_info: RelocationKindInfo,
    value: u64,
    output: &mut [u8],
    symbol_name: impl FnOnce() -> String,
) -> Result {
    let byte_size = rel_info.size.byte_size();
    if byte_size == 0 {
        return Ok(());
    }

    if rel_info.verify(value as i64).is_err() {
        return Err(Error::new(RelocationOverflow {
            symbol: symbol_name(),
            value: value as i64,
        }));
    }

    anyhow::ensure!(
        byte_size <= output.len(),
        "Relocation outside of bounds of section"
    );
    let value_bytes = value.to_le_bytes();
    output[..byte_size].copy_from_slice(&value_bytes[..byte_size]);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rivet_utils::elf::AllowedRange;

    #[test]
    fn signed_32_bit_overflow_boundary() {
        let info = RelocationKindInfo::new(RelocationKind::Relative, 4, AllowedRange::signed(32));
        let mut out = [0u8; 8];

        assert!(
            write_relocation_to_buffer(info, 0x7fff_ffff, &mut out, || "sym".to_owned()).is_ok()
        );
        assert_eq!(out[..4], [0xff, 0xff, 0xff, 0x7f]);

        let err = write_relocation_to_buffer(info, 0x8000_0000, &mut out, || "sym".to_owned())
            .unwrap_err();
        let overflow = err
            .downcast_ref::<RelocationOverflow>()
            .expect("should be a RelocationOverflow");
        assert_eq!(overflow.symbol, "sym");
    }

    #[test]
    fn negative_values_are_written_two_complement() {
        let info = RelocationKindInfo::new(RelocationKind::Relative, 4, AllowedRange::signed(32));
        let mut out = [0u8; 4];
        write_relocation_to_buffer(info, (-8i64) as u64, &mut out, || "sym".to_owned()).unwrap();
        assert_eq!(out, [0xf8, 0xff, 0xff, 0xff]);
    }
}
