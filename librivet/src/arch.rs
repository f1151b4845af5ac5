//! Abstraction over the supported CPU architectures. Everything the generic engine needs from a
//! target lives behind the `Arch` trait: relocation classification, dynamic relocation numbering,
//! pointer width, trampoline formats and the instruction-rewrite rules.

use crate::args::Args;
use crate::args::OutputKind;
use crate::error::Result;
use crate::symbol_facts::ValueFlags;
use anyhow::bail;
use rivet_utils::elf::DynamicRelocationKind;
use rivet_utils::elf::RelocationKindInfo;
use rivet_utils::elf::SectionFlags;
use rivet_utils::relaxation::RelocationModifier;
use std::borrow::Cow;

pub trait Arch {
    type Relaxation: Relaxation;

    /// ELF header machine value for the architecture.
    fn elf_header_arch_magic() -> u16;

    /// Classifies a raw relocation type. `None` means the type is not supported by this backend.
    fn relocation_from_raw(r_type: u32) -> Option<RelocationKindInfo>;

    /// Whether the relocation type is one only the dynamic loader should produce.
    fn is_dynamic_only(r_type: u32) -> bool;

    /// Whether the relocation type belongs to the Sun TLS convention. Only i386 has one; it is
    /// recognised solely so that mixing it with the GNU convention can be diagnosed.
    fn is_sun_tls(_r_type: u32) -> bool {
        false
    }

    /// Architecture-specific numbering of a dynamic relocation.
    fn dynamic_relocation_type(kind: DynamicRelocationKind) -> u32;

    fn rel_type_to_string(r_type: u32) -> Cow<'static, str>;

    /// GOT slots are pointer-sized.
    fn got_entry_size() -> u64;

    /// Whether dynamic relocations carry explicit addends (RELA) or fold them into the relocated
    /// field (REL).
    fn uses_rela() -> bool;

    fn plt_format(args: &Args) -> &'static PltFormat;
}

pub trait Relaxation {
    /// Tries to create a relaxation for the relocation of the specified kind, to be applied at
    /// the specified offset in the supplied section. The decision is a pure function of its
    /// arguments: the scan pass and the apply pass both call this and must reach the same
    /// conclusion.
    fn new(
        relocation_kind: u32,
        section_bytes: &[u8],
        offset_in_section: u64,
        value_flags: ValueFlags,
        output_kind: OutputKind,
        section_flags: SectionFlags,
    ) -> Option<Self>
    where
        Self: std::marker::Sized;

    fn apply(&self, section_bytes: &mut [u8], offset_in_section: &mut u64, addend: &mut i64);

    /// The relocation that remains to be applied after the rewrite.
    fn rel_info(&self) -> RelocationKindInfo;

    /// Whether this rewrite must happen even when optimisations are disabled. True for the TLS
    /// model downgrades, whose allocation decisions the scan pass has already committed to.
    fn is_mandatory(&self) -> bool;

    fn debug_kind(&self) -> impl std::fmt::Debug;

    fn next_modifier(&self) -> RelocationModifier;
}

/// Whether the symbol's address is resolved at link time, for the purposes of TLS model
/// selection. An undefined symbol referenced from an executable is treated as final for
/// Initial-Exec only: the loader guarantees static TLS storage for it. The asymmetry (no such
/// widening for general-dynamic) is deliberate.
pub(crate) fn tls_is_final(
    model: rivet_utils::tls::TlsModel,
    value_flags: ValueFlags,
    output_kind: OutputKind,
) -> bool {
    value_flags.is_final()
        || (model == rivet_utils::tls::TlsModel::InitialExec
            && value_flags.is_undefined()
            && output_kind.is_executable())
}

/// The downgrade decision for one TLS relocation site. Pure: the scan pass and the apply pass
/// call this with identical inputs and must get identical answers.
pub(crate) fn expected_tls_optimization(
    kind: rivet_utils::elf::RelocationKind,
    value_flags: ValueFlags,
    output_kind: OutputKind,
) -> rivet_utils::tls::TlsOptimization {
    let Some(model) = rivet_utils::tls::model_for_relocation(kind) else {
        return rivet_utils::tls::TlsOptimization::None;
    };
    rivet_utils::tls::optimize(
        model,
        tls_is_final(model, value_flags, output_kind),
        output_kind.is_shared_object(),
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    X86_64,
    I386,
}

impl TryFrom<u16> for Architecture {
    type Error = anyhow::Error;

    fn try_from(arch: u16) -> Result<Self, Self::Error> {
        match arch {
            object::elf::EM_X86_64 => Ok(Self::X86_64),
            object::elf::EM_386 => Ok(Self::I386),
            _ => bail!("Unsupported architecture: 0x{:x}", arch),
        }
    }
}

/// A value patched into a trampoline template. All patched fields are 32-bit little-endian.
#[derive(Debug, Clone, Copy)]
pub enum PltField {
    /// GOT base address plus a constant, PC-relative to the instruction ending at `insn_end`
    /// within the entry.
    GotBasePlusRel { add: u64, insn_end: usize },

    /// GOT base address plus a constant, absolute.
    GotBasePlusAbs { add: u64 },

    /// The entry's own GOT slot, PC-relative to `insn_end`.
    GotSlotRel { insn_end: usize },

    /// The entry's own GOT slot, absolute.
    GotSlotAbs,

    /// The entry's own GOT slot as an offset from the GOT base (the `%ebx`-relative form).
    GotSlotGotBase,

    /// Index of the entry's relocation in the dynamic relocation table.
    RelocIndex,

    /// Byte offset of the entry's relocation record (i386 convention).
    RelocOffset,

    /// Displacement back to the start of the PLT, relative to the end of the field.
    PltStartDisp,

    /// The reserved TLS-descriptor GOT slot, PC-relative to `insn_end`.
    TlsDescGotRel { insn_end: usize },

    /// The reserved TLS-descriptor GOT slot, absolute.
    TlsDescGotAbs,

    /// The reserved TLS-descriptor GOT slot as an offset from the GOT base.
    TlsDescGotGotBase,
}

#[derive(Debug, Clone, Copy)]
pub struct PltPatch {
    pub offset: usize,
    pub field: PltField,
}

/// A trampoline template: fixed bytes plus the table of fields patched at emission time.
#[derive(Debug, Clone, Copy)]
pub struct PltTemplate {
    pub bytes: &'static [u8],
    pub patches: &'static [PltPatch],
}

/// The complete trampoline layout for one architecture variant.
#[derive(Debug, Clone, Copy)]
pub struct PltFormat {
    pub entry_size: u64,

    /// The reserved first entry that calls the lazy resolver.
    pub resolver: PltTemplate,

    /// A regular entry.
    pub entry: PltTemplate,

    /// The reserved TLS-descriptor resolver entry, where the variant supports one.
    pub tlsdesc: Option<PltTemplate>,

    /// Offset into a regular entry at which lazy resolution resumes. Jump slots are initialized
    /// to the entry's address plus this.
    pub lazy_resume_offset: u64,

    /// Size of one dynamic relocation record, used by `PltField::RelocOffset`.
    pub reloc_entry_size: u64,
}

/// Everything a template fill needs to know about the entry being emitted.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct PltPatchContext {
    pub(crate) got_base_address: u64,
    pub(crate) plt_address: u64,

    /// This entry's offset within the PLT.
    pub(crate) entry_offset: u64,

    pub(crate) got_slot_address: u64,
    pub(crate) reloc_index: u64,
    pub(crate) tlsdesc_got_address: u64,
}

impl PltTemplate {
    pub(crate) fn fill(
        &self,
        ctx: &PltPatchContext,
        reloc_entry_size: u64,
        out: &mut [u8],
    ) -> Result {
        out.copy_from_slice(self.bytes);
        for patch in self.patches {
            let place = |insn_end: usize| ctx.plt_address + ctx.entry_offset + insn_end as u64;
            let value: i64 = match patch.field {
                PltField::GotBasePlusRel { add, insn_end } => {
                    (ctx.got_base_address + add).wrapping_sub(place(insn_end)) as i64
                }
                PltField::GotBasePlusAbs { add } => (ctx.got_base_address + add) as i64,
                PltField::GotSlotRel { insn_end } => {
                    ctx.got_slot_address.wrapping_sub(place(insn_end)) as i64
                }
                PltField::GotSlotAbs => ctx.got_slot_address as i64,
                PltField::GotSlotGotBase => {
                    ctx.got_slot_address.wrapping_sub(ctx.got_base_address) as i64
                }
                PltField::RelocIndex => ctx.reloc_index as i64,
                PltField::RelocOffset => (ctx.reloc_index * reloc_entry_size) as i64,
                PltField::PltStartDisp => -((ctx.entry_offset + patch.offset as u64 + 4) as i64),
                PltField::TlsDescGotRel { insn_end } => {
                    ctx.tlsdesc_got_address.wrapping_sub(place(insn_end)) as i64
                }
                PltField::TlsDescGotAbs => ctx.tlsdesc_got_address as i64,
                PltField::TlsDescGotGotBase => {
                    ctx.tlsdesc_got_address.wrapping_sub(ctx.got_base_address) as i64
                }
            };
            // Relative fields are signed, absolute ones unsigned; accept the union of the two
            // 32-bit ranges and write the common two's-complement bytes.
            if value < i64::from(i32::MIN) || value > i64::from(u32::MAX) {
                bail!(
                    "PLT is more than 2GiB away from GOT (entry at {:#x})",
                    ctx.plt_address + ctx.entry_offset
                );
            }
            out[patch.offset..patch.offset + 4].copy_from_slice(&(value as u32).to_le_bytes());
        }
        Ok(())
    }
}
