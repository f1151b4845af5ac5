//! x86-64 backend: relocation classification tables, trampoline formats, and the selection logic
//! for instruction rewrites. Some rewrites are optional size/speed improvements; the TLS ones are
//! mandatory because the scan pass commits to the downgraded access model when it skips the GOT
//! allocation.

use crate::arch::Arch;
use crate::arch::PltField;
use crate::arch::PltFormat;
use crate::arch::PltPatch;
use crate::arch::PltTemplate;
use crate::arch::expected_tls_optimization;
use crate::args::Args;
use crate::args::OutputKind;
use crate::args::PltVariant;
use crate::symbol_facts::ValueFlags;
use rivet_utils::elf::DynamicRelocationKind;
use rivet_utils::elf::RelocationKindInfo;
use rivet_utils::elf::SectionFlags;
use rivet_utils::elf::shf;
use rivet_utils::elf::x86_64_is_dynamic_only;
use rivet_utils::elf::x86_64_rel_type_to_string;
use rivet_utils::relaxation::RelocationModifier;
use rivet_utils::tls::TlsOptimization;
use rivet_utils::x86_64::RelaxationKind;

pub struct X86_64;

/// The AMD64 psABI resolver stub: push the link map, jump to the resolver, both through the
/// reserved `.got.plt` header words.
const RESOLVER_TEMPLATE: &[u8] = &[
    0xff, 0x35, 0, 0, 0, 0, // push *{GOT+8}(%rip)
    0xff, 0x25, 0, 0, 0, 0, // jmp *{GOT+16}(%rip)
    0x90, 0x90, 0x90, 0x90, // nop (x4)
];

const RESOLVER_PATCHES: &[PltPatch] = &[
    PltPatch {
        offset: 2,
        field: PltField::GotBasePlusRel { add: 8, insn_end: 6 },
    },
    PltPatch {
        offset: 8,
        field: PltField::GotBasePlusRel { add: 16, insn_end: 12 },
    },
];

const ENTRY_TEMPLATE: &[u8] = &[
    0xff, 0x25, 0, 0, 0, 0, // jmp *{GOT slot}(%rip)
    0x68, 0, 0, 0, 0, // push ${relocation index}
    0xe9, 0, 0, 0, 0, // jmp {PLT start}
];

const ENTRY_PATCHES: &[PltPatch] = &[
    PltPatch {
        offset: 2,
        field: PltField::GotSlotRel { insn_end: 6 },
    },
    PltPatch {
        offset: 7,
        field: PltField::RelocIndex,
    },
    PltPatch {
        offset: 12,
        field: PltField::PltStartDisp,
    },
];

const TLSDESC_TEMPLATE: &[u8] = &[
    0xff, 0x35, 0, 0, 0, 0, // push *{GOT+8}(%rip)
    0xff, 0x25, 0, 0, 0, 0, // jmp *{reserved TLSDESC slot}(%rip)
    0x0f, 0x1f, 0x40, 0x00, // nop
];

const TLSDESC_PATCHES: &[PltPatch] = &[
    PltPatch {
        offset: 2,
        field: PltField::GotBasePlusRel { add: 8, insn_end: 6 },
    },
    PltPatch {
        offset: 8,
        field: PltField::TlsDescGotRel { insn_end: 12 },
    },
];

static STANDARD_PLT: PltFormat = PltFormat {
    entry_size: 16,
    resolver: PltTemplate {
        bytes: RESOLVER_TEMPLATE,
        patches: RESOLVER_PATCHES,
    },
    entry: PltTemplate {
        bytes: ENTRY_TEMPLATE,
        patches: ENTRY_PATCHES,
    },
    tlsdesc: Some(PltTemplate {
        bytes: TLSDESC_TEMPLATE,
        patches: TLSDESC_PATCHES,
    }),
    lazy_resume_offset: 6,
    reloc_entry_size: crate::dynamic_reloc::RELA_ENTRY_SIZE,
};

/// The hardened layout pads every entry to 64 bytes and starts it with a landing pad, so that
/// indirect-branch tracking accepts jumps into the table.
const HARDENED_RESOLVER_TEMPLATE: &[u8] = &[
    0xf3, 0x0f, 0x1e, 0xfa, // endbr64
    0xff, 0x35, 0, 0, 0, 0, // push *{GOT+8}(%rip)
    0xf2, 0xff, 0x25, 0, 0, 0, 0, // bnd jmp *{GOT+16}(%rip)
    0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90,
    0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90,
    0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90,
    0x90, 0x90,
];

const HARDENED_RESOLVER_PATCHES: &[PltPatch] = &[
    PltPatch {
        offset: 6,
        field: PltField::GotBasePlusRel { add: 8, insn_end: 10 },
    },
    PltPatch {
        offset: 13,
        field: PltField::GotBasePlusRel { add: 16, insn_end: 17 },
    },
];

const HARDENED_ENTRY_TEMPLATE: &[u8] = &[
    0xf3, 0x0f, 0x1e, 0xfa, // endbr64
    0xf2, 0xff, 0x25, 0, 0, 0, 0, // bnd jmp *{GOT slot}(%rip)
    0x68, 0, 0, 0, 0, // push ${relocation index}
    0xf2, 0xe9, 0, 0, 0, 0, // bnd jmp {PLT start}
    0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90,
    0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90,
    0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90,
];

const HARDENED_ENTRY_PATCHES: &[PltPatch] = &[
    PltPatch {
        offset: 7,
        field: PltField::GotSlotRel { insn_end: 11 },
    },
    PltPatch {
        offset: 12,
        field: PltField::RelocIndex,
    },
    PltPatch {
        offset: 18,
        field: PltField::PltStartDisp,
    },
];

const HARDENED_TLSDESC_TEMPLATE: &[u8] = &[
    0xf3, 0x0f, 0x1e, 0xfa, // endbr64
    0xff, 0x35, 0, 0, 0, 0, // push *{GOT+8}(%rip)
    0xff, 0x25, 0, 0, 0, 0, // jmp *{reserved TLSDESC slot}(%rip)
    0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90,
    0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90,
    0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90,
    0x90, 0x90, 0x90,
];

const HARDENED_TLSDESC_PATCHES: &[PltPatch] = &[
    PltPatch {
        offset: 6,
        field: PltField::GotBasePlusRel { add: 8, insn_end: 10 },
    },
    PltPatch {
        offset: 12,
        field: PltField::TlsDescGotRel { insn_end: 16 },
    },
];

static HARDENED_PLT: PltFormat = PltFormat {
    entry_size: 64,
    resolver: PltTemplate {
        bytes: HARDENED_RESOLVER_TEMPLATE,
        patches: HARDENED_RESOLVER_PATCHES,
    },
    entry: PltTemplate {
        bytes: HARDENED_ENTRY_TEMPLATE,
        patches: HARDENED_ENTRY_PATCHES,
    },
    tlsdesc: Some(PltTemplate {
        bytes: HARDENED_TLSDESC_TEMPLATE,
        patches: HARDENED_TLSDESC_PATCHES,
    }),
    lazy_resume_offset: 11,
    reloc_entry_size: crate::dynamic_reloc::RELA_ENTRY_SIZE,
};

const _ASSERTS: () = {
    assert!(RESOLVER_TEMPLATE.len() as u64 == STANDARD_PLT.entry_size);
    assert!(ENTRY_TEMPLATE.len() as u64 == STANDARD_PLT.entry_size);
    assert!(TLSDESC_TEMPLATE.len() as u64 == STANDARD_PLT.entry_size);
    assert!(HARDENED_RESOLVER_TEMPLATE.len() as u64 == HARDENED_PLT.entry_size);
    assert!(HARDENED_ENTRY_TEMPLATE.len() as u64 == HARDENED_PLT.entry_size);
    assert!(HARDENED_TLSDESC_TEMPLATE.len() as u64 == HARDENED_PLT.entry_size);
};

impl Arch for X86_64 {
    type Relaxation = Relaxation;

    fn elf_header_arch_magic() -> u16 {
        object::elf::EM_X86_64
    }

    #[inline(always)]
    fn relocation_from_raw(r_type: u32) -> Option<RelocationKindInfo> {
        rivet_utils::x86_64::relocation_from_raw(r_type)
    }

    fn is_dynamic_only(r_type: u32) -> bool {
        x86_64_is_dynamic_only(r_type)
    }

    fn dynamic_relocation_type(kind: DynamicRelocationKind) -> u32 {
        kind.x86_64_r_type()
    }

    fn rel_type_to_string(r_type: u32) -> std::borrow::Cow<'static, str> {
        x86_64_rel_type_to_string(r_type)
    }

    fn got_entry_size() -> u64 {
        8
    }

    fn uses_rela() -> bool {
        true
    }

    fn plt_format(args: &Args) -> &'static PltFormat {
        match args.plt_variant {
            PltVariant::Standard => &STANDARD_PLT,
            PltVariant::Hardened => &HARDENED_PLT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Relaxation {
    kind: RelaxationKind,
    rel_info: RelocationKindInfo,
    mandatory: bool,
}

impl crate::arch::Relaxation for Relaxation {
    #[inline(always)]
    fn new(
        relocation_kind: u32,
        section_bytes: &[u8],
        offset_in_section: u64,
        value_flags: ValueFlags,
        output_kind: OutputKind,
        section_flags: SectionFlags,
    ) -> Option<Self> {
        #[allow(clippy::unnecessary_wraps)]
        fn create(kind: RelaxationKind, new_r_type: u32, mandatory: bool) -> Option<Relaxation> {
            // This only fails for relocation types we don't support, and relaxing to an
            // unsupported type would be a bug.
            let rel_info = rivet_utils::x86_64::relocation_from_raw(new_r_type).unwrap();
            Some(Relaxation {
                kind,
                rel_info,
                mandatory,
            })
        }

        let is_absolute = value_flags.is_absolute() && !value_flags.is_dynamic();
        let is_absolute_address = value_flags.is_address() && !output_kind.is_relocatable();
        let can_bypass_got = value_flags.can_bypass_got();
        let tls_opt = |info: RelocationKindInfo| {
            expected_tls_optimization(info.kind, value_flags, output_kind)
        };

        // Ifuncs cannot be referenced directly; they always need to go via the PLT, even in a
        // static executable. A plain PC32 to an ifunc is therefore rewritten the opposite way,
        // into a PLT reference.
        if value_flags.is_ifunc() {
            return match relocation_kind {
                object::elf::R_X86_64_PC32 => {
                    create(RelaxationKind::NoOp, object::elf::R_X86_64_PLT32, true)
                }
                _ => None,
            };
        }

        // All rewrites below modify instructions, so only executable sections qualify.
        if !section_flags.contains(shf::EXECINSTR) {
            return None;
        }

        let offset = offset_in_section as usize;
        match relocation_kind {
            object::elf::R_X86_64_REX_GOTPCRELX => {
                if offset < 3 {
                    return None;
                }
                let b1 = section_bytes[offset - 2];
                let rex = section_bytes[offset - 3];

                // REX prefixed instruction with W=1, R=0/1, X=0, B=0
                if rex != 0x48 && rex != 0x4c {
                    return None;
                }

                if is_absolute || is_absolute_address {
                    match b1 {
                        // mov *x(%rip), reg
                        0x8b => {
                            return create(
                                RelaxationKind::RexMovIndirectToAbsolute,
                                object::elf::R_X86_64_32,
                                false,
                            );
                        }
                        // sub *x(%rip), reg
                        0x2b => {
                            return create(
                                RelaxationKind::RexSubIndirectToAbsolute,
                                object::elf::R_X86_64_32,
                                false,
                            );
                        }
                        // cmp *x(%rip), reg
                        0x3b => {
                            return create(
                                RelaxationKind::RexCmpIndirectToAbsolute,
                                object::elf::R_X86_64_32,
                                false,
                            );
                        }
                        _ => return None,
                    }
                } else if can_bypass_got {
                    match b1 {
                        // mov *x(%rip), reg
                        0x8b => {
                            return create(
                                RelaxationKind::MovIndirectToLea,
                                object::elf::R_X86_64_PC32,
                                false,
                            );
                        }
                        _ => return None,
                    }
                }
                None
            }
            object::elf::R_X86_64_GOTPCRELX => {
                if offset < 2 {
                    return None;
                }
                if section_bytes[offset - 2] == 0x8b {
                    // mov *x(%rip), reg
                    if is_absolute || is_absolute_address {
                        return create(
                            RelaxationKind::MovIndirectToAbsolute,
                            object::elf::R_X86_64_32,
                            false,
                        );
                    } else if can_bypass_got {
                        return create(
                            RelaxationKind::MovIndirectToLea,
                            object::elf::R_X86_64_PC32,
                            false,
                        );
                    }
                }
                if can_bypass_got {
                    match section_bytes.get(offset - 2..offset)? {
                        // call *x(%rip)
                        [0xff, 0x15] => {
                            return create(
                                RelaxationKind::CallIndirectToRelative,
                                object::elf::R_X86_64_PC32,
                                false,
                            );
                        }
                        // jmp *x(%rip)
                        [0xff, 0x25] => {
                            return create(
                                RelaxationKind::JmpIndirectToRelative,
                                object::elf::R_X86_64_PC32,
                                false,
                            );
                        }
                        _ => return None,
                    }
                }
                None
            }
            object::elf::R_X86_64_GOTPCREL if can_bypass_got && offset >= 2 => {
                match section_bytes[offset - 2] {
                    // mov *x(%rip), reg
                    0x8b => create(
                        RelaxationKind::MovIndirectToLea,
                        object::elf::R_X86_64_PC32,
                        false,
                    ),
                    _ => None,
                }
            }
            object::elf::R_X86_64_PLT32 if can_bypass_got => {
                create(RelaxationKind::NoOp, object::elf::R_X86_64_PC32, false)
            }
            object::elf::R_X86_64_PLTOFF64 if can_bypass_got => {
                create(RelaxationKind::NoOp, object::elf::R_X86_64_GOTOFF64, false)
            }
            object::elf::R_X86_64_GOTTPOFF => {
                let info = Self::arch_info(relocation_kind)?;
                if tls_opt(info) != TlsOptimization::ToLocalExec {
                    return None;
                }
                match section_bytes.get(offset.checked_sub(3)?..offset - 1)? {
                    // mov *x(%rip), reg
                    [0x48 | 0x4c, 0x8b] => create(
                        RelaxationKind::RexMovIndirectToAbsolute,
                        object::elf::R_X86_64_TPOFF32,
                        true,
                    ),
                    // add *x(%rip), reg
                    [0x48 | 0x4c, 0x03] => create(
                        RelaxationKind::RexAddIndirectToAbsolute,
                        object::elf::R_X86_64_TPOFF32,
                        true,
                    ),
                    _ => None,
                }
            }
            object::elf::R_X86_64_TLSGD => {
                let info = Self::arch_info(relocation_kind)?;
                match tls_opt(info) {
                    TlsOptimization::ToLocalExec => {
                        TlsGdForm::identify(section_bytes, offset)?;
                        create(
                            RelaxationKind::TlsGdToLocalExec,
                            object::elf::R_X86_64_TPOFF32,
                            true,
                        )
                    }
                    TlsOptimization::ToInitialExec => {
                        TlsGdForm::identify(section_bytes, offset)?;
                        create(
                            RelaxationKind::TlsGdToInitialExec,
                            object::elf::R_X86_64_GOTTPOFF,
                            true,
                        )
                    }
                    TlsOptimization::None => None,
                }
            }
            object::elf::R_X86_64_TLSLD => {
                let info = Self::arch_info(relocation_kind)?;
                if tls_opt(info) != TlsOptimization::ToLocalExec {
                    return None;
                }
                // lea 0x0(%rip),%rdi followed by the call the rewrite consumes
                if section_bytes.get(offset.checked_sub(3)?..offset)? == [0x48, 0x8d, 0x3d]
                    && section_bytes.len() >= offset + 9
                {
                    return create(
                        RelaxationKind::TlsLdToLocalExec,
                        object::elf::R_X86_64_NONE,
                        true,
                    );
                }
                None
            }
            object::elf::R_X86_64_GOTPC32_TLSDESC => {
                let info = Self::arch_info(relocation_kind)?;
                let opt = tls_opt(info);
                if opt == TlsOptimization::None {
                    return None;
                }
                // lea x@tlsdesc(%rip),%rax
                if section_bytes.get(offset.checked_sub(3)?..offset)? != [0x48, 0x8d, 0x05] {
                    return None;
                }
                match opt {
                    TlsOptimization::ToLocalExec => create(
                        RelaxationKind::TlsDescToLocalExec,
                        object::elf::R_X86_64_TPOFF32,
                        true,
                    ),
                    TlsOptimization::ToInitialExec => create(
                        RelaxationKind::TlsDescToInitialExec,
                        object::elf::R_X86_64_GOTTPOFF,
                        true,
                    ),
                    TlsOptimization::None => unreachable!(),
                }
            }
            object::elf::R_X86_64_TLSDESC_CALL => {
                let info = Self::arch_info(relocation_kind)?;
                if tls_opt(info) == TlsOptimization::None {
                    return None;
                }
                create(RelaxationKind::SkipTlsDescCall, object::elf::R_X86_64_NONE, true)
            }
            _ => None,
        }
    }

    fn apply(&self, section_bytes: &mut [u8], offset_in_section: &mut u64, addend: &mut i64) {
        self.kind.apply(section_bytes, offset_in_section, addend);
    }

    fn rel_info(&self) -> RelocationKindInfo {
        self.rel_info
    }

    fn is_mandatory(&self) -> bool {
        self.mandatory
    }

    fn debug_kind(&self) -> impl std::fmt::Debug {
        &self.kind
    }

    fn next_modifier(&self) -> RelocationModifier {
        self.kind.next_modifier()
    }
}

impl Relaxation {
    fn arch_info(r_type: u32) -> Option<RelocationKindInfo> {
        rivet_utils::x86_64::relocation_from_raw(r_type)
    }
}

enum TlsGdForm {
    Regular,
}

impl TlsGdForm {
    fn identify(bytes: &[u8], offset: usize) -> Option<Self> {
        // data16 lea x(%rip),%rdi
        // data16 data16 rex.W call {__tls_get_addr}
        if bytes.get(offset.checked_sub(4)?..offset) == Some(&[0x66, 0x48, 0x8d, 0x3d])
            && bytes.get(offset + 4..offset + 8) == Some(&[0x66, 0x66, 0x48, 0xe8])
        {
            return Some(Self::Regular);
        }
        None
    }
}
