//! i386 backend. Structurally the mirror of the x86-64 backend, with the 32-bit differences:
//! 4-byte GOT slots, REL-format dynamic relocations, `%ebx`-relative trampolines for relocatable
//! output, and the i386 flavours of the TLS rewrite sequences.

use crate::arch::Arch;
use crate::arch::PltField;
use crate::arch::PltFormat;
use crate::arch::PltPatch;
use crate::arch::PltTemplate;
use crate::arch::expected_tls_optimization;
use crate::args::Args;
use crate::args::OutputKind;
use crate::symbol_facts::ValueFlags;
use rivet_utils::elf::DynamicRelocationKind;
use rivet_utils::elf::RelocationKindInfo;
use rivet_utils::elf::SectionFlags;
use rivet_utils::elf::i386_is_dynamic_only;
use rivet_utils::elf::i386_rel_type_to_string;
use rivet_utils::elf::shf;
use rivet_utils::i386::RelaxationKind;
use rivet_utils::relaxation::RelocationModifier;
use rivet_utils::tls::TlsOptimization;

pub struct I386;

const EXEC_RESOLVER_TEMPLATE: &[u8] = &[
    0xff, 0x35, 0, 0, 0, 0, // pushl {GOT+4}
    0xff, 0x25, 0, 0, 0, 0, // jmp *{GOT+8}
    0, 0, 0, 0, // unused
];

const EXEC_RESOLVER_PATCHES: &[PltPatch] = &[
    PltPatch {
        offset: 2,
        field: PltField::GotBasePlusAbs { add: 4 },
    },
    PltPatch {
        offset: 8,
        field: PltField::GotBasePlusAbs { add: 8 },
    },
];

const EXEC_ENTRY_TEMPLATE: &[u8] = &[
    0xff, 0x25, 0, 0, 0, 0, // jmp *{GOT slot}
    0x68, 0, 0, 0, 0, // pushl ${relocation offset}
    0xe9, 0, 0, 0, 0, // jmp {PLT start}
];

const EXEC_ENTRY_PATCHES: &[PltPatch] = &[
    PltPatch {
        offset: 2,
        field: PltField::GotSlotAbs,
    },
    PltPatch {
        offset: 7,
        field: PltField::RelocOffset,
    },
    PltPatch {
        offset: 12,
        field: PltField::PltStartDisp,
    },
];

const EXEC_TLSDESC_TEMPLATE: &[u8] = &[
    0xff, 0x35, 0, 0, 0, 0, // pushl {GOT+4}
    0xff, 0x25, 0, 0, 0, 0, // jmp *{reserved TLSDESC slot}
    0x0f, 0x1f, 0x40, 0x00, // nop
];

const EXEC_TLSDESC_PATCHES: &[PltPatch] = &[
    PltPatch {
        offset: 2,
        field: PltField::GotBasePlusAbs { add: 4 },
    },
    PltPatch {
        offset: 8,
        field: PltField::TlsDescGotAbs,
    },
];

static EXEC_PLT: PltFormat = PltFormat {
    entry_size: 16,
    resolver: PltTemplate {
        bytes: EXEC_RESOLVER_TEMPLATE,
        patches: EXEC_RESOLVER_PATCHES,
    },
    entry: PltTemplate {
        bytes: EXEC_ENTRY_TEMPLATE,
        patches: EXEC_ENTRY_PATCHES,
    },
    tlsdesc: Some(PltTemplate {
        bytes: EXEC_TLSDESC_TEMPLATE,
        patches: EXEC_TLSDESC_PATCHES,
    }),
    lazy_resume_offset: 6,
    reloc_entry_size: crate::dynamic_reloc::REL_ENTRY_SIZE,
};

/// Relocatable output addresses everything through `%ebx`, which the ABI requires to hold the
/// GOT base at the point of a PLT call, so no patches are needed in the resolver stub at all.
const PIC_RESOLVER_TEMPLATE: &[u8] = &[
    0xff, 0xb3, 0x04, 0, 0, 0, // pushl 4(%ebx)
    0xff, 0xa3, 0x08, 0, 0, 0, // jmp *8(%ebx)
    0, 0, 0, 0, // unused
];

const PIC_ENTRY_TEMPLATE: &[u8] = &[
    0xff, 0xa3, 0, 0, 0, 0, // jmp *{GOT slot offset}(%ebx)
    0x68, 0, 0, 0, 0, // pushl ${relocation offset}
    0xe9, 0, 0, 0, 0, // jmp {PLT start}
];

const PIC_ENTRY_PATCHES: &[PltPatch] = &[
    PltPatch {
        offset: 2,
        field: PltField::GotSlotGotBase,
    },
    PltPatch {
        offset: 7,
        field: PltField::RelocOffset,
    },
    PltPatch {
        offset: 12,
        field: PltField::PltStartDisp,
    },
];

const PIC_TLSDESC_TEMPLATE: &[u8] = &[
    0xff, 0xb3, 0x04, 0, 0, 0, // pushl 4(%ebx)
    0xff, 0xa3, 0, 0, 0, 0, // jmp *{reserved TLSDESC slot offset}(%ebx)
    0x0f, 0x1f, 0x40, 0x00, // nop
];

const PIC_TLSDESC_PATCHES: &[PltPatch] = &[PltPatch {
    offset: 8,
    field: PltField::TlsDescGotGotBase,
}];

static PIC_PLT: PltFormat = PltFormat {
    entry_size: 16,
    resolver: PltTemplate {
        bytes: PIC_RESOLVER_TEMPLATE,
        patches: &[],
    },
    entry: PltTemplate {
        bytes: PIC_ENTRY_TEMPLATE,
        patches: PIC_ENTRY_PATCHES,
    },
    tlsdesc: Some(PltTemplate {
        bytes: PIC_TLSDESC_TEMPLATE,
        patches: PIC_TLSDESC_PATCHES,
    }),
    lazy_resume_offset: 6,
    reloc_entry_size: crate::dynamic_reloc::REL_ENTRY_SIZE,
};

const _ASSERTS: () = {
    assert!(EXEC_RESOLVER_TEMPLATE.len() as u64 == EXEC_PLT.entry_size);
    assert!(EXEC_ENTRY_TEMPLATE.len() as u64 == EXEC_PLT.entry_size);
    assert!(EXEC_TLSDESC_TEMPLATE.len() as u64 == EXEC_PLT.entry_size);
    assert!(PIC_RESOLVER_TEMPLATE.len() as u64 == PIC_PLT.entry_size);
    assert!(PIC_ENTRY_TEMPLATE.len() as u64 == PIC_PLT.entry_size);
    assert!(PIC_TLSDESC_TEMPLATE.len() as u64 == PIC_PLT.entry_size);
};

impl Arch for I386 {
    type Relaxation = Relaxation;

    fn elf_header_arch_magic() -> u16 {
        object::elf::EM_386
    }

    #[inline(always)]
    fn relocation_from_raw(r_type: u32) -> Option<RelocationKindInfo> {
        rivet_utils::i386::relocation_from_raw(r_type)
    }

    fn is_dynamic_only(r_type: u32) -> bool {
        i386_is_dynamic_only(r_type)
    }

    fn is_sun_tls(r_type: u32) -> bool {
        rivet_utils::i386::is_sun_tls(r_type)
    }

    fn dynamic_relocation_type(kind: DynamicRelocationKind) -> u32 {
        kind.i386_r_type()
    }

    fn rel_type_to_string(r_type: u32) -> std::borrow::Cow<'static, str> {
        i386_rel_type_to_string(r_type)
    }

    fn got_entry_size() -> u64 {
        4
    }

    fn uses_rela() -> bool {
        false
    }

    fn plt_format(args: &Args) -> &'static PltFormat {
        // The hardened x86-64 layout has no i386 counterpart; the choice here is between the
        // absolute form for fixed-address output and the %ebx-relative form for everything else.
        if args.output_kind.is_relocatable() {
            &PIC_PLT
        } else {
            &EXEC_PLT
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
            let rel_info = rivet_utils::i386::relocation_from_raw(new_r_type).unwrap();
            Some(Relaxation {
                kind,
                rel_info,
                mandatory,
            })
        }

        let can_bypass_got = value_flags.can_bypass_got();
        let tls_opt = |r_type: u32| {
            let info = rivet_utils::i386::relocation_from_raw(r_type)?;
            Some(expected_tls_optimization(info.kind, value_flags, output_kind))
        };

        if value_flags.is_ifunc() {
            return match relocation_kind {
                object::elf::R_386_PC32 => {
                    create(RelaxationKind::NoOp, object::elf::R_386_PLT32, true)
                }
                _ => None,
            };
        }

        if !section_flags.contains(shf::EXECINSTR) {
            return None;
        }

        let offset = offset_in_section as usize;
        match relocation_kind {
            object::elf::R_386_PLT32 if can_bypass_got => {
                create(RelaxationKind::NoOp, object::elf::R_386_PC32, false)
            }
            object::elf::R_386_TLS_GD => {
                let opt = tls_opt(relocation_kind)?;
                if opt == TlsOptimization::None {
                    return None;
                }
                let form = TlsGdForm::identify(section_bytes, offset)?;
                match (opt, form) {
                    (TlsOptimization::ToLocalExec, TlsGdForm::Scaled) => create(
                        RelaxationKind::TlsGdToLocalExecScaled,
                        object::elf::R_386_TLS_LE_32,
                        true,
                    ),
                    (TlsOptimization::ToLocalExec, TlsGdForm::Plain) => create(
                        RelaxationKind::TlsGdToLocalExec,
                        object::elf::R_386_TLS_LE_32,
                        true,
                    ),
                    (TlsOptimization::ToLocalExec, TlsGdForm::PlainSized) => create(
                        RelaxationKind::TlsGdToLocalExecSized,
                        object::elf::R_386_TLS_LE_32,
                        true,
                    ),
                    (TlsOptimization::ToInitialExec, TlsGdForm::Scaled) => create(
                        RelaxationKind::TlsGdToInitialExecScaled,
                        object::elf::R_386_TLS_GOTIE,
                        true,
                    ),
                    (TlsOptimization::ToInitialExec, _) => {
                        // The initial-exec replacement is a byte longer than the plain form's
                        // window.
                        if section_bytes.len() < offset + 10 {
                            return None;
                        }
                        create(
                            RelaxationKind::TlsGdToInitialExec,
                            object::elf::R_386_TLS_GOTIE,
                            true,
                        )
                    }
                    (TlsOptimization::None, _) => unreachable!(),
                }
            }
            object::elf::R_386_TLS_LDM => {
                if tls_opt(relocation_kind)? != TlsOptimization::ToLocalExec {
                    return None;
                }
                // leal x(%reg),%eax followed by a direct or indirect call
                let op1 = *section_bytes.get(offset.checked_sub(1)?)?;
                let op2 = *section_bytes.get(offset.checked_sub(2)?)?;
                let op3 = *section_bytes.get(offset + 4)?;
                let reg = op1 & 7;
                if op2 != 0x8d || (op1 & 0xf8) != 0x80 || reg == 4 || reg == 0 {
                    return None;
                }
                match op3 {
                    0xe8 if section_bytes.len() >= offset + 9 => {
                        create(RelaxationKind::TlsLdToLocalExec, object::elf::R_386_NONE, true)
                    }
                    0xff if (section_bytes.get(offset + 5)? & 0x7) == reg
                        && section_bytes.len() >= offset + 10 =>
                    {
                        create(
                            RelaxationKind::TlsLdToLocalExecIndirect,
                            object::elf::R_386_NONE,
                            true,
                        )
                    }
                    _ => None,
                }
            }
            object::elf::R_386_TLS_IE => {
                if tls_opt(relocation_kind)? != TlsOptimization::ToLocalExec {
                    return None;
                }
                let op1 = *section_bytes.get(offset.checked_sub(1)?)?;
                if op1 == 0xa1 {
                    return create(
                        RelaxationKind::TlsIeMovEaxToLocalExec,
                        object::elf::R_386_TLS_LE,
                        true,
                    );
                }
                let op2 = *section_bytes.get(offset.checked_sub(2)?)?;
                if (op1 & 0xc7) != 0x05 {
                    return None;
                }
                match op2 {
                    0x8b => create(
                        RelaxationKind::TlsIeMovToLocalExec,
                        object::elf::R_386_TLS_LE,
                        true,
                    ),
                    0x03 => create(
                        RelaxationKind::TlsIeAddToLocalExec,
                        object::elf::R_386_TLS_LE,
                        true,
                    ),
                    _ => None,
                }
            }
            object::elf::R_386_TLS_GOTIE => {
                if tls_opt(relocation_kind)? != TlsOptimization::ToLocalExec {
                    return None;
                }
                let op1 = *section_bytes.get(offset.checked_sub(1)?)?;
                let op2 = *section_bytes.get(offset.checked_sub(2)?)?;
                if (op1 & 0xc0) != 0x80 || (op1 & 7) == 4 {
                    return None;
                }
                match op2 {
                    0x8b => create(
                        RelaxationKind::TlsGotIeMovToLocalExec,
                        object::elf::R_386_TLS_LE,
                        true,
                    ),
                    0x2b => create(
                        RelaxationKind::TlsGotIeSubToLocalExec,
                        object::elf::R_386_TLS_LE,
                        true,
                    ),
                    0x03 => create(
                        RelaxationKind::TlsGotIeAddToLocalExec,
                        object::elf::R_386_TLS_LE,
                        true,
                    ),
                    _ => None,
                }
            }
            object::elf::R_386_TLS_GOTDESC => {
                let opt = tls_opt(relocation_kind)?;
                if opt == TlsOptimization::None {
                    return None;
                }
                // leal x@tlsdesc(%ebx),%eax
                if section_bytes.get(offset.checked_sub(2)?..offset)? != [0x8d, 0x83] {
                    return None;
                }
                match opt {
                    TlsOptimization::ToLocalExec => create(
                        RelaxationKind::TlsDescToLocalExec,
                        object::elf::R_386_TLS_LE,
                        true,
                    ),
                    TlsOptimization::ToInitialExec => create(
                        RelaxationKind::TlsDescToInitialExec,
                        object::elf::R_386_TLS_GOTIE,
                        true,
                    ),
                    TlsOptimization::None => unreachable!(),
                }
            }
            object::elf::R_386_TLS_DESC_CALL => {
                if tls_opt(relocation_kind)? == TlsOptimization::None {
                    return None;
                }
                create(RelaxationKind::SkipTlsDescCall, object::elf::R_386_NONE, true)
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

/// The compiler-emitted shapes of the i386 general-dynamic sequence.
enum TlsGdForm {
    /// `leal x(,%ebx,1),%eax`
    Scaled,

    /// `leal x(%reg),%eax` with a direct call and no trailing nop.
    Plain,

    /// `leal x(%reg),%eax` with an indirect call or a trailing nop; one byte more to fill.
    PlainSized,
}

impl TlsGdForm {
    fn identify(bytes: &[u8], offset: usize) -> Option<Self> {
        let op1 = *bytes.get(offset.checked_sub(1)?)?;
        let op2 = *bytes.get(offset.checked_sub(2)?)?;
        let op3 = *bytes.get(offset + 4)?;
        if op3 != 0xe8 && op3 != 0xff {
            return None;
        }

        if op2 == 0x04 {
            if *bytes.get(offset.checked_sub(3)?)? != 0x8d {
                return None;
            }
            if (op1 & 0xc7) != 0x05 || op1 == (4 << 3) {
                return None;
            }
            // The rewrite covers the whole call sequence.
            if bytes.len() < offset + 9 {
                return None;
            }
            return Some(Self::Scaled);
        }

        if op2 == 0x8d {
            let reg = op1 & 7;
            if (op1 & 0xf8) != 0x80 || reg == 4 || reg == 0 {
                return None;
            }
            if op3 == 0xff {
                if (bytes.get(offset + 5)? & 0x7) != reg || bytes.len() < offset + 10 {
                    return None;
                }
                return Some(Self::PlainSized);
            }
            if bytes.len() < offset + 9 {
                return None;
            }
            if bytes.get(offset + 9) == Some(&0x90) && bytes.len() >= offset + 10 {
                return Some(Self::PlainSized);
            }
            return Some(Self::Plain);
        }

        None
    }
}
