use crate::elf::AllowedRange;
use crate::elf::RelocationKind;
use crate::elf::RelocationKindInfo;
use crate::relaxation::RelocationModifier;

/// An x86-64 instruction rewrite that accompanies a change of relocation type. The byte sequences
/// are fixed by the psABI's linker-optimization annex; the compiler guarantees the input forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelaxationKind {
    /// Transforms a mov instruction that would have loaded an address out of the GOT to compute
    /// the address directly: `mov *x(%rip), reg` -> `lea x(%rip), reg`.
    MovIndirectToLea,

    /// Transforms a mov that would have loaded an absolute value from the GOT into an immediate
    /// load: `mov *x(%rip), reg` -> `mov x, reg`.
    MovIndirectToAbsolute,

    /// As `MovIndirectToAbsolute`, for the REX-prefixed form.
    RexMovIndirectToAbsolute,

    /// REX-prefixed sub-from-GOT to sub-immediate.
    RexSubIndirectToAbsolute,

    /// REX-prefixed cmp-against-GOT to cmp-immediate.
    RexCmpIndirectToAbsolute,

    /// REX-prefixed add-from-GOT to add-immediate. Used when rewriting a GOTTPOFF access whose
    /// add form the compiler emitted for thread-pointer arithmetic.
    RexAddIndirectToAbsolute,

    /// `call *x(%rip)` -> `addr32 call x`.
    CallIndirectToRelative,

    /// `jmp *x(%rip)` -> `jmp x; nop`.
    JmpIndirectToRelative,

    /// Leave the instruction alone; only the relocation type changes.
    NoOp,

    /// Rewrite a general-dynamic `__tls_get_addr` sequence to local-exec.
    TlsGdToLocalExec,

    /// Rewrite a general-dynamic `__tls_get_addr` sequence to initial-exec.
    TlsGdToInitialExec,

    /// Rewrite a local-dynamic `__tls_get_addr` sequence to local-exec.
    TlsLdToLocalExec,

    /// Rewrite a TLS-descriptor address load to local-exec.
    TlsDescToLocalExec,

    /// Rewrite a TLS-descriptor address load to initial-exec.
    TlsDescToInitialExec,

    /// Turn the call through a TLS descriptor into a two-byte nop.
    SkipTlsDescCall,
}

impl RelaxationKind {
    pub fn apply(self, section_bytes: &mut [u8], offset_in_section: &mut u64, addend: &mut i64) {
        let offset = *offset_in_section as usize;
        match self {
            RelaxationKind::MovIndirectToLea => {
                section_bytes[offset - 2] = 0x8d;
            }
            RelaxationKind::MovIndirectToAbsolute => {
                section_bytes[offset - 2] = 0xc7;
                let mod_rm = &mut section_bytes[offset - 1];
                *mod_rm = (*mod_rm >> 3) & 0x7 | 0xc0;
                *addend = 0;
            }
            RelaxationKind::RexMovIndirectToAbsolute => {
                // Turn REX.R into REX.B: the register moves from the reg field into the r/m field.
                let rex = section_bytes[offset - 3];
                section_bytes[offset - 3] = (rex & !4) | ((rex & 4) >> 2);
                section_bytes[offset - 2] = 0xc7;
                let mod_rm = &mut section_bytes[offset - 1];
                *mod_rm = (*mod_rm >> 3) & 0x7 | 0xc0;
                *addend = 0;
            }
            RelaxationKind::RexSubIndirectToAbsolute => {
                let rex = section_bytes[offset - 3];
                section_bytes[offset - 3] = (rex & !4) | ((rex & 4) >> 2);
                section_bytes[offset - 2] = 0x81;
                let mod_rm = &mut section_bytes[offset - 1];
                *mod_rm = (*mod_rm >> 3) & 0x7 | 0xe8;
                *addend = 0;
            }
            RelaxationKind::RexCmpIndirectToAbsolute => {
                let rex = section_bytes[offset - 3];
                section_bytes[offset - 3] = (rex & !4) | ((rex & 4) >> 2);
                section_bytes[offset - 2] = 0x81;
                let mod_rm = &mut section_bytes[offset - 1];
                *mod_rm = (*mod_rm >> 3) & 0x7 | 0xf8;
                *addend = 0;
            }
            RelaxationKind::RexAddIndirectToAbsolute => {
                let rex = section_bytes[offset - 3];
                section_bytes[offset - 3] = (rex & !4) | ((rex & 4) >> 2);
                section_bytes[offset - 2] = 0x81;
                let mod_rm = &mut section_bytes[offset - 1];
                *mod_rm = (*mod_rm >> 3) & 0x7 | 0xc0;
                *addend = 0;
            }
            RelaxationKind::CallIndirectToRelative => {
                section_bytes[offset - 2..offset].copy_from_slice(&[0x67, 0xe8]);
            }
            RelaxationKind::JmpIndirectToRelative => {
                section_bytes[offset - 2..offset + 4].copy_from_slice(&[0xe9, 0, 0, 0, 0, 0x90]);
                *offset_in_section -= 1; // Instruction is 1 byte shorter
            }
            RelaxationKind::TlsGdToLocalExec => {
                section_bytes[offset - 4..offset + 8].copy_from_slice(&[
                    0x64, 0x48, 0x8b, 0x04, 0x25, 0, 0, 0, 0, // mov %fs:0,%rax
                    0x48, 0x8d, 0x80, // lea {offset}(%rax),%rax
                ]);
                *offset_in_section += 8;
                *addend = 0;
            }
            RelaxationKind::TlsGdToInitialExec => {
                section_bytes[offset - 4..offset + 8].copy_from_slice(&[
                    0x64, 0x48, 0x8b, 0x04, 0x25, 0, 0, 0, 0, // mov %fs:0,%rax
                    0x48, 0x03, 0x05, // add *x(%rip),%rax
                ]);
                *offset_in_section += 8;
            }
            RelaxationKind::TlsLdToLocalExec => {
                section_bytes[offset - 3..offset + 9].copy_from_slice(&[
                    // mov %fs:0,%rax
                    0x66, 0x66, 0x66, 0x64, 0x48, 0x8b, 0x04, 0x25, 0, 0, 0, 0,
                ]);
                *offset_in_section += 5;
            }
            RelaxationKind::TlsDescToLocalExec => {
                let rex = section_bytes[offset - 3];
                let modrm = section_bytes[offset - 1];

                let rex_r = (rex >> 2) & 1;
                let reg = (modrm >> 3) & 0x7;

                let rex = if rex_r == 0 { 0x48 } else { 0x49 };
                section_bytes[offset - 3..offset + 4].copy_from_slice(&[
                    // mov {offset},%{reg}
                    rex,
                    0xc7,
                    0xc0 | reg,
                    0,
                    0,
                    0,
                    0,
                ]);
                *addend = 0;
            }
            RelaxationKind::TlsDescToInitialExec => {
                let rex = section_bytes[offset - 3];
                let modrm = section_bytes[offset - 1];

                let rex_r = (rex >> 2) & 1;
                let reg = (modrm >> 3) & 0x7;

                let rex = if rex_r == 0 { 0x48 } else { 0x4c };
                section_bytes[offset - 3..offset + 4].copy_from_slice(&[
                    // mov {GOT}(%rip),%{reg}
                    rex,
                    0x8b,
                    0x05 | reg << 3,
                    0,
                    0,
                    0,
                    0,
                ]);
            }
            RelaxationKind::SkipTlsDescCall => {
                section_bytes[offset..offset + 2].copy_from_slice(&[
                    // xchg %ax,%ax
                    0x66, 0x90,
                ]);
            }
            RelaxationKind::NoOp => {}
        }
    }

    #[must_use]
    pub fn next_modifier(self) -> RelocationModifier {
        match self {
            RelaxationKind::TlsGdToInitialExec
            | RelaxationKind::TlsGdToLocalExec
            | RelaxationKind::TlsLdToLocalExec => RelocationModifier::SkipNextRelocation,
            RelaxationKind::MovIndirectToLea
            | RelaxationKind::MovIndirectToAbsolute
            | RelaxationKind::RexMovIndirectToAbsolute
            | RelaxationKind::RexSubIndirectToAbsolute
            | RelaxationKind::RexCmpIndirectToAbsolute
            | RelaxationKind::RexAddIndirectToAbsolute
            | RelaxationKind::CallIndirectToRelative
            | RelaxationKind::JmpIndirectToRelative
            | RelaxationKind::TlsDescToLocalExec
            | RelaxationKind::TlsDescToInitialExec
            | RelaxationKind::NoOp
            | RelaxationKind::SkipTlsDescCall => RelocationModifier::Normal,
        }
    }
}

/// Returns the kind, width and overflow bounds of an x86-64 relocation. Returns `None` if the
/// r_type isn't recognised.
#[must_use]
pub const fn relocation_from_raw(r_type: u32) -> Option<RelocationKindInfo> {
    let (kind, size, range) = match r_type {
        object::elf::R_X86_64_64 => (RelocationKind::Absolute, 8, AllowedRange::no_check()),
        object::elf::R_X86_64_PC32 => (RelocationKind::Relative, 4, AllowedRange::signed(32)),
        object::elf::R_X86_64_PC64 => (RelocationKind::Relative, 8, AllowedRange::no_check()),
        object::elf::R_X86_64_GOT32 => {
            (RelocationKind::GotRelGotBase, 4, AllowedRange::signed(32))
        }
        object::elf::R_X86_64_GOT64 => {
            (RelocationKind::GotRelGotBase, 8, AllowedRange::no_check())
        }
        object::elf::R_X86_64_GOTOFF64 => {
            (RelocationKind::SymRelGotBase, 8, AllowedRange::no_check())
        }
        object::elf::R_X86_64_PLT32 => (RelocationKind::PltRelative, 4, AllowedRange::signed(32)),
        object::elf::R_X86_64_PLTOFF64 => {
            (RelocationKind::PltRelGotBase, 8, AllowedRange::no_check())
        }
        object::elf::R_X86_64_GOTPCREL
        | object::elf::R_X86_64_GOTPCRELX
        | object::elf::R_X86_64_REX_GOTPCRELX => {
            (RelocationKind::GotRelative, 4, AllowedRange::signed(32))
        }

        // We rely on GOTPC64 and GOTPC32 always referencing the symbol _GLOBAL_OFFSET_TABLE_,
        // which means that we can just treat these as normal relative relocations.
        object::elf::R_X86_64_GOTPC64 => (RelocationKind::Relative, 8, AllowedRange::no_check()),
        object::elf::R_X86_64_GOTPC32 => (RelocationKind::Relative, 4, AllowedRange::signed(32)),

        object::elf::R_X86_64_32 => (RelocationKind::Absolute, 4, AllowedRange::unsigned(32)),
        object::elf::R_X86_64_32S => (RelocationKind::Absolute, 4, AllowedRange::signed(32)),
        object::elf::R_X86_64_16 => (RelocationKind::Absolute, 2, AllowedRange::unsigned(16)),
        object::elf::R_X86_64_PC16 => (RelocationKind::Relative, 2, AllowedRange::signed(16)),
        object::elf::R_X86_64_8 => (RelocationKind::Absolute, 1, AllowedRange::unsigned(8)),
        object::elf::R_X86_64_PC8 => (RelocationKind::Relative, 1, AllowedRange::signed(8)),
        object::elf::R_X86_64_TLSGD => (RelocationKind::TlsGd, 4, AllowedRange::signed(32)),
        object::elf::R_X86_64_TLSLD => (RelocationKind::TlsLd, 4, AllowedRange::signed(32)),
        object::elf::R_X86_64_DTPOFF32 => (RelocationKind::DtpOff, 4, AllowedRange::signed(32)),
        object::elf::R_X86_64_DTPOFF64 => (RelocationKind::DtpOff, 8, AllowedRange::no_check()),
        object::elf::R_X86_64_GOTTPOFF => (RelocationKind::GotTpOff, 4, AllowedRange::signed(32)),
        object::elf::R_X86_64_TPOFF32 => (RelocationKind::TpOff, 4, AllowedRange::signed(32)),
        object::elf::R_X86_64_GOTPC32_TLSDESC => {
            (RelocationKind::TlsDesc, 4, AllowedRange::signed(32))
        }
        object::elf::R_X86_64_TLSDESC_CALL => {
            (RelocationKind::TlsDescCall, 0, AllowedRange::no_check())
        }
        object::elf::R_X86_64_NONE => (RelocationKind::None, 0, AllowedRange::no_check()),
        _ => return None,
    };

    Some(RelocationKindInfo::new(kind, size, range))
}
