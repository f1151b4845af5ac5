use crate::elf::AllowedRange;
use crate::elf::RelocationKind;
use crate::elf::RelocationKindInfo;
use crate::relaxation::RelocationModifier;

/// An i386 instruction rewrite that accompanies a change of relocation type. The general-dynamic
/// and local-dynamic sequences come in several compiler-emitted shapes, so each shape gets its own
/// variant; which one applies is decided by the opcode window around the relocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelaxationKind {
    /// Leave the instruction alone; only the relocation type changes.
    NoOp,

    /// `leal x(,%ebx,1),%eax; call __tls_get_addr@plt`
    /// -> `movl %gs:0,%eax; subl $x@tpoff,%eax`.
    TlsGdToLocalExecScaled,

    /// `leal x(%reg),%eax; call __tls_get_addr@plt` followed by neither a nop nor an indirect
    /// call: the five-byte `subl $imm,%eax` form fits exactly.
    TlsGdToLocalExec,

    /// As above, when a trailing nop or an indirect call leaves one extra byte to fill, so the
    /// six-byte mod/rm form of `subl` is used.
    TlsGdToLocalExecSized,

    /// `leal x(,%ebx,1),%eax; call __tls_get_addr@plt`
    /// -> `movl %gs:0,%eax; addl x@gotntpoff(%ebx),%eax`.
    TlsGdToInitialExecScaled,

    /// `leal x(%reg),%eax; call __tls_get_addr@plt` -> `movl %gs:0,%eax; addl x@gotntpoff(%reg),%eax`.
    TlsGdToInitialExec,

    /// `leal x(%reg),%eax; call __tls_get_addr@plt` -> `movl %gs:0,%eax; nop; leal 0(%esi,1),%esi`.
    TlsLdToLocalExec,

    /// Local-dynamic form whose second instruction is an indirect call through the GOT.
    TlsLdToLocalExecIndirect,

    /// `movl x,%eax` (via the GOT-entry address form of `R_386_TLS_IE`) -> `movl $x@tpoff,%eax`.
    TlsIeMovEaxToLocalExec,

    /// `movl x,%reg` -> `movl $x@tpoff,%reg` for `R_386_TLS_IE`.
    TlsIeMovToLocalExec,

    /// `addl x,%reg` -> `addl $x@tpoff,%reg` for `R_386_TLS_IE`.
    TlsIeAddToLocalExec,

    /// `movl x@gotntpoff(%reg1),%reg2` -> `movl $x@tpoff,%reg2` for `R_386_TLS_GOTIE`.
    TlsGotIeMovToLocalExec,

    /// `subl x@gotntpoff(%reg1),%reg2` -> `subl $x@tpoff,%reg2`.
    TlsGotIeSubToLocalExec,

    /// `addl x@gotntpoff(%reg1),%reg2` -> `addl $x@tpoff,%reg2`.
    TlsGotIeAddToLocalExec,

    /// `leal x@tlsdesc(%ebx),%eax` -> `leal x@tpoff,%eax`.
    TlsDescToLocalExec,

    /// `leal x@tlsdesc(%ebx),%eax` -> `movl x@gotntpoff(%ebx),%eax`.
    TlsDescToInitialExec,

    /// Turn the `call *(%eax)` of a TLS-descriptor sequence into a two-byte nop.
    SkipTlsDescCall,
}

impl RelaxationKind {
    pub fn apply(self, section_bytes: &mut [u8], offset_in_section: &mut u64, addend: &mut i64) {
        let offset = *offset_in_section as usize;
        match self {
            RelaxationKind::NoOp => {}
            RelaxationKind::TlsGdToLocalExecScaled => {
                section_bytes[offset - 3..offset + 9].copy_from_slice(&[
                    0x65, 0xa1, 0, 0, 0, 0, // movl %gs:0,%eax
                    0x81, 0xe8, 0, 0, 0, 0, // subl $x,%eax
                ]);
                *offset_in_section += 5;
                *addend = 0;
            }
            RelaxationKind::TlsGdToLocalExec => {
                section_bytes[offset - 2..offset + 9].copy_from_slice(&[
                    0x65, 0xa1, 0, 0, 0, 0, // movl %gs:0,%eax
                    0x2d, 0, 0, 0, 0, // subl $x,%eax
                ]);
                *offset_in_section += 5;
                *addend = 0;
            }
            RelaxationKind::TlsGdToLocalExecSized => {
                section_bytes[offset - 2..offset + 10].copy_from_slice(&[
                    0x65, 0xa1, 0, 0, 0, 0, // movl %gs:0,%eax
                    0x81, 0xe8, 0, 0, 0, 0, // subl $x,%eax
                ]);
                *offset_in_section += 6;
                *addend = 0;
            }
            RelaxationKind::TlsGdToInitialExecScaled => {
                section_bytes[offset - 3..offset + 9].copy_from_slice(&[
                    0x65, 0xa1, 0, 0, 0, 0, // movl %gs:0,%eax
                    0x03, 0x83, 0, 0, 0, 0, // addl x@gotntpoff(%ebx),%eax
                ]);
                *offset_in_section += 5;
                *addend = 0;
            }
            RelaxationKind::TlsGdToInitialExec => {
                section_bytes[offset - 2..offset + 10].copy_from_slice(&[
                    0x65, 0xa1, 0, 0, 0, 0, // movl %gs:0,%eax
                    0x03, 0x83, 0, 0, 0, 0, // addl x@gotntpoff(%ebx),%eax
                ]);
                *offset_in_section += 6;
                *addend = 0;
            }
            RelaxationKind::TlsLdToLocalExec => {
                section_bytes[offset - 2..offset + 9].copy_from_slice(&[
                    0x65, 0xa1, 0, 0, 0, 0, // movl %gs:0,%eax
                    0x90, // nop
                    0x8d, 0x74, 0x26, 0x00, // leal 0(%esi,1),%esi
                ]);
            }
            RelaxationKind::TlsLdToLocalExecIndirect => {
                section_bytes[offset - 2..offset + 10].copy_from_slice(&[
                    0x65, 0xa1, 0, 0, 0, 0, // movl %gs:0,%eax
                    0x8d, 0xb6, 0, 0, 0, 0, // leal 0(%esi),%esi
                ]);
            }
            RelaxationKind::TlsIeMovEaxToLocalExec => {
                // movl x,%eax -> movl $x,%eax
                section_bytes[offset - 1] = 0xb8;
                *addend = 0;
            }
            RelaxationKind::TlsIeMovToLocalExec => {
                let modrm = section_bytes[offset - 1];
                section_bytes[offset - 2] = 0xc7;
                section_bytes[offset - 1] = 0xc0 | ((modrm >> 3) & 7);
                *addend = 0;
            }
            RelaxationKind::TlsIeAddToLocalExec => {
                let modrm = section_bytes[offset - 1];
                section_bytes[offset - 2] = 0x81;
                section_bytes[offset - 1] = 0xc0 | ((modrm >> 3) & 7);
                *addend = 0;
            }
            RelaxationKind::TlsGotIeMovToLocalExec => {
                let modrm = section_bytes[offset - 1];
                section_bytes[offset - 2] = 0xc7;
                section_bytes[offset - 1] = 0xc0 | ((modrm >> 3) & 7);
                *addend = 0;
            }
            RelaxationKind::TlsGotIeSubToLocalExec => {
                let modrm = section_bytes[offset - 1];
                section_bytes[offset - 2] = 0x81;
                section_bytes[offset - 1] = 0xe8 | ((modrm >> 3) & 7);
                *addend = 0;
            }
            RelaxationKind::TlsGotIeAddToLocalExec => {
                let modrm = section_bytes[offset - 1];
                section_bytes[offset - 2] = 0x81;
                section_bytes[offset - 1] = 0xc0 | ((modrm >> 3) & 7);
                *addend = 0;
            }
            RelaxationKind::TlsDescToLocalExec => {
                // leal x@tlsdesc(%ebx),%eax uses mod/rm 0x83; switch to the absolute form.
                section_bytes[offset - 1] = 0x05;
                *addend = 0;
            }
            RelaxationKind::TlsDescToInitialExec => {
                section_bytes[offset - 2] = 0x8b;
            }
            RelaxationKind::SkipTlsDescCall => {
                section_bytes[offset..offset + 2].copy_from_slice(&[
                    // xchg %ax,%ax
                    0x66, 0x90,
                ]);
            }
        }
    }

    #[must_use]
    pub fn next_modifier(self) -> RelocationModifier {
        match self {
            RelaxationKind::TlsGdToLocalExecScaled
            | RelaxationKind::TlsGdToLocalExec
            | RelaxationKind::TlsGdToLocalExecSized
            | RelaxationKind::TlsGdToInitialExecScaled
            | RelaxationKind::TlsGdToInitialExec
            | RelaxationKind::TlsLdToLocalExec
            | RelaxationKind::TlsLdToLocalExecIndirect => RelocationModifier::SkipNextRelocation,
            RelaxationKind::NoOp
            | RelaxationKind::TlsIeMovEaxToLocalExec
            | RelaxationKind::TlsIeMovToLocalExec
            | RelaxationKind::TlsIeAddToLocalExec
            | RelaxationKind::TlsGotIeMovToLocalExec
            | RelaxationKind::TlsGotIeSubToLocalExec
            | RelaxationKind::TlsGotIeAddToLocalExec
            | RelaxationKind::TlsDescToLocalExec
            | RelaxationKind::TlsDescToInitialExec
            | RelaxationKind::SkipTlsDescCall => RelocationModifier::Normal,
        }
    }
}

/// Returns the kind and width of an i386 relocation. Returns `None` if the r_type isn't
/// recognised. Fields are 32-bit and full-width unless the relocation is one of the short forms,
/// so most kinds carry no overflow bounds.
#[must_use]
pub const fn relocation_from_raw(r_type: u32) -> Option<RelocationKindInfo> {
    let (kind, size, range) = match r_type {
        object::elf::R_386_32 => (RelocationKind::Absolute, 4, AllowedRange::no_check()),
        object::elf::R_386_PC32 => (RelocationKind::Relative, 4, AllowedRange::no_check()),
        object::elf::R_386_16 => (RelocationKind::Absolute, 2, AllowedRange::unsigned(16)),
        object::elf::R_386_PC16 => (RelocationKind::Relative, 2, AllowedRange::signed(16)),
        object::elf::R_386_8 => (RelocationKind::Absolute, 1, AllowedRange::unsigned(8)),
        object::elf::R_386_PC8 => (RelocationKind::Relative, 1, AllowedRange::signed(8)),
        object::elf::R_386_GOT32 | object::elf::R_386_GOT32X => {
            (RelocationKind::GotRelGotBase, 4, AllowedRange::no_check())
        }
        object::elf::R_386_GOTOFF => (RelocationKind::SymRelGotBase, 4, AllowedRange::no_check()),

        // GOTPC always references _GLOBAL_OFFSET_TABLE_, so it behaves as a plain relative
        // relocation.
        object::elf::R_386_GOTPC => (RelocationKind::Relative, 4, AllowedRange::no_check()),

        object::elf::R_386_PLT32 => (RelocationKind::PltRelative, 4, AllowedRange::no_check()),
        object::elf::R_386_TLS_GD => (RelocationKind::TlsGdGotBase, 4, AllowedRange::no_check()),
        object::elf::R_386_TLS_LDM => (RelocationKind::TlsLdGotBase, 4, AllowedRange::no_check()),
        object::elf::R_386_TLS_LDO_32 => (RelocationKind::DtpOff, 4, AllowedRange::no_check()),
        object::elf::R_386_TLS_IE => (RelocationKind::GotTpOffGot, 4, AllowedRange::no_check()),
        object::elf::R_386_TLS_GOTIE => {
            (RelocationKind::GotTpOffGotBase, 4, AllowedRange::no_check())
        }
        object::elf::R_386_TLS_LE => (RelocationKind::TpOff, 4, AllowedRange::no_check()),
        object::elf::R_386_TLS_LE_32 => {
            (RelocationKind::TpOffNegated, 4, AllowedRange::no_check())
        }
        object::elf::R_386_TLS_GOTDESC => {
            (RelocationKind::TlsDescGotBase, 4, AllowedRange::no_check())
        }
        object::elf::R_386_TLS_DESC_CALL => {
            (RelocationKind::TlsDescCall, 0, AllowedRange::no_check())
        }
        object::elf::R_386_NONE => (RelocationKind::None, 0, AllowedRange::no_check()),
        _ => return None,
    };

    Some(RelocationKindInfo::new(kind, size, range))
}

/// The Sun-convention TLS relocation types. We implement the GNU convention; these are only
/// recognised far enough to diagnose an input that mixes the two in one section.
#[must_use]
pub const fn is_sun_tls(r_type: u32) -> bool {
    matches!(
        r_type,
        object::elf::R_386_TLS_GD_32
            | object::elf::R_386_TLS_GD_PUSH
            | object::elf::R_386_TLS_GD_CALL
            | object::elf::R_386_TLS_GD_POP
            | object::elf::R_386_TLS_LDM_32
            | object::elf::R_386_TLS_LDM_PUSH
            | object::elf::R_386_TLS_LDM_CALL
            | object::elf::R_386_TLS_LDM_POP
    )
}
