use anyhow::Result;
use bitflags::bitflags;
use std::borrow::Cow;
use std::fmt;

macro_rules! const_name_by_value {
    ($needle: expr, $( $const:ident ),*) => {
        match $needle {
            $(object::elf::$const => Some(stringify!($const)),)*
            _ => None
        }
    };
}

#[must_use]
pub fn x86_64_rel_type_to_string(r_type: u32) -> Cow<'static, str> {
    if let Some(name) = const_name_by_value![
        r_type,
        R_X86_64_NONE,
        R_X86_64_64,
        R_X86_64_PC32,
        R_X86_64_GOT32,
        R_X86_64_PLT32,
        R_X86_64_COPY,
        R_X86_64_GLOB_DAT,
        R_X86_64_JUMP_SLOT,
        R_X86_64_RELATIVE,
        R_X86_64_GOTPCREL,
        R_X86_64_32,
        R_X86_64_32S,
        R_X86_64_16,
        R_X86_64_PC16,
        R_X86_64_8,
        R_X86_64_PC8,
        R_X86_64_DTPMOD64,
        R_X86_64_DTPOFF64,
        R_X86_64_TPOFF64,
        R_X86_64_TLSGD,
        R_X86_64_TLSLD,
        R_X86_64_DTPOFF32,
        R_X86_64_GOTTPOFF,
        R_X86_64_TPOFF32,
        R_X86_64_PC64,
        R_X86_64_GOTOFF64,
        R_X86_64_GOTPC32,
        R_X86_64_GOT64,
        R_X86_64_GOTPC64,
        R_X86_64_PLTOFF64,
        R_X86_64_GOTPC32_TLSDESC,
        R_X86_64_TLSDESC_CALL,
        R_X86_64_TLSDESC,
        R_X86_64_IRELATIVE,
        R_X86_64_RELATIVE64,
        R_X86_64_GOTPCRELX,
        R_X86_64_REX_GOTPCRELX
    ] {
        Cow::Borrowed(name)
    } else {
        Cow::Owned(format!("Unknown x86_64 relocation type 0x{r_type:x}"))
    }
}

#[must_use]
pub fn i386_rel_type_to_string(r_type: u32) -> Cow<'static, str> {
    if let Some(name) = const_name_by_value![
        r_type,
        R_386_NONE,
        R_386_32,
        R_386_PC32,
        R_386_GOT32,
        R_386_PLT32,
        R_386_COPY,
        R_386_GLOB_DAT,
        R_386_JMP_SLOT,
        R_386_RELATIVE,
        R_386_GOTOFF,
        R_386_GOTPC,
        R_386_TLS_TPOFF,
        R_386_TLS_IE,
        R_386_TLS_GOTIE,
        R_386_TLS_LE,
        R_386_TLS_GD,
        R_386_TLS_LDM,
        R_386_16,
        R_386_PC16,
        R_386_8,
        R_386_PC8,
        R_386_TLS_GD_32,
        R_386_TLS_GD_PUSH,
        R_386_TLS_GD_CALL,
        R_386_TLS_GD_POP,
        R_386_TLS_LDM_32,
        R_386_TLS_LDM_PUSH,
        R_386_TLS_LDM_CALL,
        R_386_TLS_LDM_POP,
        R_386_TLS_LDO_32,
        R_386_TLS_IE_32,
        R_386_TLS_LE_32,
        R_386_TLS_DTPMOD32,
        R_386_TLS_DTPOFF32,
        R_386_TLS_TPOFF32,
        R_386_TLS_GOTDESC,
        R_386_TLS_DESC_CALL,
        R_386_TLS_DESC,
        R_386_IRELATIVE,
        R_386_GOT32X
    ] {
        Cow::Borrowed(name)
    } else {
        Cow::Owned(format!("Unknown i386 relocation type 0x{r_type:x}"))
    }
}

/// Section flag bit values.
pub mod shf {
    use super::SectionFlags;

    pub const WRITE: SectionFlags = SectionFlags::from_u32(object::elf::SHF_WRITE);
    pub const ALLOC: SectionFlags = SectionFlags::from_u32(object::elf::SHF_ALLOC);
    pub const EXECINSTR: SectionFlags = SectionFlags::from_u32(object::elf::SHF_EXECINSTR);
    pub const TLS: SectionFlags = SectionFlags::from_u32(object::elf::SHF_TLS);
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SectionFlags(u32);

impl SectionFlags {
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn from_u32(raw: u32) -> SectionFlags {
        SectionFlags(raw)
    }

    #[must_use]
    pub fn contains(self, flag: SectionFlags) -> bool {
        self.0 & flag.0 != 0
    }

    /// Returns self with the specified flags set.
    #[must_use]
    pub const fn with(self, flags: SectionFlags) -> SectionFlags {
        SectionFlags(self.0 | flags.0)
    }

    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for SectionFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (flag, ch) in [
            (shf::WRITE, "W"),
            (shf::ALLOC, "A"),
            (shf::EXECINSTR, "X"),
            (shf::TLS, "T"),
        ] {
            if self.contains(flag) {
                f.write_str(ch)?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for SectionFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self, f)
    }
}

impl std::ops::BitOrAssign for SectionFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// The semantic kind of a relocation, independent of the raw per-architecture r_type. For
/// background on the TLS-related kinds, see "ELF Handling For Thread-Local Storage" -
/// <https://www.uclibc.org/docs/tls.pdf>.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelocationKind {
    /// The absolute address of a symbol or section.
    Absolute,

    /// The address of the symbol, relative to the place of the relocation.
    Relative,

    /// The address of the symbol, relative to the base address of the GOT.
    SymRelGotBase,

    /// The offset of the symbol's GOT entry, relative to the base address of the GOT.
    GotRelGotBase,

    /// The address of the symbol's GOT entry, relative to the place of the relocation.
    GotRelative,

    /// The address of the symbol's PLT entry, relative to the place of the relocation.
    PltRelative,

    /// The address of the symbol's PLT entry, relative to the base address of the GOT.
    PltRelGotBase,

    /// The address of a TLSGD structure, relative to the place of the relocation. A TLSGD
    /// structure is a pair of GOT values containing a module ID and the offset within that
    /// module's TLS storage.
    TlsGd,

    /// The offset of the symbol's TLSGD structure, relative to the base address of the GOT.
    TlsGdGotBase,

    /// The address of the TLS module ID entry for the object being written, relative to the place
    /// of the relocation.
    TlsLd,

    /// The offset of the TLS module ID entry, relative to the base address of the GOT.
    TlsLdGotBase,

    /// The offset of a thread-local within the TLS storage of the module that defines it.
    DtpOff,

    /// The address of a GOT entry containing the offset of a TLS variable within the static TLS
    /// block, relative to the place of the relocation.
    GotTpOff,

    /// The absolute address of a GOT entry containing a static TLS offset.
    GotTpOffGot,

    /// The offset of a GOT entry containing a static TLS offset, relative to the base address of
    /// the GOT.
    GotTpOffGotBase,

    /// The offset of a TLS variable within the static TLS block (negative on x86).
    TpOff,

    /// As `TpOff`, but with the sign flipped. Used by the i386 `R_386_TLS_LE` convention.
    TpOffNegated,

    /// The address of a TLS descriptor structure, relative to the place of the relocation.
    TlsDesc,

    /// The offset of a TLS descriptor structure, relative to the base address of the GOT.
    TlsDescGotBase,

    /// Call to the TLS descriptor trampoline. Only a marker for a rewrite opportunity.
    TlsDescCall,

    /// No relocation needs to be applied. Produced when a relocation is eliminated by an
    /// optimisation.
    None,
}

impl RelocationKind {
    #[must_use]
    pub fn is_tls(self) -> bool {
        matches!(
            self,
            Self::TlsGd
                | Self::TlsGdGotBase
                | Self::TlsLd
                | Self::TlsLdGotBase
                | Self::DtpOff
                | Self::GotTpOff
                | Self::GotTpOffGot
                | Self::GotTpOffGotBase
                | Self::TpOff
                | Self::TpOffNegated
                | Self::TlsDesc
                | Self::TlsDescGotBase
                | Self::TlsDescCall
        )
    }

    /// Classifies the kind of reference this relocation makes to its symbol. Grouping matches
    /// what the scan pass needs to decide: does taking this reference require the symbol's
    /// absolute value, only a relative distance, a callable entry point, or TLS machinery.
    #[must_use]
    pub fn reference_flags(self) -> ReferenceFlags {
        match self {
            Self::Absolute => ReferenceFlags::ABSOLUTE,
            Self::Relative | Self::SymRelGotBase => ReferenceFlags::RELATIVE,
            Self::PltRelative | Self::PltRelGotBase => {
                ReferenceFlags::FUNCTION_CALL | ReferenceFlags::RELATIVE
            }
            // A GOT entry holds the symbol's absolute address, even though the field written at
            // the reference site is relative.
            Self::GotRelGotBase | Self::GotRelative => ReferenceFlags::ABSOLUTE,
            Self::TlsGd
            | Self::TlsGdGotBase
            | Self::TlsLd
            | Self::TlsLdGotBase
            | Self::DtpOff
            | Self::GotTpOff
            | Self::GotTpOffGot
            | Self::GotTpOffGotBase
            | Self::TpOff
            | Self::TpOffNegated
            | Self::TlsDesc
            | Self::TlsDescGotBase
            | Self::TlsDescCall => ReferenceFlags::TLS_REF,
            Self::None => ReferenceFlags::empty(),
        }
    }
}

bitflags! {
    /// How a relocation references its symbol.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ReferenceFlags: u8 {
        const ABSOLUTE = 1 << 0;
        const RELATIVE = 1 << 1;
        const FUNCTION_CALL = 1 << 2;
        const TLS_REF = 1 << 3;
    }
}

impl std::fmt::Display for ReferenceFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        bitflags::parser::to_writer(self, f)
    }
}

#[derive(Clone, Debug, Copy, PartialEq, Eq)]
pub enum RelocationSize {
    ByteSize(usize),
}

impl RelocationSize {
    #[must_use]
    pub fn byte_size(self) -> usize {
        let RelocationSize::ByteSize(bytes) = self;
        bytes
    }
}

impl fmt::Display for RelocationSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let RelocationSize::ByteSize(bytes) = self;
        f.write_fmt(format_args!("{bytes}B"))
    }
}

/// Allowed range (half-open) of the computed value of a relocation.
#[derive(Clone, Debug, Copy, PartialEq, Eq)]
pub struct AllowedRange {
    pub min: i64,
    pub max: i64,
}

impl AllowedRange {
    #[must_use]
    pub const fn new(min: i64, max: i64) -> Self {
        Self { min, max }
    }

    #[must_use]
    pub const fn no_check() -> Self {
        Self::new(i64::MIN, i64::MAX)
    }

    /// A field holding a signed value of the given width in bits.
    #[must_use]
    pub const fn signed(bits: u32) -> Self {
        Self::new(-(1 << (bits - 1)), 1 << (bits - 1))
    }

    /// A field holding an unsigned value of the given width in bits.
    #[must_use]
    pub const fn unsigned(bits: u32) -> Self {
        Self::new(0, 1 << bits)
    }

    #[must_use]
    pub fn is_signed(self) -> bool {
        self.min < 0
    }
}

#[derive(Clone, Debug, Copy)]
pub struct RelocationKindInfo {
    pub kind: RelocationKind,
    pub size: RelocationSize,
    pub range: AllowedRange,
}

impl RelocationKindInfo {
    #[must_use]
    pub const fn new(kind: RelocationKind, byte_size: usize, range: AllowedRange) -> Self {
        Self {
            kind,
            size: RelocationSize::ByteSize(byte_size),
            range,
        }
    }

    /// Checks that `value` fits in the relocated field.
    #[inline(always)]
    pub fn verify(&self, value: i64) -> Result<()> {
        anyhow::ensure!(
            self.range.min <= value && value < self.range.max,
            "Relocation value {value:#x} outside of bounds [{:#x}, {:#x})",
            self.range.min,
            self.range.max
        );
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DynamicRelocationKind {
    Copy,
    Irelative,
    DtpMod,
    DtpOff,
    TlsDesc,
    TpOff,
    Relative,
    Absolute,
    GotEntry,
    JumpSlot,
}

impl DynamicRelocationKind {
    #[must_use]
    pub fn from_x86_64_r_type(r_type: u32) -> Option<Self> {
        let kind = match r_type {
            object::elf::R_X86_64_COPY => DynamicRelocationKind::Copy,
            object::elf::R_X86_64_IRELATIVE => DynamicRelocationKind::Irelative,
            object::elf::R_X86_64_DTPMOD64 => DynamicRelocationKind::DtpMod,
            object::elf::R_X86_64_DTPOFF64 => DynamicRelocationKind::DtpOff,
            object::elf::R_X86_64_TPOFF64 => DynamicRelocationKind::TpOff,
            object::elf::R_X86_64_RELATIVE => DynamicRelocationKind::Relative,
            object::elf::R_X86_64_GLOB_DAT => DynamicRelocationKind::GotEntry,
            object::elf::R_X86_64_64 => DynamicRelocationKind::Absolute,
            object::elf::R_X86_64_TLSDESC => DynamicRelocationKind::TlsDesc,
            object::elf::R_X86_64_JUMP_SLOT => DynamicRelocationKind::JumpSlot,
            _ => return None,
        };

        Some(kind)
    }

    #[must_use]
    pub fn x86_64_r_type(self) -> u32 {
        match self {
            DynamicRelocationKind::Copy => object::elf::R_X86_64_COPY,
            DynamicRelocationKind::Irelative => object::elf::R_X86_64_IRELATIVE,
            DynamicRelocationKind::DtpMod => object::elf::R_X86_64_DTPMOD64,
            DynamicRelocationKind::DtpOff => object::elf::R_X86_64_DTPOFF64,
            DynamicRelocationKind::TpOff => object::elf::R_X86_64_TPOFF64,
            DynamicRelocationKind::Relative => object::elf::R_X86_64_RELATIVE,
            DynamicRelocationKind::Absolute => object::elf::R_X86_64_64,
            DynamicRelocationKind::GotEntry => object::elf::R_X86_64_GLOB_DAT,
            DynamicRelocationKind::TlsDesc => object::elf::R_X86_64_TLSDESC,
            DynamicRelocationKind::JumpSlot => object::elf::R_X86_64_JUMP_SLOT,
        }
    }

    #[must_use]
    pub fn from_i386_r_type(r_type: u32) -> Option<Self> {
        let kind = match r_type {
            object::elf::R_386_COPY => DynamicRelocationKind::Copy,
            object::elf::R_386_IRELATIVE => DynamicRelocationKind::Irelative,
            object::elf::R_386_TLS_DTPMOD32 => DynamicRelocationKind::DtpMod,
            object::elf::R_386_TLS_DTPOFF32 => DynamicRelocationKind::DtpOff,
            object::elf::R_386_TLS_TPOFF => DynamicRelocationKind::TpOff,
            object::elf::R_386_RELATIVE => DynamicRelocationKind::Relative,
            object::elf::R_386_GLOB_DAT => DynamicRelocationKind::GotEntry,
            object::elf::R_386_32 => DynamicRelocationKind::Absolute,
            object::elf::R_386_TLS_DESC => DynamicRelocationKind::TlsDesc,
            object::elf::R_386_JMP_SLOT => DynamicRelocationKind::JumpSlot,
            _ => return None,
        };

        Some(kind)
    }

    #[must_use]
    pub fn i386_r_type(self) -> u32 {
        match self {
            DynamicRelocationKind::Copy => object::elf::R_386_COPY,
            DynamicRelocationKind::Irelative => object::elf::R_386_IRELATIVE,
            DynamicRelocationKind::DtpMod => object::elf::R_386_TLS_DTPMOD32,
            DynamicRelocationKind::DtpOff => object::elf::R_386_TLS_DTPOFF32,
            DynamicRelocationKind::TpOff => object::elf::R_386_TLS_TPOFF,
            DynamicRelocationKind::Relative => object::elf::R_386_RELATIVE,
            DynamicRelocationKind::Absolute => object::elf::R_386_32,
            DynamicRelocationKind::GotEntry => object::elf::R_386_GLOB_DAT,
            DynamicRelocationKind::TlsDesc => object::elf::R_386_TLS_DESC,
            DynamicRelocationKind::JumpSlot => object::elf::R_386_JMP_SLOT,
        }
    }
}

/// Returns whether the supplied x86-64 relocation type is one that only the dynamic loader should
/// ever see. Such a type appearing in an input object is an error, not merely unsupported.
#[must_use]
pub fn x86_64_is_dynamic_only(r_type: u32) -> bool {
    matches!(
        r_type,
        object::elf::R_X86_64_COPY
            | object::elf::R_X86_64_GLOB_DAT
            | object::elf::R_X86_64_JUMP_SLOT
            | object::elf::R_X86_64_RELATIVE
            | object::elf::R_X86_64_RELATIVE64
            | object::elf::R_X86_64_IRELATIVE
            | object::elf::R_X86_64_DTPMOD64
            | object::elf::R_X86_64_TPOFF64
            | object::elf::R_X86_64_TLSDESC
    )
}

#[must_use]
pub fn i386_is_dynamic_only(r_type: u32) -> bool {
    matches!(
        r_type,
        object::elf::R_386_COPY
            | object::elf::R_386_GLOB_DAT
            | object::elf::R_386_JMP_SLOT
            | object::elf::R_386_RELATIVE
            | object::elf::R_386_IRELATIVE
            | object::elf::R_386_TLS_DTPMOD32
            | object::elf::R_386_TLS_TPOFF
            | object::elf::R_386_TLS_TPOFF32
            | object::elf::R_386_TLS_DESC
    )
}
