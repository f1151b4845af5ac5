//! Link options that affect relocation processing. Option parsing itself happens in the driver;
//! this is the already-digested form the engine consumes.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    StaticExecutable(RelocationModel),
    DynamicExecutable(RelocationModel),
    SharedObject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocationModel {
    /// Output assumes a fixed load address.
    NonRelocatable,

    /// Output can be loaded at an arbitrary address (PIE or shared object).
    Relocatable,
}

impl OutputKind {
    #[must_use]
    pub fn is_executable(self) -> bool {
        !matches!(self, OutputKind::SharedObject)
    }

    #[must_use]
    pub fn is_static_executable(self) -> bool {
        matches!(self, OutputKind::StaticExecutable(_))
    }

    #[must_use]
    pub fn is_shared_object(self) -> bool {
        matches!(self, OutputKind::SharedObject)
    }

    #[must_use]
    pub fn is_relocatable(self) -> bool {
        matches!(
            self,
            OutputKind::StaticExecutable(RelocationModel::Relocatable)
                | OutputKind::DynamicExecutable(RelocationModel::Relocatable)
                | OutputKind::SharedObject
        )
    }

    #[must_use]
    pub fn needs_dynsym(self) -> bool {
        !self.is_static_executable()
    }
}

/// Which PLT trampoline layout to emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PltVariant {
    /// The standard 16-byte psABI layout.
    #[default]
    Standard,

    /// The hardened layout: landing-pad instructions, padded entries.
    Hardened,
}

#[derive(Debug, Clone)]
pub struct Args {
    pub output_kind: OutputKind,

    /// Whether to apply relocation optimisations beyond the mandatory ones.
    pub relax: bool,

    /// Whether direct references to symbols in shared objects may be satisfied by copying the
    /// symbol into the output's own writable storage.
    pub allow_copy_relocations: bool,

    pub plt_variant: PltVariant,
}

impl Args {
    #[must_use]
    pub fn new(output_kind: OutputKind) -> Self {
        Self {
            output_kind,
            relax: true,
            allow_copy_relocations: true,
            plt_variant: PltVariant::Standard,
        }
    }

    #[must_use]
    pub fn output_kind(&self) -> OutputKind {
        self.output_kind
    }
}
