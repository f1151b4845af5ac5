//! Thread-local storage access models and the link-time downgrade decision. The same decision is
//! made once during the scan pass (to decide what to allocate) and again during the apply pass (to
//! decide what to rewrite), so it must be a pure function of its inputs.

use crate::elf::RelocationKind;

/// The TLS access model requested by the compiler, most general first. Each model can be
/// downgraded to a later one when more is known at link time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsModel {
    /// Fully general access via `__tls_get_addr` with a module/offset pair in the GOT. Also
    /// covers the TLS-descriptor variant, which obeys the same downgrade rules.
    GeneralDynamic,

    /// Access to TLS variables of the module being linked, via `__tls_get_addr` with a shared
    /// module-ID GOT entry.
    LocalDynamic,

    /// Access via a static TLS offset loaded from the GOT.
    InitialExec,

    /// Direct thread-pointer-relative access. Nothing left to optimize.
    LocalExec,
}

/// What the linker may rewrite a TLS access into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsOptimization {
    /// Leave the access model alone.
    None,

    /// Rewrite the access to Initial-Exec.
    ToInitialExec,

    /// Rewrite the access to Local-Exec.
    ToLocalExec,
}

/// Decides how a TLS access can be downgraded. `is_final` means the symbol's address is fully
/// resolved at link time. Callers on the Initial-Exec path additionally treat an undefined symbol
/// referenced from an executable as final, since the runtime loader guarantees static TLS storage
/// for it; that widening belongs to the caller, not here.
#[must_use]
pub fn optimize(model: TlsModel, is_final: bool, output_is_shared: bool) -> TlsOptimization {
    // Nothing can be optimized across a shared-object boundary: another module may be the one
    // that defines the variable at runtime.
    if output_is_shared {
        return TlsOptimization::None;
    }

    match model {
        TlsModel::GeneralDynamic => {
            if is_final {
                TlsOptimization::ToLocalExec
            } else {
                TlsOptimization::ToInitialExec
            }
        }
        // We're linking an executable, so all of this module's TLS variables are in the static
        // block.
        TlsModel::LocalDynamic => TlsOptimization::ToLocalExec,
        TlsModel::InitialExec => {
            if is_final {
                TlsOptimization::ToLocalExec
            } else {
                TlsOptimization::None
            }
        }
        TlsModel::LocalExec => TlsOptimization::None,
    }
}

/// Returns the access model a relocation kind belongs to, or `None` for non-TLS kinds.
#[must_use]
pub fn model_for_relocation(kind: RelocationKind) -> Option<TlsModel> {
    match kind {
        RelocationKind::TlsGd
        | RelocationKind::TlsGdGotBase
        | RelocationKind::TlsDesc
        | RelocationKind::TlsDescGotBase
        | RelocationKind::TlsDescCall => Some(TlsModel::GeneralDynamic),
        RelocationKind::TlsLd | RelocationKind::TlsLdGotBase | RelocationKind::DtpOff => {
            Some(TlsModel::LocalDynamic)
        }
        RelocationKind::GotTpOff
        | RelocationKind::GotTpOffGot
        | RelocationKind::GotTpOffGotBase => Some(TlsModel::InitialExec),
        RelocationKind::TpOff | RelocationKind::TpOffNegated => Some(TlsModel::LocalExec),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_MODELS: [TlsModel; 4] = [
        TlsModel::GeneralDynamic,
        TlsModel::LocalDynamic,
        TlsModel::InitialExec,
        TlsModel::LocalExec,
    ];

    #[test]
    fn shared_output_never_optimizes() {
        for model in ALL_MODELS {
            for is_final in [false, true] {
                assert_eq!(optimize(model, is_final, true), TlsOptimization::None);
            }
        }
    }

    #[test]
    fn executable_downgrades() {
        assert_eq!(
            optimize(TlsModel::GeneralDynamic, true, false),
            TlsOptimization::ToLocalExec
        );
        assert_eq!(
            optimize(TlsModel::GeneralDynamic, false, false),
            TlsOptimization::ToInitialExec
        );
        assert_eq!(
            optimize(TlsModel::LocalDynamic, false, false),
            TlsOptimization::ToLocalExec
        );
        assert_eq!(
            optimize(TlsModel::InitialExec, true, false),
            TlsOptimization::ToLocalExec
        );
        assert_eq!(optimize(TlsModel::InitialExec, false, false), TlsOptimization::None);
        assert_eq!(optimize(TlsModel::LocalExec, true, false), TlsOptimization::None);
    }

    #[test]
    fn deterministic() {
        for model in ALL_MODELS {
            for is_final in [false, true] {
                for shared in [false, true] {
                    assert_eq!(
                        optimize(model, is_final, shared),
                        optimize(model, is_final, shared)
                    );
                }
            }
        }
    }
}
