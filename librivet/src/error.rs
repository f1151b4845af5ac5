pub(crate) use anyhow::Error;
use std::fmt::Display;

pub type Result<T = (), E = Error> = core::result::Result<T, E>;

/// Like debug_assert, but bails instead of panicking.
///
/// Returning an error often allows us to give more context as to what we were trying to do, e.g.
/// which file / symbol we were processing, whereas a panic just gives us a function backtrace.
#[macro_export]
macro_rules! debug_assert_bail {
    ($e:expr, $($rest:tt)*) => {
        if cfg!(debug_assertions) && !$e {
            anyhow::bail!($($rest)*);
        }
    };
}

/// A relocation type this backend doesn't handle. Fatal for the object it came from; scanning of
/// other objects continues so that all such diagnostics are gathered in one run.
#[derive(Debug, Clone)]
pub struct UnsupportedRelocation {
    pub rel_type: String,
    pub object: String,
}

impl Display for UnsupportedRelocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: unsupported relocation {}", self.object, self.rel_type)
    }
}

impl core::error::Error for UnsupportedRelocation {}

/// A relocation type that only the dynamic loader should ever produce, found in an input object.
#[derive(Debug, Clone)]
pub struct UnexpectedRuntimeRelocation {
    pub rel_type: String,
    pub object: String,
}

impl Display for UnexpectedRuntimeRelocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: relocation {} is only meaningful to the dynamic loader",
            self.object, self.rel_type
        )
    }
}

impl core::error::Error for UnexpectedRuntimeRelocation {}

/// A computed relocation value that doesn't fit the field being written. Reported, then the link
/// continues so that every overflow in the input is diagnosed; the link still fails overall.
#[derive(Debug, Clone)]
pub struct RelocationOverflow {
    /// Name of the referenced symbol, or "local symbol N in <object>" when it has no name.
    pub symbol: String,
    pub value: i64,
}

impl Display for RelocationOverflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "relocation value {:#x} for `{}` does not fit its field",
            self.value, self.symbol
        )
    }
}

impl core::error::Error for RelocationOverflow {}

/// Two incompatible TLS conventions used in the same section.
#[derive(Debug, Clone)]
pub struct TlsModelConflict {
    pub object: String,
}

impl Display for TlsModelConflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: both SUN and GNU model TLS relocations in one section",
            self.object
        )
    }
}

impl core::error::Error for TlsModelConflict {}

/// The bytes around a TLS relocation didn't match any instruction sequence we know how to
/// rewrite. The rewrite is mandatory once the access model has been downgraded, so this input was
/// not produced by a compiler this backend supports.
#[derive(Debug, Clone)]
pub struct OpcodePatternMismatch {
    pub rel_type: String,
    pub object: String,
    pub offset: u64,
}

impl Display for OpcodePatternMismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: unrecognised instruction sequence for {} at offset {:#x}",
            self.object, self.rel_type, self.offset
        )
    }
}

impl core::error::Error for OpcodePatternMismatch {}
