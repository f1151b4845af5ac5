#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocationModifier {
    Normal,

    /// The relocation just processed consumed its successor as well (e.g. the call half of a
    /// general-dynamic TLS sequence). The next relocation must not be processed independently.
    SkipNextRelocation,
}
