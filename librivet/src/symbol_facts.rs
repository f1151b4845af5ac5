//! Per-symbol state shared by every relocation that references the same symbol. There is exactly
//! one record per symbol identity for the whole link. The GOT/PLT slot fields are write-once:
//! all writes go through the table allocators, which re-return the existing slot on a second
//! request rather than allocating again.

use crate::error::Result;
use crate::got::GotRef;
use crate::plt::PltRef;
use anyhow::Context as _;
use anyhow::bail;
use bitflags::bitflags;
use std::num::NonZeroU32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SymbolId(u32);

impl SymbolId {
    #[must_use]
    pub fn from_usize(value: usize) -> Self {
        Self(value as u32)
    }

    #[must_use]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for SymbolId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

/// The range of symbol IDs assigned to one input object's local symbol table.
#[derive(Debug, Clone, Copy)]
pub struct SymbolIdRange {
    start: u32,
    count: u32,
}

impl SymbolIdRange {
    #[must_use]
    pub fn input_to_id(&self, local_index: usize) -> SymbolId {
        debug_assert!(local_index < self.count as usize);
        SymbolId(self.start + local_index as u32)
    }

    #[must_use]
    pub fn id_to_input(&self, id: SymbolId) -> usize {
        (id.0 - self.start) as usize
    }

    #[must_use]
    pub fn contains(&self, id: SymbolId) -> bool {
        (self.start..self.start + self.count).contains(&id.0)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.count as usize
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

bitflags! {
    /// What is known about a symbol's value at link time. Comes partly from the object that
    /// defines the symbol and partly from symbol resolution.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ValueFlags: u16 {
        /// An absolute value that won't change depending on load address.
        const ABSOLUTE = 1 << 0;

        /// The value comes from a shared (dynamic) object; it won't be known until runtime.
        const DYNAMIC = 1 << 1;

        /// The value refers to an ifunc; the actual address is computed by a resolver at runtime.
        const IFUNC = 1 << 2;

        /// The definition is final and cannot be overridden at runtime.
        const NON_INTERPOSABLE = 1 << 3;

        /// The value is a function.
        const FUNCTION = 1 << 4;

        /// No definition was found for the symbol.
        const UNDEFINED = 1 << 5;
    }
}

impl ValueFlags {
    #[must_use]
    pub fn is_dynamic(self) -> bool {
        self.contains(ValueFlags::DYNAMIC)
    }

    #[must_use]
    pub fn is_ifunc(self) -> bool {
        self.contains(ValueFlags::IFUNC)
    }

    #[must_use]
    pub fn is_absolute(self) -> bool {
        self.contains(ValueFlags::ABSOLUTE)
    }

    #[must_use]
    pub fn is_function(self) -> bool {
        self.contains(ValueFlags::FUNCTION)
    }

    #[must_use]
    pub fn is_undefined(self) -> bool {
        self.contains(ValueFlags::UNDEFINED)
    }

    #[must_use]
    pub fn is_interposable(self) -> bool {
        !self.contains(ValueFlags::NON_INTERPOSABLE)
    }

    /// Whether the value will have an address that is known once layout has run. This is as
    /// opposed to values that aren't addresses and values not knowable until runtime.
    #[must_use]
    pub fn is_address(self) -> bool {
        !self.intersects(
            ValueFlags::IFUNC | ValueFlags::DYNAMIC | ValueFlags::ABSOLUTE | ValueFlags::UNDEFINED,
        )
    }

    /// Whether references can skip the GOT/PLT and use the symbol's address directly.
    #[must_use]
    pub fn can_bypass_got(self) -> bool {
        !self.is_interposable() && !self.is_dynamic() && !self.is_ifunc() && !self.is_undefined()
    }

    /// Whether the symbol's address is fully resolved at link time, for TLS optimization
    /// purposes.
    #[must_use]
    pub fn is_final(self) -> bool {
        !self.is_interposable() && !self.is_dynamic() && !self.is_undefined()
    }
}

impl std::fmt::Display for ValueFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        bitflags::parser::to_writer(self, f)
    }
}

/// Which kind of GOT slot a symbol owns. A symbol can own at most one slot of each kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GotSlotKind {
    /// A single pointer-sized slot holding the symbol's address.
    Standard,

    /// A single slot holding the symbol's static TLS offset.
    TlsOffset,

    /// A module-ID/offset pair for general-dynamic TLS access.
    TlsPair,

    /// A function/argument pair for TLS-descriptor access.
    TlsDesc,
}

impl GotSlotKind {
    pub(crate) const COUNT: usize = 4;

    pub(crate) fn index(self) -> usize {
        match self {
            GotSlotKind::Standard => 0,
            GotSlotKind::TlsOffset => 1,
            GotSlotKind::TlsPair => 2,
            GotSlotKind::TlsDesc => 3,
        }
    }
}

#[derive(Debug, Clone)]
struct SymbolFact {
    value_flags: ValueFlags,

    /// The symbol's link-time value once layout has assigned addresses. Zero until then and for
    /// symbols whose value is only known at runtime.
    raw_value: u64,

    name: Option<String>,

    dynamic_symbol_index: Option<NonZeroU32>,

    plt: Option<PltRef>,

    got: [Option<GotRef>; GotSlotKind::COUNT],

    needs_copy_relocation: bool,
}

#[derive(Debug, Default)]
pub struct SymbolFacts {
    facts: Vec<SymbolFact>,

    /// Canonical definition for each symbol. An object's reference to a global resolves to the
    /// record of whichever file defines it, so every reference to one symbol identity shares one
    /// set of slots. Defaults to the symbol itself.
    definitions: Vec<u32>,

    /// One entry per registered object, used to describe nameless locals in diagnostics.
    object_ranges: Vec<(SymbolIdRange, String)>,
}

impl SymbolFacts {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an input object's local symbol table and returns the ID range assigned to it.
    pub fn add_object_symbols(&mut self, object_name: &str, count: usize) -> SymbolIdRange {
        let range = SymbolIdRange {
            start: self.facts.len() as u32,
            count: count as u32,
        };
        self.facts.extend((0..count).map(|_| SymbolFact {
            value_flags: ValueFlags::empty(),
            raw_value: 0,
            name: None,
            dynamic_symbol_index: None,
            plt: None,
            got: [None; GotSlotKind::COUNT],
            needs_copy_relocation: false,
        }));
        self.definitions
            .extend(range.start..range.start + range.count);
        self.object_ranges.push((range, object_name.to_owned()));
        range
    }

    /// Registers a single (global) symbol and returns its ID.
    pub fn add_symbol(&mut self, name: Option<&str>, value_flags: ValueFlags) -> SymbolId {
        let id = SymbolId(self.facts.len() as u32);
        self.facts.push(SymbolFact {
            value_flags,
            raw_value: 0,
            name: name.map(str::to_owned),
            dynamic_symbol_index: None,
            plt: None,
            got: [None; GotSlotKind::COUNT],
            needs_copy_relocation: false,
        });
        self.definitions.push(id.0);
        id
    }

    /// Points a reference (typically an object's undefined symbol-table entry) at the canonical
    /// definition name resolution chose for it.
    pub fn set_definition(&mut self, reference: SymbolId, canonical: SymbolId) {
        self.definitions[reference.as_usize()] = canonical.0;
    }

    /// The canonical record for a symbol reference.
    #[must_use]
    pub fn definition(&self, id: SymbolId) -> SymbolId {
        SymbolId(self.definitions[id.as_usize()])
    }

    #[must_use]
    pub fn num_symbols(&self) -> usize {
        self.facts.len()
    }

    pub fn set_value_flags(&mut self, id: SymbolId, flags: ValueFlags) {
        self.facts[id.as_usize()].value_flags = flags;
    }

    #[must_use]
    pub fn value_flags(&self, id: SymbolId) -> ValueFlags {
        self.facts[id.as_usize()].value_flags
    }

    /// Assigns the symbol's address once layout has run. Must happen before the apply pass reads
    /// values.
    pub fn define_symbol_value(&mut self, id: SymbolId, value: u64) {
        self.facts[id.as_usize()].raw_value = value;
    }

    #[must_use]
    pub fn value(&self, id: SymbolId) -> u64 {
        self.facts[id.as_usize()].raw_value
    }

    pub fn set_dynamic_symbol_index(&mut self, id: SymbolId, index: NonZeroU32) {
        self.facts[id.as_usize()].dynamic_symbol_index = Some(index);
    }

    pub fn dynamic_symbol_index(&self, id: SymbolId) -> Result<u32> {
        Ok(self.facts[id.as_usize()]
            .dynamic_symbol_index
            .with_context(|| format!("Missing dynamic symbol index for {}", self.symbol_debug(id)))?
            .get())
    }

    #[must_use]
    pub fn optional_dynamic_symbol_index(&self, id: SymbolId) -> u32 {
        self.facts[id.as_usize()]
            .dynamic_symbol_index
            .map_or(0, NonZeroU32::get)
    }

    /// A printable identity for diagnostics: the symbol's name, or "local symbol N in O".
    #[must_use]
    pub fn symbol_debug(&self, id: SymbolId) -> String {
        if let Some(name) = &self.facts[id.as_usize()].name {
            return name.clone();
        }
        for (range, object_name) in &self.object_ranges {
            if range.contains(id) {
                return format!("local symbol {} in {object_name}", range.id_to_input(id));
            }
        }
        format!("symbol {id}")
    }

    #[must_use]
    pub fn plt_ref(&self, id: SymbolId) -> Option<PltRef> {
        self.facts[id.as_usize()].plt
    }

    #[must_use]
    pub fn got_ref(&self, id: SymbolId, kind: GotSlotKind) -> Option<GotRef> {
        self.facts[id.as_usize()].got[kind.index()]
    }

    #[must_use]
    pub fn needs_copy_relocation(&self, id: SymbolId) -> bool {
        self.facts[id.as_usize()].needs_copy_relocation
    }

    pub(crate) fn record_copy_relocation(&mut self, id: SymbolId) -> bool {
        let fact = &mut self.facts[id.as_usize()];
        let first = !fact.needs_copy_relocation;
        fact.needs_copy_relocation = true;
        first
    }

    /// Records the symbol's PLT slot. Only the PLT allocator calls this; a conflicting second
    /// write means slot accounting has gone wrong.
    pub(crate) fn record_plt(&mut self, id: SymbolId, plt: PltRef) -> Result {
        if let Some(existing) = self.facts[id.as_usize()].plt {
            if existing != plt {
                bail!(
                    "PLT slot for {} allocated twice ({existing:?} vs {plt:?})",
                    self.symbol_debug(id)
                );
            }
            return Ok(());
        }
        self.facts[id.as_usize()].plt = Some(plt);
        Ok(())
    }

    /// Records one of the symbol's GOT slots; same write-once contract as `record_plt`.
    pub(crate) fn record_got(&mut self, id: SymbolId, kind: GotSlotKind, got: GotRef) -> Result {
        if let Some(existing) = self.facts[id.as_usize()].got[kind.index()] {
            if existing != got {
                bail!(
                    "{kind:?} GOT slot for {} allocated twice ({existing:?} vs {got:?})",
                    self.symbol_debug(id)
                );
            }
            return Ok(());
        }
        self.facts[id.as_usize()].got[kind.index()] = Some(got);
        Ok(())
    }
}
