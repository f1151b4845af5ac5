//! Low-level pieces of the relocation engine that are useful outside it: the semantic relocation
//! model, the TLS access-model optimizer, and the per-architecture instruction rewrites. Kept
//! separate from the engine so that diffing and inspection tools can share them.

pub mod elf;
pub mod i386;
pub mod relaxation;
pub mod tls;
pub mod x86_64;
