//! Receive side: fragment reassembly and metadata extraction.

pub mod assembler;
pub mod meta;

pub use assembler::{AsmState, MAX_FRAGS, Pushed, RxAssembler, RxPacket, SopPolicy};
pub use meta::{MOD_DEFAULT_DMAC, MetaContext, MetaError, ReasonCounters, RxMeta, extract, reason};
