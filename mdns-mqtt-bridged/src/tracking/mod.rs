//! Lock-owning tables keyed by service identity. Each holds at most one entry
//! per identity and never hands out the underlying map.

pub mod announced;
pub mod published;
