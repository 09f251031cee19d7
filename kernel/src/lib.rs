// VTMD Kernel
//
// History catalogs for system-versioned tables: every versioned table has
// a companion catalog recording the names it lived under and where the
// rows of each closed epoch were archived.

pub mod config;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod invariants;
pub mod record;
pub mod replay;
pub mod session;
pub mod trx;
pub mod vtmd;
