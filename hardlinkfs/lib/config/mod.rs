//! Driver configuration, ID mappings and defaults.

mod defaults;
mod idmap;
mod options;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use defaults::*;
pub use idmap::*;
pub use options::*;
