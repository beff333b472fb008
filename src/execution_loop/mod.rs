pub mod error_recovery;
pub mod repair_loop;

pub use error_recovery::*;
pub use repair_loop::*;
