mod comparison;
mod provider;

pub use comparison::*;
pub use provider::*;
