pub mod env;
pub mod ewma;
pub mod flags;
pub mod ranges;
pub mod single;
