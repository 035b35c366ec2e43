pub mod runtime;
pub mod token;
