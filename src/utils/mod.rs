//! Helper utilities, functions, and macros.

#[macro_use]
mod print;

mod error;

pub use error::TillerError;
