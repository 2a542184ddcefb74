pub mod common;
pub mod config;
pub mod convert;
pub mod data_loader;
pub mod error;
pub mod images;
pub mod pickle;
pub mod recorders;

#[cfg(test)]
mod testing;
