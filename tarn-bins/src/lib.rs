//! Shared setup code for the tarn binaries.

pub mod common;
