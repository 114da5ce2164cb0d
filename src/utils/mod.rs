//! Utility modules for the scanner

pub mod file_input;
pub mod target_parser;
