//! Slipscan - find DNS resolvers that carry a slipstream tunnel
//!
//! Sweeps large address ranges with randomized DNS probes, then verifies
//! responsive resolvers by driving a real slipstream client and opening a
//! TLS connection through its local SOCKS5 endpoint.

pub mod config;
pub mod error;
pub mod events;
pub mod output;
pub mod probe;
pub mod realtest;
pub mod scanner;
pub mod utils;

// Re-export commonly used types
pub use config::{RealTestConfig, ScanConfig};
pub use error::{ScanError, ScanResult};
pub use events::ScanEvent;
pub use realtest::{Orchestrator, RealTestMode, RealTestResult};
pub use scanner::engine::ScanEngine;
pub use scanner::Counters;

pub type Result<T> = std::result::Result<T, ScanError>;
