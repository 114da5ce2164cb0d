//! Hit files: plain-text outputs meant for downstream tooling
//!
//! Both files are line oriented and flushed per hit, so `tail -f` and
//! pipelines see resolvers the moment they are confirmed.

use crate::ScanError;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use std::str::FromStr;

/// Layout of the real-test hit file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RealTestFormat {
    /// One address per line
    #[default]
    Ip,
    /// Address and round-trip milliseconds per line
    IpMs,
}

impl FromStr for RealTestFormat {
    type Err = ScanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ip" => Ok(RealTestFormat::Ip),
            "ipms" => Ok(RealTestFormat::IpMs),
            other => Err(ScanError::ConfigError(format!(
                "Unknown realtest output format: {}",
                other
            ))),
        }
    }
}

/// Optional hit files for probe hits and real-test passes
pub struct OutputWriters {
    scan_ok: Option<File>,
    realtest_ok: Option<File>,
    format: RealTestFormat,
}

impl OutputWriters {
    /// Open the requested hit files, creating parent directories as needed.
    /// Existing files are truncated.
    pub fn new(
        scan_ok: Option<&Path>,
        realtest_ok: Option<&Path>,
        format: RealTestFormat,
    ) -> crate::Result<Self> {
        Ok(Self {
            scan_ok: scan_ok.map(open_hit_file).transpose()?,
            realtest_ok: realtest_ok.map(open_hit_file).transpose()?,
            format,
        })
    }

    /// Record a resolver that answered the DNS probe
    pub fn write_scan_ok(&mut self, target: &str) -> crate::Result<()> {
        if let Some(file) = &mut self.scan_ok {
            writeln!(file, "{}", target).map_err(|e| write_error("scan", e))?;
            file.flush().map_err(|e| write_error("scan", e))?;
        }
        Ok(())
    }

    /// Record a resolver that passed the real test
    pub fn write_realtest_ok(&mut self, target: &str, elapsed_ms: i64) -> crate::Result<()> {
        if let Some(file) = &mut self.realtest_ok {
            match self.format {
                RealTestFormat::Ip => writeln!(file, "{}", target),
                RealTestFormat::IpMs => writeln!(file, "{} {}", target, elapsed_ms),
            }
            .map_err(|e| write_error("real test", e))?;
            file.flush().map_err(|e| write_error("real test", e))?;
        }
        Ok(())
    }
}

fn open_hit_file(path: &Path) -> crate::Result<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| {
                ScanError::OutputError(format!("Cannot create {}: {}", parent.display(), e))
            })?;
        }
    }
    File::create(path)
        .map_err(|e| ScanError::OutputError(format!("Cannot open {}: {}", path.display(), e)))
}

fn write_error(kind: &str, e: std::io::Error) -> ScanError {
    ScanError::OutputError(format!("Cannot write {} hit: {}", kind, e))
}
