//! File and stdin input for scan targets
//!
//! Target files are read line by line and never fully loaded: a single
//! line may expand into an entire CIDR block, so enumeration streams from
//! the file all the way down to the probe queue. Bytes that are not valid
//! UTF-8 are replaced and the affected tokens fall out during
//! classification.

use crate::utils::target_parser::{is_ip, strip_port};
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

/// Where raw target tokens come from
#[derive(Debug, Clone)]
pub enum TokenSource {
    /// A file with one or more tokens per line
    File(PathBuf),
    /// Tokens given directly, e.g. from the command line or stdin
    Tokens(Vec<String>),
}

impl TokenSource {
    /// Open a fresh line iterator over this source.
    ///
    /// Sources are read once per pass; counting and enumeration each take
    /// their own pass.
    pub fn line_iter(&self) -> crate::Result<Box<dyn Iterator<Item = String> + Send>> {
        match self {
            TokenSource::File(path) => {
                let file = File::open(path)?;
                Ok(Box::new(LossyLines::new(BufReader::new(file))))
            }
            TokenSource::Tokens(tokens) => Ok(Box::new(tokens.clone().into_iter())),
        }
    }
}

/// Line iterator that replaces invalid UTF-8 instead of failing
pub struct LossyLines<R> {
    reader: R,
}

impl<R: BufRead> LossyLines<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }
}

impl<R: BufRead> Iterator for LossyLines<R> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        let mut buf = Vec::new();
        match self.reader.read_until(b'\n', &mut buf) {
            Ok(0) => None,
            Ok(_) => {
                if buf.last() == Some(&b'\n') {
                    buf.pop();
                    if buf.last() == Some(&b'\r') {
                        buf.pop();
                    }
                }
                Some(String::from_utf8_lossy(&buf).into_owned())
            }
            Err(e) => {
                log::warn!("Read error on target source: {}", e);
                None
            }
        }
    }
}

/// Read one address per line, as the realtest command expects.
///
/// Ports are stripped, lines that are not addresses are skipped, and
/// duplicates are dropped while preserving first-seen order.
pub fn read_ip_lines<R: BufRead>(reader: R) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut ips = Vec::new();

    for line in LossyLines::new(reader) {
        let bare = strip_port(line.trim());
        if is_ip(bare) && seen.insert(bare.to_string()) {
            ips.push(bare.to_string());
        }
    }

    ips
}

/// Read the realtest address list from a file
pub fn read_ip_file<P: AsRef<Path>>(path: P) -> crate::Result<Vec<String>> {
    let file = File::open(&path)?;
    Ok(read_ip_lines(BufReader::new(file)))
}
