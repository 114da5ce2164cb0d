//! Target enumeration: counting, CIDR expansion and per-CIDR sampling
//!
//! Enumeration is a strict single pass. The total is computed up front in
//! its own pass so progress can be reported against a fixed denominator,
//! then [`TargetStream`] walks the same source again and yields addresses
//! one at a time without ever materializing a whole CIDR block.

use crate::utils::target_parser::{classify_token, clean_line, TargetSpec};
use ipnetwork::Ipv4Network;
use std::collections::VecDeque;
use std::net::Ipv4Addr;
use tokio_util::sync::CancellationToken;

/// How CIDR blocks are turned into addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expansion {
    /// Every address in the block
    Full,
    /// A uniform sample of this many distinct addresses per block
    Sample(u32),
}

impl Expansion {
    /// Resolve the effective expansion for a source.
    ///
    /// Sampling only applies to pure-CIDR sources: as soon as the input
    /// carries a plain address, the whole source is expanded fully so the
    /// listed addresses are all actually scanned.
    pub fn resolve(random_per_cidr: u32, source_has_plain_ip: bool) -> Self {
        if random_per_cidr > 0 && !source_has_plain_ip {
            Expansion::Sample(random_per_cidr)
        } else {
            Expansion::Full
        }
    }
}

/// Number of addresses in a block, network and broadcast included
pub fn network_size(net: Ipv4Network) -> u64 {
    1u64 << (32 - net.prefix())
}

/// Base address of a block with host bits masked off
fn cidr_base(net: Ipv4Network) -> u32 {
    u32::from(net.network())
}

/// Check whether any token in the source is a plain address
pub fn source_has_plain_ip(lines: impl Iterator<Item = String>) -> bool {
    for line in lines {
        for token in clean_line(&line) {
            if matches!(classify_token(token), Some(TargetSpec::Ip(_))) {
                return true;
            }
        }
    }
    false
}

/// Count the addresses enumeration will yield, without yielding them
pub fn count_targets(lines: impl Iterator<Item = String>, expansion: Expansion) -> u64 {
    let mut total = 0u64;
    for line in lines {
        for token in clean_line(&line) {
            match classify_token(token) {
                Some(TargetSpec::Ip(_)) => total += 1,
                Some(TargetSpec::Cidr(net)) => {
                    let size = network_size(net);
                    total += match expansion {
                        Expansion::Sample(k) => size.min(k as u64),
                        Expansion::Full => size,
                    };
                }
                None => {}
            }
        }
    }
    total
}

/// Draw distinct random addresses from a block.
///
/// The draw is clamped to the block size, so small blocks simply yield
/// every address in random order.
pub fn sample_cidr(net: Ipv4Network, k: u32) -> Vec<String> {
    let size = network_size(net);
    let amount = (k as u64).min(size) as usize;
    if amount == 0 {
        return Vec::new();
    }

    let base = cidr_base(net);
    let mut rng = rand::thread_rng();
    rand::seq::index::sample(&mut rng, size as usize, amount)
        .into_iter()
        .map(|offset| Ipv4Addr::from(base.wrapping_add(offset as u32)).to_string())
        .collect()
}

struct CidrWalk {
    base: u32,
    size: u64,
    next: u64,
}

/// Lazy, cancellable address stream over a token source.
///
/// Yields addresses in input order; each CIDR block is walked (or its
/// sample drained) before the next token is looked at. Once the
/// cancellation token fires the stream stops at the next yield point.
pub struct TargetStream {
    lines: Box<dyn Iterator<Item = String> + Send>,
    line_tokens: VecDeque<String>,
    walk: Option<CidrWalk>,
    sampled: VecDeque<String>,
    expansion: Expansion,
    cancel: CancellationToken,
}

impl TargetStream {
    pub fn new(
        lines: Box<dyn Iterator<Item = String> + Send>,
        expansion: Expansion,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            lines,
            line_tokens: VecDeque::new(),
            walk: None,
            sampled: VecDeque::new(),
            expansion,
            cancel,
        }
    }

    fn next_token(&mut self) -> Option<String> {
        loop {
            if let Some(token) = self.line_tokens.pop_front() {
                return Some(token);
            }
            let line = self.lines.next()?;
            self.line_tokens = clean_line(&line).map(str::to_string).collect();
        }
    }
}

impl Iterator for TargetStream {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        loop {
            if self.cancel.is_cancelled() {
                return None;
            }

            if let Some(ip) = self.sampled.pop_front() {
                return Some(ip);
            }

            if let Some(walk) = &mut self.walk {
                if walk.next < walk.size {
                    let addr = Ipv4Addr::from(walk.base.wrapping_add(walk.next as u32));
                    walk.next += 1;
                    return Some(addr.to_string());
                }
                self.walk = None;
            }

            let token = self.next_token()?;
            match classify_token(&token) {
                Some(TargetSpec::Ip(ip)) => return Some(ip),
                Some(TargetSpec::Cidr(net)) => match self.expansion {
                    Expansion::Sample(k) => self.sampled = sample_cidr(net, k).into(),
                    Expansion::Full => {
                        self.walk = Some(CidrWalk {
                            base: cidr_base(net),
                            size: network_size(net),
                            next: 0,
                        });
                    }
                },
                None => {}
            }
        }
    }
}
