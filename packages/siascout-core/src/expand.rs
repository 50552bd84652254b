//! CIDR decomposition into fixed-size units of work.
//!
//! Blocks coarser than the granularity prefix are split into the exact,
//! non-overlapping set of granularity-length sub-blocks covering them;
//! blocks at or finer than the granularity pass through unchanged.

use anyhow::{Context, Result};
use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use std::fs;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::Path;
use thiserror::Error;

/// Prefix length at which blocks become atomic units of work.
pub const GRANULARITY: u8 = 24;

#[derive(Debug, Error)]
#[error("invalid CIDR '{line}': {reason}")]
pub struct FormatError {
    pub line: String,
    pub reason: String,
}

/// Parse one target line into a canonical network (host bits masked off).
pub fn parse_block(s: &str) -> Result<IpNetwork, FormatError> {
    let net: IpNetwork = s.parse().map_err(|e| FormatError {
        line: s.to_string(),
        reason: format!("{}", e),
    })?;

    // Canonicalize so the cache key is stable regardless of how the
    // operator wrote the line.
    let canonical = match net {
        IpNetwork::V4(v4) => Ipv4Network::new(v4.network(), v4.prefix())
            .map(IpNetwork::V4)
            .expect("prefix already validated"),
        IpNetwork::V6(v6) => Ipv6Network::new(v6.network(), v6.prefix())
            .map(IpNetwork::V6)
            .expect("prefix already validated"),
    };

    if canonical != net {
        tracing::debug!("Masked host bits: {} -> {}", s, canonical);
    }
    Ok(canonical)
}

/// Expand a block into granularity-sized sub-blocks.
///
/// The result exactly partitions the input: 2^(G - prefix) sub-blocks with
/// no gaps and no overlap. Blocks already at or finer than the granularity
/// are returned unchanged as a single-element vector.
pub fn expand_block(net: IpNetwork) -> Vec<IpNetwork> {
    match net {
        IpNetwork::V4(v4) if v4.prefix() < GRANULARITY => {
            let base = u32::from(v4.network());
            let count = 1u32 << (GRANULARITY - v4.prefix());
            let step = 1u32 << (32 - GRANULARITY);
            (0..count)
                .map(|i| {
                    let addr = Ipv4Addr::from(base + i * step);
                    IpNetwork::V4(
                        Ipv4Network::new(addr, GRANULARITY).expect("granularity prefix is valid"),
                    )
                })
                .collect()
        }
        IpNetwork::V6(v6) if v6.prefix() < GRANULARITY => {
            let base = u128::from(v6.network());
            let count = 1u128 << (GRANULARITY - v6.prefix());
            let step = 1u128 << (128 - GRANULARITY);
            (0..count)
                .map(|i| {
                    let addr = Ipv6Addr::from(base + i * step);
                    IpNetwork::V6(
                        Ipv6Network::new(addr, GRANULARITY).expect("granularity prefix is valid"),
                    )
                })
                .collect()
        }
        _ => vec![net],
    }
}

/// Read the target list: one CIDR per line, blank lines and `#` comments
/// ignored, malformed lines logged and skipped. Re-reads the file on every
/// invocation.
pub fn read_targets(path: &Path) -> Result<Vec<IpNetwork>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read target list {:?}", path))?;

    let mut targets = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match parse_block(line) {
            Ok(net) => targets.push(net),
            Err(e) => tracing::error!("Skipping malformed target line: {}", e),
        }
    }
    Ok(targets)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(s: &str) -> IpNetwork {
        s.parse().unwrap()
    }

    #[test]
    fn slash_22_partitions_into_four_slash_24s() {
        let blocks = expand_block(parse_block("203.0.113.0/22").unwrap());
        assert_eq!(blocks.len(), 4);
        assert_eq!(blocks[0], v4("203.0.112.0/24"));
        assert_eq!(blocks[1], v4("203.0.113.0/24"));
        assert_eq!(blocks[2], v4("203.0.114.0/24"));
        assert_eq!(blocks[3], v4("203.0.115.0/24"));
    }

    #[test]
    fn partition_has_no_gaps_or_overlaps() {
        let parent: Ipv4Network = "198.51.0.0/16".parse().unwrap();
        let blocks = expand_block(IpNetwork::V4(parent));
        assert_eq!(blocks.len(), 256);

        let mut expected = u32::from(parent.network());
        for block in &blocks {
            let IpNetwork::V4(b) = *block else {
                panic!("expected v4 block")
            };
            assert_eq!(b.prefix(), GRANULARITY);
            assert_eq!(u32::from(b.network()), expected);
            expected += 256;
        }
        // One address past the parent's broadcast
        assert_eq!(expected, u32::from(parent.network()) + parent.size());
    }

    #[test]
    fn block_at_granularity_passes_through() {
        let net = v4("192.0.2.0/24");
        assert_eq!(expand_block(net), vec![net]);
    }

    #[test]
    fn block_finer_than_granularity_passes_through() {
        let net = v4("192.0.2.128/25");
        assert_eq!(expand_block(net), vec![net]);
    }

    #[test]
    fn ipv6_coarser_than_granularity_expands() {
        let blocks = expand_block(parse_block("2001:db8::/20").unwrap());
        assert_eq!(blocks.len(), 16);
        for block in &blocks {
            assert_eq!(block.prefix(), GRANULARITY);
        }
    }

    #[test]
    fn ipv6_finer_than_granularity_passes_through() {
        let net: IpNetwork = "2001:db8::/64".parse().unwrap();
        assert_eq!(expand_block(net), vec![net]);
    }

    #[test]
    fn host_bits_are_masked_to_canonical_form() {
        let net = parse_block("10.0.0.99/8").unwrap();
        assert_eq!(net, v4("10.0.0.0/8"));
    }

    #[test]
    fn malformed_block_is_a_format_error() {
        assert!(parse_block("not-a-cidr").is_err());
        assert!(parse_block("10.0.0.0/33").is_err());
    }

    #[test]
    fn read_targets_skips_comments_and_bad_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cidrs.txt");
        std::fs::write(
            &path,
            "# header comment\n\n192.0.2.0/24\nbogus/99\n203.0.112.0/22\n",
        )
        .unwrap();

        let targets = read_targets(&path).unwrap();
        assert_eq!(targets, vec![v4("192.0.2.0/24"), v4("203.0.112.0/22")]);
    }

    #[test]
    fn read_targets_rereads_each_invocation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cidrs.txt");
        std::fs::write(&path, "192.0.2.0/24\n").unwrap();
        assert_eq!(read_targets(&path).unwrap().len(), 1);

        std::fs::write(&path, "192.0.2.0/24\n198.51.100.0/24\n").unwrap();
        assert_eq!(read_targets(&path).unwrap().len(), 2);
    }
}
