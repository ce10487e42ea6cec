//! Database verification for untrusted MMDB files
//!
//! Opening a database only checks what lookups need up front: the marker,
//! the metadata and the section layout. Verification goes further and walks
//! the whole file:
//!
//! - Metadata fields and section boundaries
//! - The 16-byte separator between tree and data section
//! - Every node reachable from the root, including depth against the
//!   address width (which also catches cycles)
//! - Every distinct data record the tree points at, decoded under the
//!   configured [`DecodeLimits`]
//!
//! # Usage
//!
//! ```rust,no_run
//! use mmdb_reader::verify::verify_file;
//!
//! let report = verify_file("GeoLite2-City.mmdb")?;
//!
//! if report.is_valid() {
//!     println!("{}", report.stats.summary());
//! } else {
//!     for error in &report.errors {
//!         eprintln!("  ERROR: {}", error);
//!     }
//! }
//! # Ok::<(), mmdb_reader::MmdbError>(())
//! ```

use crate::data_section::{DataDecoder, DecodeLimits};
use crate::error::Result;
use crate::mmdb::{MmdbHeader, SearchTree, DATA_SECTION_SEPARATOR_SIZE};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::Path;

/// Stop listing individual record errors after this many
const MAX_REPORTED_RECORD_ERRORS: usize = 20;

/// Verification report with detailed findings
#[derive(Debug, Clone, Default, Serialize)]
pub struct VerificationReport {
    /// Problems that make lookups fail or return garbage
    pub errors: Vec<String>,
    /// Suspicious but harmless findings
    pub warnings: Vec<String>,
    /// Informational messages about database properties
    pub info: Vec<String>,
    /// Statistics gathered while walking the file
    pub stats: VerificationStats,
}

/// Statistics gathered during verification
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerificationStats {
    /// File size in bytes
    pub file_size: usize,
    /// Nodes declared in metadata
    pub node_count: u32,
    /// Nodes reachable from the root
    pub nodes_visited: usize,
    /// Records pointing at data
    pub data_records: usize,
    /// Records marking "no data"
    pub empty_records: usize,
    /// Distinct data offsets referenced by the tree
    pub distinct_data_offsets: usize,
    /// Data section size in bytes
    pub data_section_size: usize,
}

impl VerificationReport {
    /// Check if the database passed all checks (no errors)
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    fn warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    fn info(&mut self, msg: impl Into<String>) {
        self.info.push(msg.into());
    }
}

impl VerificationStats {
    /// Human-readable summary
    pub fn summary(&self) -> String {
        format!(
            "Nodes: {}/{} reachable, Records: {} data ({} distinct), {} empty, Data: {} KB, Size: {} KB",
            self.nodes_visited,
            self.node_count,
            self.data_records,
            self.distinct_data_offsets,
            self.empty_records,
            self.data_section_size / 1024,
            self.file_size / 1024
        )
    }
}

/// Verify a database file
///
/// Fails only if the file cannot be read; structural problems are
/// reported in the returned [`VerificationReport`].
pub fn verify_file(path: impl AsRef<Path>) -> Result<VerificationReport> {
    let buffer = std::fs::read(path)?;
    Ok(verify_bytes(&buffer))
}

/// Verify a complete database held in memory
pub fn verify_bytes(data: &[u8]) -> VerificationReport {
    verify_bytes_with_limits(data, DecodeLimits::default())
}

/// Verify a database, decoding records under the given limits
pub fn verify_bytes_with_limits(data: &[u8], limits: DecodeLimits) -> VerificationReport {
    let mut report = VerificationReport::default();
    report.stats.file_size = data.len();
    report.info(format!(
        "File size: {} bytes ({} KB)",
        data.len(),
        data.len() / 1024
    ));

    let (header, metadata) = match MmdbHeader::from_file(data) {
        Ok(parsed) => parsed,
        Err(e) => {
            report.error(e.to_string());
            return report;
        }
    };

    report.stats.node_count = header.node_count;
    report.stats.data_section_size = header.data_section_len();
    report.info(format!(
        "Database type: {}, IPv{}, {}-bit records, {} nodes, built at epoch {}",
        metadata.database_type,
        metadata.ip_version.number(),
        metadata.record_size.bits(),
        metadata.node_count,
        metadata.build_epoch
    ));
    if metadata.languages.is_empty() {
        report.info("No languages listed in metadata");
    }
    if metadata.description.is_empty() {
        report.warning("Metadata has no description");
    }

    verify_separator(data, &header, &mut report);
    let offsets = verify_tree(data, &header, &mut report);
    verify_records(data, &header, &offsets, limits, &mut report);

    report
}

fn verify_separator(data: &[u8], header: &MmdbHeader, report: &mut VerificationReport) {
    let separator = &data[header.tree_size..header.tree_size + DATA_SECTION_SEPARATOR_SIZE];
    if separator.iter().any(|&b| b != 0) {
        report.error(format!(
            "Data section separator at offset {} is not {} zero bytes",
            header.tree_size, DATA_SECTION_SEPARATOR_SIZE
        ));
    }
}

/// Walk every reachable node; returns the distinct data offsets found
fn verify_tree(data: &[u8], header: &MmdbHeader, report: &mut VerificationReport) -> BTreeSet<u32> {
    let tree = SearchTree::new(data, header);
    let max_depth = header.ip_version.bit_count() as usize;
    let node_count = header.node_count;

    // Deepest depth each node has been expanded at. A node reached again at
    // a greater depth must be re-expanded so depth overflow is not missed.
    let mut expanded_at: Vec<Option<usize>> = vec![None; node_count as usize];
    let mut offsets = BTreeSet::new();
    // Nodes only reached with every address bit consumed; never expanded
    let mut terminal = vec![false; node_count as usize];
    let mut stack = vec![(0u32, 0usize)];
    let mut exhausted_links = 0usize;

    while let Some((node, depth)) = stack.pop() {
        let slot = &mut expanded_at[node as usize];
        if slot.is_some_and(|seen| seen >= depth) {
            continue;
        }
        *slot = Some(depth);

        for side in 0..2u8 {
            let record = match tree.read_record(node, side) {
                Ok(record) => record,
                Err(e) => {
                    report.error(e.to_string());
                    continue;
                }
            };

            if record < node_count {
                if depth + 1 >= max_depth {
                    // Lookups ending here use up the address width and find nothing
                    terminal[record as usize] = true;
                    exhausted_links += 1;
                    if exhausted_links == 1 {
                        report.warning(format!(
                            "Node {} links to internal node {} at depth {}, the full {}-bit address width (cycle or overlong path); lookups ending there find no data",
                            node,
                            record,
                            depth + 1,
                            max_depth
                        ));
                    }
                    continue;
                }
                stack.push((record, depth + 1));
            } else if record == node_count {
                report.stats.empty_records += 1;
            } else {
                report.stats.data_records += 1;
                match tree.data_offset(record) {
                    Ok(offset) => {
                        offsets.insert(offset);
                    }
                    Err(e) => report.error(format!("Node {}: {}", node, e)),
                }
            }
        }
    }

    if exhausted_links > 1 {
        report.warning(format!(
            "{} node links reach the address width in total",
            exhausted_links
        ));
    }

    let visited = expanded_at
        .iter()
        .zip(&terminal)
        .filter(|&(depth, &end)| depth.is_some() || end)
        .count();
    report.stats.nodes_visited = visited;
    report.stats.distinct_data_offsets = offsets.len();

    let orphaned = (node_count as usize).saturating_sub(visited);
    if orphaned > 0 {
        report.warning(format!(
            "Found {} orphaned nodes (exist in tree but unreachable from root)",
            orphaned
        ));
    }

    report.info(format!(
        "Search tree: {} of {} nodes reachable, {} data records, {} empty records",
        visited, node_count, report.stats.data_records, report.stats.empty_records
    ));

    offsets
}

fn verify_records(
    data: &[u8],
    header: &MmdbHeader,
    offsets: &BTreeSet<u32>,
    limits: DecodeLimits,
    report: &mut VerificationReport,
) {
    let section = &data[header.data_section_start..header.data_section_end];
    let decoder = DataDecoder::new(section).with_limits(limits);

    let mut failures = 0usize;
    for &offset in offsets {
        if let Err(e) = decoder.decode(offset) {
            failures += 1;
            if failures <= MAX_REPORTED_RECORD_ERRORS {
                report.error(format!("Record at data offset {}: {}", offset, e));
            }
        }
    }

    if failures > MAX_REPORTED_RECORD_ERRORS {
        report.error(format!(
            "{} more records failed to decode",
            failures - MAX_REPORTED_RECORD_ERRORS
        ));
    }

    report.info(format!(
        "Data section: {} records decoded, {} failed",
        offsets.len() - failures,
        failures
    ));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_section::DataValue;
    use crate::mmdb::{IpVersion, RecordSize};
    use crate::mmdb_builder::DatabaseBuilder;

    fn build(ip_version: IpVersion) -> Vec<u8> {
        let mut builder = DatabaseBuilder::new()
            .with_ip_version(ip_version)
            .with_record_size(RecordSize::Bits28)
            .with_description("en", "Verification test");
        builder
            .add_ip("192.168.0.0/16", DataValue::String("lan".to_string()))
            .unwrap();
        builder
            .add_ip("8.8.8.8", DataValue::String("dns".to_string()))
            .unwrap();
        builder.build().unwrap()
    }

    #[test]
    fn test_verify_valid_database() {
        for version in [IpVersion::V4, IpVersion::V6] {
            let report = verify_bytes(&build(version));
            assert!(report.is_valid(), "errors: {:?}", report.errors);
            assert!(report.warnings.is_empty(), "warnings: {:?}", report.warnings);
            assert_eq!(report.stats.distinct_data_offsets, 2);
            assert_eq!(report.stats.nodes_visited, report.stats.node_count as usize);
        }
    }

    #[test]
    fn test_verify_empty_file() {
        let report = verify_bytes(&[]);
        assert!(!report.is_valid());
        assert_eq!(report.stats.file_size, 0);
    }

    #[test]
    fn test_verify_dirty_separator() {
        let mut data = build(IpVersion::V4);
        let (header, _) = MmdbHeader::from_file(&data).unwrap();
        data[header.tree_size + 3] = 0xFF;

        let report = verify_bytes(&data);
        assert!(report.errors.iter().any(|e| e.contains("separator")));
    }

    #[test]
    fn test_verify_tree_cycle() {
        let mut data = build(IpVersion::V4);
        let (header, _) = MmdbHeader::from_file(&data).unwrap();
        assert_eq!(header.record_size, RecordSize::Bits28);

        // Point the root's left record back at the root
        data[0] = 0;
        data[1] = 0;
        data[2] = 0;
        data[3] &= 0x0F;

        // Every lookup is still bounded by the address width
        let report = verify_bytes(&data);
        assert!(report.is_valid(), "errors: {:?}", report.errors);
        assert!(
            report.warnings.iter().any(|w| w.contains("address width")),
            "warnings: {:?}",
            report.warnings
        );
    }

    #[test]
    fn test_verify_corrupt_record() {
        let mut data = build(IpVersion::V4);
        let (header, _) = MmdbHeader::from_file(&data).unwrap();

        // Overwrite the first data byte with an end marker (extended type 13)
        let start = header.data_section_start;
        data[start] = 0x00;
        data[start + 1] = 0x06;

        let report = verify_bytes(&data);
        assert!(
            report.errors.iter().any(|e| e.contains("Record at data offset")),
            "errors: {:?}",
            report.errors
        );
    }

    #[test]
    fn test_report_serializes() {
        let report = verify_bytes(&build(IpVersion::V6));
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["errors"], serde_json::json!([]));
        assert_eq!(json["stats"]["distinct_data_offsets"], 2);
    }

    #[test]
    fn test_stats_summary() {
        let report = verify_bytes(&build(IpVersion::V4));
        let summary = report.stats.summary();
        assert!(summary.contains("reachable"));
        assert!(summary.contains("distinct"));
    }
}
