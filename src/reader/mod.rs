//! Shared reader logic: INDEX parsing and batch gap-merging (§4.2/§4.3).
//!
//! `local` and `range_reader` both bootstrap from a FOOTER + an INDEX byte
//! range and both serve `get_many` by the same gap-merge algorithm; that
//! shared surface lives here so the two don't drift.

pub mod local;

use std::collections::HashMap;

use crate::error::{DesError, DesResult};
use crate::format::{Footer, IndexEntry, FOOTER_SIZE};

/// Parse the INDEX region into `(insertion-order entries, name -> index)`,
/// checking the invariants from spec §3.1 that only the full index can
/// check: declared `file_count` matches, and no two names collide.
pub fn parse_index(buf: &[u8], footer: &Footer) -> DesResult<(Vec<IndexEntry>, HashMap<String, usize>)> {
    let mut cursor = buf;
    let mut entries = Vec::with_capacity(footer.file_count as usize);
    let mut by_name = HashMap::with_capacity(footer.file_count as usize);

    while !cursor.is_empty() {
        let entry = IndexEntry::read(&mut cursor)?;
        if by_name.insert(entry.name.clone(), entries.len()).is_some() {
            return Err(DesError::CorruptContainer(format!(
                "duplicate name {:?} in index",
                entry.name
            )));
        }
        entries.push(entry);
    }

    if entries.len() as u64 != footer.file_count {
        return Err(DesError::CorruptContainer(format!(
            "footer declares file_count={} but index has {} entries",
            footer.file_count,
            entries.len()
        )));
    }
    Ok((entries, by_name))
}

/// Extract the footer from the trailing `FOOTER_SIZE` bytes of an object of
/// known total size, checking the size-dependent invariant that only the
/// caller can check (`footer_start + 80 == object_size`).
pub fn parse_trailing_footer(tail: &[u8], object_size: u64) -> DesResult<Footer> {
    if tail.len() != FOOTER_SIZE {
        return Err(DesError::CorruptContainer(format!(
            "expected {FOOTER_SIZE} trailing bytes, got {}",
            tail.len()
        )));
    }
    let footer = Footer::parse(tail)?;
    footer.check_against_object_size(object_size)?;
    Ok(footer)
}

/// One coalesced range read: `[start, start+len)` plus which original
/// request indices it satisfies, each with its offset within the group
/// buffer.
#[derive(Debug, Clone)]
pub struct BatchGroup {
    pub start: u64,
    pub len: u64,
    /// `(request_index, offset_within_group, length)`.
    pub members: Vec<(usize, u64, u64)>,
}

/// Greedy gap-merge over non-external entries, per §4.2's batch algorithm.
/// `requests` is `(request_index, entry)`; ties at equal `data_offset` are
/// broken by `request_index` to keep the merge stable and deterministic.
pub fn plan_batches(requests: &[(usize, &IndexEntry)], max_gap: u64) -> Vec<BatchGroup> {
    let mut sorted: Vec<(usize, &IndexEntry)> = requests.to_vec();
    sorted.sort_by(|a, b| a.1.data_offset.cmp(&b.1.data_offset).then(a.0.cmp(&b.0)));

    let mut groups: Vec<BatchGroup> = Vec::new();
    for (req_idx, entry) in sorted {
        let entry_end = entry.data_offset + entry.data_length;
        match groups.last_mut() {
            Some(group) if entry.data_offset.saturating_sub(group.start + group.len) <= max_gap => {
                let offset_within = entry.data_offset - group.start;
                group.len = group.len.max(entry_end - group.start);
                group.members.push((req_idx, offset_within, entry.data_length));
            }
            _ => {
                groups.push(BatchGroup {
                    start: entry.data_offset,
                    len: entry.data_length,
                    members: vec![(req_idx, 0, entry.data_length)],
                });
            }
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(offset: u64, len: u64) -> IndexEntry {
        IndexEntry {
            name: format!("f{offset}"),
            data_offset: offset,
            data_length: len,
            meta_offset: 0,
            meta_length: 0,
            flags: 0,
        }
    }

    #[test]
    fn merges_adjacent_within_gap_budget() {
        let e0 = entry(16, 1024);
        let e1 = entry(1040, 1024); // 0-byte gap
        let e2 = entry(50_000, 1024); // far away
        let requests = vec![(0, &e0), (1, &e1), (2, &e2)];
        let groups = plan_batches(&requests, 16);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].members.len(), 2);
        assert_eq!(groups[1].members.len(), 1);
    }

    #[test]
    fn zero_gap_splits_everything_not_contiguous() {
        let e0 = entry(16, 1024);
        let e1 = entry(1041, 1024); // 1-byte gap
        let requests = vec![(0, &e0), (1, &e1)];
        let groups = plan_batches(&requests, 0);
        assert_eq!(groups.len(), 2);
    }
}
