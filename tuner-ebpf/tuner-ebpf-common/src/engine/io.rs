use super::math::{classify, Locality};
use super::{Maps, Table};
use crate::IoPattern;

/// Block request completion in the context of `tgid`. Not gated; the first
/// completion of a group only records its sector.
#[inline(always)]
pub fn on_block_complete<M: Maps>(maps: &M, tgid: u32, sector: u64) {
    let patterns = maps.io_patterns();
    let seen = patterns.modify(&tgid, |pat| {
        match classify(pat.last_sector, sector) {
            Locality::Sequential => pat.seq = pat.seq.wrapping_add(1),
            Locality::Random => pat.rnd = pat.rnd.wrapping_add(1),
        }
        pat.last_sector = sector;
    });
    if !seen {
        patterns.upsert(
            &tgid,
            &IoPattern {
                last_sector: sector,
                seq: 0,
                rnd: 0,
            },
        );
    }
}
