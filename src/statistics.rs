//! Per-operation counters.

use std::fmt;

/// Summary of an operation in terms of entries treated.
///
/// Which counters are meaningful depends on the operation: a backup counts
/// unchanged files in `skipped`, a restore counts entries less recent than
/// the filesystem in `tooold`, and so on. Counters always reflect what was
/// attempted, whether or not the operation as a whole succeeded.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Statistics {
    /// Entries saved, restored, tested or merged.
    pub treated: u64,
    /// Hard links registered or recreated.
    pub hard_links: u64,
    /// Entries unchanged since the reference / not restored for lack of data.
    pub skipped: u64,
    /// Entries excluded by the selection or subtree masks.
    pub ignored: u64,
    /// Entries ignored because the in-place version is more recent.
    pub tooold: u64,
    /// Entries that failed and were counted rather than aborting the run.
    pub errored: u64,
    /// Deletions recorded or replayed.
    pub deleted: u64,
    /// EA sets saved or restored.
    pub ea_treated: u64,
    /// FSA sets saved or restored.
    pub fsa_treated: u64,
    /// Raw bytes read from the source.
    pub byte_read: u64,
    /// Bytes written after compression.
    pub byte_written: u64,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Total number of entries accounted for.
    pub fn total(&self) -> u64 {
        self.treated + self.skipped + self.ignored + self.tooold + self.errored + self.deleted
    }
}

impl fmt::Display for Statistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} treated, {} skipped, {} ignored, {} too old, {} errored, {} deleted ({} hard links, {} EA, {} FSA)",
            self.treated,
            self.skipped,
            self.ignored,
            self.tooold,
            self.errored,
            self.deleted,
            self.hard_links,
            self.ea_treated,
            self.fsa_treated,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_sums_entry_counters() {
        let stats = Statistics {
            treated: 5,
            skipped: 2,
            ignored: 1,
            tooold: 1,
            errored: 1,
            deleted: 3,
            hard_links: 2,
            ..Default::default()
        };
        assert_eq!(stats.total(), 13);
    }
}
