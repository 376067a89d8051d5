use std::collections::BTreeMap;
use std::fmt;

use crate::StatsEntry;

/// Renders per-category counts as a one-line summary, e.g. `3 items: qcm (2) • memory (1)`.
///
/// Categories are listed by descending count, ties ordered by label. Nothing is rendered when
/// `total` is zero: whether to show an empty-state text is up to the caller.
#[derive(Clone, Copy, Debug)]
pub struct Summary<'a> {
    counts_by_category: &'a BTreeMap<String, u64>,
    total: u64,
}

impl fmt::Display for Summary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.total == 0 {
            return Ok(());
        }

        let mut counts: Vec<_> = self.counts_by_category.iter().collect();
        counts.sort_by(|(a_label, a), (b_label, b)| b.cmp(a).then_with(|| a_label.cmp(b_label)));

        write!(f, "{} items", self.total)?;
        for (i, (label, count)) in counts.into_iter().enumerate() {
            let sep = if i == 0 { ": " } else { " • " };
            write!(f, "{sep}{label} ({count})")?;
        }
        Ok(())
    }
}

impl StatsEntry {
    /// Returns a [`Display`](fmt::Display)able summary of this entry.
    pub fn summary(&self) -> Summary<'_> {
        Summary {
            counts_by_category: &self.counts_by_category,
            total: self.total,
        }
    }
}

/// Formats `entry` as a human-readable one-line summary. See [`Summary`].
pub fn format_summary(entry: &StatsEntry) -> String {
    entry.summary().to_string()
}
