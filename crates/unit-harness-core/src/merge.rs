//! Replace-or-merge of metadata entity snapshots.
//!
//! The poller produces a fresh list per category on every cycle and
//! publishes it as a whole, so readers only ever see a complete
//! snapshot. These functions build that list.

use crate::models::MetadataEntity;

/// Snapshot from a full fetch: every enabled row, in fetch order.
pub fn replace_category(rows: Vec<MetadataEntity>) -> Vec<MetadataEntity> {
    rows.into_iter().filter(|r| !r.is_disabled).collect()
}

/// Merge an incremental fetch into the current snapshot.
///
/// For each incoming row, matched against existing rows by row key
/// (case-insensitive):
///
/// - a row older than the cached one is ignored, keeping timestamps
///   monotonic per identifier;
/// - a disabled row is a tombstone: the cached row is dropped and nothing
///   is added;
/// - an enabled row replaces the cached row in place, or is appended when
///   the identifier is new.
///
/// Rows not mentioned by the fetch are left untouched.
pub fn merge_incremental(
    current: &[MetadataEntity],
    incoming: Vec<MetadataEntity>,
) -> Vec<MetadataEntity> {
    let mut merged = current.to_vec();
    for row in incoming {
        let existing = merged.iter().position(|e| e.same_row(&row));
        match existing {
            Some(i) if merged[i].last_modified > row.last_modified => {}
            Some(i) if row.is_disabled => {
                merged.remove(i);
            }
            Some(i) => merged[i] = row,
            None if row.is_disabled => {}
            None => merged.push(row),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn row(id: &str, secs: i64, disabled: bool) -> MetadataEntity {
        MetadataEntity::new("unit", id, id, ts(secs)).with_disabled(disabled)
    }

    fn keys_and_times(rows: &[MetadataEntity]) -> Vec<(String, i64)> {
        rows.iter()
            .map(|r| (r.row_key.clone(), r.last_modified.timestamp()))
            .collect()
    }

    #[test]
    fn test_update_drop_disabled_keep_untouched() {
        let current = vec![row("A", 1, false), row("B", 1, false)];
        let merged = merge_incremental(&current, vec![row("A", 2, false), row("C", 2, true)]);
        assert_eq!(
            keys_and_times(&merged),
            vec![("A".to_string(), 2), ("B".to_string(), 1)]
        );
    }

    #[test]
    fn test_disabled_row_is_a_tombstone() {
        let current = vec![row("A", 1, false), row("B", 1, false)];
        let merged = merge_incremental(&current, vec![row("a", 2, true)]);
        assert_eq!(keys_and_times(&merged), vec![("B".to_string(), 1)]);
    }

    #[test]
    fn test_new_rows_are_appended() {
        let current = vec![row("A", 1, false)];
        let merged = merge_incremental(&current, vec![row("B", 3, false)]);
        assert_eq!(
            keys_and_times(&merged),
            vec![("A".to_string(), 1), ("B".to_string(), 3)]
        );
    }

    #[test]
    fn test_older_row_is_ignored() {
        let current = vec![row("A", 5, false)];
        let merged = merge_incremental(&current, vec![row("A", 4, false), row("A", 3, true)]);
        assert_eq!(keys_and_times(&merged), vec![("A".to_string(), 5)]);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let current = vec![row("A", 1, false)];
        let incoming = vec![row("A", 2, false), row("B", 2, false)];
        let once = merge_incremental(&current, incoming.clone());
        let twice = merge_incremental(&once, incoming);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_replace_drops_disabled_rows() {
        let replaced = replace_category(vec![row("A", 1, false), row("B", 1, true)]);
        assert_eq!(keys_and_times(&replaced), vec![("A".to_string(), 1)]);
    }
}
