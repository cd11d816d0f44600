//! Calendar-based retention: which snapshots survive a prune pass

use crate::manifest::{Snapshot, SnapshotId};
use crate::{Error, Result};
use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};

/// How many daily, weekly and monthly snapshots to keep
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionRule {
    #[serde(default)]
    pub keep_daily: u32,
    #[serde(default)]
    pub keep_weekly: u32,
    #[serde(default)]
    pub keep_monthly: u32,
}

impl Default for RetentionRule {
    fn default() -> Self {
        Self {
            keep_daily: 7,
            keep_weekly: 4,
            keep_monthly: 6,
        }
    }
}

impl RetentionRule {
    pub fn new(keep_daily: u32, keep_weekly: u32, keep_monthly: u32) -> Self {
        Self {
            keep_daily,
            keep_weekly,
            keep_monthly,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.keep_daily == 0 && self.keep_weekly == 0 && self.keep_monthly == 0 {
            return Err(Error::InvalidRetentionRule {
                reason: "at least one of keep_daily, keep_weekly, keep_monthly must be set"
                    .to_string(),
            });
        }
        Ok(())
    }
}

/// Outcome of [`select`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub keep: BTreeSet<SnapshotId>,
    pub prune: BTreeSet<SnapshotId>,
}

#[derive(Debug, Clone, Copy)]
enum Cadence {
    Daily,
    Weekly,
    Monthly,
}

impl Cadence {
    /// Sequential index of the UTC calendar period containing `at`
    fn period(self, at: DateTime<Utc>) -> i64 {
        let date = at.date_naive();
        match self {
            Cadence::Daily => i64::from(date.num_days_from_ce()),
            Cadence::Weekly => {
                // Day 1 of the common era is a Monday
                let monday = i64::from(date.num_days_from_ce())
                    - i64::from(date.weekday().num_days_from_monday());
                (monday - 1).div_euclid(7)
            }
            Cadence::Monthly => i64::from(date.year()) * 12 + i64::from(date.month0()),
        }
    }
}

/// Partition snapshots into keep and prune sets.
///
/// For each cadence, the newest snapshot of every period within the last
/// `keep_*` periods before `now` (the period containing `now` included) is
/// kept. Ties on timestamp go to the higher id. The newest snapshot overall and
/// anything dated after `now` are always kept.
pub fn select(snapshots: &[Snapshot], rule: &RetentionRule, now: DateTime<Utc>) -> Result<Selection> {
    rule.validate()?;

    let mut ordered: Vec<&Snapshot> = snapshots.iter().collect();
    ordered.sort_by(|a, b| b.created.cmp(&a.created).then(b.id.cmp(&a.id)));

    let mut keep = BTreeSet::new();
    if let Some(newest) = ordered.first() {
        keep.insert(newest.id);
    }

    let cadences = [
        (Cadence::Daily, rule.keep_daily),
        (Cadence::Weekly, rule.keep_weekly),
        (Cadence::Monthly, rule.keep_monthly),
    ];

    for (cadence, count) in cadences {
        if count == 0 {
            continue;
        }

        let current = cadence.period(now);
        let mut filled = HashSet::new();
        for snapshot in &ordered {
            if snapshot.created > now {
                keep.insert(snapshot.id);
                continue;
            }

            let period = cadence.period(snapshot.created);
            if current - period >= i64::from(count) {
                continue;
            }
            if filled.insert(period) {
                keep.insert(snapshot.id);
            }
        }
    }

    let prune = snapshots
        .iter()
        .map(|s| s.id)
        .filter(|id| !keep.contains(id))
        .collect();

    Ok(Selection { keep, prune })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use pretty_assertions::assert_eq;

    fn snapshot(id: u64, created: DateTime<Utc>) -> Snapshot {
        Snapshot {
            id: SnapshotId(id),
            created,
            label: None,
            parent: None,
            files: Vec::new(),
        }
    }

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    fn ids(values: &[u64]) -> BTreeSet<SnapshotId> {
        values.iter().copied().map(SnapshotId).collect()
    }

    /// One snapshot per day from 2024-02-21 through Sunday 2024-03-31
    fn forty_days() -> Vec<Snapshot> {
        let start = at(2024, 2, 21, 3);
        (0..40)
            .map(|day| snapshot(day as u64 + 1, start + Duration::days(day)))
            .collect()
    }

    #[test]
    fn test_forty_daily_snapshots() -> Result<()> {
        let snapshots = forty_days();
        let now = at(2024, 3, 31, 12);
        let selection = select(&snapshots, &RetentionRule::new(7, 4, 2), now)?;

        assert!(selection.keep.len() <= 7 + 4 + 2);
        assert!(selection.keep.contains(&SnapshotId(40)));
        assert_eq!(selection.keep.len() + selection.prune.len(), 40);
        assert!(selection.keep.is_disjoint(&selection.prune));

        // Daily: Mar 25-31 (ids 34-40). Weekly: Sundays Mar 24, 17, 10.
        // Monthly: Mar 31 and Feb 29 (id 9).
        assert_eq!(
            selection.keep,
            ids(&[9, 19, 26, 33, 34, 35, 36, 37, 38, 39, 40])
        );

        Ok(())
    }

    #[test]
    fn test_later_timestamp_wins_bucket() -> Result<()> {
        let snapshots = vec![
            snapshot(5, at(2024, 5, 1, 10)),
            snapshot(4, at(2024, 5, 1, 11)),
        ];
        let selection = select(&snapshots, &RetentionRule::new(1, 0, 0), at(2024, 5, 1, 23))?;

        assert_eq!(selection.keep, ids(&[4]));
        assert_eq!(selection.prune, ids(&[5]));
        Ok(())
    }

    #[test]
    fn test_identical_timestamps_keep_higher_id() -> Result<()> {
        let when = at(2024, 5, 1, 10);
        let snapshots = vec![snapshot(2, when), snapshot(3, when), snapshot(1, when)];
        let selection = select(&snapshots, &RetentionRule::new(3, 0, 0), at(2024, 5, 2, 0))?;

        assert_eq!(selection.keep, ids(&[3]));
        assert_eq!(selection.prune, ids(&[1, 2]));
        Ok(())
    }

    #[test]
    fn test_newest_always_kept() -> Result<()> {
        let snapshots = vec![snapshot(1, at(2023, 1, 1, 0)), snapshot(2, at(2023, 1, 2, 0))];
        let selection = select(&snapshots, &RetentionRule::new(0, 0, 1), at(2024, 6, 1, 0))?;

        assert_eq!(selection.keep, ids(&[2]));
        assert_eq!(selection.prune, ids(&[1]));
        Ok(())
    }

    #[test]
    fn test_future_snapshots_are_kept() -> Result<()> {
        let snapshots = vec![
            snapshot(1, at(2024, 1, 1, 0)),
            snapshot(2, at(2024, 1, 10, 0)),
            snapshot(3, at(2024, 1, 11, 0)),
        ];
        let selection = select(&snapshots, &RetentionRule::new(1, 0, 0), at(2024, 1, 5, 0))?;

        assert_eq!(selection.keep, ids(&[2, 3]));
        assert_eq!(selection.prune, ids(&[1]));
        Ok(())
    }

    #[test]
    fn test_weeks_are_calendar_aligned() {
        // Sunday and the following Monday fall in different ISO weeks
        let sunday = at(2024, 3, 31, 23);
        let monday = at(2024, 4, 1, 0);
        assert_eq!(Cadence::Weekly.period(monday) - Cadence::Weekly.period(sunday), 1);
        assert_eq!(
            Cadence::Weekly.period(monday),
            Cadence::Weekly.period(at(2024, 4, 7, 23))
        );
        assert_eq!(Cadence::Monthly.period(at(2024, 1, 1, 0)) - Cadence::Monthly.period(at(2023, 12, 31, 0)), 1);
    }

    #[test]
    fn test_empty_rule_rejected() {
        let result = select(&forty_days(), &RetentionRule::new(0, 0, 0), at(2024, 3, 31, 0));
        assert!(matches!(result, Err(Error::InvalidRetentionRule { .. })));
    }

    #[test]
    fn test_no_snapshots() -> Result<()> {
        let selection = select(&[], &RetentionRule::default(), at(2024, 3, 31, 0))?;
        assert_eq!(selection, Selection::default());
        Ok(())
    }
}
