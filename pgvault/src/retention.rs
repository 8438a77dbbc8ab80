//! Retention: mark-and-sweep over the backup catalog.
//!
//! Marking runs against the server's local clock; the evaluation instant
//! is injected so policy decisions are reproducible. Labels are
//! `YYYYMMDDhhmmss`, so label order is time order and the day/week/month/
//! year rules reduce to date arithmetic on parsed labels.

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime};
use tracing::{debug, info, warn};

use crate::catalog::{Backup, Catalog};
use crate::conf::RetentionPolicy;
use crate::error::{ErrorKind, Result};

const LABEL_FORMAT: &str = "%Y%m%d%H%M%S";

pub fn parse_label(label: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(label, LABEL_FORMAT).ok()
}

/// Decide which backups survive. Returns one flag per input backup, in
/// the same order. Unparseable labels are kept (and logged), never swept.
pub fn mark(policy: &RetentionPolicy, now: NaiveDateTime, backups: &[Backup]) -> Vec<bool> {
    let mut keep = vec![false; backups.len()];
    let parsed: Vec<Option<NaiveDateTime>> = backups
        .iter()
        .map(|b| {
            let t = parse_label(&b.label);
            if t.is_none() {
                warn!("retention cannot parse label {:?}, keeping it", b.label);
            }
            t
        })
        .collect();

    // Rule 0: anything unparseable survives.
    for (flag, time) in keep.iter_mut().zip(&parsed) {
        if time.is_none() {
            *flag = true;
        }
    }

    // Rule 1: everything newer than now - days·86400.
    let days = policy.days.unwrap_or(0);
    let cutoff = now - Duration::seconds(days as i64 * 86_400);
    for (i, time) in parsed.iter().enumerate() {
        if let Some(time) = time {
            if *time >= cutoff {
                debug!("retained by day rule: {}", backups[i].label);
                keep[i] = true;
            }
        }
    }

    // Rule 2: the latest backup on each of the last `weeks` Mondays.
    if let Some(weeks) = policy.weeks {
        for j in 0..weeks {
            let reference = now.date() - Duration::weeks(j as i64);
            let monday =
                reference - Duration::days(reference.weekday().num_days_from_monday() as i64);
            mark_latest_on(&mut keep, &parsed, backups, monday, "week");
        }
    }

    // Rule 3: the latest first-of-month backup of the last `months`
    // calendar months.
    if let Some(months) = policy.months {
        let mut year = now.year();
        let mut month = now.month();
        for j in 0..months {
            if j > 0 {
                if month == 1 {
                    month = 12;
                    year -= 1;
                } else {
                    month -= 1;
                }
            }
            if let Some(first) = NaiveDate::from_ymd_opt(year, month, 1) {
                mark_latest_on(&mut keep, &parsed, backups, first, "month");
            }
        }
    }

    // Rule 4: the latest first-of-year backup of the last `years` years.
    if let Some(years) = policy.years {
        for j in 0..years {
            let year = now.year() - j as i32;
            if let Some(first) = NaiveDate::from_ymd_opt(year, 1, 1) {
                mark_latest_on(&mut keep, &parsed, backups, first, "year");
            }
        }
    }

    // Rule 5: explicit keep flags; dependent children are handled by the
    // sweep itself, which refuses to delete a parent.
    for (i, backup) in backups.iter().enumerate() {
        if backup.keep {
            keep[i] = true;
        }
    }

    keep
}

/// Mark the newest backup whose local date equals `date`.
fn mark_latest_on(
    keep: &mut [bool],
    parsed: &[Option<NaiveDateTime>],
    backups: &[Backup],
    date: NaiveDate,
    rule: &str,
) {
    let latest = parsed
        .iter()
        .enumerate()
        .filter_map(|(i, t)| t.map(|t| (i, t)))
        .filter(|(_, t)| t.date() == date)
        .max_by_key(|(_, t)| *t);
    if let Some((i, _)) = latest {
        debug!("retained by {rule} rule: {}", backups[i].label);
        keep[i] = true;
    }
}

/// Mark then sweep: delete unmarked backups oldest-first. A backup that
/// still anchors an incremental chain survives even unmarked. Returns the
/// deleted backups (the caller releases WAL below the minimum surviving
/// `start_lsn` and refreshes the hot-standby directory).
pub fn apply_retention(
    catalog: &Catalog,
    policy: &RetentionPolicy,
    now: NaiveDateTime,
) -> Result<Vec<Backup>> {
    let backups = catalog.list()?;
    let keep = mark(policy, now, &backups);
    let mut deleted = Vec::new();
    for (backup, keep) in backups.iter().zip(keep) {
        if keep {
            continue;
        }
        match catalog.delete(&backup.label, false) {
            Ok(()) => {
                info!("retention removed backup {}", backup.label);
                deleted.push(backup.clone());
            }
            Err(e) if e.kind == ErrorKind::ActiveConflict => {
                debug!("retention keeps {}: children depend on it", backup.label);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::make_backup;
    use camino_tempfile::tempdir;

    fn backups(labels: &[&str]) -> Vec<Backup> {
        labels.iter().map(|l| make_backup(l, "")).collect()
    }

    fn at(label: &str) -> NaiveDateTime {
        parse_label(label).unwrap()
    }

    fn survivors<'a>(policy: &RetentionPolicy, now: &str, labels: &[&'a str]) -> Vec<&'a str> {
        let backups = backups(labels);
        let keep = mark(policy, at(now), &backups);
        labels
            .iter()
            .zip(keep)
            .filter_map(|(label, keep)| keep.then_some(*label))
            .collect()
    }

    #[test]
    fn yearly_rule_keeps_first_of_year() {
        // Policy (0,0,0,3) at 2025-06-01: first-of-year backups for 2024
        // and 2025 survive, everything else goes.
        let kept = survivors(
            &RetentionPolicy {
                days: Some(0),
                weeks: Some(0),
                months: Some(0),
                years: Some(3),
            },
            "20250601000000",
            &[
                "20240101000000",
                "20240108000000",
                "20240601000000",
                "20250101000000",
            ],
        );
        assert_eq!(kept, vec!["20240101000000", "20250101000000"]);
    }

    #[test]
    fn day_rule_keeps_recent() {
        let kept = survivors(
            &RetentionPolicy {
                days: Some(7),
                ..Default::default()
            },
            "20240110120000",
            &["20240101000000", "20240104000000", "20240109000000"],
        );
        assert_eq!(kept, vec!["20240104000000", "20240109000000"]);
    }

    #[test]
    fn week_rule_keeps_latest_monday_backup() {
        // 2024-01-08 and 2024-01-15 are Mondays.
        let kept = survivors(
            &RetentionPolicy {
                days: Some(0),
                weeks: Some(2),
                ..Default::default()
            },
            "20240117120000",
            &[
                "20240108060000",
                "20240108180000", // latest on that Monday wins
                "20240110000000",
                "20240115090000",
            ],
        );
        assert_eq!(kept, vec!["20240108180000", "20240115090000"]);
    }

    #[test]
    fn month_rule_keeps_first_of_month() {
        let kept = survivors(
            &RetentionPolicy {
                days: Some(0),
                months: Some(2),
                ..Default::default()
            },
            "20240215000000",
            &["20240101120000", "20240102000000", "20240201000000"],
        );
        assert_eq!(kept, vec!["20240101120000", "20240201000000"]);
    }

    #[test]
    fn keep_flag_overrides_everything() {
        let mut list = backups(&["20200101000000"]);
        list[0].keep = true;
        let keep = mark(
            &RetentionPolicy {
                days: Some(0),
                ..Default::default()
            },
            at("20250101000000"),
            &list,
        );
        assert!(keep[0]);
    }

    #[test]
    fn unparseable_labels_are_never_swept() {
        let list = backups(&["not-a-timestamp"]);
        let keep = mark(&RetentionPolicy::default(), at("20250101000000"), &list);
        assert!(keep[0]);
    }

    #[test]
    fn all_backups_inside_window_means_no_deletion() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::new(dir.path());
        catalog.save(&make_backup("20240101000000", "")).unwrap();
        catalog.save(&make_backup("20240102000000", "")).unwrap();

        let policy = RetentionPolicy {
            days: Some(30),
            ..Default::default()
        };
        let deleted = apply_retention(&catalog, &policy, at("20240110000000")).unwrap();
        assert!(deleted.is_empty());
        assert_eq!(catalog.list().unwrap().len(), 2);
    }

    #[test]
    fn sweep_deletes_unmarked_but_never_chain_parents() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::new(dir.path());
        // Old full with a recent incremental child: both survive, the
        // parent because of the child, the child by the day rule.
        catalog.save(&make_backup("20240101000000", "")).unwrap();
        catalog
            .save(&make_backup("20240109000000", "20240101000000"))
            .unwrap();
        // Old orphan full: swept.
        catalog.save(&make_backup("20240102000000", "")).unwrap();

        let policy = RetentionPolicy {
            days: Some(3),
            ..Default::default()
        };
        let deleted = apply_retention(&catalog, &policy, at("20240110000000")).unwrap();
        let deleted: Vec<String> = deleted.into_iter().map(|b| b.label).collect();
        assert_eq!(deleted, vec!["20240102000000"]);
        assert!(catalog.load("20240101000000").is_ok());
        assert!(catalog.load("20240109000000").is_ok());
    }
}
