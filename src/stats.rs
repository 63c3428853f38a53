use rusqlite::Connection;

use crate::db;

/// One scanned student's attendance footprint for a subject.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StudentCounts {
    pub present: i64,
    pub total: i64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubjectBatchStats {
    pub total_classes: i64,
    pub average_attendance: f64,
}

/// Subject-level summary over one batch year.
///
/// `total_classes` is the maximum per-student entry count, not the number of
/// marking sessions: a student who missed a recording day has fewer raw
/// entries than classes held, so entry counts alone cannot be the
/// denominator. The maximum still under-counts when nobody attended every
/// class; that is the recorded source behavior, kept as-is.
pub fn summarize(counts: &[StudentCounts]) -> SubjectBatchStats {
    let total_classes = counts.iter().map(|c| c.total).max().unwrap_or(0);
    let present_sum: i64 = counts.iter().map(|c| c.present).sum();
    let denom = total_classes * counts.len() as i64;
    let average_attendance = if denom > 0 {
        100.0 * present_sum as f64 / denom as f64
    } else {
        0.0
    };
    SubjectBatchStats {
        total_classes,
        average_attendance,
    }
}

/// Full recompute of the cached subject_stats row for (subject, batch year)
/// from raw student entries. Overwrites whatever was there; a concurrent
/// recompute racing on the same key simply loses to the later writer.
pub fn recompute_subject_stats(
    conn: &Connection,
    subject_id: &str,
    batch_year: i64,
) -> rusqlite::Result<SubjectBatchStats> {
    let mut stmt = conn.prepare(
        "SELECT COALESCE(SUM(CASE WHEN e.status = 'present' THEN 1 ELSE 0 END), 0),
                COUNT(e.id)
         FROM students s
         LEFT JOIN attendance_entries e
           ON e.student_id = s.account_id AND e.subject_id = ?
         WHERE s.batch_year = ?
         GROUP BY s.account_id",
    )?;
    let counts = stmt
        .query_map((subject_id, batch_year), |r| {
            Ok(StudentCounts {
                present: r.get(0)?,
                total: r.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let stats = summarize(&counts);
    conn.execute(
        "INSERT INTO subject_stats(subject_id, batch_year, total_classes, average_attendance, last_updated)
         VALUES(?, ?, ?, ?, ?)
         ON CONFLICT(subject_id, batch_year) DO UPDATE SET
           total_classes = excluded.total_classes,
           average_attendance = excluded.average_attendance,
           last_updated = excluded.last_updated",
        (
            subject_id,
            batch_year,
            stats.total_classes,
            stats.average_attendance,
            db::now_ts(),
        ),
    )?;
    Ok(stats)
}

/// Rebuilds one student's cached analytics: per-subject breakdown rows and
/// the overall percentage column. Per-subject percentages use the student's
/// own entry count as denominator; the record is personal history, unlike
/// the subject-level max-entries denominator above.
pub fn refresh_student_rollup(conn: &Connection, student_id: &str) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare(
        "SELECT subject_id,
                SUM(CASE WHEN status = 'present' THEN 1 ELSE 0 END),
                COUNT(*)
         FROM attendance_entries
         WHERE student_id = ?
         GROUP BY subject_id",
    )?;
    let rows = stmt
        .query_map([student_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, i64>(1)?,
                r.get::<_, i64>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    conn.execute(
        "DELETE FROM student_subject_stats WHERE student_id = ?",
        [student_id],
    )?;

    let mut present_total: i64 = 0;
    let mut entry_total: i64 = 0;
    for (subject_id, present, total) in &rows {
        let percentage = if *total > 0 {
            100.0 * *present as f64 / *total as f64
        } else {
            0.0
        };
        conn.execute(
            "INSERT INTO student_subject_stats(student_id, subject_id, present_count, entry_count, percentage)
             VALUES(?, ?, ?, ?, ?)",
            (student_id, subject_id, present, total, percentage),
        )?;
        present_total += present;
        entry_total += total;
    }

    let overall = if entry_total > 0 {
        100.0 * present_total as f64 / entry_total as f64
    } else {
        0.0
    };
    conn.execute(
        "UPDATE students SET overall_percentage = ?, analytics_updated_at = ? WHERE account_id = ?",
        (overall, db::now_ts(), student_id),
    )?;
    Ok(())
}

/// Account ids of every student in the batch year, for rollup refresh sweeps.
pub fn batch_student_ids(conn: &Connection, batch_year: i64) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT account_id FROM students WHERE batch_year = ?")?;
    let ids = stmt
        .query_map([batch_year], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summarize_empty_batch_is_all_zero() {
        let s = summarize(&[]);
        assert_eq!(s.total_classes, 0);
        assert_eq!(s.average_attendance, 0.0);
    }

    #[test]
    fn summarize_zero_entries_guards_division() {
        // Two enrolled students, nothing recorded yet.
        let s = summarize(&[
            StudentCounts {
                present: 0,
                total: 0,
            },
            StudentCounts {
                present: 0,
                total: 0,
            },
        ]);
        assert_eq!(s.total_classes, 0);
        assert_eq!(s.average_attendance, 0.0);
    }

    #[test]
    fn summarize_uses_max_entry_count_as_denominator() {
        // One student has entries for both classes, the other was only ever
        // recorded once; the denominator is 2 classes x 2 students.
        let s = summarize(&[
            StudentCounts {
                present: 2,
                total: 2,
            },
            StudentCounts {
                present: 1,
                total: 1,
            },
        ]);
        assert_eq!(s.total_classes, 2);
        assert!((s.average_attendance - 75.0).abs() < 1e-9);
    }

    #[test]
    fn summarize_counts_only_present_in_numerator() {
        let s = summarize(&[
            StudentCounts {
                present: 1,
                total: 2,
            },
            StudentCounts {
                present: 0,
                total: 2,
            },
        ]);
        assert_eq!(s.total_classes, 2);
        assert!((s.average_attendance - 25.0).abs() < 1e-9);
    }
}
