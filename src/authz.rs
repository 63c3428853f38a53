use rusqlite::{Connection, OptionalExtension};

/// True iff the instructor holds a faculty grant for exactly this subject and
/// batch year. Read-only. Callers must surface `false` as
/// `authorization_denied`, keeping "not your subject" distinct from
/// "no such subject".
pub fn can_mark(
    conn: &Connection,
    instructor_id: &str,
    subject_id: &str,
    batch_year: i64,
) -> rusqlite::Result<bool> {
    let hit = conn
        .query_row(
            "SELECT 1 FROM subject_faculty
             WHERE subject_id = ? AND instructor_id = ? AND batch_year = ?
             LIMIT 1",
            (subject_id, instructor_id, batch_year),
            |_r| Ok(()),
        )
        .optional()?;
    Ok(hit.is_some())
}
