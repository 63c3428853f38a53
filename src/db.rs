use rusqlite::Connection;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("rollbook.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS accounts(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            email TEXT NOT NULL UNIQUE,
            credential_hash TEXT NOT NULL,
            credential_salt TEXT NOT NULL,
            role TEXT NOT NULL,
            last_login TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_accounts_role ON accounts(role)",
        [],
    )?;
    ensure_accounts_last_login(&conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS account_devices(
            account_id TEXT NOT NULL,
            fingerprint TEXT NOT NULL,
            position INTEGER NOT NULL,
            PRIMARY KEY(account_id, fingerprint),
            FOREIGN KEY(account_id) REFERENCES accounts(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_account_devices_account ON account_devices(account_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            account_id TEXT PRIMARY KEY,
            registration_no TEXT NOT NULL UNIQUE,
            batch_year INTEGER NOT NULL,
            subscription_active INTEGER NOT NULL DEFAULT 0,
            subscription_plan TEXT,
            subscription_start TEXT,
            subscription_end TEXT,
            overall_percentage REAL NOT NULL DEFAULT 0,
            analytics_updated_at TEXT,
            FOREIGN KEY(account_id) REFERENCES accounts(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_batch_year ON students(batch_year)",
        [],
    )?;

    // Early workspaces tracked the subscription flag only. Add the plan
    // metadata columns if this database predates them.
    ensure_students_subscription_meta(&conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS instructors(
            account_id TEXT PRIMARY KEY,
            employee_id TEXT NOT NULL UNIQUE,
            department TEXT NOT NULL,
            FOREIGN KEY(account_id) REFERENCES accounts(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            code TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS subject_batch_years(
            subject_id TEXT NOT NULL,
            batch_year INTEGER NOT NULL,
            PRIMARY KEY(subject_id, batch_year),
            FOREIGN KEY(subject_id) REFERENCES subjects(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subject_batch_years_year ON subject_batch_years(batch_year)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subject_faculty(
            subject_id TEXT NOT NULL,
            instructor_id TEXT NOT NULL,
            batch_year INTEGER NOT NULL,
            PRIMARY KEY(subject_id, instructor_id, batch_year),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(instructor_id) REFERENCES instructors(account_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subject_faculty_instructor ON subject_faculty(instructor_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subject_enrollments(
            subject_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            PRIMARY KEY(subject_id, student_id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(student_id) REFERENCES students(account_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subject_enrollments_student ON subject_enrollments(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS marking_sessions(
            id TEXT PRIMARY KEY,
            instructor_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            batch_year INTEGER NOT NULL,
            marked_on TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(instructor_id) REFERENCES instructors(account_id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_marking_sessions_instructor ON marking_sessions(instructor_id)",
        [],
    )?;
    // The duplicate-day guard probes on this exact tuple.
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_marking_sessions_scope
         ON marking_sessions(instructor_id, subject_id, batch_year, marked_on)",
        [],
    )?;

    // Ledger rows record the request verbatim, so student_id deliberately has
    // no foreign key: a reference that fails to resolve on the student side
    // must still be visible here for reconciliation.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS marking_session_entries(
            session_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            status TEXT NOT NULL,
            entry_ref TEXT NOT NULL,
            PRIMARY KEY(session_id, student_id),
            FOREIGN KEY(session_id) REFERENCES marking_sessions(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_marking_session_entries_session ON marking_session_entries(session_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_entries(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            marked_on TEXT NOT NULL,
            status TEXT NOT NULL,
            marked_by TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(account_id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(marked_by) REFERENCES instructors(account_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_entries_student ON attendance_entries(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_entries_subject_day ON attendance_entries(subject_id, marked_on)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_entries_student_subject ON attendance_entries(student_id, subject_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subject_stats(
            subject_id TEXT NOT NULL,
            batch_year INTEGER NOT NULL,
            total_classes INTEGER NOT NULL,
            average_attendance REAL NOT NULL,
            last_updated TEXT NOT NULL,
            PRIMARY KEY(subject_id, batch_year),
            FOREIGN KEY(subject_id) REFERENCES subjects(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_subject_stats(
            student_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            present_count INTEGER NOT NULL,
            entry_count INTEGER NOT NULL,
            percentage REAL NOT NULL,
            PRIMARY KEY(student_id, subject_id),
            FOREIGN KEY(student_id) REFERENCES students(account_id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_student_subject_stats_subject ON student_subject_stats(subject_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS announcements(
            id TEXT PRIMARY KEY,
            admin_id TEXT NOT NULL,
            title TEXT NOT NULL,
            body TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(admin_id) REFERENCES accounts(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_announcements_admin ON announcements(admin_id)",
        [],
    )?;

    // Normalize status codes from pre-release workspaces:
    // - "on_leave" => "leave"
    migrate_entry_statuses(&conn)?;

    Ok(conn)
}

/// Unix-seconds timestamp string, the storage format for `created_at`,
/// `last_login` and `last_updated` columns.
pub fn now_ts() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}

fn ensure_accounts_last_login(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "accounts", "last_login")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE accounts ADD COLUMN last_login TEXT", [])?;
    Ok(())
}

fn ensure_students_subscription_meta(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "students", "subscription_plan")? {
        conn.execute("ALTER TABLE students ADD COLUMN subscription_plan TEXT", [])?;
    }
    if !table_has_column(conn, "students", "subscription_start")? {
        conn.execute("ALTER TABLE students ADD COLUMN subscription_start TEXT", [])?;
    }
    if !table_has_column(conn, "students", "subscription_end")? {
        conn.execute("ALTER TABLE students ADD COLUMN subscription_end TEXT", [])?;
    }
    Ok(())
}

fn migrate_entry_statuses(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE attendance_entries SET status = 'leave' WHERE status = 'on_leave'",
        [],
    )?;
    conn.execute(
        "UPDATE marking_session_entries SET status = 'leave' WHERE status = 'on_leave'",
        [],
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
