use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("examd.sqlite3");
    let conn = Connection::open(db_path)?;
    init_schema(&conn)?;
    Ok(conn)
}

#[cfg(test)]
pub fn open_in_memory() -> anyhow::Result<Connection> {
    let conn = Connection::open_in_memory()?;
    init_schema(&conn)?;
    Ok(conn)
}

fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            teacher_id INTEGER NOT NULL,
            grade_level INTEGER
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_classes_teacher ON classes(teacher_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id INTEGER PRIMARY KEY,
            class_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class_sort ON students(class_id, sort_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            sort_order INTEGER NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS sub_subjects(
            id INTEGER PRIMARY KEY,
            subject_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(subject_id) REFERENCES subjects(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sub_subjects_subject ON sub_subjects(subject_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS templates(
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            teacher_id INTEGER NOT NULL,
            grade_level INTEGER,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_templates_teacher_grade ON templates(teacher_id, grade_level)",
        [],
    )?;

    // Order columns are engine-assigned; see template::assign_orders.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS template_subjects(
            template_id INTEGER NOT NULL,
            subject_id INTEGER NOT NULL,
            subject_order INTEGER NOT NULL,
            PRIMARY KEY(template_id, subject_id),
            FOREIGN KEY(template_id) REFERENCES templates(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS template_sub_subjects(
            template_id INTEGER NOT NULL,
            subject_id INTEGER NOT NULL,
            sub_subject_id INTEGER NOT NULL,
            sub_subject_order INTEGER NOT NULL,
            PRIMARY KEY(template_id, subject_id, sub_subject_id),
            FOREIGN KEY(template_id, subject_id) REFERENCES template_subjects(template_id, subject_id),
            FOREIGN KEY(sub_subject_id) REFERENCES sub_subjects(id)
        )",
        [],
    )?;

    // template_id is informational only: it is cleared when the template is
    // hard-deleted, which is what leaves rows for the matcher to identify.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS scores(
            id INTEGER PRIMARY KEY,
            student_id INTEGER NOT NULL,
            class_id INTEGER NOT NULL,
            month INTEGER NOT NULL,
            year INTEGER NOT NULL,
            subject_id INTEGER NOT NULL,
            sub_subject_id INTEGER,
            score REAL,
            template_id INTEGER,
            updated_at TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(sub_subject_id) REFERENCES sub_subjects(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_scores_identity ON scores(
            class_id, month, year, student_id, subject_id, IFNULL(sub_subject_id, 0)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_scores_template ON scores(template_id)",
        [],
    )?;

    Ok(())
}
