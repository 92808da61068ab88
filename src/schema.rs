pub const SCHEMA_VERSION: &str = "1";

pub const CREATE_SCHEMA_SQL: &str = r#"
BEGIN TRANSACTION;

CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

INSERT OR REPLACE INTO meta (key, value) VALUES ('schema_version', '1');

-- Professionals author programs and schedules and own students
CREATE TABLE IF NOT EXISTS professionals (
    professional_id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

-- Students carry cached gamification stats (never hand-edited)
CREATE TABLE IF NOT EXISTS students (
    student_id INTEGER PRIMARY KEY AUTOINCREMENT,
    professional_id INTEGER NOT NULL,
    name TEXT NOT NULL,
    total_points INTEGER NOT NULL DEFAULT 0,
    level INTEGER NOT NULL DEFAULT 1,
    streak INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    FOREIGN KEY (professional_id) REFERENCES professionals(professional_id)
);

-- ========================================
-- Curriculum hierarchy: program > module > activity
-- ========================================
CREATE TABLE IF NOT EXISTS programs (
    program_id INTEGER PRIMARY KEY AUTOINCREMENT,
    professional_id INTEGER NOT NULL,
    title TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    FOREIGN KEY (professional_id) REFERENCES professionals(professional_id)
);

CREATE TABLE IF NOT EXISTS modules (
    module_id INTEGER PRIMARY KEY AUTOINCREMENT,
    program_id INTEGER NOT NULL,
    title TEXT NOT NULL,
    module_order INTEGER NOT NULL,
    FOREIGN KEY (program_id) REFERENCES programs(program_id)
);

CREATE INDEX IF NOT EXISTS idx_modules_program ON modules (program_id, module_order);

CREATE TABLE IF NOT EXISTS activities (
    activity_id INTEGER PRIMARY KEY AUTOINCREMENT,
    module_id INTEGER NOT NULL,
    title TEXT NOT NULL,
    kind TEXT NOT NULL,                    -- JSON encoded ActivityKind
    points INTEGER NOT NULL CHECK (points >= 0),
    estimated_minutes INTEGER NOT NULL CHECK (estimated_minutes >= 0),
    is_required BOOLEAN NOT NULL,
    position INTEGER NOT NULL,
    FOREIGN KEY (module_id) REFERENCES modules(module_id)
);

CREATE INDEX IF NOT EXISTS idx_activities_module ON activities (module_id, position);

-- ========================================
-- Cross references kept consistent by the assignment protocol
-- ========================================
-- Student side
CREATE TABLE IF NOT EXISTS student_programs (
    student_id INTEGER NOT NULL,
    program_id INTEGER NOT NULL,
    PRIMARY KEY (student_id, program_id),
    FOREIGN KEY (student_id) REFERENCES students(student_id),
    FOREIGN KEY (program_id) REFERENCES programs(program_id)
);

-- Program side
CREATE TABLE IF NOT EXISTS program_students (
    program_id INTEGER NOT NULL,
    student_id INTEGER NOT NULL,
    PRIMARY KEY (program_id, student_id),
    FOREIGN KEY (program_id) REFERENCES programs(program_id),
    FOREIGN KEY (student_id) REFERENCES students(student_id)
);

CREATE TABLE IF NOT EXISTS assignments (
    assignment_id INTEGER PRIMARY KEY AUTOINCREMENT,
    student_id INTEGER NOT NULL,
    program_id INTEGER NOT NULL,
    assigned_by INTEGER NOT NULL,
    status TEXT NOT NULL,                  -- active | paused | completed | cancelled
    start_date TEXT NOT NULL,              -- YYYY-MM-DD
    end_date TEXT DEFAULT NULL,            -- YYYY-MM-DD
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    UNIQUE (student_id, program_id),
    FOREIGN KEY (student_id) REFERENCES students(student_id),
    FOREIGN KEY (program_id) REFERENCES programs(program_id),
    FOREIGN KEY (assigned_by) REFERENCES professionals(professional_id)
);

-- Append-only completed activity set of an assignment. activity_id has no foreign key;
-- stale ids are ignored by aggregation.
CREATE TABLE IF NOT EXISTS assignment_completions (
    assignment_id INTEGER NOT NULL,
    activity_id INTEGER NOT NULL,
    completed_at INTEGER NOT NULL,         -- first completion
    last_write_at INTEGER NOT NULL,        -- completion time of the latest write, detects retries
    time_spent_minutes INTEGER NOT NULL DEFAULT 0,
    answer TEXT DEFAULT NULL,              -- JSON payload
    PRIMARY KEY (assignment_id, activity_id),
    FOREIGN KEY (assignment_id) REFERENCES assignments(assignment_id)
);

CREATE TABLE IF NOT EXISTS notifications (
    notification_id INTEGER PRIMARY KEY AUTOINCREMENT,
    student_id INTEGER NOT NULL,
    kind TEXT NOT NULL,
    message TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    is_read BOOLEAN NOT NULL DEFAULT 0,
    FOREIGN KEY (student_id) REFERENCES students(student_id)
);

-- ========================================
-- Schedule hierarchy: week > day > activity
-- ========================================
CREATE TABLE IF NOT EXISTS weekly_schedules (
    schedule_id INTEGER PRIMARY KEY AUTOINCREMENT,
    professional_id INTEGER NOT NULL,
    student_id INTEGER NOT NULL,
    title TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    FOREIGN KEY (professional_id) REFERENCES professionals(professional_id),
    FOREIGN KEY (student_id) REFERENCES students(student_id)
);

CREATE TABLE IF NOT EXISTS schedule_activities (
    activity_id INTEGER PRIMARY KEY AUTOINCREMENT,
    schedule_id INTEGER NOT NULL,
    weekday INTEGER NOT NULL CHECK (weekday BETWEEN 0 AND 6),   -- 0 = Monday
    title TEXT NOT NULL,
    kind TEXT NOT NULL,                    -- JSON encoded ActivityKind
    points INTEGER NOT NULL CHECK (points >= 0),
    estimated_minutes INTEGER NOT NULL CHECK (estimated_minutes >= 0),
    is_required BOOLEAN NOT NULL,
    position INTEGER NOT NULL,
    current_streak INTEGER NOT NULL DEFAULT 0,
    max_streak INTEGER NOT NULL DEFAULT 0,
    FOREIGN KEY (schedule_id) REFERENCES weekly_schedules(schedule_id)
);

CREATE INDEX IF NOT EXISTS idx_schedule_activities_day ON schedule_activities (schedule_id, weekday, position);

-- Habit completion-date history; the single source of truth for streaks
CREATE TABLE IF NOT EXISTS habit_completions (
    activity_id INTEGER NOT NULL,
    completed_on TEXT NOT NULL,            -- YYYY-MM-DD
    PRIMARY KEY (activity_id, completed_on),
    FOREIGN KEY (activity_id) REFERENCES schedule_activities(activity_id)
);

CREATE TABLE IF NOT EXISTS schedule_progress (
    student_id INTEGER NOT NULL,
    schedule_id INTEGER NOT NULL,
    activity_id INTEGER NOT NULL,
    completed BOOLEAN NOT NULL,
    completed_at INTEGER DEFAULT NULL,
    last_write_at INTEGER NOT NULL,        -- completion time of the latest write, detects retries
    time_spent_minutes INTEGER NOT NULL DEFAULT 0,
    answer TEXT DEFAULT NULL,              -- JSON payload
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (student_id, schedule_id, activity_id),
    CHECK (completed = 1 OR completed_at IS NULL),
    FOREIGN KEY (student_id) REFERENCES students(student_id),
    FOREIGN KEY (schedule_id) REFERENCES weekly_schedules(schedule_id)
);

COMMIT;
"#;
