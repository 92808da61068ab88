use std::collections::BTreeSet;

use log::info;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::error::MentorLoopError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Professional {
    pub professional_id: i64,
    pub name: String,
}

impl Professional {
    pub fn create(conn: &Connection, name: &str) -> Result<Self, MentorLoopError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(MentorLoopError::Validation(
                "Professional name must not be empty".into(),
            ));
        }

        let professional_id: i64 = conn.query_row(
            "INSERT INTO professionals (name, created_at) VALUES (?, ?) RETURNING professional_id",
            params![name, chrono::Utc::now().timestamp()],
            |row| row.get(0),
        )?;

        info!("Created professional {} ({})", professional_id, name);

        Ok(Professional {
            professional_id,
            name: name.to_owned(),
        })
    }

    pub fn get_by_id(conn: &Connection, professional_id: i64) -> Result<Option<Self>, MentorLoopError> {
        conn.query_row(
            "SELECT name FROM professionals WHERE professional_id = ?",
            [professional_id],
            |row| {
                Ok(Professional {
                    professional_id,
                    name: row.get(0)?,
                })
            },
        )
        .optional()
        .map_err(MentorLoopError::DatabaseError)
    }
}

/// Cached derived values. Written only by the gamification pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedStats {
    pub total_points: u64,
    pub level: u32,
    pub streak: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Student {
    pub student_id: i64,
    pub professional_id: i64,
    pub name: String,
    pub assigned_programs: BTreeSet<i64>,
    pub stats: CachedStats,
}

impl Student {
    pub fn create(conn: &Connection, professional_id: i64, name: &str) -> Result<Self, MentorLoopError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(MentorLoopError::Validation(
                "Student name must not be empty".into(),
            ));
        }
        if Professional::get_by_id(conn, professional_id)?.is_none() {
            return Err(MentorLoopError::not_found("Professional", professional_id));
        }

        let student_id: i64 = conn.query_row(
            "INSERT INTO students (professional_id, name, created_at) VALUES (?, ?, ?) RETURNING student_id",
            params![professional_id, name, chrono::Utc::now().timestamp()],
            |row| row.get(0),
        )?;

        info!(
            "Created student {} ({}) for professional {}",
            student_id, name, professional_id
        );

        Ok(Student {
            student_id,
            professional_id,
            name: name.to_owned(),
            assigned_programs: BTreeSet::new(),
            stats: CachedStats {
                total_points: 0,
                level: 1,
                streak: 0,
            },
        })
    }

    pub fn get_by_id(conn: &Connection, student_id: i64) -> Result<Option<Self>, MentorLoopError> {
        let student = conn
            .query_row(
                "SELECT professional_id, name, total_points, level, streak
                FROM students
                WHERE student_id = ?",
                [student_id],
                |row| {
                    Ok(Student {
                        student_id,
                        professional_id: row.get(0)?,
                        name: row.get(1)?,
                        assigned_programs: BTreeSet::new(),
                        stats: CachedStats {
                            total_points: row.get::<_, i64>(2)?.max(0) as u64,
                            level: row.get(3)?,
                            streak: row.get(4)?,
                        },
                    })
                },
            )
            .optional()?;

        match student {
            Some(mut student) => {
                student.assigned_programs = Self::assigned_programs(conn, student_id)?;
                Ok(Some(student))
            }
            None => Ok(None),
        }
    }

    pub fn require(conn: &Connection, student_id: i64) -> Result<Self, MentorLoopError> {
        Self::get_by_id(conn, student_id)?.ok_or(MentorLoopError::not_found("Student", student_id))
    }

    /// Student side of the student/program cross reference
    pub fn assigned_programs(conn: &Connection, student_id: i64) -> Result<BTreeSet<i64>, MentorLoopError> {
        let mut stmt = conn.prepare(
            "SELECT program_id FROM student_programs WHERE student_id = ? ORDER BY program_id",
        )?;
        let rows = stmt.query_map([student_id], |row| row.get::<_, i64>(0))?;

        let mut programs = BTreeSet::new();
        for row in rows {
            programs.insert(row?);
        }
        Ok(programs)
    }

    /// IMPORTANT: Caller must hold an immediate transaction
    pub fn add_program_immediate(conn: &Connection, student_id: i64, program_id: i64) -> Result<(), MentorLoopError> {
        conn.execute(
            "INSERT OR IGNORE INTO student_programs (student_id, program_id) VALUES (?, ?)",
            [student_id, program_id],
        )?;
        Ok(())
    }

    /// IMPORTANT: Caller must hold an immediate transaction
    pub fn remove_program_immediate(conn: &Connection, student_id: i64, program_id: i64) -> Result<(), MentorLoopError> {
        conn.execute(
            "DELETE FROM student_programs WHERE student_id = ? AND program_id = ?",
            [student_id, program_id],
        )?;
        Ok(())
    }

    /// IMPORTANT: Caller must hold an immediate transaction
    pub fn write_stats_immediate(conn: &Connection, student_id: i64, stats: &CachedStats) -> Result<(), MentorLoopError> {
        let rows = conn.execute(
            "UPDATE students SET total_points = ?, level = ?, streak = ? WHERE student_id = ?",
            params![stats.total_points as i64, stats.level, stats.streak, student_id],
        )?;
        if rows == 0 {
            return Err(MentorLoopError::not_found("Student", student_id));
        }
        Ok(())
    }

    pub fn is_owned_by(&self, professional_id: i64) -> bool {
        self.professional_id == professional_id
    }
}
