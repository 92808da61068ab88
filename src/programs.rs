use std::collections::{BTreeSet, HashMap};

use chrono::NaiveDate;
use log::{info, warn};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::activity::{Activity, ActivityKind, DeletePolicy, NewActivity};
use crate::aggregate::{Branch, Leaf, Tree};
use crate::assignments::Assignments;
use crate::config::GamificationConfig;
use crate::database::Database;
use crate::error::MentorLoopError;
use crate::gamification::Gamification;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Module {
    pub module_id: i64,
    pub title: String,
    pub order: i64,
    pub activities: Vec<Activity>,
}

/// A curriculum: ordered modules of ordered activities
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub program_id: i64,
    pub professional_id: i64,
    pub title: String,
    pub modules: Vec<Module>,
    pub assigned_students: BTreeSet<i64>,
}

impl Leaf for Activity {
    fn leaf_id(&self) -> i64 {
        self.activity_id
    }

    fn points(&self) -> u32 {
        self.points
    }

    fn estimated_minutes(&self) -> u32 {
        self.estimated_minutes
    }
}

impl Branch for Module {
    type Leaf = Activity;

    fn branch_id(&self) -> i64 {
        self.module_id
    }

    fn leaves(&self) -> &[Activity] {
        &self.activities
    }
}

impl Tree for Program {
    type Branch = Module;

    fn branches(&self) -> &[Module] {
        &self.modules
    }
}

/// Result of deleting a curriculum activity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityDeletion {
    pub activity_id: i64,
    /// Students whose completion rows were removed and whose stats need recomputing
    pub affected_students: Vec<i64>,
}

impl Program {
    pub fn create(conn: &Connection, professional_id: i64, title: &str) -> Result<Self, MentorLoopError> {
        let title = title.trim();
        if title.is_empty() {
            return Err(MentorLoopError::Validation(
                "Program title must not be empty".into(),
            ));
        }

        let program_id: i64 = conn
            .query_row(
                "INSERT INTO programs (professional_id, title, created_at) VALUES (?, ?, ?) RETURNING program_id",
                params![professional_id, title, chrono::Utc::now().timestamp()],
                |row| row.get(0),
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(ref f, _)
                    if f.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    MentorLoopError::not_found("Professional", professional_id)
                }
                other => MentorLoopError::DatabaseError(other),
            })?;

        info!("Created program {} '{}'", program_id, title);

        Ok(Program {
            program_id,
            professional_id,
            title: title.to_owned(),
            modules: Vec::new(),
            assigned_students: BTreeSet::new(),
        })
    }

    /// Load a program with its full module tree and assigned students
    pub fn get_by_id(conn: &Connection, program_id: i64) -> Result<Option<Self>, MentorLoopError> {
        let header = conn
            .query_row(
                "SELECT professional_id, title FROM programs WHERE program_id = ?",
                [program_id],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;

        let Some((professional_id, title)) = header else {
            return Ok(None);
        };

        let mut modules: Vec<Module> = Vec::new();
        let mut index_by_id: HashMap<i64, usize> = HashMap::new();
        {
            let mut stmt = conn.prepare(
                "SELECT module_id, title, module_order
                FROM modules
                WHERE program_id = ?
                ORDER BY module_order ASC, module_id ASC",
            )?;
            let rows = stmt.query_map([program_id], |row| {
                Ok(Module {
                    module_id: row.get(0)?,
                    title: row.get(1)?,
                    order: row.get(2)?,
                    activities: Vec::new(),
                })
            })?;
            for row in rows {
                let module = row?;
                index_by_id.insert(module.module_id, modules.len());
                modules.push(module);
            }
        }

        {
            let mut stmt = conn.prepare(
                "SELECT a.activity_id, a.module_id, a.title, a.kind, a.points,
                    a.estimated_minutes, a.is_required, a.position
                FROM activities a
                JOIN modules m ON m.module_id = a.module_id
                WHERE m.program_id = ?
                ORDER BY a.position ASC, a.activity_id ASC",
            )?;
            let rows = stmt.query_map([program_id], |row| {
                Ok((
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(3)?,
                    Activity {
                        activity_id: row.get(0)?,
                        title: row.get(2)?,
                        kind: ActivityKind::Note { body: String::new() },
                        points: row.get(4)?,
                        estimated_minutes: row.get(5)?,
                        is_required: row.get(6)?,
                        position: row.get(7)?,
                    },
                ))
            })?;
            for row in rows {
                let (module_id, kind_json, mut activity) = row?;
                activity.kind = ActivityKind::from_json(&kind_json)?;
                if let Some(&idx) = index_by_id.get(&module_id) {
                    modules[idx].activities.push(activity);
                }
            }
        }

        let assigned_students = Self::assigned_students(conn, program_id)?;

        Ok(Some(Program {
            program_id,
            professional_id,
            title,
            modules,
            assigned_students,
        }))
    }

    pub fn require(conn: &Connection, program_id: i64) -> Result<Self, MentorLoopError> {
        Self::get_by_id(conn, program_id)?.ok_or(MentorLoopError::not_found("Program", program_id))
    }

    /// Owner of the program, without loading the tree
    pub fn owner_of(conn: &Connection, program_id: i64) -> Result<Option<i64>, MentorLoopError> {
        conn.query_row(
            "SELECT professional_id FROM programs WHERE program_id = ?",
            [program_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(MentorLoopError::DatabaseError)
    }

    fn require_owner(conn: &Connection, program_id: i64, professional_id: i64) -> Result<(), MentorLoopError> {
        match Self::owner_of(conn, program_id)? {
            None => Err(MentorLoopError::not_found("Program", program_id)),
            Some(owner) if owner != professional_id => Err(MentorLoopError::Unauthorized(format!(
                "Professional {} does not own program {}",
                professional_id, program_id
            ))),
            Some(_) => Ok(()),
        }
    }

    /// Program side of the student/program cross reference
    pub fn assigned_students(conn: &Connection, program_id: i64) -> Result<BTreeSet<i64>, MentorLoopError> {
        let mut stmt = conn.prepare(
            "SELECT student_id FROM program_students WHERE program_id = ? ORDER BY student_id",
        )?;
        let rows = stmt.query_map([program_id], |row| row.get::<_, i64>(0))?;

        let mut students = BTreeSet::new();
        for row in rows {
            students.insert(row?);
        }
        Ok(students)
    }

    /// IMPORTANT: Caller must hold an immediate transaction
    pub fn add_student_immediate(conn: &Connection, program_id: i64, student_id: i64) -> Result<(), MentorLoopError> {
        conn.execute(
            "INSERT OR IGNORE INTO program_students (program_id, student_id) VALUES (?, ?)",
            [program_id, student_id],
        )?;
        Ok(())
    }

    /// IMPORTANT: Caller must hold an immediate transaction
    pub fn remove_student_immediate(conn: &Connection, program_id: i64, student_id: i64) -> Result<(), MentorLoopError> {
        conn.execute(
            "DELETE FROM program_students WHERE program_id = ? AND student_id = ?",
            [program_id, student_id],
        )?;
        Ok(())
    }

    /// Append a module at the end of the program. Orders start at 1.
    pub fn add_module(
        conn: &Connection,
        professional_id: i64,
        program_id: i64,
        title: &str,
    ) -> Result<Module, MentorLoopError> {
        let title = title.trim();
        if title.is_empty() {
            return Err(MentorLoopError::Validation(
                "Module title must not be empty".into(),
            ));
        }

        Database::immediate_transaction(conn, |c| {
            Self::require_owner(c, program_id, professional_id)?;

            let (module_id, order): (i64, i64) = c.query_row(
                "INSERT INTO modules (program_id, title, module_order)
                VALUES (?1, ?2, (SELECT COALESCE(MAX(module_order), 0) + 1 FROM modules WHERE program_id = ?1))
                RETURNING module_id, module_order",
                params![program_id, title],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;

            info!(
                "Added module {} '{}' to program {} at order {}",
                module_id, title, program_id, order
            );

            Ok(Module {
                module_id,
                title: title.to_owned(),
                order,
                activities: Vec::new(),
            })
        })
    }

    /// Append an activity at the end of a module. Students who had finished the
    /// program get their assignment back to active.
    pub fn add_activity(
        conn: &Connection,
        professional_id: i64,
        module_id: i64,
        new_activity: &NewActivity,
    ) -> Result<Activity, MentorLoopError> {
        let measures = new_activity.validate()?;
        let kind_json = new_activity.kind.to_json()?;

        Database::immediate_transaction(conn, |c| {
            let program_id: i64 = c
                .query_row(
                    "SELECT program_id FROM modules WHERE module_id = ?",
                    [module_id],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or(MentorLoopError::not_found("Module", module_id))?;
            Self::require_owner(c, program_id, professional_id)?;

            let (activity_id, position): (i64, i64) = c.query_row(
                "INSERT INTO activities (module_id, title, kind, points, estimated_minutes, is_required, position)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, (SELECT COALESCE(MAX(position), 0) + 1 FROM activities WHERE module_id = ?1))
                RETURNING activity_id, position",
                params![
                    module_id,
                    new_activity.title.trim(),
                    kind_json,
                    measures.points,
                    measures.estimated_minutes,
                    new_activity.is_required,
                ],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;

            info!(
                "Added {} activity {} to module {} of program {}",
                new_activity.kind.type_name(),
                activity_id,
                module_id,
                program_id
            );
            Assignments::reopen_completed_immediate(c, program_id)?;

            Ok(Activity {
                activity_id,
                title: new_activity.title.trim().to_owned(),
                kind: new_activity.kind.clone(),
                points: measures.points,
                estimated_minutes: measures.estimated_minutes,
                is_required: new_activity.is_required,
                position,
            })
        })
    }

    /// Program that currently contains the activity, if any
    pub fn program_of_activity(conn: &Connection, activity_id: i64) -> Result<Option<i64>, MentorLoopError> {
        conn.query_row(
            "SELECT m.program_id
            FROM activities a
            JOIN modules m ON m.module_id = a.module_id
            WHERE a.activity_id = ?",
            [activity_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(MentorLoopError::DatabaseError)
    }

    /// Delete an activity, honoring the referential-integrity policy for
    /// assignment completions that reference it. Students who lose completions
    /// get their stats recomputed in the same transaction.
    pub fn delete_activity(
        conn: &Connection,
        professional_id: i64,
        activity_id: i64,
        policy: DeletePolicy,
        gamification: &GamificationConfig,
        reference_date: NaiveDate,
    ) -> Result<ActivityDeletion, MentorLoopError> {
        Database::immediate_transaction(conn, |c| {
            let program_id = Self::program_of_activity(c, activity_id)?
                .ok_or(MentorLoopError::not_found("Activity", activity_id))?;
            Self::require_owner(c, program_id, professional_id)?;

            let mut affected_students = Vec::new();
            {
                let mut stmt = c.prepare(
                    "SELECT DISTINCT asg.student_id
                    FROM assignment_completions ac
                    JOIN assignments asg ON asg.assignment_id = ac.assignment_id
                    WHERE ac.activity_id = ? AND asg.program_id = ?
                    ORDER BY asg.student_id",
                )?;
                let rows = stmt.query_map([activity_id, program_id], |row| row.get::<_, i64>(0))?;
                for row in rows {
                    affected_students.push(row?);
                }
            }

            if !affected_students.is_empty() {
                match policy {
                    DeletePolicy::Reject => {
                        return Err(MentorLoopError::ReferentialIntegrity(format!(
                            "Activity {} is completed in {} assignment(s)",
                            activity_id,
                            affected_students.len()
                        )));
                    }
                    DeletePolicy::Cascade => {
                        let removed = c.execute(
                            "DELETE FROM assignment_completions
                            WHERE activity_id = ?1
                            AND assignment_id IN (SELECT assignment_id FROM assignments WHERE program_id = ?2)",
                            [activity_id, program_id],
                        )?;
                        warn!(
                            "Cascade delete of activity {} removed {} completion row(s)",
                            activity_id, removed
                        );
                    }
                }
            }

            c.execute("DELETE FROM activities WHERE activity_id = ?", [activity_id])?;
            info!("Deleted activity {} from program {}", activity_id, program_id);

            for &student_id in &affected_students {
                Gamification::recompute_student_stats_immediate(c, student_id, gamification, reference_date)?;
            }

            Ok(ActivityDeletion {
                activity_id,
                affected_students,
            })
        })
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::database::test_support::test_db;
    use crate::students::Professional;

    #[test]
    fn test_program_tree_round_trip() {
        let (_dir, db) = test_db();
        let conn = db.get_connection().unwrap();
        let pro = Professional::create(&conn, "Dr. Ruiz").unwrap();

        let program = sample_program(&conn, pro.professional_id);
        assert_eq!(program.modules.len(), 2);
        assert_eq!(program.modules[0].order, 1);
        assert_eq!(program.modules[1].order, 2);
        assert_eq!(program.modules[0].activities.len(), 2);
        assert_eq!(program.modules[0].activities[1].title, "4-7-8 breathing");
        assert_eq!(program.modules[0].activities[1].position, 2);
        assert_eq!(program.modules[1].activities[0].points, 10);
        assert!(program.assigned_students.is_empty());
    }

    #[test]
    fn test_missing_program() {
        let (_dir, db) = test_db();
        let conn = db.get_connection().unwrap();
        assert!(Program::get_by_id(&conn, 9).unwrap().is_none());
        assert!(matches!(
            Program::require(&conn, 9),
            Err(MentorLoopError::NotFound { entity: "Program", id: 9 })
        ));
    }

    #[test]
    fn test_only_owner_may_edit() {
        let (_dir, db) = test_db();
        let conn = db.get_connection().unwrap();
        let owner = Professional::create(&conn, "Dr. Ruiz").unwrap();
        let other = Professional::create(&conn, "Dr. Stone").unwrap();

        let program = Program::create(&conn, owner.professional_id, "Sleep").unwrap();
        let result = Program::add_module(&conn, other.professional_id, program.program_id, "Evening");
        assert!(matches!(result, Err(MentorLoopError::Unauthorized(_))));
    }

    #[test]
    fn test_invalid_activity_rejected_before_write() {
        let (_dir, db) = test_db();
        let conn = db.get_connection().unwrap();
        let pro = Professional::create(&conn, "Dr. Ruiz").unwrap();
        let program = Program::create(&conn, pro.professional_id, "Sleep").unwrap();
        let module = Program::add_module(&conn, pro.professional_id, program.program_id, "Evening").unwrap();

        let result = Program::add_activity(&conn, pro.professional_id, module.module_id, &note("Bad", -1));
        assert!(matches!(result, Err(MentorLoopError::Validation(_))));
        assert!(Program::require(&conn, program.program_id).unwrap().modules[0]
            .activities
            .is_empty());
    }

    #[test]
    fn test_delete_unreferenced_activity() {
        let (_dir, db) = test_db();
        let conn = db.get_connection().unwrap();
        let pro = Professional::create(&conn, "Dr. Ruiz").unwrap();
        let program = sample_program(&conn, pro.professional_id);
        let activity_id = program.modules[1].activities[0].activity_id;

        let deletion =
            Program::delete_activity(
                &conn,
                pro.professional_id,
                activity_id,
                DeletePolicy::Reject,
                &GamificationConfig::default(),
                NaiveDate::from_ymd_opt(2025, 1, 6).unwrap(),
            )
            .unwrap();
        assert!(deletion.affected_students.is_empty());
        assert!(Program::program_of_activity(&conn, activity_id).unwrap().is_none());
        assert!(Program::require(&conn, program.program_id).unwrap().modules[1]
            .activities
            .is_empty());
    }
}
