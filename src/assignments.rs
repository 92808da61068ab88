use std::collections::{BTreeSet, HashSet};

use chrono::NaiveDate;
use log::{debug, error, info, warn};
use rusqlite::{named_params, params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString};

use crate::aggregate::leaf_ids;
use crate::database::Database;
use crate::error::MentorLoopError;
use crate::ledger::CompletionMeta;
use crate::notifications::{NotificationKind, Notifications};
use crate::programs::Program;
use crate::schedules::{format_date, parse_date};
use crate::students::Student;

#[derive(AsRefStr, EnumIter, EnumString, Display, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    Active,
    Paused,
    Completed,
    Cancelled,
}

impl AssignmentStatus {
    /// Whether a requested status change is allowed. Re-setting the same status is a
    /// no-op and allowed. Completed assignments only return to active when their
    /// program gains an activity, see `Assignments::reopen_completed_immediate`.
    pub fn can_transition_to(self, next: AssignmentStatus) -> bool {
        use AssignmentStatus::*;
        match (self, next) {
            (a, b) if a == b => true,
            (Cancelled, _) => false,
            (Completed, Cancelled) => true,
            (Completed, _) => false,
            (Active | Paused, _) => true,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, AssignmentStatus::Completed | AssignmentStatus::Cancelled)
    }
}

/// Binding of one student to one program plus the student's curriculum completions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub assignment_id: i64,
    pub student_id: i64,
    pub program_id: i64,
    pub assigned_by: i64,
    pub status: AssignmentStatus,
    pub completed_activity_ids: BTreeSet<i64>,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    pub created_at: i64,
}

/// Metadata recorded with a curriculum completion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignmentCompletion {
    pub activity_id: i64,
    pub completed_at: i64,
    pub time_spent_minutes: u32,
    pub answer: Option<serde_json::Value>,
}

/// Atomicity boundary of a multi-student assignment call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    /// Every student and every cross reference commits together or not at all
    #[default]
    WholeCall,
    /// Invalid students are skipped and each remaining student commits on its own
    PerStudent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignOptions {
    pub assigned_by: i64,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    pub notify: bool,
    pub granularity: Granularity,
}

impl AssignOptions {
    pub fn new(assigned_by: i64, start_date: NaiveDate) -> Self {
        AssignOptions {
            assigned_by,
            start_date,
            end_date: None,
            notify: false,
            granularity: Granularity::WholeCall,
        }
    }

    fn validate(&self) -> Result<(), MentorLoopError> {
        if let Some(end) = self.end_date {
            if end < self.start_date {
                return Err(MentorLoopError::Validation(format!(
                    "End date {} is before start date {}",
                    end, self.start_date
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedStudent {
    pub student_id: i64,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentOutcome {
    pub created: Vec<i64>,
    pub already_assigned: Vec<i64>,
    pub reactivated: Vec<i64>,
    pub rejected: Vec<RejectedStudent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StudentEffect {
    Created,
    AlreadyAssigned,
    Reactivated,
}

impl AssignmentOutcome {
    fn record(&mut self, student_id: i64, effect: StudentEffect) {
        match effect {
            StudentEffect::Created => self.created.push(student_id),
            StudentEffect::AlreadyAssigned => self.already_assigned.push(student_id),
            StudentEffect::Reactivated => self.reactivated.push(student_id),
        }
    }

    /// Students whose assignment was written by this call
    pub fn changed_students(&self) -> impl Iterator<Item = i64> + '_ {
        self.created.iter().chain(self.reactivated.iter()).copied()
    }
}

/// Which side of the student/program cross reference disagrees with the assignments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrossReferenceIssueKind {
    MissingStudentReference,
    MissingProgramReference,
    DanglingStudentReference,
    DanglingProgramReference,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossReferenceIssue {
    pub student_id: i64,
    pub program_id: i64,
    pub kind: CrossReferenceIssueKind,
}

fn to_atomic_failure(err: MentorLoopError) -> MentorLoopError {
    match err {
        MentorLoopError::DatabaseError(e) => MentorLoopError::AtomicFailure(e.to_string()),
        MentorLoopError::PoolError(e) => MentorLoopError::AtomicFailure(e.to_string()),
        other => other,
    }
}

pub struct Assignments;

impl Assignments {
    const SELECT_ASSIGNMENT: &'static str = "SELECT assignment_id, student_id, program_id, assigned_by, status, start_date, end_date, created_at
        FROM assignments";

    fn read_rows(
        conn: &Connection,
        where_clause: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<Assignment>, MentorLoopError> {
        let sql = format!(
            "{} {} ORDER BY assignment_id ASC",
            Self::SELECT_ASSIGNMENT,
            where_clause
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params, |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, i64>(7)?,
            ))
        })?;

        let mut assignments = Vec::new();
        for row in rows {
            let (assignment_id, student_id, program_id, assigned_by, status, start, end, created_at) = row?;
            let status = status.parse::<AssignmentStatus>().map_err(|_| {
                MentorLoopError::Error(format!("Invalid assignment status: '{}'", status))
            })?;
            assignments.push(Assignment {
                assignment_id,
                student_id,
                program_id,
                assigned_by,
                status,
                completed_activity_ids: Self::completed_ids(conn, assignment_id)?,
                start_date: parse_date(&start)?,
                end_date: end.as_deref().map(parse_date).transpose()?,
                created_at,
            });
        }
        Ok(assignments)
    }

    fn completed_ids(conn: &Connection, assignment_id: i64) -> Result<BTreeSet<i64>, MentorLoopError> {
        let mut stmt = conn.prepare(
            "SELECT activity_id FROM assignment_completions WHERE assignment_id = ?",
        )?;
        let rows = stmt.query_map([assignment_id], |row| row.get::<_, i64>(0))?;

        let mut ids = BTreeSet::new();
        for row in rows {
            ids.insert(row?);
        }
        Ok(ids)
    }

    pub fn get_by_id(conn: &Connection, assignment_id: i64) -> Result<Option<Assignment>, MentorLoopError> {
        Ok(Self::read_rows(conn, "WHERE assignment_id = ?", &[&assignment_id])?
            .into_iter()
            .next())
    }

    pub fn get_for_pair(
        conn: &Connection,
        student_id: i64,
        program_id: i64,
    ) -> Result<Option<Assignment>, MentorLoopError> {
        Ok(Self::read_rows(
            conn,
            "WHERE student_id = ? AND program_id = ?",
            &[&student_id, &program_id],
        )?
        .into_iter()
        .next())
    }

    pub fn for_student(conn: &Connection, student_id: i64) -> Result<Vec<Assignment>, MentorLoopError> {
        Self::read_rows(conn, "WHERE student_id = ?", &[&student_id])
    }

    pub fn completion_details(
        conn: &Connection,
        assignment_id: i64,
    ) -> Result<Vec<AssignmentCompletion>, MentorLoopError> {
        let mut stmt = conn.prepare(
            "SELECT activity_id, completed_at, time_spent_minutes, answer
            FROM assignment_completions
            WHERE assignment_id = ?
            ORDER BY completed_at ASC, activity_id ASC",
        )?;
        let rows = stmt.query_map([assignment_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, u32>(2)?,
                row.get::<_, Option<String>>(3)?,
            ))
        })?;

        let mut completions = Vec::new();
        for row in rows {
            let (activity_id, completed_at, time_spent_minutes, answer) = row?;
            completions.push(AssignmentCompletion {
                activity_id,
                completed_at,
                time_spent_minutes,
                answer: answer
                    .as_deref()
                    .map(serde_json::from_str::<serde_json::Value>)
                    .transpose()?,
            });
        }
        Ok(completions)
    }

    /// Assign a program to one or many students, keeping the assignment record,
    /// the student's program set and the program's student set consistent.
    ///
    /// Safe to retry after `AtomicFailure`: assignment creation is create-if-absent
    /// and both reference updates are set unions.
    pub fn assign_program_to_students(
        conn: &Connection,
        program_id: i64,
        student_ids: &[i64],
        options: &AssignOptions,
    ) -> Result<AssignmentOutcome, MentorLoopError> {
        options.validate()?;
        if student_ids.is_empty() {
            return Err(MentorLoopError::Validation(
                "At least one student is required".into(),
            ));
        }

        let program = Program::require(conn, program_id)?;
        if program.professional_id != options.assigned_by {
            return Err(MentorLoopError::Unauthorized(format!(
                "Professional {} does not own program {}",
                options.assigned_by, program_id
            )));
        }

        let mut seen = HashSet::new();
        let unique: Vec<i64> = student_ids.iter().copied().filter(|id| seen.insert(*id)).collect();

        let mut outcome = AssignmentOutcome::default();
        match options.granularity {
            Granularity::WholeCall => {
                let effects = Database::immediate_transaction(conn, |c| {
                    for &student_id in &unique {
                        Self::check_student(c, student_id, options.assigned_by)?;
                    }
                    let mut effects = Vec::with_capacity(unique.len());
                    for &student_id in &unique {
                        effects.push(Self::assign_one_immediate(c, &program, student_id, options)?);
                    }
                    Ok(effects)
                })
                .map_err(to_atomic_failure)
                .inspect_err(|e| {
                    error!(
                        "Assignment of program {} to {} student(s) rolled back: {}",
                        program_id,
                        unique.len(),
                        e
                    )
                })?;

                for (student_id, effect) in unique.iter().zip(effects) {
                    outcome.record(*student_id, effect);
                }
            }
            Granularity::PerStudent => {
                for student_id in unique {
                    let result = Database::immediate_transaction(conn, |c| {
                        Self::check_student(c, student_id, options.assigned_by)?;
                        Self::assign_one_immediate(c, &program, student_id, options)
                    })
                    .map_err(to_atomic_failure);

                    match result {
                        Ok(effect) => outcome.record(student_id, effect),
                        Err(e) => {
                            if e.is_retryable() {
                                error!(
                                    "Assignment of program {} to student {} rolled back: {}",
                                    program_id, student_id, e
                                );
                            } else {
                                warn!("Skipping student {}: {}", student_id, e);
                            }
                            outcome.rejected.push(RejectedStudent {
                                student_id,
                                reason: e.to_string(),
                            });
                        }
                    }
                }
            }
        }

        info!(
            "Assigned program {}: {} created, {} reactivated, {} already assigned, {} rejected",
            program_id,
            outcome.created.len(),
            outcome.reactivated.len(),
            outcome.already_assigned.len(),
            outcome.rejected.len()
        );

        Ok(outcome)
    }

    /// Rejects unknown students and students owned by another professional
    fn check_student(conn: &Connection, student_id: i64, professional_id: i64) -> Result<(), MentorLoopError> {
        match Student::get_by_id(conn, student_id)? {
            None => Err(MentorLoopError::not_found("Student", student_id)),
            Some(student) if !student.is_owned_by(professional_id) => Err(MentorLoopError::Unauthorized(format!(
                "Professional {} does not own student {}",
                professional_id, student_id
            ))),
            Some(_) => Ok(()),
        }
    }

    /// All three effects for one student: assignment record, student reference, program reference.
    ///
    /// IMPORTANT: Caller must hold an immediate transaction
    fn assign_one_immediate(
        conn: &Connection,
        program: &Program,
        student_id: i64,
        options: &AssignOptions,
    ) -> Result<StudentEffect, MentorLoopError> {
        let now = chrono::Utc::now().timestamp();
        let existing: Option<(i64, String)> = conn
            .query_row(
                "SELECT assignment_id, status FROM assignments WHERE student_id = ? AND program_id = ?",
                [student_id, program.program_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let effect = match existing {
            None => {
                conn.execute(
                    "INSERT INTO assignments
                        (student_id, program_id, assigned_by, status, start_date, end_date, created_at, updated_at)
                    VALUES (:student_id, :program_id, :assigned_by, :status, :start_date, :end_date, :now, :now)",
                    named_params! {
                        ":student_id":  student_id,
                        ":program_id":  program.program_id,
                        ":assigned_by": options.assigned_by,
                        ":status":      AssignmentStatus::Active.as_ref(),
                        ":start_date":  format_date(options.start_date),
                        ":end_date":    options.end_date.map(format_date),
                        ":now":         now,
                    },
                )?;
                StudentEffect::Created
            }
            Some((assignment_id, status)) if status == AssignmentStatus::Cancelled.as_ref() => {
                conn.execute(
                    "UPDATE assignments
                    SET status = :status, assigned_by = :assigned_by, start_date = :start_date,
                        end_date = :end_date, updated_at = :now
                    WHERE assignment_id = :assignment_id",
                    named_params! {
                        ":status":        AssignmentStatus::Active.as_ref(),
                        ":assigned_by":   options.assigned_by,
                        ":start_date":    format_date(options.start_date),
                        ":end_date":      options.end_date.map(format_date),
                        ":now":           now,
                        ":assignment_id": assignment_id,
                    },
                )?;
                StudentEffect::Reactivated
            }
            Some(_) => StudentEffect::AlreadyAssigned,
        };

        // Set unions; also repairs a missing reference on an existing assignment
        Student::add_program_immediate(conn, student_id, program.program_id)?;
        Program::add_student_immediate(conn, program.program_id, student_id)?;

        if options.notify && effect != StudentEffect::AlreadyAssigned {
            Notifications::create_immediate(
                conn,
                student_id,
                NotificationKind::ProgramAssigned,
                &format!("New program assigned: {}", program.title),
            )?;
        }

        Ok(effect)
    }

    /// Cancel the assignment and drop both cross references together
    pub fn unassign_program(
        conn: &Connection,
        program_id: i64,
        student_id: i64,
        professional_id: i64,
        today: NaiveDate,
    ) -> Result<Assignment, MentorLoopError> {
        let assignment = Self::get_for_pair(conn, student_id, program_id)?.ok_or_else(|| {
            warn!("Student {} has no assignment for program {}", student_id, program_id);
            MentorLoopError::not_found("Assignment", program_id)
        })?;
        Self::set_status(conn, assignment.assignment_id, professional_id, AssignmentStatus::Cancelled, today)
    }

    /// Move an assignment to a new status. Cancelling removes both cross references
    /// in the same transaction.
    pub fn set_status(
        conn: &Connection,
        assignment_id: i64,
        professional_id: i64,
        new_status: AssignmentStatus,
        today: NaiveDate,
    ) -> Result<Assignment, MentorLoopError> {
        let assignment = Self::get_by_id(conn, assignment_id)?
            .ok_or(MentorLoopError::not_found("Assignment", assignment_id))?;

        if Program::owner_of(conn, assignment.program_id)? != Some(professional_id) {
            return Err(MentorLoopError::Unauthorized(format!(
                "Professional {} does not own program {}",
                professional_id, assignment.program_id
            )));
        }
        if !assignment.status.can_transition_to(new_status) {
            return Err(MentorLoopError::Validation(format!(
                "Assignment {} cannot move from {} to {}",
                assignment_id, assignment.status, new_status
            )));
        }
        if assignment.status == new_status {
            return Ok(assignment);
        }

        Database::immediate_transaction(conn, |c| {
            Self::write_status_immediate(c, &assignment, new_status, today)?;
            if new_status == AssignmentStatus::Cancelled {
                Student::remove_program_immediate(c, assignment.student_id, assignment.program_id)?;
                Program::remove_student_immediate(c, assignment.program_id, assignment.student_id)?;
            }
            Ok(())
        })
        .map_err(to_atomic_failure)?;

        info!(
            "Assignment {} moved from {} to {}",
            assignment_id, assignment.status, new_status
        );

        Self::get_by_id(conn, assignment_id)?.ok_or(MentorLoopError::not_found("Assignment", assignment_id))
    }

    /// IMPORTANT: Caller must hold an immediate transaction
    fn write_status_immediate(
        conn: &Connection,
        assignment: &Assignment,
        new_status: AssignmentStatus,
        today: NaiveDate,
    ) -> Result<(), MentorLoopError> {
        let end_date = if new_status.is_terminal() {
            Some(assignment.end_date.unwrap_or(today))
        } else {
            assignment.end_date
        };
        conn.execute(
            "UPDATE assignments SET status = ?, end_date = ?, updated_at = ? WHERE assignment_id = ?",
            params![
                new_status.as_ref(),
                end_date.map(format_date),
                chrono::Utc::now().timestamp(),
                assignment.assignment_id
            ],
        )?;
        Ok(())
    }

    /// Add an activity to the student's completed set for the program. Re-completing
    /// accumulates time spent and replaces the answer but keeps the first completion
    /// time. A retry carrying the same completion time changes nothing.
    /// Moves the assignment to completed once every current activity is done.
    ///
    /// The assignment is read here, so the status check sees the same snapshot
    /// as the write.
    ///
    /// IMPORTANT: Caller must hold an immediate transaction
    pub fn record_completion_immediate(
        conn: &Connection,
        student_id: i64,
        program: &Program,
        activity_id: i64,
        meta: &CompletionMeta,
    ) -> Result<AssignmentStatus, MentorLoopError> {
        let assignment = Self::get_for_pair(conn, student_id, program.program_id)?.ok_or_else(|| {
            MentorLoopError::Validation(format!(
                "Student {} is not assigned to program {}",
                student_id, program.program_id
            ))
        })?;
        let completed_at = meta.completed_at.timestamp();

        let last_write_at: Option<i64> = conn
            .query_row(
                "SELECT last_write_at FROM assignment_completions WHERE assignment_id = ? AND activity_id = ?",
                [assignment.assignment_id, activity_id],
                |row| row.get(0),
            )
            .optional()?;
        if last_write_at == Some(completed_at) {
            debug!(
                "Completion of activity {} in assignment {} already recorded",
                activity_id, assignment.assignment_id
            );
            return Ok(assignment.status);
        }

        if assignment.status != AssignmentStatus::Active {
            return Err(MentorLoopError::Validation(format!(
                "Assignment {} is {}; only active assignments accept completions",
                assignment.assignment_id, assignment.status
            )));
        }

        let answer = meta.answer.as_ref().map(serde_json::to_string).transpose()?;
        conn.execute(
            "INSERT INTO assignment_completions
                (assignment_id, activity_id, completed_at, last_write_at, time_spent_minutes, answer)
            VALUES (:assignment_id, :activity_id, :completed_at, :completed_at, :minutes, :answer)
            ON CONFLICT (assignment_id, activity_id) DO UPDATE SET
                last_write_at = excluded.last_write_at,
                time_spent_minutes = time_spent_minutes + excluded.time_spent_minutes,
                answer = COALESCE(excluded.answer, answer)",
            named_params! {
                ":assignment_id": assignment.assignment_id,
                ":activity_id":   activity_id,
                ":completed_at":  completed_at,
                ":minutes":       meta.time_spent_minutes,
                ":answer":        answer,
            },
        )?;

        let completed = Self::completed_ids(conn, assignment.assignment_id)?;
        let leaves = leaf_ids(program);
        if !leaves.is_empty() && leaves.is_subset(&completed) {
            Self::write_status_immediate(
                conn,
                &assignment,
                AssignmentStatus::Completed,
                meta.completed_at.date_naive(),
            )?;
            info!(
                "Assignment {} completed: all {} activities done",
                assignment.assignment_id,
                leaves.len()
            );
            return Ok(AssignmentStatus::Completed);
        }

        Ok(assignment.status)
    }

    /// Completed assignments of a program that just gained an activity go back
    /// to active so the new activity can be completed.
    ///
    /// IMPORTANT: Caller must hold an immediate transaction
    pub fn reopen_completed_immediate(conn: &Connection, program_id: i64) -> Result<usize, MentorLoopError> {
        let reopened = conn.execute(
            "UPDATE assignments SET status = ?, updated_at = ? WHERE program_id = ? AND status = ?",
            params![
                AssignmentStatus::Active.as_ref(),
                chrono::Utc::now().timestamp(),
                program_id,
                AssignmentStatus::Completed.as_ref()
            ],
        )?;
        if reopened > 0 {
            info!(
                "Reopened {} completed assignment(s) of program {} after a new activity",
                reopened, program_id
            );
        }
        Ok(reopened)
    }

    /// Every pair where the assignments and the two reference sets disagree.
    /// Cancelled assignments are expected to have no references.
    pub fn audit_cross_references(conn: &Connection) -> Result<Vec<CrossReferenceIssue>, MentorLoopError> {
        let checks = [
            (
                CrossReferenceIssueKind::MissingStudentReference,
                "SELECT a.student_id, a.program_id FROM assignments a
                WHERE a.status != 'cancelled'
                AND NOT EXISTS (SELECT 1 FROM student_programs sp
                    WHERE sp.student_id = a.student_id AND sp.program_id = a.program_id)",
            ),
            (
                CrossReferenceIssueKind::MissingProgramReference,
                "SELECT a.student_id, a.program_id FROM assignments a
                WHERE a.status != 'cancelled'
                AND NOT EXISTS (SELECT 1 FROM program_students ps
                    WHERE ps.student_id = a.student_id AND ps.program_id = a.program_id)",
            ),
            (
                CrossReferenceIssueKind::DanglingStudentReference,
                "SELECT sp.student_id, sp.program_id FROM student_programs sp
                WHERE NOT EXISTS (SELECT 1 FROM assignments a
                    WHERE a.student_id = sp.student_id AND a.program_id = sp.program_id
                    AND a.status != 'cancelled')",
            ),
            (
                CrossReferenceIssueKind::DanglingProgramReference,
                "SELECT ps.student_id, ps.program_id FROM program_students ps
                WHERE NOT EXISTS (SELECT 1 FROM assignments a
                    WHERE a.student_id = ps.student_id AND a.program_id = ps.program_id
                    AND a.status != 'cancelled')",
            ),
        ];

        let mut issues = Vec::new();
        for (kind, sql) in checks {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))?;
            for row in rows {
                let (student_id, program_id) = row?;
                issues.push(CrossReferenceIssue {
                    student_id,
                    program_id,
                    kind,
                });
            }
        }

        if !issues.is_empty() {
            warn!("Cross reference audit found {} issue(s)", issues.len());
        }
        Ok(issues)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_support::test_db;
    use crate::programs::test_support::{note, sample_program};
    use crate::students::Professional;
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;
    use strum::IntoEnumIterator;

    struct Fixture {
        pro: i64,
        program: Program,
        students: Vec<i64>,
    }

    fn fixture(conn: &Connection, student_count: usize) -> Fixture {
        let pro = Professional::create(conn, "Dr. Ruiz").unwrap().professional_id;
        let program = sample_program(conn, pro);
        let students = (0..student_count)
            .map(|i| Student::create(conn, pro, &format!("Student {}", i)).unwrap().student_id)
            .collect();
        Fixture { pro, program, students }
    }

    fn start() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, 6).unwrap()
    }

    fn assignment_count(conn: &Connection) -> i64 {
        conn.query_row("SELECT COUNT(*) FROM assignments", [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(AssignmentStatus::Active.as_ref(), "active");
        assert_eq!(AssignmentStatus::Cancelled.to_string(), "cancelled");
        assert_eq!("paused".parse::<AssignmentStatus>().unwrap(), AssignmentStatus::Paused);
        assert_eq!(AssignmentStatus::iter().count(), 4);
    }

    #[test]
    fn test_status_transitions() {
        use AssignmentStatus::*;
        assert!(Active.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Active));
        assert!(Paused.can_transition_to(Completed));
        assert!(Completed.can_transition_to(Cancelled));
        assert!(!Completed.can_transition_to(Active));
        assert!(!Cancelled.can_transition_to(Active));
        assert!(Cancelled.can_transition_to(Cancelled));
    }

    #[test]
    fn test_assign_creates_all_three_effects() {
        let (_dir, db) = test_db();
        let conn = db.get_connection().unwrap();
        let f = fixture(&conn, 2);

        let mut options = AssignOptions::new(f.pro, start());
        options.notify = true;
        let outcome =
            Assignments::assign_program_to_students(&conn, f.program.program_id, &f.students, &options).unwrap();
        assert_eq!(outcome.created, f.students);

        for &student_id in &f.students {
            let assignment = Assignments::get_for_pair(&conn, student_id, f.program.program_id)
                .unwrap()
                .unwrap();
            assert_eq!(assignment.status, AssignmentStatus::Active);
            assert_eq!(assignment.start_date, start());
            assert!(Student::assigned_programs(&conn, student_id)
                .unwrap()
                .contains(&f.program.program_id));
            assert_eq!(
                Notifications::list_for_student(&conn, student_id, true).unwrap().len(),
                1
            );
        }
        assert_eq!(
            Program::assigned_students(&conn, f.program.program_id).unwrap(),
            f.students.iter().copied().collect::<BTreeSet<_>>()
        );
        assert!(Assignments::audit_cross_references(&conn).unwrap().is_empty());
    }

    #[test]
    fn test_assign_is_idempotent() {
        let (_dir, db) = test_db();
        let conn = db.get_connection().unwrap();
        let f = fixture(&conn, 1);
        let s = f.students[0];
        let mut options = AssignOptions::new(f.pro, start());
        options.notify = true;

        Assignments::assign_program_to_students(&conn, f.program.program_id, &[s], &options).unwrap();
        let second =
            Assignments::assign_program_to_students(&conn, f.program.program_id, &[s, s], &options).unwrap();

        assert_eq!(second.already_assigned, vec![s]);
        assert!(second.created.is_empty());
        assert_eq!(assignment_count(&conn), 1);
        let program = Program::require(&conn, f.program.program_id).unwrap();
        assert_eq!(program.assigned_students.iter().filter(|id| **id == s).count(), 1);
        assert_eq!(Notifications::list_for_student(&conn, s, false).unwrap().len(), 1);
    }

    #[test]
    fn test_storage_failure_rolls_back_everything() {
        let (_dir, db) = test_db();
        let conn = db.get_connection().unwrap();
        let f = fixture(&conn, 2);

        // Fails after the assignment row and student reference are written
        conn.execute_batch(
            "CREATE TRIGGER fail_program_side BEFORE INSERT ON program_students
            BEGIN SELECT RAISE(ABORT, 'simulated storage failure'); END;",
        )
        .unwrap();

        let options = AssignOptions::new(f.pro, start());
        let result = Assignments::assign_program_to_students(&conn, f.program.program_id, &f.students, &options);

        assert!(matches!(result, Err(MentorLoopError::AtomicFailure(_))));
        assert!(result.unwrap_err().is_retryable());
        assert_eq!(assignment_count(&conn), 0);
        for &student_id in &f.students {
            assert!(Student::assigned_programs(&conn, student_id).unwrap().is_empty());
        }

        // Retry once storage recovers
        conn.execute_batch("DROP TRIGGER fail_program_side;").unwrap();
        let outcome =
            Assignments::assign_program_to_students(&conn, f.program.program_id, &f.students, &options).unwrap();
        assert_eq!(outcome.created.len(), 2);
        assert!(Assignments::audit_cross_references(&conn).unwrap().is_empty());
    }

    #[test]
    fn test_per_student_failure_keeps_earlier_students() {
        let (_dir, db) = test_db();
        let conn = db.get_connection().unwrap();
        let f = fixture(&conn, 2);
        let (first, second) = (f.students[0], f.students[1]);

        conn.execute_batch(&format!(
            "CREATE TRIGGER fail_second BEFORE INSERT ON program_students
            WHEN NEW.student_id = {}
            BEGIN SELECT RAISE(ABORT, 'simulated storage failure'); END;",
            second
        ))
        .unwrap();

        let mut options = AssignOptions::new(f.pro, start());
        options.granularity = Granularity::PerStudent;
        let outcome =
            Assignments::assign_program_to_students(&conn, f.program.program_id, &f.students, &options).unwrap();

        assert_eq!(outcome.created, vec![first]);
        assert_eq!(outcome.rejected.len(), 1);
        assert_eq!(outcome.rejected[0].student_id, second);
        assert!(Assignments::get_for_pair(&conn, second, f.program.program_id).unwrap().is_none());
        assert!(Assignments::audit_cross_references(&conn).unwrap().is_empty());
    }

    #[test]
    fn test_unknown_program_rejected_before_write() {
        let (_dir, db) = test_db();
        let conn = db.get_connection().unwrap();
        let f = fixture(&conn, 1);

        let result =
            Assignments::assign_program_to_students(&conn, 999, &f.students, &AssignOptions::new(f.pro, start()));
        assert!(matches!(result, Err(MentorLoopError::NotFound { entity: "Program", id: 999 })));
        assert_eq!(assignment_count(&conn), 0);
    }

    #[test]
    fn test_unowned_student_policy() {
        let (_dir, db) = test_db();
        let conn = db.get_connection().unwrap();
        let f = fixture(&conn, 1);
        let other = Professional::create(&conn, "Dr. Stone").unwrap();
        let stranger = Student::create(&conn, other.professional_id, "Leo").unwrap().student_id;
        let students = [f.students[0], stranger];

        let whole = Assignments::assign_program_to_students(
            &conn,
            f.program.program_id,
            &students,
            &AssignOptions::new(f.pro, start()),
        );
        assert!(matches!(whole, Err(MentorLoopError::Unauthorized(_))));
        assert_eq!(assignment_count(&conn), 0);

        // Rejections raised inside the transaction keep their own error kind
        let unknown = Assignments::assign_program_to_students(
            &conn,
            f.program.program_id,
            &[f.students[0], 999],
            &AssignOptions::new(f.pro, start()),
        );
        assert!(matches!(unknown, Err(MentorLoopError::NotFound { entity: "Student", id: 999 })));
        assert_eq!(assignment_count(&conn), 0);
        assert!(Student::assigned_programs(&conn, f.students[0]).unwrap().is_empty());

        let mut options = AssignOptions::new(f.pro, start());
        options.granularity = Granularity::PerStudent;
        let outcome =
            Assignments::assign_program_to_students(&conn, f.program.program_id, &students, &options).unwrap();
        assert_eq!(outcome.created, vec![f.students[0]]);
        assert_eq!(outcome.rejected[0].student_id, stranger);
    }

    #[test]
    fn test_option_validation() {
        let (_dir, db) = test_db();
        let conn = db.get_connection().unwrap();
        let f = fixture(&conn, 1);

        let mut options = AssignOptions::new(f.pro, start());
        options.end_date = NaiveDate::from_ymd_opt(2025, 1, 1);
        assert!(matches!(
            Assignments::assign_program_to_students(&conn, f.program.program_id, &f.students, &options),
            Err(MentorLoopError::Validation(_))
        ));
        assert!(matches!(
            Assignments::assign_program_to_students(
                &conn,
                f.program.program_id,
                &[],
                &AssignOptions::new(f.pro, start())
            ),
            Err(MentorLoopError::Validation(_))
        ));
    }

    #[test]
    fn test_unassign_and_reactivate() {
        let (_dir, db) = test_db();
        let conn = db.get_connection().unwrap();
        let f = fixture(&conn, 1);
        let s = f.students[0];
        let options = AssignOptions::new(f.pro, start());
        Assignments::assign_program_to_students(&conn, f.program.program_id, &[s], &options).unwrap();

        let today = NaiveDate::from_ymd_opt(2025, 2, 1).unwrap();
        let cancelled = Assignments::unassign_program(&conn, f.program.program_id, s, f.pro, today).unwrap();
        assert_eq!(cancelled.status, AssignmentStatus::Cancelled);
        assert_eq!(cancelled.end_date, Some(today));
        assert!(Student::assigned_programs(&conn, s).unwrap().is_empty());
        assert!(Program::assigned_students(&conn, f.program.program_id).unwrap().is_empty());
        assert!(Assignments::audit_cross_references(&conn).unwrap().is_empty());

        let outcome =
            Assignments::assign_program_to_students(&conn, f.program.program_id, &[s], &options).unwrap();
        assert_eq!(outcome.reactivated, vec![s]);
        assert_eq!(assignment_count(&conn), 1);
        let assignment = Assignments::get_for_pair(&conn, s, f.program.program_id).unwrap().unwrap();
        assert_eq!(assignment.status, AssignmentStatus::Active);
        assert_eq!(assignment.end_date, None);
    }

    #[test]
    fn test_unassign_without_assignment_is_not_found() {
        let (_dir, db) = test_db();
        let conn = db.get_connection().unwrap();
        let f = fixture(&conn, 1);

        let result = Assignments::unassign_program(&conn, f.program.program_id, f.students[0], f.pro, start());
        assert!(matches!(result, Err(MentorLoopError::NotFound { entity: "Assignment", .. })));
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let (_dir, db) = test_db();
        let conn = db.get_connection().unwrap();
        let f = fixture(&conn, 1);
        let s = f.students[0];
        Assignments::assign_program_to_students(&conn, f.program.program_id, &[s], &AssignOptions::new(f.pro, start()))
            .unwrap();
        let assignment = Assignments::get_for_pair(&conn, s, f.program.program_id).unwrap().unwrap();

        let today = start();
        Assignments::set_status(&conn, assignment.assignment_id, f.pro, AssignmentStatus::Completed, today).unwrap();
        let result =
            Assignments::set_status(&conn, assignment.assignment_id, f.pro, AssignmentStatus::Active, today);
        assert!(matches!(result, Err(MentorLoopError::Validation(_))));
    }

    #[test]
    fn test_audit_detects_missing_reference() {
        let (_dir, db) = test_db();
        let conn = db.get_connection().unwrap();
        let f = fixture(&conn, 1);
        let s = f.students[0];
        Assignments::assign_program_to_students(&conn, f.program.program_id, &[s], &AssignOptions::new(f.pro, start()))
            .unwrap();

        conn.execute("DELETE FROM program_students", []).unwrap();
        let issues = Assignments::audit_cross_references(&conn).unwrap();
        assert_eq!(
            issues,
            vec![CrossReferenceIssue {
                student_id: s,
                program_id: f.program.program_id,
                kind: CrossReferenceIssueKind::MissingProgramReference,
            }]
        );

        // Re-running the assignment repairs the missing side
        Assignments::assign_program_to_students(&conn, f.program.program_id, &[s], &AssignOptions::new(f.pro, start()))
            .unwrap();
        assert!(Assignments::audit_cross_references(&conn).unwrap().is_empty());
    }

    fn completion_at(day: u32, minutes: u32) -> CompletionMeta {
        CompletionMeta {
            completed_at: Utc.with_ymd_and_hms(2025, 1, day, 9, 0, 0).single().unwrap(),
            time_spent_minutes: minutes,
            answer: None,
        }
    }

    fn complete(
        conn: &Connection,
        student_id: i64,
        program: &Program,
        activity_id: i64,
        meta: &CompletionMeta,
    ) -> Result<AssignmentStatus, MentorLoopError> {
        Database::immediate_transaction(conn, |c| {
            Assignments::record_completion_immediate(c, student_id, program, activity_id, meta)
        })
    }

    #[test]
    fn test_completion_after_cancel_is_rejected() {
        let (_dir, db) = test_db();
        let conn = db.get_connection().unwrap();
        let f = fixture(&conn, 1);
        let s = f.students[0];
        Assignments::assign_program_to_students(&conn, f.program.program_id, &[s], &AssignOptions::new(f.pro, start()))
            .unwrap();
        let ids: Vec<i64> = leaf_ids(&f.program).into_iter().collect();
        complete(&conn, s, &f.program, ids[0], &completion_at(7, 5)).unwrap();
        complete(&conn, s, &f.program, ids[1], &completion_at(7, 5)).unwrap();

        // Another session cancels before the last completion lands
        Assignments::unassign_program(&conn, f.program.program_id, s, f.pro, start()).unwrap();
        let result = complete(&conn, s, &f.program, ids[2], &completion_at(8, 5));

        assert!(matches!(result, Err(MentorLoopError::Validation(_))));
        let assignment = Assignments::get_for_pair(&conn, s, f.program.program_id).unwrap().unwrap();
        assert_eq!(assignment.status, AssignmentStatus::Cancelled);
        assert_eq!(assignment.completed_activity_ids.len(), 2);
        assert!(Assignments::audit_cross_references(&conn).unwrap().is_empty());
    }

    #[test]
    fn test_retried_completion_changes_nothing() {
        let (_dir, db) = test_db();
        let conn = db.get_connection().unwrap();
        let f = fixture(&conn, 1);
        let s = f.students[0];
        Assignments::assign_program_to_students(&conn, f.program.program_id, &[s], &AssignOptions::new(f.pro, start()))
            .unwrap();
        let ids: Vec<i64> = leaf_ids(&f.program).into_iter().collect();
        let assignment_id = Assignments::get_for_pair(&conn, s, f.program.program_id)
            .unwrap()
            .unwrap()
            .assignment_id;
        let minutes = |conn: &Connection| -> u32 {
            Assignments::completion_details(conn, assignment_id).unwrap()[0].time_spent_minutes
        };

        complete(&conn, s, &f.program, ids[0], &completion_at(7, 12)).unwrap();
        complete(&conn, s, &f.program, ids[0], &completion_at(7, 12)).unwrap();
        assert_eq!(minutes(&conn), 12);

        // A later session on the same activity is new time
        complete(&conn, s, &f.program, ids[0], &completion_at(8, 3)).unwrap();
        assert_eq!(minutes(&conn), 15);

        // The retry of the write that finished the program still succeeds
        complete(&conn, s, &f.program, ids[1], &completion_at(9, 1)).unwrap();
        let last = completion_at(9, 1);
        assert_eq!(complete(&conn, s, &f.program, ids[2], &last).unwrap(), AssignmentStatus::Completed);
        assert_eq!(complete(&conn, s, &f.program, ids[2], &last).unwrap(), AssignmentStatus::Completed);
    }

    #[test]
    fn test_new_activity_reopens_completed_assignment() {
        let (_dir, db) = test_db();
        let conn = db.get_connection().unwrap();
        let f = fixture(&conn, 1);
        let s = f.students[0];
        Assignments::assign_program_to_students(&conn, f.program.program_id, &[s], &AssignOptions::new(f.pro, start()))
            .unwrap();
        for id in leaf_ids(&f.program) {
            complete(&conn, s, &f.program, id, &completion_at(7, 0)).unwrap();
        }
        let assignment = Assignments::get_for_pair(&conn, s, f.program.program_id).unwrap().unwrap();
        assert_eq!(assignment.status, AssignmentStatus::Completed);

        let module_id = f.program.modules[0].module_id;
        let added = Program::add_activity(&conn, f.pro, module_id, &note("Body scan", 5)).unwrap();
        let assignment = Assignments::get_for_pair(&conn, s, f.program.program_id).unwrap().unwrap();
        assert_eq!(assignment.status, AssignmentStatus::Active);

        let program = Program::require(&conn, f.program.program_id).unwrap();
        let status = complete(&conn, s, &program, added.activity_id, &completion_at(8, 0)).unwrap();
        assert_eq!(status, AssignmentStatus::Completed);
    }
}
