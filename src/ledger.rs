use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use log::info;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::aggregate::{aggregate, leaf_ids, AggregateResult};
use crate::assignments::{Assignment, AssignmentStatus, Assignments};
use crate::config::GamificationConfig;
use crate::database::Database;
use crate::error::MentorLoopError;
use crate::gamification::{Gamification, StudentStats};
use crate::programs::Program;
use crate::schedule_progress::{ScheduleProgress, ScheduleProgressEntry};
use crate::schedules::WeeklySchedule;
use crate::streak::StreakResult;
use crate::students::Student;

/// Where a completion is recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", content = "id", rename_all = "snake_case")]
pub enum CompletionScope {
    Program(i64),
    Schedule(i64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionMeta {
    pub completed_at: DateTime<Utc>,
    #[serde(default)]
    pub time_spent_minutes: u32,
    #[serde(default)]
    pub answer: Option<serde_json::Value>,
}

impl CompletionMeta {
    pub fn now() -> Self {
        CompletionMeta {
            completed_at: Utc::now(),
            time_spent_minutes: 0,
            answer: None,
        }
    }
}

/// What a successful completion write changed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionReceipt {
    /// Assignment status after the write (curriculum scope only)
    pub assignment_status: Option<AssignmentStatus>,
    /// Re-derived streak (habit schedule activities only)
    pub streak: Option<StreakResult>,
    pub stats: StudentStats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramProgress {
    pub assignment: Assignment,
    pub progress: AggregateResult,
    pub time_spent_minutes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleProgressSummary {
    pub schedule_id: i64,
    pub progress: AggregateResult,
    pub time_spent_minutes: u64,
}

pub struct Ledger;

impl Ledger {
    /// Set a student's completion of one activity to an explicit value, then
    /// recompute the student's cached stats in the same transaction.
    ///
    /// Curriculum completions are append-only, so `completed = false` is rejected
    /// for a program scope.
    pub fn set_activity_completion(
        conn: &Connection,
        gamification: &GamificationConfig,
        student_id: i64,
        scope: CompletionScope,
        activity_id: i64,
        completed: bool,
        meta: &CompletionMeta,
    ) -> Result<CompletionReceipt, MentorLoopError> {
        Student::require(conn, student_id)?;
        let reference_date = meta.completed_at.date_naive();

        let receipt = match scope {
            CompletionScope::Program(program_id) => {
                if !completed {
                    return Err(MentorLoopError::Validation(
                        "Curriculum completions are append-only and cannot be undone".into(),
                    ));
                }
                // Program tree and assignment are read under the write lock
                Database::immediate_transaction(conn, |c| {
                    let program = Program::require(c, program_id)?;
                    if !leaf_ids(&program).contains(&activity_id) {
                        return Err(MentorLoopError::not_found("Activity", activity_id));
                    }
                    let status =
                        Assignments::record_completion_immediate(c, student_id, &program, activity_id, meta)?;
                    let stats = Gamification::recompute_student_stats_immediate(
                        c,
                        student_id,
                        gamification,
                        reference_date,
                    )?;
                    Ok(CompletionReceipt {
                        assignment_status: Some(status),
                        streak: None,
                        stats,
                    })
                })?
            }
            CompletionScope::Schedule(schedule_id) => Database::immediate_transaction(conn, |c| {
                let schedule = WeeklySchedule::require(c, schedule_id)?;
                if schedule.student_id != student_id {
                    return Err(MentorLoopError::Unauthorized(format!(
                        "Schedule {} belongs to another student",
                        schedule_id
                    )));
                }
                let activity = schedule
                    .activity(activity_id)
                    .ok_or(MentorLoopError::not_found("Schedule activity", activity_id))?;

                let streak = ScheduleProgress::write_immediate(c, student_id, schedule_id, activity, completed, meta)?;
                let stats = Gamification::recompute_student_stats_immediate(c, student_id, gamification, reference_date)?;
                Ok(CompletionReceipt {
                    assignment_status: None,
                    streak,
                    stats,
                })
            })?,
        };

        info!(
            "Student {} {:?} activity {} completed={}: {} points, level {}",
            student_id, scope, activity_id, completed, receipt.stats.total_points, receipt.stats.level
        );

        Ok(receipt)
    }

    pub fn get_assignments_for_student(
        conn: &Connection,
        student_id: i64,
    ) -> Result<Vec<Assignment>, MentorLoopError> {
        Student::require(conn, student_id)?;
        Assignments::for_student(conn, student_id)
    }

    pub fn get_schedule_progress(
        conn: &Connection,
        student_id: i64,
        schedule_id: i64,
    ) -> Result<BTreeMap<i64, ScheduleProgressEntry>, MentorLoopError> {
        Student::require(conn, student_id)?;
        WeeklySchedule::require(conn, schedule_id)?;
        ScheduleProgress::for_schedule(conn, student_id, schedule_id)
    }

    /// Percentages at every level of the program for one student
    pub fn program_progress(
        conn: &Connection,
        student_id: i64,
        program_id: i64,
    ) -> Result<ProgramProgress, MentorLoopError> {
        let program = Program::require(conn, program_id)?;
        let assignment = Assignments::get_for_pair(conn, student_id, program_id)?.ok_or_else(|| {
            MentorLoopError::Validation(format!(
                "Student {} is not assigned to program {}",
                student_id, program_id
            ))
        })?;

        let progress = aggregate(&program, &assignment.completed_activity_ids);
        let time_spent_minutes = Assignments::completion_details(conn, assignment.assignment_id)?
            .iter()
            .map(|c| c.time_spent_minutes as u64)
            .sum();

        Ok(ProgramProgress {
            assignment,
            progress,
            time_spent_minutes,
        })
    }

    /// Percentages at every level of the week for one student
    pub fn schedule_progress_summary(
        conn: &Connection,
        student_id: i64,
        schedule_id: i64,
    ) -> Result<ScheduleProgressSummary, MentorLoopError> {
        let schedule = WeeklySchedule::require(conn, schedule_id)?;
        let entries = ScheduleProgress::for_schedule(conn, student_id, schedule_id)?;

        Ok(ScheduleProgressSummary {
            schedule_id,
            progress: aggregate(&schedule, &ScheduleProgress::completed_set(&entries)),
            time_spent_minutes: ScheduleProgress::time_spent(&entries),
        })
    }
}
