use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use log::debug;
use rusqlite::{named_params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::error::MentorLoopError;
use crate::ledger::CompletionMeta;
use crate::schedules::{ScheduleActivity, WeeklySchedule};
use crate::streak::StreakResult;

/// Per-student state of one schedule activity, created on first toggle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleProgressEntry {
    pub student_id: i64,
    pub schedule_id: i64,
    pub activity_id: i64,
    pub completed: bool,
    /// Present iff `completed`
    pub completed_at: Option<DateTime<Utc>>,
    pub time_spent_minutes: u32,
    pub answer: Option<serde_json::Value>,
}

pub struct ScheduleProgress;

impl ScheduleProgress {
    pub fn for_schedule(
        conn: &Connection,
        student_id: i64,
        schedule_id: i64,
    ) -> Result<BTreeMap<i64, ScheduleProgressEntry>, MentorLoopError> {
        let mut stmt = conn.prepare(
            "SELECT activity_id, completed, completed_at, time_spent_minutes, answer
            FROM schedule_progress
            WHERE student_id = :student_id AND schedule_id = :schedule_id",
        )?;
        let rows = stmt.query_map(
            named_params! {
                ":student_id":  student_id,
                ":schedule_id": schedule_id,
            },
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, bool>(1)?,
                    row.get::<_, Option<i64>>(2)?,
                    row.get::<_, u32>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            },
        )?;

        let mut entries = BTreeMap::new();
        for row in rows {
            let (activity_id, completed, completed_at, time_spent_minutes, answer) = row?;
            let completed_at = if completed {
                completed_at.and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0))
            } else {
                None
            };
            entries.insert(
                activity_id,
                ScheduleProgressEntry {
                    student_id,
                    schedule_id,
                    activity_id,
                    completed,
                    completed_at,
                    time_spent_minutes,
                    answer: answer
                        .as_deref()
                        .map(serde_json::from_str::<serde_json::Value>)
                        .transpose()?,
                },
            );
        }
        Ok(entries)
    }

    /// Ids of completed activities, ready for aggregation
    pub fn completed_set(entries: &BTreeMap<i64, ScheduleProgressEntry>) -> BTreeSet<i64> {
        entries
            .values()
            .filter(|e| e.completed)
            .map(|e| e.activity_id)
            .collect()
    }

    /// Set the completion flag of a schedule activity to an explicit value.
    /// Time spent accumulates; habits also update their date history and streak.
    /// A retry of the latest write (same flag, same completion time) changes nothing.
    ///
    /// IMPORTANT: Caller must hold an immediate transaction
    pub fn write_immediate(
        conn: &Connection,
        student_id: i64,
        schedule_id: i64,
        activity: &ScheduleActivity,
        completed: bool,
        meta: &CompletionMeta,
    ) -> Result<Option<StreakResult>, MentorLoopError> {
        let write_at = meta.completed_at.timestamp();
        let previous: Option<(bool, Option<i64>, i64)> = conn
            .query_row(
                "SELECT completed, completed_at, last_write_at FROM schedule_progress
                WHERE student_id = ? AND schedule_id = ? AND activity_id = ?",
                [student_id, schedule_id, activity.activity_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let reference_date = meta.completed_at.date_naive();
        let is_retry = matches!(previous, Some((was_completed, _, last_write_at))
            if was_completed == completed && last_write_at == write_at);

        if is_retry {
            debug!(
                "Schedule {} activity {} already set to completed={} for student {}",
                schedule_id, activity.activity_id, completed, student_id
            );
        } else {
            let answer = meta.answer.as_ref().map(serde_json::to_string).transpose()?;
            let completed_at = completed.then_some(write_at);

            conn.execute(
                "INSERT INTO schedule_progress
                    (student_id, schedule_id, activity_id, completed, completed_at, last_write_at,
                     time_spent_minutes, answer, updated_at)
                VALUES (:student_id, :schedule_id, :activity_id, :completed, :completed_at, :write_at,
                    :minutes, :answer, :now)
                ON CONFLICT (student_id, schedule_id, activity_id) DO UPDATE SET
                    completed = excluded.completed,
                    completed_at = excluded.completed_at,
                    last_write_at = excluded.last_write_at,
                    time_spent_minutes = time_spent_minutes + excluded.time_spent_minutes,
                    answer = COALESCE(excluded.answer, answer),
                    updated_at = excluded.updated_at",
                named_params! {
                    ":student_id":   student_id,
                    ":schedule_id":  schedule_id,
                    ":activity_id":  activity.activity_id,
                    ":completed":    completed,
                    ":completed_at": completed_at,
                    ":write_at":     write_at,
                    ":minutes":      meta.time_spent_minutes,
                    ":answer":       answer,
                    ":now":          Utc::now().timestamp(),
                },
            )?;

            debug!(
                "Schedule {} activity {} set to completed={} for student {}",
                schedule_id, activity.activity_id, completed, student_id
            );
        }

        if !activity.kind.is_habit() {
            return Ok(None);
        }

        if !is_retry {
            if completed {
                WeeklySchedule::record_habit_completion_immediate(conn, activity.activity_id, reference_date)?;
            } else {
                let undone_date = previous
                    .and_then(|(_, completed_at, _)| completed_at)
                    .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0))
                    .map(|dt| dt.date_naive())
                    .unwrap_or(reference_date);
                WeeklySchedule::remove_habit_completion_immediate(conn, activity.activity_id, undone_date)?;
            }
        }

        let streak = WeeklySchedule::refresh_streak_immediate(conn, activity.activity_id, reference_date)?;
        Ok(Some(streak))
    }

    /// Sum of time spent across every entry of the schedule
    pub fn time_spent(entries: &BTreeMap<i64, ScheduleProgressEntry>) -> u64 {
        entries.values().map(|e| e.time_spent_minutes as u64).sum()
    }
}
