use std::collections::{BTreeSet, HashMap};

use chrono::{NaiveDate, Weekday};
use log::{debug, info, warn};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::activity::{ActivityKind, DeletePolicy, NewActivity};
use crate::aggregate::{Branch, Leaf, Tree};
use crate::config::GamificationConfig;
use crate::database::Database;
use crate::error::MentorLoopError;
use crate::gamification::Gamification;
use crate::streak::{compute_streak, StreakResult};
use crate::students::Student;

const DATE_FORMAT: &str = "%Y-%m-%d";

pub const WEEK: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

pub fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

pub fn parse_date(value: &str) -> Result<NaiveDate, MentorLoopError> {
    NaiveDate::parse_from_str(value.trim(), DATE_FORMAT)
        .map_err(|e| MentorLoopError::Validation(format!("Malformed date '{}': {}", value, e)))
}

/// A leaf of the weekly schedule. Habit instances carry their completion
/// history; the streak fields are re-derived from that history on every write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleActivity {
    pub activity_id: i64,
    pub weekday: Weekday,
    pub title: String,
    pub kind: ActivityKind,
    pub points: u32,
    pub estimated_minutes: u32,
    pub is_required: bool,
    pub position: i64,
    pub completion_dates: BTreeSet<NaiveDate>,
    pub current_streak: u32,
    pub max_streak: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeekDay {
    pub weekday: Weekday,
    pub activities: Vec<ScheduleActivity>,
}

/// A recurring week authored for one student. Always holds seven days, Monday first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeeklySchedule {
    pub schedule_id: i64,
    pub professional_id: i64,
    pub student_id: i64,
    pub title: String,
    pub days: Vec<WeekDay>,
}

impl Leaf for ScheduleActivity {
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

impl Branch for WeekDay {
    type Leaf = ScheduleActivity;

    fn branch_id(&self) -> i64 {
        self.weekday.num_days_from_monday() as i64
    }

    fn leaves(&self) -> &[ScheduleActivity] {
        &self.activities
    }
}

impl Tree for WeeklySchedule {
    type Branch = WeekDay;

    fn branches(&self) -> &[WeekDay] {
        &self.days
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleActivityDeletion {
    pub activity_id: i64,
    pub schedule_id: i64,
    pub affected_students: Vec<i64>,
}

fn empty_week() -> Vec<WeekDay> {
    WEEK.iter()
        .map(|weekday| WeekDay {
            weekday: *weekday,
            activities: Vec::new(),
        })
        .collect()
}

fn weekday_from_index(index: i64) -> Result<Weekday, MentorLoopError> {
    usize::try_from(index)
        .ok()
        .and_then(|i| WEEK.get(i).copied())
        .ok_or_else(|| MentorLoopError::Error(format!("Invalid weekday index {}", index)))
}

impl WeeklySchedule {
    pub fn create(
        conn: &Connection,
        professional_id: i64,
        student_id: i64,
        title: &str,
    ) -> Result<Self, MentorLoopError> {
        let title = title.trim();
        if title.is_empty() {
            return Err(MentorLoopError::Validation(
                "Schedule title must not be empty".into(),
            ));
        }

        let student = Student::require(conn, student_id)?;
        if !student.is_owned_by(professional_id) {
            return Err(MentorLoopError::Unauthorized(format!(
                "Professional {} does not own student {}",
                professional_id, student_id
            )));
        }

        let schedule_id: i64 = conn.query_row(
            "INSERT INTO weekly_schedules (professional_id, student_id, title, created_at)
            VALUES (?, ?, ?, ?) RETURNING schedule_id",
            params![professional_id, student_id, title, chrono::Utc::now().timestamp()],
            |row| row.get(0),
        )?;

        info!(
            "Created schedule {} '{}' for student {}",
            schedule_id, title, student_id
        );

        Ok(WeeklySchedule {
            schedule_id,
            professional_id,
            student_id,
            title: title.to_owned(),
            days: empty_week(),
        })
    }

    pub fn get_by_id(conn: &Connection, schedule_id: i64) -> Result<Option<Self>, MentorLoopError> {
        let header = conn
            .query_row(
                "SELECT professional_id, student_id, title FROM weekly_schedules WHERE schedule_id = ?",
                [schedule_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;

        let Some((professional_id, student_id, title)) = header else {
            return Ok(None);
        };

        let mut histories = Self::habit_histories(conn, schedule_id)?;
        let mut days = empty_week();

        let mut stmt = conn.prepare(
            "SELECT activity_id, weekday, title, kind, points, estimated_minutes,
                is_required, position, current_streak, max_streak
            FROM schedule_activities
            WHERE schedule_id = ?
            ORDER BY weekday ASC, position ASC, activity_id ASC",
        )?;
        let rows = stmt.query_map([schedule_id], |row| {
            Ok((
                row.get::<_, i64>(1)?,
                row.get::<_, String>(3)?,
                ScheduleActivity {
                    activity_id: row.get(0)?,
                    weekday: Weekday::Mon,
                    title: row.get(2)?,
                    kind: ActivityKind::Note { body: String::new() },
                    points: row.get(4)?,
                    estimated_minutes: row.get(5)?,
                    is_required: row.get(6)?,
                    position: row.get(7)?,
                    completion_dates: BTreeSet::new(),
                    current_streak: row.get(8)?,
                    max_streak: row.get(9)?,
                },
            ))
        })?;

        for row in rows {
            let (weekday_index, kind_json, mut activity) = row?;
            activity.weekday = weekday_from_index(weekday_index)?;
            activity.kind = ActivityKind::from_json(&kind_json)?;
            activity.completion_dates = histories.remove(&activity.activity_id).unwrap_or_default();
            days[weekday_index as usize].activities.push(activity);
        }

        Ok(Some(WeeklySchedule {
            schedule_id,
            professional_id,
            student_id,
            title,
            days,
        }))
    }

    pub fn require(conn: &Connection, schedule_id: i64) -> Result<Self, MentorLoopError> {
        Self::get_by_id(conn, schedule_id)?.ok_or(MentorLoopError::not_found("Schedule", schedule_id))
    }

    pub fn ids_for_student(conn: &Connection, student_id: i64) -> Result<Vec<i64>, MentorLoopError> {
        let mut stmt = conn.prepare(
            "SELECT schedule_id FROM weekly_schedules WHERE student_id = ? ORDER BY schedule_id",
        )?;
        let rows = stmt.query_map([student_id], |row| row.get::<_, i64>(0))?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    pub fn activity(&self, activity_id: i64) -> Option<&ScheduleActivity> {
        self.days
            .iter()
            .flat_map(|day| day.activities.iter())
            .find(|a| a.activity_id == activity_id)
    }

    pub fn habits(&self) -> impl Iterator<Item = &ScheduleActivity> {
        self.days
            .iter()
            .flat_map(|day| day.activities.iter())
            .filter(|a| a.kind.is_habit())
    }

    fn habit_histories(
        conn: &Connection,
        schedule_id: i64,
    ) -> Result<HashMap<i64, BTreeSet<NaiveDate>>, MentorLoopError> {
        let mut stmt = conn.prepare(
            "SELECT hc.activity_id, hc.completed_on
            FROM habit_completions hc
            JOIN schedule_activities sa ON sa.activity_id = hc.activity_id
            WHERE sa.schedule_id = ?",
        )?;
        let rows = stmt.query_map([schedule_id], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut histories: HashMap<i64, BTreeSet<NaiveDate>> = HashMap::new();
        for row in rows {
            let (activity_id, completed_on) = row?;
            match parse_date(&completed_on) {
                Ok(date) => {
                    histories.entry(activity_id).or_default().insert(date);
                }
                Err(e) => warn!("Skipping habit completion for activity {}: {}", activity_id, e),
            }
        }
        Ok(histories)
    }

    fn require_owner(conn: &Connection, schedule_id: i64, professional_id: i64) -> Result<(), MentorLoopError> {
        let owner: Option<i64> = conn
            .query_row(
                "SELECT professional_id FROM weekly_schedules WHERE schedule_id = ?",
                [schedule_id],
                |row| row.get(0),
            )
            .optional()?;

        match owner {
            None => Err(MentorLoopError::not_found("Schedule", schedule_id)),
            Some(owner) if owner != professional_id => Err(MentorLoopError::Unauthorized(format!(
                "Professional {} does not own schedule {}",
                professional_id, schedule_id
            ))),
            Some(_) => Ok(()),
        }
    }

    /// Append an activity to one day of the week
    pub fn add_activity(
        conn: &Connection,
        professional_id: i64,
        schedule_id: i64,
        weekday: Weekday,
        new_activity: &NewActivity,
    ) -> Result<ScheduleActivity, MentorLoopError> {
        let measures = new_activity.validate()?;
        let kind_json = new_activity.kind.to_json()?;
        let weekday_index = weekday.num_days_from_monday() as i64;

        Database::immediate_transaction(conn, |c| {
            Self::require_owner(c, schedule_id, professional_id)?;

            let (activity_id, position): (i64, i64) = c.query_row(
                "INSERT INTO schedule_activities
                    (schedule_id, weekday, title, kind, points, estimated_minutes, is_required, position)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7,
                    (SELECT COALESCE(MAX(position), 0) + 1 FROM schedule_activities WHERE schedule_id = ?1 AND weekday = ?2))
                RETURNING activity_id, position",
                params![
                    schedule_id,
                    weekday_index,
                    new_activity.title.trim(),
                    kind_json,
                    measures.points,
                    measures.estimated_minutes,
                    new_activity.is_required,
                ],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;

            info!(
                "Added {} activity {} to schedule {} on {}",
                new_activity.kind.type_name(),
                activity_id,
                schedule_id,
                weekday
            );

            Ok(ScheduleActivity {
                activity_id,
                weekday,
                title: new_activity.title.trim().to_owned(),
                kind: new_activity.kind.clone(),
                points: measures.points,
                estimated_minutes: measures.estimated_minutes,
                is_required: new_activity.is_required,
                position,
                completion_dates: BTreeSet::new(),
                current_streak: 0,
                max_streak: 0,
            })
        })
    }

    /// IMPORTANT: Caller must hold an immediate transaction
    pub fn record_habit_completion_immediate(
        conn: &Connection,
        activity_id: i64,
        date: NaiveDate,
    ) -> Result<(), MentorLoopError> {
        conn.execute(
            "INSERT OR IGNORE INTO habit_completions (activity_id, completed_on) VALUES (?, ?)",
            params![activity_id, format_date(date)],
        )?;
        Ok(())
    }

    /// IMPORTANT: Caller must hold an immediate transaction
    pub fn remove_habit_completion_immediate(
        conn: &Connection,
        activity_id: i64,
        date: NaiveDate,
    ) -> Result<(), MentorLoopError> {
        conn.execute(
            "DELETE FROM habit_completions WHERE activity_id = ? AND completed_on = ?",
            params![activity_id, format_date(date)],
        )?;
        Ok(())
    }

    pub fn habit_dates(conn: &Connection, activity_id: i64) -> Result<BTreeSet<NaiveDate>, MentorLoopError> {
        let mut stmt = conn.prepare("SELECT completed_on FROM habit_completions WHERE activity_id = ?")?;
        let rows = stmt.query_map([activity_id], |row| row.get::<_, String>(0))?;

        let mut dates = BTreeSet::new();
        for row in rows {
            dates.insert(parse_date(&row?)?);
        }
        Ok(dates)
    }

    /// Re-derive and store the streak of a habit from its history.
    ///
    /// IMPORTANT: Caller must hold an immediate transaction
    pub fn refresh_streak_immediate(
        conn: &Connection,
        activity_id: i64,
        reference_date: NaiveDate,
    ) -> Result<StreakResult, MentorLoopError> {
        let prior_max: u32 = conn
            .query_row(
                "SELECT max_streak FROM schedule_activities WHERE activity_id = ?",
                [activity_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(MentorLoopError::not_found("Schedule activity", activity_id))?;

        let dates = Self::habit_dates(conn, activity_id)?;
        let streak = compute_streak(dates, reference_date, prior_max);

        conn.execute(
            "UPDATE schedule_activities SET current_streak = ?, max_streak = ? WHERE activity_id = ?",
            params![streak.current, streak.updated_max, activity_id],
        )?;

        debug!(
            "Habit {} streak as of {}: current {}, max {}",
            activity_id, reference_date, streak.current, streak.updated_max
        );

        Ok(streak)
    }

    /// Delete a schedule activity, honoring the referential-integrity policy for
    /// progress entries and habit history that reference it. Students who lose
    /// progress get their stats recomputed in the same transaction.
    pub fn delete_activity(
        conn: &Connection,
        professional_id: i64,
        activity_id: i64,
        policy: DeletePolicy,
        gamification: &GamificationConfig,
        reference_date: NaiveDate,
    ) -> Result<ScheduleActivityDeletion, MentorLoopError> {
        Database::immediate_transaction(conn, |c| {
            let schedule_id: i64 = c
                .query_row(
                    "SELECT schedule_id FROM schedule_activities WHERE activity_id = ?",
                    [activity_id],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or(MentorLoopError::not_found("Schedule activity", activity_id))?;
            Self::require_owner(c, schedule_id, professional_id)?;

            let mut affected_students = Vec::new();
            {
                let mut stmt = c.prepare(
                    "SELECT DISTINCT student_id FROM schedule_progress
                    WHERE schedule_id = ? AND activity_id = ?
                    ORDER BY student_id",
                )?;
                let rows = stmt.query_map([schedule_id, activity_id], |row| row.get::<_, i64>(0))?;
                for row in rows {
                    affected_students.push(row?);
                }
            }
            let history_rows: i64 = c.query_row(
                "SELECT COUNT(*) FROM habit_completions WHERE activity_id = ?",
                [activity_id],
                |row| row.get(0),
            )?;

            if !affected_students.is_empty() || history_rows > 0 {
                match policy {
                    DeletePolicy::Reject => {
                        return Err(MentorLoopError::ReferentialIntegrity(format!(
                            "Schedule activity {} has {} progress entr(ies) and {} habit completion(s)",
                            activity_id,
                            affected_students.len(),
                            history_rows
                        )));
                    }
                    DeletePolicy::Cascade => {
                        c.execute(
                            "DELETE FROM schedule_progress WHERE schedule_id = ? AND activity_id = ?",
                            [schedule_id, activity_id],
                        )?;
                        c.execute(
                            "DELETE FROM habit_completions WHERE activity_id = ?",
                            [activity_id],
                        )?;
                        warn!(
                            "Cascade delete of schedule activity {} removed progress for {} student(s)",
                            activity_id,
                            affected_students.len()
                        );
                    }
                }
            }

            c.execute(
                "DELETE FROM schedule_activities WHERE activity_id = ?",
                [activity_id],
            )?;
            info!(
                "Deleted schedule activity {} from schedule {}",
                activity_id, schedule_id
            );

            for &student_id in &affected_students {
                Gamification::recompute_student_stats_immediate(c, student_id, gamification, reference_date)?;
            }

            Ok(ScheduleActivityDeletion {
                activity_id,
                schedule_id,
                affected_students,
            })
        })
    }
}
