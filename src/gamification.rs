use std::collections::BTreeMap;

use chrono::NaiveDate;
use log::{debug, Level};
use logging_timer::timer;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::aggregate::aggregate;
use crate::assignments::Assignments;
use crate::config::GamificationConfig;
use crate::database::Database;
use crate::error::MentorLoopError;
use crate::programs::Program;
use crate::schedule_progress::ScheduleProgress;
use crate::schedules::WeeklySchedule;
use crate::streak::compute_streak;
use crate::students::{CachedStats, Student};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudentStats {
    pub student_id: i64,
    pub total_points: u64,
    pub level: u32,
    /// Largest current streak across the student's habits
    pub streak: u32,
    pub current_streak_per_habit: BTreeMap<i64, u32>,
    pub curriculum_points: u64,
    pub schedule_points: u64,
}

impl StudentStats {
    fn cached(&self) -> CachedStats {
        CachedStats {
            total_points: self.total_points,
            level: self.level,
            streak: self.streak,
        }
    }
}

/// `floor(total / threshold) + 1`. A zero threshold is treated as the default.
pub fn level_for(total_points: u64, level_threshold: u64) -> u32 {
    let threshold = if level_threshold == 0 {
        GamificationConfig::LEVEL_THRESHOLD
    } else {
        level_threshold
    };
    u32::try_from(total_points / threshold)
        .unwrap_or(u32::MAX - 1)
        .saturating_add(1)
}

pub struct Gamification;

impl Gamification {
    /// Derive a student's points, level and streaks from the ledgers.
    /// Curriculum and schedule points are added together even when the same
    /// content appears in both.
    pub fn compose(
        conn: &Connection,
        student_id: i64,
        config: &GamificationConfig,
        reference_date: NaiveDate,
    ) -> Result<StudentStats, MentorLoopError> {
        let _tmr = timer!(Level::Trace; "Gamification::compose", "student {}", student_id);

        let mut stats = StudentStats {
            student_id,
            ..Default::default()
        };

        for assignment in Assignments::for_student(conn, student_id)? {
            match Program::get_by_id(conn, assignment.program_id)? {
                Some(program) => {
                    stats.curriculum_points +=
                        aggregate(&program, &assignment.completed_activity_ids).points_earned;
                }
                None => debug!(
                    "Assignment {} references missing program {}",
                    assignment.assignment_id, assignment.program_id
                ),
            }
        }

        for schedule_id in WeeklySchedule::ids_for_student(conn, student_id)? {
            let schedule = WeeklySchedule::require(conn, schedule_id)?;
            let entries = ScheduleProgress::for_schedule(conn, student_id, schedule_id)?;
            stats.schedule_points +=
                aggregate(&schedule, &ScheduleProgress::completed_set(&entries)).points_earned;

            for habit in schedule.habits() {
                let streak = compute_streak(
                    habit.completion_dates.iter().copied(),
                    reference_date,
                    habit.max_streak,
                );
                stats.current_streak_per_habit.insert(habit.activity_id, streak.current);
            }
        }

        stats.total_points = stats.curriculum_points + stats.schedule_points;
        stats.level = level_for(stats.total_points, config.level_threshold);
        stats.streak = stats
            .current_streak_per_habit
            .values()
            .copied()
            .max()
            .unwrap_or(0);

        Ok(stats)
    }

    /// Compose and write the student's cached stats.
    ///
    /// IMPORTANT: Caller must hold an immediate transaction
    pub fn recompute_student_stats_immediate(
        conn: &Connection,
        student_id: i64,
        config: &GamificationConfig,
        reference_date: NaiveDate,
    ) -> Result<StudentStats, MentorLoopError> {
        let stats = Self::compose(conn, student_id, config, reference_date)?;
        Student::write_stats_immediate(conn, student_id, &stats.cached())?;

        debug!(
            "Student {} stats: {} points ({} curriculum, {} schedule), level {}, streak {}",
            student_id,
            stats.total_points,
            stats.curriculum_points,
            stats.schedule_points,
            stats.level,
            stats.streak
        );

        Ok(stats)
    }

    pub fn recompute_student_stats(
        conn: &Connection,
        student_id: i64,
        config: &GamificationConfig,
        reference_date: NaiveDate,
    ) -> Result<StudentStats, MentorLoopError> {
        Student::require(conn, student_id)?;
        Database::immediate_transaction(conn, |c| {
            Self::recompute_student_stats_immediate(c, student_id, config, reference_date)
        })
    }
}
