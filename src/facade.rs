use std::collections::BTreeMap;
use std::path::Path;

use chrono::{NaiveDate, Utc, Weekday};

use crate::activity::{Activity, DeletePolicy, NewActivity};
use crate::assignments::{
    AssignOptions, Assignment, AssignmentOutcome, AssignmentStatus, Assignments, CrossReferenceIssue,
};
use crate::config::GamificationConfig;
use crate::database::Database;
use crate::error::MentorLoopError;
use crate::gamification::{Gamification, StudentStats};
use crate::ledger::{
    CompletionMeta, CompletionReceipt, CompletionScope, Ledger, ProgramProgress, ScheduleProgressSummary,
};
use crate::notifications::{Notification, Notifications};
use crate::programs::{ActivityDeletion, Module, Program};
use crate::schedule_progress::ScheduleProgressEntry;
use crate::schedules::{ScheduleActivity, ScheduleActivityDeletion, WeeklySchedule};
use crate::students::{Professional, Student};

/// Entry point for collaborators: one pooled connection per call, at most one
/// immediate transaction per write.
#[derive(Clone)]
pub struct Core {
    db: Database,
    gamification: GamificationConfig,
}

impl Core {
    pub fn new(db: Database, gamification: GamificationConfig) -> Self {
        Core { db, gamification }
    }

    pub fn open(db_folder: &Path, gamification: GamificationConfig) -> Result<Self, MentorLoopError> {
        Ok(Self::new(Database::connect(db_folder)?, gamification))
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    // Hierarchy reads

    pub fn get_program(&self, program_id: i64) -> Result<Program, MentorLoopError> {
        let conn = self.db.get_connection()?;
        Program::require(&conn, program_id)
    }

    pub fn get_schedule(&self, schedule_id: i64) -> Result<WeeklySchedule, MentorLoopError> {
        let conn = self.db.get_connection()?;
        WeeklySchedule::require(&conn, schedule_id)
    }

    pub fn get_student(&self, student_id: i64) -> Result<Student, MentorLoopError> {
        let conn = self.db.get_connection()?;
        Student::require(&conn, student_id)
    }

    // Ledger

    pub fn get_assignments_for_student(&self, student_id: i64) -> Result<Vec<Assignment>, MentorLoopError> {
        let conn = self.db.get_connection()?;
        Ledger::get_assignments_for_student(&conn, student_id)
    }

    pub fn get_schedule_progress(
        &self,
        student_id: i64,
        schedule_id: i64,
    ) -> Result<BTreeMap<i64, ScheduleProgressEntry>, MentorLoopError> {
        let conn = self.db.get_connection()?;
        Ledger::get_schedule_progress(&conn, student_id, schedule_id)
    }

    pub fn set_activity_completion(
        &self,
        student_id: i64,
        scope: CompletionScope,
        activity_id: i64,
        completed: bool,
        meta: &CompletionMeta,
    ) -> Result<CompletionReceipt, MentorLoopError> {
        let conn = self.db.get_connection()?;
        Ledger::set_activity_completion(
            &conn,
            &self.gamification,
            student_id,
            scope,
            activity_id,
            completed,
            meta,
        )
    }

    pub fn program_progress(&self, student_id: i64, program_id: i64) -> Result<ProgramProgress, MentorLoopError> {
        let conn = self.db.get_connection()?;
        Ledger::program_progress(&conn, student_id, program_id)
    }

    pub fn schedule_progress_summary(
        &self,
        student_id: i64,
        schedule_id: i64,
    ) -> Result<ScheduleProgressSummary, MentorLoopError> {
        let conn = self.db.get_connection()?;
        Ledger::schedule_progress_summary(&conn, student_id, schedule_id)
    }

    // Assignment protocol

    pub fn assign_program_to_students(
        &self,
        program_id: i64,
        student_ids: &[i64],
        options: &AssignOptions,
    ) -> Result<AssignmentOutcome, MentorLoopError> {
        let conn = self.db.get_connection()?;
        Assignments::assign_program_to_students(&conn, program_id, student_ids, options)
    }

    pub fn unassign_program(
        &self,
        program_id: i64,
        student_id: i64,
        professional_id: i64,
    ) -> Result<Assignment, MentorLoopError> {
        let conn = self.db.get_connection()?;
        Assignments::unassign_program(&conn, program_id, student_id, professional_id, today())
    }

    pub fn set_assignment_status(
        &self,
        assignment_id: i64,
        professional_id: i64,
        status: AssignmentStatus,
    ) -> Result<Assignment, MentorLoopError> {
        let conn = self.db.get_connection()?;
        Assignments::set_status(&conn, assignment_id, professional_id, status, today())
    }

    pub fn audit_cross_references(&self) -> Result<Vec<CrossReferenceIssue>, MentorLoopError> {
        let conn = self.db.get_connection()?;
        Assignments::audit_cross_references(&conn)
    }

    // Gamification

    /// Stats as of today, also refreshing the student's cached columns
    pub fn get_student_stats(&self, student_id: i64) -> Result<StudentStats, MentorLoopError> {
        self.get_student_stats_as_of(student_id, today())
    }

    pub fn get_student_stats_as_of(
        &self,
        student_id: i64,
        reference_date: NaiveDate,
    ) -> Result<StudentStats, MentorLoopError> {
        let conn = self.db.get_connection()?;
        Gamification::recompute_student_stats(&conn, student_id, &self.gamification, reference_date)
    }

    // Authoring

    pub fn create_professional(&self, name: &str) -> Result<Professional, MentorLoopError> {
        let conn = self.db.get_connection()?;
        Professional::create(&conn, name)
    }

    pub fn create_student(&self, professional_id: i64, name: &str) -> Result<Student, MentorLoopError> {
        let conn = self.db.get_connection()?;
        Student::create(&conn, professional_id, name)
    }

    pub fn create_program(&self, professional_id: i64, title: &str) -> Result<Program, MentorLoopError> {
        let conn = self.db.get_connection()?;
        Program::create(&conn, professional_id, title)
    }

    pub fn add_module(&self, professional_id: i64, program_id: i64, title: &str) -> Result<Module, MentorLoopError> {
        let conn = self.db.get_connection()?;
        Program::add_module(&conn, professional_id, program_id, title)
    }

    pub fn add_activity(
        &self,
        professional_id: i64,
        module_id: i64,
        activity: &NewActivity,
    ) -> Result<Activity, MentorLoopError> {
        let conn = self.db.get_connection()?;
        Program::add_activity(&conn, professional_id, module_id, activity)
    }

    pub fn delete_activity(
        &self,
        professional_id: i64,
        activity_id: i64,
        policy: DeletePolicy,
    ) -> Result<ActivityDeletion, MentorLoopError> {
        let conn = self.db.get_connection()?;
        Program::delete_activity(&conn, professional_id, activity_id, policy, &self.gamification, today())
    }

    pub fn create_schedule(
        &self,
        professional_id: i64,
        student_id: i64,
        title: &str,
    ) -> Result<WeeklySchedule, MentorLoopError> {
        let conn = self.db.get_connection()?;
        WeeklySchedule::create(&conn, professional_id, student_id, title)
    }

    pub fn add_schedule_activity(
        &self,
        professional_id: i64,
        schedule_id: i64,
        weekday: Weekday,
        activity: &NewActivity,
    ) -> Result<ScheduleActivity, MentorLoopError> {
        let conn = self.db.get_connection()?;
        WeeklySchedule::add_activity(&conn, professional_id, schedule_id, weekday, activity)
    }

    pub fn delete_schedule_activity(
        &self,
        professional_id: i64,
        activity_id: i64,
        policy: DeletePolicy,
    ) -> Result<ScheduleActivityDeletion, MentorLoopError> {
        let conn = self.db.get_connection()?;
        WeeklySchedule::delete_activity(&conn, professional_id, activity_id, policy, &self.gamification, today())
    }

    // Notifications

    pub fn list_notifications(&self, student_id: i64, unread_only: bool) -> Result<Vec<Notification>, MentorLoopError> {
        let conn = self.db.get_connection()?;
        Notifications::list_for_student(&conn, student_id, unread_only)
    }

    pub fn mark_notification_read(&self, notification_id: i64) -> Result<(), MentorLoopError> {
        let conn = self.db.get_connection()?;
        Notifications::mark_read(&conn, notification_id)
    }
}

fn today() -> NaiveDate {
    Utc::now().date_naive()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::programs::test_support::{habit, note};
    use tempfile::TempDir;

    fn core() -> (TempDir, Core) {
        let dir = TempDir::new().unwrap();
        let core = Core::open(dir.path(), GamificationConfig::default()).unwrap();
        (dir, core)
    }

    #[test]
    fn test_end_to_end_flow() {
        let (_dir, core) = core();
        let pro = core.create_professional("Dr. Ruiz").unwrap().professional_id;
        let ana = core.create_student(pro, "Ana").unwrap().student_id;

        let program = core.create_program(pro, "Sleep hygiene").unwrap();
        let module = core.add_module(pro, program.program_id, "Evening").unwrap();
        let dim = core.add_activity(pro, module.module_id, &note("Dim lights", 30)).unwrap();
        core.add_activity(pro, module.module_id, &note("No screens", 30)).unwrap();

        let mut options = AssignOptions::new(pro, today());
        options.notify = true;
        let outcome = core.assign_program_to_students(program.program_id, &[ana], &options).unwrap();
        assert_eq!(outcome.created, vec![ana]);
        assert_eq!(core.list_notifications(ana, true).unwrap().len(), 1);

        let receipt = core
            .set_activity_completion(
                ana,
                CompletionScope::Program(program.program_id),
                dim.activity_id,
                true,
                &CompletionMeta::now(),
            )
            .unwrap();
        assert_eq!(receipt.stats.total_points, 30);
        assert_eq!(core.program_progress(ana, program.program_id).unwrap().progress.percent, 50);
        assert_eq!(core.get_student(ana).unwrap().stats.total_points, 30);
        assert!(core.audit_cross_references().unwrap().is_empty());
    }

    #[test]
    fn test_cascade_delete_refreshes_stats() {
        let (_dir, core) = core();
        let pro = core.create_professional("Dr. Ruiz").unwrap().professional_id;
        let ana = core.create_student(pro, "Ana").unwrap().student_id;
        let schedule = core.create_schedule(pro, ana, "Week").unwrap();
        let walk = core
            .add_schedule_activity(pro, schedule.schedule_id, Weekday::Fri, &habit("Walk", 40))
            .unwrap();

        core.set_activity_completion(
            ana,
            CompletionScope::Schedule(schedule.schedule_id),
            walk.activity_id,
            true,
            &CompletionMeta::now(),
        )
        .unwrap();
        assert_eq!(core.get_student_stats(ana).unwrap().streak, 1);

        assert!(matches!(
            core.delete_schedule_activity(pro, walk.activity_id, DeletePolicy::Reject),
            Err(MentorLoopError::ReferentialIntegrity(_))
        ));

        let deletion = core
            .delete_schedule_activity(pro, walk.activity_id, DeletePolicy::Cascade)
            .unwrap();
        assert_eq!(deletion.affected_students, vec![ana]);
        let student = core.get_student(ana).unwrap();
        assert_eq!(student.stats.total_points, 0);
        assert_eq!(student.stats.streak, 0);
        assert!(core.get_schedule_progress(ana, schedule.schedule_id).unwrap().is_empty());
    }

    #[test]
    fn test_missing_hierarchies_are_not_found() {
        let (_dir, core) = core();
        assert!(matches!(
            core.get_program(1),
            Err(MentorLoopError::NotFound { entity: "Program", id: 1 })
        ));
        assert!(matches!(
            core.get_schedule(1),
            Err(MentorLoopError::NotFound { entity: "Schedule", id: 1 })
        ));
    }
}
