use chrono::{DateTime, NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use directories::ProjectDirs;
use log::info;
use serde::Serialize;

use crate::assignments::{AssignOptions, Granularity};
use crate::config::Config;
use crate::error::MentorLoopError;
use crate::facade::Core;
use crate::ledger::{CompletionMeta, CompletionScope};

#[derive(Parser)]
#[command(
    name = "mentorloop",
    version,
    about = "mentorloop: progress, streaks and program assignments for student companions"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// Exactly one of `--program` or `--schedule`
#[derive(Args, Debug, Clone, PartialEq)]
#[group(required = true, multiple = false)]
pub struct ScopeArgs {
    /// Curriculum program id
    #[arg(long)]
    pub program: Option<i64>,

    /// Weekly schedule id
    #[arg(long)]
    pub schedule: Option<i64>,
}

impl ScopeArgs {
    fn scope(&self) -> Result<CompletionScope, MentorLoopError> {
        match (self.program, self.schedule) {
            (Some(id), None) => Ok(CompletionScope::Program(id)),
            (None, Some(id)) => Ok(CompletionScope::Schedule(id)),
            _ => Err(MentorLoopError::Validation(
                "Specify exactly one of --program or --schedule".into(),
            )),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create the data directory, config and database. Optionally register a professional.
    Init {
        /// Name of a professional to create
        #[arg(long)]
        professional: Option<String>,
    },

    /// Assign a program to one or more students
    Assign {
        #[arg(long)]
        program: i64,

        /// Id of the professional making the assignment
        #[arg(long = "by")]
        assigned_by: i64,

        /// Student ids (repeat or comma separate)
        #[arg(long = "student", required = true, value_delimiter = ',')]
        students: Vec<i64>,

        /// First day of the assignment (YYYY-MM-DD, default: today)
        #[arg(long)]
        start: Option<NaiveDate>,

        /// Last day of the assignment (YYYY-MM-DD)
        #[arg(long)]
        end: Option<NaiveDate>,

        /// Notify each newly assigned student
        #[arg(long, default_value_t = false)]
        notify: bool,

        /// Commit each student on its own instead of all-or-nothing
        #[arg(long = "per-student", default_value_t = false)]
        per_student: bool,
    },

    /// Record (or for schedules, undo) a student's completion of an activity
    Complete {
        #[arg(long)]
        student: i64,

        #[command(flatten)]
        scope: ScopeArgs,

        #[arg(long)]
        activity: i64,

        /// Mark the schedule activity as not completed
        #[arg(long, default_value_t = false)]
        undo: bool,

        /// Minutes spent on the activity
        #[arg(long, default_value_t = 0)]
        minutes: u32,

        /// Answer payload as JSON
        #[arg(long)]
        answer: Option<serde_json::Value>,

        /// Completion time (RFC 3339, default: now)
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },

    /// Show a student's progress through a program or a weekly schedule
    Progress {
        #[arg(long)]
        student: i64,

        #[command(flatten)]
        scope: ScopeArgs,
    },

    /// Recompute and show a student's points, level and streaks
    Stats {
        #[arg(long)]
        student: i64,

        /// Evaluate streaks as of this day (YYYY-MM-DD, default: today)
        #[arg(long = "as-of")]
        as_of: Option<NaiveDate>,
    },

    /// Report assignments whose student and program references disagree
    Audit,
}

impl Cli {
    pub fn handle_command_line(project_dirs: &ProjectDirs) -> Result<(), MentorLoopError> {
        let args = Cli::parse();
        let config = Config::get()?;
        let core = Core::open(
            &config.database.resolve_dir(project_dirs),
            config.gamification,
        )?;

        Self::run(&core, args.command)
    }

    pub fn run(core: &Core, command: Command) -> Result<(), MentorLoopError> {
        info!("Running command: {:?}", command);

        match command {
            Command::Init { professional } => match professional {
                Some(name) => print_json(&core.create_professional(&name)?),
                None => {
                    println!("Database ready");
                    Ok(())
                }
            },
            Command::Assign {
                program,
                assigned_by,
                students,
                start,
                end,
                notify,
                per_student,
            } => {
                let mut options = AssignOptions::new(assigned_by, start.unwrap_or_else(|| Utc::now().date_naive()));
                options.end_date = end;
                options.notify = notify;
                if per_student {
                    options.granularity = Granularity::PerStudent;
                }
                print_json(&core.assign_program_to_students(program, &students, &options)?)
            }
            Command::Complete {
                student,
                scope,
                activity,
                undo,
                minutes,
                answer,
                at,
            } => {
                let meta = CompletionMeta {
                    completed_at: at.unwrap_or_else(Utc::now),
                    time_spent_minutes: minutes,
                    answer,
                };
                let receipt = core.set_activity_completion(student, scope.scope()?, activity, !undo, &meta)?;
                print_json(&receipt)
            }
            Command::Progress { student, scope } => match scope.scope()? {
                CompletionScope::Program(id) => print_json(&core.program_progress(student, id)?),
                CompletionScope::Schedule(id) => print_json(&core.schedule_progress_summary(student, id)?),
            },
            Command::Stats { student, as_of } => {
                let stats = match as_of {
                    Some(date) => core.get_student_stats_as_of(student, date)?,
                    None => core.get_student_stats(student)?,
                };
                print_json(&stats)
            }
            Command::Audit => print_json(&core.audit_cross_references()?),
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), MentorLoopError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
