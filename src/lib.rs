//! Progress and consistency core for a student companion platform.
//!
//! Professionals author curriculum programs and weekly schedules; students
//! complete activities. This crate keeps the completion ledgers, derives
//! progress percentages, habit streaks, points and levels, and keeps program
//! assignments consistent with both sides of the student/program reference.

pub mod activity;
pub mod aggregate;
pub mod assignments;
pub mod cli;
pub mod config;
pub mod database;
pub mod error;
pub mod facade;
pub mod gamification;
pub mod ledger;
pub mod logging;
pub mod notifications;
pub mod programs;
pub mod schedule_progress;
pub mod schedules;
pub mod schema;
pub mod streak;
pub mod students;

pub use error::MentorLoopError;
pub use facade::Core;
