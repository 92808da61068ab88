use rusqlite::{named_params, Connection};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use crate::error::MentorLoopError;

#[derive(AsRefStr, EnumString, Display, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    ProgramAssigned,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub notification_id: i64,
    pub student_id: i64,
    pub kind: NotificationKind,
    pub message: String,
    pub created_at: i64,
    pub is_read: bool,
}

pub struct Notifications;

impl Notifications {
    /// IMPORTANT: Caller must hold an immediate transaction
    pub fn create_immediate(
        conn: &Connection,
        student_id: i64,
        kind: NotificationKind,
        message: &str,
    ) -> Result<i64, MentorLoopError> {
        let sql = r#"
            INSERT INTO notifications (student_id, kind, message, created_at, is_read)
            VALUES (:student_id, :kind, :message, strftime('%s', 'now', 'utc'), 0)
            RETURNING notification_id
        "#;

        let id = conn.query_row(
            sql,
            named_params! {
                ":student_id":  student_id,
                ":kind":        kind.as_ref(),
                ":message":     message,
            },
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn list_for_student(
        conn: &Connection,
        student_id: i64,
        unread_only: bool,
    ) -> Result<Vec<Notification>, MentorLoopError> {
        let sql = r#"
            SELECT notification_id, kind, message, created_at, is_read
            FROM notifications
            WHERE student_id = :student_id
            AND (:unread_only = 0 OR is_read = 0)
            ORDER BY notification_id ASC
        "#;

        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(
            named_params! {
                ":student_id":  student_id,
                ":unread_only": unread_only,
            },
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, bool>(4)?,
                ))
            },
        )?;

        let mut notifications = Vec::new();
        for row in rows {
            let (notification_id, kind, message, created_at, is_read) = row?;
            let kind = kind.parse::<NotificationKind>().map_err(|_| {
                MentorLoopError::Error(format!("Invalid notification kind: '{}'", kind))
            })?;
            notifications.push(Notification {
                notification_id,
                student_id,
                kind,
                message,
                created_at,
                is_read,
            });
        }
        Ok(notifications)
    }

    pub fn mark_read(conn: &Connection, notification_id: i64) -> Result<(), MentorLoopError> {
        let rows = conn.execute(
            "UPDATE notifications SET is_read = 1 WHERE notification_id = ?",
            [notification_id],
        )?;
        if rows == 0 {
            return Err(MentorLoopError::not_found("Notification", notification_id));
        }
        Ok(())
    }
}
