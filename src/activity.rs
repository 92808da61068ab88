use serde::{Deserialize, Serialize};

use crate::error::MentorLoopError;

/// How often a habit is expected to be practiced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum HabitFrequency {
    Daily,
    TimesPerWeek(u8),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuizQuestion {
    pub prompt: String,
    pub options: Vec<String>,
    pub answer_index: usize,
}

/// The kind of a completable activity, with the payload each kind needs.
///
/// Stored as JSON in the `kind` column of `activities` and `schedule_activities`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActivityKind {
    Note { body: String },
    Checklist { items: Vec<String> },
    Video { url: String },
    Quiz { questions: Vec<QuizQuestion> },
    File { url: String, file_name: String },
    Habit { frequency: HabitFrequency },
}

impl ActivityKind {
    pub fn is_habit(&self) -> bool {
        matches!(self, ActivityKind::Habit { .. })
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ActivityKind::Note { .. } => "note",
            ActivityKind::Checklist { .. } => "checklist",
            ActivityKind::Video { .. } => "video",
            ActivityKind::Quiz { .. } => "quiz",
            ActivityKind::File { .. } => "file",
            ActivityKind::Habit { .. } => "habit",
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        match self {
            ActivityKind::Note { .. } => Ok(()),
            ActivityKind::Checklist { items } => {
                if items.iter().any(|item| item.trim().is_empty()) {
                    return Err("Checklist items must not be empty".to_string());
                }
                Ok(())
            }
            ActivityKind::Video { url } | ActivityKind::File { url, .. } => {
                if url.trim().is_empty() {
                    return Err(format!("{} activity requires a url", self.type_name()));
                }
                Ok(())
            }
            ActivityKind::Quiz { questions } => {
                if questions.is_empty() {
                    return Err("Quiz requires at least one question".to_string());
                }
                for (i, q) in questions.iter().enumerate() {
                    if q.answer_index >= q.options.len() {
                        return Err(format!(
                            "Quiz question {} has answer_index {} but only {} options",
                            i + 1,
                            q.answer_index,
                            q.options.len()
                        ));
                    }
                }
                Ok(())
            }
            ActivityKind::Habit { frequency } => match frequency {
                HabitFrequency::Daily => Ok(()),
                HabitFrequency::TimesPerWeek(n) if (1..=7).contains(n) => Ok(()),
                HabitFrequency::TimesPerWeek(n) => {
                    Err(format!("Habit frequency must be 1-7 times per week, got {}", n))
                }
            },
        }
    }

    pub fn to_json(&self) -> Result<String, MentorLoopError> {
        serde_json::to_string(self)
            .map_err(|e| MentorLoopError::Error(format!("Failed to serialize ActivityKind: {}", e)))
    }

    pub fn from_json(json: &str) -> Result<Self, MentorLoopError> {
        serde_json::from_str(json).map_err(|e| {
            MentorLoopError::Error(format!("Failed to deserialize ActivityKind: {}", e))
        })
    }
}

/// What to do with ledger rows that reference an activity being deleted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletePolicy {
    /// Refuse the deletion while any ledger row references the activity
    Reject,
    /// Delete the referencing ledger rows together with the activity
    Cascade,
}

/// Authoring input shared by curriculum activities and schedule activities
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewActivity {
    pub title: String,
    pub kind: ActivityKind,
    pub points: i64,
    pub estimated_minutes: i64,
    pub is_required: bool,
}

/// Points and minutes after validation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidatedMeasures {
    pub points: u32,
    pub estimated_minutes: u32,
}

impl NewActivity {
    pub fn validate(&self) -> Result<ValidatedMeasures, MentorLoopError> {
        if self.title.trim().is_empty() {
            return Err(MentorLoopError::Validation(
                "Activity title must not be empty".into(),
            ));
        }
        let points = u32::try_from(self.points).map_err(|_| {
            MentorLoopError::Validation(format!("Invalid activity points: {}", self.points))
        })?;
        let estimated_minutes = u32::try_from(self.estimated_minutes).map_err(|_| {
            MentorLoopError::Validation(format!(
                "Invalid estimated time: {} minutes",
                self.estimated_minutes
            ))
        })?;
        self.kind.validate().map_err(MentorLoopError::Validation)?;

        Ok(ValidatedMeasures {
            points,
            estimated_minutes,
        })
    }
}

/// A curriculum leaf
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    pub activity_id: i64,
    pub title: String,
    pub kind: ActivityKind,
    pub points: u32,
    pub estimated_minutes: u32,
    pub is_required: bool,
    pub position: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_activity(points: i64, kind: ActivityKind) -> NewActivity {
        NewActivity {
            title: "Breathing".into(),
            kind,
            points,
            estimated_minutes: 5,
            is_required: true,
        }
    }

    #[test]
    fn test_kind_json_is_tagged() {
        let kind = ActivityKind::Habit {
            frequency: HabitFrequency::TimesPerWeek(3),
        };
        let json = kind.to_json().unwrap();
        assert!(json.contains(r#""type":"habit""#));
        assert_eq!(ActivityKind::from_json(&json).unwrap(), kind);
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        assert!(ActivityKind::from_json(r#"{"type":"podcast"}"#).is_err());
    }

    #[test]
    fn test_negative_points_rejected() {
        let result = new_activity(-5, ActivityKind::Note { body: String::new() }).validate();
        assert!(matches!(result, Err(MentorLoopError::Validation(_))));
    }

    #[test]
    fn test_valid_activity_measures() {
        let measures = new_activity(10, ActivityKind::Video { url: "https://v/1".into() })
            .validate()
            .unwrap();
        assert_eq!(measures.points, 10);
        assert_eq!(measures.estimated_minutes, 5);
    }

    #[test]
    fn test_quiz_answer_out_of_range() {
        let kind = ActivityKind::Quiz {
            questions: vec![QuizQuestion {
                prompt: "How do you feel?".into(),
                options: vec!["Calm".into(), "Anxious".into()],
                answer_index: 2,
            }],
        };
        assert!(kind.validate().is_err());
    }

    #[test]
    fn test_habit_frequency_bounds() {
        let ok = ActivityKind::Habit { frequency: HabitFrequency::TimesPerWeek(7) };
        let bad = ActivityKind::Habit { frequency: HabitFrequency::TimesPerWeek(0) };
        assert!(ok.validate().is_ok());
        assert!(bad.validate().is_err());
        assert!(ok.is_habit());
    }
}
