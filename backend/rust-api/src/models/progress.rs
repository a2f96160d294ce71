use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::content::MAX_LEVEL;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TopicProgress {
    pub current_level: u8,
    pub levels_completed: u32,
    pub total_score: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BeginnerProgress {
    pub completed: bool,
    pub score: u32,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserProgress {
    pub user_id: String,
    #[serde(default)]
    pub total_xp: u32,
    #[serde(default)]
    pub progress: HashMap<String, TopicProgress>,
    #[serde(default)]
    pub beginner_progress: HashMap<String, BeginnerProgress>,
    /// Tutoring sessions whose quiz XP has been credited.
    #[serde(default)]
    pub completed_sessions: Vec<String>,
}

impl UserProgress {
    pub fn empty(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            total_xp: 0,
            progress: HashMap::new(),
            beginner_progress: HashMap::new(),
            completed_sessions: Vec::new(),
        }
    }

    /// Advance topic progress by one level (capped) and add the score as XP.
    pub fn apply_level_completion(&mut self, topic_id: &str, level: u8, score: u32) {
        let entry = self.progress.entry(topic_id.to_string()).or_default();
        entry.current_level = next_level(level);
        entry.levels_completed += 1;
        entry.total_score += score;
        self.total_xp += score;
    }

    /// Mark a beginner topic complete; returns the XP earned. A session that
    /// was already credited changes nothing.
    pub fn apply_topic_completion(
        &mut self,
        topic_id: &str,
        session_id: &str,
        correct_count: u32,
        completed_at: DateTime<Utc>,
    ) -> u32 {
        let xp = topic_xp(correct_count);
        if self.completed_sessions.iter().any(|s| s == session_id) {
            return xp;
        }
        self.completed_sessions.push(session_id.to_string());
        self.beginner_progress.insert(
            topic_id.to_string(),
            BeginnerProgress {
                completed: true,
                score: correct_count,
                completed_at: Some(completed_at),
            },
        );
        self.total_xp += xp;
        xp
    }
}

/// XP awarded per correct beginner question.
pub const XP_PER_CORRECT_ANSWER: u32 = 10;

pub fn topic_xp(correct_count: u32) -> u32 {
    correct_count * XP_PER_CORRECT_ANSWER
}

pub fn next_level(completed_level: u8) -> u8 {
    (completed_level + 1).min(MAX_LEVEL)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TutorAvailability {
    pub uid: String,
    pub display_name: String,
    pub is_online: bool,
    #[serde(default)]
    pub in_session: bool,
    #[serde(default)]
    pub specialties: Vec<String>,
    pub last_online_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct PresenceRequest {
    #[serde(default)]
    pub display_name: Option<String>,
    pub is_online: bool,
    #[serde(default)]
    pub in_session: bool,
    #[serde(default)]
    pub specialties: Vec<String>,
}
