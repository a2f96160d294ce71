use serde::{Deserialize, Serialize};

use super::quiz::{Difficulty, TestCase};

pub const MAX_LEVEL: u8 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LevelType {
    Syntax,
    MultiPath,
    ErrorNavigation,
    Constraint,
    MicroProject,
}

impl LevelType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Syntax => "syntax",
            Self::MultiPath => "multi-path",
            Self::ErrorNavigation => "error-navigation",
            Self::Constraint => "constraint",
            Self::MicroProject => "micro-project",
        }
    }

    /// Level types whose assessment may award a creativity bonus.
    pub const fn awards_creativity(self) -> bool {
        matches!(self, Self::MultiPath | Self::Constraint | Self::MicroProject)
    }
}

pub struct LevelLabel {
    pub name: &'static str,
    pub level_type: LevelType,
    pub description: &'static str,
}

pub fn level_label(level: u8) -> Option<LevelLabel> {
    let (name, level_type, description) = match level {
        1 => (
            "Syntax Foundation",
            LevelType::Syntax,
            "Can you write it correctly?",
        ),
        2 => (
            "Multi-Path Thinking",
            LevelType::MultiPath,
            "Can you solve it different ways?",
        ),
        3 => (
            "Error Navigation",
            LevelType::ErrorNavigation,
            "Can you debug when things break?",
        ),
        4 => (
            "Constraint Adaptation",
            LevelType::Constraint,
            "Can you find creative solutions?",
        ),
        5 => (
            "Real Application",
            LevelType::MicroProject,
            "Can you build something functional?",
        ),
        _ => return None,
    };
    Some(LevelLabel {
        name,
        level_type,
        description,
    })
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Topic {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: String,
    pub order: u32,
    #[serde(default)]
    pub prerequisites: Vec<String>,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Problem {
    pub id: String,
    pub topic_id: String,
    pub level: u8,
    pub level_type: LevelType,
    pub title: String,
    pub description: String,
    #[serde(default = "default_function_name")]
    pub function_name: String,
    #[serde(default)]
    pub starter_code: Option<String>,
    /// Forbidden constructs for constraint levels.
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub project_requirements: Vec<String>,
    pub test_cases: Vec<TestCase>,
    #[serde(default)]
    pub required_solutions: Option<u32>,
    #[serde(default)]
    pub difficulty: Difficulty,
    #[serde(default)]
    pub order: u32,
}

impl Problem {
    pub fn starter_code(&self) -> String {
        self.starter_code
            .clone()
            .unwrap_or_else(|| starter_template(&self.function_name))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BeginnerTopic {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub order: u32,
    #[serde(default)]
    pub prerequisites: Vec<String>,
    #[serde(default)]
    pub cumulative_topics: Vec<String>,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

/// Bundle loaded by the `seed-content` binary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeedContent {
    #[serde(default)]
    pub topics: Vec<Topic>,
    #[serde(default)]
    pub problems: Vec<Problem>,
    #[serde(default)]
    pub beginner_topics: Vec<BeginnerTopic>,
}

pub fn starter_template(function_name: &str) -> String {
    format!("// Write your solution here\nfunction {}() {{\n  \n}}\n", function_name)
}

fn default_active() -> bool {
    true
}

fn default_function_name() -> String {
    "solution".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_labels_cover_five_levels() {
        assert_eq!(level_label(1).unwrap().level_type, LevelType::Syntax);
        assert_eq!(level_label(5).unwrap().name, "Real Application");
        assert!(level_label(0).is_none());
        assert!(level_label(6).is_none());
    }

    #[test]
    fn level_type_uses_kebab_case() {
        let parsed: LevelType = serde_json::from_str("\"error-navigation\"").unwrap();
        assert_eq!(parsed, LevelType::ErrorNavigation);
        assert_eq!(LevelType::MultiPath.as_str(), "multi-path");
    }

    #[test]
    fn starter_template_names_the_function() {
        assert!(starter_template("sumPair").contains("function sumPair()"));
    }
}
