//! Model routing: pick a model, turn limit, and budget per task.
//!
//! Complexity comes from an explicit hint in the task's context blob when
//! present, otherwise from keyword heuristics over the name and
//! description.

use std::fmt;
use std::str::FromStr;

/// Estimated task complexity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Complexity {
    Trivial,
    Low,
    Medium,
    High,
}

impl fmt::Display for Complexity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Trivial => "trivial",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        };
        f.write_str(s)
    }
}

impl FromStr for Complexity {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trivial" => Ok(Self::Trivial),
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            _ => Err(()),
        }
    }
}

/// What a complexity class maps to.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelRoute {
    pub model: &'static str,
    pub max_turns: u32,
    pub max_budget_usd: Option<f64>,
}

const HIGH_MARKERS: &[&str] = &[
    "architect", "refactor", "redesign", "migrate", "migration", "security", "concurrency",
    "protocol", "rewrite",
];
const TRIVIAL_MARKERS: &[&str] = &["typo", "rename", "bump", "comment", "whitespace", "format"];
const LOW_MARKERS: &[&str] = &["fix", "tweak", "update", "docs", "readme", "lint", "cleanup"];

/// Classify a task. An explicit hint wins; otherwise keyword heuristics on
/// `name + description`, strongest class first.
pub fn classify(hint: Option<&str>, name: &str, description: &str) -> Complexity {
    if let Some(hint) = hint {
        if let Ok(c) = hint.parse() {
            return c;
        }
    }

    let haystack = format!("{name} {description}").to_lowercase();
    if HIGH_MARKERS.iter().any(|m| haystack.contains(m)) {
        return Complexity::High;
    }
    if TRIVIAL_MARKERS.iter().any(|m| haystack.contains(m)) {
        return Complexity::Trivial;
    }
    if LOW_MARKERS.iter().any(|m| haystack.contains(m)) {
        return Complexity::Low;
    }
    Complexity::Medium
}

/// Map a complexity class to its model route.
pub fn route(complexity: Complexity) -> ModelRoute {
    match complexity {
        Complexity::Trivial => ModelRoute {
            model: "haiku",
            max_turns: 8,
            max_budget_usd: Some(0.5),
        },
        Complexity::Low => ModelRoute {
            model: "sonnet",
            max_turns: 15,
            max_budget_usd: Some(1.5),
        },
        Complexity::Medium => ModelRoute {
            model: "sonnet",
            max_turns: 30,
            max_budget_usd: Some(5.0),
        },
        Complexity::High => ModelRoute {
            model: "opus",
            max_turns: 50,
            max_budget_usd: None,
        },
    }
}

/// Pull the optional `complexity` hint out of a task's context blob.
pub fn hint_from_context(context: Option<&str>) -> Option<String> {
    let context = context?;
    let value: serde_json::Value = serde_json::from_str(context).ok()?;
    value.get("complexity")?.as_str().map(|s| s.to_string())
}
