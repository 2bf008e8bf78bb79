//! Memory domain types
//!
//! A memory is a free-text observation scoped to a project, classified into a
//! cognitive sector, ranked by salience, and linked to the sessions that
//! created or recalled it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// CONSTANTS
// ============================================================================

/// Salience never drops below this floor
pub const SALIENCE_FLOOR: f64 = 0.05;

/// Salience ceiling
pub const SALIENCE_MAX: f64 = 1.0;

/// Default reinforcement amount
pub const REINFORCE_DEFAULT: f64 = 0.1;

/// Default deemphasize amount
pub const DEEMPHASIZE_DEFAULT: f64 = 0.2;

/// Reinforcement applied to memories returned by search
pub const SEARCH_REINFORCE: f64 = 0.02;

/// Minimum content length accepted on create
pub const MIN_CONTENT_LEN: usize = 5;

/// Maximum content length accepted on create
pub const MAX_CONTENT_LEN: usize = 32_000;

/// Salience at or above which session-tier memories are promoted to
/// project tier when their session ends
pub const PROMOTION_SALIENCE: f64 = 0.7;

// ============================================================================
// SECTORS
// ============================================================================

/// Coarse cognitive category of a memory, each with its own decay rate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Sector {
    /// Events and interactions ("user asked about X")
    Episodic,
    /// Facts about the world or the codebase
    #[default]
    Semantic,
    /// How-to knowledge, step sequences
    Procedural,
    /// Affective observations
    Emotional,
    /// Meta-observations about patterns and preferences
    Reflective,
}

impl Sector {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sector::Episodic => "episodic",
            Sector::Semantic => "semantic",
            Sector::Procedural => "procedural",
            Sector::Emotional => "emotional",
            Sector::Reflective => "reflective",
        }
    }

    /// Per-day decay constant. Emotional memories decay slowest,
    /// episodic fastest.
    pub fn decay_constant(&self) -> f64 {
        match self {
            Sector::Emotional => 0.003,
            Sector::Semantic => 0.005,
            Sector::Reflective => 0.008,
            Sector::Procedural => 0.01,
            Sector::Episodic => 0.02,
        }
    }
}

impl std::fmt::Display for Sector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Sector {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "episodic" => Ok(Sector::Episodic),
            "semantic" => Ok(Sector::Semantic),
            "procedural" => Ok(Sector::Procedural),
            "emotional" => Ok(Sector::Emotional),
            "reflective" => Ok(Sector::Reflective),
            _ => Err(format!("Unknown sector: {}", s)),
        }
    }
}

// ============================================================================
// TIERS
// ============================================================================

/// Scope of a memory. Session-tier memories are promoted to project tier on
/// session end when their salience is high enough.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Session,
    #[default]
    Project,
    Global,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Session => "session",
            Tier::Project => "project",
            Tier::Global => "global",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "session" => Ok(Tier::Session),
            "project" => Ok(Tier::Project),
            "global" => Ok(Tier::Global),
            _ => Err(format!("Unknown tier: {}", s)),
        }
    }
}

// ============================================================================
// MEMORY TYPES
// ============================================================================

/// Richer classification on top of sectors, set by callers that know the
/// provenance of a memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    Preference,
    Codebase,
    Decision,
    Gotcha,
    Pattern,
    TurnSummary,
    TaskCompletion,
}

impl MemoryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryType::Preference => "preference",
            MemoryType::Codebase => "codebase",
            MemoryType::Decision => "decision",
            MemoryType::Gotcha => "gotcha",
            MemoryType::Pattern => "pattern",
            MemoryType::TurnSummary => "turn_summary",
            MemoryType::TaskCompletion => "task_completion",
        }
    }
}

impl std::fmt::Display for MemoryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for MemoryType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "preference" => Ok(MemoryType::Preference),
            "codebase" => Ok(MemoryType::Codebase),
            "decision" => Ok(MemoryType::Decision),
            "gotcha" => Ok(MemoryType::Gotcha),
            "pattern" => Ok(MemoryType::Pattern),
            "turn_summary" => Ok(MemoryType::TurnSummary),
            "task_completion" => Ok(MemoryType::TaskCompletion),
            _ => Err(format!("Unknown memory type: {}", s)),
        }
    }
}

// ============================================================================
// SESSION USAGE
// ============================================================================

/// How a session used a memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageType {
    Created,
    Recalled,
    Updated,
    Reinforced,
}

impl UsageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageType::Created => "created",
            UsageType::Recalled => "recalled",
            UsageType::Updated => "updated",
            UsageType::Reinforced => "reinforced",
        }
    }
}

impl std::fmt::Display for UsageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// CORE ENTITIES
// ============================================================================

/// A project scoping all other entities
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub path: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A capture session. A project has at most one active (not-ended) session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub project_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub summary: Option<String>,
    pub context: Option<String>,
}

/// A stored memory
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Memory {
    pub id: String,
    pub project_id: String,
    pub content: String,
    pub summary: Option<String>,
    pub content_hash: String,
    pub simhash: Option<String>,
    pub sector: Sector,
    pub tier: Tier,
    pub memory_type: Option<MemoryType>,
    pub importance: f64,
    pub salience: f64,
    pub access_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
    pub is_deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub tags: Vec<String>,
    pub concepts: Vec<String>,
    pub files: Vec<String>,
    pub categories: Vec<String>,
}

impl Memory {
    /// Whether a SUPERSEDES edge or expiry has closed this memory's validity
    pub fn is_superseded(&self) -> bool {
        self.valid_until.is_some()
    }
}

/// A memory's vector row
#[derive(Debug, Clone)]
pub struct MemoryVector {
    pub memory_id: String,
    pub model_id: String,
    pub vector: Vec<f32>,
    pub dim: usize,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// INPUTS
// ============================================================================

/// Input for creating a new memory
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateMemoryInput {
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sector: Option<Sector>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<Tier>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_type: Option<MemoryType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub importance: Option<f64>,
    pub tags: Vec<String>,
    pub files: Vec<String>,
    pub categories: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_from: Option<DateTime<Utc>>,
    /// Session to link the created (or reinforced duplicate) memory to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Field patch for `update`
#[derive(Debug, Clone, Default)]
pub struct MemoryPatch {
    pub content: Option<String>,
    pub summary: Option<Option<String>>,
    pub importance: Option<f64>,
    pub tier: Option<Tier>,
    pub memory_type: Option<Option<MemoryType>>,
    pub tags: Option<Vec<String>>,
    pub categories: Option<Vec<String>>,
}

/// Ordering for `list`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListOrder {
    #[default]
    CreatedDesc,
    UpdatedDesc,
    SalienceDesc,
}

/// Filters for `list`
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub project_id: Option<String>,
    pub sector: Option<Sector>,
    pub tier: Option<Tier>,
    pub memory_type: Option<MemoryType>,
    pub min_salience: Option<f64>,
    pub include_deleted: bool,
    pub order: ListOrder,
    pub limit: Option<usize>,
}

// ============================================================================
// STATS
// ============================================================================

/// Per-project memory statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    pub total: i64,
    pub deleted: i64,
    pub embedded: i64,
    pub average_salience: f64,
    pub by_sector: Vec<(String, i64)>,
    pub by_tier: Vec<(String, i64)>,
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn sector_roundtrip() {
        for sector in [
            Sector::Episodic,
            Sector::Semantic,
            Sector::Procedural,
            Sector::Emotional,
            Sector::Reflective,
        ] {
            assert_eq!(Sector::from_str(sector.as_str()).unwrap(), sector);
        }
    }

    #[test]
    fn decay_constants_order_by_volatility() {
        assert!(Sector::Emotional.decay_constant() < Sector::Semantic.decay_constant());
        assert!(Sector::Semantic.decay_constant() < Sector::Reflective.decay_constant());
        assert!(Sector::Reflective.decay_constant() < Sector::Procedural.decay_constant());
        assert!(Sector::Procedural.decay_constant() < Sector::Episodic.decay_constant());
    }

    #[test]
    fn memory_type_roundtrip() {
        for mt in [
            MemoryType::Preference,
            MemoryType::Codebase,
            MemoryType::Decision,
            MemoryType::Gotcha,
            MemoryType::Pattern,
            MemoryType::TurnSummary,
            MemoryType::TaskCompletion,
        ] {
            assert_eq!(MemoryType::from_str(mt.as_str()).unwrap(), mt);
        }
    }

    #[test]
    fn unknown_names_are_rejected() {
        assert!(Sector::from_str("prophetic").is_err());
        assert!(Tier::from_str("galaxy").is_err());
        assert!(MemoryType::from_str("vibe").is_err());
    }
}
