//! Category registry: the immutable map from event category to storage
//! layout and payload projection.
//!
//! The recorder and the aggregator resolve every table and column name
//! through a [`CategoryDescriptor`]; no other module matches on category
//! strings. Identifiers are validated once at construction because they are
//! spliced into SQL text.

use std::collections::HashSet;
use std::fmt;

use crate::bucket::Tier;
use crate::error::{Result, TallyError};
use crate::projection::{self, ProjectFn};

/// Storage layout and projection for one event category.
#[derive(Clone, Copy)]
pub struct CategoryDescriptor {
    /// Category name as sent in the intake `endpoint` field.
    pub category: &'static str,
    /// Base (raw tier) table name; rollup tiers append `_hourly`/`_daily`.
    pub table: &'static str,
    pub actor_column: &'static str,
    pub subject_column: &'static str,
    pub projection: ProjectFn,
}

impl CategoryDescriptor {
    /// Table holding rows of the given tier.
    #[must_use]
    pub fn table_for(&self, tier: Tier) -> String {
        format!("{}{}", self.table, tier.table_suffix())
    }

    fn validate(&self) -> Result<()> {
        if self.category.trim().is_empty() {
            return Err(TallyError::Configuration(
                "category name must not be empty".to_string(),
            ));
        }
        for (what, ident) in [
            ("table", self.table),
            ("actor column", self.actor_column),
            ("subject column", self.subject_column),
        ] {
            if !is_identifier(ident) {
                return Err(TallyError::Configuration(format!(
                    "{}: {what} '{ident}' is not a valid identifier",
                    self.category
                )));
            }
        }
        if self.actor_column == self.subject_column {
            return Err(TallyError::Configuration(format!(
                "{}: actor and subject columns must differ",
                self.category
            )));
        }
        if RESERVED_COLUMNS.contains(&self.actor_column)
            || RESERVED_COLUMNS.contains(&self.subject_column)
        {
            return Err(TallyError::Configuration(format!(
                "{}: identity columns may not reuse {RESERVED_COLUMNS:?}",
                self.category
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for CategoryDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CategoryDescriptor")
            .field("category", &self.category)
            .field("table", &self.table)
            .field("actor_column", &self.actor_column)
            .field("subject_column", &self.subject_column)
            .finish_non_exhaustive()
    }
}

/// Columns shared by every tier table.
const RESERVED_COLUMNS: [&str; 5] = ["id", "action", "attributes", "created_at", "count"];

/// Lowercase ASCII identifier: `[a-z_][a-z0-9_]*`.
fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Categories emitted by the identity platform.
pub const BUILTIN_CATEGORIES: [CategoryDescriptor; 3] = [
    CategoryDescriptor {
        category: "profile:source",
        table: "source_metrics",
        actor_column: "credential_id",
        subject_column: "source_id",
        projection: projection::project_source,
    },
    CategoryDescriptor {
        category: "profile:gate",
        table: "gate_metrics",
        actor_column: "credential_id",
        subject_column: "gate_id",
        projection: projection::project_gate,
    },
    CategoryDescriptor {
        category: "profile:flag",
        table: "flag_metrics",
        actor_column: "credential_id",
        subject_column: "flag_id",
        projection: projection::project_flag,
    },
];

/// Immutable, validated set of category descriptors in registration order.
#[derive(Debug, Clone)]
pub struct Registry {
    descriptors: Vec<CategoryDescriptor>,
}

impl Registry {
    /// Build a registry, rejecting invalid or colliding descriptors.
    ///
    /// # Errors
    ///
    /// Returns [`TallyError::Configuration`] if a descriptor has an invalid
    /// identifier, or if two descriptors share a category name or table.
    pub fn new(descriptors: impl IntoIterator<Item = CategoryDescriptor>) -> Result<Self> {
        let descriptors: Vec<_> = descriptors.into_iter().collect();
        let mut categories = HashSet::new();
        let mut tables = HashSet::new();

        for descriptor in &descriptors {
            descriptor.validate()?;
            if !categories.insert(descriptor.category) {
                return Err(TallyError::Configuration(format!(
                    "category '{}' registered twice",
                    descriptor.category
                )));
            }
            for tier in Tier::ALL {
                if !tables.insert(descriptor.table_for(tier)) {
                    return Err(TallyError::Configuration(format!(
                        "table '{}' is claimed by more than one category",
                        descriptor.table_for(tier)
                    )));
                }
            }
        }

        Ok(Self { descriptors })
    }

    /// Registry of the built-in identity platform categories.
    ///
    /// # Errors
    ///
    /// Only fails if the built-in table is itself misconfigured.
    pub fn builtin() -> Result<Self> {
        Self::new(BUILTIN_CATEGORIES)
    }

    /// Resolve a category name.
    ///
    /// # Errors
    ///
    /// Returns [`TallyError::UnknownCategory`] if the name is not registered.
    pub fn lookup(&self, category: &str) -> Result<&CategoryDescriptor> {
        self.descriptors
            .iter()
            .find(|d| d.category == category)
            .ok_or_else(|| TallyError::UnknownCategory(category.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &CategoryDescriptor> {
        self.descriptors.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}
