/// Productivity categories and per-app category overrides
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::types::instant;
use crate::domain::DomainError;

/// How a category counts towards productivity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CategoryType {
    Productive,
    Distracted,
    Neutral,
}

impl CategoryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CategoryType::Productive => "productive",
            CategoryType::Distracted => "distracted",
            CategoryType::Neutral => "neutral",
        }
    }
}

impl fmt::Display for CategoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CategoryType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "productive" => Ok(CategoryType::Productive),
            "distracted" => Ok(CategoryType::Distracted),
            "neutral" => Ok(CategoryType::Neutral),
            _ => Err(DomainError::InvalidCategoryType(s.to_string())),
        }
    }
}

/// A named productivity category
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(rename = "type")]
    pub category_type: CategoryType,
}

impl Category {
    /// Create a category with a normalized name
    pub fn new(name: &str, category_type: CategoryType) -> Result<Self, DomainError> {
        Ok(Self {
            id: None,
            name: normalize_category_name(name)?,
            category_type,
        })
    }
}

/// Normalize a category name: trimmed, non-empty, first letter capitalized
pub fn normalize_category_name(name: &str) -> Result<String, DomainError> {
    let trimmed = name.trim();
    let mut chars = trimmed.chars();
    match chars.next() {
        None => Err(DomainError::validation("Category name cannot be empty")),
        Some(first) => Ok(first.to_uppercase().chain(chars).collect()),
    }
}

/// Categories shipped with a fresh install
pub const DEFAULT_CATEGORIES: [(&str, CategoryType); 6] = [
    ("Code", CategoryType::Productive),
    ("Browsing", CategoryType::Neutral),
    ("Communication", CategoryType::Neutral),
    ("Utilities", CategoryType::Neutral),
    ("Miscellaneous", CategoryType::Neutral),
    ("Entertainment", CategoryType::Distracted),
];

/// User override assigning an app to a category
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomCategoryMapping {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub app_identifier: String,
    pub custom_category: String,
}

impl CustomCategoryMapping {
    pub fn new(app_identifier: &str, custom_category: &str) -> Result<Self, DomainError> {
        let app_identifier = app_identifier.trim();
        if app_identifier.is_empty() {
            return Err(DomainError::validation("App identifier cannot be empty"));
        }
        Ok(Self {
            id: None,
            app_identifier: app_identifier.to_string(),
            custom_category: custom_category.to_string(),
        })
    }
}

/// Category names grouped the way the settings screen edits them
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategorySettings {
    #[serde(default)]
    pub productive: Vec<String>,
    #[serde(default)]
    pub distracted: Vec<String>,
}

/// Categories of one type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryTypeStat {
    #[serde(rename = "_id")]
    pub category_type: CategoryType,
    pub count: u64,
    pub categories: Vec<String>,
}

/// Summary of stored categories and overrides
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryStats {
    pub category_stats: Vec<CategoryTypeStat>,
    pub custom_mappings_count: u64,
}

/// A category together with how much usage it has attracted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryWithCounts {
    pub name: String,
    #[serde(rename = "type")]
    pub category_type: CategoryType,
    pub usage_count: u64,
    pub total_time: i64,
}

/// Portable dump of categories and overrides
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryExport {
    pub categories: Vec<Category>,
    #[serde(default)]
    pub custom_mappings: Vec<CustomCategoryMapping>,
    #[serde(with = "instant")]
    pub export_date: DateTime<Utc>,
    pub version: String,
}

/// Result of replacing categories from an export
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryImportSummary {
    pub categories_imported: u64,
    pub mappings_imported: u64,
}

/// App identifier to category, the shape overrides travel in
pub type CustomMappings = BTreeMap<String, String>;
