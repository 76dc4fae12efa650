/// Logical document fields to physical SQLite columns
///
/// Each collection has a fixed bidirectional map. Embedded arrays
/// (`appUsage.timestamps`, `focusSessions.interruptions`) are not columns at
/// all: they map to child tables keyed by the parent's id.
use std::collections::HashSet;

use crate::storage::{Collection, StorageError};

/// An embedded array stored as rows of a child table
#[derive(Debug)]
pub struct ChildTable {
    /// Document field holding the array
    pub array_field: &'static str,
    pub table: &'static str,
    /// Column referencing the parent row id
    pub foreign_key: &'static str,
    /// Element field to child column
    pub fields: &'static [(&'static str, &'static str)],
}

impl ChildTable {
    pub fn column(&self, field: &str) -> Option<&'static str> {
        self.fields
            .iter()
            .find(|(logical, _)| *logical == field)
            .map(|(_, physical)| *physical)
    }
}

/// Field map for one collection
#[derive(Debug)]
pub struct FieldMap {
    pub collection: Collection,
    pub table: &'static str,
    /// Logical field to column, including `_id`, `createdAt` and `updatedAt`
    pub fields: &'static [(&'static str, &'static str)],
    pub children: &'static [ChildTable],
}

const APP_USAGE: FieldMap = FieldMap {
    collection: Collection::AppUsage,
    table: "app_usage",
    fields: &[
        ("_id", "id"),
        ("date", "date"),
        ("hour", "hour"),
        ("appName", "app_name"),
        ("timeSpent", "time_spent"),
        ("category", "category"),
        ("description", "description"),
        ("domain", "domain"),
        ("createdAt", "created_at"),
        ("updatedAt", "updated_at"),
    ],
    children: &[ChildTable {
        array_field: "timestamps",
        table: "timestamps",
        foreign_key: "app_usage_id",
        fields: &[("start", "start_time"), ("duration", "duration")],
    }],
};

const CATEGORIES: FieldMap = FieldMap {
    collection: Collection::Categories,
    table: "categories",
    fields: &[
        ("_id", "id"),
        ("name", "name"),
        ("type", "type"),
        ("createdAt", "created_at"),
        ("updatedAt", "updated_at"),
    ],
    children: &[],
};

const CUSTOM_CATEGORY_MAPPINGS: FieldMap = FieldMap {
    collection: Collection::CustomCategoryMappings,
    table: "custom_category_mappings",
    fields: &[
        ("_id", "id"),
        ("appIdentifier", "app_identifier"),
        ("customCategory", "custom_category"),
        ("createdAt", "created_at"),
        ("updatedAt", "updated_at"),
    ],
    children: &[],
};

const FOCUS_SESSIONS: FieldMap = FieldMap {
    collection: Collection::FocusSessions,
    table: "focus_sessions",
    fields: &[
        ("_id", "id"),
        ("type", "type"),
        ("startTime", "start_time"),
        ("plannedDuration", "planned_duration"),
        ("status", "status"),
        ("date", "date"),
        ("actualDuration", "actual_duration"),
        ("endTime", "end_time"),
        ("notes", "notes"),
        ("productivity", "productivity"),
        ("pausedAt", "paused_at"),
        ("pausedDuration", "paused_duration"),
        ("createdAt", "created_at"),
        ("updatedAt", "updated_at"),
    ],
    children: &[ChildTable {
        array_field: "interruptions",
        table: "focus_session_interruptions",
        foreign_key: "focus_session_id",
        fields: &[
            ("timestamp", "timestamp"),
            ("reason", "reason"),
            ("appName", "app_name"),
        ],
    }],
};

static MAPS: [FieldMap; 4] = [APP_USAGE, CATEGORIES, CUSTOM_CATEGORY_MAPPINGS, FOCUS_SESSIONS];

impl FieldMap {
    /// The map for a collection
    pub fn for_collection(collection: Collection) -> &'static FieldMap {
        match collection {
            Collection::AppUsage => &MAPS[0],
            Collection::Categories => &MAPS[1],
            Collection::CustomCategoryMappings => &MAPS[2],
            Collection::FocusSessions => &MAPS[3],
        }
    }

    /// Column for a logical field
    pub fn column(&self, field: &str) -> Option<&'static str> {
        self.fields
            .iter()
            .find(|(logical, _)| *logical == field)
            .map(|(_, physical)| *physical)
    }

    /// Logical field for a column
    pub fn field(&self, column: &str) -> Option<&'static str> {
        self.fields
            .iter()
            .find(|(_, physical)| *physical == column)
            .map(|(logical, _)| *logical)
    }

    /// Child table behind an embedded array field
    pub fn child(&self, field: &str) -> Option<&'static ChildTable> {
        self.children.iter().find(|c| c.array_field == field)
    }

    /// Columns in declaration order
    pub fn columns(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.fields.iter().map(|(_, physical)| *physical)
    }

    /// Check that the map is a bijection and that array fields do not shadow
    /// columns
    pub fn validate(&self) -> Result<(), StorageError> {
        check_bijection(self.table, self.fields)?;

        if self.column("_id") != Some("id") {
            return Err(StorageError::Schema(format!(
                "{}: _id must map to the id column",
                self.table
            )));
        }

        for child in self.children {
            if self.column(child.array_field).is_some() {
                return Err(StorageError::Schema(format!(
                    "{}: array field {} is also mapped to a column",
                    self.table, child.array_field
                )));
            }
            check_bijection(child.table, child.fields)?;
            if child.fields.iter().any(|(_, column)| *column == child.foreign_key) {
                return Err(StorageError::Schema(format!(
                    "{}: foreign key {} is also an element column",
                    child.table, child.foreign_key
                )));
            }
        }
        Ok(())
    }
}

fn check_bijection(table: &str, fields: &[(&str, &str)]) -> Result<(), StorageError> {
    let mut logical = HashSet::new();
    let mut physical = HashSet::new();
    for (field, column) in fields {
        if !logical.insert(*field) {
            return Err(StorageError::Schema(format!(
                "{}: field {} mapped more than once",
                table, field
            )));
        }
        if !physical.insert(*column) {
            return Err(StorageError::Schema(format!(
                "{}: column {} mapped more than once",
                table, column
            )));
        }
    }
    Ok(())
}

/// Validate every collection's map
pub fn validate_all() -> Result<(), StorageError> {
    for collection in Collection::ALL {
        FieldMap::for_collection(collection).validate()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_maps_are_valid() {
        validate_all().unwrap();
    }

    #[test]
    fn test_bidirectional_lookup() {
        let map = FieldMap::for_collection(Collection::AppUsage);
        assert_eq!(map.column("appName"), Some("app_name"));
        assert_eq!(map.field("time_spent"), Some("timeSpent"));
        assert_eq!(map.column("_id"), Some("id"));
        assert_eq!(map.column("timestamps"), None);
        assert_eq!(map.child("timestamps").unwrap().table, "timestamps");
    }

    #[test]
    fn test_duplicate_columns_are_rejected() {
        let broken = FieldMap {
            collection: Collection::Categories,
            table: "categories",
            fields: &[("_id", "id"), ("name", "name"), ("label", "name")],
            children: &[],
        };
        assert!(matches!(broken.validate(), Err(StorageError::Schema(_))));
    }

    #[test]
    fn test_session_map_covers_pause_bookkeeping() {
        let map = FieldMap::for_collection(Collection::FocusSessions);
        assert_eq!(map.column("pausedAt"), Some("paused_at"));
        assert_eq!(map.column("pausedDuration"), Some("paused_duration"));
        assert_eq!(
            map.child("interruptions").unwrap().column("appName"),
            Some("app_name")
        );
    }
}
