/// Domain services over the storage backends
///
/// The services in this module work against any [`CollectionStore`], so the
/// same code serves the document store and the SQLite shim. Every public
/// operation runs through `execute_with_retry`. The [`remote`] module holds
/// the SQL implementations used with PostgreSQL.
///
/// [`CollectionStore`]: crate::storage::CollectionStore
pub mod app_usage;
pub mod categories;
pub mod focus_session;
pub mod remote;

pub use app_usage::AppUsageService;
pub use categories::CategoriesService;
pub use focus_session::FocusSessionService;

use chrono::NaiveDate;
use serde_json::Value;

use crate::domain::format_day;
use crate::storage::{Collection, Document, Filter, StorageError};

/// `_id` of a document handed back by a backend
pub(crate) fn stored_id(collection: Collection, document: &Document) -> Result<String, StorageError> {
    crate::storage::document_id(document).ok_or_else(|| {
        StorageError::Query(format!("{} document returned without an _id", collection))
    })
}

/// Restrict `filter` to `field` between the given days, both inclusive
pub(crate) fn within_days(
    filter: Filter,
    field: &str,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
) -> Filter {
    let filter = match start {
        Some(start) => filter.gte(field, format_day(&start)),
        None => filter,
    };
    match end {
        Some(end) => filter.lte(field, format_day(&end)),
        None => filter,
    }
}

/// Integer output of an aggregation; missing values read as 0
pub(crate) fn int_field(document: &Document, field: &str) -> i64 {
    match document.get(field) {
        Some(Value::Number(n)) => n.as_i64().unwrap_or_else(|| n.as_f64().unwrap_or(0.0) as i64),
        _ => 0,
    }
}

/// Text output of an aggregation; missing values read as empty
pub(crate) fn text_field(document: &Document, field: &str) -> String {
    match document.get(field) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_aggregation_field_readers() {
        let document = json!({ "category": "Code", "totalTime": 1500, "avg": 2.5 })
            .as_object()
            .cloned()
            .unwrap();
        assert_eq!(int_field(&document, "totalTime"), 1500);
        assert_eq!(int_field(&document, "avg"), 2);
        assert_eq!(int_field(&document, "missing"), 0);
        assert_eq!(text_field(&document, "category"), "Code");
        assert_eq!(text_field(&document, "missing"), "");
    }

    #[test]
    fn test_day_range_filter() {
        let start = NaiveDate::from_ymd_opt(2024, 7, 1).unwrap();
        let filter = within_days(Filter::new(), "date", Some(start), None);
        assert_eq!(filter.conditions().len(), 1);
        assert!(within_days(Filter::new(), "date", None, None).is_empty());
    }
}
