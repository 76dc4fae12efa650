/// Domain services over the PostgreSQL backend
///
/// These mirror the local services operation for operation but talk SQL:
/// aggregations are `GROUP BY` queries, upserts use `ON CONFLICT` and every
/// multi-statement write runs in a transaction.
pub mod app_usage;
pub mod categories;
pub mod focus_session;

pub use app_usage::RemoteAppUsageService;
pub use categories::RemoteCategoriesService;
pub use focus_session::RemoteFocusSessionService;

use crate::domain::DomainError;
use crate::storage::StorageError;

/// Hour as stored in a `SMALLINT` column
pub(crate) fn hour_param(hour: Option<u8>) -> Option<i16> {
    hour.map(i16::from)
}

/// Hour read back from a `SMALLINT` column
pub(crate) fn hour_from_column(hour: Option<i16>) -> Result<Option<u8>, StorageError> {
    match hour {
        None => Ok(None),
        Some(h) => u8::try_from(h)
            .ok()
            .filter(|h| *h <= 23)
            .map(Some)
            .ok_or_else(|| DomainError::InvalidHour(i64::from(h)).into()),
    }
}

/// Millisecond durations are unsigned in the domain and `BIGINT` in SQL
pub(crate) fn millis(duration: u64) -> i64 {
    i64::try_from(duration).unwrap_or(i64::MAX)
}

/// Parse a row id handed in as text
pub(crate) fn parse_id(entity: &'static str, id: &str) -> Result<i64, StorageError> {
    id.trim().parse().map_err(|_| StorageError::NotFound {
        entity,
        id: id.to_string(),
    })
}

/// `LIKE` pattern matching `term` anywhere, with wildcards in `term` escaped
pub(crate) fn contains_pattern(term: &str) -> String {
    let mut pattern = String::with_capacity(term.len() + 2);
    pattern.push('%');
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hour_conversion() {
        assert_eq!(hour_param(Some(7)), Some(7));
        assert_eq!(hour_param(None), None);
        assert_eq!(hour_from_column(Some(23)).unwrap(), Some(23));
        assert_eq!(hour_from_column(None).unwrap(), None);
        assert!(hour_from_column(Some(24)).is_err());
        assert!(hour_from_column(Some(-1)).is_err());
    }

    #[test]
    fn test_ids_must_be_numeric() {
        assert_eq!(parse_id("Focus session", " 42 ").unwrap(), 42);
        assert!(matches!(
            parse_id("Focus session", "abc"),
            Err(StorageError::NotFound { entity: "Focus session", .. })
        ));
    }

    #[test]
    fn test_contains_pattern_escapes_wildcards() {
        assert_eq!(contains_pattern("code"), "%code%");
        assert_eq!(contains_pattern("100%_x"), "%100\\%\\_x%");
        assert_eq!(millis(u64::MAX), i64::MAX);
    }
}
