use super::*;
use chrono::TimeZone;

#[test]
fn test_timestamp_round_trip() {
    let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
    let stored = format_timestamp(ts);
    assert_eq!(stored, "2024-03-01T12:30:00.000000Z");
    assert_eq!(parse_timestamp(&stored).unwrap(), ts);
}

#[test]
fn test_stored_timestamps_sort_chronologically() {
    let earlier = format_timestamp(Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap());
    let later = format_timestamp(Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap());
    assert!(earlier < later);
}

#[test]
fn test_parse_invalid_timestamp() {
    let result = parse_timestamp("yesterday");
    assert!(matches!(result, Err(StorageError::InvalidTimestamp(ref v)) if v == "yesterday"));
}

#[test]
fn test_parse_optional_timestamp() {
    assert!(parse_optional_timestamp(None).unwrap().is_none());
    let parsed = parse_optional_timestamp(Some("2024-03-01T00:00:00Z".to_string())).unwrap();
    assert!(parsed.is_some());
}

#[test]
fn test_sql_int_conversions_clamp() {
    assert_eq!(to_sql_int(42), 42);
    assert_eq!(to_sql_int(u64::MAX), i64::MAX);
    assert_eq!(from_sql_int(7), 7);
    assert_eq!(from_sql_int(-3), 0);
}
