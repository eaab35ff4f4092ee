use super::*;
use serde_json::json;

#[test]
fn test_priority_parse_lenient() {
    assert_eq!(TaskPriority::parse_lenient("HIGH"), TaskPriority::High);
    assert_eq!(TaskPriority::parse_lenient(" urgent "), TaskPriority::Urgent);
    assert_eq!(TaskPriority::parse_lenient("low"), TaskPriority::Low);
    assert_eq!(TaskPriority::parse_lenient("whatever"), TaskPriority::Medium);
    assert_eq!(TaskPriority::parse_lenient(""), TaskPriority::Medium);

    assert!(TaskPriority::from_str("whatever").is_err());
}

#[test]
fn test_priority_ordering() {
    assert!(TaskPriority::Urgent > TaskPriority::High);
    assert!(TaskPriority::High > TaskPriority::Medium);
    assert!(TaskPriority::Medium > TaskPriority::Low);
}

#[test]
fn test_status_terminal() {
    assert!(!TaskStatus::Pending.is_terminal());
    assert!(!TaskStatus::Running.is_terminal());
    assert!(!TaskStatus::Retrying.is_terminal());
    assert!(TaskStatus::Completed.is_terminal());
    assert!(TaskStatus::Failed.is_terminal());
    assert!(TaskStatus::Cancelled.is_terminal());

    assert_eq!(TaskStatus::from_str("Retrying").unwrap(), TaskStatus::Retrying);
    assert!(TaskStatus::from_str("done").is_err());
}

#[test]
fn test_record_defaults() {
    let record = TaskRecord::new(
        "ungm",
        Value::Null,
        TaskPriority::High,
        3,
        JsonMap::new(),
    );

    assert_eq!(record.name, "scrape:ungm");
    assert_eq!(record.status, TaskStatus::Pending);
    assert_eq!(record.config, json!({}));
    assert_eq!(record.metadata.get("source"), Some(&json!("ungm")));
    assert_eq!(record.retry_count, 0);
}

#[test]
fn test_validate_config() {
    assert!(validate_config(&json!({"max_pages": 10})).is_ok());
    assert!(validate_config(&Value::Null).is_ok());
    let err = validate_config(&json!([1, 2])).unwrap_err();
    assert!(err.contains("an array"));
}

#[test]
fn test_status_payload_serialization_shape() {
    let record = TaskRecord::new("ungm", json!({}), TaskPriority::Low, 3, JsonMap::new());
    let payload = TaskStatusPayload::from_parts(&record, None);
    let value = serde_json::to_value(&payload).unwrap();

    assert_eq!(value["status"], "pending");
    assert_eq!(value["priority"], "low");
    assert!(value.get("result").is_none());
    assert!(value["last_attempt"].is_null());
}

#[test]
fn test_session_from_result_payload() {
    let mut record = TaskRecord::new("tunipages", json!({}), TaskPriority::Medium, 3, JsonMap::new());
    record.status = TaskStatus::Completed;
    let now = Utc::now();
    let result = TaskResult::completed(
        &record.task_id,
        now,
        now,
        json!({
            "tenders_found": 12,
            "tenders_processed": 10,
            "pages_processed": 3,
            "output_file": "out.csv"
        }),
        JsonMap::new(),
    );

    let session = AutomationSession::from_parts(&record, Some(&result));
    assert_eq!(session.tenders_found, Some(12));
    assert_eq!(session.tenders_processed, Some(10));
    assert_eq!(session.output_file.as_deref(), Some("out.csv"));
    assert_eq!(session.performance_metrics["pages_processed"], 3);
    assert!(session.error_message.is_none());
}

#[test]
fn test_filter_matches_exactly() {
    let record = TaskRecord::new("ungm", json!({}), TaskPriority::Medium, 3, JsonMap::new());

    assert!(SessionFilter::default().matches(&record));
    assert!(SessionFilter {
        source: Some("UNGM".to_string()),
        status: Some(TaskStatus::Pending),
    }
    .matches(&record));
    assert!(!SessionFilter {
        source: Some("ung".to_string()),
        status: None,
    }
    .matches(&record));
    assert!(!SessionFilter {
        source: None,
        status: Some(TaskStatus::Running),
    }
    .matches(&record));
}
