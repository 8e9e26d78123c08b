use dialdesk::error::Error;
use uuid::Uuid;

#[test]
fn errors_map_to_stable_codes_and_statuses() {
    let id = Uuid::new_v4();
    let cases: Vec<(Error, &str, u16)> = vec![
        (
            Error::InvalidTransition {
                entity: "task",
                from: "COMPLETED".into(),
                to: "PENDING".into(),
                allowed: vec![],
            },
            "invalid_state_transition",
            409,
        ),
        (
            Error::DuplicateWebhookEvent {
                event_id: "evt_1".into(),
            },
            "duplicate_webhook_event",
            409,
        ),
        (Error::CallerNotFound(id), "caller_not_found", 404),
        (
            Error::TaskNotFoundForCaller {
                caller_id: id,
                task_id: id,
            },
            "call_task_not_found",
            404,
        ),
        (Error::TaskNotFound(id), "task_not_found", 404),
        (
            Error::InvalidRequeueState {
                task_id: id,
                status: "COMPLETED".into(),
            },
            "invalid_requeue_state",
            400,
        ),
        (
            Error::SerializationRetryExhausted { attempts: 3 },
            "serializable_transaction_retry_exhausted",
            503,
        ),
        (
            Error::ProviderRequestFailed {
                provider: "dialer".into(),
                reason: "timeout".into(),
            },
            "provider_request_failed",
            502,
        ),
        (Error::Config("DATABASE_URL missing".into()), "config_error", 500),
        (Error::Other("boom".into()), "internal_error", 500),
    ];

    for (err, code, status) in cases {
        assert_eq!(err.code(), code, "{err}");
        assert_eq!(err.status(), status, "{err}");
    }
}

#[test]
fn only_duplicates_are_acknowledged() {
    assert!(
        Error::DuplicateWebhookEvent {
            event_id: "evt_1".into()
        }
        .is_duplicate()
    );
    assert!(!Error::Other("x".into()).is_duplicate());
}

#[test]
fn non_database_errors_are_not_transaction_conflicts() {
    assert!(!Error::Other("40001".into()).is_transaction_conflict());
    assert!(!Error::SerializationRetryExhausted { attempts: 3 }.is_transaction_conflict());
    assert!(!Error::Database(sqlx::Error::RowNotFound).is_transaction_conflict());
}
