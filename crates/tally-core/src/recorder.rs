//! Event recorder: validates one inbound event and inserts it as a raw row.
//!
//! # Duplicates
//!
//! Intake is at-least-once and events carry no idempotency key, so a
//! redelivered event is stored again and inflates its bucket's count by one.
//! The recorder never reads before writing.

use rusqlite::{Connection, params};
use serde::Deserialize;
use serde_json::Value;

use crate::bucket::Tier;
use crate::error::{Result, TallyError};
use crate::projection::{Attributes, Projection};
use crate::registry::{CategoryDescriptor, Registry};

/// Primary key of a stored raw row.
pub type RowId = i64;

/// A fully projected event ready for insertion.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricEvent {
    pub category: String,
    pub actor_id: i64,
    pub subject_id: i64,
    pub action: String,
    /// Event timestamp in epoch seconds, as reported by the emitter.
    pub occurred_at: i64,
    pub attributes: Attributes,
}

impl MetricEvent {
    fn from_projection(category: &str, projection: Projection) -> Self {
        Self {
            category: category.to_string(),
            actor_id: projection.actor_id,
            subject_id: projection.subject_id,
            action: projection.action,
            occurred_at: projection.occurred_at,
            attributes: projection.attributes,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.actor_id <= 0 {
            return Err(TallyError::MalformedPayload(format!(
                "actor id must be positive, got {}",
                self.actor_id
            )));
        }
        if self.subject_id <= 0 {
            return Err(TallyError::MalformedPayload(format!(
                "subject id must be positive, got {}",
                self.subject_id
            )));
        }
        if self.action.trim().is_empty() {
            return Err(TallyError::MalformedPayload(
                "action must not be empty".to_string(),
            ));
        }
        if self.occurred_at < 0 {
            return Err(TallyError::MalformedPayload(format!(
                "created timestamp must not be negative, got {}",
                self.occurred_at
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct IntakeEndpoint {
    endpoint: String,
}

/// Inserts raw rows for registered categories.
pub struct Recorder<'a> {
    conn: &'a Connection,
    registry: &'a Registry,
}

impl<'a> Recorder<'a> {
    #[must_use]
    pub const fn new(conn: &'a Connection, registry: &'a Registry) -> Self {
        Self { conn, registry }
    }

    /// Record one event with no extra attributes.
    ///
    /// # Errors
    ///
    /// [`TallyError::UnknownCategory`] if `category` is not registered,
    /// [`TallyError::MalformedPayload`] for non-positive ids, an empty action,
    /// or a negative timestamp, and a storage error if the insert fails.
    pub fn record(
        &self,
        category: &str,
        actor_id: i64,
        subject_id: i64,
        action: &str,
        occurred_at: i64,
    ) -> Result<RowId> {
        self.record_event(&MetricEvent {
            category: category.to_string(),
            actor_id,
            subject_id,
            action: action.to_string(),
            occurred_at,
            attributes: Attributes::new(),
        })
    }

    /// Record a projected event, including its attributes.
    ///
    /// # Errors
    ///
    /// Same as [`Recorder::record`].
    pub fn record_event(&self, event: &MetricEvent) -> Result<RowId> {
        let descriptor = self.registry.lookup(&event.category)?;
        event.validate()?;
        self.insert(descriptor, event)
    }

    /// Record an intake payload: `{"endpoint": <category>, ...}`.
    ///
    /// The endpoint selects the category whose projection then flattens the
    /// rest of the payload.
    ///
    /// # Errors
    ///
    /// [`TallyError::MalformedPayload`] for invalid JSON or a payload that
    /// does not match the category's shape, [`TallyError::UnknownCategory`]
    /// for an unregistered endpoint, and storage errors from the insert.
    pub fn record_payload(&self, raw: &str) -> Result<RowId> {
        let payload: Value = serde_json::from_str(raw)?;
        let IntakeEndpoint { endpoint } = IntakeEndpoint::deserialize(&payload)?;
        let descriptor = self.registry.lookup(&endpoint)?;

        let projection = (descriptor.projection)(&payload)?;
        let event = MetricEvent::from_projection(descriptor.category, projection);
        event.validate()?;
        self.insert(descriptor, &event)
    }

    fn insert(&self, descriptor: &CategoryDescriptor, event: &MetricEvent) -> Result<RowId> {
        let attributes = serde_json::to_string(&event.attributes)?;
        let sql = format!(
            "INSERT INTO {table} ({actor}, {subject}, action, attributes, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            table = descriptor.table_for(Tier::Raw),
            actor = descriptor.actor_column,
            subject = descriptor.subject_column,
        );

        self.conn.prepare_cached(&sql)?.execute(params![
            event.actor_id,
            event.subject_id,
            event.action,
            attributes,
            event.occurred_at,
        ])?;
        let id = self.conn.last_insert_rowid();

        tracing::debug!(
            category = descriptor.category,
            row_id = id,
            actor_id = event.actor_id,
            action = %event.action,
            "recorded metric"
        );
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::error::ErrorCode;
    use serde_json::json;

    fn setup() -> (Connection, Registry) {
        let registry = Registry::builtin().expect("registry");
        let mut conn = Connection::open_in_memory().expect("in-memory db");
        db::prepare(&mut conn, &registry).expect("schema");
        (conn, registry)
    }

    fn raw_count(conn: &Connection, table: &str) -> i64 {
        conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
            .expect("count rows")
    }

    #[test]
    fn record_inserts_one_row_with_event_timestamp() {
        let (conn, registry) = setup();
        let recorder = Recorder::new(&conn, &registry);

        let id = recorder
            .record("profile:source", 1, 10, "created", 1_234)
            .expect("record");

        let (actor, subject, action, created_at): (i64, i64, String, i64) = conn
            .query_row(
                "SELECT credential_id, source_id, action, created_at
                 FROM source_metrics WHERE id = ?1",
                [id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .expect("row exists");
        assert_eq!((actor, subject, action.as_str(), created_at), (1, 10, "created", 1_234));
    }

    #[test]
    fn unknown_category_is_rejected_without_insert() {
        let (conn, registry) = setup();
        let recorder = Recorder::new(&conn, &registry);

        let err = recorder
            .record("bogus", 1, 10, "created", 100)
            .expect_err("bogus category");
        assert_eq!(err.code(), ErrorCode::UnknownCategory);

        for table in ["source_metrics", "gate_metrics", "flag_metrics"] {
            assert_eq!(raw_count(&conn, table), 0);
        }
    }

    #[test]
    fn empty_action_and_bad_ids_are_malformed() {
        let (conn, registry) = setup();
        let recorder = Recorder::new(&conn, &registry);

        for (actor, subject, action, at) in [(1, 1, "  ", 5), (0, 1, "x", 5), (1, -2, "x", 5), (1, 1, "x", -1)] {
            let err = recorder
                .record("profile:gate", actor, subject, action, at)
                .expect_err("invalid event");
            assert_eq!(err.code(), ErrorCode::MalformedPayload);
        }
        assert_eq!(raw_count(&conn, "gate_metrics"), 0);
    }

    #[test]
    fn duplicate_submissions_produce_duplicate_rows() {
        let (conn, registry) = setup();
        let recorder = Recorder::new(&conn, &registry);

        let first = recorder.record("profile:flag", 2, 3, "created", 50).expect("first");
        let second = recorder.record("profile:flag", 2, 3, "created", 50).expect("second");
        assert!(second > first);
        assert_eq!(raw_count(&conn, "flag_metrics"), 2);
    }

    #[test]
    fn record_payload_projects_nested_fields() {
        let (conn, registry) = setup();
        let recorder = Recorder::new(&conn, &registry);

        let payload = json!({
            "endpoint": "profile:source",
            "credential": {"id": 9},
            "source": {"id": 4, "name": "linkedin", "tags": {"sso": true}},
            "action": "created",
            "created": 7_200
        });
        let id = recorder
            .record_payload(&payload.to_string())
            .expect("valid payload");

        let (created_at, attributes): (i64, String) = conn
            .query_row(
                "SELECT created_at, attributes FROM source_metrics WHERE id = ?1",
                [id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .expect("row exists");
        assert_eq!(created_at, 7_200);
        let attributes: Value = serde_json::from_str(&attributes).expect("json attributes");
        assert_eq!(attributes, json!({"provider": "linkedin", "sso": true}));
    }

    #[test]
    fn record_payload_rejects_garbage_and_unknown_endpoints() {
        let (conn, registry) = setup();
        let recorder = Recorder::new(&conn, &registry);

        let garbage = recorder.record_payload("{not json").expect_err("garbage");
        assert_eq!(garbage.code(), ErrorCode::MalformedPayload);

        let no_endpoint = recorder.record_payload(r#"{"action": "x"}"#).expect_err("no endpoint");
        assert_eq!(no_endpoint.code(), ErrorCode::MalformedPayload);

        let unknown = recorder
            .record_payload(r#"{"endpoint": "bogus", "action": "x"}"#)
            .expect_err("unknown endpoint");
        assert_eq!(unknown.code(), ErrorCode::UnknownCategory);
    }

    #[test]
    fn storage_errors_surface_when_tables_are_missing() {
        let registry = Registry::builtin().expect("registry");
        let conn = Connection::open_in_memory().expect("in-memory db");
        let recorder = Recorder::new(&conn, &registry);

        let err = recorder
            .record("profile:source", 1, 1, "created", 1)
            .expect_err("no tables");
        assert_eq!(err.code(), ErrorCode::StorageFailure);
    }
}
