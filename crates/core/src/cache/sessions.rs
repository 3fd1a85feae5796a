//! Session state stored in the legacy `sessions` table.

use chrono::{DateTime, Utc};
use tokio_rusqlite::params;
use tokio_rusqlite::rusqlite::OptionalExtension;

use super::connection::CacheDb;
use crate::Error;
use crate::model::SessionState;

impl CacheDb {
    /// Get session state by id.
    ///
    /// Returns None if the session doesn't exist or its idle expiry passed.
    pub async fn load_session(&self, session_id: &str) -> Result<Option<SessionState>, Error> {
        let id = session_id.to_string();
        let now = Utc::now().timestamp();
        let row = self
            .conn
            .call(move |conn| -> Result<Option<(String, String, String, i64)>, Error> {
                conn.query_row(
                    "SELECT session_id, state, updated_at, expires_at FROM sessions
                     WHERE session_id = ?1 AND expires_at > ?2",
                    params![id, now],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
                .optional()
                .map_err(Error::from)
            })
            .await
            .map_err(Error::from)?;

        let Some((session_id, state, updated_at, expires_at)) = row else {
            return Ok(None);
        };

        let state = serde_json::from_str(&state).map_err(|e| Error::corrupt(&session_id, format!("state: {e}")))?;
        let updated_at = DateTime::parse_from_rfc3339(&updated_at)
            .map_err(|e| Error::corrupt(&session_id, format!("updated_at: {e}")))?
            .with_timezone(&Utc);
        let expires_at =
            DateTime::from_timestamp(expires_at, 0).ok_or_else(|| Error::corrupt(&session_id, "expires_at out of range"))?;

        Ok(Some(SessionState { session_id, state, updated_at, expires_at }))
    }

    /// Insert or replace session state.
    pub async fn store_session(&self, session: &SessionState) -> Result<(), Error> {
        if session.session_id.trim().is_empty() {
            return Err(Error::Validation("session id must not be empty".into()));
        }
        let state = serde_json::to_string(&session.state)
            .map_err(|e| Error::Validation(format!("{}: {e}", session.session_id)))?;
        let id = session.session_id.clone();
        let updated_at = session.updated_at.to_rfc3339();
        let expires_at = session.expires_at.timestamp();

        self.conn
            .call(move |conn| -> Result<(), Error> {
                conn.execute(
                    "INSERT INTO sessions (session_id, state, updated_at, expires_at) VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(session_id) DO UPDATE SET
                        state = excluded.state,
                        updated_at = excluded.updated_at,
                        expires_at = excluded.expires_at",
                    params![id, state, updated_at, expires_at],
                )?;
                Ok(())
            })
            .await
            .map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    #[tokio::test]
    async fn test_session_round_trip() {
        let db = CacheDb::open_in_memory().await.unwrap();
        let session = SessionState::new("s1", json!({"cookies": [{"name": "sid"}]}), Duration::hours(1));

        db.store_session(&session).await.unwrap();
        let found = db.load_session("s1").await.unwrap().unwrap();

        assert_eq!(found.state, session.state);
        assert_eq!(found.expires_at, session.expires_at);
    }

    #[tokio::test]
    async fn test_expired_session_absent() {
        let db = CacheDb::open_in_memory().await.unwrap();
        let mut session = SessionState::new("s1", json!({}), Duration::hours(1));
        session.expires_at = Utc::now() - Duration::seconds(5);

        db.store_session(&session).await.unwrap();
        assert!(db.load_session("s1").await.unwrap().is_none());
        assert!(db.load_session("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_empty_session_id_rejected() {
        let db = CacheDb::open_in_memory().await.unwrap();
        let session = SessionState::new(" ", json!({}), Duration::hours(1));
        assert!(matches!(db.store_session(&session).await, Err(Error::Validation(_))));
    }
}
