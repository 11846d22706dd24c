use chrono::{DateTime, Utc};
use redb::ReadableTable;

use super::db::{Database, DatabaseError};
use super::models::SessionRecord;
use super::tables::*;

impl Database {
    // ========================================================================
    // Session operations
    // ========================================================================

    pub fn put_session(&self, cookie: &str, session: &SessionRecord) -> Result<(), DatabaseError> {
        let write_txn = self.begin_write()?;
        {
            let mut table = write_txn.open_table(SESSIONS)?;
            let data = rmp_serde::to_vec_named(session)?;
            table.insert(cookie, data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn get_session(&self, cookie: &str) -> Result<Option<SessionRecord>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(SESSIONS)?;

        match table.get(cookie)? {
            Some(data) => Ok(Some(rmp_serde::from_slice(data.value())?)),
            None => Ok(None),
        }
    }

    pub fn delete_session(&self, cookie: &str) -> Result<bool, DatabaseError> {
        let write_txn = self.begin_write()?;
        let existed = {
            let mut table = write_txn.open_table(SESSIONS)?;
            let removed = table.remove(cookie)?.is_some();
            removed
        };
        write_txn.commit()?;
        Ok(existed)
    }

    /// Refresh the last-seen timestamp of an existing session.
    pub fn touch_session(&self, cookie: &str, now: DateTime<Utc>) -> Result<bool, DatabaseError> {
        let write_txn = self.begin_write()?;
        let touched = {
            let mut table = write_txn.open_table(SESSIONS)?;
            let existing: Option<SessionRecord> = match table.get(cookie)? {
                Some(data) => Some(rmp_serde::from_slice(data.value())?),
                None => None,
            };
            match existing {
                Some(mut session) => {
                    session.last_seen = now;
                    let data = rmp_serde::to_vec_named(&session)?;
                    table.insert(cookie, data.as_slice())?;
                    true
                }
                None => false,
            }
        };
        write_txn.commit()?;
        Ok(touched)
    }

    pub fn clear_sessions(&self) -> Result<u64, DatabaseError> {
        self.clear_table(SESSIONS)
    }

    /// Delete sessions last seen before `cutoff`, returning how many were removed.
    pub fn sweep_sessions(&self, cutoff: DateTime<Utc>) -> Result<u64, DatabaseError> {
        let write_txn = self.begin_write()?;
        let mut removed = 0;
        {
            let table = write_txn.open_table(SESSIONS)?;
            let mut stale = Vec::new();
            for result in table.iter()? {
                let (cookie, value) = result?;
                let expired = match rmp_serde::from_slice::<SessionRecord>(value.value()) {
                    Ok(session) => session.last_seen < cutoff,
                    Err(_) => true,
                };
                if expired {
                    stale.push(cookie.value().to_string());
                }
            }
            drop(table);

            let mut table = write_txn.open_table(SESSIONS)?;
            for cookie in stale {
                table.remove(cookie.as_str())?;
                removed += 1;
            }
        }
        write_txn.commit()?;
        Ok(removed)
    }
}
