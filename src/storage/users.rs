use std::collections::BTreeMap;

use redb::ReadableTable;

use super::db::{Database, DatabaseError};
use super::models::UserRecord;
use super::tables::*;

impl Database {
    // ========================================================================
    // User operations
    // ========================================================================

    /// Insert or replace a user
    pub fn put_user(&self, name: &str, user: &UserRecord) -> Result<(), DatabaseError> {
        debug_assert!(!name.is_empty(), "user name must not be empty");

        let write_txn = self.begin_write()?;
        {
            let mut table = write_txn.open_table(USERS)?;
            let data = rmp_serde::to_vec_named(user)?;
            table.insert(name, data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn get_user(&self, name: &str) -> Result<Option<UserRecord>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(USERS)?;

        match table.get(name)? {
            Some(data) => Ok(Some(rmp_serde::from_slice(data.value())?)),
            None => Ok(None),
        }
    }

    /// Delete a user, returning whether it existed
    pub fn delete_user(&self, name: &str) -> Result<bool, DatabaseError> {
        let write_txn = self.begin_write()?;
        let existed = {
            let mut table = write_txn.open_table(USERS)?;
            let removed = table.remove(name)?.is_some();
            removed
        };
        write_txn.commit()?;
        Ok(existed)
    }

    /// All user names with their privilege flag
    pub fn list_users(&self) -> Result<BTreeMap<String, bool>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(USERS)?;

        let mut users = BTreeMap::new();
        for result in table.iter()? {
            let (name, value) = result?;
            let user: UserRecord = rmp_serde::from_slice(value.value())?;
            users.insert(name.value().to_string(), user.privileged);
        }
        Ok(users)
    }

    pub fn has_users(&self) -> Result<bool, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(USERS)?;
        let mut iter = table.iter()?;
        let found = iter.next().transpose()?.is_some();
        Ok(found)
    }
}
