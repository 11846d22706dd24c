use redb::ReadableTable;

use super::db::{Database, DatabaseError};
use super::models::LinkRecord;
use super::tables::*;

impl Database {
    // ========================================================================
    // Share link operations
    // ========================================================================

    pub fn get_link(&self, code: &str) -> Result<Option<LinkRecord>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(LINKS)?;

        match table.get(code)? {
            Some(data) => Ok(Some(rmp_serde::from_slice(data.value())?)),
            None => Ok(None),
        }
    }

    /// Return the code already mapped to `link`, or store it under the first
    /// unused code among `candidates`.
    ///
    /// Lookup and insert share one write transaction, so two concurrent callers
    /// can neither create duplicate entries nor collide on a code. The boolean
    /// is true when a new entry was created; `None` means every candidate was
    /// taken.
    pub fn issue_link<I>(
        &self,
        link: &LinkRecord,
        candidates: I,
    ) -> Result<Option<(String, bool)>, DatabaseError>
    where
        I: IntoIterator<Item = String>,
    {
        let write_txn = self.begin_write()?;
        let issued = {
            let mut table = write_txn.open_table(LINKS)?;

            let mut existing = None;
            for result in table.iter()? {
                let (code, value) = result?;
                let record: LinkRecord = rmp_serde::from_slice(value.value())?;
                if record == *link {
                    existing = Some(code.value().to_string());
                    break;
                }
            }

            match existing {
                Some(code) => Some((code, false)),
                None => {
                    let mut free = None;
                    for candidate in candidates {
                        if table.get(candidate.as_str())?.is_none() {
                            free = Some(candidate);
                            break;
                        }
                    }
                    match free {
                        Some(code) => {
                            let data = rmp_serde::to_vec_named(link)?;
                            table.insert(code.as_str(), data.as_slice())?;
                            Some((code, true))
                        }
                        None => None,
                    }
                }
            }
        };
        write_txn.commit()?;
        Ok(issued)
    }

    /// Delete every link for which `keep` returns false. Returns the removed codes.
    pub fn retain_links<F>(&self, mut keep: F) -> Result<Vec<String>, DatabaseError>
    where
        F: FnMut(&str, &LinkRecord) -> bool,
    {
        let write_txn = self.begin_write()?;
        let mut removed = Vec::new();
        {
            let table = write_txn.open_table(LINKS)?;
            for result in table.iter()? {
                let (code, value) = result?;
                let keep_it = match rmp_serde::from_slice::<LinkRecord>(value.value()) {
                    Ok(record) => keep(code.value(), &record),
                    Err(_) => false,
                };
                if !keep_it {
                    removed.push(code.value().to_string());
                }
            }
            drop(table);

            let mut table = write_txn.open_table(LINKS)?;
            for code in &removed {
                table.remove(code.as_str())?;
            }
        }
        write_txn.commit()?;
        Ok(removed)
    }
}
