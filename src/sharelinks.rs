//! Short codes granting unauthenticated access to one file or directory.

use std::path::Path;

use ring::error::Unspecified;
use ring::rand::{SecureRandom, SystemRandom};
use thiserror::Error;
use tracing::info;

use crate::paths;
use crate::storage::models::LinkRecord;
use crate::storage::{Database, DatabaseError};

/// Characters a code is drawn from; look-alikes such as `l`, `I`, `O`, `0` and `1` are left out.
pub const LINK_ALPHABET: &[u8] = b"abcdefghijkmnopqrstuvwxyzABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Fresh codes tried per issue before giving up
const CODE_ATTEMPTS: usize = 16;

#[derive(Debug, Error)]
pub enum ShareLinkError {
    #[error(transparent)]
    Database(#[from] DatabaseError),
    #[error("Random source failure")]
    Random,
    #[error("No free share link code left")]
    Exhausted,
}

impl From<Unspecified> for ShareLinkError {
    fn from(_: Unspecified) -> Self {
        ShareLinkError::Random
    }
}

/// Uniform random code of `length` characters from [`LINK_ALPHABET`].
pub fn random_code(rng: &SystemRandom, length: usize) -> Result<String, Unspecified> {
    // Largest multiple of the alphabet size that fits a byte; higher values are rejected
    let zone = (u8::MAX as usize + 1) / LINK_ALPHABET.len() * LINK_ALPHABET.len();
    let mut code = String::with_capacity(length);
    let mut buf = [0u8; 32];
    while code.len() < length {
        rng.fill(&mut buf)?;
        for byte in buf {
            if (byte as usize) < zone {
                code.push(LINK_ALPHABET[byte as usize % LINK_ALPHABET.len()] as char);
                if code.len() == length {
                    break;
                }
            }
        }
    }
    Ok(code)
}

pub struct ShareLinks {
    db: Database,
    length: usize,
    rng: SystemRandom,
}

impl ShareLinks {
    pub fn new(db: Database, length: usize) -> Self {
        Self {
            db,
            length,
            rng: SystemRandom::new(),
        }
    }

    /// Code for `location`, reusing the existing one for an identical request.
    pub fn issue(&self, location: &str, attachment: bool) -> Result<String, ShareLinkError> {
        let record = LinkRecord {
            location: paths::normalize(location),
            attachment,
        };
        let candidates = (0..CODE_ATTEMPTS)
            .map(|_| random_code(&self.rng, self.length))
            .collect::<Result<Vec<_>, _>>()?;

        let (code, created) = self
            .db
            .issue_link(&record, candidates)?
            .ok_or(ShareLinkError::Exhausted)?;
        if created {
            info!(%code, location = %record.location, "Share link created");
        }
        Ok(code)
    }

    pub fn resolve(&self, code: &str) -> Result<Option<LinkRecord>, ShareLinkError> {
        Ok(self.db.get_link(code)?)
    }

    /// Drop links with a stale code length or a target that no longer exists.
    ///
    /// Touches the filesystem synchronously.
    pub fn sweep(&self, root: &Path) -> Result<Vec<String>, ShareLinkError> {
        let length = self.length;
        let removed = self.db.retain_links(|code, link| {
            code.chars().count() == length
                && paths::resolve(root, &link.location).is_some_and(|p| p.exists())
        })?;
        if !removed.is_empty() {
            info!(count = removed.len(), "Swept share links");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(length: usize) -> (tempfile::TempDir, ShareLinks) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("data")).unwrap();
        (dir, ShareLinks::new(db, length))
    }

    #[test]
    fn test_random_code_alphabet() {
        let rng = SystemRandom::new();
        for _ in 0..50 {
            let code = random_code(&rng, 7).unwrap();
            assert_eq!(code.len(), 7);
            assert!(code.bytes().all(|b| LINK_ALPHABET.contains(&b)));
        }
    }

    #[test]
    fn test_issue_is_idempotent_per_pair() {
        let (_dir, links) = fixture(5);
        let first = links.issue("/docs/a.txt", false).unwrap();
        let second = links.issue("/docs/a.txt", false).unwrap();
        let download = links.issue("/docs/a.txt", true).unwrap();

        assert_eq!(first, second);
        assert_ne!(first, download);
        assert_eq!(first.len(), 5);

        let resolved = links.resolve(&download).unwrap().unwrap();
        assert_eq!(resolved.location, "/docs/a.txt");
        assert!(resolved.attachment);
        assert!(links.resolve("nope!").unwrap().is_none());
    }

    #[test]
    fn test_sweep_removes_stale_entries() {
        let (dir, links) = fixture(5);
        let root = dir.path().join("files");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("kept.txt"), b"x").unwrap();

        let kept = links.issue("/kept.txt", false).unwrap();
        let gone = links.issue("/gone.txt", false).unwrap();

        let removed = links.sweep(&root).unwrap();
        assert_eq!(removed, vec![gone]);
        assert!(links.resolve(&kept).unwrap().is_some());

        // A changed code length invalidates every existing code
        let relengthed = ShareLinks::new(links.db.clone(), 6);
        assert_eq!(relengthed.sweep(&root).unwrap(), vec![kept]);
    }
}
