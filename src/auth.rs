//! Credentials, session tokens, CSRF tokens and login throttling.

use std::collections::{HashSet, VecDeque};
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use dashmap::DashMap;
use parking_lot::Mutex;
use ring::error::Unspecified;
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use tokio::time::Instant;

use crate::storage::models::UserRecord;

/// Name of the session cookie
pub const SESSION_COOKIE: &str = "s";

/// Sessions not seen for this long are swept.
pub const SESSION_RETENTION_DAYS: i64 = 31;

/// Minimum spacing between login attempts from one address.
pub const LOGIN_COOLDOWN: Duration = Duration::from_secs(2);

const PBKDF2_ITERATIONS: u32 = 100_000;
const CREDENTIAL_LEN: usize = 32;
const MAX_CSRF_TOKENS: usize = 4096;

static PBKDF2_ALG: pbkdf2::Algorithm = pbkdf2::PBKDF2_HMAC_SHA256;

fn iterations() -> NonZeroU32 {
    NonZeroU32::new(PBKDF2_ITERATIONS).unwrap_or(NonZeroU32::MIN)
}

/// URL-safe random token carrying `bytes` bytes of entropy.
pub fn random_token(rng: &SystemRandom, bytes: usize) -> Result<String, Unspecified> {
    let mut buf = vec![0u8; bytes];
    rng.fill(&mut buf)?;
    Ok(URL_SAFE_NO_PAD.encode(buf))
}

/// Derive a new salted credential for `password`.
pub fn hash_password(
    rng: &SystemRandom,
    password: &str,
    privileged: bool,
) -> Result<UserRecord, Unspecified> {
    let mut salt = vec![0u8; 16];
    rng.fill(&mut salt)?;

    let mut hash = vec![0u8; CREDENTIAL_LEN];
    pbkdf2::derive(PBKDF2_ALG, iterations(), &salt, password.as_bytes(), &mut hash);

    Ok(UserRecord {
        hash,
        salt,
        privileged,
    })
}

pub fn verify_password(user: &UserRecord, password: &str) -> bool {
    pbkdf2::verify(
        PBKDF2_ALG,
        iterations(),
        &user.salt,
        password.as_bytes(),
        &user.hash,
    )
    .is_ok()
}

// ============================================================================
// CSRF tokens
// ============================================================================

/// Issued CSRF tokens. Oldest tokens are evicted once the cap is reached.
pub struct Csrf {
    rng: SystemRandom,
    tokens: Mutex<(HashSet<String>, VecDeque<String>)>,
}

impl Default for Csrf {
    fn default() -> Self {
        Self::new()
    }
}

impl Csrf {
    pub fn new() -> Self {
        Self {
            rng: SystemRandom::new(),
            tokens: Mutex::new((HashSet::new(), VecDeque::new())),
        }
    }

    pub fn issue(&self) -> Result<String, Unspecified> {
        let token = random_token(&self.rng, 16)?;
        let mut guard = self.tokens.lock();
        let (set, order) = &mut *guard;
        if order.len() >= MAX_CSRF_TOKENS {
            if let Some(oldest) = order.pop_front() {
                set.remove(&oldest);
            }
        }
        set.insert(token.clone());
        order.push_back(token.clone());
        Ok(token)
    }

    pub fn validate(&self, token: Option<&str>) -> bool {
        match token {
            Some(token) => self.tokens.lock().0.contains(token),
            None => false,
        }
    }
}

// ============================================================================
// Login rate limiting
// ============================================================================

/// Allows one login attempt per source address per cooldown period.
pub struct LoginLimiter {
    cooldown: Duration,
    recent: DashMap<IpAddr, Instant>,
}

impl LoginLimiter {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            recent: DashMap::new(),
        }
    }

    /// Record an attempt from `ip`; false when the previous one is too recent.
    pub fn try_acquire(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        if self.recent.len() > 1024 {
            self.recent
                .retain(|_, last| now.duration_since(*last) < self.cooldown);
        }

        let mut allowed = true;
        self.recent
            .entry(ip)
            .and_modify(|last| {
                if now.duration_since(*last) < self.cooldown {
                    allowed = false;
                } else {
                    *last = now;
                }
            })
            .or_insert(now);
        allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_password_round_trip() {
        let rng = SystemRandom::new();
        let user = hash_password(&rng, "hunter2", true).unwrap();
        assert!(user.privileged);
        assert!(verify_password(&user, "hunter2"));
        assert!(!verify_password(&user, "hunter3"));
    }

    #[test]
    fn test_salts_differ() {
        let rng = SystemRandom::new();
        let a = hash_password(&rng, "same", false).unwrap();
        let b = hash_password(&rng, "same", false).unwrap();
        assert_ne!(a.salt, b.salt);
        assert_ne!(a.hash, b.hash);
    }

    #[test]
    fn test_csrf_tokens() {
        let csrf = Csrf::new();
        let token = csrf.issue().unwrap();
        assert!(csrf.validate(Some(&token)));
        assert!(!csrf.validate(Some("forged")));
        assert!(!csrf.validate(None));
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_limiter_cooldown() {
        let limiter = LoginLimiter::new(LOGIN_COOLDOWN);
        let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let other = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));

        assert!(limiter.try_acquire(ip));
        assert!(!limiter.try_acquire(ip));
        assert!(limiter.try_acquire(other));

        tokio::time::advance(LOGIN_COOLDOWN).await;
        assert!(limiter.try_acquire(ip));
    }
}
