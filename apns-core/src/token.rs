//! Provider authentication token management.
//!
//! [`TokenSource`] holds the current token and a generation counter.
//! `regenerate` is the CAS-style coalescing primitive the spec calls for:
//! every in-flight request that observed the same generation will trigger
//! at most one mint.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};

use crate::clock::{elapsed_since, Clock, SystemClock};

/// 55 minutes: refreshes well before APNs' one-hour token ceiling.
pub const TOKEN_EXPIRY_THRESHOLD: Duration = Duration::from_secs(3300);

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("failed to mint provider token: {0}")]
    Mint(#[source] jsonwebtoken::errors::Error),
}

/// Mints a fresh provider token from key material. A seam so tests can
/// substitute a minter that returns a fixed string instead of signing a
/// real JWT.
pub trait TokenMinter: Send + Sync {
    fn mint(
        &self,
        key_pem: &SecretString,
        key_id: &str,
        team_id: &str,
        now: SystemTime,
    ) -> Result<String, TokenError>;
}

/// Mints an ES256 JWT with `kid = key_id` and claims `{iss: team_id, iat}`,
/// the shape Apple's provider API requires.
#[derive(Debug, Default, Clone, Copy)]
pub struct JwtTokenMinter;

#[derive(serde::Serialize)]
struct Claims<'a> {
    iss: &'a str,
    iat: u64,
}

impl TokenMinter for JwtTokenMinter {
    fn mint(
        &self,
        key_pem: &SecretString,
        key_id: &str,
        team_id: &str,
        now: SystemTime,
    ) -> Result<String, TokenError> {
        let iat = now
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs();

        let mut header = jsonwebtoken::Header::new(jsonwebtoken::Algorithm::ES256);
        header.kid = Some(key_id.to_string());

        let claims = Claims { iss: team_id, iat };

        let encoding_key = jsonwebtoken::EncodingKey::from_ec_pem(key_pem.expose_secret().as_bytes())
            .map_err(TokenError::Mint)?;

        jsonwebtoken::encode(&header, &claims, &encoding_key).map_err(TokenError::Mint)
    }
}

struct Inner {
    current: String,
    generation: u64,
    issued_at: SystemTime,
}

/// Shared, thread-safe holder for the current provider token.
pub struct TokenSource {
    key_pem: SecretString,
    key_id: String,
    team_id: String,
    minter: Arc<dyn TokenMinter>,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl TokenSource {
    pub fn new(key_pem: SecretString, key_id: String, team_id: String) -> Result<Self, TokenError> {
        Self::with_minter_and_clock(key_pem, key_id, team_id, Arc::new(JwtTokenMinter), Arc::new(SystemClock))
    }

    pub fn with_minter_and_clock(
        key_pem: SecretString,
        key_id: String,
        team_id: String,
        minter: Arc<dyn TokenMinter>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, TokenError> {
        let now = clock.now();
        let current = minter.mint(&key_pem, &key_id, &team_id, now)?;
        Ok(Self {
            key_pem,
            key_id,
            team_id,
            minter,
            clock,
            inner: Mutex::new(Inner {
                current,
                generation: 0,
                issued_at: now,
            }),
        })
    }

    /// The live token and the generation that produced it. Callers intending
    /// to call [`Self::regenerate`] later should remember the returned
    /// generation.
    pub fn current_token(&self) -> (String, u64) {
        let inner = self.inner.lock();
        (inner.current.clone(), inner.generation)
    }

    pub fn is_expired(&self, threshold: Duration) -> bool {
        let issued_at = self.inner.lock().issued_at;
        elapsed_since(self.clock.as_ref(), issued_at) >= threshold
    }

    /// No-op unless `observed_generation` still matches the stored
    /// generation, which coalesces concurrent callers that all observed an
    /// expired token into a single mint.
    pub fn regenerate(&self, observed_generation: u64) -> Result<(), TokenError> {
        let mut inner = self.inner.lock();
        if observed_generation != inner.generation {
            return Ok(());
        }

        let now = self.clock.now();
        let minted = self.minter.mint(&self.key_pem, &self.key_id, &self.team_id, now)?;
        inner.current = minted;
        inner.generation += 1;
        inner.issued_at = now;
        tracing::debug!(generation = inner.generation, "regenerated provider token");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex as StdMutex;

    struct CountingMinter {
        calls: AtomicU64,
    }

    impl TokenMinter for CountingMinter {
        fn mint(
            &self,
            _key_pem: &SecretString,
            _key_id: &str,
            _team_id: &str,
            now: SystemTime,
        ) -> Result<String, TokenError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!("token-{n}-{:?}", now))
        }
    }

    struct FixedClock(StdMutex<SystemTime>);

    impl Clock for FixedClock {
        fn now(&self) -> SystemTime {
            *self.0.lock().unwrap()
        }
    }

    fn source(minter: Arc<CountingMinter>, clock: Arc<FixedClock>) -> TokenSource {
        TokenSource::with_minter_and_clock(
            SecretString::from("pem".to_string()),
            "kid".to_string(),
            "team".to_string(),
            minter,
            clock,
        )
        .unwrap()
    }

    #[test]
    fn is_expired_respects_threshold() {
        let clock = Arc::new(FixedClock(StdMutex::new(SystemTime::UNIX_EPOCH)));
        let minter = Arc::new(CountingMinter { calls: AtomicU64::new(0) });
        let ts = source(minter, clock.clone());

        assert!(!ts.is_expired(Duration::from_secs(3300)));

        *clock.0.lock().unwrap() = SystemTime::UNIX_EPOCH + Duration::from_secs(3300);
        assert!(ts.is_expired(Duration::from_secs(3300)));
    }

    #[test]
    fn regenerate_is_noop_for_stale_generation() {
        let clock = Arc::new(FixedClock(StdMutex::new(SystemTime::UNIX_EPOCH)));
        let minter = Arc::new(CountingMinter { calls: AtomicU64::new(0) });
        let ts = source(minter.clone(), clock);

        let (_, gen0) = ts.current_token();
        ts.regenerate(gen0).unwrap();
        let (_, gen1) = ts.current_token();
        assert_eq!(gen1, gen0 + 1);
        assert_eq!(minter.calls.load(Ordering::SeqCst), 2); // initial mint + one regenerate

        // A second caller that observed the now-stale `gen0` triggers no
        // further mint.
        ts.regenerate(gen0).unwrap();
        assert_eq!(minter.calls.load(Ordering::SeqCst), 2);
        let (_, gen2) = ts.current_token();
        assert_eq!(gen2, gen1);
    }

    #[test]
    fn concurrent_regenerations_for_same_generation_mint_exactly_once() {
        let clock = Arc::new(FixedClock(StdMutex::new(SystemTime::UNIX_EPOCH)));
        let minter = Arc::new(CountingMinter { calls: AtomicU64::new(0) });
        let ts = Arc::new(source(minter.clone(), clock));

        let (_, gen0) = ts.current_token();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ts = ts.clone();
                std::thread::spawn(move || ts.regenerate(gen0).unwrap())
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        // One initial mint plus exactly one regeneration, regardless of how
        // many threads raced with the same observed generation.
        assert_eq!(minter.calls.load(Ordering::SeqCst), 2);
        let (_, gen_final) = ts.current_token();
        assert_eq!(gen_final, gen0 + 1);
    }
}
