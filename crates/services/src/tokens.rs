//! # Token manager
//!
//! Mints, redeems and sweeps the three token families. Token strings are
//! CSPRNG bytes encoded as unpadded URL-safe base64, so every family has a
//! fixed string length that is checked before the database is touched.

use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use domains::{
    DomainError, ImageAllocToken, ImageCommon, PostToken, RepoError, SessionToken, TokenKind,
    TokenRepo,
};
use tracing::{debug, warn};

/// Collisions of 15+ random bytes are practically impossible; this only
/// bounds the loop.
const MAX_MINT_ATTEMPTS: usize = 5;

/// Counts from one expiry sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub image_tokens: u64,
    pub post_tokens: u64,
}

pub struct TokenManager {
    repo: Arc<dyn TokenRepo>,
    session_ttl: Duration,
}

/// Random token of the given kind.
pub fn generate(kind: TokenKind) -> Result<String, DomainError> {
    let mut buf = vec![0u8; kind.byte_len()];
    getrandom::getrandom(&mut buf).map_err(|e| DomainError::Internal(format!("rng: {e}")))?;
    Ok(URL_SAFE_NO_PAD.encode(buf))
}

/// Rejects strings that cannot be a token of `kind`.
pub fn check_len(kind: TokenKind, token: &str) -> Result<(), DomainError> {
    if token.len() == kind.string_len() {
        Ok(())
    } else {
        Err(DomainError::InvalidToken)
    }
}

fn ttl(kind: TokenKind) -> Duration {
    Duration::from_std(kind.default_ttl()).unwrap_or(Duration::zero())
}

impl TokenManager {
    pub fn new(repo: Arc<dyn TokenRepo>, session_ttl_days: u32) -> Self {
        Self {
            repo,
            session_ttl: Duration::days(i64::from(session_ttl_days)),
        }
    }

    /// Retries `insert` with a fresh token while it reports a key conflict.
    /// `insert` yields `false` when the write was refused by policy.
    async fn mint_with<F, Fut>(&self, kind: TokenKind, mut insert: F) -> Result<String, DomainError>
    where
        F: FnMut(String) -> Fut,
        Fut: std::future::Future<Output = Result<bool, RepoError>>,
    {
        for attempt in 1..=MAX_MINT_ATTEMPTS {
            let token = generate(kind)?;
            match insert(token.clone()).await {
                Ok(true) => return Ok(token),
                Ok(false) => return Err(DomainError::TokenForbidden),
                Err(RepoError::Conflict) => {
                    warn!(kind = kind.as_str(), attempt, "token collision");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(DomainError::Internal(format!(
            "{} token collided {MAX_MINT_ATTEMPTS} times",
            kind.as_str()
        )))
    }

    // ── Image allocation tokens ─────────────────────────────────────────

    pub async fn mint_image(&self, sha1: &str, now: DateTime<Utc>) -> Result<String, DomainError> {
        let expires_at = now + ttl(TokenKind::ImageAlloc);
        self.mint_with(TokenKind::ImageAlloc, move |token| async move {
            let record = ImageAllocToken {
                token,
                sha1: sha1.to_string(),
                expires_at,
            };
            self.repo.insert_image_token(&record).await.map(|()| true)
        })
        .await
    }

    /// Consumes the token and returns the image it was bound to.
    pub async fn redeem_image(&self, token: &str, now: DateTime<Utc>) -> Result<ImageCommon, DomainError> {
        check_len(TokenKind::ImageAlloc, token)?;
        self.repo
            .take_image_token(token, now)
            .await?
            .ok_or(DomainError::InvalidToken)
    }

    pub async fn revoke_image(&self, token: &str) -> Result<(), DomainError> {
        check_len(TokenKind::ImageAlloc, token)?;
        Ok(self.repo.delete_image_token(token).await?)
    }

    // ── Post tokens ─────────────────────────────────────────────────────

    /// Fails with `token_forbidden` while `ip` still holds a live token.
    pub async fn mint_post(&self, ip: &str, now: DateTime<Utc>) -> Result<String, DomainError> {
        let expires_at = now + ttl(TokenKind::Post);
        let minted = self
            .mint_with(TokenKind::Post, move |token| async move {
                let record = PostToken {
                    token,
                    ip: ip.to_string(),
                    expires_at,
                };
                self.repo.insert_post_token(&record, now).await
            })
            .await;
        if matches!(minted, Err(DomainError::TokenForbidden)) {
            debug!(ip, "post token already live for address");
        }
        minted
    }

    /// Consumes the token. It must have been issued to `ip`.
    pub async fn redeem_post(&self, token: &str, ip: &str, now: DateTime<Utc>) -> Result<(), DomainError> {
        check_len(TokenKind::Post, token)?;
        match self.repo.take_post_token(token, now).await? {
            Some(bound) if bound == ip => Ok(()),
            Some(bound) => {
                warn!(bound_ip = %bound, ip, "post token redeemed from another address");
                Err(DomainError::InvalidToken)
            }
            None => Err(DomainError::InvalidToken),
        }
    }

    // ── Sessions ────────────────────────────────────────────────────────

    pub async fn mint_session(&self, user_id: &str, now: DateTime<Utc>) -> Result<String, DomainError> {
        let expires_at = now + self.session_ttl;
        self.mint_with(TokenKind::Session, move |token| async move {
            let record = SessionToken {
                user_id: user_id.to_string(),
                token,
                expires_at,
            };
            self.repo.insert_session(&record).await.map(|()| true)
        })
        .await
    }

    /// Multi-use; returns the owning user.
    pub async fn session_user(&self, token: &str, now: DateTime<Utc>) -> Result<String, DomainError> {
        check_len(TokenKind::Session, token)?;
        self.repo
            .session_user(token, now)
            .await?
            .ok_or(DomainError::InvalidToken)
    }

    pub async fn revoke_session(&self, token: &str) -> Result<(), DomainError> {
        check_len(TokenKind::Session, token)?;
        Ok(self.repo.delete_session(token).await?)
    }

    // ── Expiry ──────────────────────────────────────────────────────────

    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, DomainError> {
        Ok(SweepReport {
            image_tokens: self.repo.expire_image_tokens(now).await?,
            post_tokens: self.repo.expire_post_tokens(now).await?,
        })
    }

    pub async fn sweep_sessions(&self, now: DateTime<Utc>) -> Result<u64, DomainError> {
        Ok(self.repo.expire_sessions(now).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domains::MockTokenRepo;
    use mockall::predicate::*;

    fn manager(repo: MockTokenRepo) -> TokenManager {
        TokenManager::new(Arc::new(repo), 30)
    }

    #[test]
    fn generated_tokens_have_fixed_lengths() {
        for kind in [TokenKind::ImageAlloc, TokenKind::Post, TokenKind::Session] {
            let token = generate(kind).unwrap();
            assert_eq!(token.len(), kind.string_len());
            assert!(!token.contains('='));
            assert!(token.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        }
        assert_ne!(generate(TokenKind::Post).unwrap(), generate(TokenKind::Post).unwrap());
    }

    #[tokio::test]
    async fn wrong_length_is_rejected_without_touching_the_repo() {
        // No expectations: any repo call panics
        let tokens = manager(MockTokenRepo::new());
        let now = Utc::now();
        let long = "x".repeat(87);
        for bad in ["", "short", long.as_str()] {
            assert!(matches!(tokens.redeem_image(bad, now).await, Err(DomainError::InvalidToken)));
            assert!(matches!(tokens.redeem_post(bad, "ip", now).await, Err(DomainError::InvalidToken)));
            assert!(matches!(tokens.session_user(bad, now).await, Err(DomainError::InvalidToken)));
        }
    }

    #[tokio::test]
    async fn image_mint_retries_on_collision() {
        let mut repo = MockTokenRepo::new();
        let mut seq = mockall::Sequence::new();
        repo.expect_insert_image_token()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(RepoError::Conflict));
        repo.expect_insert_image_token()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|t| t.sha1 == "abc" && t.token.len() == 86)
            .returning(|_| Ok(()));

        let token = manager(repo).mint_image("abc", Utc::now()).await.unwrap();
        assert_eq!(token.len(), 86);
    }

    #[tokio::test]
    async fn image_mint_gives_up_after_repeated_collisions() {
        let mut repo = MockTokenRepo::new();
        repo.expect_insert_image_token()
            .times(MAX_MINT_ATTEMPTS)
            .returning(|_| Err(RepoError::Conflict));
        let err = manager(repo).mint_image("abc", Utc::now()).await.unwrap_err();
        assert!(err.is_internal());
    }

    #[tokio::test]
    async fn image_token_expires_after_a_minute() {
        let now = Utc::now();
        let mut repo = MockTokenRepo::new();
        repo.expect_insert_image_token()
            .withf(move |t| t.expires_at == now + Duration::seconds(60))
            .returning(|_| Ok(()));
        manager(repo).mint_image("abc", now).await.unwrap();
    }

    #[tokio::test]
    async fn second_post_token_for_an_ip_is_forbidden() {
        let mut repo = MockTokenRepo::new();
        repo.expect_insert_post_token()
            .withf(|t, _| t.ip == "10.0.0.1" && t.token.len() == 20)
            .returning(|_, _| Ok(false));
        let err = manager(repo).mint_post("10.0.0.1", Utc::now()).await.unwrap_err();
        assert!(matches!(err, DomainError::TokenForbidden));
    }

    #[tokio::test]
    async fn post_token_is_bound_to_its_ip() {
        let token = "p".repeat(20);
        let mut repo = MockTokenRepo::new();
        repo.expect_take_post_token()
            .with(eq(token.clone()), always())
            .returning(|_, _| Ok(Some("10.0.0.1".into())));
        let err = manager(repo).redeem_post(&token, "10.0.0.2", Utc::now()).await.unwrap_err();
        assert!(matches!(err, DomainError::InvalidToken));
    }

    #[tokio::test]
    async fn redeemed_image_token_is_gone() {
        let token = "i".repeat(86);
        let mut repo = MockTokenRepo::new();
        repo.expect_take_image_token().times(1).returning(|_, _| Ok(None));
        let err = manager(repo).redeem_image(&token, Utc::now()).await.unwrap_err();
        assert!(matches!(err, DomainError::InvalidToken));
    }

    #[tokio::test]
    async fn session_ttl_is_configurable() {
        let now = Utc::now();
        let mut repo = MockTokenRepo::new();
        repo.expect_insert_session()
            .withf(move |s| s.expires_at == now + Duration::days(7) && s.token.len() == 171)
            .returning(|_| Ok(()));
        TokenManager::new(Arc::new(repo), 7)
            .mint_session("admin", now)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn sweep_reports_both_families() {
        let mut repo = MockTokenRepo::new();
        repo.expect_expire_image_tokens().returning(|_| Ok(3));
        repo.expect_expire_post_tokens().returning(|_| Ok(1));
        let report = manager(repo).sweep(Utc::now()).await.unwrap();
        assert_eq!(report, SweepReport { image_tokens: 3, post_tokens: 1 });
    }
}
