//! In-memory set of banned IPs, consulted on every post and rebuilt
//! wholesale from the database.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};
use domains::{Ban, BanRepo, DomainError};
use tracing::{info, warn};

pub struct BanCache {
    repo: Arc<dyn BanRepo>,
    ips: RwLock<HashSet<String>>,
}

impl BanCache {
    pub fn new(repo: Arc<dyn BanRepo>) -> Self {
        Self {
            repo,
            ips: RwLock::new(HashSet::new()),
        }
    }

    pub fn is_banned(&self, ip: &str) -> bool {
        match self.ips.read() {
            Ok(set) => set.contains(ip),
            // A writer panicked mid-replace; the set itself is still whole
            Err(poisoned) => poisoned.into_inner().contains(ip),
        }
    }

    fn replace(&self, ips: HashSet<String>) {
        let mut guard = self.ips.write().unwrap_or_else(|p| p.into_inner());
        *guard = ips;
    }

    /// Reloads the set from the live bans in the database.
    pub async fn refresh(&self, now: DateTime<Utc>) -> Result<usize, DomainError> {
        let bans = self.repo.active_bans(now).await?;
        let ips: HashSet<String> = bans.into_iter().map(|b| b.ip).collect();
        let count = ips.len();
        self.replace(ips);
        Ok(count)
    }

    /// Drops expired bans from the database, then reloads.
    pub async fn expire(&self, now: DateTime<Utc>) -> Result<u64, DomainError> {
        let expired = self.repo.expire_bans(now).await?;
        if let Err(e) = self.refresh(now).await {
            warn!(error = %e, "ban cache refresh failed");
            return Err(e);
        }
        Ok(expired)
    }

    pub async fn ban(&self, ip: &str, reason: &str, duration: Duration, now: DateTime<Utc>) -> Result<(), DomainError> {
        let ban = Ban {
            ip: ip.to_string(),
            reason: reason.to_string(),
            expires_at: now + duration,
        };
        self.repo.insert_ban(&ban).await?;
        self.refresh(now).await?;
        info!(ip, reason, until = %ban.expires_at, "address banned");
        Ok(())
    }
}
