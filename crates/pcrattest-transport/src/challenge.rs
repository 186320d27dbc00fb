// SPDX-License-Identifier: MIT OR Apache-2.0

//! Nonces issued to provers, each redeemable once before it expires.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use log::{debug, warn};

use pcrattest_attest::fresh_nonce;

use crate::DEFAULT_MAX_OUTSTANDING;

/// Outstanding nonces and their expiry
#[derive(Debug)]
pub struct ChallengeStore {
    ttl: Duration,
    max_outstanding: usize,
    issued: Mutex<HashMap<Vec<u8>, Instant>>,
}

impl ChallengeStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            max_outstanding: DEFAULT_MAX_OUTSTANDING,
            issued: Mutex::new(HashMap::new()),
        }
    }

    /// Cap on nonces that are issued but neither redeemed nor expired
    pub fn with_max_outstanding(mut self, max_outstanding: usize) -> Self {
        self.max_outstanding = max_outstanding;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Generate and remember a fresh nonce. `None` while the store is full.
    pub fn issue(&self) -> Result<Option<Vec<u8>>> {
        let now = Instant::now();
        let mut issued = self.lock()?;
        prune(&mut issued, now);
        if issued.len() >= self.max_outstanding {
            warn!("refusing challenge: {} nonces outstanding", issued.len());
            return Ok(None);
        }

        let nonce = fresh_nonce();
        issued.insert(nonce.clone(), now + self.ttl);
        debug!("issued nonce {} ({} outstanding)", hex::encode(&nonce), issued.len());
        Ok(Some(nonce))
    }

    /// Consume `nonce`. False if it was never issued, has expired or was
    /// already redeemed.
    pub fn redeem(&self, nonce: &[u8]) -> Result<bool> {
        let now = Instant::now();
        let mut issued = self.lock()?;
        let valid = matches!(issued.remove(nonce), Some(expires) if now < expires);
        prune(&mut issued, now);
        Ok(valid)
    }

    /// Nonces issued and neither redeemed nor pruned
    pub fn outstanding(&self) -> Result<usize> {
        Ok(self.lock()?.len())
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<Vec<u8>, Instant>>> {
        self.issued
            .lock()
            .map_err(|_| anyhow!("challenge store lock poisoned"))
    }
}

fn prune(issued: &mut HashMap<Vec<u8>, Instant>, now: Instant) {
    issued.retain(|_, expires| now < *expires);
}
