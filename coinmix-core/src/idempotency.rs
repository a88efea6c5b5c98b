// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{CoordinatorError, Result};

pub const DEFAULT_RESPONSE_TTL: Duration = Duration::from_secs(300);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

struct Entry<V> {
    created_at: Instant,
    response: watch::Receiver<Option<V>>,
}

enum Role<V> {
    Cached(V),
    Owner(watch::Sender<Option<V>>),
    Waiter(watch::Receiver<Option<V>>),
}

/// Collapses identical requests into one computation.
///
/// The first caller for a key computes; concurrent callers with an equal key
/// wait for that result. Successful responses are served from memory until
/// the TTL passes. A failed computation is forgotten, and anyone waiting on
/// it starts over.
pub struct IdempotencyCache<K, V> {
    entries: Mutex<HashMap<K, Entry<V>>>,
    ttl: Duration,
    request_timeout: Duration,
}

impl<K, V> IdempotencyCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl: DEFAULT_RESPONSE_TTL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn claim(&self, key: &K) -> Role<V> {
        let mut entries = self.entries.lock();
        let ttl = self.ttl;
        entries.retain(|_, entry| entry.created_at.elapsed() < ttl);

        if let Some(entry) = entries.get(key) {
            if let Some(value) = entry.response.borrow().as_ref() {
                return Role::Cached(value.clone());
            }
            if entry.response.has_changed().is_ok() {
                return Role::Waiter(entry.response.clone());
            }
            // Owner went away without answering.
        }

        let (tx, rx) = watch::channel(None);
        entries.insert(
            key.clone(),
            Entry {
                created_at: Instant::now(),
                response: rx,
            },
        );
        Role::Owner(tx)
    }

    pub async fn get_or_compute<F, Fut>(&self, key: K, compute: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        let mut compute = Some(compute);
        loop {
            match self.claim(&key) {
                Role::Cached(value) => return Ok(value),
                Role::Waiter(mut response) => {
                    if let Ok(value) = response.wait_for(Option::is_some).await {
                        if let Some(value) = value.as_ref() {
                            return Ok(value.clone());
                        }
                    }
                    debug!("Shared request failed, retrying");
                }
                Role::Owner(tx) => {
                    let compute = compute.take().ok_or_else(|| {
                        CoordinatorError::Transaction("request computed twice".into())
                    })?;
                    let result = match tokio::time::timeout(self.request_timeout, compute()).await
                    {
                        Ok(result) => result,
                        Err(_) => {
                            warn!("Dead-lock prevention timeout kicked in");
                            Err(CoordinatorError::Timeout(
                                "dead-lock prevention timeout kicked in".into(),
                            ))
                        }
                    };

                    match &result {
                        Ok(value) => {
                            tx.send_replace(Some(value.clone()));
                        }
                        Err(_) => {
                            self.entries.lock().remove(&key);
                        }
                    }
                    return result;
                }
            }
        }
    }

    pub fn remove(&self, key: &K) {
        self.entries.lock().remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> Default for IdempotencyCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
