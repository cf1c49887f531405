//! In-memory Redis stand-in for tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;

use crate::backend::driver::DriverError;

use super::redis::RedisCommands;

#[derive(Default)]
pub(crate) struct MockRedis {
    data: Mutex<HashMap<String, Vec<u8>>>,
    sets: Mutex<HashMap<String, HashSet<String>>>,
    failing: AtomicBool,
}

impl MockRedis {
    pub fn contains(&self, key: &str) -> bool {
        self.data.lock().contains_key(key) || self.sets.lock().contains_key(key)
    }

    pub fn raw(&self, key: &str) -> Option<Vec<u8>> {
        self.data.lock().get(key).cloned()
    }

    /// Simulate a lost connection.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), DriverError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(DriverError::new("connection reset"))
        } else {
            Ok(())
        }
    }

    fn glob(pattern: &str) -> Regex {
        let mut regex = String::from("^");
        for c in pattern.chars() {
            match c {
                '*' => regex.push_str(".*"),
                '?' => regex.push('.'),
                c => regex.push_str(&regex::escape(&c.to_string())),
            }
        }
        regex.push('$');
        Regex::new(&regex).unwrap()
    }
}

#[async_trait]
impl RedisCommands for MockRedis {
    async fn set(
        &self,
        key: &str,
        value: &[u8],
        _ttl: Option<Duration>,
    ) -> Result<(), DriverError> {
        self.check()?;
        self.data.lock().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, DriverError> {
        self.check()?;
        Ok(self.data.lock().get(key).cloned())
    }

    async fn del(&self, keys: &[String]) -> Result<usize, DriverError> {
        self.check()?;
        let mut data = self.data.lock();
        let mut sets = self.sets.lock();
        let mut deleted = 0;

        for key in keys {
            if data.remove(key).is_some() || sets.remove(key).is_some() {
                deleted += 1;
            }
        }

        Ok(deleted)
    }

    async fn exists(&self, key: &str) -> Result<bool, DriverError> {
        self.check()?;
        Ok(self.data.lock().contains_key(key))
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, DriverError> {
        self.check()?;
        Ok(self
            .sets
            .lock()
            .get(key)
            .map(|set| {
                let mut members: Vec<String> = set.iter().cloned().collect();
                members.sort();
                members
            })
            .unwrap_or_default())
    }

    async fn sadd(&self, key: &str, members: &[String]) -> Result<(), DriverError> {
        self.check()?;
        self.sets
            .lock()
            .entry(key.to_string())
            .or_default()
            .extend(members.iter().cloned());
        Ok(())
    }

    async fn expire(&self, _key: &str, _ttl: Duration) -> Result<(), DriverError> {
        self.check()
    }

    async fn ping(&self) -> Result<(), DriverError> {
        self.check()
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, DriverError> {
        self.check()?;
        let regex = Self::glob(pattern);

        let mut keys: Vec<String> = self.data.lock().keys().cloned().collect();
        keys.extend(self.sets.lock().keys().cloned());
        keys.retain(|key| regex.is_match(key));
        keys.sort();
        keys.dedup();

        Ok(keys)
    }
}
