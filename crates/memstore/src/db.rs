//! Keyspace: lists and strings with millisecond expiry
//!
//! Lists use VecDeque for O(1) head/tail operations. Expired strings are
//! removed lazily on access.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use bytes::Bytes;

/// PTTL reply for a missing key
pub const PTTL_NO_KEY: i64 = -2;
/// PTTL reply for a key without expiry
pub const PTTL_NO_EXPIRY: i64 = -1;

#[derive(Debug)]
struct StringEntry {
    value: Bytes,
    expires_at: Option<Instant>,
}

impl StringEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

/// Key type conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WrongType;

#[derive(Debug, Default)]
pub struct Db {
    lists: HashMap<Bytes, VecDeque<Bytes>>,
    strings: HashMap<Bytes, StringEntry>,
}

impl Db {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop `key` from strings if it has expired
    fn expire_if_needed(&mut self, key: &[u8]) {
        let now = Instant::now();
        if self
            .strings
            .get(key)
            .map(|e| e.is_expired(now))
            .unwrap_or(false)
        {
            self.strings.remove(key);
        }
    }

    /// SET with optional time to live
    pub fn set(&mut self, key: Bytes, value: Bytes, ttl: Option<Duration>) {
        self.lists.remove(&key);
        self.strings.insert(
            key,
            StringEntry {
                value,
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
    }

    pub fn get(&mut self, key: &[u8]) -> Result<Option<Bytes>, WrongType> {
        self.expire_if_needed(key);
        if self.lists.contains_key(key) {
            return Err(WrongType);
        }
        Ok(self.strings.get(key).map(|e| e.value.clone()))
    }

    pub fn exists(&mut self, key: &[u8]) -> bool {
        self.expire_if_needed(key);
        self.strings.contains_key(key) || self.lists.contains_key(key)
    }

    /// DEL: returns whether the key existed
    pub fn del(&mut self, key: &[u8]) -> bool {
        self.expire_if_needed(key);
        self.strings.remove(key).is_some() | self.lists.remove(key).is_some()
    }

    /// Remaining time to live in milliseconds
    pub fn pttl(&mut self, key: &[u8]) -> i64 {
        self.expire_if_needed(key);
        if self.lists.contains_key(key) {
            return PTTL_NO_EXPIRY;
        }
        match self.strings.get(key) {
            None => PTTL_NO_KEY,
            Some(StringEntry {
                expires_at: None, ..
            }) => PTTL_NO_EXPIRY,
            Some(StringEntry {
                expires_at: Some(at),
                ..
            }) => at.saturating_duration_since(Instant::now()).as_millis() as i64,
        }
    }

    /// LPUSH: insert at head, returns new length
    pub fn lpush(&mut self, key: Bytes, values: Vec<Bytes>) -> Result<usize, WrongType> {
        self.push(key, values, true)
    }

    /// RPUSH: insert at tail, returns new length
    pub fn rpush(&mut self, key: Bytes, values: Vec<Bytes>) -> Result<usize, WrongType> {
        self.push(key, values, false)
    }

    fn push(&mut self, key: Bytes, values: Vec<Bytes>, head: bool) -> Result<usize, WrongType> {
        self.expire_if_needed(&key);
        if self.strings.contains_key(&key) {
            return Err(WrongType);
        }
        let list = self.lists.entry(key).or_default();
        for value in values {
            if head {
                list.push_front(value);
            } else {
                list.push_back(value);
            }
        }
        Ok(list.len())
    }

    pub fn llen(&self, key: &[u8]) -> usize {
        self.lists.get(key).map(VecDeque::len).unwrap_or(0)
    }

    /// Pop from the tail of the first non-empty list among `keys`
    pub fn rpop_first(&mut self, keys: &[Bytes]) -> Option<(Bytes, Bytes)> {
        for key in keys {
            if let Some(list) = self.lists.get_mut(key) {
                if let Some(value) = list.pop_back() {
                    if list.is_empty() {
                        self.lists.remove(key);
                    }
                    return Some((key.clone(), value));
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn test_push_pop_is_fifo() {
        let mut db = Db::new();
        db.lpush(b("q"), vec![b("1")]).unwrap();
        db.lpush(b("q"), vec![b("2")]).unwrap();
        assert_eq!(db.rpop_first(&[b("q")]), Some((b("q"), b("1"))));
        assert_eq!(db.rpop_first(&[b("q")]), Some((b("q"), b("2"))));
        assert_eq!(db.rpop_first(&[b("q")]), None);
        assert_eq!(db.llen(b"q"), 0);
    }

    #[test]
    fn test_rpop_first_key_order() {
        let mut db = Db::new();
        db.rpush(b("b"), vec![b("x")]).unwrap();
        db.rpush(b("c"), vec![b("y")]).unwrap();
        let popped = db.rpop_first(&[b("a"), b("c"), b("b")]);
        assert_eq!(popped, Some((b("c"), b("y"))));
    }

    #[test]
    fn test_pttl() {
        let mut db = Db::new();
        assert_eq!(db.pttl(b"k"), PTTL_NO_KEY);
        db.set(b("k"), b("v"), None);
        assert_eq!(db.pttl(b"k"), PTTL_NO_EXPIRY);
        db.set(b("k"), b("v"), Some(Duration::from_secs(5)));
        let ttl = db.pttl(b"k");
        assert!(ttl > 4000 && ttl <= 5000, "ttl = {}", ttl);
    }

    #[test]
    fn test_expired_key_is_gone() {
        let mut db = Db::new();
        db.set(b("k"), b("v"), Some(Duration::from_millis(0)));
        assert_eq!(db.pttl(b"k"), PTTL_NO_KEY);
        assert!(!db.exists(b"k"));
        assert!(!db.del(b"k"));
    }

    #[test]
    fn test_wrong_type() {
        let mut db = Db::new();
        db.set(b("k"), b("v"), None);
        assert_eq!(db.lpush(b("k"), vec![b("x")]), Err(WrongType));
        db.rpush(b("l"), vec![b("x")]).unwrap();
        assert_eq!(db.get(b"l"), Err(WrongType));
    }
}
