//! Longest-prefix URL matching for authorization policies.

use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;

use crate::types::AuthorizationPolicy;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("url prefix already registered: {0}")]
pub struct DuplicatePrefix(pub String);

/// Dictionary keyed by URL prefix, answering longest-prefix queries.
///
/// Entries live in insertion order. A byte-sorted permutation of them backs a
/// binary-search fast path; additions invalidate it and the next lookup that
/// can take the write lock without waiting rebuilds it. Until then lookups
/// scan linearly, so a stale index is slower but never wrong.
#[derive(Debug)]
pub struct UrlPrefixTable<V> {
    entries: Vec<(String, V)>,
    sorted: RwLock<Option<Arc<Vec<usize>>>>,
}

impl<V> Default for UrlPrefixTable<V> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            sorted: RwLock::new(None),
        }
    }
}

impl<V> UrlPrefixTable<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Register a prefix. Duplicate prefixes are rejected.
    pub fn add(&mut self, prefix: impl Into<String>, value: V) -> Result<(), DuplicatePrefix> {
        let prefix = prefix.into();
        if self.entries.iter().any(|(p, _)| *p == prefix) {
            return Err(DuplicatePrefix(prefix));
        }
        self.entries.push((prefix, value));
        *self.sorted.get_mut() = None;
        Ok(())
    }

    /// Register several prefixes, then rebuild the sorted index once.
    pub fn extend<I, S>(&mut self, items: I) -> Result<(), DuplicatePrefix>
    where
        I: IntoIterator<Item = (S, V)>,
        S: Into<String>,
    {
        for (prefix, value) in items {
            self.add(prefix, value)?;
        }
        self.rebuild_index();
        Ok(())
    }

    /// Rebuild the sorted fast-path index.
    pub fn rebuild_index(&self) {
        let order = self.sorted_order();
        *self.sorted.write() = Some(Arc::new(order));
    }

    pub fn is_index_current(&self) -> bool {
        self.sorted.read().is_some()
    }

    /// Value of the longest registered prefix of `candidate`.
    pub fn find(&self, candidate: &str) -> Option<&V> {
        self.find_entry(candidate).map(|(_, v)| v)
    }

    /// Longest registered prefix of `candidate` together with its value.
    pub fn find_entry(&self, candidate: &str) -> Option<(&str, &V)> {
        let index = self.sorted.read().clone();
        let index = match index {
            Some(index) => index,
            None => {
                if let Some(mut guard) = self.sorted.try_write() {
                    if guard.is_none() {
                        *guard = Some(Arc::new(self.sorted_order()));
                    }
                }
                return self.scan(candidate);
            }
        };

        let position = self.search(&index, candidate.as_bytes())?;
        self.entries
            .get(position)
            .map(|(prefix, value)| (prefix.as_str(), value))
    }

    fn sorted_order(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.entries.len()).collect();
        order.sort_by(|a, b| self.entries[*a].0.as_bytes().cmp(self.entries[*b].0.as_bytes()));
        order
    }

    fn scan(&self, candidate: &str) -> Option<(&str, &V)> {
        self.entries
            .iter()
            .filter(|(prefix, _)| candidate.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(prefix, value)| (prefix.as_str(), value))
    }

    /// Every prefix of the candidate sorts at or before it, and among those
    /// the greatest is the longest. Starting from the predecessor of the
    /// candidate, a non-prefix hit shrinks the target to the common prefix
    /// and searches again, so each step strictly shortens the target.
    fn search(&self, order: &[usize], candidate: &[u8]) -> Option<usize> {
        let mut target = candidate;
        loop {
            let upper = order.partition_point(|&i| self.entries[i].0.as_bytes() <= target);
            if upper == 0 {
                return None;
            }
            let position = order[upper - 1];
            let prefix = self.entries[position].0.as_bytes();
            if target.starts_with(prefix) {
                return Some(position);
            }

            let common = prefix
                .iter()
                .zip(target.iter())
                .take_while(|(a, b)| a == b)
                .count();
            if common == 0 {
                // Only an empty prefix could still match.
                return order
                    .iter()
                    .copied()
                    .find(|&i| self.entries[i].0.is_empty());
            }
            target = &target[..common];
        }
    }
}

/// Outcome of an authorization check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorizationDecision<'a> {
    Allowed(&'a AuthorizationPolicy),
    /// No policy, or the source address is not permitted. The two cases are
    /// not distinguished on purpose.
    Denied,
}

/// URL authorization rules for schedule and cancel requests.
#[derive(Debug, Default)]
pub struct AuthorizationTable {
    prefixes: UrlPrefixTable<AuthorizationPolicy>,
}

impl AuthorizationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_policies<I>(policies: I) -> Result<Self, DuplicatePrefix>
    where
        I: IntoIterator<Item = AuthorizationPolicy>,
    {
        let mut table = Self::new();
        table
            .prefixes
            .extend(policies.into_iter().map(|p| (p.url_prefix.clone(), p)))?;
        Ok(table)
    }

    pub fn add(&mut self, policy: AuthorizationPolicy) -> Result<(), DuplicatePrefix> {
        self.prefixes.add(policy.url_prefix.clone(), policy)
    }

    pub fn len(&self) -> usize {
        self.prefixes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prefixes.is_empty()
    }

    /// The policy of the longest configured prefix of `url`.
    pub fn policy_for(&self, url: &str) -> Option<&AuthorizationPolicy> {
        self.prefixes.find(url)
    }

    pub fn authorize(&self, url: &str, source: IpAddr) -> AuthorizationDecision<'_> {
        match self.policy_for(url) {
            Some(policy) if policy.permits(source) => AuthorizationDecision::Allowed(policy),
            _ => AuthorizationDecision::Denied,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::IpNetwork;

    fn table(prefixes: &[&str]) -> UrlPrefixTable<usize> {
        let mut table = UrlPrefixTable::new();
        for (i, p) in prefixes.iter().enumerate() {
            table.add(*p, i).unwrap();
        }
        table
    }

    #[test]
    fn longest_prefix_wins() {
        let t = table(&["http://a.com/", "http://a.com/x/"]);
        t.rebuild_index();
        assert_eq!(t.find("http://a.com/x/y"), Some(&1));
        assert_eq!(t.find("http://a.com/xz"), Some(&0));
        assert_eq!(t.find("http://a.com/"), Some(&0));
        assert_eq!(t.find("http://b.com/x/y"), None);
    }

    #[test]
    fn duplicate_prefix_is_rejected() {
        let mut t = table(&["http://a.com/"]);
        assert_eq!(
            t.add("http://a.com/", 9),
            Err(DuplicatePrefix("http://a.com/".into()))
        );
    }

    #[test]
    fn stale_and_current_index_agree() {
        let prefixes = [
            "http://a.com/",
            "http://a.com/api/",
            "http://a.com/api/v2/",
            "http://a.com/apz",
            "https://a.com/",
            "http://b.com/hooks/",
            "http://b.com/hooks/orders",
        ];
        let candidates = [
            "http://a.com/api/v2/orders",
            "http://a.com/api/v1/orders",
            "http://a.com/apzz",
            "http://a.com/ap",
            "http://a.com",
            "https://a.com/x",
            "http://b.com/hooks/orders/7",
            "http://b.com/hooks/order",
            "http://b.com/other",
            "ftp://a.com/",
        ];

        let stale = table(&prefixes);
        let current = table(&prefixes);
        current.rebuild_index();
        assert!(current.is_index_current());

        for candidate in candidates {
            assert_eq!(stale.scan(candidate).map(|(p, _)| p), current.find_entry(candidate).map(|(p, _)| p), "{candidate}");
        }
    }

    #[test]
    fn additions_invalidate_the_index() {
        let mut t = table(&["http://a.com/"]);
        t.rebuild_index();
        t.add("http://a.com/deep/", 1).unwrap();
        assert!(!t.is_index_current());
        assert_eq!(t.find("http://a.com/deep/x"), Some(&1));
        // the lookup above rebuilt the index opportunistically
        assert!(t.is_index_current());
        assert_eq!(t.find("http://a.com/deep/x"), Some(&1));
    }

    #[test]
    fn empty_prefix_matches_everything() {
        let t = table(&["", "http://a.com/"]);
        t.rebuild_index();
        assert_eq!(t.find("zzz"), Some(&0));
        assert_eq!(t.find("http://a.com/q"), Some(&1));
    }

    #[test]
    fn denied_is_the_same_for_missing_policy_and_excluded_source() {
        let table = AuthorizationTable::from_policies([
            AuthorizationPolicy::new("http://open.test/").with_retry_count(2),
            AuthorizationPolicy::new("http://closed.test/")
                .allow_from(IpNetwork::parse("10.0.0.0/8").unwrap()),
        ])
        .unwrap();

        let local: IpAddr = "127.0.0.1".parse().unwrap();
        match table.authorize("http://open.test/cb", local) {
            AuthorizationDecision::Allowed(policy) => assert_eq!(policy.retry_count, 2),
            AuthorizationDecision::Denied => panic!("open policy denied"),
        }
        assert_eq!(table.authorize("http://closed.test/cb", local), AuthorizationDecision::Denied);
        assert_eq!(table.authorize("http://none.test/cb", local), AuthorizationDecision::Denied);
        assert!(matches!(
            table.authorize("http://closed.test/cb", "10.2.3.4".parse().unwrap()),
            AuthorizationDecision::Allowed(_)
        ));
    }
}
