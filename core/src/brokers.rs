//! Order-independent comparison of broker address lists

use std::collections::BTreeSet;
use std::fmt;

/// A duplicate-free, unordered set of `host:port` broker addresses.
///
/// Two broker lists name the same cluster membership iff their sets are
/// equal; ordering and repeated entries never trigger a pool rebuild.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerSet {
    addrs: BTreeSet<String>,
}

impl BrokerSet {
    pub fn new<I, S>(addrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            addrs: addrs
                .into_iter()
                .map(|a| a.as_ref().trim().to_string())
                .filter(|a| !a.is_empty())
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn contains(&self, addr: &str) -> bool {
        self.addrs.contains(addr)
    }
}

impl<S: AsRef<str>> FromIterator<S> for BrokerSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self::new(iter)
    }
}

impl fmt::Display for BrokerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let addrs: Vec<&str> = self.addrs.iter().map(String::as_str).collect();
        write!(f, "[{}]", addrs.join(","))
    }
}

/// Check whether two broker lists describe the same set of brokers
pub fn same_brokers<A, B>(old: &[A], new: &[B]) -> bool
where
    A: AsRef<str>,
    B: AsRef<str>,
{
    BrokerSet::new(old) == BrokerSet::new(new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_order_and_duplicates_are_ignored() {
        assert!(same_brokers(
            &["10.0.0.1:9092", "10.0.0.2:9092"],
            &["10.0.0.2:9092", "10.0.0.1:9092", "10.0.0.2:9092"],
        ));
        assert!(!same_brokers(&["10.0.0.1:9092"], &["10.0.0.2:9092"]));
        assert!(!same_brokers(
            &["10.0.0.1:9092"],
            &["10.0.0.1:9092", "10.0.0.2:9092"]
        ));
    }

    #[test]
    fn test_blank_entries_are_dropped() {
        let set = BrokerSet::new(["", " 10.0.0.1:9092 ", "  "]);
        assert_eq!(set.len(), 1);
        assert!(set.contains("10.0.0.1:9092"));
        assert_eq!(set.to_string(), "[10.0.0.1:9092]");
    }

    #[test]
    fn test_empty_sets() {
        let empty: [&str; 0] = [];
        assert!(same_brokers(&empty, &empty));
        assert!(BrokerSet::new(empty).is_empty());
        assert!(!same_brokers(&empty, &["10.0.0.1:9092"]));
    }

    proptest! {
        #[test]
        fn prop_permutation_is_same_set(
            addrs in proptest::collection::vec("[a-z]{1,8}:[0-9]{2,5}", 0..12),
            seed in any::<u64>(),
        ) {
            let mut shuffled = addrs.clone();
            // deterministic rotation plus a reversal is enough to reorder
            if !shuffled.is_empty() {
                let len = shuffled.len();
                shuffled.rotate_left((seed as usize) % len);
            }
            shuffled.reverse();
            shuffled.extend(addrs.iter().take(2).cloned());

            prop_assert!(same_brokers(&addrs, &shuffled));
        }

        #[test]
        fn prop_extra_broker_changes_set(
            addrs in proptest::collection::vec("[a-z]{1,8}:[0-9]{2,5}", 0..12),
        ) {
            let mut grown = addrs.clone();
            grown.push("extra-broker:1".to_string());

            prop_assert!(!same_brokers(&addrs, &grown));
        }
    }
}
