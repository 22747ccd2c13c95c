//! Keyed-config reconciliation: turn "what is configured now" and "what
//! should be configured" into the add / remove / update steps between them.

use std::collections::BTreeMap;

/// One step from the previous config set toward the desired one.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigChange<V> {
    Add { key: String, value: V },
    Remove { key: String },
    Update { key: String, value: V },
}

impl<V> ConfigChange<V> {
    pub fn key(&self) -> &str {
        match self {
            Self::Add { key, .. } | Self::Remove { key } | Self::Update { key, .. } => key,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Add { .. } => "add",
            Self::Remove { .. } => "remove",
            Self::Update { .. } => "update",
        }
    }
}

/// Compute the changes that take `previous` to `desired`.
///
/// Keys only in `previous` are removed, keys only in `desired` are added, and
/// keys in both whose values differ are updated. Equal values produce nothing.
/// Removals come first, then adds and updates in key order.
pub fn diff<V>(previous: &BTreeMap<String, V>, desired: &BTreeMap<String, V>) -> Vec<ConfigChange<V>>
where
    V: PartialEq + Clone,
{
    let mut changes: Vec<ConfigChange<V>> = previous
        .keys()
        .filter(|key| !desired.contains_key(*key))
        .map(|key| ConfigChange::Remove { key: key.clone() })
        .collect();

    for (key, value) in desired {
        match previous.get(key) {
            None => changes.push(ConfigChange::Add {
                key: key.clone(),
                value: value.clone(),
            }),
            Some(current) if current != value => changes.push(ConfigChange::Update {
                key: key.clone(),
                value: value.clone(),
            }),
            Some(_) => {}
        }
    }
    changes
}

/// Apply changes to a plain map.
pub fn apply<V: Clone>(target: &mut BTreeMap<String, V>, changes: &[ConfigChange<V>]) {
    for change in changes {
        match change {
            ConfigChange::Add { key, value } | ConfigChange::Update { key, value } => {
                target.insert(key.clone(), value.clone());
            }
            ConfigChange::Remove { key } => {
                target.remove(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn map(entries: &[(&str, i32)]) -> BTreeMap<String, i32> {
        entries.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_diff_partitions_keys() {
        let previous = map(&[("a", 1), ("b", 2), ("c", 3)]);
        let desired = map(&[("b", 2), ("c", 30), ("d", 4)]);

        let changes = diff(&previous, &desired);
        assert_eq!(
            changes,
            vec![
                ConfigChange::Remove { key: "a".into() },
                ConfigChange::Update {
                    key: "c".into(),
                    value: 30
                },
                ConfigChange::Add {
                    key: "d".into(),
                    value: 4
                },
            ]
        );
    }

    #[test]
    fn test_diff_of_equal_maps_is_empty() {
        let m = map(&[("a", 1), ("b", 2)]);
        assert!(diff(&m, &m).is_empty());
        assert!(diff(&BTreeMap::<String, i32>::new(), &BTreeMap::new()).is_empty());
    }

    #[test]
    fn test_change_accessors() {
        let change: ConfigChange<i32> = ConfigChange::Remove { key: "x".into() };
        assert_eq!(change.key(), "x");
        assert_eq!(change.kind(), "remove");
    }

    /// Deterministic linear congruential generator.
    struct Lcg(u64);

    impl Lcg {
        fn next(&mut self, bound: u64) -> u64 {
            self.0 = self
                .0
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            (self.0 >> 33) % bound
        }

        fn map(&mut self) -> BTreeMap<String, i32> {
            (0..self.next(8))
                .map(|_| (format!("k{}", self.next(10)), self.next(3) as i32))
                .collect()
        }
    }

    #[test]
    fn test_diff_apply_properties_hold_for_random_maps() {
        let mut rng = Lcg(7);
        for _ in 0..500 {
            let previous = rng.map();
            let desired = rng.map();
            let changes = diff(&previous, &desired);

            // Each key appears at most once, in the right bucket.
            let mut seen = BTreeSet::new();
            for change in &changes {
                assert!(seen.insert(change.key().to_string()));
                match change {
                    ConfigChange::Remove { key } => {
                        assert!(previous.contains_key(key) && !desired.contains_key(key))
                    }
                    ConfigChange::Add { key, .. } => {
                        assert!(!previous.contains_key(key) && desired.contains_key(key))
                    }
                    ConfigChange::Update { key, value } => {
                        assert_ne!(previous.get(key), Some(value));
                        assert_eq!(desired.get(key), Some(value));
                    }
                }
            }

            let mut reconciled = previous.clone();
            apply(&mut reconciled, &changes);
            assert_eq!(reconciled, desired);
            assert!(diff(&reconciled, &desired).is_empty());
        }
    }
}
