//! Selection policy (C4): orders the proxy list per request.

use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;
use serde::Deserialize;

/// Which order to try proxies in. `RoundRobin`'s counter is shared across
/// calls and advances atomically, matching the round-robin fairness
/// invariant (§8 property 7).
#[derive(Debug)]
pub(crate) enum SelectionPolicy {
    Random,
    RoundRobin { counter: AtomicUsize },
}

/// The config-file representation; the live counter is constructed fresh
/// when the policy is built from config.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub(crate) enum SelectionPolicyConfig {
    #[default]
    Random,
    RoundRobin,
}

impl From<SelectionPolicyConfig> for SelectionPolicy {
    fn from(config: SelectionPolicyConfig) -> Self {
        match config {
            SelectionPolicyConfig::Random => SelectionPolicy::Random,
            SelectionPolicyConfig::RoundRobin => SelectionPolicy::RoundRobin {
                counter: AtomicUsize::new(0),
            },
        }
    }
}

impl SelectionPolicy {
    /// Returns an ordered list of indices into the proxy list of length `len`.
    pub(crate) fn list(&self, len: usize) -> Vec<usize> {
        if len == 0 {
            return Vec::new();
        }

        match self {
            SelectionPolicy::Random => {
                let mut order: Vec<usize> = (0..len).collect();

                match len {
                    1 => {}
                    2 => {
                        if rand::thread_rng().gen_bool(0.5) {
                            order.swap(0, 1);
                        }
                    }
                    _ => {
                        let mut rng = rand::thread_rng();
                        for i in (1..order.len()).rev() {
                            let j = rng.gen_range(0..=i);
                            order.swap(i, j);
                        }
                    }
                }

                order
            }
            SelectionPolicy::RoundRobin { counter } => {
                let head = counter.fetch_add(1, Ordering::Relaxed) % len;
                (0..len).map(|i| (head + i) % len).collect()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_single_element_is_identity() {
        let policy = SelectionPolicy::Random;
        assert_eq!(policy.list(1), vec![0]);
    }

    #[test]
    fn round_robin_advances_head_each_call() {
        let policy: SelectionPolicy = SelectionPolicyConfig::RoundRobin.into();
        assert_eq!(policy.list(3), vec![0, 1, 2]);
        assert_eq!(policy.list(3), vec![1, 2, 0]);
        assert_eq!(policy.list(3), vec![2, 0, 1]);
        assert_eq!(policy.list(3), vec![0, 1, 2]);
    }

    #[test]
    fn round_robin_fairness_over_many_calls() {
        let policy: SelectionPolicy = SelectionPolicyConfig::RoundRobin.into();
        let n = 4;
        let m = 37;
        let mut head_counts = vec![0usize; n];

        for _ in 0..m {
            let order = policy.list(n);
            head_counts[order[0]] += 1;
        }

        let lo = m / n;
        let hi = (m + n - 1) / n;
        for count in head_counts {
            assert!(count == lo || count == hi, "count {count} out of range [{lo}, {hi}]");
        }
    }

    #[test]
    fn empty_list_is_empty() {
        let policy = SelectionPolicy::Random;
        assert!(policy.list(0).is_empty());
    }
}
