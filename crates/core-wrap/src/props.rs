//! Ordered variable property map with priority-suffixed bulk application.
//!
//! Keys in a bulk set may carry a `:high`, `:med`, or `:low` suffix. The
//! suffix controls application order, not storage: `high` entries apply
//! first, then `med` and unsuffixed entries, then `low`, each group in
//! insertion order, so within a priority the last write wins. Stored keys
//! are always suffix-free.

/// Application rank of a property key. Unsuffixed keys share the middle
/// rank with `:med`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Rank {
    High,
    Med,
    Low,
}

fn split_suffix(key: &str) -> (&str, Rank) {
    match key.rsplit_once(':') {
        Some((base, "high")) => (base, Rank::High),
        Some((base, "med")) => (base, Rank::Med),
        Some((base, "low")) => (base, Rank::Low),
        _ => (key, Rank::Med),
    }
}

/// Declaration-ordered string map. Small by construction (a handful of
/// attributes per variable), so storage is a plain vector.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Props {
    entries: Vec<(String, String)>,
}

impl Props {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Set a single property. A priority suffix on the key is stripped;
    /// for a single set the priority has no observable effect.
    pub fn set(&mut self, key: &str, value: impl Into<String>) -> bool {
        let (base, _) = split_suffix(key);
        let value = value.into();
        if let Some(slot) = self.entries.iter_mut().find(|(k, _)| k == base) {
            if slot.1 == value {
                return false;
            }
            slot.1 = value;
            true
        } else {
            self.entries.push((base.to_string(), value));
            true
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let idx = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(idx).1)
    }

    /// Apply a bulk set in priority order (`:high`, then `:med` and
    /// unsuffixed, then `:low`; insertion order within a group). Returns the
    /// base names of properties whose stored value actually changed.
    pub fn apply_bulk<'a, I>(&mut self, entries: I) -> Vec<String>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut staged: Vec<(Rank, &str, &str)> = entries
            .into_iter()
            .map(|(k, v)| {
                let (base, rank) = split_suffix(k);
                (rank, base, v)
            })
            .collect();
        // Stable: preserves insertion order within a rank.
        staged.sort_by_key(|(rank, _, _)| *rank);

        let mut changed = Vec::new();
        for (_, base, value) in staged {
            if self.set(base, value) && !changed.iter().any(|c| c == base) {
                changed.push(base.to_string());
            }
        }
        changed
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bulk_apply_orders_high_med_low() {
        let mut props = Props::new();
        let changed = props.apply_bulk(vec![
            ("ns:low", "from-low"),
            ("ns:high", "from-high"),
            ("other", "x"),
        ]);
        // high applies first, low last: low wins the final stored value.
        assert_eq!(props.get("ns"), Some("from-low"));
        assert_eq!(changed, vec!["ns".to_string(), "other".to_string()]);
    }

    #[test]
    fn last_wins_within_same_priority() {
        let mut props = Props::new();
        props.apply_bulk(vec![("ns:med", "first"), ("ns:med", "second")]);
        assert_eq!(props.get("ns"), Some("second"));
    }

    #[test]
    fn unsuffixed_shares_med_rank() {
        let mut props = Props::new();
        props.apply_bulk(vec![("ns", "plain"), ("ns:low", "low")]);
        assert_eq!(props.get("ns"), Some("low"));
        props.apply_bulk(vec![("ns:high", "high"), ("ns", "plain")]);
        assert_eq!(props.get("ns"), Some("plain"));
    }

    #[test]
    fn set_reports_real_changes_only() {
        let mut props = Props::new();
        assert!(props.set("type", "Contact"));
        assert!(!props.set("type", "Contact"));
        assert!(props.set("type", "Person"));
    }

    #[test]
    fn suffix_stripped_on_single_set() {
        let mut props = Props::new();
        props.set("fallbackNamespace:high", "list-item");
        assert_eq!(props.get("fallbackNamespace"), Some("list-item"));
        assert!(props.get("fallbackNamespace:high").is_none());
    }
}
