use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use crate::auth::Auth;
use crate::thinking;

use super::{AuthSelector, ModelCooldownError, usable_candidates};

/// Upper bound on live cursor keys; per-user model aliases can otherwise
/// grow the map without limit.
pub const DEFAULT_MAX_CURSOR_KEYS: usize = 1024;

#[derive(Debug, Default)]
struct CursorState {
    flat: u64,
    parent: u64,
    per_parent: HashMap<String, u64>,
}

#[derive(Debug, Default)]
struct CursorMap {
    entries: HashMap<String, CursorState>,
    // Keys in least-recently-used order, front = oldest.
    order: VecDeque<String>,
}

impl CursorMap {
    fn touch(&mut self, key: &str, max_keys: usize) -> &mut CursorState {
        if self.entries.contains_key(key) {
            if let Some(pos) = self.order.iter().position(|entry| entry == key) {
                self.order.remove(pos);
            }
            self.order.push_back(key.to_string());
        } else {
            while self.entries.len() >= max_keys.max(1) {
                match self.order.pop_front() {
                    Some(oldest) => {
                        self.entries.remove(&oldest);
                    }
                    None => break,
                }
            }
            self.entries.insert(key.to_string(), CursorState::default());
            self.order.push_back(key.to_string());
        }
        self.entries.get_mut(key).expect("cursor entry just ensured")
    }
}

/// Rotating selector with a cursor per `provider:baseModel` key.
///
/// When every surviving candidate belongs to a virtual-parent group and at
/// least two distinct parents exist, selection runs two-level: an outer
/// cursor alternates over parents (sorted by name) and an inner cursor per
/// parent rotates over that parent's auths. Anything else rotates flat.
#[derive(Debug)]
pub struct RoundRobinSelector {
    max_keys: usize,
    cursors: Mutex<CursorMap>,
}

impl Default for RoundRobinSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl RoundRobinSelector {
    pub fn new() -> Self {
        Self::with_max_keys(DEFAULT_MAX_CURSOR_KEYS)
    }

    pub fn with_max_keys(max_keys: usize) -> Self {
        Self {
            max_keys: max_keys.max(1),
            cursors: Mutex::new(CursorMap::default()),
        }
    }

    #[cfg(test)]
    pub(crate) fn cursor_len(&self) -> usize {
        self.lock_cursors().entries.len()
    }

    #[cfg(test)]
    pub(crate) fn has_cursor(&self, key: &str) -> bool {
        self.lock_cursors().entries.contains_key(key)
    }

    fn lock_cursors(&self) -> std::sync::MutexGuard<'_, CursorMap> {
        // A poisoned cursor map only loses rotation fairness; recover it.
        self.cursors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl AuthSelector for RoundRobinSelector {
    fn name(&self) -> &'static str {
        "round-robin"
    }

    fn pick(
        &self,
        provider: &str,
        model: &str,
        auths: &[Arc<Auth>],
    ) -> Result<Arc<Auth>, ModelCooldownError> {
        let candidates = usable_candidates(provider, model, auths, SystemTime::now())?;
        let key = cursor_key(provider, model);

        let mut cursors = self.lock_cursors();
        let state = cursors.touch(&key, self.max_keys);

        if let Some(groups) = group_by_virtual_parent(&candidates) {
            let parents: Vec<&String> = groups.keys().collect();
            let parent_idx = (state.parent as usize) % parents.len();
            state.parent = parent_idx as u64 + 1;
            let parent = parents[parent_idx];
            let members = &groups[parent];
            let inner = state.per_parent.entry(parent.clone()).or_insert(0);
            let member_idx = (*inner as usize) % members.len();
            *inner = member_idx as u64 + 1;
            return Ok(members[member_idx].clone());
        }

        let idx = (state.flat as usize) % candidates.len();
        state.flat = idx as u64 + 1;
        Ok(candidates[idx].clone())
    }
}

/// Cursor keys use the base model so `m(high)` and `m(low)` share rotation.
fn cursor_key(provider: &str, model: &str) -> String {
    format!("{provider}:{}", thinking::base_model(model))
}

/// Returns parent-name → members when two-level grouping applies: every
/// candidate must carry the attribute and at least two parents must exist.
/// Mixed virtual/non-virtual sets fall back to flat rotation.
fn group_by_virtual_parent(
    candidates: &[Arc<Auth>],
) -> Option<BTreeMap<String, Vec<Arc<Auth>>>> {
    let mut groups: BTreeMap<String, Vec<Arc<Auth>>> = BTreeMap::new();
    for auth in candidates {
        let parent = auth.virtual_parent()?;
        groups
            .entry(parent.to_string())
            .or_default()
            .push(auth.clone());
    }
    if groups.len() < 2 {
        return None;
    }
    Some(groups)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_key_strips_thinking_suffix() {
        assert_eq!(cursor_key("qwen", "m(high)"), "qwen:m");
        assert_eq!(cursor_key("qwen", "m"), "qwen:m");
    }

    #[test]
    fn cursor_map_evicts_oldest_at_capacity() {
        let mut map = CursorMap::default();
        map.touch("a", 2);
        map.touch("b", 2);
        map.touch("c", 2);
        assert_eq!(map.entries.len(), 2);
        assert!(!map.entries.contains_key("a"));
        assert!(map.entries.contains_key("b"));
        assert!(map.entries.contains_key("c"));
    }

    #[test]
    fn cursor_cap_bounds_live_keys() {
        let selector = RoundRobinSelector::with_max_keys(2);
        let auths = vec![Arc::new(Auth {
            id: "a".to_string(),
            provider: "gemini".to_string(),
            ..Auth::default()
        })];

        for model in ["m1", "m2", "m3"] {
            selector.pick("gemini", model, &auths).expect("pick");
        }

        assert!(selector.cursor_len() <= 2);
        assert!(selector.has_cursor("gemini:m3"));
        assert!(!selector.has_cursor("gemini:m1"));
    }

    #[test]
    fn touching_existing_key_refreshes_recency() {
        let mut map = CursorMap::default();
        map.touch("a", 2);
        map.touch("b", 2);
        map.touch("a", 2);
        map.touch("c", 2);
        assert!(map.entries.contains_key("a"));
        assert!(!map.entries.contains_key("b"));
    }
}
