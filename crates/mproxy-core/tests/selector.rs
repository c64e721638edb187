use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use mproxy_core::auth::{ATTR_PRIORITY, ATTR_VIRTUAL_PARENT};
use mproxy_core::{
    Auth, AuthSelector, FillFirstSelector, ModelState, QuotaState, RoundRobinSelector,
};

fn auth(id: &str) -> Arc<Auth> {
    Arc::new(Auth {
        id: id.to_string(),
        provider: "qwen".to_string(),
        ..Auth::default()
    })
}

fn auth_with_priority(id: &str, priority: &str) -> Arc<Auth> {
    Arc::new(Auth {
        id: id.to_string(),
        provider: "qwen".to_string(),
        attributes: HashMap::from([(ATTR_PRIORITY.to_string(), priority.to_string())]),
        ..Auth::default()
    })
}

fn auth_with_parent(id: &str, parent: &str) -> Arc<Auth> {
    Arc::new(Auth {
        id: id.to_string(),
        provider: "gemini-cli".to_string(),
        attributes: HashMap::from([(ATTR_VIRTUAL_PARENT.to_string(), parent.to_string())]),
        ..Auth::default()
    })
}

fn blocked_state(until: SystemTime) -> ModelState {
    ModelState {
        unavailable: true,
        next_retry_after: Some(until),
        quota: QuotaState {
            exceeded: true,
            next_recover_at: Some(until),
        },
        ..ModelState::default()
    }
}

#[test]
fn fill_first_pick_is_deterministic() {
    let selector = FillFirstSelector::new();
    let auths = vec![auth("b"), auth("a"), auth("c")];

    for _ in 0..3 {
        let picked = selector.pick("gemini", "", &auths).expect("pick");
        assert_eq!(picked.id, "a");
    }
}

#[test]
fn round_robin_cycles_deterministically() {
    let selector = RoundRobinSelector::new();
    let auths = vec![auth("b"), auth("a"), auth("c")];

    for (i, want) in ["a", "b", "c", "a", "b"].iter().enumerate() {
        let picked = selector.pick("gemini", "", &auths).expect("pick");
        assert_eq!(&picked.id, want, "pick #{i}");
    }
}

#[test]
fn round_robin_only_rotates_highest_priority_bucket() {
    let selector = RoundRobinSelector::new();
    let auths = vec![
        auth_with_priority("c", "0"),
        auth_with_priority("a", "10"),
        auth_with_priority("b", "10"),
    ];

    for (i, want) in ["a", "b", "a", "b"].iter().enumerate() {
        let picked = selector.pick("mixed", "", &auths).expect("pick");
        assert_eq!(&picked.id, want, "pick #{i}");
        assert_ne!(picked.id, "c", "lower priority auth selected at #{i}");
    }
}

#[test]
fn round_robin_is_fair_over_full_cycles() {
    let selector = RoundRobinSelector::new();
    let auths = vec![auth("d"), auth("b"), auth("a"), auth("c")];

    let rounds = 5;
    let mut counts: HashMap<String, usize> = HashMap::new();
    for _ in 0..rounds * auths.len() {
        let picked = selector.pick("qwen", "m", &auths).expect("pick");
        *counts.entry(picked.id.clone()).or_default() += 1;
    }
    assert_eq!(counts.len(), auths.len());
    for (id, count) in counts {
        assert_eq!(count, rounds, "auth {id} picked {count} times");
    }
}

#[test]
fn fill_first_falls_back_to_lower_priority_on_cooldown() {
    let selector = FillFirstSelector::new();
    let now = SystemTime::now();
    let model = "test-model";

    let high = Arc::new(Auth {
        id: "high".to_string(),
        provider: "qwen".to_string(),
        attributes: HashMap::from([(ATTR_PRIORITY.to_string(), "10".to_string())]),
        model_states: HashMap::from([(
            model.to_string(),
            blocked_state(now + Duration::from_secs(30 * 60)),
        )]),
        ..Auth::default()
    });
    let low = auth_with_priority("low", "0");

    let picked = selector.pick("mixed", model, &[high, low]).expect("pick");
    assert_eq!(picked.id, "low");
}

#[test]
fn unavailable_without_next_retry_does_not_block() {
    let selector = FillFirstSelector::new();
    let model = "test-model";

    let stale = Arc::new(Auth {
        id: "a".to_string(),
        provider: "qwen".to_string(),
        model_states: HashMap::from([(
            model.to_string(),
            ModelState {
                unavailable: true,
                quota: QuotaState {
                    exceeded: true,
                    next_recover_at: None,
                },
                ..ModelState::default()
            },
        )]),
        ..Auth::default()
    });

    let picked = selector.pick("qwen", model, &[stale]).expect("pick");
    assert_eq!(picked.id, "a");
}

#[test]
fn all_cooldown_returns_model_cooldown_error() {
    let model = "test-model";
    let next = SystemTime::now() + Duration::from_secs(60);
    let auths: Vec<Arc<Auth>> = ["a", "b"]
        .iter()
        .map(|id| {
            Arc::new(Auth {
                id: id.to_string(),
                provider: "gemini".to_string(),
                model_states: HashMap::from([(model.to_string(), blocked_state(next))]),
                ..Auth::default()
            })
        })
        .collect();

    let selector = FillFirstSelector::new();

    // Mixed provider redacts the provider field.
    let err = selector
        .pick("mixed", model, &auths)
        .expect_err("expected cooldown error");
    assert_eq!(err.status_code(), 429);
    let headers = err.headers();
    let retry_after = headers
        .iter()
        .find(|(name, _)| name == "Retry-After")
        .map(|(_, value)| value.clone())
        .expect("Retry-After header");
    assert!(retry_after.parse::<u64>().expect("numeric Retry-After") >= 1);

    let payload: serde_json::Value = serde_json::from_str(&err.body_json()).expect("json body");
    assert_eq!(payload["error"]["code"], "model_cooldown");
    assert!(payload["error"].get("provider").is_none());

    // A bound provider is included.
    let err = selector
        .pick("gemini", model, &auths)
        .expect_err("expected cooldown error");
    let payload: serde_json::Value = serde_json::from_str(&err.body_json()).expect("json body");
    assert_eq!(payload["error"]["provider"], "gemini");
}

#[test]
fn thinking_suffix_consults_base_model_state() {
    let selector = FillFirstSelector::new();
    let now = SystemTime::now();

    let high = Arc::new(Auth {
        id: "high".to_string(),
        provider: "qwen".to_string(),
        attributes: HashMap::from([(ATTR_PRIORITY.to_string(), "10".to_string())]),
        model_states: HashMap::from([(
            "test-model".to_string(),
            blocked_state(now + Duration::from_secs(30 * 60)),
        )]),
        ..Auth::default()
    });
    let low = auth_with_priority("low", "0");

    let picked = selector
        .pick("mixed", "test-model(high)", &[high, low])
        .expect("pick");
    assert_eq!(picked.id, "low");
}

#[test]
fn thinking_suffix_shares_round_robin_cursor() {
    let selector = RoundRobinSelector::new();
    let auths = vec![auth("b"), auth("a")];

    let first = selector
        .pick("gemini", "test-model(high)", &auths)
        .expect("pick");
    let second = selector
        .pick("gemini", "test-model(low)", &auths)
        .expect("pick");
    assert_eq!(first.id, "a");
    assert_eq!(second.id, "b");
}

#[test]
fn round_robin_alternates_virtual_parents() {
    let selector = RoundRobinSelector::new();
    let auths = vec![
        auth_with_parent("cred-a.json::proj-a1", "cred-a.json"),
        auth_with_parent("cred-a.json::proj-a2", "cred-a.json"),
        auth_with_parent("cred-a.json::proj-a3", "cred-a.json"),
        auth_with_parent("cred-b.json::proj-b1", "cred-b.json"),
        auth_with_parent("cred-b.json::proj-b2", "cred-b.json"),
    ];

    let mut picks = Vec::new();
    let mut parents = Vec::new();
    for _ in 0..6 {
        let picked = selector
            .pick("gemini-cli", "gemini-2.5-pro", &auths)
            .expect("pick");
        parents.push(
            picked
                .virtual_parent()
                .expect("virtual parent attribute")
                .to_string(),
        );
        picks.push(picked.id.clone());
    }

    // Consecutive picks must come from different parents.
    for i in 1..parents.len() {
        assert_ne!(
            parents[i],
            parents[i - 1],
            "picks #{} and #{} share parent (IDs {:?}, {:?})",
            i - 1,
            i,
            picks[i - 1],
            picks[i]
        );
    }

    // Within one parent, projects rotate rather than repeat.
    let mut per_parent: HashMap<String, Vec<String>> = HashMap::new();
    for (parent, id) in parents.iter().zip(&picks) {
        per_parent.entry(parent.clone()).or_default().push(id.clone());
    }
    for (parent, ids) in per_parent {
        for window in ids.windows(2) {
            assert_ne!(window[0], window[1], "parent {parent} repeated a project");
        }
    }
}

#[test]
fn single_parent_group_falls_back_to_flat_rotation() {
    let selector = RoundRobinSelector::new();
    let auths = vec![
        auth_with_parent("cred-a.json::proj-a1", "cred-a.json"),
        auth_with_parent("cred-a.json::proj-a2", "cred-a.json"),
        auth_with_parent("cred-a.json::proj-a3", "cred-a.json"),
    ];

    let want = [
        "cred-a.json::proj-a1",
        "cred-a.json::proj-a2",
        "cred-a.json::proj-a3",
        "cred-a.json::proj-a1",
    ];
    for (i, expected) in want.iter().enumerate() {
        let picked = selector
            .pick("gemini-cli", "gemini-2.5-pro", &auths)
            .expect("pick");
        assert_eq!(&picked.id, expected, "pick #{i}");
    }
}

#[test]
fn mixed_virtual_and_plain_auths_fall_back_to_flat_rotation() {
    let selector = RoundRobinSelector::new();
    let auths = vec![
        auth_with_parent("cred-a.json::proj-a1", "cred-a.json"),
        auth("cred-regular.json"),
    ];

    let want = ["cred-a.json::proj-a1", "cred-regular.json", "cred-a.json::proj-a1"];
    for (i, expected) in want.iter().enumerate() {
        let picked = selector.pick("gemini-cli", "", &auths).expect("pick");
        assert_eq!(&picked.id, expected, "pick #{i}");
    }
}

#[test]
fn round_robin_is_safe_under_concurrency() {
    let selector = Arc::new(RoundRobinSelector::new());
    let auths = Arc::new(vec![auth("b"), auth("a"), auth("c")]);

    std::thread::scope(|scope| {
        for _ in 0..32 {
            let selector = selector.clone();
            let auths = auths.clone();
            scope.spawn(move || {
                for _ in 0..100 {
                    let picked = selector.pick("gemini", "", &auths).expect("pick");
                    assert!(!picked.id.is_empty());
                }
            });
        }
    });
}
