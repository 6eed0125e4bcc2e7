//! Rule engine: hostname pattern matching and policy resolution.
//!
//! Pure functions over a rules + settings snapshot. A pattern matches a host
//! when it equals the host (case-insensitive), or when it is `*.suffix` and
//! the host is the suffix or ends with `.suffix`. Rules resolve in
//! registration (ID-ascending) order.

use url::Url;

use crate::model::{HeaderRule, MirrorRule, RulesSnapshot, SettingsSnapshot};

/// How a header directive combines with headers already present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderMode {
    /// Replace any prior value.
    Override,
    /// Only set when the header is absent.
    AddIfMissing,
}

/// One normalized header instruction. Rule JSON comes in two shapes (plain
/// map and `{value, mode}` objects); both normalize to this at resolution
/// time so the fetch path never sees the shape difference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderDirective {
    pub name: String,
    pub value: String,
    pub mode: HeaderMode,
}

/// Returns whether `pattern` matches `host`.
#[must_use]
pub fn pattern_matches(pattern: &str, host: &str) -> bool {
    let pattern = pattern.trim().to_ascii_lowercase();
    let host = host.trim().to_ascii_lowercase();
    if pattern.is_empty() || host.is_empty() {
        return false;
    }
    if let Some(suffix) = pattern.strip_prefix("*.") {
        return host == suffix || host.ends_with(&format!(".{suffix}"));
    }
    pattern == host
}

/// Resolves the transport proxy for a URL.
///
/// Precedence: the forced per-download URL, else the first matching enabled
/// proxy rule (its override, else the global URL), else the global proxy when
/// enabled, else none. Proxy rules are consulted independently of the global
/// enable flag; a matching rule with `use_proxy` but no usable address is a
/// no-op.
#[must_use]
pub fn resolve_proxy(
    forced_proxy_url: Option<&str>,
    settings: &SettingsSnapshot,
    rules: &RulesSnapshot,
    url: &Url,
) -> Option<String> {
    if let Some(forced) = forced_proxy_url {
        if !forced.trim().is_empty() {
            return Some(forced.to_string());
        }
    }

    let global = settings
        .global_proxy_url
        .as_deref()
        .filter(|s| !s.trim().is_empty());

    if let Some(host) = url.host_str() {
        if let Some(rule) = rules
            .proxy_rules
            .iter()
            .filter(|r| r.enabled)
            .find(|r| pattern_matches(&r.pattern, host))
        {
            if rule.use_proxy {
                return rule
                    .proxy_url_override
                    .as_deref()
                    .filter(|s| !s.trim().is_empty())
                    .or(global)
                    .map(str::to_string);
            }
            // An explicit "no proxy for this host" rule wins over the global.
            return None;
        }
    }

    if settings.global_proxy_enabled {
        return global.map(str::to_string);
    }
    None
}

/// Merges header directives from every enabled rule matching the URL's host,
/// in registration order. `override` replaces earlier values; `add_if_missing`
/// (or `add`) only fills absent names. Header names compare
/// case-insensitively.
#[must_use]
pub fn merged_headers(rules: &RulesSnapshot, url: &Url) -> Vec<(String, String)> {
    let Some(host) = url.host_str() else {
        return Vec::new();
    };

    let mut merged: Vec<(String, String)> = Vec::new();
    for rule in rules.header_rules.iter().filter(|r| r.enabled) {
        if !pattern_matches(&rule.pattern, host) {
            continue;
        }
        for directive in normalize_header_rule(rule) {
            let existing = merged
                .iter_mut()
                .find(|(name, _)| name.eq_ignore_ascii_case(&directive.name));
            match (existing, directive.mode) {
                (Some(slot), HeaderMode::Override) => slot.1 = directive.value,
                (Some(_), HeaderMode::AddIfMissing) => {}
                (None, _) => merged.push((directive.name, directive.value)),
            }
        }
    }
    merged
}

/// Normalizes one rule's JSON payload into directives.
fn normalize_header_rule(rule: &HeaderRule) -> Vec<HeaderDirective> {
    let value = &rule.headers_json;
    let obj = value.get("headers").unwrap_or(value);
    let Some(map) = obj.as_object() else {
        return Vec::new();
    };

    let mut out = Vec::new();
    for (name, entry) in map {
        let (value, mode) = if let Some(s) = entry.as_str() {
            (s.to_string(), HeaderMode::Override)
        } else if let Some(o) = entry.as_object() {
            let value = o
                .get("value")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let mode = match o.get("mode").and_then(|v| v.as_str()) {
                Some("add_if_missing" | "add") => HeaderMode::AddIfMissing,
                _ => HeaderMode::Override,
            };
            (value, mode)
        } else {
            continue;
        };
        if value.is_empty() {
            continue;
        }
        out.push(HeaderDirective {
            name: name.clone(),
            value,
            mode,
        });
    }
    out
}

/// Collects mirror candidate URLs for a URL: the candidate lists of every
/// enabled matching mirror rule, concatenated in registration order and
/// de-duplicated keeping the first occurrence. Each candidate is the base
/// swapped in for the original scheme+host (+ optional base path), preserving
/// the original path suffix and query.
#[must_use]
pub fn mirror_candidates(rules: &RulesSnapshot, url: &Url) -> Vec<Url> {
    let Some(host) = url.host_str() else {
        return Vec::new();
    };

    let mut seen: Vec<String> = Vec::new();
    let mut out = Vec::new();
    for rule in rules.mirror_rules.iter().filter(|r| r.enabled) {
        if !pattern_matches(&rule.pattern, host) {
            continue;
        }
        for base in candidate_bases(rule) {
            if seen.iter().any(|s| s == &base) {
                continue;
            }
            seen.push(base.clone());
            if let Some(rewritten) = rewrite_onto_base(&base, url) {
                out.push(rewritten);
            }
        }
    }
    out
}

fn candidate_bases(rule: &MirrorRule) -> Vec<String> {
    rule.candidates_json
        .as_array()
        .map(|list| {
            list.iter()
                .filter_map(|v| v.as_str())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Swaps `url`'s scheme+host for `base`, keeping the original path and query
/// as the fingerprint. A base with its own path becomes a prefix.
fn rewrite_onto_base(base: &str, url: &Url) -> Option<Url> {
    let mut rewritten = Url::parse(base).ok()?;
    if rewritten.cannot_be_a_base() {
        return None;
    }
    let base_path = rewritten.path().trim_end_matches('/');
    let path = if base_path.is_empty() {
        url.path().to_string()
    } else {
        format!("{base_path}{}", url.path())
    };
    rewritten.set_path(&path);
    rewritten.set_query(url.query());
    Some(rewritten)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::ProxyRule;

    fn settings(proxy_enabled: bool, proxy_url: Option<&str>) -> SettingsSnapshot {
        SettingsSnapshot {
            default_download_dir: "/tmp".to_string(),
            bandwidth_limit_bps: None,
            minimize_to_tray: true,
            theme: "dark".to_string(),
            skin: "default".to_string(),
            global_hotkey: String::new(),
            global_proxy_enabled: proxy_enabled,
            global_proxy_url: proxy_url.map(str::to_string),
            local_api_port: 17777,
        }
    }

    fn proxy_rule(id: i64, pattern: &str, use_proxy: bool, over: Option<&str>) -> ProxyRule {
        ProxyRule {
            id,
            pattern: pattern.to_string(),
            enabled: true,
            use_proxy,
            proxy_url_override: over.map(str::to_string),
        }
    }

    // ---- pattern matching ----

    #[test]
    fn test_pattern_exact_match_is_case_insensitive() {
        assert!(pattern_matches("Example.COM", "example.com"));
        assert!(pattern_matches("example.com", "EXAMPLE.com"));
        assert!(!pattern_matches("example.com", "other.com"));
    }

    #[test]
    fn test_pattern_wildcard_matches_suffix_and_subdomains() {
        assert!(pattern_matches("*.example.com", "example.com"));
        assert!(pattern_matches("*.example.com", "cdn.example.com"));
        assert!(pattern_matches("*.example.com", "a.b.example.com"));
        assert!(!pattern_matches("*.example.com", "badexample.com"));
        assert!(!pattern_matches("*.example.com", "example.org"));
    }

    #[test]
    fn test_pattern_empty_never_matches() {
        assert!(!pattern_matches("", "example.com"));
        assert!(!pattern_matches("example.com", ""));
    }

    // ---- proxy resolution ----

    #[test]
    fn test_forced_proxy_wins_over_everything() {
        let rules = RulesSnapshot {
            proxy_rules: vec![proxy_rule(1, "example.com", true, Some("http://rule:1"))],
            ..RulesSnapshot::default()
        };
        let url = Url::parse("https://example.com/f").unwrap();
        let got = resolve_proxy(
            Some("http://forced:9"),
            &settings(true, Some("http://global:1")),
            &rules,
            &url,
        );
        assert_eq!(got.as_deref(), Some("http://forced:9"));
    }

    #[test]
    fn test_rule_override_beats_global_url() {
        let rules = RulesSnapshot {
            proxy_rules: vec![proxy_rule(1, "example.com", true, Some("http://rule:1"))],
            ..RulesSnapshot::default()
        };
        let url = Url::parse("https://example.com/f").unwrap();
        let got = resolve_proxy(None, &settings(true, Some("http://global:1")), &rules, &url);
        assert_eq!(got.as_deref(), Some("http://rule:1"));
    }

    #[test]
    fn test_rule_without_override_uses_global_even_when_disabled() {
        // Rules are consulted independently of the global enable flag.
        let rules = RulesSnapshot {
            proxy_rules: vec![proxy_rule(1, "example.com", true, None)],
            ..RulesSnapshot::default()
        };
        let url = Url::parse("https://example.com/f").unwrap();
        let got = resolve_proxy(None, &settings(false, Some("http://global:1")), &rules, &url);
        assert_eq!(got.as_deref(), Some("http://global:1"));
    }

    #[test]
    fn test_rule_without_any_address_is_noop() {
        let rules = RulesSnapshot {
            proxy_rules: vec![proxy_rule(1, "example.com", true, None)],
            ..RulesSnapshot::default()
        };
        let url = Url::parse("https://example.com/f").unwrap();
        assert_eq!(resolve_proxy(None, &settings(false, None), &rules, &url), None);
    }

    #[test]
    fn test_no_proxy_rule_shields_host_from_global() {
        let rules = RulesSnapshot {
            proxy_rules: vec![proxy_rule(1, "example.com", false, None)],
            ..RulesSnapshot::default()
        };
        let url = Url::parse("https://example.com/f").unwrap();
        let got = resolve_proxy(None, &settings(true, Some("http://global:1")), &rules, &url);
        assert_eq!(got, None);
    }

    #[test]
    fn test_first_matching_rule_in_id_order_wins() {
        let rules = RulesSnapshot {
            proxy_rules: vec![
                proxy_rule(1, "*.example.com", true, Some("http://first:1")),
                proxy_rule(2, "cdn.example.com", true, Some("http://second:2")),
            ],
            ..RulesSnapshot::default()
        };
        let url = Url::parse("https://cdn.example.com/f").unwrap();
        let got = resolve_proxy(None, &settings(false, None), &rules, &url);
        assert_eq!(got.as_deref(), Some("http://first:1"));
    }

    #[test]
    fn test_global_proxy_applies_without_matching_rule() {
        let url = Url::parse("https://elsewhere.net/f").unwrap();
        let got = resolve_proxy(
            None,
            &settings(true, Some("http://global:1")),
            &RulesSnapshot::default(),
            &url,
        );
        assert_eq!(got.as_deref(), Some("http://global:1"));

        let got = resolve_proxy(
            None,
            &settings(false, Some("http://global:1")),
            &RulesSnapshot::default(),
            &url,
        );
        assert_eq!(got, None, "global url alone is inert while disabled");
    }

    // ---- header merging ----

    fn header_rule(id: i64, pattern: &str, json: serde_json::Value) -> HeaderRule {
        HeaderRule {
            id,
            pattern: pattern.to_string(),
            enabled: true,
            headers_json: json,
        }
    }

    #[test]
    fn test_headers_map_form_defaults_to_override() {
        let rules = RulesSnapshot {
            header_rules: vec![header_rule(
                1,
                "example.com",
                serde_json::json!({"Referer": "https://a"}),
            )],
            ..RulesSnapshot::default()
        };
        let url = Url::parse("https://example.com/f").unwrap();
        assert_eq!(
            merged_headers(&rules, &url),
            vec![("Referer".to_string(), "https://a".to_string())]
        );
    }

    #[test]
    fn test_headers_nested_headers_key_accepted() {
        let rules = RulesSnapshot {
            header_rules: vec![header_rule(
                1,
                "example.com",
                serde_json::json!({"headers": {"X-Tag": "v1"}}),
            )],
            ..RulesSnapshot::default()
        };
        let url = Url::parse("https://example.com/f").unwrap();
        assert_eq!(
            merged_headers(&rules, &url),
            vec![("X-Tag".to_string(), "v1".to_string())]
        );
    }

    #[test]
    fn test_headers_override_beats_add_if_missing_order() {
        let rules = RulesSnapshot {
            header_rules: vec![
                header_rule(1, "example.com", serde_json::json!({"X-Tag": "first"})),
                header_rule(
                    2,
                    "*.example.com",
                    serde_json::json!({
                        "X-Tag": {"value": "later-add", "mode": "add_if_missing"},
                        "X-Other": {"value": "set", "mode": "add"}
                    }),
                ),
                header_rule(
                    3,
                    "example.com",
                    serde_json::json!({"X-Tag": {"value": "final", "mode": "override"}}),
                ),
            ],
            ..RulesSnapshot::default()
        };
        let url = Url::parse("https://example.com/f").unwrap();
        let merged = merged_headers(&rules, &url);
        assert_eq!(
            merged,
            vec![
                ("X-Tag".to_string(), "final".to_string()),
                ("X-Other".to_string(), "set".to_string()),
            ]
        );
    }

    #[test]
    fn test_headers_disabled_and_non_matching_rules_skipped() {
        let mut off = header_rule(1, "example.com", serde_json::json!({"X-A": "1"}));
        off.enabled = false;
        let rules = RulesSnapshot {
            header_rules: vec![
                off,
                header_rule(2, "other.net", serde_json::json!({"X-B": "2"})),
            ],
            ..RulesSnapshot::default()
        };
        let url = Url::parse("https://example.com/f").unwrap();
        assert!(merged_headers(&rules, &url).is_empty());
    }

    #[test]
    fn test_headers_empty_values_dropped() {
        let rules = RulesSnapshot {
            header_rules: vec![header_rule(
                1,
                "example.com",
                serde_json::json!({"X-Empty": "", "X-Set": "v"}),
            )],
            ..RulesSnapshot::default()
        };
        let url = Url::parse("https://example.com/f").unwrap();
        assert_eq!(
            merged_headers(&rules, &url),
            vec![("X-Set".to_string(), "v".to_string())]
        );
    }

    // ---- mirrors ----

    fn mirror_rule(id: i64, pattern: &str, candidates: serde_json::Value) -> MirrorRule {
        MirrorRule {
            id,
            pattern: pattern.to_string(),
            enabled: true,
            candidates_json: candidates,
        }
    }

    #[test]
    fn test_mirror_preserves_path_and_query() {
        let rules = RulesSnapshot {
            mirror_rules: vec![mirror_rule(
                1,
                "slow.example",
                serde_json::json!(["https://fast.example"]),
            )],
            ..RulesSnapshot::default()
        };
        let url = Url::parse("https://slow.example/models/q.gguf?rev=main").unwrap();
        let mirrors = mirror_candidates(&rules, &url);
        assert_eq!(
            mirrors[0].as_str(),
            "https://fast.example/models/q.gguf?rev=main"
        );
    }

    #[test]
    fn test_mirror_base_path_becomes_prefix() {
        let rules = RulesSnapshot {
            mirror_rules: vec![mirror_rule(
                1,
                "slow.example",
                serde_json::json!(["https://cdn.example/mirror/"]),
            )],
            ..RulesSnapshot::default()
        };
        let url = Url::parse("https://slow.example/a/b.bin").unwrap();
        let mirrors = mirror_candidates(&rules, &url);
        assert_eq!(mirrors[0].as_str(), "https://cdn.example/mirror/a/b.bin");
    }

    #[test]
    fn test_mirror_lists_concatenate_and_dedupe_in_order() {
        let rules = RulesSnapshot {
            mirror_rules: vec![
                mirror_rule(
                    1,
                    "slow.example",
                    serde_json::json!(["https://m1.example", "https://m2.example"]),
                ),
                mirror_rule(
                    2,
                    "*.example",
                    serde_json::json!(["https://m2.example", "https://m3.example"]),
                ),
            ],
            ..RulesSnapshot::default()
        };
        let url = Url::parse("https://slow.example/f").unwrap();
        let hosts: Vec<_> = mirror_candidates(&rules, &url)
            .iter()
            .map(|u| u.host_str().unwrap().to_string())
            .collect();
        assert_eq!(hosts, vec!["m1.example", "m2.example", "m3.example"]);
    }

    #[test]
    fn test_mirror_invalid_candidates_skipped() {
        let rules = RulesSnapshot {
            mirror_rules: vec![mirror_rule(
                1,
                "slow.example",
                serde_json::json!(["not a url", 42, "https://ok.example"]),
            )],
            ..RulesSnapshot::default()
        };
        let url = Url::parse("https://slow.example/f").unwrap();
        let mirrors = mirror_candidates(&rules, &url);
        assert_eq!(mirrors.len(), 1);
        assert_eq!(mirrors[0].host_str(), Some("ok.example"));
    }
}
