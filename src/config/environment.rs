//! Child-process environment computation for stdio outbound servers
//!
//! The resulting environment is deterministic: a minimal base, an optional
//! merge of the parent environment, an ordered keep/drop filter pass, then the
//! spec's own entries overlaid with `${VAR}` substitution.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

static VAR_REF_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}").unwrap());

/// One keep/drop pattern from the spec's `envFilter` list
#[derive(Debug, Clone, PartialEq)]
enum EnvPattern {
    Keep { prefix: String, wildcard: bool },
    Drop { prefix: String, wildcard: bool },
}

impl EnvPattern {
    fn parse(raw: &str) -> Self {
        let (negated, body) = match raw.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, raw),
        };
        let (prefix, wildcard) = match body.strip_suffix('*') {
            Some(rest) => (rest.to_string(), true),
            None => (body.to_string(), false),
        };
        if negated {
            EnvPattern::Drop { prefix, wildcard }
        } else {
            EnvPattern::Keep { prefix, wildcard }
        }
    }

    fn matches(&self, name: &str) -> bool {
        let (prefix, wildcard) = match self {
            EnvPattern::Keep { prefix, wildcard } | EnvPattern::Drop { prefix, wildcard } => {
                (prefix, *wildcard)
            }
        };
        if wildcard {
            name.starts_with(prefix.as_str())
        } else {
            name == prefix
        }
    }

    fn is_keep(&self) -> bool {
        matches!(self, EnvPattern::Keep { .. })
    }
}

/// Names seeded into every child environment when present in the parent
#[cfg(unix)]
const BASE_VARS: &[&str] = &["HOME", "PATH", "TMPDIR"];
#[cfg(windows)]
const BASE_VARS: &[&str] = &["USERPROFILE", "PATH", "SYSTEMROOT", "TEMP"];

/// Compute the environment for a stdio child process.
///
/// Steps, in order:
/// 1. Seed the minimal base (`HOME`, `PATH`, platform equivalents).
/// 2. Merge the parent environment when `inherit_parent_env` is set.
/// 3. Apply `env_filter` left to right; a name with no matching pattern
///    survives only if the list contains no positive pattern (whitelist mode).
/// 4. Overlay the spec's entries: bare names copy from the parent if present,
///    valued entries get `${VAR}` substitution against the accumulated result.
pub fn compute_environment(
    inherit_parent_env: bool,
    env_filter: &[String],
    entries: &[(String, Option<String>)],
    parent: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut env = HashMap::new();
    for name in BASE_VARS {
        if let Some(value) = parent.get(*name) {
            env.insert((*name).to_string(), value.clone());
        }
    }

    if inherit_parent_env {
        for (name, value) in parent {
            env.insert(name.clone(), value.clone());
        }
    }

    if !env_filter.is_empty() {
        let patterns: Vec<EnvPattern> = env_filter.iter().map(|p| EnvPattern::parse(p)).collect();
        let whitelist_mode = patterns.iter().any(EnvPattern::is_keep);
        env.retain(|name, _| {
            let mut decision = None;
            for pattern in &patterns {
                if pattern.matches(name) {
                    decision = Some(pattern.is_keep());
                }
            }
            decision.unwrap_or(!whitelist_mode)
        });
    }

    for (name, value) in entries {
        match value {
            None => {
                if let Some(parent_value) = parent.get(name) {
                    env.insert(name.clone(), parent_value.clone());
                }
            }
            Some(template) => {
                let expanded = substitute_vars(template, &env);
                env.insert(name.clone(), expanded);
            }
        }
    }

    env
}

/// Replace `${VAR}` references against `env`; unknown references stay literal
fn substitute_vars(template: &str, env: &HashMap<String, String>) -> String {
    VAR_REF_RE
        .replace_all(template, |caps: &regex::Captures<'_>| {
            let name = &caps[1];
            env.get(name).cloned().unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}
