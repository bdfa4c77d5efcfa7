//! Routing: (user, database) -> resolved backend
//!
//! Rules are evaluated in configuration order; the first match wins. A rule
//! with `is_default: true` matches anything. With no rules at all, every
//! session goes to the first configured backend.

use pgweir_common::config::{
    BackendEntry, MatcherSpec, PoolMode, ResolvedBackend, RoutingConfig, RoutingDefaults,
};
use pgweir_common::{Result, WeirError};
use regex::Regex;

/// Matcher for one routing field (database or user).
#[derive(Debug, Clone)]
pub enum FieldMatcher {
    Exact(String),
    List(Vec<String>),
    Prefix(String),
    Regex(Regex),
}

impl FieldMatcher {
    /// Compile a config matcher spec. Scalars: `~ pattern` is a regex
    /// (full-string match), a single trailing `*` is a prefix, anything else
    /// is exact. A sequence is list membership.
    fn compile(spec: &MatcherSpec) -> Result<Self> {
        match spec {
            MatcherSpec::Many(items) => Ok(FieldMatcher::List(items.clone())),
            MatcherSpec::One(s) => {
                if let Some(pattern) = s.strip_prefix("~ ") {
                    let re = Regex::new(&format!("^(?:{pattern})$"))
                        .map_err(|e| WeirError::ConfigError(format!("bad matcher regex {pattern:?}: {e}")))?;
                    Ok(FieldMatcher::Regex(re))
                } else if s.ends_with('*') && s.matches('*').count() == 1 {
                    Ok(FieldMatcher::Prefix(s[..s.len() - 1].to_string()))
                } else {
                    Ok(FieldMatcher::Exact(s.clone()))
                }
            }
        }
    }

    pub fn matches(&self, s: &str) -> bool {
        match self {
            FieldMatcher::Exact(v) => s == v,
            FieldMatcher::List(items) => items.iter().any(|i| i == s),
            FieldMatcher::Prefix(p) => s.starts_with(p.as_str()),
            FieldMatcher::Regex(re) => re.is_match(s),
        }
    }
}

#[derive(Debug)]
struct CompiledRule {
    database: Option<FieldMatcher>,
    user: Option<FieldMatcher>,
    backend: String,
    pool_size: Option<u32>,
    pool_mode: Option<PoolMode>,
    is_default: bool,
}

/// Pure resolver over the routing rules and backend entries.
#[derive(Debug)]
pub struct Router {
    backends: Vec<BackendEntry>,
    defaults: RoutingDefaults,
    rules: Vec<CompiledRule>,
}

impl Router {
    pub fn new(backends: Vec<BackendEntry>, routing: &RoutingConfig) -> Result<Self> {
        let mut rules = Vec::with_capacity(routing.rules.len());
        for rule in &routing.rules {
            rules.push(CompiledRule {
                database: rule.database.as_ref().map(FieldMatcher::compile).transpose()?,
                user: rule.user.as_ref().map(FieldMatcher::compile).transpose()?,
                backend: rule.backend.clone(),
                pool_size: rule.pool_size,
                pool_mode: rule.pool_mode,
                is_default: rule.is_default,
            });
        }
        Ok(Self {
            backends,
            defaults: routing.defaults.clone(),
            rules,
        })
    }

    /// Resolve (user, database) to the effective backend, or `None` when no
    /// rule matches.
    pub fn resolve(&self, user: &str, database: &str) -> Option<ResolvedBackend> {
        if self.rules.is_empty() {
            return self.backends.first().map(|be| self.materialize(be, None, None));
        }
        for rule in &self.rules {
            if !rule.is_default {
                if let Some(m) = &rule.database {
                    if !m.matches(database) {
                        continue;
                    }
                }
                if let Some(m) = &rule.user {
                    if !m.matches(user) {
                        continue;
                    }
                }
            }
            // A rule naming an unknown backend is skipped, not fatal.
            let Some(be) = self.backends.iter().find(|b| b.name == rule.backend) else {
                continue;
            };
            return Some(self.materialize(be, rule.pool_size, rule.pool_mode));
        }
        None
    }

    fn materialize(
        &self,
        be: &BackendEntry,
        pool_size_override: Option<u32>,
        pool_mode_override: Option<PoolMode>,
    ) -> ResolvedBackend {
        let pool_size = pool_size_override
            .filter(|s| *s != 0)
            .unwrap_or_else(|| be.effective_pool_size(&self.defaults));
        let pool_mode = pool_mode_override.unwrap_or_else(|| be.effective_pool_mode(&self.defaults));
        ResolvedBackend {
            name: be.name.clone(),
            host: be.host.clone(),
            port: be.port,
            pool_size,
            pool_mode,
            server_idle_timeout_sec: be.server_idle_timeout_sec,
            server_lifetime_sec: be.server_lifetime_sec,
            query_wait_timeout_sec: be.query_wait_timeout_sec,
        }
    }
}
