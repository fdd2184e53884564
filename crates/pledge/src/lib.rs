//! The capability ("pledge") system: a registry of named permissions with
//! glob-matched values and pluggable per-subsystem granters. Granting is
//! monotonic once sealed: `seal()` freezes the registry, after which
//! checks keep working but every change is refused.
//!
//! The registry is mutated only on the main thread (it is deliberately
//! not `Sync`); workers inherit their permissions through their setup
//! callback.

mod fs;
mod net;

pub use fs::FsGranter;
pub use net::UrlGranter;

use std::collections::HashMap;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("permission '{0}' denied")]
    Denied(String),

    #[error("pledge registry is sealed")]
    Sealed,

    #[error("invalid pattern '{pattern}': {source}")]
    BadPattern {
        pattern: String,
        source: glob::PatternError,
    },

    #[error("permission '{name}' has no sub-permission '{sub}'")]
    UnknownSub { name: String, sub: String },
}

/// A per-subsystem permission store. The granter owns both the storage
/// format of granted values and the matching semantics of checks.
pub trait Granter {
    /// Record `value` (None grants the permission unconditionally) under
    /// an optional sub-permission, validating the sub against the
    /// subsystem's schema.
    fn grant(&mut self, sub: Option<&str>, value: Option<&str>) -> Result<(), Error>;

    /// Whether the stored grants allow `value` under `sub`. Unmatched
    /// values fall through to denied.
    fn check(&self, sub: Option<&str>, value: Option<&str>) -> bool;
}

struct Entry {
    granter: Box<dyn Granter>,
    rejected: bool,
}

/// The process-wide permission registry.
#[derive(Default)]
pub struct Registry {
    entries: HashMap<String, Entry>,
    factories: HashMap<String, fn() -> Box<dyn Granter>>,
    sealed: bool,
}

impl Registry {
    pub fn new() -> Self {
        let mut registry = Self::default();
        registry.register("fs", || Box::new(FsGranter::default()));
        registry.register("net", || Box::new(UrlGranter::default()));
        registry
    }

    /// Registration hook for subsystem granters: permissions under `name`
    /// will be stored and checked by granters built with `factory`.
    pub fn register(&mut self, name: &str, factory: fn() -> Box<dyn Granter>) {
        self.factories.insert(name.to_owned(), factory);
    }

    /// Grant `spec` (a permission name, optionally `name:sub`) with an
    /// optional value.
    pub fn pledge(&mut self, spec: &str, value: Option<&str>) -> Result<(), Error> {
        if self.sealed {
            return Err(Error::Sealed);
        }
        let (name, sub) = split_spec(spec);
        tracing::debug!(permission = name, sub, value, "pledging");
        let entry = self.entry_mut(name);
        entry.granter.grant(sub, value)
    }

    /// Mark `spec` explicitly denied. Sticky: later grants do not clear it.
    pub fn reject(&mut self, spec: &str) -> Result<(), Error> {
        if self.sealed {
            return Err(Error::Sealed);
        }
        let (name, _) = split_spec(spec);
        self.entry_mut(name).rejected = true;
        Ok(())
    }

    /// Freeze the registry. Checks continue to work; further grants and
    /// rejects fail.
    pub fn seal(&mut self) {
        tracing::debug!("pledge registry sealed");
        self.sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Query without raising.
    pub fn has(&self, name: &str, sub: Option<&str>, value: Option<&str>) -> bool {
        match self.entries.get(name) {
            Some(entry) if !entry.rejected => entry.granter.check(sub, value),
            _ => false,
        }
    }

    /// Query, raising a `Denied` error bearing the permission name when
    /// the check falls through.
    pub fn check(&self, name: &str, sub: Option<&str>, value: Option<&str>) -> Result<(), Error> {
        if self.has(name, sub, value) {
            Ok(())
        } else {
            let full = match sub {
                Some(sub) => format!("{name}:{sub}"),
                None => name.to_owned(),
            };
            Err(Error::Denied(full))
        }
    }

    fn entry_mut(&mut self, name: &str) -> &mut Entry {
        let factory = self.factories.get(name).copied();
        self.entries
            .entry(name.to_owned())
            .or_insert_with(|| Entry {
                granter: factory
                    .map(|f| f())
                    .unwrap_or_else(|| Box::new(GlobGranter::default())),
                rejected: false,
            })
    }
}

fn split_spec(spec: &str) -> (&str, Option<&str>) {
    match spec.split_once(':') {
        Some((name, sub)) => (name, Some(sub)),
        None => (spec, None),
    }
}

/// The default granter: an ordered list of glob-valued grants, matched
/// with `*` (any sequence) and `?` (single character).
#[derive(Default)]
pub struct GlobGranter {
    grants: Vec<GlobGrant>,
}

struct GlobGrant {
    sub: Option<String>,
    pattern: Option<glob::Pattern>,
}

impl GlobGranter {
    fn add(&mut self, sub: Option<&str>, value: Option<&str>) -> Result<(), Error> {
        let pattern = value
            .map(|v| {
                glob::Pattern::new(v).map_err(|source| Error::BadPattern {
                    pattern: v.to_owned(),
                    source,
                })
            })
            .transpose()?;
        self.grants.push(GlobGrant {
            sub: sub.map(str::to_owned),
            pattern,
        });
        Ok(())
    }

    fn matches(&self, sub: Option<&str>, value: Option<&str>) -> bool {
        self.grants.iter().any(|grant| {
            // A grant without a sub-permission covers every sub.
            let sub_ok = grant.sub.is_none() || grant.sub.as_deref() == sub;
            let value_ok = match (&grant.pattern, value) {
                (None, _) => true,
                (Some(_), None) => false,
                (Some(pattern), Some(value)) => pattern.matches(value),
            };
            sub_ok && value_ok
        })
    }
}

impl Granter for GlobGranter {
    fn grant(&mut self, sub: Option<&str>, value: Option<&str>) -> Result<(), Error> {
        self.add(sub, value)
    }

    fn check(&self, sub: Option<&str>, value: Option<&str>) -> bool {
        self.matches(sub, value)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn granted_values_match_by_glob() {
        let mut reg = Registry::new();
        reg.pledge("env", Some("HOME")).unwrap();
        reg.pledge("env", Some("XDG_*")).unwrap();

        assert!(reg.has("env", None, Some("HOME")));
        assert!(reg.has("env", None, Some("XDG_CONFIG_HOME")));
        assert!(!reg.has("env", None, Some("PATH")));
        assert!(!reg.has("unrelated", None, Some("HOME")));
    }

    #[test]
    fn question_mark_matches_a_single_character() {
        let mut reg = Registry::new();
        reg.pledge("env", Some("LC_?")).unwrap();
        assert!(reg.has("env", None, Some("LC_X")));
        assert!(!reg.has("env", None, Some("LC_ALL")));
    }

    #[test]
    fn valueless_grant_is_unconditional() {
        let mut reg = Registry::new();
        reg.pledge("clock", None).unwrap();
        assert!(reg.has("clock", None, None));
        assert!(reg.has("clock", None, Some("anything")));
    }

    #[test]
    fn seal_freezes_grants_but_not_checks() {
        let mut reg = Registry::new();
        reg.pledge("env", Some("HOME")).unwrap();
        reg.seal();

        assert!(matches!(reg.pledge("env", Some("PATH")), Err(Error::Sealed)));
        assert!(matches!(reg.reject("env"), Err(Error::Sealed)));
        assert!(reg.has("env", None, Some("HOME")));
        assert!(!reg.has("env", None, Some("PATH")));
    }

    #[test]
    fn reject_is_a_sticky_deny() {
        let mut reg = Registry::new();
        reg.pledge("env", Some("HOME")).unwrap();
        reg.reject("env").unwrap();
        assert!(!reg.has("env", None, Some("HOME")));

        // Granting again does not clear the rejection.
        reg.pledge("env", Some("HOME")).unwrap();
        assert!(!reg.has("env", None, Some("HOME")));
    }

    #[test]
    fn denied_checks_carry_the_permission_name() {
        let reg = Registry::new();
        let err = reg.check("fs", Some("write"), Some("/etc/passwd")).unwrap_err();
        assert_eq!(err.to_string(), "permission 'fs:write' denied");
    }

    #[test]
    fn bad_patterns_are_reported() {
        let mut reg = Registry::new();
        let err = reg.pledge("env", Some("[")).unwrap_err();
        assert!(matches!(err, Error::BadPattern { .. }));
    }

    #[test]
    fn custom_granters_take_over_their_namespace() {
        struct DenyAll;
        impl Granter for DenyAll {
            fn grant(&mut self, _: Option<&str>, _: Option<&str>) -> Result<(), Error> {
                Ok(())
            }
            fn check(&self, _: Option<&str>, _: Option<&str>) -> bool {
                false
            }
        }

        let mut reg = Registry::new();
        reg.register("locked", || Box::new(DenyAll));
        reg.pledge("locked", Some("*")).unwrap();
        assert!(!reg.has("locked", None, Some("anything")));
    }
}
