//! The filesystem granter: `read` and `write` sub-permissions whose
//! values are glob patterns interpreted against canonicalized paths.

use crate::{Error, Granter};
use std::path::{Component, Path, PathBuf};

#[derive(Default)]
pub struct FsGranter {
    grants: Vec<FsGrant>,
}

struct FsGrant {
    /// None covers both `read` and `write`.
    sub: Option<Sub>,
    pattern: Option<glob::Pattern>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Sub {
    Read,
    Write,
}

impl Sub {
    fn parse(sub: &str) -> Option<Sub> {
        match sub {
            "read" => Some(Sub::Read),
            "write" => Some(Sub::Write),
            _ => None,
        }
    }
}

impl Granter for FsGranter {
    fn grant(&mut self, sub: Option<&str>, value: Option<&str>) -> Result<(), Error> {
        let sub = match sub {
            None => None,
            Some(raw) => Some(Sub::parse(raw).ok_or_else(|| Error::UnknownSub {
                name: "fs".to_owned(),
                sub: raw.to_owned(),
            })?),
        };
        let pattern = value
            .map(|v| {
                glob::Pattern::new(v).map_err(|source| Error::BadPattern {
                    pattern: v.to_owned(),
                    source,
                })
            })
            .transpose()?;
        self.grants.push(FsGrant { sub, pattern });
        Ok(())
    }

    fn check(&self, sub: Option<&str>, value: Option<&str>) -> bool {
        let sub = match sub {
            None => None,
            // An unknown sub-permission can never be granted.
            Some(raw) => match Sub::parse(raw) {
                Some(sub) => Some(sub),
                None => return false,
            },
        };
        let canonical = value.map(canonicalize);
        self.grants.iter().any(|grant| {
            let sub_ok = grant.sub.is_none() || sub.is_none() || grant.sub == sub;
            let value_ok = match (&grant.pattern, &canonical) {
                (None, _) => true,
                (Some(_), None) => false,
                (Some(pattern), Some(path)) => pattern.matches(path),
            };
            sub_ok && value_ok
        })
    }
}

/// Resolve symlinks and `..` where the filesystem can answer; fall back
/// to a lexical cleanup for paths that do not (yet) exist.
fn canonicalize(path: &str) -> String {
    match std::fs::canonicalize(path) {
        Ok(resolved) => resolved.to_string_lossy().into_owned(),
        Err(_) => lexical_clean(Path::new(path)).to_string_lossy().into_owned(),
    }
}

fn lexical_clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Registry;

    #[test]
    fn read_and_write_are_independent_subs() {
        let mut reg = Registry::new();
        reg.pledge("fs:read", Some("/data/*")).unwrap();

        assert!(reg.has("fs", Some("read"), Some("/data/input.txt")));
        assert!(!reg.has("fs", Some("write"), Some("/data/input.txt")));
        assert!(!reg.has("fs", Some("read"), Some("/secret")));
    }

    #[test]
    fn global_grant_implies_all_subs() {
        let mut reg = Registry::new();
        reg.pledge("fs", Some("/scratch/*")).unwrap();
        assert!(reg.has("fs", Some("read"), Some("/scratch/a")));
        assert!(reg.has("fs", Some("write"), Some("/scratch/a")));
    }

    #[test]
    fn unknown_sub_is_rejected_at_grant_time() {
        let mut reg = Registry::new();
        let err = reg.pledge("fs:execute", Some("/bin/*")).unwrap_err();
        assert!(matches!(err, Error::UnknownSub { .. }));
    }

    #[test]
    fn dotdot_is_resolved_before_matching() {
        let mut reg = Registry::new();
        reg.pledge("fs:read", Some("/data/*")).unwrap();
        // Escaping upward lexically does not fool the matcher.
        assert!(!reg.has("fs", Some("read"), Some("/data/../etc/passwd")));
        assert!(reg.has("fs", Some("read"), Some("/data/sub/../ok.txt")));
    }

    #[test]
    fn symlinks_resolve_to_their_targets() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("real");
        std::fs::create_dir(&real).unwrap();
        std::fs::write(real.join("file.txt"), "x").unwrap();
        let link = dir.path().join("alias");
        std::os::unix::fs::symlink(&real, &link).unwrap();

        // The canonical form of the tempdir may itself differ from
        // dir.path() (e.g. /tmp vs /private/tmp), so build the pattern
        // from the canonical root.
        let canon_real = std::fs::canonicalize(&real).unwrap();
        let mut reg = Registry::new();
        reg.pledge("fs:read", Some(&format!("{}/*", canon_real.display())))
            .unwrap();

        let through_link = link.join("file.txt");
        assert!(reg.has("fs", Some("read"), Some(&through_link.to_string_lossy())));
    }
}
