//! The URL granter: values are URL-shaped globs matched component-wise
//! (scheme, host, path) against parsed URLs, so `https://*.example.com/*`
//! cannot be satisfied by a lookalike in some other component.

use crate::{Error, Granter};
use url::Url;

#[derive(Default)]
pub struct UrlGranter {
    grants: Vec<UrlGrant>,
}

struct UrlGrant {
    sub: Option<String>,
    pattern: Option<UrlPattern>,
}

struct UrlPattern {
    scheme: glob::Pattern,
    host: glob::Pattern,
    path: glob::Pattern,
}

impl UrlPattern {
    fn parse(raw: &str) -> Result<Self, Error> {
        let bad = |source| Error::BadPattern {
            pattern: raw.to_owned(),
            source,
        };
        let (scheme, rest) = raw.split_once("://").unwrap_or(("*", raw));
        let (host, path) = match rest.split_once('/') {
            Some((host, path)) => (host, path),
            None => (rest, ""),
        };
        Ok(Self {
            scheme: glob::Pattern::new(scheme).map_err(bad)?,
            host: glob::Pattern::new(host).map_err(bad)?,
            // An empty or bare pattern covers every path.
            path: glob::Pattern::new(if path.is_empty() { "*" } else { path }).map_err(bad)?,
        })
    }

    fn matches(&self, value: &str) -> bool {
        let Ok(url) = Url::parse(value) else {
            return false;
        };
        let host = url.host_str().unwrap_or("");
        let path = url.path().trim_start_matches('/');
        self.scheme.matches(url.scheme()) && self.host.matches(host) && self.path.matches(path)
    }
}

impl Granter for UrlGranter {
    fn grant(&mut self, sub: Option<&str>, value: Option<&str>) -> Result<(), Error> {
        let pattern = value.map(UrlPattern::parse).transpose()?;
        self.grants.push(UrlGrant {
            sub: sub.map(str::to_owned),
            pattern,
        });
        Ok(())
    }

    fn check(&self, sub: Option<&str>, value: Option<&str>) -> bool {
        self.grants.iter().any(|grant| {
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

#[cfg(test)]
mod test {
    use crate::Registry;

    #[test]
    fn urls_match_component_wise() {
        let mut reg = Registry::new();
        reg.pledge("net", Some("https://*.example.com/api/*"))
            .unwrap();

        assert!(reg.has("net", None, Some("https://svc.example.com/api/v1/items")));
        assert!(!reg.has("net", None, Some("http://svc.example.com/api/v1")));
        assert!(!reg.has("net", None, Some("https://evil.com/api/v1")));
        assert!(!reg.has("net", None, Some("https://svc.example.com/admin")));
        // The host glob cannot leak into the path.
        assert!(!reg.has("net", None, Some("https://evil.com/x.example.com/api/")));
    }

    #[test]
    fn bare_host_patterns_cover_every_path() {
        let mut reg = Registry::new();
        reg.pledge("net", Some("https://internal.example.com")).unwrap();
        assert!(reg.has("net", None, Some("https://internal.example.com/anything/here")));
        assert!(!reg.has("net", None, Some("https://external.example.com/")));
    }

    #[test]
    fn non_urls_never_match() {
        let mut reg = Registry::new();
        reg.pledge("net", Some("https://*/")).unwrap();
        assert!(!reg.has("net", None, Some("not a url")));
    }
}
