//! Queue URI: `wh://<base>[:<group>][/<tag>]` (spec §3, §6).
//!
//! `base`, `group`, `tag` are byte-safe opaque labels matching `[^:/]+`.
//! Parsing is a single regex-shaped scan, kept dependency-free since the
//! grammar is this small.

use crate::error::QueueUriError;

const SCHEME: &str = "wh://";

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct QueueUri {
    pub base: String,
    pub group: Option<String>,
    pub tag: Option<String>,
}

fn is_label_byte(c: char) -> bool {
    c != ':' && c != '/'
}

impl QueueUri {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            group: None,
            tag: None,
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Drop the group component, keeping base and tag (spec §4.3 step 6:
    /// "normalize the popped URI by dropping the group component").
    pub fn without_group(&self) -> Self {
        Self {
            base: self.base.clone(),
            group: None,
            tag: self.tag.clone(),
        }
    }

    pub fn parse(s: &str) -> Result<Self, QueueUriError> {
        let rest = s
            .strip_prefix(SCHEME)
            .ok_or_else(|| QueueUriError(s.to_string()))?;
        if rest.is_empty() {
            return Err(QueueUriError(s.to_string()));
        }

        // base runs until ':' or '/' or end
        let base_end = rest.find([':', '/']).unwrap_or(rest.len());
        let base = &rest[..base_end];
        if base.is_empty() || !base.chars().all(is_label_byte) {
            return Err(QueueUriError(s.to_string()));
        }
        let mut remainder = &rest[base_end..];

        let mut group = None;
        if let Some(g) = remainder.strip_prefix(':') {
            let g_end = g.find('/').unwrap_or(g.len());
            let g_val = &g[..g_end];
            if g_val.is_empty() || !g_val.chars().all(is_label_byte) {
                return Err(QueueUriError(s.to_string()));
            }
            group = Some(g_val.to_string());
            remainder = &g[g_end..];
        }

        let mut tag = None;
        if let Some(t) = remainder.strip_prefix('/') {
            if t.is_empty() || !t.chars().all(is_label_byte) || t.contains(['/', ':']) {
                return Err(QueueUriError(s.to_string()));
            }
            tag = Some(t.to_string());
            remainder = "";
        }

        if !remainder.is_empty() {
            return Err(QueueUriError(s.to_string()));
        }

        Ok(Self {
            base: base.to_string(),
            group,
            tag,
        })
    }
}

impl std::fmt::Display for QueueUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{SCHEME}{}", self.base)?;
        if let Some(g) = &self.group {
            write!(f, ":{g}")?;
        }
        if let Some(t) = &self.tag {
            write!(f, "/{t}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_all_components() {
        let uri = QueueUri::new("sum").with_group("g1").with_tag("t1");
        let s = uri.to_string();
        assert_eq!(s, "wh://sum:g1/t1");
        assert_eq!(QueueUri::parse(&s).unwrap(), uri);
    }

    #[test]
    fn base_only() {
        let uri = QueueUri::parse("wh://sum").unwrap();
        assert_eq!(uri.base, "sum");
        assert!(uri.group.is_none());
        assert!(uri.tag.is_none());
    }

    #[test]
    fn tag_without_group() {
        let uri = QueueUri::parse("wh://sum/t1").unwrap();
        assert_eq!(uri.base, "sum");
        assert_eq!(uri.tag.as_deref(), Some("t1"));
    }

    #[test]
    fn rejects_malformed() {
        assert!(QueueUri::parse("sum").is_err());
        assert!(QueueUri::parse("wh://").is_err());
        assert!(QueueUri::parse("wh://sum/t1/extra").is_err());
    }

    #[test]
    fn without_group_drops_only_group() {
        let uri = QueueUri::new("sum").with_group("g1").with_tag("t1");
        let stripped = uri.without_group();
        assert_eq!(stripped.to_string(), "wh://sum/t1");
    }
}
