//! Per-session authenticated identity
//!
//! A [`ClientContext`] is attached to a session after successful token
//! verification and drives every visibility and authorization decision. Tag
//! access is OR-over-tags: sharing any single tag with a server is enough.
//! The `*` wildcard grants access to everything, including servers with no
//! tags at all; without the wildcard an untagged server is invisible.

use std::collections::BTreeSet;

use time::OffsetDateTime;

/// The wildcard tag granting access to every server.
pub const WILDCARD_TAG: &str = "*";

/// Authenticated identity for one session.
#[derive(Debug, Clone)]
pub struct ClientContext {
    pub subject: String,
    allowed_tags: BTreeSet<String>,
    pub authenticated_at: OffsetDateTime,
}

impl ClientContext {
    pub fn new(subject: impl Into<String>, allowed_tags: BTreeSet<String>) -> Self {
        Self {
            subject: subject.into(),
            allowed_tags,
            authenticated_at: OffsetDateTime::now_utc(),
        }
    }

    /// True if this context holds the `*` wildcard.
    pub fn has_wildcard(&self) -> bool {
        self.allowed_tags.contains(WILDCARD_TAG)
    }

    /// Literal membership check for a single tag; the wildcard grants all.
    pub fn can_access_tag(&self, tag: &str) -> bool {
        self.has_wildcard() || self.allowed_tags.contains(tag)
    }

    /// OR-over-tags authorization: true iff the allowed set intersects
    /// `required_tags`, or this context holds the wildcard.
    ///
    /// An empty `required_tags` set denies by empty intersection, so untagged
    /// servers are only reachable through the wildcard.
    pub fn has_access_to_tags(&self, required_tags: &BTreeSet<String>) -> bool {
        if self.has_wildcard() {
            return true;
        }
        required_tags
            .iter()
            .any(|tag| self.allowed_tags.contains(tag))
    }

    pub fn allowed_tags(&self) -> &BTreeSet<String> {
        &self.allowed_tags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn context(allowed: &[&str]) -> ClientContext {
        ClientContext::new("tester", tags(allowed))
    }

    #[test]
    fn test_or_semantics_one_shared_tag_is_enough() {
        let ctx = context(&["private"]);
        assert!(ctx.has_access_to_tags(&tags(&["private", "calendars"])));
        assert!(!ctx.has_access_to_tags(&tags(&["public", "calendars"])));
    }

    #[test]
    fn test_wildcard_grants_everything() {
        let ctx = context(&["*"]);
        assert!(ctx.has_access_to_tags(&tags(&["anything"])));
        assert!(ctx.has_access_to_tags(&tags(&[])));
        assert!(ctx.can_access_tag("whatever"));
    }

    #[test]
    fn test_empty_required_tags_deny_without_wildcard() {
        let ctx = context(&["private"]);
        assert!(!ctx.has_access_to_tags(&tags(&[])));
    }

    #[test]
    fn test_empty_allowed_tags_deny_everything() {
        let ctx = context(&[]);
        assert!(!ctx.has_access_to_tags(&tags(&["private"])));
        assert!(!ctx.can_access_tag("private"));
    }

    #[test]
    fn test_single_tag_membership_is_literal() {
        let ctx = context(&["ops"]);
        assert!(ctx.can_access_tag("ops"));
        assert!(!ctx.can_access_tag("op"));
    }
}
