//! Static source → destination channel routing.

use std::collections::HashMap;

/// One-to-one channel mapping loaded from `[channels]`. Never mutated after construction.
#[derive(Debug, Clone, Default)]
pub struct ChannelRouter {
    routes: HashMap<String, String>,
}

impl ChannelRouter {
    pub fn new(routes: HashMap<String, String>) -> Self {
        Self { routes }
    }

    /// Destination for `source`, or `None` when the channel is not watched.
    pub fn resolve(&self, source: &str) -> Option<&str> {
        self.routes.get(source).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl FromIterator<(String, String)> for ChannelRouter {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> ChannelRouter {
        [
            ("1087467843584532510".to_string(), "6-901209555432-8".to_string()),
            ("1087466485498265722".to_string(), "6-901209555434-8".to_string()),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn resolves_mapped_channels() {
        let r = router();
        assert_eq!(r.resolve("1087467843584532510"), Some("6-901209555432-8"));
        assert_eq!(r.resolve("1087466485498265722"), Some("6-901209555434-8"));
        assert_eq!(r.len(), 2);
    }

    #[test]
    fn unmapped_is_none() {
        assert_eq!(router().resolve("999"), None);
        assert!(ChannelRouter::default().is_empty());
    }

    #[test]
    fn resolve_is_pure() {
        let r = router();
        let first = r.resolve("1087467843584532510").map(str::to_string);
        for _ in 0..3 {
            assert_eq!(r.resolve("1087467843584532510").map(str::to_string), first);
        }
    }
}
