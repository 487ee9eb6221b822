//! Inclusion/exclusion lists consulted before a morsel is emitted.
//!
//! Patterns are line-delimited `account` or `account/spaceId` entries. An
//! inclusion list, when present, is a whitelist; the exclusion list always
//! wins over it.

use data_types::{Account, SpaceId};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Pattern {
    account: String,
    space: Option<String>,
}

impl Pattern {
    fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }
        match line.split_once('/') {
            Some((account, space)) => Some(Self {
                account: account.to_owned(),
                space: Some(space.to_owned()),
            }),
            None => Some(Self {
                account: line.to_owned(),
                space: None,
            }),
        }
    }

    fn matches(&self, account: &Account, space_id: &SpaceId) -> bool {
        self.account == account.as_str()
            && self
                .space
                .as_deref()
                .map(|s| s == space_id.as_str())
                .unwrap_or(true)
    }
}

/// The producer's tenant/space filter.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    include: Option<Vec<Pattern>>,
    exclude: Vec<Pattern>,
}

impl Selection {
    /// A selection that allows every (account, space).
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// Build a selection from the raw contents of the inclusion and
    /// exclusion list files. Either may be absent.
    pub fn from_lists(inclusions: Option<&str>, exclusions: Option<&str>) -> Self {
        let parse = |raw: &str| raw.lines().filter_map(Pattern::parse).collect::<Vec<_>>();
        Self {
            include: inclusions.map(parse),
            exclude: exclusions.map(parse).unwrap_or_default(),
        }
    }

    /// True if morsels for this (account, space) may be emitted.
    pub fn allows(&self, account: &Account, space_id: &SpaceId) -> bool {
        if let Some(include) = &self.include {
            if !include.iter().any(|p| p.matches(account, space_id)) {
                return false;
            }
        }
        !self.exclude.iter().any(|p| p.matches(account, space_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(a: &str) -> Account {
        Account::new(a)
    }

    fn space(s: &str) -> SpaceId {
        SpaceId::new(s)
    }

    #[test]
    fn no_lists_allows_everything() {
        let sel = Selection::allow_all();
        assert!(sel.allows(&account("acme"), &space("photos")));
    }

    #[test]
    fn inclusion_is_a_whitelist() {
        let sel = Selection::from_lists(Some("acme\nbcorp/backups\n"), None);

        assert!(sel.allows(&account("acme"), &space("anything")));
        assert!(sel.allows(&account("bcorp"), &space("backups")));
        assert!(!sel.allows(&account("bcorp"), &space("photos")));
        assert!(!sel.allows(&account("cinc"), &space("photos")));
    }

    #[test]
    fn exclusion_wins_over_inclusion() {
        let sel = Selection::from_lists(Some("acme\n"), Some("acme/scratch\n"));

        assert!(sel.allows(&account("acme"), &space("photos")));
        assert!(!sel.allows(&account("acme"), &space("scratch")));
    }

    #[test]
    fn comments_and_blanks_are_skipped() {
        let sel = Selection::from_lists(None, Some("# temporary\n\nacme/scratch\n"));

        assert!(sel.allows(&account("acme"), &space("photos")));
        assert!(!sel.allows(&account("acme"), &space("scratch")));
    }
}
