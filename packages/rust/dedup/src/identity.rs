//! Exact identity keys for pending discoveries.
//!
//! Discoveries never go through fuzzy adjudication: two discoveries are the
//! same when their keys match after alias resolution.

use std::collections::HashMap;

use tastebase_shared::{DedupConfig, Discovery};

use crate::normalize::{identity_key, normalize_place};

/// Common alternate names for shows (alias, canonical).
const BUILTIN_SHOW_ALIASES: &[(&str, &str)] = &[
    ("DDD", "Diners, Drive-Ins and Dives"),
    ("Triple D", "Diners, Drive-Ins and Dives"),
    ("Triple D Nation", "Diners, Drive-Ins and Dives"),
    ("GBBO", "The Great British Bake Off"),
    ("The Great British Baking Show", "The Great British Bake Off"),
    ("TOC", "Tournament of Champions"),
    ("Guy's Tournament of Champions", "Tournament of Champions"),
    ("Top Chef US", "Top Chef"),
];

/// Maps alias keys to canonical keys.
#[derive(Debug, Clone, Default)]
pub struct AliasTable {
    aliases: HashMap<String, String>,
}

impl AliasTable {
    pub fn builtin() -> Self {
        let mut table = Self::default();
        for (alias, canonical) in BUILTIN_SHOW_ALIASES {
            table.insert(alias, canonical);
        }
        table
    }

    /// Builtin aliases plus `[dedup.show_aliases]`. Config entries win.
    pub fn from_config(config: &DedupConfig) -> Self {
        let mut table = Self::builtin();
        for (alias, canonical) in &config.show_aliases {
            table.insert(alias, canonical);
        }
        table
    }

    pub fn insert(&mut self, alias: &str, canonical: &str) {
        self.aliases
            .insert(identity_key(alias), identity_key(canonical));
    }

    /// Identity key for `name` with aliases resolved.
    pub fn canonical_key(&self, name: &str) -> String {
        let key = identity_key(name);
        self.aliases.get(&key).cloned().unwrap_or(key)
    }

    /// Whether `name` is a known alias.
    pub fn is_alias(&self, name: &str) -> bool {
        self.aliases.contains_key(&identity_key(name))
    }
}

/// The identity key stored with a discovery.
///
/// Shows resolve aliases; restaurants are qualified by city so that two
/// same-named venues in different cities stay distinct.
pub fn discovery_identity(aliases: &AliasTable, discovery: &Discovery) -> String {
    match discovery {
        Discovery::Show(show) => aliases.canonical_key(&show.name),
        Discovery::Chef(chef) => identity_key(&chef.name),
        Discovery::Restaurant(restaurant) => match restaurant.city.as_deref() {
            Some(city) if !city.trim().is_empty() => {
                format!("{}|{}", identity_key(&restaurant.name), normalize_place(city))
            }
            _ => identity_key(&restaurant.name),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tastebase_shared::{RestaurantDiscovery, ShowDiscovery};

    fn show(name: &str) -> Discovery {
        Discovery::Show(ShowDiscovery {
            name: name.into(),
            network: None,
            season: None,
        })
    }

    #[test]
    fn punctuation_variants_share_identity() {
        let aliases = AliasTable::builtin();
        assert_eq!(
            discovery_identity(&aliases, &show("Top Chef")),
            discovery_identity(&aliases, &show("TOP.CHEF!!"))
        );
    }

    #[test]
    fn aliases_resolve_to_canonical() {
        let aliases = AliasTable::builtin();
        assert!(aliases.is_alias("ddd"));
        assert_eq!(
            discovery_identity(&aliases, &show("DDD")),
            discovery_identity(&aliases, &show("Diners, Drive-Ins & Dives"))
        );
        assert_eq!(
            aliases.canonical_key("The Great British Baking Show"),
            "great british bake off"
        );
    }

    #[test]
    fn config_aliases_extend_builtin() {
        let mut config = DedupConfig::default();
        config
            .show_aliases
            .insert("BBF".into(), "Beat Bobby Flay".into());
        let aliases = AliasTable::from_config(&config);
        assert_eq!(aliases.canonical_key("bbf"), "beat bobby flay");
        assert_eq!(aliases.canonical_key("GBBO"), "great british bake off");
    }

    #[test]
    fn restaurants_are_city_qualified() {
        let aliases = AliasTable::builtin();
        let venue = |city: Option<&str>| {
            Discovery::Restaurant(RestaurantDiscovery {
                name: "Aba".into(),
                chef_name: None,
                city: city.map(String::from),
                state: None,
                address: None,
            })
        };
        assert_ne!(
            discovery_identity(&aliases, &venue(Some("Chicago"))),
            discovery_identity(&aliases, &venue(Some("Austin")))
        );
        assert_eq!(discovery_identity(&aliases, &venue(None)), "aba");
    }
}
