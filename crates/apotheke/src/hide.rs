use std::collections::HashSet;
use std::sync::RwLock;

/// Registry of `(table, column)` pairs whose string values are obfuscated at
/// rest. Mirrors the reserved hidden-column table; the store reloads it on
/// open and keeps it in sync on create/drop.
pub(crate) struct HiddenColumnVault {
    entries: RwLock<HashSet<(String, String)>>,
}

impl HiddenColumnVault {
    pub(crate) fn new() -> Self {
        Self {
            entries: RwLock::new(HashSet::new()),
        }
    }

    pub(crate) fn contains(&self, table: &str, column: &str) -> bool {
        self.entries
            .read()
            .expect("hidden column vault poisoned")
            .contains(&(table.to_string(), column.to_string()))
    }

    pub(crate) fn insert(&self, table: &str, column: &str) {
        self.entries
            .write()
            .expect("hidden column vault poisoned")
            .insert((table.to_string(), column.to_string()));
    }

    pub(crate) fn remove_table(&self, table: &str) {
        self.entries
            .write()
            .expect("hidden column vault poisoned")
            .retain(|(entry_table, _)| entry_table != table);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_pairs_and_drops_whole_tables() {
        let vault = HiddenColumnVault::new();
        vault.insert("users", "secret");
        vault.insert("users", "token");
        vault.insert("posts", "body");
        assert!(vault.contains("users", "secret"));
        assert!(!vault.contains("users", "name"));

        vault.remove_table("users");
        assert!(!vault.contains("users", "secret"));
        assert!(!vault.contains("users", "token"));
        assert!(vault.contains("posts", "body"));
    }
}
