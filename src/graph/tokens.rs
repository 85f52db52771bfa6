//! Name registries for labels and relationship types.

use crate::types::TokenId;
use serde::{Deserialize, Serialize};

/// Dense `name <-> TokenId` mapping. Ids are assigned in creation order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRegistry {
    names: Vec<String>,
}

impl TokenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id the next created token will get.
    pub fn next_id(&self) -> TokenId {
        TokenId(self.names.len() as u32)
    }

    pub fn id_of(&self, name: &str) -> Option<TokenId> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| TokenId(i as u32))
    }

    pub fn name_of(&self, id: TokenId) -> Option<&str> {
        self.names.get(id.0 as usize).map(String::as_str)
    }

    pub fn contains(&self, id: TokenId) -> bool {
        (id.0 as usize) < self.names.len()
    }

    /// Register `name` under `id`, which must be the next free id.
    pub fn insert(&mut self, id: TokenId, name: &str) -> Result<(), String> {
        if id != self.next_id() {
            return Err(format!(
                "token {} for '{}' is not the next id {}",
                id,
                name,
                self.next_id()
            ));
        }
        if self.id_of(name).is_some() {
            return Err(format!("token '{}' already exists", name));
        }
        self.names.push(name.to_string());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_dense() {
        let mut tokens = TokenRegistry::new();
        tokens.insert(TokenId(0), "Alien").unwrap();
        tokens.insert(TokenId(1), "Human").unwrap();

        assert_eq!(tokens.id_of("Human"), Some(TokenId(1)));
        assert_eq!(tokens.name_of(TokenId(0)), Some("Alien"));
        assert_eq!(tokens.next_id(), TokenId(2));
    }

    #[test]
    fn test_insert_rejects_gaps_and_duplicates() {
        let mut tokens = TokenRegistry::new();
        assert!(tokens.insert(TokenId(1), "Alien").is_err());
        tokens.insert(TokenId(0), "Alien").unwrap();
        assert!(tokens.insert(TokenId(1), "Alien").is_err());
        assert_eq!(tokens.len(), 1);
    }
}
