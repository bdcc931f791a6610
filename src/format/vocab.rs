use std::collections::HashMap;

use crate::error::{format_err, Result};

pub type TokenId = u32;

/// Token strings, their ids, and the BPE merge table.
///
/// The core never tokenizes; the merge ranks are carried for whoever does.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Vocabulary {
    id_to_token: Vec<String>,
    token_to_id: HashMap<String, TokenId>,
    merges: Vec<(String, String)>,
    merge_ranks: HashMap<(String, String), usize>,
}

impl Vocabulary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the next token; its id is the current length.
    pub fn push_token(&mut self, token: String) -> Result<TokenId> {
        let id = self.id_to_token.len() as TokenId;
        if let Some(prev) = self.token_to_id.insert(token.clone(), id) {
            return Err(format_err!(
                "duplicate vocabulary entry '{token}' at ids {prev} and {id}"
            ));
        }
        self.id_to_token.push(token);
        Ok(id)
    }

    /// Parse a `"left right"` merge entry; rank is the insertion order.
    pub fn push_merge(&mut self, raw: &str) -> Result<usize> {
        let (left, right) = raw
            .trim_start()
            .split_once(char::is_whitespace)
            .ok_or_else(|| format_err!("merge entry '{raw}' is not a pair"))?;
        let pair = (left.to_string(), right.trim().to_string());
        let rank = self.merges.len();
        self.merge_ranks.entry(pair.clone()).or_insert(rank);
        self.merges.push(pair);
        Ok(rank)
    }

    pub fn len(&self) -> usize {
        self.id_to_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.id_to_token.is_empty()
    }

    pub fn token(&self, id: TokenId) -> Option<&str> {
        self.id_to_token.get(id as usize).map(String::as_str)
    }

    pub fn id(&self, token: &str) -> Option<TokenId> {
        self.token_to_id.get(token).copied()
    }

    pub fn n_merges(&self) -> usize {
        self.merges.len()
    }

    /// Merge pairs in rank order.
    pub fn merges(&self) -> &[(String, String)] {
        &self.merges
    }

    pub fn merge_rank(&self, left: &str, right: &str) -> Option<usize> {
        self.merge_ranks
            .get(&(left.to_string(), right.to_string()))
            .copied()
    }
}
