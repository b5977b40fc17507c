//! Private tag dictionary.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::models::PrivateTag;

/// Registry of vendor-private tags.
///
/// Tags are looked up by their tag string or by their description with the
/// whitespace removed, which is how they appear as header keys.
pub trait TagDictionary: Send + Sync {
    fn register(&self, tag: &PrivateTag);

    fn is_private(&self, key: &str) -> bool;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Default)]
pub struct InMemoryTagDictionary {
    tags: RwLock<HashMap<String, PrivateTag>>,
}

impl InMemoryTagDictionary {
    pub fn new() -> Self {
        Self::default()
    }
}

fn keyword(description: &str) -> String {
    description.split_whitespace().collect()
}

impl TagDictionary for InMemoryTagDictionary {
    fn register(&self, tag: &PrivateTag) {
        let Ok(mut tags) = self.tags.write() else {
            return;
        };
        tags.insert(tag.tag.clone(), tag.clone());
        let keyword = keyword(&tag.description);
        if !keyword.is_empty() {
            tags.insert(keyword, tag.clone());
        }
    }

    fn is_private(&self, key: &str) -> bool {
        self.tags
            .read()
            .map(|tags| tags.contains_key(key))
            .unwrap_or(false)
    }

    fn len(&self) -> usize {
        self.tags
            .read()
            .map(|tags| {
                let mut ids: Vec<&str> = tags.values().map(|t| t.tag.as_str()).collect();
                ids.sort_unstable();
                ids.dedup();
                ids.len()
            })
            .unwrap_or(0)
    }
}
