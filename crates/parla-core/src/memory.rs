//! Per-user memory and shared knowledge. Both only ever grow: facts merge as a
//! set union and summaries append.

use crate::error::AssistantResult;
use crate::store::{Collection, Keyed, MediaStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Mutex;
use tracing::debug;

const SHARED_KEY: &str = "shared";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserMemory {
    pub user_id: String,
    #[serde(default)]
    pub facts: BTreeSet<String>,
    #[serde(default)]
    pub preferences: BTreeSet<String>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Keyed for UserMemory {
    fn key(&self) -> String {
        self.user_id.clone()
    }
}

/// Output of the fact-extraction call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryUpdate {
    #[serde(default)]
    pub facts: Vec<String>,
    #[serde(default)]
    pub preferences: Vec<String>,
    #[serde(default)]
    pub summary: String,
}

impl MemoryUpdate {
    pub fn is_empty(&self) -> bool {
        self.facts.is_empty() && self.preferences.is_empty() && self.summary.trim().is_empty()
    }
}

fn union_into(set: &mut BTreeSet<String>, items: impl IntoIterator<Item = String>) {
    for item in items {
        let item = item.trim();
        if !item.is_empty() {
            set.insert(item.to_string());
        }
    }
}

impl UserMemory {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Default::default()
        }
    }

    pub fn merge(&mut self, update: MemoryUpdate) {
        union_into(&mut self.facts, update.facts);
        union_into(&mut self.preferences, update.preferences);
        let addition = update.summary.trim();
        if !addition.is_empty() {
            if !self.summary.is_empty() {
                self.summary.push(' ');
            }
            self.summary.push_str(addition);
        }
        self.updated_at = Some(Utc::now());
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SharedKnowledge {
    #[serde(default)]
    pub facts: BTreeSet<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Keyed for SharedKnowledge {
    fn key(&self) -> String {
        SHARED_KEY.to_string()
    }
}

impl SharedKnowledge {
    pub fn merge(&mut self, facts: impl IntoIterator<Item = String>) {
        union_into(&mut self.facts, facts);
        self.updated_at = Some(Utc::now());
    }
}

/// Read-merge-write over the store. The lock keeps concurrent background
/// learners from losing each other's updates.
pub struct MemoryBook {
    store: MediaStore,
    write_lock: Mutex<()>,
}

impl MemoryBook {
    pub fn new(store: MediaStore) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }

    pub fn user(&self, user_id: &str) -> AssistantResult<UserMemory> {
        Ok(self
            .store
            .get(Collection::UserMemory, user_id)?
            .unwrap_or_else(|| UserMemory::new(user_id)))
    }

    pub fn learn(&self, user_id: &str, update: MemoryUpdate) -> AssistantResult<UserMemory> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut memory = self.user(user_id)?;
        memory.merge(update);
        self.store.put(Collection::UserMemory, &memory)?;
        debug!(target: "parla::store", user_id, facts = memory.facts.len(), "user memory merged");
        Ok(memory)
    }

    pub fn shared(&self) -> AssistantResult<SharedKnowledge> {
        Ok(self
            .store
            .get(Collection::SharedKnowledge, SHARED_KEY)?
            .unwrap_or_default())
    }

    pub fn learn_shared(&self, facts: Vec<String>) -> AssistantResult<SharedKnowledge> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut knowledge = self.shared()?;
        knowledge.merge(facts);
        self.store.put(Collection::SharedKnowledge, &knowledge)?;
        debug!(target: "parla::store", facts = knowledge.facts.len(), "shared knowledge merged");
        Ok(knowledge)
    }

    /// Text block prepended to the chat system instruction. Empty when nothing is known.
    pub fn context_block(&self, user_id: &str) -> AssistantResult<String> {
        let memory = self.user(user_id)?;
        let shared = self.shared()?;
        let mut out = String::new();
        if !memory.summary.is_empty() {
            out.push_str(&format!("About the user: {}\n", memory.summary));
        }
        if !memory.preferences.is_empty() {
            out.push_str("User preferences:\n");
            for p in &memory.preferences {
                out.push_str(&format!("- {}\n", p));
            }
        }
        if !memory.facts.is_empty() {
            out.push_str("Known facts about the user:\n");
            for f in &memory.facts {
                out.push_str(&format!("- {}\n", f));
            }
        }
        if !shared.facts.is_empty() {
            out.push_str("Shared knowledge:\n");
            for f in &shared.facts {
                out.push_str(&format!("- {}\n", f));
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(facts: &[&str], summary: &str) -> MemoryUpdate {
        MemoryUpdate {
            facts: facts.iter().map(|s| s.to_string()).collect(),
            preferences: vec![],
            summary: summary.to_string(),
        }
    }

    #[test]
    fn same_fact_twice_is_kept_once() {
        let book = MemoryBook::new(MediaStore::temporary().unwrap());
        book.learn("guest", update(&["likes tea"], "Talked about tea.")).unwrap();
        let m = book.learn("guest", update(&["likes tea", " likes tea "], "Asked again.")).unwrap();
        assert_eq!(m.facts.len(), 1);
        assert_eq!(m.summary, "Talked about tea. Asked again.");
    }

    #[test]
    fn shared_facts_are_a_union() {
        let book = MemoryBook::new(MediaStore::temporary().unwrap());
        book.learn_shared(vec!["Riyadh is the capital".into()]).unwrap();
        let k = book
            .learn_shared(vec!["Riyadh is the capital".into(), "Jeddah is on the coast".into()])
            .unwrap();
        assert_eq!(k.facts.len(), 2);
    }

    #[test]
    fn context_block_lists_known_items() {
        let book = MemoryBook::new(MediaStore::temporary().unwrap());
        assert!(book.context_block("guest").unwrap().is_empty());
        book.learn("guest", update(&["has a cat"], "")).unwrap();
        let block = book.context_block("guest").unwrap();
        assert!(block.contains("- has a cat"));
        assert!(!block.contains("About the user"));
    }
}
