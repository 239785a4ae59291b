use std::collections::HashSet;
use std::sync::Mutex;

use crate::model::Finding;

/// Append-only sink for findings. Recording the same finding twice is
/// harmless.
pub trait KnowledgeBase: Send + Sync {
    /// Returns false when the finding was already known.
    fn record(&self, finding: Finding) -> bool;
}

#[derive(Default)]
struct Store {
    findings: Vec<Finding>,
    keys: HashSet<(String, String, String, Option<String>)>,
}

#[derive(Default)]
pub struct InMemoryKnowledgeBase {
    store: Mutex<Store>,
}

impl InMemoryKnowledgeBase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn findings(&self) -> Vec<Finding> {
        self.store
            .lock()
            .map(|s| s.findings.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.store.lock().map(|s| s.findings.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KnowledgeBase for InMemoryKnowledgeBase {
    fn record(&self, finding: Finding) -> bool {
        let key = (
            finding.plugin.clone(),
            finding.name.clone(),
            finding.url.clone(),
            finding.evidence.clone(),
        );
        let Ok(mut store) = self.store.lock() else {
            return false;
        };
        if !store.keys.insert(key) {
            return false;
        }
        store.findings.push(finding);
        true
    }
}
