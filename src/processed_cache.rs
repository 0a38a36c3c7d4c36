use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Issues handled during this process lifetime, keyed by (project id, issue iid).
/// Guards against picking an issue up again when labelling it afterwards failed.
#[derive(Clone, Default)]
pub struct ProcessedIssueCache {
    processed: Arc<Mutex<HashSet<(i64, i64)>>>,
}

impl ProcessedIssueCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn check(&self, project_id: i64, issue_iid: i64) -> bool {
        let set = self.processed.lock().await;
        set.contains(&(project_id, issue_iid))
    }

    pub async fn add(&self, project_id: i64, issue_iid: i64) {
        let mut set = self.processed.lock().await;
        set.insert((project_id, issue_iid));
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.processed.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_keys_are_per_project() {
        let cache = ProcessedIssueCache::new();
        cache.add(1, 7).await;

        assert!(cache.check(1, 7).await);
        assert!(!cache.check(2, 7).await);
        assert!(!cache.check(1, 8).await);
        assert_eq!(cache.len().await, 1);
    }
}
