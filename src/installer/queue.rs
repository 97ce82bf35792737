use crate::models::{QueueDirection, QueueEntry, QueueStatus, TrackKey};
use chrono::Utc;
use uuid::Uuid;

/// Optimistic download and uninstall queues for one device.
///
/// A key lives in at most one of the two queues: pushing into one evicts the
/// key from the other.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallQueue {
    downloads: Vec<QueueEntry>,
    uninstalls: Vec<QueueEntry>,
}

impl InstallQueue {
    pub fn from_parts(downloads: Vec<QueueEntry>, uninstalls: Vec<QueueEntry>) -> Self {
        let mut queue = Self::default();
        for entry in downloads {
            queue.insert(QueueDirection::Download, entry);
        }
        for entry in uninstalls {
            queue.insert(QueueDirection::Uninstall, entry);
        }
        queue
    }

    pub fn downloads(&self) -> &[QueueEntry] {
        &self.downloads
    }

    pub fn uninstalls(&self) -> &[QueueEntry] {
        &self.uninstalls
    }

    fn entries(&self, direction: QueueDirection) -> &Vec<QueueEntry> {
        match direction {
            QueueDirection::Download => &self.downloads,
            QueueDirection::Uninstall => &self.uninstalls,
        }
    }

    fn entries_mut(&mut self, direction: QueueDirection) -> &mut Vec<QueueEntry> {
        match direction {
            QueueDirection::Download => &mut self.downloads,
            QueueDirection::Uninstall => &mut self.uninstalls,
        }
    }

    pub fn contains(&self, direction: QueueDirection, key: &TrackKey) -> bool {
        let raw = key.as_key();
        let entry_type = key.entry_type();
        self.entries(direction)
            .iter()
            .any(|entry| entry.entry_type == entry_type && entry.key == raw)
    }

    /// Queues `key`, replacing any entry for it in either direction.
    pub fn push(&mut self, direction: QueueDirection, key: &TrackKey) -> QueueEntry {
        let entry = QueueEntry {
            id: Uuid::new_v4().to_string(),
            entry_type: key.entry_type(),
            key: key.as_key(),
            status: QueueStatus::Queued,
            queued_at: Utc::now(),
        };
        self.insert(direction, entry.clone());
        entry
    }

    fn insert(&mut self, direction: QueueDirection, entry: QueueEntry) {
        let same_key = |existing: &QueueEntry| existing.entry_type == entry.entry_type && existing.key == entry.key;
        self.downloads.retain(|existing| !same_key(existing));
        self.uninstalls.retain(|existing| !same_key(existing));
        self.entries_mut(direction).push(entry);
    }

    pub fn remove(&mut self, direction: QueueDirection, key: &TrackKey) -> bool {
        let raw = key.as_key();
        let entry_type = key.entry_type();
        let entries = self.entries_mut(direction);
        let before = entries.len();
        entries.retain(|entry| !(entry.entry_type == entry_type && entry.key == raw));
        entries.len() != before
    }

    /// Keeps only the uninstall entries `keep` accepts; returns how many were dropped.
    pub fn retain_uninstalls(&mut self, mut keep: impl FnMut(&QueueEntry) -> bool) -> usize {
        let before = self.uninstalls.len();
        self.uninstalls.retain(|entry| keep(entry));
        before - self.uninstalls.len()
    }

    pub fn clear_downloads(&mut self) -> usize {
        let cleared = self.downloads.len();
        self.downloads.clear();
        cleared
    }
}

#[cfg(test)]
mod tests {
    use super::InstallQueue;
    use crate::models::{QueueDirection, TrackKey};

    #[test]
    fn pushing_one_direction_evicts_the_other() {
        let mut queue = InstallQueue::default();
        let key = TrackKey::node("https://github.com/org/node");

        queue.push(QueueDirection::Uninstall, &key);
        queue.push(QueueDirection::Download, &key);
        assert!(queue.contains(QueueDirection::Download, &key));
        assert!(!queue.contains(QueueDirection::Uninstall, &key));

        queue.push(QueueDirection::Uninstall, &key);
        assert!(!queue.contains(QueueDirection::Download, &key));
        assert_eq!(queue.uninstalls().len(), 1);
    }

    #[test]
    fn repeated_push_keeps_one_entry() {
        let mut queue = InstallQueue::default();
        let key = TrackKey::package("numpy");
        queue.push(QueueDirection::Download, &key);
        queue.push(QueueDirection::Download, &key);
        assert_eq!(queue.downloads().len(), 1);
    }

    #[test]
    fn keys_are_scoped_by_entry_type() {
        let mut queue = InstallQueue::default();
        queue.push(QueueDirection::Download, &TrackKey::package("comfy"));
        queue.push(QueueDirection::Uninstall, &TrackKey::node("comfy"));
        assert_eq!(queue.downloads().len(), 1);
        assert_eq!(queue.uninstalls().len(), 1);
    }

    #[test]
    fn from_parts_restores_exclusivity() {
        let mut first = InstallQueue::default();
        let key = TrackKey::model("checkpoints", "a.safetensors");
        let download = first.push(QueueDirection::Download, &key);
        let uninstall = first.push(QueueDirection::Uninstall, &key);

        let restored = InstallQueue::from_parts(vec![download], vec![uninstall]);
        assert!(restored.downloads().is_empty());
        assert!(restored.contains(QueueDirection::Uninstall, &key));
    }

    #[test]
    fn remove_and_clear() {
        let mut queue = InstallQueue::default();
        let model = TrackKey::model_path("loras/x.safetensors");
        queue.push(QueueDirection::Download, &model);
        queue.push(QueueDirection::Download, &TrackKey::package("torch"));
        queue.push(QueueDirection::Uninstall, &TrackKey::package("scipy"));

        assert!(queue.remove(QueueDirection::Download, &model));
        assert!(!queue.remove(QueueDirection::Download, &model));
        assert_eq!(queue.clear_downloads(), 1);
        assert_eq!(queue.retain_uninstalls(|entry| entry.key != "scipy"), 1);
        assert!(queue.uninstalls().is_empty());
    }
}
