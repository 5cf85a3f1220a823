//! In-memory registry for tests and local runs.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{
    EventType, FileState, GenericFile, Institution, IntellectualObject, PremisEvent, WorkItem, WorkItemId,
};
use crate::ports::{FileQuery, Page, Registry, RegistryError, WorkItemQuery};

#[derive(Debug, Default)]
struct RegistryState {
    items: HashMap<WorkItemId, WorkItem>,
    states: HashMap<WorkItemId, serde_json::Value>,
    institutions: Vec<Institution>,
    objects: HashMap<String, IntellectualObject>,
    files: HashMap<String, GenericFile>,
    events: Vec<PremisEvent>,
    /// Number of upcoming write calls that fail with `Unavailable`.
    failing_writes: usize,
    /// Writes of one kind to let through before one fails.
    armed: HashMap<WriteKind, usize>,
    item_saves: usize,
}

/// Write calls that can be failed individually.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteKind {
    Event,
    GenericFile,
}

impl RegistryState {
    fn check_write(&mut self) -> Result<(), RegistryError> {
        if self.failing_writes > 0 {
            self.failing_writes -= 1;
            return Err(RegistryError::Unavailable("injected write failure".to_string()));
        }
        Ok(())
    }

    fn check_armed(&mut self, kind: WriteKind) -> Result<(), RegistryError> {
        match self.armed.get_mut(&kind) {
            Some(0) => {
                self.armed.remove(&kind);
                Err(RegistryError::Unavailable(format!("injected {kind:?} write failure")))
            }
            Some(skip) => {
                *skip -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

fn paginate<T: Clone>(mut all: Vec<T>, page: u32, per_page: u32) -> Page<T> {
    let per_page = per_page.max(1) as usize;
    let start = (page.max(1) as usize - 1) * per_page;
    if start >= all.len() {
        return Page::last(Vec::new());
    }
    let has_next = all.len() > start + per_page;
    let items = all.drain(start..(start + per_page).min(all.len())).collect();
    Page { items, has_next }
}

#[derive(Clone, Default)]
pub struct InMemoryRegistry {
    state: Arc<Mutex<RegistryState>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_institution(&self, institution: Institution) {
        self.state.lock().await.institutions.push(institution);
    }

    pub async fn insert_object(&self, object: IntellectualObject) {
        let mut state = self.state.lock().await;
        for file in &object.files {
            state.files.insert(file.identifier.clone(), file.clone());
        }
        state.objects.insert(object.identifier.clone(), object);
    }

    pub async fn insert_file(&self, file: GenericFile) {
        self.state
            .lock()
            .await
            .files
            .insert(file.identifier.clone(), file);
    }

    pub async fn fail_next_writes(&self, n: usize) {
        self.state.lock().await.failing_writes = n;
    }

    /// Lets `skip` writes of `kind` through, then fails the next one.
    pub async fn fail_write_after(&self, kind: WriteKind, skip: usize) {
        self.state.lock().await.armed.insert(kind, skip);
    }

    pub async fn work_items(&self) -> Vec<WorkItem> {
        let mut items: Vec<WorkItem> = self.state.lock().await.items.values().cloned().collect();
        items.sort_by_key(|i| (i.created_at, i.id));
        items
    }

    pub async fn events(&self) -> Vec<PremisEvent> {
        self.state.lock().await.events.clone()
    }

    pub async fn item_saves(&self) -> usize {
        self.state.lock().await.item_saves
    }
}

#[async_trait]
impl Registry for InMemoryRegistry {
    async fn list_work_items(&self, query: &WorkItemQuery) -> Result<Page<WorkItem>, RegistryError> {
        let state = self.state.lock().await;
        let mut matching: Vec<WorkItem> = state
            .items
            .values()
            .filter(|item| query.matches(item))
            .cloned()
            .collect();
        matching.sort_by_key(|i| (i.created_at, i.id));
        Ok(paginate(matching, query.page, query.per_page))
    }

    async fn find_work_item(&self, query: &WorkItemQuery) -> Result<Option<WorkItem>, RegistryError> {
        let state = self.state.lock().await;
        Ok(state
            .items
            .values()
            .filter(|item| query.matches(item))
            .max_by_key(|i| (i.created_at, i.id))
            .cloned())
    }

    async fn get_work_item(&self, id: WorkItemId) -> Result<WorkItem, RegistryError> {
        let state = self.state.lock().await;
        state
            .items
            .get(&id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    async fn save_work_item(&self, item: &WorkItem) -> Result<WorkItem, RegistryError> {
        let mut state = self.state.lock().await;
        state.check_write()?;
        state.item_saves += 1;
        state.items.insert(item.id, item.clone());
        Ok(item.clone())
    }

    async fn get_state(&self, id: WorkItemId) -> Result<Option<serde_json::Value>, RegistryError> {
        Ok(self.state.lock().await.states.get(&id).cloned())
    }

    async fn save_state(&self, id: WorkItemId, value: serde_json::Value) -> Result<(), RegistryError> {
        let mut state = self.state.lock().await;
        state.check_write()?;
        state.states.insert(id, value);
        Ok(())
    }

    async fn list_institutions(&self) -> Result<Vec<Institution>, RegistryError> {
        Ok(self.state.lock().await.institutions.clone())
    }

    async fn get_object(&self, identifier: &str) -> Result<Option<IntellectualObject>, RegistryError> {
        Ok(self.state.lock().await.objects.get(identifier).cloned())
    }

    async fn save_object(&self, object: &IntellectualObject) -> Result<IntellectualObject, RegistryError> {
        let mut state = self.state.lock().await;
        state.check_write()?;
        state
            .objects
            .insert(object.identifier.clone(), object.clone());
        Ok(object.clone())
    }

    async fn get_generic_file(&self, identifier: &str) -> Result<GenericFile, RegistryError> {
        let state = self.state.lock().await;
        state
            .files
            .get(identifier)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(identifier.to_string()))
    }

    async fn save_generic_file(&self, file: &GenericFile) -> Result<GenericFile, RegistryError> {
        let mut state = self.state.lock().await;
        state.check_write()?;
        state.check_armed(WriteKind::GenericFile)?;
        state.files.insert(file.identifier.clone(), file.clone());
        Ok(file.clone())
    }

    async fn save_generic_files(&self, files: &[GenericFile]) -> Result<Vec<GenericFile>, RegistryError> {
        let mut state = self.state.lock().await;
        state.check_write()?;
        for file in files {
            state.files.insert(file.identifier.clone(), file.clone());
        }
        Ok(files.to_vec())
    }

    async fn list_generic_files(&self, query: &FileQuery) -> Result<Page<GenericFile>, RegistryError> {
        let state = self.state.lock().await;
        let mut matching: Vec<GenericFile> = state
            .files
            .values()
            .filter(|f| f.state == FileState::Active)
            .filter(|f| {
                query
                    .object_identifier
                    .as_ref()
                    .is_none_or(|o| &f.object_identifier == o)
            })
            .filter(|f| {
                query
                    .not_checked_since
                    .is_none_or(|since| f.last_fixity_check.is_none_or(|last| last < since))
            })
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.identifier.cmp(&b.identifier));
        Ok(paginate(matching, query.page, query.per_page))
    }

    async fn latest_event(
        &self,
        file_identifier: &str,
        event_type: EventType,
    ) -> Result<Option<PremisEvent>, RegistryError> {
        let state = self.state.lock().await;
        Ok(state
            .events
            .iter()
            .filter(|e| e.event_type == event_type)
            .filter(|e| e.generic_file_identifier.as_deref() == Some(file_identifier))
            .max_by_key(|e| e.date_time)
            .cloned())
    }

    async fn save_event(&self, event: &PremisEvent) -> Result<(), RegistryError> {
        let mut state = self.state.lock().await;
        state.check_write()?;
        state.check_armed(WriteKind::Event)?;
        state.events.push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Action;
    use chrono::{Duration, TimeZone, Utc};
    use ulid::Ulid;

    fn item(name: &str, offset: i64) -> WorkItem {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(offset);
        let mut item = WorkItem::new(WorkItemId::from_ulid(Ulid::new()), Action::Ingest, now);
        item.name = name.to_string();
        item
    }

    #[tokio::test]
    async fn pages_are_ordered_and_flag_next() {
        let registry = InMemoryRegistry::new();
        for i in 0..5 {
            registry.save_work_item(&item(&format!("bag{i}"), i)).await.unwrap();
        }
        let mut query = WorkItemQuery::first_page(2);
        let first = registry.list_work_items(&query).await.unwrap();
        assert_eq!(first.items.len(), 2);
        assert!(first.has_next);
        assert_eq!(first.items[0].name, "bag0");

        query.page = 3;
        let last = registry.list_work_items(&query).await.unwrap();
        assert_eq!(last.items.len(), 1);
        assert!(!last.has_next);

        query.page = 4;
        assert!(registry.list_work_items(&query).await.unwrap().items.is_empty());
    }

    #[tokio::test]
    async fn find_returns_most_recent_match() {
        let registry = InMemoryRegistry::new();
        registry.save_work_item(&item("bag", 0)).await.unwrap();
        let newer = item("bag", 10);
        registry.save_work_item(&newer).await.unwrap();

        let query = WorkItemQuery {
            name: Some("bag".to_string()),
            ..WorkItemQuery::first_page(10)
        };
        let found = registry.find_work_item(&query).await.unwrap().unwrap();
        assert_eq!(found.id, newer.id);
    }

    #[tokio::test]
    async fn injected_failures_are_transient() {
        let registry = InMemoryRegistry::new();
        registry.fail_next_writes(1).await;
        let it = item("bag", 0);
        assert!(matches!(
            registry.save_work_item(&it).await,
            Err(RegistryError::Unavailable(_))
        ));
        registry.save_work_item(&it).await.unwrap();
        assert_eq!(registry.item_saves().await, 1);
    }
}
