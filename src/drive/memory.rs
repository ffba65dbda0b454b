//! In-process [`RemoteStore`] for tests and dry runs.
//!
//! Ids are `mem0001`, `mem0002`, ... and listings and name lookups follow
//! creation order. Failures can be scripted per operation with [`MemoryStore::fail_next`]
//! (transient) and [`MemoryStore::reject`] (permanent, scoped to one id).

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{
    folder_link, RemoteObject, RemoteStore, StoreConnector, StoreError, FOLDER_MIME,
};

#[derive(Debug, Clone)]
struct Node {
    name: String,
    parent: Option<String>,
    mime_type: String,
    content: Vec<u8>,
    public: bool,
    /// Creation index; ordering never depends on the id text.
    seq: u64,
}

impl Node {
    fn is_folder(&self) -> bool {
        self.mime_type == FOLDER_MIME
    }
}

#[derive(Debug, Default)]
struct State {
    nodes: BTreeMap<String, Node>,
    next_id: u64,
    calls: HashMap<&'static str, usize>,
    transient: HashMap<&'static str, usize>,
    rejected: HashSet<(&'static str, String)>,
}

impl State {
    fn object(&self, id: &str) -> Option<RemoteObject> {
        self.nodes.get(id).map(|node| RemoteObject {
            id: id.to_string(),
            name: node.name.clone(),
            mime_type: node.mime_type.clone(),
            web_view_link: Some(if node.is_folder() {
                folder_link(id)
            } else {
                format!("https://drive.google.com/file/d/{}/view", id)
            }),
        })
    }

    fn insert(&mut self, node: Node) -> String {
        self.next_id += 1;
        let id = format!("mem{:04}", self.next_id);
        self.nodes.insert(id.clone(), Node { seq: self.next_id, ..node });
        id
    }

    /// Ids of matching nodes, oldest first.
    fn matching(&self, pred: impl Fn(&Node) -> bool) -> Vec<String> {
        let mut found: Vec<(&String, &Node)> = self.nodes.iter().filter(|(_, n)| pred(n)).collect();
        found.sort_by_key(|(_, n)| n.seq);
        found.into_iter().map(|(id, _)| id.clone()).collect()
    }

    fn children(&self, parent: &str) -> Vec<String> {
        self.matching(|n| n.parent.as_deref() == Some(parent))
    }

    /// Record the call and apply any scripted failure.
    fn enter(&mut self, op: &'static str, target: &str) -> Result<(), StoreError> {
        *self.calls.entry(op).or_default() += 1;
        if self.rejected.contains(&(op, target.to_string())) {
            return Err(StoreError::Rejected {
                op,
                status: 403,
                message: format!("scripted rejection for {}", target),
            });
        }
        if let Some(left) = self.transient.get_mut(op) {
            if *left > 0 {
                *left -= 1;
                return Err(StoreError::Transient {
                    op,
                    message: "scripted transient failure".into(),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make the next `times` calls of `op` fail transiently.
    pub fn fail_next(&self, op: &'static str, times: usize) {
        self.lock().transient.insert(op, times);
    }

    /// Make every call of `op` against `id` fail permanently.
    pub fn reject(&self, op: &'static str, id: &str) {
        self.lock().rejected.insert((op, id.to_string()));
    }

    /// Lift a rejection set with [`MemoryStore::reject`].
    pub fn allow(&self, op: &'static str, id: &str) {
        self.lock().rejected.remove(&(op, id.to_string()));
    }

    pub fn call_count(&self, op: &str) -> usize {
        self.lock().calls.get(op).copied().unwrap_or(0)
    }

    pub fn reset_calls(&self) {
        self.lock().calls.clear();
    }

    /// Create a container directly, bypassing call accounting.
    pub fn seed_folder(&self, parent: Option<&str>, name: &str) -> String {
        self.lock().insert(Node {
            name: name.to_string(),
            parent: parent.map(str::to_string),
            mime_type: FOLDER_MIME.to_string(),
            content: Vec::new(),
            public: false,
            seq: 0,
        })
    }

    pub fn seed_file(&self, parent: &str, name: &str, mime_type: &str, content: &[u8]) -> String {
        self.lock().insert(Node {
            name: name.to_string(),
            parent: Some(parent.to_string()),
            mime_type: mime_type.to_string(),
            content: content.to_vec(),
            public: false,
            seq: 0,
        })
    }

    /// Resolve a path of names starting from a top-level container.
    pub fn resolve(&self, path: &[&str]) -> Option<String> {
        let state = self.lock();
        let mut current: Option<String> = None;
        for name in path {
            let next = state
                .matching(|n| n.parent == current && n.name == *name)
                .into_iter()
                .next()?;
            current = Some(next);
        }
        current
    }

    pub fn children_of(&self, parent: &str) -> Vec<RemoteObject> {
        let state = self.lock();
        state
            .children(parent)
            .iter()
            .filter_map(|id| state.object(id))
            .collect()
    }

    pub fn content(&self, id: &str) -> Option<Vec<u8>> {
        self.lock().nodes.get(id).map(|n| n.content.clone())
    }

    pub fn exists(&self, id: &str) -> bool {
        self.lock().nodes.contains_key(id)
    }

    pub fn is_public(&self, id: &str) -> bool {
        self.lock().nodes.get(id).map(|n| n.public).unwrap_or(false)
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn find_folder(
        &self,
        parent: Option<&str>,
        name: &str,
    ) -> Result<Option<RemoteObject>, StoreError> {
        let mut state = self.lock();
        state.enter("find_folder", name)?;
        let found = state
            .matching(|n| {
                n.is_folder()
                    && n.name == name
                    && parent.map_or(true, |p| n.parent.as_deref() == Some(p))
            })
            .into_iter()
            .next();
        Ok(found.and_then(|id| state.object(&id)))
    }

    async fn find_file(
        &self,
        parent: &str,
        name: &str,
    ) -> Result<Option<RemoteObject>, StoreError> {
        let mut state = self.lock();
        state.enter("find_file", name)?;
        let found = state
            .matching(|n| !n.is_folder() && n.name == name && n.parent.as_deref() == Some(parent))
            .into_iter()
            .next();
        Ok(found.and_then(|id| state.object(&id)))
    }

    async fn list_children(&self, parent: &str) -> Result<Vec<RemoteObject>, StoreError> {
        let mut state = self.lock();
        state.enter("list_children", parent)?;
        if !state.nodes.contains_key(parent) {
            return Err(StoreError::NotFound(format!("container {}", parent)));
        }
        Ok(state
            .children(parent)
            .iter()
            .filter_map(|id| state.object(id))
            .collect())
    }

    async fn create_folder(
        &self,
        parent: Option<&str>,
        name: &str,
    ) -> Result<RemoteObject, StoreError> {
        let mut state = self.lock();
        state.enter("create_folder", name)?;
        let id = state.insert(Node {
            name: name.to_string(),
            parent: parent.map(str::to_string),
            mime_type: FOLDER_MIME.to_string(),
            content: Vec::new(),
            public: false,
            seq: 0,
        });
        state
            .object(&id)
            .ok_or_else(|| StoreError::InvalidResponse(id))
    }

    async fn create_file(
        &self,
        parent: &str,
        name: &str,
        mime_type: &str,
        content: &[u8],
    ) -> Result<RemoteObject, StoreError> {
        let mut state = self.lock();
        state.enter("create_file", name)?;
        let id = state.insert(Node {
            name: name.to_string(),
            parent: Some(parent.to_string()),
            mime_type: mime_type.to_string(),
            content: content.to_vec(),
            public: false,
            seq: 0,
        });
        state
            .object(&id)
            .ok_or_else(|| StoreError::InvalidResponse(id))
    }

    async fn read_file(&self, id: &str) -> Result<Vec<u8>, StoreError> {
        let mut state = self.lock();
        state.enter("read_file", id)?;
        state
            .nodes
            .get(id)
            .map(|n| n.content.clone())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn update_file(
        &self,
        id: &str,
        mime_type: &str,
        content: &[u8],
    ) -> Result<(), StoreError> {
        let mut state = self.lock();
        state.enter("update_file", id)?;
        let node = state
            .nodes
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        node.mime_type = mime_type.to_string();
        node.content = content.to_vec();
        Ok(())
    }

    async fn copy_file(
        &self,
        id: &str,
        dest_parent: &str,
        name: &str,
    ) -> Result<RemoteObject, StoreError> {
        let mut state = self.lock();
        state.enter("copy_file", id)?;
        let source = state
            .nodes
            .get(id)
            .filter(|n| !n.is_folder())
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let copy = state.insert(Node {
            name: name.to_string(),
            parent: Some(dest_parent.to_string()),
            public: false,
            ..source
        });
        state
            .object(&copy)
            .ok_or_else(|| StoreError::InvalidResponse(copy))
    }

    async fn move_object(
        &self,
        id: &str,
        _from_parent: &str,
        to_parent: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.lock();
        state.enter("move_object", id)?;
        let node = state
            .nodes
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        node.parent = Some(to_parent.to_string());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let mut state = self.lock();
        state.enter("delete", id)?;
        let mut pending = vec![id.to_string()];
        while let Some(next) = pending.pop() {
            pending.extend(state.children(&next));
            state.nodes.remove(&next);
        }
        Ok(())
    }

    async fn set_public(&self, id: &str) -> Result<(), StoreError> {
        let mut state = self.lock();
        state.enter("set_public", id)?;
        let node = state
            .nodes
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        node.public = true;
        Ok(())
    }
}

#[async_trait]
impl StoreConnector for MemoryStore {
    async fn connect(&self) -> Result<Arc<dyn RemoteStore>, StoreError> {
        Ok(Arc::new(self.clone()))
    }
}
