//! Versioned, thread-safe data container passed between workflow steps.

use crate::artifact::Artifact;
use crate::message::Message;
use crate::Value;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// The data flowing through a workflow.
///
/// A state holds string-keyed values, immutable artifacts, an ordered
/// message log and free-form metadata. Reads and writes are internally
/// serialized, so a state can be shared behind an `Arc` and every method
/// takes `&self`. Every mutation bumps [`version`](State::version) and
/// refreshes [`modified`](State::modified).
///
/// Sharing one instance between concurrent branches is the caller's
/// business; [`Clone`] is how a branch gets an independent copy. A clone
/// gets a fresh id, records the source as its parent, restarts at
/// version 1 and deep-copies values and metadata. Artifacts are shared.
///
/// # Examples
///
/// ```
/// use hataori_core::State;
///
/// let state = State::new();
/// state.set("topic", "quantum computing");
/// assert_eq!(state.version(), 2);
///
/// let copy = state.clone();
/// copy.set("topic", "biology");
///
/// assert_eq!(state.get_as::<String>("topic").as_deref(), Some("quantum computing"));
/// assert_eq!(copy.parent_id(), Some(state.id()));
/// assert_eq!(copy.version(), 2);
/// ```
pub struct State {
    id: String,
    created: DateTime<Utc>,
    parent_id: Option<String>,
    inner: RwLock<StateData>,
}

#[derive(Clone)]
struct StateData {
    modified: DateTime<Utc>,
    values: HashMap<String, Value>,
    artifacts: HashMap<String, Arc<Artifact>>,
    messages: Vec<Message>,
    metadata: HashMap<String, Value>,
    version: u64,
}

impl StateData {
    fn empty(now: DateTime<Utc>) -> Self {
        Self {
            modified: now,
            values: HashMap::new(),
            artifacts: HashMap::new(),
            messages: Vec::new(),
            metadata: HashMap::new(),
            version: 1,
        }
    }

    fn touch(&mut self) {
        let now = Utc::now();
        // the wall clock may step backwards; modified never does
        if now > self.modified {
            self.modified = now;
        }
        self.version += 1;
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.inner.read();
        f.debug_struct("State")
            .field("id", &self.id)
            .field("parent_id", &self.parent_id)
            .field("version", &data.version)
            .field("keys", &data.values.keys().collect::<Vec<_>>())
            .field("artifacts", &data.artifacts.len())
            .field("messages", &data.messages.len())
            .finish()
    }
}

impl State {
    /// Creates an empty root state at version 1.
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created: now,
            parent_id: None,
            inner: RwLock::new(StateData::empty(now)),
        }
    }

    /// Creates a root state pre-populated with `values`.
    ///
    /// The initial values do not count as mutations: the state starts at
    /// version 1.
    pub fn with_values<K, V>(values: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
    {
        let state = Self::new();
        {
            let mut data = state.inner.write();
            data.values
                .extend(values.into_iter().map(|(k, v)| (k.into(), v.into())));
        }
        state
    }

    /// Wraps the state in an `Arc`.
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    pub fn modified(&self) -> DateTime<Utc> {
        self.inner.read().modified
    }

    /// Id of the state this one was cloned from.
    pub fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    pub fn version(&self) -> u64 {
        self.inner.read().version
    }

    /// Returns a copy of the value stored under `key`.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.read().values.get(key).cloned()
    }

    /// Returns the value under `key` deserialized as `T`.
    ///
    /// Returns `None` if the key is missing or the value has another shape.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let data = self.inner.read();
        let value = data.values.get(key)?;
        T::deserialize(value).ok()
    }

    pub fn has(&self, key: &str) -> bool {
        self.inner.read().values.contains_key(key)
    }

    /// Returns all value keys in no particular order.
    pub fn keys(&self) -> Vec<String> {
        self.inner.read().values.keys().cloned().collect()
    }

    /// Returns a copy of all values.
    pub fn values(&self) -> HashMap<String, Value> {
        self.inner.read().values.clone()
    }

    /// Stores `value` under `key`, replacing any previous value.
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        let mut data = self.inner.write();
        data.values.insert(key.into(), value.into());
        data.touch();
    }

    /// Removes `key`. Counts as a mutation even if the key was absent.
    pub fn delete(&self, key: &str) {
        let mut data = self.inner.write();
        data.values.remove(key);
        data.touch();
    }

    /// Adds an artifact, keyed by its id.
    pub fn add_artifact(&self, artifact: impl Into<Arc<Artifact>>) {
        let artifact = artifact.into();
        let mut data = self.inner.write();
        data.artifacts.insert(artifact.id.clone(), artifact);
        data.touch();
    }

    pub fn artifact(&self, id: &str) -> Option<Arc<Artifact>> {
        self.inner.read().artifacts.get(id).cloned()
    }

    pub fn artifacts(&self) -> HashMap<String, Arc<Artifact>> {
        self.inner.read().artifacts.clone()
    }

    /// Appends a message to the conversation log.
    pub fn add_message(&self, message: Message) {
        let mut data = self.inner.write();
        data.messages.push(message);
        data.touch();
    }

    pub fn messages(&self) -> Vec<Message> {
        self.inner.read().messages.clone()
    }

    pub fn set_metadata(&self, key: impl Into<String>, value: impl Into<Value>) {
        let mut data = self.inner.write();
        data.metadata.insert(key.into(), value.into());
        data.touch();
    }

    pub fn metadata(&self, key: &str) -> Option<Value> {
        self.inner.read().metadata.get(key).cloned()
    }

    pub fn all_metadata(&self) -> HashMap<String, Value> {
        self.inner.read().metadata.clone()
    }

    /// Merges `other` into this state.
    ///
    /// Values, artifacts and metadata of `other` overwrite on key
    /// collision, its messages are appended, and the version is bumped
    /// exactly once.
    pub fn merge(&self, other: &State) {
        // copy out first so that merging a state into itself cannot deadlock
        let incoming = other.inner.read().clone();

        let mut data = self.inner.write();
        data.values.extend(incoming.values);
        data.artifacts.extend(incoming.artifacts);
        data.messages.extend(incoming.messages);
        data.metadata.extend(incoming.metadata);
        data.touch();
    }

    /// Captures a serializable point-in-time view of the state.
    pub fn snapshot(&self) -> StateSnapshot {
        let data = self.inner.read();
        StateSnapshot {
            id: self.id.clone(),
            parent_id: self.parent_id.clone(),
            created: self.created,
            modified: data.modified,
            version: data.version,
            values: data.values.clone(),
            artifacts: data.artifacts.values().map(|a| a.as_ref().clone()).collect(),
            messages: data.messages.clone(),
            metadata: data.metadata.clone(),
        }
    }
}

impl Clone for State {
    /// Creates a child state: new id, parent set to `self`, version 1.
    fn clone(&self) -> Self {
        let now = Utc::now();
        let source = self.inner.read();
        Self {
            id: Uuid::new_v4().to_string(),
            created: now,
            parent_id: Some(self.id.clone()),
            inner: RwLock::new(StateData {
                modified: now,
                values: source.values.clone(),
                artifacts: source.artifacts.clone(),
                messages: source.messages.clone(),
                metadata: source.metadata.clone(),
                version: 1,
            }),
        }
    }
}

impl Serialize for State {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.snapshot().serialize(serializer)
    }
}

/// Serializable copy of a [`State`] at one point in time.
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub version: u64,
    pub values: HashMap<String, Value>,
    pub artifacts: Vec<Artifact>,
    pub messages: Vec<Message>,
    pub metadata: HashMap<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ArtifactType;
    use serde_json::json;

    #[test]
    fn test_new_state_is_empty() {
        let state = State::new();
        assert_eq!(state.version(), 1);
        assert!(state.keys().is_empty());
        assert!(state.messages().is_empty());
        assert!(state.parent_id().is_none());
    }

    #[test]
    fn test_every_mutation_bumps_version() {
        let state = State::new();
        let mut last_version = state.version();
        let mut last_modified = state.modified();

        let mutations: Vec<Box<dyn Fn(&State)>> = vec![
            Box::new(|s: &State| s.set("a", 1)),
            Box::new(|s: &State| s.delete("a")),
            Box::new(|s: &State| s.add_artifact(Artifact::new("x", ArtifactType::Data, vec![1]))),
            Box::new(|s: &State| s.add_message(Message::user("hi"))),
            Box::new(|s: &State| s.set_metadata("m", true)),
            Box::new(|s: &State| s.merge(&State::new())),
        ];

        for mutate in mutations {
            mutate(&state);
            assert!(state.version() > last_version);
            assert!(state.modified() >= last_modified);
            last_version = state.version();
            last_modified = state.modified();
        }
        assert_eq!(state.version(), 7);
    }

    #[test]
    fn test_clone_is_independent() {
        let state = State::new();
        state.set("nested", json!({"list": [1, 2, 3]}));
        state.set_metadata("owner", "alice");

        let copy = state.clone();
        copy.set("nested", json!({"list": []}));
        copy.set("extra", 1);
        copy.set_metadata("owner", "bob");

        assert_eq!(state.get("nested"), Some(json!({"list": [1, 2, 3]})));
        assert!(!state.has("extra"));
        assert_eq!(state.metadata("owner"), Some(json!("alice")));
    }

    #[test]
    fn test_clone_lineage() {
        let state = State::new();
        state.set("a", 1);
        state.add_message(Message::user("hello"));
        let artifact = Arc::new(Artifact::new("blob", ArtifactType::File, vec![0; 4]));
        state.add_artifact(artifact.clone());

        let copy = state.clone();
        assert_ne!(copy.id(), state.id());
        assert_eq!(copy.parent_id(), Some(state.id()));
        assert_eq!(copy.version(), 1);
        assert_eq!(copy.messages().len(), 1);

        let shared = copy.artifact(&artifact.id).unwrap();
        assert!(Arc::ptr_eq(&shared, &artifact));

        let grandchild = copy.clone();
        assert_eq!(grandchild.parent_id(), Some(copy.id()));
    }

    #[test]
    fn test_merge_overwrites_and_appends() {
        let target = State::new();
        target.set("shared", "old");
        target.set("mine", 1);
        target.add_message(Message::user("first"));

        let other = State::new();
        other.set("shared", "new");
        other.set_metadata("source", "other");
        other.add_message(Message::assistant("second"));

        let before = target.version();
        target.merge(&other);

        assert_eq!(target.version(), before + 1);
        assert_eq!(target.get("shared"), Some(json!("new")));
        assert_eq!(target.get("mine"), Some(json!(1)));
        assert_eq!(target.metadata("source"), Some(json!("other")));
        let contents: Vec<_> = target.messages().into_iter().map(|m| m.content).collect();
        assert_eq!(contents, vec!["first", "second"]);
    }

    #[test]
    fn test_merge_with_itself() {
        let state = State::new();
        state.add_message(Message::user("once"));
        state.merge(&state);
        assert_eq!(state.messages().len(), 2);
    }

    #[test]
    fn test_get_as() {
        let state = State::with_values([("count", json!(3)), ("name", json!("x"))]);
        assert_eq!(state.version(), 1);
        assert_eq!(state.get_as::<u32>("count"), Some(3));
        assert_eq!(state.get_as::<u32>("name"), None);
        assert_eq!(state.get_as::<String>("missing"), None);
    }

    #[test]
    fn test_concurrent_writers() {
        let state = Arc::new(State::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let state = state.clone();
                std::thread::spawn(move || {
                    for j in 0..50 {
                        state.set(format!("k{i}-{j}"), j);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(state.keys().len(), 400);
        assert_eq!(state.version(), 401);
    }

    #[test]
    fn test_snapshot_serializes() {
        let state = State::new();
        state.set("response", "ok");
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["values"]["response"], "ok");
        assert_eq!(json["version"], 2);
        assert!(json.get("parent_id").is_none());
    }
}
