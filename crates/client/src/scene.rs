//! The narrow interface between a session and whatever renders its objects.
//!
//! A session never looks inside the scene. It samples transforms of objects
//! it owns, pushes transforms into mirrors of foreign objects, and asks the
//! scene to build, replace or tear down mirrors from templates.

use std::collections::BTreeMap;
use std::fmt;

use fastsync_core::{SessionId, Transform};
use fastsync_wire::{RemoteElTemplate, SyncConfig};
use serde_json::Value;

/// How a remote peer should recreate a locally owned object.
#[derive(Debug, Clone, PartialEq)]
pub enum Representation {
    /// Serialized markup to instantiate verbatim.
    Html(String),
    /// Clone-by-reference configuration.
    Clone(Value),
}

/// Scene-graph operations a session needs.
pub trait Scene {
    /// Reference to one object in the scene.
    type Handle: Clone + fmt::Debug;

    /// Current rotation/position of an object; world space if `world` is set.
    fn sample(&self, handle: &Self::Handle, world: bool) -> Transform;

    fn apply_transform(&mut self, handle: &Self::Handle, transform: Transform);

    /// Serialize an owned object for remote instantiation.
    fn represent(&self, handle: &Self::Handle, config: &SyncConfig) -> Representation;

    /// Build the local mirror of an object owned by `owner`.
    fn instantiate(&mut self, owner: SessionId, template: &RemoteElTemplate) -> Self::Handle;

    fn despawn(&mut self, handle: &Self::Handle);

    /// Replace the inner content of a mirror.
    fn set_html(&mut self, handle: &Self::Handle, html: &str);

    fn attribute(&self, handle: &Self::Handle, name: &str) -> Option<String>;

    /// Set an attribute; `None` removes it.
    fn set_attribute(&mut self, handle: &Self::Handle, name: &str, value: Option<&str>);

    /// Called when the session gains or loses authorship of an object.
    fn ownership_changed(&mut self, _handle: &Self::Handle, _owned: bool) {}
}

// ============================================================================
// In-memory scene
// ============================================================================

/// Handle into a [`MemoryScene`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(pub u64);

/// One object of a [`MemoryScene`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Entity {
    pub transform: Transform,
    pub html: String,
    pub attributes: BTreeMap<String, String>,
    /// `true` while the owning session samples this entity.
    pub owned: bool,
    /// Session that created the mirror, `None` for locally spawned entities.
    pub mirror_of: Option<SessionId>,
}

/// Headless scene that keeps entities in a map.
///
/// Useful for bots, tooling, and tests that drive a session without a
/// renderer.
#[derive(Debug, Default)]
pub struct MemoryScene {
    next_id: u64,
    entities: BTreeMap<EntityId, Entity>,
}

impl MemoryScene {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a locally authored entity.
    pub fn spawn(&mut self, html: impl Into<String>, transform: Transform) -> EntityId {
        self.insert(Entity {
            transform,
            html: html.into(),
            owned: true,
            ..Default::default()
        })
    }

    pub fn entity(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(&id)
    }

    pub fn set_transform(&mut self, id: EntityId, transform: Transform) {
        if let Some(entity) = self.entities.get_mut(&id) {
            entity.transform = transform;
        }
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Mirrors created on behalf of `owner`.
    pub fn mirrors_of(&self, owner: SessionId) -> impl Iterator<Item = (EntityId, &Entity)> {
        self.entities
            .iter()
            .filter(move |(_, e)| e.mirror_of == Some(owner))
            .map(|(id, e)| (*id, e))
    }

    fn insert(&mut self, entity: Entity) -> EntityId {
        self.next_id += 1;
        let id = EntityId(self.next_id);
        self.entities.insert(id, entity);
        id
    }
}

impl Scene for MemoryScene {
    type Handle = EntityId;

    fn sample(&self, handle: &EntityId, _world: bool) -> Transform {
        self.entities
            .get(handle)
            .map(|e| e.transform)
            .unwrap_or_default()
    }

    fn apply_transform(&mut self, handle: &EntityId, transform: Transform) {
        self.set_transform(*handle, transform);
    }

    fn represent(&self, handle: &EntityId, _config: &SyncConfig) -> Representation {
        let html = self
            .entities
            .get(handle)
            .map(|e| e.html.clone())
            .unwrap_or_default();
        Representation::Html(html)
    }

    fn instantiate(&mut self, owner: SessionId, template: &RemoteElTemplate) -> EntityId {
        let html = match (&template.html, &template.clone) {
            (Some(html), _) => html.clone(),
            (None, Some(clone)) => clone.to_string(),
            (None, None) => String::new(),
        };
        let attributes = template
            .transferables
            .iter()
            .filter_map(|(k, v)| v.clone().map(|v| (k.clone(), v)))
            .collect();
        self.insert(Entity {
            html,
            attributes,
            mirror_of: Some(owner),
            ..Default::default()
        })
    }

    fn despawn(&mut self, handle: &EntityId) {
        self.entities.remove(handle);
    }

    fn set_html(&mut self, handle: &EntityId, html: &str) {
        if let Some(entity) = self.entities.get_mut(handle) {
            entity.html = html.to_string();
        }
    }

    fn attribute(&self, handle: &EntityId, name: &str) -> Option<String> {
        self.entities.get(handle)?.attributes.get(name).cloned()
    }

    fn set_attribute(&mut self, handle: &EntityId, name: &str, value: Option<&str>) {
        let Some(entity) = self.entities.get_mut(handle) else {
            return;
        };
        match value {
            Some(value) => {
                entity.attributes.insert(name.to_string(), value.to_string());
            }
            None => {
                entity.attributes.remove(name);
            }
        }
    }

    fn ownership_changed(&mut self, handle: &EntityId, owned: bool) {
        if let Some(entity) = self.entities.get_mut(handle) {
            entity.owned = owned;
        }
    }
}
