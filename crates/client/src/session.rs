//! Sans-IO client session.
//!
//! [`ClientSession`] owns everything one connection knows: its assigned id,
//! the locally owned objects, the mirrors of foreign objects, the room roster
//! and any in-flight ownership transfers. It consumes inbound frames and
//! produces outbound frames into a queue; the caller moves bytes.
//!
//! Control messages are applied as they are handed in. Binary frames only
//! touch transforms of mirrors that already exist, so a frame that races
//! ahead of the template that creates its mirror is dropped silently.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::time::Instant;

use fastsync_core::{DirtyTracker, SYNC_ID_STRIDE, SessionId, SlotAllocator, SyncId, compose_sync_id};
use fastsync_wire::{
    AttributeValues, ClientMessage, Entry, FrameCodec, HtmlUpdate, IdData, PING, PONG, PeerMessage,
    RemoteElTemplate, RemoveRemoteEl, ServerMessage, StealOptions, StealRequest, SyncConfig,
};

use crate::ClientConfig;
use crate::error::SessionError;
use crate::scene::{Representation, Scene};

/// Frame queued for the socket.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(String),
    Binary(Vec<u8>),
}

/// Something the application may want to react to.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Session id assigned by the relay.
    Ready { session_id: SessionId },
    UserJoined(SessionId),
    UserLeft(SessionId),
    ForeignSpawned { owner: SessionId, sync_id: SyncId },
    ForeignRemoved { owner: SessionId, sync_id: SyncId },
    /// A local object was handed to `by`.
    Stolen { sync_id: SyncId, by: SessionId },
    /// A steal issued by this session completed; the object is now local.
    StealCompleted { id_data: IdData },
    /// A pending steal can no longer complete: the mirror is gone.
    StealFailed { id_data: IdData },
}

/// Result of [`ClientSession::steal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StealStatus {
    /// Request broadcast to the room.
    Requested,
    /// A request for the same object is already in flight.
    Pending,
    /// The object is already owned by this session.
    AlreadyOwned,
}

#[derive(Debug)]
struct LocalObject<H> {
    handle: H,
    /// Allocator slot; `None` for objects acquired from another session.
    slot: Option<u32>,
    config: SyncConfig,
    /// Previous identity, announced once after a steal.
    was: Option<IdData>,
}

#[derive(Debug)]
struct ForeignObject<H> {
    handle: H,
    /// Session that created the mirror, updated when ownership migrates.
    original_creator: SessionId,
    /// Last session seen claiming this object.
    claimant: Option<SessionId>,
    config: SyncConfig,
    transferables: AttributeValues,
}

#[derive(Debug)]
enum DeferredOp {
    Remove(SyncId),
    Html(HtmlUpdate),
}

#[derive(Debug)]
struct Deferred {
    due: Instant,
    sender: SessionId,
    op: DeferredOp,
}

/// One client connection's synchronization state.
pub struct ClientSession<S: Scene> {
    config: ClientConfig,
    room: String,
    id: Option<SessionId>,
    codec: FrameCodec,
    slots: SlotAllocator,
    objects: BTreeMap<SyncId, LocalObject<S::Handle>>,
    foreign: HashMap<(SessionId, SyncId), ForeignObject<S::Handle>>,
    /// Slots of objects given away, held until their mirror is removed.
    lent_slots: HashMap<SyncId, u32>,
    tracker: DirtyTracker,
    known_users: BTreeSet<SessionId>,
    pending_steals: HashMap<IdData, StealOptions>,
    deferred: Vec<Deferred>,
    awaiting_pong: bool,
    outbox: VecDeque<Outbound>,
    events: VecDeque<SessionEvent>,
}

impl<S: Scene> ClientSession<S> {
    pub fn new(room: impl Into<String>, config: ClientConfig) -> Self {
        Self {
            codec: FrameCodec::new(config.encoding),
            config,
            room: room.into(),
            id: None,
            slots: SlotAllocator::new(),
            objects: BTreeMap::new(),
            foreign: HashMap::new(),
            lent_slots: HashMap::new(),
            tracker: DirtyTracker::new(),
            known_users: BTreeSet::new(),
            pending_steals: HashMap::new(),
            deferred: Vec::new(),
            awaiting_pong: false,
            outbox: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.id
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    /// Other members of the room as of the last roster.
    pub fn known_users(&self) -> &BTreeSet<SessionId> {
        &self.known_users
    }

    pub fn owns(&self, sync_id: SyncId) -> bool {
        self.objects.contains_key(&sync_id)
    }

    pub fn local_ids(&self) -> impl Iterator<Item = SyncId> + '_ {
        self.objects.keys().copied()
    }

    pub fn local_handle(&self, sync_id: SyncId) -> Option<&S::Handle> {
        self.objects.get(&sync_id).map(|o| &o.handle)
    }

    pub fn foreign_handle(&self, owner: SessionId, sync_id: SyncId) -> Option<&S::Handle> {
        self.foreign.get(&(owner, sync_id)).map(|f| &f.handle)
    }

    pub fn foreign_count(&self) -> usize {
        self.foreign.len()
    }

    /// Last session seen claiming a foreign object.
    pub fn claimant(&self, owner: SessionId, sync_id: SyncId) -> Option<SessionId> {
        self.foreign.get(&(owner, sync_id)).and_then(|f| f.claimant)
    }

    pub fn is_steal_pending(&self, id_data: &IdData) -> bool {
        self.pending_steals.contains_key(id_data)
    }

    /// Take every frame queued for the socket, oldest first.
    pub fn drain_outgoing(&mut self) -> Vec<Outbound> {
        self.outbox.drain(..).collect()
    }

    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        self.events.drain(..).collect()
    }

    // ------------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------------

    /// Apply one text frame from the relay.
    pub fn handle_text(&mut self, scene: &mut S, text: &str, now: Instant) -> Result<(), SessionError> {
        if text == PONG {
            self.awaiting_pong = false;
            return Ok(());
        }

        match ServerMessage::parse(text)? {
            ServerMessage::Handshake { session_id } => {
                if let Some(current) = self.id {
                    tracing::debug!(current, offered = session_id, "ignoring repeated handshake");
                    return Ok(());
                }
                self.id = Some(session_id);
                self.send_control(&ClientMessage::Handshake {
                    room: self.room.clone(),
                })?;
                self.events.push_back(SessionEvent::Ready { session_id });
                Ok(())
            }
            ServerMessage::UpdateUsers { members } => self.on_roster(scene, members),
            ServerMessage::Relayed { sender, message } => {
                if Some(sender) == self.id {
                    return Ok(());
                }
                match message {
                    PeerMessage::UpdateRemoteEl(template) => self.on_template(scene, sender, template),
                    PeerMessage::RemoveRemoteEl(RemoveRemoteEl { sync_id }) => {
                        if !self.remove_foreign(scene, sender, sync_id) {
                            self.defer(sender, DeferredOp::Remove(sync_id), now);
                        }
                        Ok(())
                    }
                    PeerMessage::UpdateHtml(update) => {
                        if let Some(f) = self.foreign.get(&(sender, update.sync_id)) {
                            scene.set_html(&f.handle, &update.html_string);
                        } else {
                            self.defer(sender, DeferredOp::Html(update), now);
                        }
                        Ok(())
                    }
                    PeerMessage::StealEl(request) => self.on_steal(scene, sender, request),
                }
            }
        }
    }

    /// Apply one binary frame from the relay. Returns the number of mirrors
    /// updated.
    pub fn handle_binary(&mut self, scene: &mut S, bytes: &[u8]) -> Result<usize, SessionError> {
        let Some(id) = self.id else {
            return Ok(0);
        };
        let groups = self.codec.decode(bytes, Some(id))?;

        let mut applied = 0;
        for group in groups {
            for entry in group.entries {
                if let Some(f) = self.foreign.get(&(group.sender, entry.sync_id)) {
                    scene.apply_transform(&f.handle, entry.transform);
                    applied += 1;
                }
            }
        }
        Ok(applied)
    }

    fn on_roster(&mut self, scene: &mut S, members: Vec<SessionId>) -> Result<(), SessionError> {
        let roster: BTreeSet<SessionId> = members
            .into_iter()
            .filter(|m| Some(*m) != self.id)
            .collect();

        let joined: Vec<_> = roster.difference(&self.known_users).copied().collect();
        let left: Vec<_> = self.known_users.difference(&roster).copied().collect();
        self.known_users = roster;

        for user in joined {
            tracing::info!(user, "user joined");
            let ids: Vec<_> = self.objects.keys().copied().collect();
            for sync_id in ids {
                let template = self.template_for(scene, sync_id, false)?;
                self.send_control(&ClientMessage::Direct {
                    recipient: user,
                    message: PeerMessage::UpdateRemoteEl(template),
                })?;
            }
            self.tracker.request_resync();
            self.events.push_back(SessionEvent::UserJoined(user));
        }

        for user in left {
            tracing::info!(user, "user left");
            let orphaned: Vec<_> = self
                .foreign
                .keys()
                .filter(|(owner, _)| *owner == user)
                .copied()
                .collect();
            for (owner, sync_id) in orphaned {
                self.remove_foreign(scene, owner, sync_id);
            }
            self.events.push_back(SessionEvent::UserLeft(user));
        }
        Ok(())
    }

    fn on_template(
        &mut self,
        scene: &mut S,
        sender: SessionId,
        template: RemoteElTemplate,
    ) -> Result<(), SessionError> {
        let key = (sender, template.sync_id);

        if let Some(was) = template.was {
            let mut migrated = self
                .foreign
                .remove(&(was.original_creator, was.sync_id))
                .ok_or(SessionError::UnknownForeignObject {
                    owner: was.original_creator,
                    sync_id: was.sync_id,
                })?;
            migrated.original_creator = sender;
            migrated.claimant = None;
            if self.pending_steals.remove(&was).is_some() {
                self.events.push_back(SessionEvent::StealFailed { id_data: was });
            }
            if let Some(stale) = self.foreign.insert(key, migrated) {
                scene.despawn(&stale.handle);
            }
            tracing::debug!(
                from = was.original_creator,
                to = sender,
                sync_id = template.sync_id,
                "foreign object migrated"
            );
        }

        if template.html.is_some() || template.clone.is_some() {
            if let Some(old) = self.foreign.remove(&key) {
                scene.despawn(&old.handle);
            }
            let handle = scene.instantiate(sender, &template);
            self.foreign.insert(
                key,
                ForeignObject {
                    handle,
                    original_creator: sender,
                    claimant: None,
                    config: template.config,
                    transferables: template.transferables,
                },
            );
            self.events.push_back(SessionEvent::ForeignSpawned {
                owner: sender,
                sync_id: template.sync_id,
            });
            return Ok(());
        }

        match self.foreign.get_mut(&key) {
            Some(existing) => {
                existing.config = template.config;
                existing.transferables = template.transferables;
            }
            None => tracing::debug!(
                sender,
                sync_id = template.sync_id,
                "template without representation for unknown object"
            ),
        }
        Ok(())
    }

    fn on_steal(&mut self, scene: &mut S, sender: SessionId, request: StealRequest) -> Result<(), SessionError> {
        let id_data = request.id_data;
        let me = self.id.ok_or(SessionError::NotConnected)?;

        if id_data.original_creator == me {
            return self.relinquish(scene, sender, request);
        }

        // The owner acknowledges a steal by echoing it back directly.
        if sender == id_data.original_creator
            && let Some(options) = self.pending_steals.remove(&id_data)
        {
            let promoted = self.promote(scene, id_data, options, request.handoff);
            if promoted.is_err() {
                self.events.push_back(SessionEvent::StealFailed { id_data });
            }
            return promoted;
        }

        // Someone else's object changed hands.
        if let Some(f) = self.foreign.get_mut(&(id_data.original_creator, id_data.sync_id)) {
            f.claimant = Some(sender);
        }
        Ok(())
    }

    /// Give a local object to `requester` and acknowledge directly.
    fn relinquish(&mut self, scene: &mut S, requester: SessionId, request: StealRequest) -> Result<(), SessionError> {
        let id_data = request.id_data;
        let object = self
            .objects
            .remove(&id_data.sync_id)
            .ok_or(SessionError::UnknownObject(id_data.sync_id))?;
        self.tracker.forget(id_data.sync_id);
        if let Some(slot) = object.slot {
            self.lent_slots.insert(id_data.sync_id, slot);
        }

        let mut handoff = AttributeValues::new();
        for name in &request.options.transfer {
            handoff.insert(name.clone(), scene.attribute(&object.handle, name));
            scene.set_attribute(&object.handle, name, None);
        }
        let transferables = object
            .config
            .transferable_names()
            .into_iter()
            .map(|name| {
                let value = handoff
                    .get(&name)
                    .cloned()
                    .unwrap_or_else(|| scene.attribute(&object.handle, &name));
                (name, value)
            })
            .collect();
        scene.ownership_changed(&object.handle, false);

        self.foreign.insert(
            (id_data.original_creator, id_data.sync_id),
            ForeignObject {
                handle: object.handle,
                original_creator: id_data.original_creator,
                claimant: Some(requester),
                config: object.config,
                transferables,
            },
        );

        tracing::info!(sync_id = id_data.sync_id, to = requester, "object stolen");
        self.send_control(&ClientMessage::Direct {
            recipient: requester,
            message: PeerMessage::StealEl(StealRequest {
                id_data,
                options: request.options,
                handoff,
            }),
        })?;
        self.events.push_back(SessionEvent::Stolen {
            sync_id: id_data.sync_id,
            by: requester,
        });
        Ok(())
    }

    /// Turn the mirror named by `id_data` into a local object.
    fn promote(
        &mut self,
        scene: &mut S,
        id_data: IdData,
        options: StealOptions,
        handoff: AttributeValues,
    ) -> Result<(), SessionError> {
        let key = (id_data.original_creator, id_data.sync_id);
        let mirror = self.foreign.remove(&key).ok_or(SessionError::UnknownForeignObject {
            owner: key.0,
            sync_id: key.1,
        })?;

        for name in &options.transfer {
            let value = handoff
                .get(name)
                .or_else(|| mirror.transferables.get(name))
                .cloned()
                .flatten();
            scene.set_attribute(&mirror.handle, name, value.as_deref());
        }
        scene.ownership_changed(&mirror.handle, true);

        let sync_id = id_data.sync_id;
        self.objects.insert(
            sync_id,
            LocalObject {
                handle: mirror.handle,
                slot: self.lent_slots.remove(&sync_id),
                config: mirror.config,
                was: Some(id_data),
            },
        );
        tracing::info!(sync_id, from = id_data.original_creator, "steal completed");

        self.announce(scene, sync_id)?;
        self.events.push_back(SessionEvent::StealCompleted { id_data });
        Ok(())
    }

    /// Remove a mirror. Returns `false` if it does not exist.
    fn remove_foreign(&mut self, scene: &mut S, owner: SessionId, sync_id: SyncId) -> bool {
        let Some(mirror) = self.foreign.remove(&(owner, sync_id)) else {
            return false;
        };
        scene.despawn(&mirror.handle);
        if let Some(slot) = self.lent_slots.remove(&sync_id) {
            self.slots.release(slot);
        }
        self.events.push_back(SessionEvent::ForeignRemoved { owner, sync_id });

        let id_data = IdData {
            original_creator: owner,
            sync_id,
        };
        if self.pending_steals.remove(&id_data).is_some() {
            tracing::debug!(owner, sync_id, "pending steal dropped with its mirror");
            self.events.push_back(SessionEvent::StealFailed { id_data });
        }
        true
    }

    fn defer(&mut self, sender: SessionId, op: DeferredOp, now: Instant) {
        tracing::debug!(sender, ?op, "foreign object not known yet, retrying later");
        self.deferred.push(Deferred {
            due: now + self.config.retry_grace(),
            sender,
            op,
        });
    }

    /// Earliest time [`poll_deferred`](Self::poll_deferred) has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deferred.iter().map(|d| d.due).min()
    }

    /// Retry removals and content updates whose grace period has elapsed.
    ///
    /// Each one that still misses its mirror is reported as
    /// [`SessionError::UnknownForeignObject`].
    pub fn poll_deferred(&mut self, scene: &mut S, now: Instant) -> Vec<SessionError> {
        let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.deferred)
            .into_iter()
            .partition(|d| d.due <= now);
        self.deferred = waiting;

        let mut misses = Vec::new();
        for Deferred { sender, op, .. } in due {
            let sync_id = match &op {
                DeferredOp::Remove(sync_id) => *sync_id,
                DeferredOp::Html(update) => update.sync_id,
            };
            let found = match op {
                DeferredOp::Remove(sync_id) => self.remove_foreign(scene, sender, sync_id),
                DeferredOp::Html(update) => match self.foreign.get(&(sender, update.sync_id)) {
                    Some(f) => {
                        scene.set_html(&f.handle, &update.html_string);
                        true
                    }
                    None => false,
                },
            };
            if !found {
                misses.push(SessionError::UnknownForeignObject {
                    owner: sender,
                    sync_id,
                });
            }
        }
        misses
    }

    // ------------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------------

    /// Run one outgoing tick.
    ///
    /// Samples every owned object. If none changed and no resync is pending,
    /// nothing is sent; otherwise all owned objects go out in one group.
    /// Returns whether a frame was queued.
    pub fn tick(&mut self, scene: &S) -> bool {
        let Some(id) = self.id else {
            return false;
        };
        if self.objects.is_empty() {
            return false;
        }

        let forced = self.tracker.take_resync();
        let mut changed = false;
        let mut entries = Vec::with_capacity(self.objects.len());
        for (&sync_id, object) in &self.objects {
            let transform = scene.sample(&object.handle, object.config.world);
            changed |= self.tracker.should_send(sync_id, &transform);
            entries.push(Entry::new(sync_id, transform));
        }
        if !changed && !forced {
            return false;
        }

        self.outbox.push_back(Outbound::Binary(self.codec.encode(id, &entries)));
        true
    }

    /// Take ownership of a scene object and assign it a sync id.
    pub fn register(&mut self, handle: S::Handle, config: SyncConfig) -> Result<SyncId, SessionError> {
        let id = self.id.ok_or(SessionError::NotConnected)?;
        let slot = self.slots.allocate();
        let Some(sync_id) = compose_sync_id(id, slot) else {
            self.slots.release(slot);
            return Err(SessionError::ObjectLimit(SYNC_ID_STRIDE));
        };
        self.objects.insert(
            sync_id,
            LocalObject {
                handle,
                slot: Some(slot),
                config,
                was: None,
            },
        );
        Ok(sync_id)
    }

    /// Broadcast the template of an owned object to the room.
    pub fn announce(&mut self, scene: &S, sync_id: SyncId) -> Result<(), SessionError> {
        let template = self.template_for(scene, sync_id, true)?;
        self.send_control(&ClientMessage::Broadcast(PeerMessage::UpdateRemoteEl(template)))
    }

    /// Stop owning an object and tell the room to drop its mirrors.
    pub fn remove(&mut self, sync_id: SyncId) -> Result<S::Handle, SessionError> {
        let object = self
            .objects
            .remove(&sync_id)
            .ok_or(SessionError::UnknownObject(sync_id))?;
        if let Some(slot) = object.slot {
            self.slots.release(slot);
        }
        self.tracker.forget(sync_id);
        self.send_control(&ClientMessage::Broadcast(PeerMessage::RemoveRemoteEl(RemoveRemoteEl {
            sync_id,
        })))?;
        Ok(object.handle)
    }

    /// Push new inner content of an owned object to the room.
    pub fn sync_html(&mut self, sync_id: SyncId, html: impl Into<String>) -> Result<(), SessionError> {
        if !self.objects.contains_key(&sync_id) {
            return Err(SessionError::UnknownObject(sync_id));
        }
        self.send_control(&ClientMessage::Broadcast(PeerMessage::UpdateHtml(HtmlUpdate {
            sync_id,
            html_string: html.into(),
        })))
    }

    /// Ask the owner of a foreign object to hand it over.
    pub fn steal(&mut self, id_data: IdData, options: StealOptions) -> Result<StealStatus, SessionError> {
        let me = self.id.ok_or(SessionError::NotConnected)?;
        if id_data.original_creator == me && self.objects.contains_key(&id_data.sync_id) {
            return Ok(StealStatus::AlreadyOwned);
        }
        if self.pending_steals.contains_key(&id_data) {
            return Ok(StealStatus::Pending);
        }
        if !self.foreign.contains_key(&(id_data.original_creator, id_data.sync_id)) {
            return Err(SessionError::UnknownForeignObject {
                owner: id_data.original_creator,
                sync_id: id_data.sync_id,
            });
        }

        self.send_control(&ClientMessage::Broadcast(PeerMessage::StealEl(StealRequest {
            id_data,
            options: options.clone(),
            handoff: AttributeValues::new(),
        })))?;
        self.pending_steals.insert(id_data, options);
        Ok(StealStatus::Requested)
    }

    /// Application-level keepalive. Fails if the previous ping is unanswered.
    pub fn heartbeat(&mut self) -> Result<(), SessionError> {
        if self.awaiting_pong {
            return Err(SessionError::PongTimeout);
        }
        self.awaiting_pong = true;
        self.outbox.push_back(Outbound::Text(PING.to_string()));
        Ok(())
    }

    fn template_for(&mut self, scene: &S, sync_id: SyncId, migrate: bool) -> Result<RemoteElTemplate, SessionError> {
        let object = self
            .objects
            .get_mut(&sync_id)
            .ok_or(SessionError::UnknownObject(sync_id))?;

        let transferables = object
            .config
            .transferable_names()
            .into_iter()
            .map(|name| {
                let value = scene.attribute(&object.handle, &name);
                (name, value)
            })
            .collect();

        let mut template = RemoteElTemplate {
            sync_id,
            config: object.config.clone(),
            transferables,
            ..Default::default()
        };

        // The first broadcast after a steal only re-keys existing mirrors.
        if migrate && let Some(was) = object.was.take() {
            template.was = Some(was);
            return Ok(template);
        }

        match scene.represent(&object.handle, &object.config) {
            Representation::Html(html) => template.html = Some(html),
            Representation::Clone(clone) => template.clone = Some(clone),
        }
        Ok(template)
    }

    fn send_control(&mut self, message: &ClientMessage) -> Result<(), SessionError> {
        self.outbox.push_back(Outbound::Text(message.to_text()?));
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{EntityId, MemoryScene};
    use fastsync_core::Transform;
    use fastsync_wire::{Group, decode, encode};
    use serde_json::Value;
    use std::time::Duration;

    fn relayed(sender: SessionId, message: PeerMessage) -> String {
        ServerMessage::Relayed { sender, message }.to_text().unwrap()
    }

    fn roster(members: &[SessionId]) -> String {
        ServerMessage::UpdateUsers {
            members: members.to_vec(),
        }
        .to_text()
        .unwrap()
    }

    fn connected(id: SessionId) -> (ClientSession<MemoryScene>, MemoryScene) {
        let mut session = ClientSession::new("demo", ClientConfig::default());
        let mut scene = MemoryScene::new();
        session
            .handle_text(&mut scene, &format!(r#"["HANDSHAKE",{id}]"#), Instant::now())
            .unwrap();
        session.drain_outgoing();
        session.drain_events();
        (session, scene)
    }

    fn texts(session: &mut ClientSession<MemoryScene>) -> Vec<Value> {
        session
            .drain_outgoing()
            .into_iter()
            .filter_map(|o| match o {
                Outbound::Text(t) if t != PING => Some(serde_json::from_str(&t).unwrap()),
                _ => None,
            })
            .collect()
    }

    fn binaries(session: &mut ClientSession<MemoryScene>) -> Vec<Vec<Group>> {
        session
            .drain_outgoing()
            .into_iter()
            .filter_map(|o| match o {
                Outbound::Binary(b) => Some(decode(&b).unwrap()),
                Outbound::Text(_) => None,
            })
            .collect()
    }

    fn pose(px: f32) -> Transform {
        Transform::new([0.0, 0.0, 0.0], [px, 2.0, 3.0])
    }

    fn owned_box(session: &mut ClientSession<MemoryScene>, scene: &mut MemoryScene) -> (EntityId, SyncId) {
        let entity = scene.spawn("<a-box></a-box>", pose(1.0));
        let config = SyncConfig {
            transferables: "color".to_string(),
            ..Default::default()
        };
        let sync_id = session.register(entity, config).unwrap();
        (entity, sync_id)
    }

    fn mirror(session: &mut ClientSession<MemoryScene>, scene: &mut MemoryScene, owner: SessionId, sync_id: SyncId) {
        let template = RemoteElTemplate {
            sync_id,
            html: Some("<a-sphere></a-sphere>".to_string()),
            config: SyncConfig {
                transferables: "color".to_string(),
                ..Default::default()
            },
            transferables: [("color".to_string(), Some("red".to_string()))].into(),
            ..Default::default()
        };
        session
            .handle_text(scene, &relayed(owner, PeerMessage::UpdateRemoteEl(template)), Instant::now())
            .unwrap();
    }

    #[test]
    fn test_handshake_replies_with_room() {
        let mut session: ClientSession<MemoryScene> = ClientSession::new("demo", ClientConfig::default());
        let mut scene = MemoryScene::new();
        assert!(matches!(
            session.register(EntityId(1), SyncConfig::default()),
            Err(SessionError::NotConnected)
        ));

        session
            .handle_text(&mut scene, r#"["HANDSHAKE",3]"#, Instant::now())
            .unwrap();
        assert_eq!(session.session_id(), Some(3));
        assert_eq!(
            session.drain_outgoing(),
            vec![Outbound::Text(r#"["HANDSHAKE","demo"]"#.to_string())]
        );
        assert_eq!(session.drain_events(), vec![SessionEvent::Ready { session_id: 3 }]);

        // A second handshake does not rebind the id.
        session
            .handle_text(&mut scene, r#"["HANDSHAKE",9]"#, Instant::now())
            .unwrap();
        assert_eq!(session.session_id(), Some(3));
        assert!(session.drain_outgoing().is_empty());
    }

    #[test]
    fn test_register_composes_and_reuses_sync_ids() {
        let (mut session, mut scene) = connected(3);
        let (_, first) = owned_box(&mut session, &mut scene);
        let (_, second) = owned_box(&mut session, &mut scene);
        assert_eq!(first, 3072);
        assert_eq!(second, 3073);

        session.remove(first).unwrap();
        let (_, again) = owned_box(&mut session, &mut scene);
        assert_eq!(again, 3072);
    }

    #[test]
    fn test_object_limit() {
        let (mut session, mut scene) = connected(1);
        for _ in 0..SYNC_ID_STRIDE {
            owned_box(&mut session, &mut scene);
        }
        let entity = scene.spawn("<a-box></a-box>", pose(0.0));
        assert!(matches!(
            session.register(entity, SyncConfig::default()),
            Err(SessionError::ObjectLimit(1024))
        ));
        session.remove(1024).unwrap();
        assert_eq!(session.register(entity, SyncConfig::default()).unwrap(), 1024);
    }

    #[test]
    fn test_tick_sends_only_when_dirty() {
        let (mut session, mut scene) = connected(3);
        let (entity, sync_id) = owned_box(&mut session, &mut scene);

        assert!(session.tick(&scene));
        let frames = binaries(&mut session);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0][0].sender, 3);
        assert_eq!(frames[0][0].entries, vec![Entry::new(sync_id, pose(1.0))]);

        assert!(!session.tick(&scene));
        assert!(session.drain_outgoing().is_empty());

        scene.set_transform(entity, pose(5.0));
        assert!(session.tick(&scene));
        assert_eq!(binaries(&mut session)[0][0].entries[0].transform, pose(5.0));
    }

    #[test]
    fn test_tick_sends_unfiltered_set() {
        let (mut session, mut scene) = connected(3);
        let (moving, _) = owned_box(&mut session, &mut scene);
        owned_box(&mut session, &mut scene);
        session.tick(&scene);
        session.drain_outgoing();

        scene.set_transform(moving, pose(9.0));
        assert!(session.tick(&scene));
        assert_eq!(binaries(&mut session)[0][0].entries.len(), 2);
    }

    #[test]
    fn test_join_sends_templates_direct_and_forces_resync() {
        let (mut session, mut scene) = connected(3);
        let (_, sync_id) = owned_box(&mut session, &mut scene);
        session.tick(&scene);
        session.drain_outgoing();
        assert!(!session.tick(&scene));

        session
            .handle_text(&mut scene, &roster(&[3, 7]), Instant::now())
            .unwrap();
        let sent = texts(&mut session);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0][0], "UPDATE_REMOTE_EL");
        assert_eq!(sent[0][1], 7);
        assert_eq!(sent[0][2]["syncId"], sync_id);
        assert_eq!(sent[0][2]["html"], "<a-box></a-box>");
        assert_eq!(session.drain_events(), vec![SessionEvent::UserJoined(7)]);

        assert!(session.tick(&scene), "newcomer forces a resync");
        assert!(!session.tick(&scene));
    }

    #[test]
    fn test_leave_despawns_foreign_objects() {
        let (mut session, mut scene) = connected(3);
        session.handle_text(&mut scene, &roster(&[3, 7, 9]), Instant::now()).unwrap();
        mirror(&mut session, &mut scene, 7, 7168);
        mirror(&mut session, &mut scene, 9, 9216);
        assert_eq!(scene.len(), 2);
        session.drain_events();

        session.handle_text(&mut scene, &roster(&[3, 9]), Instant::now()).unwrap();
        assert!(session.foreign_handle(7, 7168).is_none());
        assert!(session.foreign_handle(9, 9216).is_some());
        assert_eq!(scene.len(), 1);
        assert_eq!(
            session.drain_events(),
            vec![
                SessionEvent::ForeignRemoved { owner: 7, sync_id: 7168 },
                SessionEvent::UserLeft(7),
            ]
        );
    }

    #[test]
    fn test_binary_applies_to_known_mirrors_only() {
        let (mut session, mut scene) = connected(3);
        mirror(&mut session, &mut scene, 7, 7168);
        let handle = *session.foreign_handle(7, 7168).unwrap();

        let mut frame = encode(7, &[Entry::new(7168, pose(4.0)), Entry::new(7169, pose(8.0))]);
        frame.extend(encode(3, &[Entry::new(3072, pose(6.0))]));
        assert_eq!(session.handle_binary(&mut scene, &frame).unwrap(), 1);
        assert_eq!(scene.entity(handle).unwrap().transform, pose(4.0));
    }

    #[test]
    fn test_corrupt_binary_is_rejected_whole() {
        let (mut session, mut scene) = connected(3);
        mirror(&mut session, &mut scene, 7, 7168);
        let handle = *session.foreign_handle(7, 7168).unwrap();

        let mut frame = encode(7, &[Entry::new(7168, pose(4.0))]);
        frame.extend(9u32.to_le_bytes());
        frame.extend(5000u32.to_le_bytes());
        assert!(matches!(
            session.handle_binary(&mut scene, &frame),
            Err(SessionError::Decode(_))
        ));
        assert_eq!(scene.entity(handle).unwrap().transform, Transform::ZERO);
    }

    #[test]
    fn test_template_with_html_replaces_mirror() {
        let (mut session, mut scene) = connected(3);
        mirror(&mut session, &mut scene, 7, 7168);
        let first = *session.foreign_handle(7, 7168).unwrap();
        mirror(&mut session, &mut scene, 7, 7168);
        let second = *session.foreign_handle(7, 7168).unwrap();
        assert_ne!(first, second);
        assert!(scene.entity(first).is_none());
        assert_eq!(scene.len(), 1);
    }

    #[test]
    fn test_template_was_migrates_key() {
        let (mut session, mut scene) = connected(3);
        mirror(&mut session, &mut scene, 7, 7168);
        let handle = *session.foreign_handle(7, 7168).unwrap();

        let template = RemoteElTemplate {
            sync_id: 7168,
            was: Some(IdData {
                original_creator: 7,
                sync_id: 7168,
            }),
            ..Default::default()
        };
        session
            .handle_text(&mut scene, &relayed(9, PeerMessage::UpdateRemoteEl(template.clone())), Instant::now())
            .unwrap();
        assert!(session.foreign_handle(7, 7168).is_none());
        assert_eq!(session.foreign_handle(9, 7168), Some(&handle));
        assert_eq!(session.foreign_count(), 1);

        // Binary updates now resolve under the new owner.
        let frame = encode(9, &[Entry::new(7168, pose(2.5))]);
        assert_eq!(session.handle_binary(&mut scene, &frame).unwrap(), 1);

        // The old key is gone, so a second migration is a hard error.
        assert!(matches!(
            session.handle_text(&mut scene, &relayed(9, PeerMessage::UpdateRemoteEl(template)), Instant::now()),
            Err(SessionError::UnknownForeignObject { owner: 7, sync_id: 7168 })
        ));
    }

    #[test]
    fn test_remove_and_html_retry_after_grace() {
        let (mut session, mut scene) = connected(3);
        let start = Instant::now();

        let remove = relayed(7, PeerMessage::RemoveRemoteEl(RemoveRemoteEl { sync_id: 7168 }));
        let html = relayed(
            7,
            PeerMessage::UpdateHtml(HtmlUpdate {
                sync_id: 7169,
                html_string: "<b>late</b>".to_string(),
            }),
        );
        session.handle_text(&mut scene, &remove, start).unwrap();
        session.handle_text(&mut scene, &html, start).unwrap();
        assert_eq!(session.next_deadline(), Some(start + Duration::from_secs(1)));

        // 7169 shows up within the grace period; 7168 never does.
        mirror(&mut session, &mut scene, 7, 7169);
        assert!(session.poll_deferred(&mut scene, start).is_empty());

        let misses = session.poll_deferred(&mut scene, start + Duration::from_secs(1));
        assert_eq!(misses.len(), 1);
        assert!(matches!(
            misses[0],
            SessionError::UnknownForeignObject { owner: 7, sync_id: 7168 }
        ));
        let handle = *session.foreign_handle(7, 7169).unwrap();
        assert_eq!(scene.entity(handle).unwrap().html, "<b>late</b>");
        assert_eq!(session.next_deadline(), None);
    }

    #[test]
    fn test_owner_relinquishes_and_acks_requester() {
        let (mut owner, mut scene) = connected(3);
        let (entity, sync_id) = owned_box(&mut owner, &mut scene);
        scene.set_attribute(&entity, "color", Some("blue"));

        let id_data = IdData {
            original_creator: 3,
            sync_id,
        };
        let request = StealRequest {
            id_data,
            options: StealOptions {
                transfer: vec!["color".to_string()],
            },
            handoff: AttributeValues::new(),
        };
        owner
            .handle_text(&mut scene, &relayed(7, PeerMessage::StealEl(request)), Instant::now())
            .unwrap();

        assert!(!owner.owns(sync_id));
        assert_eq!(owner.foreign_handle(3, sync_id), Some(&entity));
        assert_eq!(owner.claimant(3, sync_id), Some(7));
        let stripped = scene.entity(entity).unwrap();
        assert!(!stripped.owned);
        assert!(stripped.attributes.get("color").is_none());

        let sent = texts(&mut owner);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0][0], "STEAL_EL");
        assert_eq!(sent[0][1], 7, "ack goes straight to the requester");
        assert_eq!(sent[0][2]["handoff"]["color"], "blue");
        assert_eq!(
            owner.drain_events(),
            vec![SessionEvent::Stolen { sync_id, by: 7 }]
        );

        // The lent slot is not reissued while the object lives on elsewhere.
        let (_, next) = owned_box(&mut owner, &mut scene);
        assert_eq!(next, sync_id + 1);
        assert!(owner.tick(&scene));
        let frames = binaries(&mut owner);
        assert_eq!(frames[0][0].entries.len(), 1);
        assert_eq!(frames[0][0].entries[0].sync_id, next);
    }

    #[test]
    fn test_requester_promotes_on_ack() {
        let (mut requester, mut scene) = connected(7);
        mirror(&mut requester, &mut scene, 3, 3072);
        let handle = *requester.foreign_handle(3, 3072).unwrap();
        requester.drain_events();

        let id_data = IdData {
            original_creator: 3,
            sync_id: 3072,
        };
        let options = StealOptions {
            transfer: vec!["color".to_string()],
        };
        assert_eq!(requester.steal(id_data, options.clone()).unwrap(), StealStatus::Requested);
        assert_eq!(requester.steal(id_data, options.clone()).unwrap(), StealStatus::Pending);
        let sent = texts(&mut requester);
        assert_eq!(sent.len(), 1, "repeated steal does not resend");
        assert_eq!(sent[0].as_array().unwrap().len(), 2);

        let ack = StealRequest {
            id_data,
            options,
            handoff: [("color".to_string(), Some("blue".to_string()))].into(),
        };
        requester
            .handle_text(&mut scene, &relayed(3, PeerMessage::StealEl(ack)), Instant::now())
            .unwrap();

        assert!(requester.owns(3072));
        assert!(requester.foreign_handle(3, 3072).is_none());
        assert!(!requester.is_steal_pending(&id_data));
        let promoted = scene.entity(handle).unwrap();
        assert!(promoted.owned);
        assert_eq!(promoted.attributes.get("color").map(String::as_str), Some("blue"));

        let sent = texts(&mut requester);
        assert_eq!(sent[0][0], "UPDATE_REMOTE_EL");
        assert_eq!(sent[0][1]["syncId"], 3072);
        assert_eq!(sent[0][1]["was"]["originalCreator"], 3);
        assert!(sent[0][1].get("html").is_none());
        assert_eq!(requester.drain_events(), vec![SessionEvent::StealCompleted { id_data }]);

        // Same sync id, now sent under the new owner.
        assert!(requester.tick(&scene));
        let frames = binaries(&mut requester);
        assert_eq!(frames[0][0].sender, 7);
        assert_eq!(frames[0][0].entries[0].sync_id, 3072);

        let now_mine = IdData {
            original_creator: 7,
            sync_id: 3072,
        };
        assert_eq!(
            requester.steal(now_mine, StealOptions::default()).unwrap(),
            StealStatus::AlreadyOwned
        );
    }

    #[test]
    fn test_pending_steal_fails_when_owner_leaves() {
        let (mut requester, mut scene) = connected(7);
        requester
            .handle_text(&mut scene, &roster(&[3, 7]), Instant::now())
            .unwrap();
        mirror(&mut requester, &mut scene, 3, 3072);
        let id_data = IdData {
            original_creator: 3,
            sync_id: 3072,
        };
        requester.steal(id_data, StealOptions::default()).unwrap();
        requester.drain_events();

        requester
            .handle_text(&mut scene, &roster(&[7]), Instant::now())
            .unwrap();
        assert!(!requester.is_steal_pending(&id_data));
        assert!(requester.drain_events().contains(&SessionEvent::StealFailed { id_data }));

        // A fresh request is rejected instead of queuing behind the dead one.
        assert!(matches!(
            requester.steal(id_data, StealOptions::default()),
            Err(SessionError::UnknownForeignObject { .. })
        ));
    }

    #[test]
    fn test_steal_fails_when_object_moves_elsewhere() {
        let (mut requester, mut scene) = connected(7);
        mirror(&mut requester, &mut scene, 3, 3072);
        let id_data = IdData {
            original_creator: 3,
            sync_id: 3072,
        };
        requester.steal(id_data, StealOptions::default()).unwrap();

        requester.drain_events();

        // Another session won the race and announces the object as its own.
        let template = RemoteElTemplate {
            sync_id: 3072,
            was: Some(id_data),
            ..Default::default()
        };
        requester
            .handle_text(&mut scene, &relayed(9, PeerMessage::UpdateRemoteEl(template)), Instant::now())
            .unwrap();
        assert!(!requester.is_steal_pending(&id_data));
        assert_eq!(requester.drain_events(), vec![SessionEvent::StealFailed { id_data }]);

        // A stray ack from the old owner is ignored.
        let ack = StealRequest {
            id_data,
            options: StealOptions::default(),
            handoff: AttributeValues::new(),
        };
        requester
            .handle_text(&mut scene, &relayed(3, PeerMessage::StealEl(ack)), Instant::now())
            .unwrap();
        assert!(!requester.owns(3072));
        assert!(requester.foreign_handle(9, 3072).is_some());
    }

    #[test]
    fn test_bystander_records_claimant_only() {
        let (mut bystander, mut scene) = connected(9);
        mirror(&mut bystander, &mut scene, 3, 3072);
        let request = StealRequest {
            id_data: IdData {
                original_creator: 3,
                sync_id: 3072,
            },
            options: StealOptions::default(),
            handoff: AttributeValues::new(),
        };
        bystander
            .handle_text(&mut scene, &relayed(7, PeerMessage::StealEl(request)), Instant::now())
            .unwrap();
        assert_eq!(bystander.claimant(3, 3072), Some(7));
        assert!(bystander.foreign_handle(3, 3072).is_some());
        assert!(bystander.drain_outgoing().is_empty());
    }

    #[test]
    fn test_steal_unknown_object() {
        let (mut session, _) = connected(7);
        let id_data = IdData {
            original_creator: 3,
            sync_id: 3072,
        };
        assert!(matches!(
            session.steal(id_data, StealOptions::default()),
            Err(SessionError::UnknownForeignObject { .. })
        ));
    }

    #[test]
    fn test_heartbeat_requires_pong() {
        let (mut session, mut scene) = connected(3);
        session.heartbeat().unwrap();
        assert_eq!(session.drain_outgoing(), vec![Outbound::Text(PING.to_string())]);
        assert!(matches!(session.heartbeat(), Err(SessionError::PongTimeout)));

        session.handle_text(&mut scene, PONG, Instant::now()).unwrap();
        assert!(session.heartbeat().is_ok());
    }

    #[test]
    fn test_own_echo_ignored() {
        let (mut session, mut scene) = connected(3);
        mirror(&mut session, &mut scene, 3, 3072);
        assert_eq!(session.foreign_count(), 0);
    }
}
