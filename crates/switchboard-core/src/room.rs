//! Rooms and the room directory.
//!
//! Rooms are named pub/sub groups with an access policy. They are created by
//! an administrative or owning actor and deactivated rather than deleted.

use crate::error::CoreError;
use crate::store::Store;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use switchboard_admission::Identity;
use tracing::{debug, info};

/// Maximum room name length.
pub const MAX_ROOM_NAME_LENGTH: usize = 256;

/// Validate a room name.
///
/// # Errors
///
/// Returns an error message if the room name is invalid.
pub fn validate_room_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Room name cannot be empty");
    }
    if name.len() > MAX_ROOM_NAME_LENGTH {
        return Err("Room name too long");
    }
    if name.starts_with('$') {
        return Err("Room names starting with '$' are reserved");
    }
    // Check for valid ASCII printable characters
    if !name.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("Room name contains invalid characters");
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomType {
    #[default]
    Public,
    Private,
    Direct,
    /// Only the owner may send.
    Broadcast,
    Presence,
}

/// Per-room feature switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomFeatures {
    pub presence: bool,
    pub history: bool,
    pub typing: bool,
}

impl Default for RoomFeatures {
    fn default() -> Self {
        Self {
            presence: true,
            history: true,
            typing: true,
        }
    }
}

/// A named pub/sub group with access policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Room {
    pub name: String,
    pub display_name: String,
    pub room_type: RoomType,
    pub active: bool,
    pub persistent: bool,
    pub owner: Option<String>,
    /// When non-empty, only the owner and these identities may join.
    pub allowed: Vec<String>,
    pub require_authentication: bool,
    /// Live-member ceiling; 0 is unlimited.
    pub max_connections: usize,
    /// 0 defers to the global ceiling.
    pub message_retention_days: u32,
    pub features: RoomFeatures,
    pub created_at: DateTime<Utc>,
}

impl Room {
    /// Whether `identity` passes this room's access policy.
    ///
    /// Anonymous identities are refused when authentication is required.
    /// The owner is always admitted. Otherwise an empty allow-list admits
    /// everyone and a populated one admits only its members.
    #[must_use]
    pub fn can_join(&self, identity: &Identity) -> bool {
        let Some(user) = identity.user_id() else {
            return !self.require_authentication && self.allowed.is_empty();
        };
        if self.owner.as_deref() == Some(user) {
            return true;
        }
        self.allowed.is_empty() || self.allowed.iter().any(|a| a == user)
    }

    /// Whether `identity` may send to this room.
    #[must_use]
    pub fn can_send(&self, identity: &Identity) -> bool {
        match self.room_type {
            RoomType::Broadcast => {
                identity.user_id().is_some() && identity.user_id() == self.owner.as_deref()
            }
            _ => true,
        }
    }
}

/// Room creation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomSpec {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub room_type: RoomType,
    #[serde(default = "default_true")]
    pub persistent: bool,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub allowed: Vec<String>,
    #[serde(default)]
    pub require_authentication: bool,
    #[serde(default)]
    pub max_connections: usize,
    #[serde(default)]
    pub message_retention_days: u32,
    #[serde(default)]
    pub features: RoomFeatures,
}

fn default_true() -> bool {
    true
}

impl RoomSpec {
    #[must_use]
    pub fn public(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            display_name: None,
            room_type: RoomType::Public,
            persistent: true,
            owner: None,
            allowed: Vec::new(),
            require_authentication: false,
            max_connections: 0,
            message_retention_days: 0,
            features: RoomFeatures::default(),
        }
    }

    fn into_room(self) -> Room {
        Room {
            display_name: self.display_name.unwrap_or_else(|| self.name.clone()),
            name: self.name,
            room_type: self.room_type,
            active: true,
            persistent: self.persistent,
            owner: self.owner,
            allowed: self.allowed,
            require_authentication: self.require_authentication,
            max_connections: self.max_connections,
            message_retention_days: self.message_retention_days,
            features: self.features,
            created_at: Utc::now(),
        }
    }
}

/// Partial room update; unset fields are left alone.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoomUpdate {
    pub display_name: Option<String>,
    pub room_type: Option<RoomType>,
    pub active: Option<bool>,
    pub owner: Option<String>,
    pub allowed: Option<Vec<String>>,
    pub require_authentication: Option<bool>,
    pub max_connections: Option<usize>,
    pub message_retention_days: Option<u32>,
    pub features: Option<RoomFeatures>,
}

impl RoomUpdate {
    fn apply(self, room: &mut Room) {
        if let Some(v) = self.display_name {
            room.display_name = v;
        }
        if let Some(v) = self.room_type {
            room.room_type = v;
        }
        if let Some(v) = self.active {
            room.active = v;
        }
        if let Some(v) = self.owner {
            room.owner = Some(v);
        }
        if let Some(v) = self.allowed {
            room.allowed = v;
        }
        if let Some(v) = self.require_authentication {
            room.require_authentication = v;
        }
        if let Some(v) = self.max_connections {
            room.max_connections = v;
        }
        if let Some(v) = self.message_retention_days {
            room.message_retention_days = v;
        }
        if let Some(v) = self.features {
            room.features = v;
        }
    }
}

/// All known rooms. Persistent rooms are written through to the store.
pub struct RoomDirectory {
    rooms: DashMap<String, Room>,
    store: Arc<dyn Store>,
}

impl RoomDirectory {
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            rooms: DashMap::new(),
            store,
        }
    }

    /// Load persisted rooms from the store.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::StoreUnavailable`] if the store fails.
    pub async fn load(&self) -> Result<usize, CoreError> {
        let rooms = self.store.load_rooms().await?;
        let count = rooms.len();
        for room in rooms {
            self.rooms.insert(room.name.clone(), room);
        }
        info!(count, "Loaded rooms");
        Ok(count)
    }

    async fn persist(&self, room: &Room) -> Result<(), CoreError> {
        if room.persistent {
            self.store.save_room(room).await?;
        }
        Ok(())
    }

    /// Create a room.
    ///
    /// # Errors
    ///
    /// Fails for an invalid or taken name, or when persisting fails.
    pub async fn create(&self, spec: RoomSpec) -> Result<Room, CoreError> {
        validate_room_name(&spec.name).map_err(|e| CoreError::Validation(e.to_string()))?;

        let room = spec.into_room();
        match self.rooms.entry(room.name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(CoreError::Validation(format!(
                    "room {} already exists",
                    room.name
                )));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(room.clone());
            }
        }

        if let Err(e) = self.persist(&room).await {
            self.rooms.remove(&room.name);
            return Err(e);
        }
        info!(room = %room.name, room_type = ?room.room_type, "Room created");
        Ok(room)
    }

    /// Create a room unless one with the same name exists.
    ///
    /// # Errors
    ///
    /// Same as [`RoomDirectory::create`], except for an existing name.
    pub async fn ensure(&self, spec: RoomSpec) -> Result<Room, CoreError> {
        if let Some(room) = self.get(&spec.name) {
            return Ok(room);
        }
        self.create(spec).await
    }

    /// Apply a partial update.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::RoomNotFound`] for an unknown room.
    pub async fn update(&self, name: &str, update: RoomUpdate) -> Result<Room, CoreError> {
        let room = {
            let mut room = self
                .rooms
                .get_mut(name)
                .ok_or_else(|| CoreError::RoomNotFound(name.to_string()))?;
            update.apply(&mut room);
            room.clone()
        };
        self.persist(&room).await?;
        debug!(room = %name, "Room updated");
        Ok(room)
    }

    /// Stop admitting joins. Existing members are unaffected.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::RoomNotFound`] for an unknown room.
    pub async fn deactivate(&self, name: &str) -> Result<Room, CoreError> {
        self.update(
            name,
            RoomUpdate {
                active: Some(false),
                ..RoomUpdate::default()
            },
        )
        .await
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Room> {
        self.rooms.get(name).map(|r| r.clone())
    }

    /// The room if it exists and is active.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::RoomNotFound`] for unknown or inactive rooms.
    pub fn active(&self, name: &str) -> Result<Room, CoreError> {
        self.get(name)
            .filter(|room| room.active)
            .ok_or_else(|| CoreError::RoomNotFound(name.to_string()))
    }

    /// All rooms sorted by name.
    #[must_use]
    pub fn list(&self, include_inactive: bool) -> Vec<Room> {
        let mut rooms: Vec<Room> = self
            .rooms
            .iter()
            .filter(|r| include_inactive || r.active)
            .map(|r| r.clone())
            .collect();
        rooms.sort_by(|a, b| a.name.cmp(&b.name));
        rooms
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}
