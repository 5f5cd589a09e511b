//! Replicated world state as seen by the protocol layer.
//!
//! The protocol never holds references into the world: it only keeps ids
//! and looks records up through [`WorldStore`] whenever it needs them, so an
//! entity removed mid-tick simply stops resolving.

use crate::id_pool::IdPool;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// First id handed out to networked entities. Lower ids belong to local,
/// non-replicated objects.
pub const ENTITY_ID_FLOOR: u32 = 0x0001_0000;

/// Reserved player property that renames the player.
pub const NAME_PROPERTY: &str = "name";

/// String-keyed property bag, ordered so encodings are deterministic.
pub type Properties = BTreeMap<String, String>;

/// The replicated subset of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EntityState {
    pub position: [f64; 3],
    /// Unit forward vector of the orientation basis.
    pub forward: [f32; 3],
    /// Unit up vector of the orientation basis.
    pub up: [f32; 3],
    pub motion: [f32; 3],
    /// Angular rates around the local axes, radians per second.
    pub angular: [f32; 3],
    /// Owning player, 0 for server-owned entities.
    pub owner: u16,
}

impl Default for EntityState {
    fn default() -> Self {
        Self {
            position: [0.0; 3],
            forward: [0.0, 0.0, 1.0],
            up: [0.0, 1.0, 0.0],
            motion: [0.0; 3],
            angular: [0.0; 3],
            owner: 0,
        }
    }
}

impl EntityState {
    pub fn at(position: [f64; 3]) -> Self {
        Self {
            position,
            ..Self::default()
        }
    }

    pub fn speed(&self) -> f32 {
        let [x, y, z] = self.motion;
        (x * x + y * y + z * z).sqrt()
    }
}

/// Type-specific payload carried by OBJECTS_ADD.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityInit {
    pub kind: u16,
    pub label: String,
    pub state: EntityState,
}

impl EntityInit {
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerRecord {
    pub id: u16,
    pub name: String,
    pub properties: Properties,
}

impl PlayerRecord {
    pub fn new(id: u16, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            properties: Properties::new(),
        }
    }
}

/// Storage the protocol layer reads from and writes to.
pub trait WorldStore {
    fn entity_ids(&self) -> Vec<u32>;
    fn entity(&self, id: u32) -> Option<&EntityState>;
    fn entity_init(&self, id: u32) -> Option<EntityInit>;
    fn insert_entity(&mut self, id: u32, init: EntityInit);
    /// Overwrites replicated fields. Returns false for unknown ids.
    fn apply_entity(&mut self, id: u32, state: EntityState) -> bool;
    fn remove_entity(&mut self, id: u32) -> bool;
    fn clear_entities(&mut self);

    fn player_ids(&self) -> Vec<u16>;
    fn player(&self, id: u16) -> Option<&PlayerRecord>;
    fn player_mut(&mut self, id: u16) -> Option<&mut PlayerRecord>;
    fn insert_player(&mut self, player: PlayerRecord);
    fn remove_player(&mut self, id: u16) -> Option<PlayerRecord>;
    fn clear_players(&mut self);

    fn globals(&self) -> &Properties;
    fn globals_mut(&mut self) -> &mut Properties;

    /// Per-tick simulation pass (collision, integration). Opaque to the
    /// protocol layer.
    fn step_physics(&mut self, _dt: f32) {}

    fn find_player_by_name(&self, name: &str) -> Option<u16> {
        self.player_ids().into_iter().find(|id| {
            self.player(*id)
                .map(|player| player.name == name)
                .unwrap_or(false)
        })
    }
}

#[derive(Debug, Clone)]
struct StoredEntity {
    kind: u16,
    label: String,
    state: EntityState,
}

/// Arena-style world keyed by integer ids.
#[derive(Debug, Clone)]
pub struct MemoryWorld {
    entities: BTreeMap<u32, StoredEntity>,
    players: BTreeMap<u16, PlayerRecord>,
    globals: Properties,
    entity_ids: IdPool,
}

impl Default for MemoryWorld {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryWorld {
    pub fn new() -> Self {
        Self {
            entities: BTreeMap::new(),
            players: BTreeMap::new(),
            globals: Properties::new(),
            entity_ids: IdPool::for_entities(ENTITY_ID_FLOOR),
        }
    }

    /// Creates a locally authoritative entity with a freshly minted id.
    pub fn spawn(&mut self, kind: u16, label: &str, state: EntityState) -> Option<u32> {
        let id = self.entity_ids.acquire()?;
        self.entities.insert(
            id,
            StoredEntity {
                kind,
                label: label.to_string(),
                state,
            },
        );
        Some(id)
    }

    /// Removes an entity created with [`MemoryWorld::spawn`] and recycles its id.
    pub fn despawn(&mut self, id: u32) -> bool {
        let removed = self.entities.remove(&id).is_some();
        if removed {
            self.entity_ids.release(id);
        }
        removed
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    pub fn entities_owned_by(&self, owner: u16) -> Vec<u32> {
        self.entities
            .iter()
            .filter(|(_, e)| e.state.owner == owner)
            .map(|(id, _)| *id)
            .collect()
    }
}

impl WorldStore for MemoryWorld {
    fn entity_ids(&self) -> Vec<u32> {
        self.entities.keys().copied().collect()
    }

    fn entity(&self, id: u32) -> Option<&EntityState> {
        self.entities.get(&id).map(|e| &e.state)
    }

    fn entity_init(&self, id: u32) -> Option<EntityInit> {
        self.entities.get(&id).map(|e| EntityInit {
            kind: e.kind,
            label: e.label.clone(),
            state: e.state,
        })
    }

    fn insert_entity(&mut self, id: u32, init: EntityInit) {
        self.entities.insert(
            id,
            StoredEntity {
                kind: init.kind,
                label: init.label,
                state: init.state,
            },
        );
    }

    fn apply_entity(&mut self, id: u32, state: EntityState) -> bool {
        match self.entities.get_mut(&id) {
            Some(entity) => {
                entity.state = state;
                true
            }
            None => false,
        }
    }

    fn remove_entity(&mut self, id: u32) -> bool {
        self.despawn(id)
    }

    fn clear_entities(&mut self) {
        self.entities.clear();
        self.entity_ids.reset(ENTITY_ID_FLOOR);
    }

    fn player_ids(&self) -> Vec<u16> {
        self.players.keys().copied().collect()
    }

    fn player(&self, id: u16) -> Option<&PlayerRecord> {
        self.players.get(&id)
    }

    fn player_mut(&mut self, id: u16) -> Option<&mut PlayerRecord> {
        self.players.get_mut(&id)
    }

    fn insert_player(&mut self, player: PlayerRecord) {
        self.players.insert(player.id, player);
    }

    fn remove_player(&mut self, id: u16) -> Option<PlayerRecord> {
        self.players.remove(&id)
    }

    fn clear_players(&mut self) {
        self.players.clear();
    }

    fn globals(&self) -> &Properties {
        &self.globals
    }

    fn globals_mut(&mut self) -> &mut Properties {
        &mut self.globals
    }

    fn step_physics(&mut self, dt: f32) {
        for entity in self.entities.values_mut() {
            for axis in 0..3 {
                entity.state.position[axis] += (entity.state.motion[axis] * dt) as f64;
            }
        }
    }
}
