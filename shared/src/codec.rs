//! Entity replication encoding at selectable precision.
//!
//! Field layout per entity record, in order:
//!
//! | field    | FULL / HIGH | MEDIUM    | LOW       |
//! |----------|-------------|-----------|-----------|
//! | position | 3 × f64     | 3 × f64   | 3 × f64   |
//! | forward  | 3 × f32     | 3 × i16   | 3 × i16   |
//! | up       | 3 × f32     | 3 × i16   | 3 × i8    |
//! | motion   | 3 × f32     | 3 × f32   | 3 × f32   |
//! | angular  | 3 × f32     | 3 × f32   | omitted   |
//! | owner    | u16, server-to-client records only   |||

use crate::message::{DecodeError, Message};
use crate::tags;
use crate::world::EntityState;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

/// Signed tier selector; higher means more detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Precision(pub i8);

impl Precision {
    /// Resolved at encode time from the number of records in the message.
    pub const AUTO: Precision = Precision(-1);
    pub const LOW: Precision = Precision(0);
    pub const MEDIUM: Precision = Precision(1);
    pub const HIGH: Precision = Precision(2);
    pub const FULL: Precision = Precision(3);

    /// Normalizes a tier read off the wire. Anything above FULL is FULL and
    /// anything below LOW (including a stray AUTO) is LOW.
    pub fn from_wire(value: i8) -> Self {
        Precision(value.clamp(Self::LOW.0, Self::FULL.0))
    }

    pub fn is_auto(self) -> bool {
        self == Self::AUTO
    }

    fn full_floats(self) -> bool {
        self >= Self::HIGH
    }

    fn has_angular(self) -> bool {
        self >= ANGULAR_MIN_PRECISION
    }
}

/// Lowest tier that still carries angular rates.
pub const ANGULAR_MIN_PRECISION: Precision = Precision::MEDIUM;

/// Which way a record travels. Only server-to-client records carry the
/// owning player id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ToServer,
    ToClient,
}

/// Entity-count breakpoints for resolving [`Precision::AUTO`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoThresholds {
    /// Fewer records than this are sent at FULL.
    pub full_below: usize,
    /// Fewer records than this (and not FULL) are sent at MEDIUM.
    pub medium_below: usize,
}

impl AutoThresholds {
    /// Client send path.
    pub const CLIENT: AutoThresholds = AutoThresholds {
        full_below: 32,
        medium_below: 1024,
    };

    /// Server send path; tolerates more entities at full detail.
    pub const SERVER: AutoThresholds = AutoThresholds {
        full_below: 128,
        medium_below: 1024,
    };

    pub fn select(&self, count: usize) -> Precision {
        if count < self.full_below {
            Precision::FULL
        } else if count < self.medium_below {
            Precision::MEDIUM
        } else {
            Precision::LOW
        }
    }

    pub fn resolve(&self, precision: Precision, count: usize) -> Precision {
        if precision.is_auto() {
            self.select(count)
        } else {
            Precision::from_wire(precision.0)
        }
    }
}

/// Packs a unit-range value into 16-bit fixed point.
pub fn to_i16_unit(value: f32) -> i16 {
    (value.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16
}

pub fn from_i16_unit(value: i16) -> f32 {
    (value as f32 / i16::MAX as f32).max(-1.0)
}

/// Packs a unit-range value into 8-bit fixed point.
pub fn to_i8_unit(value: f32) -> i8 {
    (value.clamp(-1.0, 1.0) * i8::MAX as f32).round() as i8
}

pub fn from_i8_unit(value: i8) -> f32 {
    (value as f32 / i8::MAX as f32).max(-1.0)
}

fn add_f32x3(msg: &mut Message, v: [f32; 3]) {
    msg.add_f32(v[0]).add_f32(v[1]).add_f32(v[2]);
}

fn next_f32x3(msg: &mut Message) -> Result<[f32; 3], DecodeError> {
    Ok([msg.next_f32()?, msg.next_f32()?, msg.next_f32()?])
}

/// Appends one entity's replicated fields. `precision` must already be
/// resolved (not AUTO).
pub fn encode_entity(
    msg: &mut Message,
    state: &EntityState,
    precision: Precision,
    direction: Direction,
) {
    let precision = Precision::from_wire(precision.0);
    for axis in state.position {
        msg.add_f64(axis);
    }

    if precision.full_floats() {
        add_f32x3(msg, state.forward);
        add_f32x3(msg, state.up);
    } else {
        for axis in state.forward {
            msg.add_i16(to_i16_unit(axis));
        }
        if precision == Precision::MEDIUM {
            for axis in state.up {
                msg.add_i16(to_i16_unit(axis));
            }
        } else {
            for axis in state.up {
                msg.add_i8(to_i8_unit(axis));
            }
        }
    }

    add_f32x3(msg, state.motion);

    if precision.has_angular() {
        add_f32x3(msg, state.angular);
    }

    if direction == Direction::ToClient {
        msg.add_u16(state.owner);
    }
}

/// Reads one entity record; mirror of [`encode_entity`]. Fields not carried
/// at this tier (angular rates at LOW, owner on client-to-server records)
/// come back as zero.
pub fn decode_entity(
    msg: &mut Message,
    precision: Precision,
    direction: Direction,
) -> Result<EntityState, DecodeError> {
    let precision = Precision::from_wire(precision.0);
    let position = [msg.next_f64()?, msg.next_f64()?, msg.next_f64()?];

    let (forward, up) = if precision.full_floats() {
        (next_f32x3(msg)?, next_f32x3(msg)?)
    } else {
        let forward = [
            from_i16_unit(msg.next_i16()?),
            from_i16_unit(msg.next_i16()?),
            from_i16_unit(msg.next_i16()?),
        ];
        let up = if precision == Precision::MEDIUM {
            [
                from_i16_unit(msg.next_i16()?),
                from_i16_unit(msg.next_i16()?),
                from_i16_unit(msg.next_i16()?),
            ]
        } else {
            [
                from_i8_unit(msg.next_i8()?),
                from_i8_unit(msg.next_i8()?),
                from_i8_unit(msg.next_i8()?),
            ]
        };
        (forward, up)
    };

    let motion = next_f32x3(msg)?;
    let angular = if precision.has_angular() {
        next_f32x3(msg)?
    } else {
        [0.0; 3]
    };
    let owner = match direction {
        Direction::ToClient => msg.next_u16()?,
        Direction::ToServer => 0,
    };

    Ok(EntityState {
        position,
        forward,
        up,
        motion,
        angular,
        owner,
    })
}

/// Builds an UPDATE message. AUTO is resolved from `entities.len()`, i.e.
/// the number of records actually going into this message.
pub fn write_update(
    entities: &[(u32, EntityState)],
    precision: Precision,
    direction: Direction,
    thresholds: &AutoThresholds,
) -> Message {
    let resolved = thresholds.resolve(precision, entities.len());
    let mut msg = Message::new(tags::UPDATE);
    msg.add_i8(resolved.0).add_u32(entities.len() as u32);
    for (id, state) in entities {
        msg.add_u32(*id);
        encode_entity(&mut msg, state, resolved, direction);
    }
    msg
}

/// Leading fields of an UPDATE message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateHeader {
    pub precision: Precision,
    pub count: u32,
}

pub fn read_update_header(msg: &mut Message) -> Result<UpdateHeader, DecodeError> {
    let precision = Precision::from_wire(msg.next_i8()?);
    let count = msg.next_u32()?;
    Ok(UpdateHeader { precision, count })
}

/// Reads a whole UPDATE into `(id, state)` pairs. Handlers that need to
/// stop at the first unknown id read the header and records themselves.
pub fn read_update(
    msg: &mut Message,
    direction: Direction,
) -> Result<(Precision, Vec<(u32, EntityState)>), DecodeError> {
    let header = read_update_header(msg)?;
    let mut records = Vec::new();
    for _ in 0..header.count {
        let id = msg.next_u32()?;
        records.push((id, decode_entity(msg, header.precision, direction)?));
    }
    Ok((header.precision, records))
}

/// Jitter smoothing parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SmoothingConfig {
    pub enabled: bool,
    /// Moves longer than this are treated as teleports and not smoothed.
    pub radius: f64,
    /// Weight of the previous prediction: `(new + prev * k) / (1 + k)`.
    pub coefficient: f64,
}

impl Default for SmoothingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            radius: 128.0,
            coefficient: 3.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Snapshot {
    position: [f64; 3],
    motion: [f32; 3],
    speed: f32,
    at: Instant,
}

/// Blends received positions with the locally predicted ones to hide
/// network jitter.
#[derive(Debug, Default)]
pub struct Smoother {
    config: SmoothingConfig,
    snapshots: HashMap<u32, Snapshot>,
    disabled: HashSet<u32>,
}

impl Smoother {
    pub fn new(config: SmoothingConfig) -> Self {
        Self {
            config,
            snapshots: HashMap::new(),
            disabled: HashSet::new(),
        }
    }

    pub fn config(&self) -> &SmoothingConfig {
        &self.config
    }

    pub fn set_enabled_for(&mut self, id: u32, enabled: bool) {
        if enabled {
            self.disabled.remove(&id);
        } else {
            self.disabled.insert(id);
        }
    }

    pub fn forget(&mut self, id: u32) {
        self.snapshots.remove(&id);
        self.disabled.remove(&id);
    }

    pub fn clear(&mut self) {
        self.snapshots.clear();
        self.disabled.clear();
    }

    /// Returns the state to store locally for a freshly decoded record.
    ///
    /// `lead` is how far ahead to extrapolate the received position,
    /// normally half the round-trip time.
    pub fn apply(
        &mut self,
        id: u32,
        received: EntityState,
        now: Instant,
        lead: Duration,
    ) -> EntityState {
        let speed = received.speed();
        let smoothing = self.config.enabled && !self.disabled.contains(&id);
        let previous = self.snapshots.get(&id).copied();

        let mut result = received;
        if let (true, Some(prev)) = (smoothing, previous) {
            let moved = distance(&received.position, &prev.position);
            if moved <= self.config.radius {
                let elapsed = now.saturating_duration_since(prev.at).as_secs_f64();
                let mut lead_secs = lead.as_secs_f64();
                if speed < prev.speed && prev.speed > 0.0 {
                    lead_secs *= (speed / prev.speed) as f64;
                }
                let k = self.config.coefficient.max(0.0);
                for axis in 0..3 {
                    let extrapolated =
                        received.position[axis] + received.motion[axis] as f64 * lead_secs;
                    let predicted = prev.position[axis] + prev.motion[axis] as f64 * elapsed;
                    result.position[axis] = (extrapolated + predicted * k) / (1.0 + k);
                }
            }
        }

        self.snapshots.insert(
            id,
            Snapshot {
                position: result.position,
                motion: received.motion,
                speed,
                at: now,
            },
        );
        result
    }
}

fn distance(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    let dx = a[0] - b[0];
    let dy = a[1] - b[1];
    let dz = a[2] - b[2];
    (dx * dx + dy * dy + dz * dz).sqrt()
}
