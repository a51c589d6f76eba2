//! Deterministic Entity Physics
//!
//! Per-tick integration and AABB collision detection over fixed-point
//! world space. Everything here iterates entities in id-ascending order
//! (`BTreeMap`) and uses integer arithmetic only, so two peers stepping
//! the same entities with the same dt land on identical state.
//!
//! Collision *detection* lives here; resolution is the caller's business.
//! The step emits a stable list of overlapping `(low, high)` id pairs per
//! tick and leaves the entities untouched by the contact.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::fixed::{fixed_clamp, fixed_mul, from_int, Fixed};
use crate::game::input::PlayerInput;

/// Gravity acceleration: 980 px/s^2.
pub const GRAVITY: Fixed = from_int(980);

/// Friction factor applied to vx each tick: 0.9 in Q16.16.
pub const FRICTION: Fixed = 58_982;

/// Velocity magnitude cap: 1000 px/s.
pub const MAX_VELOCITY: Fixed = from_int(1000);

/// World width: 1920 px.
pub const WORLD_WIDTH: Fixed = from_int(1920);

/// World height: 1080 px.
pub const WORLD_HEIGHT: Fixed = from_int(1080);

/// Spatial grid cell edge: 64 px.
pub const GRID_CELL: Fixed = from_int(64);

/// Default entity extents: 32 px square.
pub const ENTITY_EXTENT: Fixed = from_int(32);

/// Player movement speed: 300 px/s.
pub const PLAYER_SPEED: Fixed = from_int(300);

/// Unique entity identifier within one game state.
pub type EntityId = i32;

/// A simulated entity in fixed-point world space.
///
/// Invariants: `width, height > 0`; the id is unique within a state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    /// Unique id.
    pub id: EntityId,
    /// Position X (Q16.16 raw).
    pub x: Fixed,
    /// Position Y (Q16.16 raw).
    pub y: Fixed,
    /// Velocity X (Q16.16 raw, px/s).
    pub vx: Fixed,
    /// Velocity Y (Q16.16 raw, px/s).
    pub vy: Fixed,
    /// Width (Q16.16 raw).
    pub width: Fixed,
    /// Height (Q16.16 raw).
    pub height: Fixed,
    /// Hit points.
    pub hp: i32,
    /// Maximum hit points.
    pub max_hp: i32,
}

impl Entity {
    /// Create an entity at a fixed-point position with default extents.
    pub const fn new(id: EntityId, x: Fixed, y: Fixed) -> Self {
        Self {
            id,
            x,
            y,
            vx: 0,
            vy: 0,
            width: ENTITY_EXTENT,
            height: ENTITY_EXTENT,
            hp: 100,
            max_hp: 100,
        }
    }

    /// Create an entity at integer pixel coordinates.
    pub const fn at_pixels(id: EntityId, x: i32, y: i32) -> Self {
        Self::new(id, from_int(x), from_int(y))
    }

    /// Collision bounds `(x1, y1, x2, y2)` in fixed-point.
    pub fn bounds(&self) -> (Fixed, Fixed, Fixed, Fixed) {
        (
            self.x,
            self.y,
            self.x.wrapping_add(self.width),
            self.y.wrapping_add(self.height),
        )
    }
}

/// AABB overlap test in fixed-point.
#[inline]
pub fn aabb_overlap(a: &Entity, b: &Entity) -> bool {
    a.x < b.x.wrapping_add(b.width)
        && a.x.wrapping_add(a.width) > b.x
        && a.y < b.y.wrapping_add(b.height)
        && a.y.wrapping_add(a.height) > b.y
}

/// Apply a player's movement flags to an entity's velocity.
///
/// Each pressed axis contributes `+-speed`; opposite flags cancel.
/// Missing entities are a soft no-op.
pub fn apply_input(
    entities: &mut BTreeMap<EntityId, Entity>,
    entity_id: EntityId,
    flags: u8,
    speed: Fixed,
) {
    let Some(entity) = entities.get_mut(&entity_id) else {
        return;
    };

    let mut vx: Fixed = 0;
    let mut vy: Fixed = 0;
    if flags & PlayerInput::MOVE_LEFT != 0 {
        vx = vx.wrapping_sub(speed);
    }
    if flags & PlayerInput::MOVE_RIGHT != 0 {
        vx = vx.wrapping_add(speed);
    }
    if flags & PlayerInput::MOVE_UP != 0 {
        vy = vy.wrapping_sub(speed);
    }
    if flags & PlayerInput::MOVE_DOWN != 0 {
        vy = vy.wrapping_add(speed);
    }

    entity.vx = vx;
    entity.vy = vy;
}

/// Advance all entities by `dt_ms` milliseconds and detect collisions.
///
/// Per entity, in id-ascending order: gravity, velocity clamp,
/// integration, world-bounds clamp (contact zeroes the offending velocity
/// component), then friction on vx. Afterwards the spatial grid is
/// rebuilt and overlapping pairs are collected.
///
/// Returns the stable list of `(low, high)` collision pairs.
pub fn step(entities: &mut BTreeMap<EntityId, Entity>, dt_ms: i32) -> Vec<(EntityId, EntityId)> {
    for entity in entities.values_mut() {
        // Gravity: vy += G * dt / 1000
        entity.vy = entity
            .vy
            .wrapping_add(((GRAVITY as i64 * dt_ms as i64) / 1000) as Fixed);

        entity.vx = fixed_clamp(entity.vx, -MAX_VELOCITY, MAX_VELOCITY);
        entity.vy = fixed_clamp(entity.vy, -MAX_VELOCITY, MAX_VELOCITY);

        // Integration: pos += v * dt / 1000
        entity.x = entity
            .x
            .wrapping_add(((entity.vx as i64 * dt_ms as i64) / 1000) as Fixed);
        entity.y = entity
            .y
            .wrapping_add(((entity.vy as i64 * dt_ms as i64) / 1000) as Fixed);

        // World bounds; contact kills the velocity component.
        if entity.x < 0 {
            entity.x = 0;
            entity.vx = 0;
        }
        if entity.x.wrapping_add(entity.width) > WORLD_WIDTH {
            entity.x = WORLD_WIDTH - entity.width;
            entity.vx = 0;
        }
        if entity.y < 0 {
            entity.y = 0;
            entity.vy = 0;
        }
        if entity.y.wrapping_add(entity.height) > WORLD_HEIGHT {
            entity.y = WORLD_HEIGHT - entity.height;
            entity.vy = 0;
        }

        entity.vx = fixed_mul(entity.vx, FRICTION);
    }

    detect_collisions(entities)
}

/// Rebuild the uniform spatial grid and collect overlapping pairs.
///
/// Buckets are keyed by `(floor(x / cell), floor(y / cell))` and visited
/// in lexicographic key order. Pairs are tested inside each bucket and
/// against the right and below neighbor buckets only, so no pair is
/// visited twice.
fn detect_collisions(entities: &BTreeMap<EntityId, Entity>) -> Vec<(EntityId, EntityId)> {
    let mut grid: BTreeMap<(i32, i32), Vec<EntityId>> = BTreeMap::new();
    for (&id, entity) in entities {
        let bucket = (entity.x.div_euclid(GRID_CELL), entity.y.div_euclid(GRID_CELL));
        grid.entry(bucket).or_default().push(id);
    }

    let mut pairs = Vec::new();
    for (&(bx, by), ids) in &grid {
        for i in 0..ids.len() {
            for j in (i + 1)..ids.len() {
                push_if_overlap(entities, ids[i], ids[j], &mut pairs);
            }
        }

        for neighbor in [(bx + 1, by), (bx, by + 1)] {
            if let Some(neighbor_ids) = grid.get(&neighbor) {
                for &a in ids {
                    for &b in neighbor_ids {
                        push_if_overlap(entities, a, b, &mut pairs);
                    }
                }
            }
        }
    }

    pairs
}

fn push_if_overlap(
    entities: &BTreeMap<EntityId, Entity>,
    a: EntityId,
    b: EntityId,
    pairs: &mut Vec<(EntityId, EntityId)>,
) {
    if let (Some(ea), Some(eb)) = (entities.get(&a), entities.get(&b)) {
        if aabb_overlap(ea, eb) {
            pairs.push((a.min(b), a.max(b)));
        }
    }
}
