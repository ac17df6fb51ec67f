//! Integer block coordinates, portal facing directions, and the quarter-turn
//! rotations that map a destination portal's orientation onto its origin.

use std::ops::{Add, Neg, Sub};

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// IntVector
// ---------------------------------------------------------------------------

/// Integer 3D block position. Equality and hashing are structural, so this is
/// used directly as a map key.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IntVector {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl IntVector {
    /// The origin.
    pub const ZERO: Self = Self::new(0, 0, 0);

    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }
}

impl Add for IntVector {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self::new(self.x + other.x, self.y + other.y, self.z + other.z)
    }
}

impl Sub for IntVector {
    type Output = Self;

    fn sub(self, other: Self) -> Self {
        Self::new(self.x - other.x, self.y - other.y, self.z - other.z)
    }
}

impl Neg for IntVector {
    type Output = Self;

    fn neg(self) -> Self {
        Self::new(-self.x, -self.y, -self.z)
    }
}

impl From<[i32; 3]> for IntVector {
    fn from([x, y, z]: [i32; 3]) -> Self {
        Self::new(x, y, z)
    }
}

impl std::fmt::Display for IntVector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

// ---------------------------------------------------------------------------
// PortalDirection
// ---------------------------------------------------------------------------

/// The axis-aligned direction a portal faces. Portals are never diagonal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortalDirection {
    /// +y
    Up,
    /// -y
    Down,
    /// +z
    North,
    /// -z
    South,
    /// +x
    East,
    /// -x
    West,
}

impl PortalDirection {
    /// Every direction, in declaration order.
    pub const ALL: [Self; 6] = [
        Self::Up,
        Self::Down,
        Self::North,
        Self::South,
        Self::East,
        Self::West,
    ];

    /// Unit normal facing out of a portal with this direction.
    pub fn vector(self) -> IntVector {
        match self {
            Self::Up => IntVector::new(0, 1, 0),
            Self::Down => IntVector::new(0, -1, 0),
            Self::North => IntVector::new(0, 0, 1),
            Self::South => IntVector::new(0, 0, -1),
            Self::East => IntVector::new(1, 0, 0),
            Self::West => IntVector::new(-1, 0, 0),
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Self::Up => Self::Down,
            Self::Down => Self::Up,
            Self::North => Self::South,
            Self::South => Self::North,
            Self::East => Self::West,
            Self::West => Self::East,
        }
    }

    /// Returns `true` for flat (up/down facing) portals.
    pub fn is_horizontal(self) -> bool {
        matches!(self, Self::Up | Self::Down)
    }

    /// Swaps axes so iteration around a portal can be written once for the
    /// north/south layout and reused for every direction.
    pub fn swap_vector(self, v: IntVector) -> IntVector {
        match self {
            Self::East | Self::West => IntVector::new(v.z, v.y, v.x),
            Self::Up | Self::Down => IntVector::new(v.x, v.z, v.y),
            Self::North | Self::South => v,
        }
    }

    /// Parses a stored direction name. The legacy axis names map to the
    /// direction whose portal plane they used to describe.
    pub fn from_storage(name: &str) -> Option<Self> {
        match name {
            "EAST_WEST" => Some(Self::North),
            "NORTH_SOUTH" => Some(Self::East),
            "UP" => Some(Self::Up),
            "DOWN" => Some(Self::Down),
            "NORTH" => Some(Self::North),
            "SOUTH" => Some(Self::South),
            "EAST" => Some(Self::East),
            "WEST" => Some(Self::West),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Rotation
// ---------------------------------------------------------------------------

/// An integer rotation made of quarter turns, stored as a row-major 3x3 matrix.
///
/// Rotations are orthonormal, so the inverse is the transpose.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rotation {
    rows: [[i32; 3]; 3],
}

impl Default for Rotation {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Rotation {
    pub const IDENTITY: Self = Self {
        rows: [[1, 0, 0], [0, 1, 0], [0, 0, 1]],
    };

    const QUARTER_Y: Self = Self {
        rows: [[0, 0, 1], [0, 1, 0], [-1, 0, 0]],
    };

    const QUARTER_X: Self = Self {
        rows: [[1, 0, 0], [0, 0, -1], [0, 1, 0]],
    };

    /// `quarter_turns` quarter turns about the Y axis.
    pub fn about_y(quarter_turns: u32) -> Self {
        Self::repeat(Self::QUARTER_Y, quarter_turns)
    }

    /// `quarter_turns` quarter turns about the X axis.
    pub fn about_x(quarter_turns: u32) -> Self {
        Self::repeat(Self::QUARTER_X, quarter_turns)
    }

    fn repeat(step: Self, quarter_turns: u32) -> Self {
        (0..quarter_turns % 4).fold(Self::IDENTITY, |acc, _| acc.then(step))
    }

    /// Composition: the returned rotation applies `self` first, then `next`.
    pub fn then(self, next: Self) -> Self {
        let mut rows = [[0; 3]; 3];
        for (i, row) in rows.iter_mut().enumerate() {
            for (j, cell) in row.iter_mut().enumerate() {
                *cell = (0..3).map(|k| next.rows[i][k] * self.rows[k][j]).sum();
            }
        }
        Self { rows }
    }

    pub fn inverse(self) -> Self {
        let r = self.rows;
        Self {
            rows: [
                [r[0][0], r[1][0], r[2][0]],
                [r[0][1], r[1][1], r[2][1]],
                [r[0][2], r[1][2], r[2][2]],
            ],
        }
    }

    pub fn apply(self, v: IntVector) -> IntVector {
        let [a, b, c] = self.rows;
        IntVector::new(
            a[0] * v.x + a[1] * v.y + a[2] * v.z,
            b[0] * v.x + b[1] * v.y + b[2] * v.z,
            c[0] * v.x + c[1] * v.y + c[2] * v.z,
        )
    }

    /// Rotation taking `direction`'s normal onto +z.
    fn to_north(direction: PortalDirection) -> Self {
        match direction {
            PortalDirection::North => Self::IDENTITY,
            PortalDirection::South => Self::about_y(2),
            PortalDirection::East => Self::about_y(3),
            PortalDirection::West => Self::about_y(1),
            PortalDirection::Up => Self::about_x(1),
            PortalDirection::Down => Self::about_x(3),
        }
    }

    /// Rotation mapping `from`'s normal onto `to`'s normal.
    pub fn between(from: PortalDirection, to: PortalDirection) -> Self {
        Self::to_north(from).then(Self::to_north(to).inverse())
    }
}
