use crate::serializer::{Field, Serializer};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// FNV-1a 32-bit prime used to spread folded ids.
const FOLD_PRIME: u32 = 0x0100_0193;

/// Errors from parsing the hex form of an id.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseIdError {
    #[error("expected {expected} hex digits, got {found:?}")]
    Length { expected: usize, found: String },
    #[error("invalid hex id {0:?}")]
    Digits(String),
}

/// 16-bit identifier of a node or component, unique among live objects of
/// one scene. `0` marks transient objects.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct SceneId(pub u16);

impl SceneId {
    pub const TRANSIENT: SceneId = SceneId(0);
    pub const ROOT: SceneId = SceneId(1);

    pub const fn new(raw: u16) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u16 {
        self.0
    }

    pub const fn is_transient(self) -> bool {
        self.0 == 0
    }

    /// Compose two ids into one path component.
    ///
    /// `(base ^ value) * 0x01000193`, then the high and low halves of the
    /// 32-bit product are XOR-folded. Deterministic but not injective:
    /// `fold(a, b) == fold(b, a)`, `fold(a, a) == 0`, and distinct paths can
    /// collide. Collisions are detected where global address maps are built.
    pub fn fold(base: SceneId, value: SceneId) -> SceneId {
        let tmp = u32::from(base.0 ^ value.0).wrapping_mul(FOLD_PRIME);
        SceneId(((tmp >> 16) ^ (tmp & 0xFFFF)) as u16)
    }
}

impl fmt::Display for SceneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}", self.0)
    }
}

impl fmt::Debug for SceneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SceneId({:04x})", self.0)
    }
}

impl FromStr for SceneId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 4 {
            return Err(ParseIdError::Length {
                expected: 4,
                found: s.to_owned(),
            });
        }
        u16::from_str_radix(s, 16)
            .map(SceneId)
            .map_err(|_| ParseIdError::Digits(s.to_owned()))
    }
}

impl Field for SceneId {
    fn serialize_field(&mut self, s: &mut dyn Serializer, name: Option<&str>) -> bool {
        let mut text = if s.is_reading() {
            String::new()
        } else {
            self.to_string()
        };
        if !s.value_string(&mut text, name) {
            return false;
        }
        if s.is_reading() {
            match text.parse() {
                Ok(id) => *self = id,
                Err(err) => {
                    s.report_error(format!("{}: {err}", name.unwrap_or("id")));
                    return false;
                }
            }
        }
        true
    }
}

/// Address of an object anywhere below some ancestor scene.
///
/// `scene` is the folded path of host node ids (`SceneId::TRANSIENT` for the
/// ancestor itself), `local` the object's id inside its owning scene.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct SceneGlobalId {
    pub scene: SceneId,
    pub local: SceneId,
}

impl SceneGlobalId {
    pub const fn new(scene: SceneId, local: SceneId) -> Self {
        Self { scene, local }
    }

    /// An object in the addressing scene itself.
    pub const fn local(local: SceneId) -> Self {
        Self {
            scene: SceneId::TRANSIENT,
            local,
        }
    }
}

impl fmt::Display for SceneGlobalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.scene, self.local)
    }
}

impl fmt::Debug for SceneGlobalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SceneGlobalId({}:{})", self.scene, self.local)
    }
}

impl FromStr for SceneGlobalId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 8 || !s.is_char_boundary(4) {
            return Err(ParseIdError::Length {
                expected: 8,
                found: s.to_owned(),
            });
        }
        let (scene, local) = s.split_at(4);
        Ok(Self {
            scene: scene.parse()?,
            local: local.parse()?,
        })
    }
}

impl Field for SceneGlobalId {
    fn serialize_field(&mut self, s: &mut dyn Serializer, name: Option<&str>) -> bool {
        let mut text = if s.is_reading() {
            String::new()
        } else {
            self.to_string()
        };
        if !s.value_string(&mut text, name) {
            return false;
        }
        if s.is_reading() {
            match text.parse() {
                Ok(id) => *self = id,
                Err(err) => {
                    s.report_error(format!("{}: {err}", name.unwrap_or("global id")));
                    return false;
                }
            }
        }
        true
    }
}

/// Identity of one live scene instance, distinct across every copy of the
/// same authored scene.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SceneInstanceId(pub Uuid);

impl SceneInstanceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SceneInstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SceneInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn fold_matches_reference_values() {
        assert_eq!(SceneId::fold(SceneId(0), SceneId(2)), SceneId(0x0126));
        assert_eq!(SceneId::fold(SceneId(0x1234), SceneId(0x00ff)), SceneId(0x5e8c));
        let nested = SceneId::fold(SceneId::fold(SceneId(0), SceneId(2)), SceneId(3));
        assert_eq!(nested, SceneId(0xe83e));
    }

    /// Folding is documented as lossy; these are real collisions.
    #[test]
    fn fold_collisions_are_possible() {
        let a = SceneId(0x0010);
        let b = SceneId(0x0777);
        assert_eq!(SceneId::fold(a, b), SceneId::fold(b, a));
        assert_eq!(SceneId::fold(a, a), SceneId::TRANSIENT);
        // Two different single-level host ids reaching the same path id.
        assert_eq!(
            SceneId::fold(SceneId(0), SceneId(145)),
            SceneId::fold(SceneId(0), SceneId(246))
        );
    }

    #[test]
    fn scene_id_hex_round_trip() {
        let id = SceneId(0x0a3f);
        assert_eq!(id.to_string(), "0a3f");
        assert_eq!("0a3f".parse::<SceneId>().unwrap(), id);
        assert!("a3f".parse::<SceneId>().is_err());
        assert!("zzzz".parse::<SceneId>().is_err());
    }

    #[test]
    fn global_id_hex_round_trip() {
        let id = SceneGlobalId::new(SceneId(0x0126), SceneId(7));
        assert_eq!(id.to_string(), "01260007");
        assert_eq!("01260007".parse::<SceneGlobalId>().unwrap(), id);
        assert!("0126007".parse::<SceneGlobalId>().is_err());
    }

    #[test]
    fn instance_id_uniqueness() {
        assert_ne!(SceneInstanceId::new(), SceneInstanceId::new());
    }

    proptest! {
        #[test]
        fn fold_is_deterministic(a in any::<u16>(), b in any::<u16>()) {
            let first = SceneId::fold(SceneId(a), SceneId(b));
            let second = SceneId::fold(SceneId(a), SceneId(b));
            prop_assert_eq!(first, second);
        }

        #[test]
        fn scene_id_text_round_trips(raw in any::<u16>()) {
            let id = SceneId(raw);
            prop_assert_eq!(id.to_string().parse::<SceneId>().unwrap(), id);
        }
    }
}
