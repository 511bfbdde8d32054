use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Local id of a simulated object in the scene
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(pub u32);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Inventory item id of a script on an object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemId(pub Uuid);

impl ItemId {
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for ItemId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vector3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vector3 {
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rotation {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub s: f32,
}

impl Default for Rotation {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            z: 0.0,
            s: 1.0,
        }
    }
}

/// A single argument passed to a script event handler
///
/// Host values are converted into this type once, where the scene builds an
/// event request. Workers and the sandbox only ever see these variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventArg {
    Integer(i32),
    Float(f32),
    Text(String),
    Key(Uuid),
    Vector(Vector3),
    Rotation(Rotation),
}

impl From<i32> for EventArg {
    fn from(value: i32) -> Self {
        EventArg::Integer(value)
    }
}

impl From<f32> for EventArg {
    fn from(value: f32) -> Self {
        EventArg::Float(value)
    }
}

impl From<String> for EventArg {
    fn from(value: String) -> Self {
        EventArg::Text(value)
    }
}

impl From<&str> for EventArg {
    fn from(value: &str) -> Self {
        EventArg::Text(value.to_string())
    }
}

impl From<Uuid> for EventArg {
    fn from(value: Uuid) -> Self {
        EventArg::Key(value)
    }
}

impl From<Vector3> for EventArg {
    fn from(value: Vector3) -> Self {
        EventArg::Vector(value)
    }
}

impl From<Rotation> for EventArg {
    fn from(value: Rotation) -> Self {
        EventArg::Rotation(value)
    }
}

/// Detection data for sensor, touch and collision events
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DetectParams {
    pub key: Uuid,
    pub owner: Uuid,
    pub name: String,
    pub group: Uuid,
    pub position: Vector3,
    pub velocity: Vector3,
    pub rotation: Rotation,
    pub link_number: i32,
    pub detect_type: i32,
}

/// Why a script is being started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StateSource {
    #[default]
    NewRez,
    PrimCrossing,
    ScriptedRez,
    AttachedRez,
    RegionStart,
}

impl StateSource {
    /// Whether a persisted checkpoint should be restored when loading
    pub fn restores_state(self) -> bool {
        !matches!(self, StateSource::NewRez)
    }
}

/// Parameters captured when a script is (re)started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StartOptions {
    pub start_param: i32,
    pub post_on_rez: bool,
    pub state_source: StateSource,
    pub start_suspended: bool,
}

impl StartOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_start_param(mut self, start_param: i32) -> Self {
        self.start_param = start_param;
        self
    }

    pub fn with_post_on_rez(mut self, post_on_rez: bool) -> Self {
        self.post_on_rez = post_on_rez;
        self
    }

    pub fn with_state_source(mut self, state_source: StateSource) -> Self {
        self.state_source = state_source;
        self
    }

    pub fn suspended(mut self) -> Self {
        self.start_suspended = true;
        self
    }
}

/// An event as the scene describes it, before it is bound to an instance
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptEvent {
    pub name: String,
    pub detect: Vec<DetectParams>,
    pub args: Vec<EventArg>,
}

impl ScriptEvent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            detect: Vec::new(),
            args: Vec::new(),
        }
    }

    pub fn with_arg(mut self, arg: impl Into<EventArg>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_detect(mut self, detect: Vec<DetectParams>) -> Self {
        self.detect = detect;
        self
    }
}
