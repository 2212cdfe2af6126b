use serde::ser::{Serialize, SerializeMap, Serializer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum InputType {
    KeyDown = 0,
    KeyUp = 1,
    KeyPress = 2,
    MouseDown = 3,
    MouseUp = 4,
    MouseMove = 5,
    MouseWheel = 6,
}

/// One remote input event as the runtime's input host expects it: a flat
/// table with an `input_type` code.
#[derive(Debug, Clone, PartialEq)]
pub enum InputEvent {
    KeyDown { key: u32 },
    KeyUp { key: u32 },
    KeyPress { key: u32 },
    MouseDown { button: u8 },
    MouseUp { button: u8 },
    MouseMove { dx: i32, dy: i32, x: i32, y: i32 },
    MouseWheel { dx: f64, dy: f64, dz: f64 },
}

impl InputEvent {
    pub fn input_type(&self) -> InputType {
        match self {
            Self::KeyDown { .. } => InputType::KeyDown,
            Self::KeyUp { .. } => InputType::KeyUp,
            Self::KeyPress { .. } => InputType::KeyPress,
            Self::MouseDown { .. } => InputType::MouseDown,
            Self::MouseUp { .. } => InputType::MouseUp,
            Self::MouseMove { .. } => InputType::MouseMove,
            Self::MouseWheel { .. } => InputType::MouseWheel,
        }
    }
}

/// Browser buttons number middle as 1 and right as 2; the runtime swaps them.
pub fn remap_browser_button(button: u8) -> u8 {
    match button {
        1 => 2,
        2 => 1,
        other => other,
    }
}

impl Serialize for InputEvent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("input_type", &(self.input_type() as u8))?;
        match self {
            Self::KeyDown { key } | Self::KeyUp { key } | Self::KeyPress { key } => {
                map.serialize_entry("key", key)?;
            }
            Self::MouseDown { button } | Self::MouseUp { button } => {
                map.serialize_entry("button", button)?;
            }
            Self::MouseMove { dx, dy, x, y } => {
                map.serialize_entry("dx", dx)?;
                map.serialize_entry("dy", dy)?;
                map.serialize_entry("x", x)?;
                map.serialize_entry("y", y)?;
            }
            Self::MouseWheel { dx, dy, dz } => {
                map.serialize_entry("dx", dx)?;
                map.serialize_entry("dy", dy)?;
                map.serialize_entry("dz", dz)?;
            }
        }
        map.end()
    }
}
