//! Values decoded from robot payloads and the enumerated command parameters.

use crate::error::{Result, RobotError};
use crate::packet::Packet;
use bytes::Buf;
use num_enum::{FromPrimitive, IntoPrimitive, TryFromPrimitive};
use std::fmt;
use strum_macros::Display;

/// Offset of event data inside an event payload, after the 4-byte timestamp.
const EVENT_DATA: usize = 4;

/// Bumper state from a bump event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Bumper {
    pub left: bool,
    pub right: bool,
}

impl Bumper {
    pub fn new(left: bool, right: bool) -> Self {
        Self { left, right }
    }

    pub fn from_packet(packet: &Packet) -> Self {
        let state = packet.payload[EVENT_DATA];
        Self {
            left: state & 0x80 != 0,
            right: state & 0x40 != 0,
        }
    }
}

/// Color code reported for one zone of the color sensor array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, FromPrimitive, IntoPrimitive)]
#[repr(i8)]
pub enum ColorCode {
    /// Wildcard used in filters. Never produced by decoding.
    Any = -1,
    White = 0,
    Black = 1,
    Red = 2,
    Green = 3,
    Blue = 4,
    Orange = 5,
    Yellow = 6,
    Magenta = 7,
    NoColor = 15,

    #[num_enum(catch_all)]
    Unknown(i8),
}

/// Color sensor reading: one code per zone, 32 zones from left to right.
///
/// As a filter, the list may hold 1 to 32 entries; the reading is then split
/// into that many zones and each entry must be [`ColorCode::Any`] or appear
/// in its zone.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Color {
    pub zones: Vec<ColorCode>,
}

impl Color {
    pub fn new(zones: impl Into<Vec<ColorCode>>) -> Self {
        Self { zones: zones.into() }
    }

    pub fn from_packet(packet: &Packet) -> Self {
        let zones = packet
            .payload
            .iter()
            .flat_map(|byte| [byte >> 4, byte & 0x0F])
            .map(|nibble| ColorCode::from_primitive(nibble as i8))
            .collect();
        Self { zones }
    }

    /// Check this reading against a zone filter.
    pub fn matches(&self, filter: &Color) -> bool {
        if filter.zones.is_empty() {
            return true;
        }
        let chunk = (self.zones.len() as f64 / filter.zones.len() as f64).round().max(1.0) as usize;
        filter
            .zones
            .iter()
            .zip(self.zones.chunks(chunk))
            .all(|(wanted, zone)| *wanted == ColorCode::Any || zone.contains(wanted))
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let codes: Vec<String> = self.zones.iter().map(|c| c.to_string()).collect();
        write!(f, "Color[{}]", codes.join(", "))
    }
}

/// Comparator state of the two ambient light sensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum LightState {
    Darker = 4,
    RightBrighter = 5,
    LeftBrighter = 6,
    Lighter = 7,

    #[num_enum(catch_all)]
    Unknown(u8),
}

/// Light event. Filters compare only `state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Light {
    pub state: LightState,
    /// Left sensor reading in millivolts.
    pub left: u16,
    /// Right sensor reading in millivolts.
    pub right: u16,
}

impl Light {
    pub fn new(state: LightState) -> Self {
        Self {
            state,
            left: 0,
            right: 0,
        }
    }

    pub fn from_packet(packet: &Packet) -> Self {
        let mut data = &packet.payload[EVENT_DATA..];
        Self {
            state: LightState::from_primitive(data.get_u8()),
            left: data.get_u16(),
            right: data.get_u16(),
        }
    }
}

/// Touch sensor state from a touch event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Touch {
    pub front_left: bool,
    pub front_right: bool,
    pub back_right: bool,
    pub back_left: bool,
}

impl Touch {
    pub fn new(front_left: bool, front_right: bool, back_right: bool, back_left: bool) -> Self {
        Self {
            front_left,
            front_right,
            back_right,
            back_left,
        }
    }

    pub fn from_packet(packet: &Packet) -> Self {
        let state = packet.payload[EVENT_DATA];
        Self {
            front_left: state & 0x80 != 0,
            front_right: state & 0x40 != 0,
            back_right: state & 0x20 != 0,
            back_left: state & 0x10 != 0,
        }
    }
}

/// Lets the robot methods take either the typed parameter or a raw code that
/// gets clamped into range.
macro_rules! impl_protocol_code {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for i32 {
                fn from(value: $ty) -> i32 {
                    i32::from(u8::from(value))
                }
            }
        )*
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Default, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Marker {
    #[default]
    Up = 0,
    Down = 1,
    Erase = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Default, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Animation {
    Off = 0,
    #[default]
    On = 1,
    Blink = 2,
    Spin = 3,
}

/// Bank of eight color sensors to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Default, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ColorSensors {
    #[default]
    #[strum(to_string = "sensors 0-7")]
    Sensors0To7 = 0,
    #[strum(to_string = "sensors 8-15")]
    Sensors8To15 = 1,
    #[strum(to_string = "sensors 16-23")]
    Sensors16To23 = 2,
    #[strum(to_string = "sensors 24-31")]
    Sensors24To31 = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Default, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ColorLighting {
    Off = 0,
    Red = 1,
    Green = 2,
    Blue = 3,
    #[default]
    All = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Default, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ColorFormat {
    #[default]
    AdcCounts = 0,
    Millivolts = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Default, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ModulationType {
    #[default]
    Disabled = 0,
    Volume = 1,
    PulseWidth = 2,
    Frequency = 3,
}

impl_protocol_code!(Marker, Animation, ColorSensors, ColorLighting, ColorFormat, ModulationType);

const PITCH_CLASSES: [&str; 12] = ["C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B"];

/// Frequency in hertz of a note name such as `"C#5"`, with A4 at 440 Hz.
pub fn note(name: &str) -> Result<f64> {
    note_with_reference(name, 440.0)
}

/// Frequency in hertz of a note name on an equal-tempered scale tuned to `a4`.
pub fn note_with_reference(name: &str, a4: f64) -> Result<f64> {
    let invalid = || RobotError::InvalidNote(name.to_string());
    let split = name
        .find(|c: char| c.is_ascii_digit() || c == '-')
        .ok_or_else(invalid)?;
    let (pitch, octave) = name.split_at(split);
    let octave: i32 = octave.parse().map_err(|_| invalid())?;
    let index = PITCH_CLASSES
        .iter()
        .position(|p| *p == pitch)
        .ok_or_else(invalid)? as i32;

    // Semitones counted from C1 = 1, which puts A4 at 46.
    let from_a4 = octave
        .checked_sub(1)
        .and_then(|o| o.checked_mul(12))
        .and_then(|s| s.checked_add(index + 1 - 46))
        .ok_or_else(invalid)?;
    Ok(a4 * 2f64.powf(f64::from(from_a4) / 12.0))
}
