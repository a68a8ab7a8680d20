//! Mapping between a module's 64-bit UUID and its type tag, and the
//! flash-region section a module is currently in.

use serde::{Deserialize, Serialize};

/// A peripheral module kind, derived from the top 32 bits of its UUID.
///
/// `Network` is the catch-all for any UUID that does not match one of
/// the fixed prefixes below — the gateway's own MCU identifies itself
/// this way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleType {
    /// Battery/power module.
    Battery,
    /// Environment sensor.
    Env,
    /// Inertial measurement unit.
    Imu,
    /// Microphone.
    Mic,
    /// Push button.
    Button,
    /// Rotary dial.
    Dial,
    /// Ultrasonic distance sensor.
    Ultrasonic,
    /// Infrared sensor.
    Ir,
    /// Joystick.
    Joystick,
    /// Time-of-flight distance sensor.
    Tof,
    /// Camera.
    Camera,
    /// Display.
    Display,
    /// Motor driver.
    Motor,
    /// LED.
    Led,
    /// Speaker.
    Speaker,
    /// The gateway's own application MCU.
    Network,
}

impl ModuleType {
    /// MCU family a module's flash layout belongs to.
    ///
    /// `speaker`, `display`, and `env` modules (and the network MCU)
    /// use the larger "e103" page layout; every other peripheral uses
    /// the "e230" layout.
    pub fn mcu_family(self) -> McuFamily {
        match self {
            ModuleType::Speaker | ModuleType::Display | ModuleType::Env | ModuleType::Network => {
                McuFamily::E103
            }
            _ => McuFamily::E230,
        }
    }

    /// Directory fragment used by the firmware store for this type.
    pub fn store_dir(self) -> &'static str {
        match self {
            ModuleType::Battery => "battery",
            ModuleType::Env => "env",
            ModuleType::Imu => "imu",
            ModuleType::Mic => "mic",
            ModuleType::Button => "button",
            ModuleType::Dial => "dial",
            ModuleType::Ultrasonic => "ultrasonic",
            ModuleType::Ir => "ir",
            ModuleType::Joystick => "joystick",
            ModuleType::Tof => "tof",
            ModuleType::Camera => "camera",
            ModuleType::Display => "display",
            ModuleType::Motor => "motor",
            ModuleType::Led => "led",
            ModuleType::Speaker => "speaker",
            ModuleType::Network => "network",
        }
    }
}

/// MCU family, which selects page size and the set of flash addresses
/// a flasher targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McuFamily {
    /// Smaller page layout, used by most peripherals.
    E230,
    /// Larger page layout, used by speaker/display/env and the network MCU.
    E103,
}

/// The flash region a module is currently being driven through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    /// Application firmware.
    App,
    /// Primary bootloader.
    Bootloader,
    /// Secondary ("second") bootloader.
    SecondBootloader,
    /// Terminal success state.
    Done,
    /// Terminal failure state.
    Error,
}

/// Derives a module's type tag from the top 32 bits of its UUID.
///
/// Any UUID whose top 32 bits do not match a known prefix is treated as
/// the network module's own identity.
pub fn type_from_uuid(uuid: u64) -> ModuleType {
    match (uuid >> 32) as u32 {
        0x10 => ModuleType::Battery,
        0x2000 => ModuleType::Env,
        0x2010 => ModuleType::Imu,
        0x2020 => ModuleType::Mic,
        0x2030 => ModuleType::Button,
        0x2040 => ModuleType::Dial,
        0x2050 => ModuleType::Ultrasonic,
        0x2060 => ModuleType::Ir,
        0x2070 => ModuleType::Joystick,
        0x2080 => ModuleType::Tof,
        0x2090 => ModuleType::Camera,
        0x4000 => ModuleType::Display,
        0x4010 | 0x4011 => ModuleType::Motor,
        0x4020 => ModuleType::Led,
        0x4030 => ModuleType::Speaker,
        _ => ModuleType::Network,
    }
}

/// The canonical top-32-bit tag for a module type, the inverse of
/// [`type_from_uuid`] used by type reassignment (§4.6.3).
///
/// `Network` has no canonical tag of its own since it is the catch-all;
/// reassigning a module to `Network` is not a supported operation.
pub fn uuid_type_tag(module_type: ModuleType) -> Option<u32> {
    match module_type {
        ModuleType::Battery => Some(0x10),
        ModuleType::Env => Some(0x2000),
        ModuleType::Imu => Some(0x2010),
        ModuleType::Mic => Some(0x2020),
        ModuleType::Button => Some(0x2030),
        ModuleType::Dial => Some(0x2040),
        ModuleType::Ultrasonic => Some(0x2050),
        ModuleType::Ir => Some(0x2060),
        ModuleType::Joystick => Some(0x2070),
        ModuleType::Tof => Some(0x2080),
        ModuleType::Camera => Some(0x2090),
        ModuleType::Display => Some(0x4000),
        ModuleType::Motor => Some(0x4010),
        ModuleType::Led => Some(0x4020),
        ModuleType::Speaker => Some(0x4030),
        ModuleType::Network => None,
    }
}

/// Builds a target uuid for type reassignment by replacing the top 32
/// bits of `source_uuid` with `target_type`'s canonical tag.
pub fn retarget_uuid(source_uuid: u64, target_type: ModuleType) -> Option<u64> {
    let tag = uuid_type_tag(target_type)? as u64;
    Some((tag << 32) | (source_uuid & 0xFFFF_FFFF))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_round_trip_for_every_non_network_type() {
        let types = [
            ModuleType::Battery,
            ModuleType::Env,
            ModuleType::Imu,
            ModuleType::Mic,
            ModuleType::Button,
            ModuleType::Dial,
            ModuleType::Ultrasonic,
            ModuleType::Ir,
            ModuleType::Joystick,
            ModuleType::Tof,
            ModuleType::Camera,
            ModuleType::Display,
            ModuleType::Motor,
            ModuleType::Led,
            ModuleType::Speaker,
        ];
        for t in types {
            let tag = uuid_type_tag(t).unwrap();
            let uuid = (tag as u64) << 32;
            assert_eq!(type_from_uuid(uuid), t, "round trip failed for {t:?}");
        }
    }

    #[test]
    fn unmatched_uuid_is_network() {
        assert_eq!(type_from_uuid(0xDEAD_BEEF_0000_0001), ModuleType::Network);
    }

    #[test]
    fn mcu_family_splits_speaker_display_env() {
        assert_eq!(ModuleType::Speaker.mcu_family(), McuFamily::E103);
        assert_eq!(ModuleType::Display.mcu_family(), McuFamily::E103);
        assert_eq!(ModuleType::Env.mcu_family(), McuFamily::E103);
        assert_eq!(ModuleType::Button.mcu_family(), McuFamily::E230);
    }

    #[test]
    fn retarget_uuid_preserves_bus_id_bits() {
        let source = (0x2030u64 << 32) | 0x0000_0007;
        let retargeted = retarget_uuid(source, ModuleType::Led).unwrap();
        assert_eq!(retargeted, (0x4020u64 << 32) | 0x0000_0007);
    }
}
