//! Resolves `(module_type, section, version)` to a binary blob plus the
//! flash addressing a [`crate::module_flasher::ModuleFlasher`] needs to stream it, and loads
//! the firmware manifest that selects versions.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::catalog::{McuFamily, ModuleType, Section};
use crate::error::StoreError;

/// Versions selected for one peripheral module type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleVersions {
    /// Application firmware version.
    pub app: String,
    /// OS (second-bootloader-reported) version.
    pub os: String,
    /// Bootloader version.
    pub bootloader: String,
}

/// Versions selected for the gateway's own network MCU and ESP co-processor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkVersions {
    /// Network application firmware version.
    pub app: String,
    /// ESP application image set version.
    pub sub: String,
    /// ESP OTA factory image version.
    pub ota: String,
}

/// `firmware_version.json`: the selected version of every flashable target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirmwareManifest {
    /// Per-module-type version selection.
    pub modules: HashMap<ModuleType, ModuleVersions>,
    /// Network/ESP version selection.
    pub network: NetworkVersions,
}

impl FirmwareManifest {
    /// Loads and parses a manifest from `path`.
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Flash addressing for one page-loop run: where pages land, what to
/// skip, and what reset vector the end-of-flash record should carry.
#[derive(Debug, Clone, Copy)]
pub struct FlashLayout {
    /// Base address the module's flash is mapped at.
    pub flash_base: u32,
    /// Offset of the first page within the binary.
    pub bin_begin: u32,
    /// Page size in bytes.
    pub page_size: u32,
    /// Offset added to a page's binary offset to get its flash address.
    pub page_offset: u32,
    /// Erase unit count passed as the erase command's page-count field.
    pub erase_page_num: u32,
    /// Address of the end-of-flash metadata page.
    pub end_flash_address: u32,
    /// Address of the flash-info page to also skip, if this section has one.
    pub flash_info_address: Option<u32>,
    /// Reset vector recorded in the end-of-flash record.
    pub reset_vector: u32,
}

impl FlashLayout {
    /// Layout for a peripheral module's given section.
    pub fn for_module(module_type: ModuleType, section: Section) -> Self {
        let family = module_type.mcu_family();
        let (page_size, flash_info_base) = match family {
            McuFamily::E230 => (0x400, 0x0800_4C00),
            McuFamily::E103 => (0x800, 0x0800_8800),
        };
        let end_flash_address = match family {
            McuFamily::E230 => 0x0800_F800,
            McuFamily::E103 => 0x0801_F800,
        };
        let erase_page_num = match family {
            McuFamily::E230 => 1,
            McuFamily::E103 => 2,
        };
        let app_reset_vector = match family {
            McuFamily::E230 => 0x0800_5000,
            McuFamily::E103 => 0x0800_9000,
        };

        match section {
            Section::App => Self {
                flash_base: 0x0800_0000,
                bin_begin: page_size,
                page_size,
                page_offset: flash_info_base - 0x0800_0000,
                erase_page_num,
                end_flash_address,
                flash_info_address: None,
                reset_vector: app_reset_vector,
            },
            Section::Bootloader => Self {
                flash_base: 0x0800_0000,
                bin_begin: 0,
                page_size,
                page_offset: 0x1000,
                erase_page_num,
                end_flash_address,
                flash_info_address: Some(flash_info_base),
                reset_vector: 0x0800_1000,
            },
            Section::SecondBootloader => Self {
                flash_base: 0x0800_0000,
                bin_begin: page_size,
                page_size,
                page_offset: flash_info_base - 0x0800_0000,
                erase_page_num,
                end_flash_address,
                flash_info_address: Some(flash_info_base),
                reset_vector: app_reset_vector,
            },
            Section::Done | Section::Error => {
                unreachable!("terminal sections have no flash layout")
            }
        }
    }

    /// Layout for the network MCU's own application (always "e103" shaped).
    pub fn for_network() -> Self {
        Self {
            flash_base: 0x0800_0000,
            bin_begin: 0x800,
            page_size: 0x800,
            page_offset: 0x8800,
            erase_page_num: 2,
            end_flash_address: 0x0801_F800,
            flash_info_address: None,
            reset_vector: 0x0800_9000,
        }
    }
}

/// ESP application image set, read together for one chunked-flash run.
pub struct EspAppImages {
    /// `bootloader.bin`.
    pub bootloader: Vec<u8>,
    /// `partitions.bin`.
    pub partitions: Vec<u8>,
    /// `ota_data_initial.bin`.
    pub ota_data_initial: Vec<u8>,
    /// `modi_ota_factory.bin`.
    pub modi_ota_factory: Vec<u8>,
    /// `esp32.bin`.
    pub esp32: Vec<u8>,
}

/// Resolves binary blobs and metadata from a firmware store directory,
/// falling back to a bundled assets directory on a miss.
pub struct FirmwareStore {
    root: PathBuf,
    assets_fallback: PathBuf,
}

impl FirmwareStore {
    /// Creates a store rooted at `root`, falling back to `assets_fallback`
    /// when a requested blob is absent under `root`.
    pub fn new(root: impl Into<PathBuf>, assets_fallback: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            assets_fallback: assets_fallback.into(),
        }
    }

    fn resolve(&self, relative: &Path) -> Result<PathBuf, StoreError> {
        let primary = self.root.join(relative);
        if primary.exists() {
            return Ok(primary);
        }
        let fallback = self.assets_fallback.join(relative);
        if fallback.exists() {
            return Ok(fallback);
        }
        Err(StoreError::Missing {
            module_type: ModuleType::Network,
            section: Section::Done,
            version: relative.display().to_string(),
        })
    }

    /// Reads a general peripheral module's binary for `(module_type, version)`.
    pub fn module_blob(&self, module_type: ModuleType, version: &str) -> Result<Vec<u8>, StoreError> {
        let relative = PathBuf::from(module_type.store_dir())
            .join(version)
            .join(format!("{}.bin", module_type.store_dir()));
        let path = self.resolve(&relative).map_err(|_| StoreError::Missing {
            module_type,
            section: Section::App,
            version: version.to_string(),
        })?;
        Ok(std::fs::read(path)?)
    }

    /// Reads the bootloader/second-bootloader binary pair for `(module_type, version)`.
    pub fn bootloader_blob(
        &self,
        module_type: ModuleType,
        section: Section,
        version: &str,
    ) -> Result<Vec<u8>, StoreError> {
        let family = match module_type.mcu_family() {
            McuFamily::E230 => "e230",
            McuFamily::E103 => "e103",
        };
        let file_stem = match section {
            Section::Bootloader => format!("bootloader_{family}"),
            Section::SecondBootloader => format!("second_bootloader_{family}"),
            _ => {
                return Err(StoreError::Missing {
                    module_type,
                    section,
                    version: version.to_string(),
                })
            }
        };
        let relative = PathBuf::from("bootloader")
            .join(family)
            .join(version)
            .join(format!("{file_stem}.bin"));
        let path = self.resolve(&relative).map_err(|_| StoreError::Missing {
            module_type,
            section,
            version: version.to_string(),
        })?;
        Ok(std::fs::read(path)?)
    }

    /// Reads the network MCU's application binary for `version`.
    pub fn network_blob(&self, version: &str) -> Result<Vec<u8>, StoreError> {
        let relative = PathBuf::from("network").join(version).join("network.bin");
        let path = self.resolve(&relative).map_err(|_| StoreError::Missing {
            module_type: ModuleType::Network,
            section: Section::App,
            version: version.to_string(),
        })?;
        Ok(std::fs::read(path)?)
    }

    /// Reads the full ESP application image set for `version`.
    pub fn esp_app_images(&self, version: &str) -> Result<EspAppImages, StoreError> {
        let dir = PathBuf::from("network").join("esp32").join("app").join(version);
        let read = |name: &str| -> Result<Vec<u8>, StoreError> {
            let relative = dir.join(name);
            let path = self.resolve(&relative).map_err(|_| StoreError::Missing {
                module_type: ModuleType::Network,
                section: Section::App,
                version: version.to_string(),
            })?;
            Ok(std::fs::read(path)?)
        };
        Ok(EspAppImages {
            bootloader: read("bootloader.bin")?,
            partitions: read("partitions.bin")?,
            ota_data_initial: read("ota_data_initial.bin")?,
            modi_ota_factory: read("modi_ota_factory.bin")?,
            esp32: read("esp32.bin")?,
        })
    }

    /// Reads the ESP OTA factory image for `version`.
    pub fn esp_ota_image(&self, version: &str) -> Result<Vec<u8>, StoreError> {
        let relative = PathBuf::from("network")
            .join("esp32")
            .join("ota")
            .join(version)
            .join("modi_ota_factory.bin");
        let path = self.resolve(&relative).map_err(|_| StoreError::Missing {
            module_type: ModuleType::Network,
            section: Section::App,
            version: version.to_string(),
        })?;
        Ok(std::fs::read(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn e230_app_layout_matches_the_reference_addresses() {
        let layout = FlashLayout::for_module(ModuleType::Button, Section::App);
        assert_eq!(layout.flash_base, 0x0800_0000);
        assert_eq!(layout.bin_begin, 0x400);
        assert_eq!(layout.page_size, 0x400);
        assert_eq!(layout.page_offset, 0x4C00);
        assert_eq!(layout.end_flash_address, 0x0800_F800);
        assert_eq!(layout.reset_vector, 0x0800_5000);
    }

    #[test]
    fn e103_app_layout_matches_the_reference_addresses() {
        let layout = FlashLayout::for_module(ModuleType::Speaker, Section::App);
        assert_eq!(layout.bin_begin, 0x800);
        assert_eq!(layout.page_size, 0x800);
        assert_eq!(layout.page_offset, 0x8800);
        assert_eq!(layout.end_flash_address, 0x0801_F800);
        assert_eq!(layout.reset_vector, 0x0800_9000);
    }

    #[test]
    fn bootloader_reset_vector_is_always_0x1000() {
        let e230 = FlashLayout::for_module(ModuleType::Button, Section::Bootloader);
        let e103 = FlashLayout::for_module(ModuleType::Speaker, Section::Bootloader);
        assert_eq!(e230.reset_vector, 0x0800_1000);
        assert_eq!(e103.reset_vector, 0x0800_1000);
    }

    #[test]
    fn second_bootloader_reset_vector_follows_family_like_app() {
        let e230 = FlashLayout::for_module(ModuleType::Button, Section::SecondBootloader);
        let e103 = FlashLayout::for_module(ModuleType::Speaker, Section::SecondBootloader);
        assert_eq!(e230.reset_vector, 0x0800_5000);
        assert_eq!(e103.reset_vector, 0x0800_9000);
    }

    #[test]
    fn network_layout_uses_e103_shape() {
        let layout = FlashLayout::for_network();
        assert_eq!(layout.page_size, 0x800);
        assert_eq!(layout.reset_vector, 0x0800_9000);
    }

    #[test]
    fn store_falls_back_to_assets_directory() {
        let tmp = std::env::temp_dir().join(format!("modi-fw-store-test-{}", std::process::id()));
        let root = tmp.join("root");
        let assets = tmp.join("assets");
        std::fs::create_dir_all(root.join("button").join("1.0.0")).unwrap();
        std::fs::create_dir_all(assets.join("button").join("1.0.0")).unwrap();
        std::fs::write(assets.join("button").join("1.0.0").join("button.bin"), b"abc").unwrap();

        let store = FirmwareStore::new(&root, &assets);
        let blob = store.module_blob(ModuleType::Button, "1.0.0").unwrap();
        assert_eq!(blob, b"abc");

        std::fs::remove_dir_all(&tmp).ok();
    }
}
