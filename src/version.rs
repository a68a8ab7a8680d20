//! Packing/unpacking the 16-bit version word embedded in the
//! end-of-flash record: `(major << 13) | (minor << 8) | patch`.

/// Parses a version string of the form `"major.minor.patch"`, stripping
/// a leading `v` and any trailing `-suffix`, and packs it into the
/// 16-bit word the end-of-flash record carries.
pub fn pack_version(version: &str) -> Option<u16> {
    let version = version.strip_prefix('v').unwrap_or(version);
    let version = version.split('-').next().unwrap_or(version);
    let mut parts = version.split('.');
    let major: u16 = parts.next()?.parse().ok()?;
    let minor: u16 = parts.next()?.parse().ok()?;
    let patch: u16 = parts.next()?.parse().ok()?;
    Some((major << 13) | (minor << 8) | patch)
}

/// Unpacks a 16-bit version word back into `"major.minor.patch"`.
pub fn unpack_version(word: u16) -> String {
    let major = word >> 13;
    let minor = (word >> 8) & 0x1F;
    let patch = word & 0xFF;
    format!("{major}.{minor}.{patch}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_packing_round_trip_with_leading_v_and_suffix() {
        let packed = pack_version("v2.3.5-rc1").unwrap();
        assert_eq!(packed, 0x4305);
        assert_eq!(unpack_version(packed), "2.3.5");
    }

    #[test]
    fn version_packing_plain_string() {
        let packed = pack_version("1.0.0").unwrap();
        assert_eq!(unpack_version(packed), "1.0.0");
    }

    #[test]
    fn version_packing_rejects_malformed_input() {
        assert_eq!(pack_version("not-a-version"), None);
        assert_eq!(pack_version("1.2"), None);
    }
}
