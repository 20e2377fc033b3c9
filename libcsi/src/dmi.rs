//! Node hardware identity from DMI.

use std::path::Path;

use tracing::debug;

use crate::error::CsiError;

/// Read the node's hardware UUID from `<dmi_dir>/id/product_uuid`,
/// lower-cased.
pub fn system_uuid(dmi_dir: &Path) -> Result<String, CsiError> {
    let path = dmi_dir.join("id").join("product_uuid");
    let raw = std::fs::read_to_string(&path)
        .map_err(|e| CsiError::Internal(format!("read {}: {e}", path.display())))?;
    let id = raw.trim().to_ascii_lowercase();
    debug!(uuid = %id, "read system uuid");
    Ok(id)
}

/// Convert a DMI UUID to the storage platform's byte order: the first three
/// groups are byte-swapped.
///
/// `6B8C2042-0DD1-D037-156F-435F999D94C1` becomes
/// `42208c6b-d10d-37d0-156f-435f999d94c1`.
pub fn convert_uuid(uuid: &str) -> Result<String, CsiError> {
    if uuid.len() != 36 || !uuid.is_ascii() {
        return Err(CsiError::InvalidArgument(
            "uuid length should be 36".to_owned(),
        ));
    }
    let converted = format!(
        "{}{}{}{}-{}{}-{}{}-{}-{}",
        &uuid[6..8],
        &uuid[4..6],
        &uuid[2..4],
        &uuid[0..2],
        &uuid[11..13],
        &uuid[9..11],
        &uuid[16..18],
        &uuid[14..16],
        &uuid[19..23],
        &uuid[24..36],
    );
    Ok(converted.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_to_platform_byte_order() {
        assert_eq!(
            convert_uuid("6B8C2042-0DD1-D037-156F-435F999D94C1").unwrap(),
            "42208c6b-d10d-37d0-156f-435f999d94c1"
        );
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(matches!(
            convert_uuid("6B8C2042"),
            Err(CsiError::InvalidArgument(_))
        ));
    }

    #[test]
    fn reads_and_lowercases_product_uuid() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("id")).unwrap();
        std::fs::write(
            tmp.path().join("id").join("product_uuid"),
            "6B8C2042-0DD1-D037-156F-435F999D94C1\n",
        )
        .unwrap();
        assert_eq!(
            system_uuid(tmp.path()).unwrap(),
            "6b8c2042-0dd1-d037-156f-435f999d94c1"
        );
    }
}
