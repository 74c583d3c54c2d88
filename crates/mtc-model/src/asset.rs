//! Assets: mutable domain objects associated with a device
//!
//! The store owns assets as `Arc<Asset>`; removal tombstones the entry in
//! place so sequence-based consumers can still resolve it until eviction.

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

/// Well-known asset payload families. Anything else is carried opaquely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssetKind {
    CuttingTool,
    CuttingToolArchetype,
    File,
    FileArchetype,
    RawMaterial,
    QifDocument,
    Other,
}

impl AssetKind {
    /// Classify by the payload's element name
    pub fn from_type(asset_type: &str) -> Self {
        match asset_type {
            "CuttingTool" => Self::CuttingTool,
            "CuttingToolArchetype" => Self::CuttingToolArchetype,
            "File" => Self::File,
            "FileArchetype" => Self::FileArchetype,
            "RawMaterial" => Self::RawMaterial,
            "QIFDocumentWrapper" => Self::QifDocument,
            _ => Self::Other,
        }
    }
}

pub struct Asset {
    asset_id: RwLock<String>,
    /// Payload element name ("CuttingTool", "Part", ...)
    asset_type: String,
    kind: AssetKind,
    device_uuid: RwLock<Option<String>>,
    timestamp: DateTime<Utc>,
    removed: AtomicBool,
    /// The raw XML body as received; printers re-emit it verbatim
    payload: String,
}

impl std::fmt::Debug for Asset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Asset")
            .field("asset_id", &self.asset_id())
            .field("type", &self.asset_type)
            .field("device_uuid", &self.device_uuid())
            .field("removed", &self.is_removed())
            .finish()
    }
}

impl Asset {
    pub fn new(
        asset_id: impl Into<String>,
        asset_type: impl Into<String>,
        device_uuid: Option<String>,
        timestamp: DateTime<Utc>,
        payload: impl Into<String>,
    ) -> Self {
        let asset_type = asset_type.into();
        let kind = AssetKind::from_type(&asset_type);
        Self {
            asset_id: RwLock::new(asset_id.into()),
            asset_type,
            kind,
            device_uuid: RwLock::new(device_uuid),
            timestamp,
            removed: AtomicBool::new(false),
            payload: payload.into(),
        }
    }

    pub fn asset_id(&self) -> String {
        self.asset_id.read().clone()
    }

    /// Canonicalization rewrite (`@X` -> `<deviceUuid>X`), before sharing
    pub fn set_asset_id(&self, id: impl Into<String>) {
        *self.asset_id.write() = id.into();
    }

    pub fn asset_type(&self) -> &str {
        &self.asset_type
    }

    pub fn kind(&self) -> AssetKind {
        self.kind
    }

    pub fn device_uuid(&self) -> Option<String> {
        self.device_uuid.read().clone()
    }

    pub fn set_device_uuid(&self, uuid: impl Into<String>) {
        *self.device_uuid.write() = Some(uuid.into());
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    pub fn set_removed(&self) {
        self.removed.store(true, Ordering::Release);
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_known_types() {
        assert_eq!(AssetKind::from_type("CuttingTool"), AssetKind::CuttingTool);
        assert_eq!(
            AssetKind::from_type("QIFDocumentWrapper"),
            AssetKind::QifDocument
        );
        assert_eq!(AssetKind::from_type("Part"), AssetKind::Other);
    }

    #[test]
    fn tombstone_flag() {
        let asset = Asset::new("0001", "Part", Some("000".into()), Utc::now(), "<Part/>");
        assert!(!asset.is_removed());
        asset.set_removed();
        assert!(asset.is_removed());
    }

    #[test]
    fn id_rewrite() {
        let asset = Asset::new("@1", "Part", Some("000".into()), Utc::now(), "<Part/>");
        asset.set_asset_id("0001");
        assert_eq!(asset.asset_id(), "0001");
    }
}
