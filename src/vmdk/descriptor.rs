//! Text descriptor of a VMDK disk: header, extent list and disk database.
//!
//! See also: https://github.com/libyal/libvmdk/blob/main/documentation/VMWare%20Virtual%20Disk%20Format%20(VMDK).asciidoc#2-the-descriptor-file

use std::{collections::HashMap, str::FromStr, sync::LazyLock};

use log::warn;
use regex::Regex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::SECTOR_SIZE;

pub const DESCRIPTOR_FILE_SIGNATURE: &str = "# Disk DescriptorFile";
const EXTENT_SECTION_SIGNATURE: &str = "# Extent description";
const CHANGE_TRACKING_SECTION_SIGNATURE: &str = "# Change Tracking File";
const DISK_DATABASE_SECTION_SIGNATURE: &str = "# The Disk Data Base";

/// `parentCID` value of a base image.
pub const NO_PARENT_CID: u32 = 0xffffffff;

/// Decodes a descriptor token through the serde renames of `T`.
fn from_token<T: DeserializeOwned>(token: &str) -> Option<T> {
    serde_json::from_value(serde_json::Value::String(token.to_string())).ok()
}

/// Character encoding of the descriptor file.
///
/// See also: https://github.com/libyal/libvmdk/blob/main/documentation/VMWare%20Virtual%20Disk%20Format%20(VMDK).asciidoc#211-encodings
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub enum DescriptorEncoding {
    /// UTF-8, the default when the key is absent
    #[serde(rename = "UTF-8")]
    Utf8,
    /// Big5, Windows codepage 950
    #[serde(rename = "Big5")]
    Big5,
    /// GBK, Windows codepage 936
    /// Written by Chinese editions of VMware for Windows
    #[serde(rename = "GBK")]
    Gbk,
    /// Shift_JIS, Windows codepage 932
    /// Written by the Japanese edition of VMware Workstation for Windows
    #[serde(rename = "Shift_JIS")]
    ShiftJis,
    /// Windows codepage 1252
    #[serde(rename = "windows-1252")]
    Windows1252,
}

/// Disk type announced by `createType`.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub enum DiskType {
    /// Flat extent files of at most 2 GiB each
    #[serde(rename = "2GbMaxExtentFlat", alias = "twoGbMaxExtentFlat")]
    TwoGbMaxExtentFlat,
    /// Sparse extent files of at most 2 GiB each
    #[serde(rename = "2GbMaxExtentSparse", alias = "twoGbMaxExtentSparse")]
    TwoGbMaxExtentSparse,
    /// Extents of mixed types
    Custom,
    /// Raw device
    FullDevice,
    /// A single flat extent file
    MonolithicFlat,
    /// A single sparse extent file with the descriptor embedded
    MonolithicSparse,
    /// Raw device partitions
    PartitionedDevice,
    /// Compressed sparse extent meant for streaming, not supported for reading
    StreamOptimized,
    /// Preallocated VMFS extent
    Vmfs,
    /// Preallocated VMFS extent zeroed on creation
    VmfsEagerZeroedThick,
    VmfsPreallocated,
    VmfsRaw,
    /// Raw device mapping
    #[serde(rename = "vmfsRDM")]
    VmfsRawDeviceMap,
    /// Raw device mapping in pass-through mode
    #[serde(rename = "vmfsRDMP")]
    VmfsPassthroughRawDeviceMap,
    /// VMFS delta link of a snapshot
    VmfsSparse,
    /// Thin provisioned VMFS extent
    VmfsThin,
}

/// Header fields of the descriptor.
#[derive(Clone, Debug, Serialize)]
pub struct DescriptorHeader {
    /// The descriptor version number, 1, 2 or 3.
    pub version: u8,
    /// Encoding of the descriptor file
    pub encoding: DescriptorEncoding,
    /// Content identifier of this image.
    /// A random 32-bit value updated the first time the content of the virtual disk is modified after it is opened.
    pub cid: u32,
    /// Content identifier of the parent, `ffffffff` for a base image.
    pub parent_cid: u32,
    /// Only seen value is "no"
    pub is_native_snapshot: Option<bool>,
    /// Disk type, `None` when unknown
    pub create_type: Option<DiskType>,
    /// Path of the parent image, only present for delta links.
    pub parent_file_name_hint: Option<String>,
}

impl DescriptorHeader {
    pub fn has_parent(&self) -> bool {
        self.parent_cid != NO_PARENT_CID
    }
}

impl TryFrom<HashMap<String, String>> for DescriptorHeader {
    type Error = String;

    fn try_from(value: HashMap<String, String>) -> Result<Self, Self::Error> {
        let version = value
            .get("version")
            .ok_or("version not found in header")?
            .parse()
            .map_err(|_| "invalid version in header")?;
        let encoding = match value.get("encoding") {
            Some(encoding) => {
                from_token::<DescriptorEncoding>(encoding)
                    .ok_or_else(|| format!("invalid encoding in header: {}", encoding))?
            }
            None => DescriptorEncoding::Utf8,
        };
        let cid = u32::from_str_radix(value.get("CID").ok_or("CID not found in header")?, 16)
            .map_err(|_| "invalid CID in header")?;
        let parent_cid = u32::from_str_radix(
            value.get("parentCID").ok_or("parentCID not found in header")?,
            16,
        )
        .map_err(|_| "invalid parentCID in header")?;
        let create_type = value.get("createType").and_then(|s| {
            let create_type = from_token::<DiskType>(s);
            if create_type.is_none() {
                warn!("Unknown createType in descriptor header: {}", s);
            }
            create_type
        });
        Ok(DescriptorHeader {
            version,
            encoding,
            cid,
            parent_cid,
            is_native_snapshot: value.get("isNativeSnapshot").map(|s| s == "yes"),
            create_type,
            parent_file_name_hint: value
                .get("parentFileNameHint")
                .filter(|s| !s.is_empty())
                .cloned(),
        })
    }
}

/// Access mode of an extent.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
#[serde(rename_all = "UPPERCASE")]
pub enum AccessMode {
    /// No access
    NoAccess,
    /// Read-only access
    RdOnly,
    /// Read and write access
    Rw,
}

/// Storage kind of an extent.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Copy)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExtentType {
    /// Raw data file, read linearly.
    Flat,
    /// Sparse extent indexed by a grain directory.
    Sparse,
    /// No backing file, all bytes are zero.
    Zero,
    /// Preallocated VMFS extent, read like a flat file.
    Vmfs,
    /// VMFS delta link, not supported.
    VmfsSparse,
    /// Raw device mapping, not supported.
    VmfsRdm,
    /// Raw device, not supported.
    VmfsRaw,
}

/// One line of the extent section.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct ExtentDeclaration {
    pub access_mode: AccessMode,
    /// Number of 512-byte sectors the extent contributes to the disk.
    pub sector_count: u64,
    pub extent_type: ExtentType,
    /// Extent file name, relative to the descriptor. Absent for ZERO extents.
    pub file_name: Option<String>,
    /// Sector offset of the extent data inside a flat extent file.
    pub file_offset_sectors: u64,
}

impl FromStr for ExtentDeclaration {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        static EXTENT_LINE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
            Regex::new(r#"^(\w+)\s+(\d+)\s+(\w+)(?:\s+"([^"]+)"(?:\s+(\d+))?)?\s*$"#).unwrap()
        });
        let captures = EXTENT_LINE_REGEX
            .captures(s)
            .ok_or_else(|| format!("Invalid extent description: {}", s))?;
        // Groups 1 to 3 are mandatory in the expression.
        let access_mode = &captures[1];
        let extent_type = &captures[3];
        // Sector values must stay addressable in bytes.
        let sectors = |value: &str, what: &str| -> Result<u64, String> {
            value
                .parse::<u64>()
                .ok()
                .filter(|sectors| sectors.checked_mul(SECTOR_SIZE).is_some())
                .ok_or_else(|| format!("Invalid {} in extent description: {}", what, value))
        };
        Ok(Self {
            access_mode: from_token(access_mode)
                .ok_or_else(|| format!("Invalid access mode in extent description: {}", access_mode))?,
            sector_count: sectors(&captures[2], "sector count")?,
            extent_type: from_token(extent_type)
                .ok_or_else(|| format!("Invalid extent type in extent description: {}", extent_type))?,
            file_name: captures.get(4).map(|m| m.as_str().to_string()),
            file_offset_sectors: match captures.get(5) {
                Some(offset) => sectors(offset.as_str(), "file offset")?,
                None => 0,
            },
        })
    }
}

/// Adapter type recorded in the disk database.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub enum AdapterType {
    #[serde(rename = "ide")]
    Ide,
    #[serde(rename = "buslogic")]
    BusLogic,
    #[serde(rename = "lsilogic")]
    LsiLogic,
    #[serde(rename = "legacyESX")]
    LegacyEsx,
    #[serde(rename = "pvscsi")]
    Pvscsi,
}

/// Disk database entries. Parsed best-effort, never fails.
#[derive(Clone, Debug, Default, Serialize)]
pub struct DiskDatabase {
    pub adapter_type: Option<AdapterType>,
    pub virtual_hw_version: Option<String>,
    pub long_content_id: Option<String>,
    pub uuid: Option<String>,
    pub geometry_cylinders: Option<u64>,
    pub geometry_heads: Option<u64>,
    pub geometry_sectors: Option<u64>,
    pub tools_version: Option<String>,
    pub thin_provisioned: Option<bool>,
}

impl From<HashMap<String, String>> for DiskDatabase {
    fn from(value: HashMap<String, String>) -> Self {
        let number = |key: &str| -> Option<u64> { value.get(key).and_then(|s| s.parse().ok()) };
        Self {
            adapter_type: value.get("ddb.adapterType").and_then(|s| from_token(s)),
            virtual_hw_version: value.get("ddb.virtualHWVersion").cloned(),
            long_content_id: value.get("ddb.longContentID").cloned(),
            uuid: value.get("ddb.uuid").cloned(),
            geometry_cylinders: number("ddb.geometry.cylinders"),
            geometry_heads: number("ddb.geometry.heads"),
            geometry_sectors: number("ddb.geometry.sectors"),
            tools_version: value.get("ddb.toolsVersion").cloned(),
            thin_provisioned: value.get("ddb.thinProvisioned").map(|s| s == "1" || s == "true"),
        }
    }
}

/// A parsed descriptor file.
#[derive(Clone, Debug, Serialize)]
pub struct Descriptor {
    pub header: DescriptorHeader,
    pub extents: Vec<ExtentDeclaration>,
    pub change_track_path: Option<String>,
    pub disk_database: DiskDatabase,
}

#[derive(Clone, Copy, PartialEq)]
enum Section {
    Header,
    Extents,
    ChangeTracking,
    DiskDatabase,
}

fn section_of(line: &str) -> Option<Section> {
    match line.trim_end() {
        DESCRIPTOR_FILE_SIGNATURE => Some(Section::Header),
        EXTENT_SECTION_SIGNATURE => Some(Section::Extents),
        CHANGE_TRACKING_SECTION_SIGNATURE => Some(Section::ChangeTracking),
        DISK_DATABASE_SECTION_SIGNATURE => Some(Section::DiskDatabase),
        _ => None,
    }
}

/// Parses a `key = value` line, stripping optional quotes around the value.
fn parse_key_value_pair(line: &str) -> Option<(&str, &str)> {
    static KEY_VALUE_REGEX: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r#"^([\w\.]+)\s*=\s*"?([^"]*)"?$"#).unwrap());
    let captures = KEY_VALUE_REGEX.captures(line)?;
    Some((captures.get(1)?.as_str(), captures.get(2)?.as_str().trim()))
}

impl FromStr for Descriptor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Embedded descriptors are NUL padded up to the sector boundary.
        let s = s.trim_end_matches('\0');
        let mut lines = s.lines().map(str::trim).filter(|l| !l.is_empty());
        match lines.next() {
            Some(first) if section_of(first) == Some(Section::Header) => {}
            Some(first) => return Err(format!("Signature not found: {}", first)),
            None => return Err("Empty descriptor".to_string()),
        }

        let mut section = Section::Header;
        let mut header_fields = HashMap::new();
        let mut extents = Vec::new();
        let mut ddb_fields = HashMap::new();
        let mut change_track_path = None;
        for line in lines {
            if line.starts_with('#') {
                section = section_of(line).unwrap_or(section);
                continue;
            }
            match section {
                Section::Header => {
                    if let Some((key, value)) = parse_key_value_pair(line) {
                        header_fields.insert(key.to_string(), value.to_string());
                    }
                }
                Section::Extents => match line.parse() {
                    Ok(extent) => extents.push(extent),
                    Err(e) => warn!("Skipping extent line: {}", e),
                },
                Section::ChangeTracking => {
                    if let Some(("changeTrackPath", value)) = parse_key_value_pair(line) {
                        change_track_path = Some(value.to_string());
                    }
                }
                Section::DiskDatabase => {
                    if let Some((key, value)) = parse_key_value_pair(line) {
                        ddb_fields.insert(key.to_string(), value.to_string());
                    }
                }
            }
        }

        Ok(Descriptor {
            header: DescriptorHeader::try_from(header_fields)?,
            extents,
            change_track_path,
            disk_database: DiskDatabase::from(ddb_fields),
        })
    }
}

impl Descriptor {
    /// Total number of sectors declared by the extent list.
    pub fn total_sectors(&self) -> u64 {
        self.extents
            .iter()
            .map(|e| e.sector_count)
            .fold(0, u64::saturating_add)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_value_pair() {
        assert_eq!(parse_key_value_pair("key1 = value1"), Some(("key1", "value1")));
        assert_eq!(
            parse_key_value_pair("key3 = \"with quotes\""),
            Some(("key3", "with quotes"))
        );
        assert_eq!(parse_key_value_pair("CID=fffffffe"), Some(("CID", "fffffffe")));
        assert_eq!(parse_key_value_pair("key4"), None);
        assert_eq!(
            parse_key_value_pair("ddb.geometry.heads = \"16\""),
            Some(("ddb.geometry.heads", "16"))
        );
    }

    #[test]
    fn test_parse_extent_lines() {
        let sparse: ExtentDeclaration = "RW 4192256 SPARSE \"disk-s001.vmdk\"".parse().unwrap();
        assert_eq!(sparse.access_mode, AccessMode::Rw);
        assert_eq!(sparse.sector_count, 4192256);
        assert_eq!(sparse.extent_type, ExtentType::Sparse);
        assert_eq!(sparse.file_name.as_deref(), Some("disk-s001.vmdk"));
        assert_eq!(sparse.file_offset_sectors, 0);

        let flat: ExtentDeclaration = "RDONLY 2048 FLAT \"my disk-flat.vmdk\" 128".parse().unwrap();
        assert_eq!(flat.access_mode, AccessMode::RdOnly);
        assert_eq!(flat.file_name.as_deref(), Some("my disk-flat.vmdk"));
        assert_eq!(flat.file_offset_sectors, 128);

        let zero: ExtentDeclaration = "NOACCESS 100 ZERO".parse().unwrap();
        assert_eq!(zero.extent_type, ExtentType::Zero);
        assert_eq!(zero.file_name, None);

        assert!("RW many SPARSE \"a.vmdk\"".parse::<ExtentDeclaration>().is_err());
        assert!("RW 10 BOGUS \"a.vmdk\"".parse::<ExtentDeclaration>().is_err());
        assert!("RW 36028797018963968 FLAT \"a.vmdk\"".parse::<ExtentDeclaration>().is_err());
        assert!("RW 10 FLAT \"a.vmdk\" 36028797018963968".parse::<ExtentDeclaration>().is_err());
    }

    #[test]
    fn test_parse_descriptor_data() {
        let descriptor_data = r#"
# Disk DescriptorFile
version=1
CID=123a5678
parentCID=ffffffff
createType="twoGbMaxExtentSparse"
encoding="UTF-8"
isNativeSnapshot="no"

# Extent description
RW 4192256 SPARSE "disk-s001.vmdk"
RW 2048 ZERO

# The Disk Data Base
#DDB

ddb.virtualHWVersion = "4"
ddb.geometry.cylinders = "16383"
ddb.geometry.heads = "16"
ddb.adapterType = "ide"
"#;
        let descriptor: Descriptor = descriptor_data.parse().unwrap();
        assert_eq!(
            descriptor.header.create_type,
            Some(DiskType::TwoGbMaxExtentSparse)
        );
        assert_eq!(descriptor.header.cid, 0x123a5678);
        assert!(!descriptor.header.has_parent());
        assert_eq!(descriptor.header.is_native_snapshot, Some(false));
        assert_eq!(descriptor.extents.len(), 2);
        assert_eq!(descriptor.total_sectors(), 4192256 + 2048);
        assert_eq!(descriptor.disk_database.geometry_cylinders, Some(16383));
        assert_eq!(descriptor.disk_database.adapter_type, Some(AdapterType::Ide));
    }

    #[test]
    fn test_parse_snapshot_descriptor() {
        let descriptor_data = "# Disk DescriptorFile\nversion=1\nCID=0000beef\nparentCID=0000cafe\ncreateType=\"monolithicSparse\"\nparentFileNameHint=\"base.vmdk\"\n# Extent description\nRW 64 SPARSE \"snap.vmdk\"\n";
        let descriptor: Descriptor = descriptor_data.parse().unwrap();
        assert!(descriptor.header.has_parent());
        assert_eq!(descriptor.header.parent_cid, 0xcafe);
        assert_eq!(descriptor.header.encoding, DescriptorEncoding::Utf8);
        assert_eq!(
            descriptor.header.parent_file_name_hint.as_deref(),
            Some("base.vmdk")
        );
    }

    #[test]
    fn test_parse_rejects_missing_signature() {
        let err = "version=1\nCID=1\nparentCID=ffffffff\n"
            .parse::<Descriptor>()
            .unwrap_err();
        assert!(err.contains("Signature not found"));
        assert!("".parse::<Descriptor>().is_err());
        assert!("# Disk DescriptorFile\nversion=1\n".parse::<Descriptor>().is_err());
    }
}
