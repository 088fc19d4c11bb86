//! Synthetic VMDK files for unit tests.

use std::{
    fs,
    path::{Path, PathBuf},
};

use super::{
    sparse::{SparseHeader, SPARSE_MAGIC_NUMBER},
    SECTOR_SIZE,
};

const SECTOR: usize = SECTOR_SIZE as usize;

fn sectors_for(bytes: u64) -> u64 {
    bytes.div_ceil(SECTOR_SIZE)
}

/// Header of a sparse extent laid out as: header, grain directory at sector 1, grain tables, grains.
pub fn sample_header(capacity: u64, grain_size: u64, gtes_per_gt: u32) -> SparseHeader {
    let gd_entries = capacity.div_ceil(u64::from(gtes_per_gt) * grain_size);
    let gd_sectors = sectors_for(gd_entries * 4);
    let gt_sectors = sectors_for(u64::from(gtes_per_gt) * 4);
    SparseHeader {
        magic_number: SPARSE_MAGIC_NUMBER,
        version: 1,
        flags: 0x3,
        capacity,
        grain_size,
        descriptor_offset: 0,
        descriptor_size: 0,
        num_gtes_per_gt: gtes_per_gt,
        rgd_offset: 0,
        gd_offset: 1,
        over_head: 1 + gd_sectors + gd_entries * gt_sectors,
        unclean_shutdown: false,
        single_end_line_char: b'\n',
        non_end_line_char: b' ',
        double_end_line_char1: b'\r',
        double_end_line_char2: b'\n',
        compress_algorithm: 0,
    }
}

/// Builder for a sparse extent file with a chosen set of allocated grains.
pub struct SparseFixture {
    header: SparseHeader,
    grains: Vec<Option<Vec<u8>>>,
    descriptor: Option<String>,
}

impl SparseFixture {
    pub fn new(capacity: u64, grain_size: u64, gtes_per_gt: u32) -> Self {
        let header = sample_header(capacity, grain_size, gtes_per_gt);
        let grains = vec![None; header.grain_count() as usize];
        Self {
            header,
            grains,
            descriptor: None,
        }
    }

    pub fn set_grain(&mut self, grain: usize, data: Vec<u8>) -> &mut Self {
        assert_eq!(data.len() as u64, self.header.grain_size_bytes());
        self.grains[grain] = Some(data);
        self
    }

    /// Embeds a descriptor after the last grain, as monolithic sparse files do.
    pub fn embed_descriptor(&mut self, descriptor: &str) -> &mut Self {
        self.descriptor = Some(descriptor.to_string());
        self
    }

    /// Header as written by [`SparseFixture::build`].
    pub fn header(&self) -> SparseHeader {
        let mut header = self.header.clone();
        if let Some(ref descriptor) = self.descriptor {
            header.descriptor_offset = self.data_end_sector();
            header.descriptor_size = sectors_for(descriptor.len() as u64);
        }
        header
    }

    fn data_end_sector(&self) -> u64 {
        let allocated = self.grains.iter().filter(|g| g.is_some()).count() as u64;
        self.header.over_head + allocated * self.header.grain_size
    }

    /// Returns the file image and the expected grain offsets.
    pub fn build(&self) -> (Vec<u8>, Vec<u32>) {
        let header = self.header();
        let gtes = header.num_gtes_per_gt as usize;
        let gd_entries = header.capacity.div_ceil(header.num_gtes_per_gt as u64 * header.grain_size);
        let gd_sectors = sectors_for(gd_entries * 4);
        let gt_sectors = sectors_for(gtes as u64 * 4);

        let mut image = vec![0u8; (header.over_head as usize) * SECTOR];
        image[..SECTOR].copy_from_slice(&header.encode());

        let mut expected = Vec::with_capacity(self.grains.len());
        let mut next_grain_sector = header.over_head;
        for (grain, data) in self.grains.iter().enumerate() {
            let table = grain / gtes;
            let entry = grain % gtes;
            let gt_sector = 1 + gd_sectors + table as u64 * gt_sectors;
            let offset = match data {
                Some(_) => {
                    let sector = next_grain_sector;
                    next_grain_sector += header.grain_size;
                    sector as u32
                }
                None => 0,
            };
            let gt_position = gt_sector as usize * SECTOR + entry * 4;
            image[gt_position..gt_position + 4].copy_from_slice(&offset.to_le_bytes());
            expected.push(offset);
        }
        for table in 0..gd_entries as usize {
            let gt_sector = 1 + gd_sectors + table as u64 * gt_sectors;
            let gd_position = SECTOR + table * 4;
            image[gd_position..gd_position + 4].copy_from_slice(&(gt_sector as u32).to_le_bytes());
        }
        for data in self.grains.iter().flatten() {
            image.extend_from_slice(data);
        }
        if let Some(ref descriptor) = self.descriptor {
            let mut bytes = descriptor.as_bytes().to_vec();
            bytes.resize(header.descriptor_size as usize * SECTOR, 0);
            image.extend_from_slice(&bytes);
        }
        (image, expected)
    }
}

/// Deterministic, non-zero byte pattern.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed) | 1)
        .collect()
}

pub fn write_file(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, data).unwrap();
    path
}

/// Descriptor text for a disk with the given extents lines.
pub fn descriptor_text(
    cid: u32,
    parent_cid: u32,
    create_type: &str,
    parent_hint: Option<&str>,
    extents: &[&str],
) -> String {
    let mut text = String::from("# Disk DescriptorFile\nversion=1\nencoding=\"UTF-8\"\n");
    text.push_str(&format!("CID={:08x}\nparentCID={:08x}\n", cid, parent_cid));
    text.push_str("isNativeSnapshot=\"no\"\n");
    text.push_str(&format!("createType=\"{}\"\n", create_type));
    if let Some(hint) = parent_hint {
        text.push_str(&format!("parentFileNameHint=\"{}\"\n", hint));
    }
    text.push_str("\n# Extent description\n");
    for extent in extents {
        text.push_str(extent);
        text.push('\n');
    }
    text.push_str("\n# The Disk Data Base \n#DDB\n\nddb.adapterType = \"lsilogic\"\n");
    text
}
