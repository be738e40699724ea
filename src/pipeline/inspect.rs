//! Disk image sniffing
//!
//! Recognises container formats by their magic numbers and pulls out the
//! handful of header fields the pipeline cares about: virtual size, backing
//! file (snapshot chains), and the partition table of raw images.

use crate::collaborators::{GuestFacts, PartitionTable};
use crate::DiskFormat;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

const HEADER_LEN: usize = 4096;
const SECTOR: u64 = 512;

const QCOW2_MAGIC: &[u8] = b"QFI\xfb";
const VMDK_SPARSE_MAGIC: &[u8] = b"KDMV";
const VMDK_DESCRIPTOR_MAGIC: &[u8] = b"# Disk DescriptorFile";
const VHDX_MAGIC: &[u8] = b"vhdxfile";
const VHD_COOKIE: &[u8] = b"conectix";
const VDI_SIGNATURE: u32 = 0xbeda_107f;
const VDI_SIGNATURE_OFFSET: usize = 0x40;
const VDI_DISK_SIZE_OFFSET: usize = 0x170;
const VHD_DIFFERENCING: u32 = 4;

/// Longest backing-file name accepted from a qcow2 header
const MAX_BACKING_NAME: u32 = 1023;
/// Largest embedded VMDK descriptor read
const MAX_DESCRIPTOR: u64 = 64 * 1024;

fn be_u32(buf: &[u8], offset: usize) -> Option<u32> {
    buf.get(offset..offset + 4)?
        .try_into()
        .ok()
        .map(u32::from_be_bytes)
}

fn be_u64(buf: &[u8], offset: usize) -> Option<u64> {
    buf.get(offset..offset + 8)?
        .try_into()
        .ok()
        .map(u64::from_be_bytes)
}

fn le_u32(buf: &[u8], offset: usize) -> Option<u32> {
    buf.get(offset..offset + 4)?
        .try_into()
        .ok()
        .map(u32::from_le_bytes)
}

fn le_u64(buf: &[u8], offset: usize) -> Option<u64> {
    buf.get(offset..offset + 8)?
        .try_into()
        .ok()
        .map(u64::from_le_bytes)
}

fn read_at(file: &mut File, offset: u64, len: usize) -> io::Result<Vec<u8>> {
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = Vec::with_capacity(len);
    file.by_ref().take(len as u64).read_to_end(&mut buf)?;
    Ok(buf)
}

/// Detect the container format of the image at `path`
pub fn sniff_format(path: &Path) -> io::Result<DiskFormat> {
    inspect_image(path).map(|facts| facts.format)
}

/// Gather [`GuestFacts`] from an image's headers
///
/// Anything without a recognised magic number is a raw image.
pub fn inspect_image(path: &Path) -> io::Result<GuestFacts> {
    let mut file = File::open(path)?;
    let file_size = file.metadata()?.len();
    let header = read_at(&mut file, 0, HEADER_LEN)?;

    let mut facts = GuestFacts {
        image_path: path.to_path_buf(),
        format: DiskFormat::Raw,
        file_size_bytes: file_size,
        virtual_size_bytes: None,
        backing_file: None,
        partition_table: None,
    };

    if header.starts_with(QCOW2_MAGIC) {
        inspect_qcow2(&mut file, &header, &mut facts)?;
    } else if header.starts_with(VMDK_SPARSE_MAGIC) {
        inspect_vmdk_sparse(&mut file, &header, &mut facts)?;
    } else if header.starts_with(VMDK_DESCRIPTOR_MAGIC) {
        facts.format = DiskFormat::Vmdk;
        apply_vmdk_descriptor(&String::from_utf8_lossy(&header), &mut facts);
    } else if header.starts_with(VHDX_MAGIC) {
        facts.format = DiskFormat::Vhdx;
    } else if le_u32(&header, VDI_SIGNATURE_OFFSET) == Some(VDI_SIGNATURE) {
        facts.format = DiskFormat::Vdi;
        facts.virtual_size_bytes = le_u64(&header, VDI_DISK_SIZE_OFFSET);
    } else if header.starts_with(VHD_COOKIE) {
        // Dynamic and differencing disks keep a copy of the footer up front
        inspect_vhd(&mut file, &header, &mut facts)?;
    } else if let Some(footer) = vhd_footer(&mut file, file_size)? {
        inspect_vhd(&mut file, &footer, &mut facts)?;
    } else {
        facts.virtual_size_bytes = Some(file_size);
        facts.partition_table = partition_table(&header);
    }

    Ok(facts)
}

fn inspect_qcow2(file: &mut File, header: &[u8], facts: &mut GuestFacts) -> io::Result<()> {
    facts.format = DiskFormat::Qcow2;
    facts.virtual_size_bytes = be_u64(header, 24);

    let backing_offset = be_u64(header, 8).unwrap_or(0);
    let backing_len = be_u32(header, 16).unwrap_or(0);
    if backing_offset > 0 && backing_len > 0 && backing_len <= MAX_BACKING_NAME {
        let name = read_at(file, backing_offset, backing_len as usize)?;
        let name = String::from_utf8_lossy(&name).trim().to_string();
        if !name.is_empty() {
            facts.backing_file = Some(name);
        }
    }
    Ok(())
}

fn inspect_vmdk_sparse(file: &mut File, header: &[u8], facts: &mut GuestFacts) -> io::Result<()> {
    facts.format = DiskFormat::Vmdk;
    facts.virtual_size_bytes = le_u64(header, 12).and_then(|sectors| sectors.checked_mul(SECTOR));

    // Header fields are in sectors; values that overflow as bytes mean a corrupt header
    let desc_offset = le_u64(header, 28)
        .and_then(|sectors| sectors.checked_mul(SECTOR))
        .unwrap_or(0);
    let desc_len = le_u64(header, 36)
        .and_then(|sectors| sectors.checked_mul(SECTOR))
        .unwrap_or(0);
    if desc_offset > 0 && desc_len > 0 && desc_len <= MAX_DESCRIPTOR {
        let descriptor = read_at(file, desc_offset, desc_len as usize)?;
        let text = String::from_utf8_lossy(&descriptor);
        let capacity = facts.virtual_size_bytes;
        apply_vmdk_descriptor(&text, facts);
        // The sparse header is authoritative for capacity
        if capacity.is_some() {
            facts.virtual_size_bytes = capacity;
        }
    }
    Ok(())
}

/// Pull the parent hint and extent sizes out of a VMDK text descriptor
fn apply_vmdk_descriptor(text: &str, facts: &mut GuestFacts) {
    let mut sectors = Some(0u64);
    for line in text.lines().map(str::trim) {
        if let Some(value) = line.strip_prefix("parentFileNameHint") {
            let value = value.trim_start_matches([' ', '=']).trim().trim_matches('"');
            if !value.is_empty() {
                facts.backing_file = Some(value.to_string());
            }
            continue;
        }
        let mut fields = line.split_whitespace();
        if matches!(fields.next(), Some("RW" | "RDONLY" | "NOACCESS")) {
            if let Some(n) = fields.next().and_then(|n| n.parse::<u64>().ok()) {
                sectors = sectors.and_then(|total| total.checked_add(n));
            }
        }
    }
    if let Some(bytes) = sectors
        .filter(|&total| total > 0)
        .and_then(|total| total.checked_mul(SECTOR))
    {
        facts.virtual_size_bytes = Some(bytes);
    }
}

fn vhd_footer(file: &mut File, file_size: u64) -> io::Result<Option<Vec<u8>>> {
    if file_size < SECTOR {
        return Ok(None);
    }
    let footer = read_at(file, file_size - SECTOR, SECTOR as usize)?;
    Ok(footer.starts_with(VHD_COOKIE).then_some(footer))
}

fn inspect_vhd(file: &mut File, footer: &[u8], facts: &mut GuestFacts) -> io::Result<()> {
    facts.format = DiskFormat::Vhd;
    facts.virtual_size_bytes = be_u64(footer, 48);

    if be_u32(footer, 60) == Some(VHD_DIFFERENCING) {
        let dynamic_offset = be_u64(footer, 16).unwrap_or(u64::MAX);
        if dynamic_offset < facts.file_size_bytes {
            // Parent unicode name: 512 bytes of UTF-16BE at offset 64 of the dynamic header
            let raw = read_at(file, dynamic_offset + 64, 512)?;
            let units: Vec<u16> = raw
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .take_while(|&unit| unit != 0)
                .collect();
            let name = String::from_utf16_lossy(&units);
            facts.backing_file = Some(if name.is_empty() {
                "differencing parent".to_string()
            } else {
                name
            });
        }
    }
    Ok(())
}

fn partition_table(header: &[u8]) -> Option<PartitionTable> {
    if header.get(512..520) == Some(b"EFI PART".as_slice()) {
        Some(PartitionTable::Gpt)
    } else if header.get(510..512) == Some([0x55, 0xaa].as_slice()) {
        Some(PartitionTable::Mbr)
    } else {
        None
    }
}
