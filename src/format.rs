//! Firmware file formats
use std::str;
use std::{borrow::Cow, fmt, path::Path};

use anyhow::Result;
use object::{
    Endianness, FileKind,
    elf::{FileHeader32, PT_LOAD},
    read::elf::{FileHeader, ProgramHeader},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FirmwareFormat {
    PlainHex,
    IntelHex,
    SRecord,
    ELF,
    Binary,
}

/// Contiguous block of firmware data.
#[derive(Clone, PartialEq, Eq)]
pub struct Segment {
    pub address: u32,
    pub data: Vec<u8>,
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Segment(0x{:08x}+{})", self.address, self.data.len())
    }
}

impl Segment {
    pub fn end(&self) -> u32 {
        self.address + self.data.len() as u32
    }
}

/// Reads a firmware file. `base` is the load address of formats that carry none.
pub fn read_firmware_from_file<P: AsRef<Path>>(path: P, base: u32) -> Result<Vec<Segment>> {
    let p = path.as_ref();
    let raw = std::fs::read(p)?;
    parse_firmware(p, raw, base)
}

/// Parses file contents read from `path`, whose extension helps to tell the format.
pub fn parse_firmware(p: &Path, raw: Vec<u8>, base: u32) -> Result<Vec<Segment>> {
    anyhow::ensure!(!raw.is_empty(), "{} is empty", p.display());

    let format = guess_format(p, &raw);
    log::info!("Read {} as {:?} format", p.display(), format);
    match format {
        FirmwareFormat::PlainHex => read_hex(str::from_utf8(&raw)?, base),
        FirmwareFormat::IntelHex => read_ihex(str::from_utf8(&raw)?),
        FirmwareFormat::SRecord => read_srec(str::from_utf8(&raw)?),
        FirmwareFormat::ELF => read_elf(&raw),
        FirmwareFormat::Binary => merge_sections(vec![(base, raw.into())]),
    }
}

pub fn guess_format(path: &Path, raw: &[u8]) -> FirmwareFormat {
    let ext = path
        .extension()
        .map(|s| s.to_string_lossy())
        .unwrap_or_default()
        .to_lowercase();
    if ["ihex", "ihe", "h86", "hex", "a43", "a90"].contains(&&*ext) {
        return FirmwareFormat::IntelHex;
    }
    if ["srec", "s19", "s28", "s37", "mot", "sx"].contains(&&*ext) {
        return FirmwareFormat::SRecord;
    }

    if raw.starts_with(&[0x7f, b'E', b'L', b'F']) {
        FirmwareFormat::ELF
    } else if raw.first() == Some(&b':')
        && raw
            .iter()
            .all(|&c| (c as char).is_ascii_hexdigit() || c == b':' || c == b'\n' || c == b'\r')
    {
        FirmwareFormat::IntelHex
    } else if matches!(raw, [b'S' | b's', b'0'..=b'9', ..])
        && raw
            .iter()
            .all(|&c| c.is_ascii_alphanumeric() || c.is_ascii_whitespace())
    {
        FirmwareFormat::SRecord
    } else if raw
        .iter()
        .all(|&c| (c as char).is_ascii_hexdigit() || c.is_ascii_whitespace())
    {
        FirmwareFormat::PlainHex
    } else {
        FirmwareFormat::Binary
    }
}

/// Hex digits, whitespace is ignored.
pub fn read_hex(data: &str, base: u32) -> Result<Vec<Segment>> {
    let digits: String = data.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let binary = hex::decode(digits)?;
    merge_sections(vec![(base, binary.into())])
}

pub fn read_ihex(data: &str) -> Result<Vec<Segment>> {
    use ihex::Record;

    let mut base_address = 0;

    let mut records = vec![];
    for record in ihex::Reader::new(data) {
        let record = record?;
        use Record::*;
        match record {
            Data { offset, value } => {
                let offset = base_address + offset as u32;

                records.push((offset, value.into()));
            }
            EndOfFile => (),
            ExtendedSegmentAddress(address) => {
                base_address = (address as u32) * 16;
            }
            StartSegmentAddress { .. } => (),
            ExtendedLinearAddress(address) => {
                base_address = (address as u32) << 16;
            }
            StartLinearAddress(_) => (),
        };
    }
    merge_sections(records)
}

/// Motorola S-record file, S1/S2/S3 data records.
pub fn read_srec(data: &str) -> Result<Vec<Segment>> {
    use srec::Record;

    let mut records = vec![];
    for record in srec::reader::read_records(data) {
        let record = record.map_err(|e| anyhow::format_err!("invalid S-record: {:?}", e))?;
        match record {
            Record::S1(d) => records.push((u32::from(d.address.0), d.data.into())),
            Record::S2(d) => records.push((d.address.0, d.data.into())),
            Record::S3(d) => records.push((d.address.0, d.data.into())),
            // header, record counts and start addresses
            _ => (),
        }
    }
    merge_sections(records)
}

/// Loadable segments of an ELF32 file at their physical addresses.
pub fn read_elf(elf_data: &[u8]) -> Result<Vec<Segment>> {
    match FileKind::parse(elf_data)? {
        FileKind::Elf32 => (),
        _ => anyhow::bail!("cannot read file as ELF32 format"),
    }
    let elf_header = FileHeader32::<Endianness>::parse(elf_data)?;
    let endian = elf_header.endian()?;

    let mut sections = vec![];
    for segment in elf_header.program_headers(endian, elf_data)? {
        if segment.p_type(endian) != PT_LOAD {
            continue;
        }
        let segment_data = segment
            .data(endian, elf_data)
            .map_err(|_| anyhow::format_err!("Failed to access data for an ELF segment."))?;
        if segment_data.is_empty() {
            continue;
        }
        let p_paddr = segment.p_paddr(endian);
        log::info!(
            "Found loadable segment, physical address: {:#010x}, virtual address: {:#010x}, size: {:#x}",
            p_paddr,
            segment.p_vaddr(endian),
            segment_data.len()
        );
        sections.push((p_paddr, segment_data.into()));
    }

    if sections.is_empty() {
        anyhow::bail!("empty ELF file");
    }
    merge_sections(sections)
}

/// Orders the sections by address and joins adjacent ones.
fn merge_sections(mut sections: Vec<(u32, Cow<[u8]>)>) -> Result<Vec<Segment>> {
    sections.sort_by_key(|(addr, _)| *addr);

    let mut segments: Vec<Segment> = vec![];
    for (addr, data) in sections {
        if data.is_empty() {
            continue;
        }
        anyhow::ensure!(
            addr.checked_add(data.len() as u32).is_some(),
            "section at 0x{:08x} exceeds the address space",
            addr
        );
        match segments.last_mut() {
            Some(last) if last.end() == addr => last.data.extend_from_slice(&data),
            Some(last) if last.end() > addr => {
                anyhow::bail!("overlapping data at 0x{:08x}", addr)
            }
            _ => segments.push(Segment {
                address: addr,
                data: data.into_owned(),
            }),
        }
    }
    anyhow::ensure!(!segments.is_empty(), "no data in firmware file");
    log::debug!("firmware segments: {:?}", segments);
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ihex_records_are_merged() {
        let data = ":020000040800F2\n\
                    :0400000001020304F2\n\
                    :0400040005060708DE\n\
                    :02001000090ADB\n\
                    :00000001FF\n";
        let segments = read_ihex(data).unwrap();
        assert_eq!(
            segments,
            vec![
                Segment {
                    address: 0x0800_0000,
                    data: vec![1, 2, 3, 4, 5, 6, 7, 8]
                },
                Segment {
                    address: 0x0800_0010,
                    data: vec![9, 10]
                },
            ]
        );
    }

    #[test]
    fn srec_records_are_merged() {
        let data = "S00600004844521B\n\
                    S107000001020304EE\n\
                    S107000405060708DA\n\
                    S30708001000090ACD\n\
                    S9030000FC\n";
        let segments = read_srec(data).unwrap();
        assert_eq!(
            segments,
            vec![
                Segment {
                    address: 0x0000_0000,
                    data: vec![1, 2, 3, 4, 5, 6, 7, 8]
                },
                Segment {
                    address: 0x0800_1000,
                    data: vec![9, 10]
                },
            ]
        );
    }

    #[test]
    fn srec_with_bad_checksum_is_rejected() {
        assert!(read_srec("S107000001020304EF\n").is_err());
    }

    #[test]
    fn plain_hex_at_base() {
        let segments = read_hex("0102\r\n0304\n", 0x2000).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].address, 0x2000);
        assert_eq!(segments[0].data, [1, 2, 3, 4]);
        assert_eq!(segments[0].end(), 0x2004);
    }

    #[test]
    fn overlap_is_rejected() {
        let sections = vec![(0x100, Cow::from(&[1u8, 2, 3][..])), (0x102, Cow::from(&[4u8][..]))];
        assert!(merge_sections(sections).is_err());
    }

    #[test]
    fn format_guessing() {
        let p = Path::new("fw.bin");
        assert_eq!(guess_format(p, b"\x7fELF\x01"), FirmwareFormat::ELF);
        assert_eq!(guess_format(p, b":00000001FF\n"), FirmwareFormat::IntelHex);
        assert_eq!(guess_format(p, b"S9030000FC\r\n"), FirmwareFormat::SRecord);
        assert_eq!(guess_format(Path::new("fw.s19"), b""), FirmwareFormat::SRecord);
        assert_eq!(guess_format(p, b"deadbeef\n"), FirmwareFormat::PlainHex);
        assert_eq!(guess_format(p, &[0x00, 0x20, 0x00, 0x20]), FirmwareFormat::Binary);
        assert_eq!(guess_format(Path::new("fw.hex"), b""), FirmwareFormat::IntelHex);
    }
}
