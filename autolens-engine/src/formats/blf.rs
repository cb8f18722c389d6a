//! BLF (Binary Log Format) reader and writer
//!
//! Only the uncompressed subset is handled: a 144-byte statistics block
//! followed by `LOBJ` records of type 1 (CAN message) and 86 (CAN-FD
//! message). Everything is little-endian.
//!
//! ## Statistics block
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0  | 4  | `BLF\0` |
//! | 4  | 4  | statistics size (144) |
//! | 8  | 4  | API version |
//! | 12 | 4  | object count (patched on finish) |
//! | 16 | 4  | objects read (patched on finish) |
//! | 24 | 8  | measurement start tick |
//! | 32 | 8  | last object tick (patched on finish) |
//! | 40 | 16 | SYSTEMTIME start |
//! | 56 | 16 | SYSTEMTIME end (patched on finish) |
//!
//! ## Known Limitations
//! - Error and remote frames have no representation here and are skipped
//!   by the writer.
//! - Compressed log containers (type 10) and other object types are skipped
//!   by the reader.

use crate::dlc::dlc_to_length;
use crate::formats::LogFileParser;
use crate::types::{CanFrame, EngineError, Result, MAX_DATA_LEN, MAX_EXTENDED_ID};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use chrono::{DateTime, Datelike, Local, Timelike};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

pub const FILE_SIGNATURE: &[u8; 4] = b"BLF\0";
pub const OBJECT_SIGNATURE: &[u8; 4] = b"LOBJ";
pub const STATISTICS_SIZE: u32 = 144;
pub const API_VERSION: u32 = 0x0403;
pub const OBJECT_HEADER_SIZE: u16 = 24;

pub const OBJ_CAN_MESSAGE: u32 = 1;
pub const OBJ_CAN_FD_MESSAGE: u32 = 86;

const CAN_MESSAGE_PAYLOAD: u32 = 16;
const CAN_FD_MESSAGE_PAYLOAD: u32 = 76;

const OFFSET_OBJECT_COUNT: u64 = 12;
const OFFSET_LAST_TICK: u64 = 32;
const OFFSET_END_TIME: u64 = 56;

const FLAG_BRS: u8 = 0x01;
const FLAG_ESI: u8 = 0x02;
const FLAG_EXTENDED: u8 = 0x04;
const FLAG_TX: u8 = 0x10;

/// Streaming BLF writer
///
/// The statistics block is written up front with zero counts and patched
/// by [`BlfWriter::finish`].
pub struct BlfWriter<W: Write + Seek> {
    out: W,
    objects: u32,
    last_tick: u64,
}

impl<W: Write + Seek> BlfWriter<W> {
    pub fn new(mut out: W, started: DateTime<Local>) -> std::io::Result<Self> {
        out.write_all(FILE_SIGNATURE)?;
        out.write_u32::<LittleEndian>(STATISTICS_SIZE)?;
        out.write_u32::<LittleEndian>(API_VERSION)?;
        out.write_u32::<LittleEndian>(0)?; // object count
        out.write_u32::<LittleEndian>(0)?; // objects read
        out.write_u32::<LittleEndian>(0)?;
        out.write_u64::<LittleEndian>(0)?; // measurement start tick
        out.write_u64::<LittleEndian>(0)?; // last object tick
        write_system_time(&mut out, &started)?;
        write_system_time(&mut out, &started)?;
        out.write_all(&[0u8; 72])?;
        Ok(Self {
            out,
            objects: 0,
            last_tick: 0,
        })
    }

    /// Append one frame; returns false for frames BLF cannot carry
    pub fn write_frame(&mut self, frame: &CanFrame) -> std::io::Result<bool> {
        if frame.is_error_frame || frame.is_remote_frame {
            return Ok(false);
        }

        let tick = frame.timestamp_ns / 10;
        let mut flags = 0u8;
        if frame.is_extended {
            flags |= FLAG_EXTENDED;
        }
        if frame.is_tx_echo {
            flags |= FLAG_TX;
        }

        if frame.is_fd {
            if frame.brs {
                flags |= FLAG_BRS;
            }
            if frame.esi {
                flags |= FLAG_ESI;
            }
            self.write_object_header(OBJ_CAN_FD_MESSAGE, CAN_FD_MESSAGE_PAYLOAD, tick)?;
            self.out.write_u32::<LittleEndian>(frame.id)?;
            self.out.write_u16::<LittleEndian>(frame.channel as u16)?;
            self.out.write_u8(frame.dlc)?;
            self.out.write_u8(flags)?;
            self.out.write_u32::<LittleEndian>(0)?;
            let mut data = [0u8; MAX_DATA_LEN];
            let len = frame.data_len();
            data[..len].copy_from_slice(frame.payload());
            self.out.write_all(&data)?;
        } else {
            self.write_object_header(OBJ_CAN_MESSAGE, CAN_MESSAGE_PAYLOAD, tick)?;
            self.out.write_u32::<LittleEndian>(frame.id)?;
            self.out.write_u16::<LittleEndian>(frame.channel as u16)?;
            self.out.write_u8(frame.dlc)?;
            self.out.write_u8(flags)?;
            let mut data = [0u8; 8];
            let len = frame.data_len();
            data[..len].copy_from_slice(frame.payload());
            self.out.write_all(&data)?;
        }

        self.objects += 1;
        self.last_tick = tick;
        Ok(true)
    }

    fn write_object_header(&mut self, object_type: u32, payload: u32, tick: u64) -> std::io::Result<()> {
        self.out.write_all(OBJECT_SIGNATURE)?;
        self.out.write_u16::<LittleEndian>(OBJECT_HEADER_SIZE)?;
        self.out.write_u16::<LittleEndian>(1)?;
        self.out.write_u32::<LittleEndian>(OBJECT_HEADER_SIZE as u32 + payload)?;
        self.out.write_u32::<LittleEndian>(object_type)?;
        self.out.write_u64::<LittleEndian>(tick)
    }

    /// Patch the statistics block; returns the object count and the sink
    pub fn finish(mut self, ended: DateTime<Local>) -> std::io::Result<(u32, W)> {
        self.out.seek(SeekFrom::Start(OFFSET_OBJECT_COUNT))?;
        self.out.write_u32::<LittleEndian>(self.objects)?;
        self.out.write_u32::<LittleEndian>(self.objects)?;

        self.out.seek(SeekFrom::Start(OFFSET_LAST_TICK))?;
        self.out.write_u64::<LittleEndian>(self.last_tick)?;

        self.out.seek(SeekFrom::Start(OFFSET_END_TIME))?;
        write_system_time(&mut self.out, &ended)?;

        self.out.seek(SeekFrom::End(0))?;
        self.out.flush()?;
        Ok((self.objects, self.out))
    }
}

/// Windows SYSTEMTIME: eight u16, day of week with Sunday = 0
fn write_system_time<W: Write>(out: &mut W, time: &DateTime<Local>) -> std::io::Result<()> {
    let millis = (time.nanosecond() / 1_000_000).min(999);
    for field in [
        time.year() as u16,
        time.month() as u16,
        time.weekday().num_days_from_sunday() as u16,
        time.day() as u16,
        time.hour() as u16,
        time.minute() as u16,
        time.second() as u16,
        millis as u16,
    ] {
        out.write_u16::<LittleEndian>(field)?;
    }
    Ok(())
}

/// Write `frames` to a BLF file; returns the number of objects written
pub fn write_blf_file(path: &Path, frames: &[CanFrame]) -> Result<usize> {
    let write = || -> std::io::Result<u32> {
        let file = File::create(path)?;
        let mut writer = BlfWriter::new(BufWriter::new(file), Local::now())?;
        for frame in frames {
            writer.write_frame(frame)?;
        }
        let (count, _) = writer.finish(Local::now())?;
        Ok(count)
    };
    let written = write().map_err(|e| EngineError::write(path.display(), e.to_string()))?;
    if (written as usize) < frames.len() {
        log::debug!(
            "BLF: {} error/remote frames not written",
            frames.len() - written as usize
        );
    }
    log::info!("Wrote {} objects to BLF file {:?}", written, path);
    Ok(written as usize)
}

/// BLF file parser
pub struct BlfParser;

impl BlfParser {
    /// Parse a BLF file and return an iterator over CAN frames
    ///
    /// Validates the file signature and statistics block before returning.
    pub fn parse(path: &Path) -> Result<BlfFrameIterator<BufReader<File>>> {
        log::info!("Parsing BLF file: {:?}", path);

        if !path.exists() {
            return Err(EngineError::FileNotFound(path.display().to_string()));
        }
        let file = File::open(path)?;
        BlfFrameIterator::new(BufReader::new(file), path.display().to_string())
    }
}

/// Iterator over CAN frames from a BLF stream
pub struct BlfFrameIterator<R: Read + Seek> {
    reader: R,
    source: String,
    position: u64,
    length: u64,
    skipped: usize,
    done: bool,
}

impl<R: Read + Seek> BlfFrameIterator<R> {
    /// Validate the statistics block and position on the first object
    pub fn new(mut reader: R, source: String) -> Result<Self> {
        let length = reader.seek(SeekFrom::End(0))?;
        reader.seek(SeekFrom::Start(0))?;

        let mut signature = [0u8; 4];
        if length < 12 || reader.read_exact(&mut signature).is_err() || &signature != FILE_SIGNATURE {
            return Err(EngineError::parse(&source, "Invalid BLF header"));
        }
        let statistics_size = reader.read_u32::<LittleEndian>()?;
        let api_version = reader.read_u32::<LittleEndian>()?;
        if statistics_size <= 24 || statistics_size as u64 > length {
            return Err(EngineError::parse(
                &source,
                format!("Invalid BLF statistics block size ({})", statistics_size),
            ));
        }
        reader.seek(SeekFrom::Start(statistics_size as u64))?;
        log::debug!("BLF API version 0x{:04X}, {} bytes", api_version, length);

        Ok(Self {
            reader,
            source,
            position: statistics_size as u64,
            length,
            skipped: 0,
            done: false,
        })
    }

    /// Objects of unhandled types seen so far
    pub fn skipped_objects(&self) -> usize {
        self.skipped
    }

    fn corrupt(&mut self, what: &str, offset: u64) -> Option<Result<CanFrame>> {
        self.done = true;
        Some(Err(EngineError::parse(
            &self.source,
            format!("{} at offset {}", what, offset),
        )))
    }

    fn read_object(&mut self) -> Option<Result<CanFrame>> {
        loop {
            if self.done || self.position + OBJECT_HEADER_SIZE as u64 > self.length {
                return None;
            }
            let start = self.position;
            match self.read_header() {
                Ok(header) => {
                    if &header.signature != OBJECT_SIGNATURE {
                        return self.corrupt("Unexpected BLF object signature", start);
                    }
                    if header.header_size < OBJECT_HEADER_SIZE {
                        return self.corrupt("Corrupted BLF object header", start);
                    }
                    if header.object_size < header.header_size as u32 {
                        return self.corrupt("Invalid BLF object size", start);
                    }
                    let end = start + header.object_size as u64;
                    if end > self.length {
                        return self.corrupt("Truncated BLF object", start);
                    }

                    let payload_start = start + header.header_size as u64;
                    let payload = header.object_size - header.header_size as u32;
                    let frame = match header.object_type {
                        OBJ_CAN_MESSAGE if payload >= CAN_MESSAGE_PAYLOAD => {
                            Some(self.read_can_message(payload_start, header.tick))
                        }
                        OBJ_CAN_FD_MESSAGE if payload >= CAN_FD_MESSAGE_PAYLOAD => {
                            Some(self.read_can_fd_message(payload_start, header.tick))
                        }
                        other => {
                            log::trace!("BLF: skipping object type {} at offset {}", other, start);
                            self.skipped += 1;
                            None
                        }
                    };

                    self.position = end;
                    if let Err(e) = self.reader.seek(SeekFrom::Start(end)) {
                        self.done = true;
                        return Some(Err(e.into()));
                    }
                    match frame {
                        Some(Ok(frame)) => return Some(Ok(frame)),
                        Some(Err(e)) => {
                            self.done = true;
                            return Some(Err(EngineError::parse(
                                &self.source,
                                format!("Corrupted CAN object at offset {}: {}", start, e),
                            )));
                        }
                        None => continue,
                    }
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e.into()));
                }
            }
        }
    }

    fn read_header(&mut self) -> std::io::Result<ObjectHeader> {
        let mut signature = [0u8; 4];
        self.reader.read_exact(&mut signature)?;
        Ok(ObjectHeader {
            signature,
            header_size: self.reader.read_u16::<LittleEndian>()?,
            _version: self.reader.read_u16::<LittleEndian>()?,
            object_size: self.reader.read_u32::<LittleEndian>()?,
            object_type: self.reader.read_u32::<LittleEndian>()?,
            tick: self.reader.read_u64::<LittleEndian>()?,
        })
    }

    fn read_can_message(&mut self, at: u64, tick: u64) -> std::io::Result<CanFrame> {
        self.reader.seek(SeekFrom::Start(at))?;
        let id = self.reader.read_u32::<LittleEndian>()?;
        let channel = self.reader.read_u16::<LittleEndian>()?;
        let dlc = self.reader.read_u8()?.min(8);
        let flags = self.reader.read_u8()?;
        let mut data = [0u8; 8];
        self.reader.read_exact(&mut data)?;

        let mut frame = base_frame(id, channel, flags, tick);
        frame.dlc = dlc;
        let len = dlc_to_length(dlc);
        frame.data[..len].copy_from_slice(&data[..len]);
        Ok(frame)
    }

    fn read_can_fd_message(&mut self, at: u64, tick: u64) -> std::io::Result<CanFrame> {
        self.reader.seek(SeekFrom::Start(at))?;
        let id = self.reader.read_u32::<LittleEndian>()?;
        let channel = self.reader.read_u16::<LittleEndian>()?;
        let dlc = self.reader.read_u8()?.min(15);
        let flags = self.reader.read_u8()?;
        let _reserved = self.reader.read_u32::<LittleEndian>()?;
        let mut data = [0u8; MAX_DATA_LEN];
        self.reader.read_exact(&mut data)?;

        let mut frame = base_frame(id, channel, flags, tick);
        frame.is_fd = true;
        frame.brs = flags & FLAG_BRS != 0;
        frame.esi = flags & FLAG_ESI != 0;
        frame.dlc = dlc;
        let len = dlc_to_length(dlc);
        frame.data[..len].copy_from_slice(&data[..len]);
        Ok(frame)
    }
}

fn base_frame(id: u32, channel: u16, flags: u8, tick: u64) -> CanFrame {
    CanFrame {
        id: id & MAX_EXTENDED_ID,
        is_extended: flags & FLAG_EXTENDED != 0,
        is_tx_echo: flags & FLAG_TX != 0,
        channel: channel.clamp(1, 255) as u8,
        timestamp_ns: tick * 10,
        ..CanFrame::default()
    }
}

struct ObjectHeader {
    signature: [u8; 4],
    header_size: u16,
    _version: u16,
    object_size: u32,
    object_type: u32,
    tick: u64,
}

impl<R: Read + Seek> Iterator for BlfFrameIterator<R> {
    type Item = Result<CanFrame>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.read_object();
        if item.is_none() && self.skipped > 0 && !self.done {
            self.done = true;
            log::debug!("BLF: skipped {} objects of unhandled types", self.skipped);
        }
        item
    }
}

impl LogFileParser for BlfFrameIterator<BufReader<File>> {
    fn parse(path: &Path) -> Result<Self> {
        BlfParser::parse(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn write_to_vec(frames: &[CanFrame]) -> Vec<u8> {
        let mut writer = BlfWriter::new(Cursor::new(Vec::new()), Local::now()).unwrap();
        for frame in frames {
            writer.write_frame(frame).unwrap();
        }
        writer.finish(Local::now()).unwrap().1.into_inner()
    }

    fn read_from_vec(bytes: Vec<u8>) -> Result<Vec<CanFrame>> {
        BlfFrameIterator::new(Cursor::new(bytes), "test.blf".to_string())?.collect()
    }

    #[test]
    fn test_header_layout_and_back_patch() {
        let frames: Vec<CanFrame> = [(0x100, 10_000), (0x200, 20_000), (0x300, 30_000)]
            .iter()
            .map(|&(id, ts)| CanFrame::classic(id, &[1, 2, 3]).at(ts))
            .collect();
        let bytes = write_to_vec(&frames);

        assert_eq!(&bytes[0..4], b"BLF\0");
        assert_eq!(u32::from_le_bytes(bytes[4..8].try_into().unwrap()), 144);
        assert_eq!(u32::from_le_bytes(bytes[8..12].try_into().unwrap()), 0x0403);
        assert_eq!(u32::from_le_bytes(bytes[12..16].try_into().unwrap()), 3);
        assert_eq!(u32::from_le_bytes(bytes[16..20].try_into().unwrap()), 3);
        assert_eq!(u64::from_le_bytes(bytes[32..40].try_into().unwrap()), 3000);
        assert_eq!(&bytes[144..148], b"LOBJ");
        assert_eq!(bytes.len(), 144 + 3 * 40);
    }

    #[test]
    fn test_fd_flags_survive() {
        let mut fd = CanFrame::fd(0x18DB33F1, &[0x5A; 24], true).on_channel(3).at(1_230);
        fd.esi = true;
        fd.is_tx_echo = true;
        let classic = CanFrame::classic(0x0C4, &[0xA0, 0x0F]).at(2_000);

        let read = read_from_vec(write_to_vec(&[fd, classic])).unwrap();
        assert_eq!(read.len(), 2);
        assert_eq!(read[0], fd);
        assert_eq!(read[1], classic);
    }

    #[test]
    fn test_error_and_remote_frames_are_skipped() {
        let mut remote = CanFrame::classic(0x100, &[]);
        remote.is_remote_frame = true;
        let bytes = write_to_vec(&[CanFrame::error_frame(1, 0), remote, CanFrame::classic(0x1, &[1])]);
        assert_eq!(u32::from_le_bytes(bytes[12..16].try_into().unwrap()), 1);
        assert_eq!(read_from_vec(bytes).unwrap().len(), 1);
    }

    #[test]
    fn test_rejects_bad_signature_and_statistics_size() {
        let mut bytes = write_to_vec(&[CanFrame::classic(0x1, &[1])]);
        bytes[0] = b'X';
        assert!(read_from_vec(bytes).is_err());

        let mut bytes = write_to_vec(&[CanFrame::classic(0x1, &[1])]);
        bytes[4..8].copy_from_slice(&10_000u32.to_le_bytes());
        let err = read_from_vec(bytes).unwrap_err();
        assert!(err.to_string().contains("statistics block size"));
    }

    #[test]
    fn test_statistics_size_lower_bound_is_exclusive() {
        let with_size = |size: u32| {
            let mut bytes = write_to_vec(&[CanFrame::classic(0x1, &[1])]);
            bytes[4..8].copy_from_slice(&size.to_le_bytes());
            BlfFrameIterator::new(Cursor::new(bytes), "test.blf".to_string())
        };
        let err = with_size(24).err().unwrap();
        assert!(err.to_string().contains("statistics block size (24)"));
        assert!(with_size(25).is_ok());
        assert!(with_size(144).is_ok());
    }

    #[test]
    fn test_rejects_corrupt_objects() {
        let frame = CanFrame::classic(0x1, &[1]);

        let mut bytes = write_to_vec(&[frame]);
        bytes[144..148].copy_from_slice(b"XOBJ");
        assert!(read_from_vec(bytes).unwrap_err().to_string().contains("signature"));

        let mut bytes = write_to_vec(&[frame]);
        bytes[148..150].copy_from_slice(&8u16.to_le_bytes());
        assert!(read_from_vec(bytes).is_err());

        let mut bytes = write_to_vec(&[frame]);
        bytes[152..156].copy_from_slice(&100u32.to_le_bytes());
        assert!(read_from_vec(bytes).unwrap_err().to_string().contains("Truncated"));
    }

    #[test]
    fn test_unknown_objects_skipped_and_fields_sanitised() {
        let mut bytes = write_to_vec(&[CanFrame::classic(0x1, &[1]), CanFrame::classic(0x2, &[0xFF; 8])]);
        // first object becomes an unknown type
        bytes[156..160].copy_from_slice(&73u32.to_le_bytes());
        // second object: channel 0, dlc 3 with garbage past it, id with high bits set
        let second = 144 + 40 + 24;
        bytes[second..second + 4].copy_from_slice(&0xE000_0002u32.to_le_bytes());
        bytes[second + 4..second + 6].copy_from_slice(&0u16.to_le_bytes());
        bytes[second + 6] = 3;

        let read = read_from_vec(bytes).unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(read[0].id, 2);
        assert_eq!(read[0].channel, 1);
        assert_eq!(read[0].payload(), &[0xFF, 0xFF, 0xFF]);
        assert_eq!(&read[0].data[3..8], &[0, 0, 0, 0, 0]);
    }
}
