//! PCAP "classic" format writer and tap.
//!
//! Global header: magic `0xA1B2C3D4`, version 2.4, link-type
//! `LINKTYPE_RAW` (101). Every field is written little-endian, matching a
//! writer running on a little-endian host (the common case this format
//! targets; readers detect byte order from the magic number).

use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::limits::{MAX_PCAP_FILE, MAX_PCAP_RECORD};

const MAGIC: u32 = 0xA1B2C3D4;
const VERSION_MAJOR: u16 = 2;
const VERSION_MINOR: u16 = 4;
const LINKTYPE_RAW: u32 = 101;
const GLOBAL_HEADER_LEN: u64 = 24;

pub struct PcapWriter {
    file: File,
}

impl PcapWriter {
    /// Open (creating if necessary) a capture file. When `init` is set the
    /// file is reset to just the global header, matching
    /// `jni_pcap(name, init=true)`.
    pub fn open(path: &Path, init: bool) -> io::Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).create(true).open(path)?;
        if init {
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            write_global_header(&mut file)?;
        } else {
            file.seek(SeekFrom::End(0))?;
        }
        Ok(PcapWriter { file })
    }

    /// Append one packet record, rolling the file back to just the global
    /// header if it would exceed `MAX_PCAP_FILE`.
    pub fn write_record(&mut self, data: &[u8]) -> io::Result<()> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        self.write_record_at(data, now.as_secs() as u32, now.subsec_micros())
    }

    fn write_record_at(&mut self, data: &[u8], ts_sec: u32, ts_usec: u32) -> io::Result<()> {
        let captured_len = data.len().min(MAX_PCAP_RECORD as usize) as u32;
        let mut header = [0u8; 16];
        header[0..4].copy_from_slice(&ts_sec.to_le_bytes());
        header[4..8].copy_from_slice(&ts_usec.to_le_bytes());
        header[8..12].copy_from_slice(&captured_len.to_le_bytes());
        header[12..16].copy_from_slice(&(data.len() as u32).to_le_bytes());

        self.file.write_all(&header)?;
        self.file.write_all(&data[..captured_len as usize])?;
        self.file.flush()?;

        if self.file.stream_position()? > MAX_PCAP_FILE {
            self.file.set_len(GLOBAL_HEADER_LEN)?;
            self.file.seek(SeekFrom::Start(GLOBAL_HEADER_LEN))?;
        }
        Ok(())
    }
}

fn write_global_header(file: &mut File) -> io::Result<()> {
    let mut header = [0u8; 24];
    header[0..4].copy_from_slice(&MAGIC.to_le_bytes());
    header[4..6].copy_from_slice(&VERSION_MAJOR.to_le_bytes());
    header[6..8].copy_from_slice(&VERSION_MINOR.to_le_bytes());
    // thiszone, sigfigs: 0
    header[16..20].copy_from_slice(&MAX_PCAP_RECORD.to_le_bytes());
    header[20..24].copy_from_slice(&LINKTYPE_RAW.to_le_bytes());
    file.write_all(&header)?;
    file.flush()
}
