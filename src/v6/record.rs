//! Journal record framing.
//!
//! Every record is written as `Header{sequence, type} + body +
//! Footer{crc32, sequence}`. The CRC covers the header and body bytes
//! only and uses the non-reflected `0x04C11DB7` polynomial seeded with
//! [LOG_CRC_SEED]. Byte vectors inside bodies are length-prefixed with
//! a single `u8`, capping a patch at 255 bytes.
//!
//! Any structural mismatch while loading (short read, unknown tag,
//! checksum or sequence failure) surfaces as [LogCorrupt]; during
//! replay that simply marks the end of the usable log.

use std::fmt::Write as _;
use std::io;

use crc::{Algorithm, Crc};

use super::bufio::{ImageReader, ImageWriter};
use super::layout::{
    Dirent, Superblock, DIRENT_SIZE, INODE_SIZE, INODE_START_SECTOR, LOG_CRC_SEED,
    SECTOR_SIZE,
};

/// A log sequence number. LSNs increase monotonically and wrap.
pub type Lsn = u32;

/// True when LSN `a` is earlier than or equal to `b`, accounting for
/// wrap-around: the live window of LSNs is far smaller than half the
/// sequence space.
pub fn lsn_le(a: Lsn, b: Lsn) -> bool {
    b.wrapping_sub(a) <= u32::MAX / 2
}

/// CRC-32 parameters for log records: non-reflected 0x04C11DB7,
/// seeded, no final xor.
const LOG_CRC: Algorithm<u32> = Algorithm {
    width: 32,
    poly: 0x04c1_1db7,
    init: LOG_CRC_SEED,
    refin: false,
    refout: false,
    xorout: 0,
    check: 0,
    residue: 0,
};

/// Compute the log CRC of `bytes`.
pub fn log_crc(bytes: &[u8]) -> u32 {
    const CRC: Crc<u32> = Crc::<u32>::new(&LOG_CRC);
    CRC.checksum(bytes)
}

#[derive(Debug, thiserror::Error)]
/// A structural error in the log.
pub enum LogCorrupt {
    #[error("premature EOF")]
    /// The log ended inside a record.
    UnexpectedEof,
    #[error("bad checksum")]
    /// The footer CRC did not match the header and body bytes.
    BadChecksum,
    #[error("sequence number mismatch")]
    /// The header and footer sequence numbers disagree.
    SequenceMismatch,
    #[error("invalid record tag {0}")]
    /// The record type tag is not a known variant.
    InvalidTag(u8),
    #[error("invalid log header")]
    /// The on-disk log header failed validation.
    BadHeader,
    #[error("bad sequence number")]
    /// A record's sequence number broke the expected ordering.
    BadSequence,
    #[error("{0}")]
    /// A transaction-level framing violation.
    BadTransaction(&'static str),
}

#[derive(Debug, thiserror::Error)]
/// Failure while loading a record: either the log is corrupt or the
/// underlying image could not be read.
pub enum LogReadError {
    #[error(transparent)]
    /// The log is structurally corrupt.
    Corrupt(#[from] LogCorrupt),
    #[error(transparent)]
    /// The image read failed.
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// The payload of a log record.
pub enum LogRecord {
    /// Opens a transaction.
    Begin,
    /// A byte-granular overwrite inside a single sector.
    Patch {
        /// Sector to patch.
        blockno: u16,
        /// Byte offset of the patch within the sector.
        offset_in_block: u16,
        /// Replacement bytes; never spans a sector boundary.
        bytes: Vec<u8>,
    },
    /// A previously free block is now in use. Metadata blocks are
    /// zeroed when the allocation replays, since their future contents
    /// are fully described by later patches; file data blocks are not.
    BlockAlloc {
        /// The allocated block.
        blockno: u16,
        /// Non-zero for metadata blocks.
        zero_on_replay: u8,
    },
    /// A block transitioned to free.
    BlockFree {
        /// The freed block.
        blockno: u16,
    },
    /// Closes the transaction whose Begin carried `sequence`.
    Commit {
        /// LSN of the matching Begin record.
        sequence: Lsn,
    },
    /// The ring wrapped; the next record is at the start of the log.
    Rewind,
}

impl LogRecord {
    fn tag(&self) -> u8 {
        match self {
            LogRecord::Begin => 0,
            LogRecord::Patch { .. } => 1,
            LogRecord::BlockAlloc { .. } => 2,
            LogRecord::BlockFree { .. } => 3,
            LogRecord::Commit { .. } => 4,
            LogRecord::Rewind => 5,
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            LogRecord::Begin => "LogBegin",
            LogRecord::Patch { .. } => "LogPatch",
            LogRecord::BlockAlloc { .. } => "LogBlockAlloc",
            LogRecord::BlockFree { .. } => "LogBlockFree",
            LogRecord::Commit { .. } => "LogCommit",
            LogRecord::Rewind => "LogRewind",
        }
    }

    fn encode_body(&self, out: &mut Vec<u8>) {
        match self {
            LogRecord::Begin | LogRecord::Rewind => {}
            LogRecord::Patch {
                blockno,
                offset_in_block,
                bytes,
            } => {
                assert!(bytes.len() <= u8::MAX as usize, "patch exceeds 255 bytes");
                out.extend_from_slice(&blockno.to_le_bytes());
                out.extend_from_slice(&offset_in_block.to_le_bytes());
                out.push(bytes.len() as u8);
                out.extend_from_slice(bytes);
            }
            LogRecord::BlockAlloc {
                blockno,
                zero_on_replay,
            } => {
                out.extend_from_slice(&blockno.to_le_bytes());
                out.push(*zero_on_replay);
            }
            LogRecord::BlockFree { blockno } => {
                out.extend_from_slice(&blockno.to_le_bytes());
            }
            LogRecord::Commit { sequence } => {
                out.extend_from_slice(&sequence.to_le_bytes());
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A framed log record with its sequence number.
pub struct LogEntry {
    /// LSN of this record.
    pub sequence: Lsn,
    /// The payload.
    pub record: LogRecord,
}

impl LogEntry {
    /// Build an entry.
    pub fn new(sequence: Lsn, record: LogRecord) -> Self {
        Self { sequence, record }
    }

    /// Number of bytes this entry occupies on disk.
    pub fn nbytes(&self) -> usize {
        let mut body = Vec::new();
        self.record.encode_body(&mut body);
        5 + body.len() + 8
    }

    /// Serialize the entry (header, body, CRC footer) to the writer.
    pub fn save(&self, w: &mut ImageWriter) -> io::Result<()> {
        let mut framed = Vec::with_capacity(32);
        framed.extend_from_slice(&self.sequence.to_le_bytes());
        framed.push(self.record.tag());
        self.record.encode_body(&mut framed);

        let crc = log_crc(&framed);
        framed.extend_from_slice(&crc.to_le_bytes());
        framed.extend_from_slice(&self.sequence.to_le_bytes());
        w.write(&framed)
    }

    /// Deserialize one entry from the reader, validating the CRC and
    /// the duplicated sequence number.
    pub fn load(r: &mut ImageReader) -> Result<Self, LogReadError> {
        let mut header = [0u8; 5];
        read_exact(r, &mut header)?;

        let sequence = u32::from_le_bytes(header[..4].try_into().unwrap());
        let tag = header[4];

        let mut crc_bytes = header.to_vec();
        let record = match tag {
            0 => LogRecord::Begin,
            1 => {
                let mut fixed = [0u8; 5];
                read_exact(r, &mut fixed)?;
                crc_bytes.extend_from_slice(&fixed);
                let blockno = u16::from_le_bytes(fixed[..2].try_into().unwrap());
                let offset_in_block =
                    u16::from_le_bytes(fixed[2..4].try_into().unwrap());
                let mut bytes = vec![0u8; fixed[4] as usize];
                read_exact(r, &mut bytes)?;
                crc_bytes.extend_from_slice(&bytes);
                LogRecord::Patch {
                    blockno,
                    offset_in_block,
                    bytes,
                }
            }
            2 => {
                let mut fixed = [0u8; 3];
                read_exact(r, &mut fixed)?;
                crc_bytes.extend_from_slice(&fixed);
                LogRecord::BlockAlloc {
                    blockno: u16::from_le_bytes(fixed[..2].try_into().unwrap()),
                    zero_on_replay: fixed[2],
                }
            }
            3 => {
                let mut fixed = [0u8; 2];
                read_exact(r, &mut fixed)?;
                crc_bytes.extend_from_slice(&fixed);
                LogRecord::BlockFree {
                    blockno: u16::from_le_bytes(fixed),
                }
            }
            4 => {
                let mut fixed = [0u8; 4];
                read_exact(r, &mut fixed)?;
                crc_bytes.extend_from_slice(&fixed);
                LogRecord::Commit {
                    sequence: u32::from_le_bytes(fixed),
                }
            }
            5 => LogRecord::Rewind,
            other => return Err(LogCorrupt::InvalidTag(other).into()),
        };

        let mut footer = [0u8; 8];
        read_exact(r, &mut footer)?;
        let checksum = u32::from_le_bytes(footer[..4].try_into().unwrap());
        let footer_sequence = u32::from_le_bytes(footer[4..].try_into().unwrap());

        if footer_sequence != sequence {
            return Err(LogCorrupt::SequenceMismatch.into());
        }
        if checksum != log_crc(&crc_bytes) {
            return Err(LogCorrupt::BadChecksum.into());
        }

        Ok(Self { sequence, record })
    }

    /// Render the entry for the log dumper, interpreting patch targets
    /// against the superblock when one is supplied.
    pub fn show(&self, sb: Option<&Superblock>) -> String {
        let mut out = format!("* LSN {}\n  {}\n", self.sequence, self.record.type_name());
        match &self.record {
            LogRecord::Begin | LogRecord::Rewind => {}
            LogRecord::Patch {
                blockno,
                offset_in_block,
                bytes,
            } => {
                let _ = writeln!(out, "    blockno: {blockno}");
                let _ = writeln!(out, "    offset_in_block: {offset_in_block}");
                let _ = writeln!(out, "    bytes: {}", hexdump(bytes));
                if let Some(sb) = sb {
                    let _ = writeln!(
                        out,
                        "  {}",
                        describe_patch(sb, *blockno, *offset_in_block, bytes)
                    );
                }
            }
            LogRecord::BlockAlloc {
                blockno,
                zero_on_replay,
            } => {
                let _ = writeln!(out, "    blockno: {blockno}");
                let _ = writeln!(out, "    zero_on_replay: {zero_on_replay}");
            }
            LogRecord::BlockFree { blockno } => {
                let _ = writeln!(out, "    blockno: {blockno}");
            }
            LogRecord::Commit { sequence } => {
                let _ = writeln!(out, "    sequence: {sequence}");
            }
        }
        out
    }
}

fn read_exact(r: &mut ImageReader, dst: &mut [u8]) -> Result<(), LogReadError> {
    if r.try_read(dst)? {
        Ok(())
    } else {
        Err(LogCorrupt::UnexpectedEof.into())
    }
}

/// Render bytes as lowercase hex.
pub fn hexdump(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

/// Describe what a patch touches: an inode (with the affected fields)
/// or file/directory data.
fn describe_patch(sb: &Superblock, blockno: u16, offset: u16, bytes: &[u8]) -> String {
    if (blockno as u32) >= sb.datastart() {
        describe_data_patch(bytes)
    } else if (blockno as u32) >= INODE_START_SECTOR {
        describe_inode_patch(blockno, offset, bytes)
    } else {
        "superblock/bootblock patch?".to_string()
    }
}

fn describe_data_patch(bytes: &[u8]) -> String {
    if bytes.len() == DIRENT_SIZE {
        let de = Dirent::decode(bytes);
        format!(
            "dirent ({}, \"{}\")",
            de.d_inumber,
            String::from_utf8_lossy(de.name())
        )
    } else if bytes.len() == 2 {
        let blockno = u16::from_le_bytes(bytes.try_into().unwrap());
        format!("block pointer {blockno}")
    } else {
        "unknown data patch".to_string()
    }
}

fn describe_inode_patch(blockno: u16, offset: u16, bytes: &[u8]) -> String {
    const FIELDS: &[(usize, &str)] = &[
        (0, "i_mode"),
        (2, "i_nlink"),
        (3, "i_uid"),
        (4, "i_gid"),
        (5, "i_size0"),
        (6, "i_size1"),
        (8, "i_addr"),
        (24, "i_atime"),
        (28, "i_mtime"),
    ];

    let inum = 1
        + (blockno as u32 - INODE_START_SECTOR) * (SECTOR_SIZE / INODE_SIZE) as u32
        + offset as u32 / INODE_SIZE as u32;
    let start = offset as usize % INODE_SIZE;

    if bytes.len() >= INODE_SIZE {
        return format!("inode #{inum} (whole inode)");
    }

    let end = start + bytes.len();
    let touched: Vec<&str> = FIELDS
        .iter()
        .filter(|(at, _)| {
            let field_end = FIELDS
                .iter()
                .find(|(next, _)| next > at)
                .map(|(next, _)| *next)
                .unwrap_or(INODE_SIZE);
            *at < end && start < field_end
        })
        .map(|(_, name)| *name)
        .collect();
    format!("inode #{inum} ({})", touched.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_image() -> (tempfile::TempDir, std::fs::File) {
        let dir = tempfile::tempdir().unwrap();
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(dir.path().join("img"))
            .unwrap();
        (dir, file)
    }

    fn save_all(file: &std::fs::File, entries: &[LogEntry]) {
        let mut w = ImageWriter::new(file.try_clone().unwrap());
        for entry in entries {
            entry.save(&mut w).unwrap();
        }
        w.flush().unwrap();
    }

    #[test]
    fn test_lsn_comparison_wraps() {
        assert!(lsn_le(1, 2));
        assert!(lsn_le(5, 5));
        assert!(!lsn_le(3, 2));
        assert!(lsn_le(u32::MAX, 0), "comparison must survive wrap");
        assert!(!lsn_le(0, u32::MAX));
    }

    #[test]
    fn test_save_load_round_trip() {
        let (_dir, file) = tmp_image();

        let entries = vec![
            LogEntry::new(7, LogRecord::Begin),
            LogEntry::new(
                8,
                LogRecord::Patch {
                    blockno: 12,
                    offset_in_block: 96,
                    bytes: vec![1, 2, 3, 4, 5],
                },
            ),
            LogEntry::new(
                9,
                LogRecord::BlockAlloc {
                    blockno: 13,
                    zero_on_replay: 1,
                },
            ),
            LogEntry::new(10, LogRecord::BlockFree { blockno: 14 }),
            LogEntry::new(11, LogRecord::Commit { sequence: 7 }),
            LogEntry::new(12, LogRecord::Rewind),
        ];
        save_all(&file, &entries);

        let mut r = ImageReader::new(file);
        for expected in &entries {
            let loaded = LogEntry::load(&mut r).unwrap();
            assert_eq!(&loaded, expected);
        }
        assert!(matches!(
            LogEntry::load(&mut r),
            Err(LogReadError::Corrupt(LogCorrupt::UnexpectedEof))
        ));
    }

    #[test]
    fn test_nbytes_matches_serialized_size() {
        let (_dir, file) = tmp_image();

        let entry = LogEntry::new(
            3,
            LogRecord::Patch {
                blockno: 1,
                offset_in_block: 2,
                bytes: vec![0; 10],
            },
        );
        save_all(&file, std::slice::from_ref(&entry));
        assert_eq!(file.metadata().unwrap().len() as usize, entry.nbytes());

        let rewind = LogEntry::new(4, LogRecord::Rewind);
        assert_eq!(rewind.nbytes(), 13);
    }

    #[test]
    fn test_corrupt_crc_detected() {
        let (_dir, file) = tmp_image();

        let entry = LogEntry::new(5, LogRecord::BlockFree { blockno: 9 });
        save_all(&file, std::slice::from_ref(&entry));

        // Flip one body byte; the footer CRC no longer matches.
        use std::os::unix::fs::FileExt;
        let mut byte = [0u8; 1];
        file.read_at(&mut byte, 5).unwrap();
        byte[0] ^= 0xff;
        file.write_at(&byte, 5).unwrap();

        let mut r = ImageReader::new(file);
        assert!(matches!(
            LogEntry::load(&mut r),
            Err(LogReadError::Corrupt(LogCorrupt::BadChecksum))
        ));
    }

    #[test]
    fn test_mismatched_footer_sequence_detected() {
        let (_dir, file) = tmp_image();

        let entry = LogEntry::new(5, LogRecord::Begin);
        save_all(&file, std::slice::from_ref(&entry));

        // Corrupt the footer's duplicated sequence number.
        use std::os::unix::fs::FileExt;
        file.write_at(&[0xaa], 9).unwrap();

        let mut r = ImageReader::new(file);
        assert!(matches!(
            LogEntry::load(&mut r),
            Err(LogReadError::Corrupt(LogCorrupt::SequenceMismatch))
        ));
    }

    #[test]
    fn test_invalid_tag_detected() {
        let (_dir, file) = tmp_image();

        let entry = LogEntry::new(5, LogRecord::Begin);
        save_all(&file, std::slice::from_ref(&entry));

        use std::os::unix::fs::FileExt;
        file.write_at(&[200], 4).unwrap();

        let mut r = ImageReader::new(file);
        assert!(matches!(
            LogEntry::load(&mut r),
            Err(LogReadError::Corrupt(LogCorrupt::InvalidTag(200)))
        ));
    }

    #[test]
    fn test_show_describes_patches() {
        let mut sb = Superblock::decode(&[0u8; SECTOR_SIZE]);
        sb.s_isize = 4;
        sb.s_fsize = 100;

        let entry = LogEntry::new(
            1,
            LogRecord::Patch {
                blockno: 2,
                offset_in_block: 2,
                bytes: vec![5],
            },
        );
        let shown = entry.show(Some(&sb));
        assert!(shown.contains("LogPatch"));
        assert!(shown.contains("inode #1"));
        assert!(shown.contains("i_nlink"));

        let dirent = Dirent::new(3, "file").unwrap();
        let mut bytes = vec![0u8; DIRENT_SIZE];
        dirent.encode_into(&mut bytes);
        let entry = LogEntry::new(
            2,
            LogRecord::Patch {
                blockno: 50,
                offset_in_block: 0,
                bytes,
            },
        );
        let shown = entry.show(Some(&sb));
        assert!(shown.contains("dirent (3, \"file\")"));
    }
}
