use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::block::{BLOCK_LEN, CHANNEL_NAMES, NUM_CHANNELS};
use crate::emitter::{MergedSample, RecordSink};
use crate::spectral::SpectralAccumulator;
use crate::utils::DynError;

const MAGIC: &[u8; 4] = b"ACSR";
const VERSION: u32 = 1;
pub const HEADER_SIZE: usize = 96;
const ROWS_OFFSET: u64 = 32;
const NAMES_OFFSET: usize = 40;
const NAME_LEN: usize = 6;
/// f64 timestamp, 8 x f32 channels, f32 current, f32 gain scale.
pub const ROW_SIZE: usize = 8 + 4 * NUM_CHANNELS + 4 + 4;

fn write_u32_le(buf: &mut [u8], offset: usize, value: u32) {
    if offset + 4 <= buf.len() {
        buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }
}

fn write_i64_le(buf: &mut [u8], offset: usize, value: i64) {
    if offset + 8 <= buf.len() {
        buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }
}

fn write_f64_le(buf: &mut [u8], offset: usize, value: f64) {
    if offset + 8 <= buf.len() {
        buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }
}

fn write_fixed_ascii(buf: &mut [u8], offset: usize, len: usize, value: &str) {
    if offset + len > buf.len() {
        return;
    }
    let dst = &mut buf[offset..offset + len];
    dst.fill(0);
    let src = value.as_bytes();
    let n = src.len().min(len);
    dst[..n].copy_from_slice(&src[..n]);
}

fn le_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

fn le_f32(buf: &[u8], offset: usize) -> f32 {
    f32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

fn le_8(buf: &[u8], offset: usize) -> [u8; 8] {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[offset..offset + 8]);
    b
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MergedHeader {
    pub base_seconds: i64,
    pub sample_interval: f64,
    pub rows: u64,
}

fn build_header(base_seconds: i64, sample_interval: f64) -> [u8; HEADER_SIZE] {
    let mut out = [0u8; HEADER_SIZE];
    out[0..4].copy_from_slice(MAGIC);
    write_u32_le(&mut out, 4, VERSION);
    write_u32_le(&mut out, 8, NUM_CHANNELS as u32);
    write_u32_le(&mut out, 12, BLOCK_LEN as u32);
    write_i64_le(&mut out, 16, base_seconds);
    write_f64_le(&mut out, 24, sample_interval);
    // rows at 32 is patched by finalize
    for (k, name) in CHANNEL_NAMES.iter().enumerate() {
        write_fixed_ascii(&mut out, NAMES_OFFSET + k * NAME_LEN, NAME_LEN, name);
    }
    out
}

pub struct MergedRecordWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    rows_written: u64,
    row: [u8; ROW_SIZE],
}

impl MergedRecordWriter {
    pub fn create(path: &Path, base_seconds: i64, sample_interval: f64) -> Result<Self, DynError> {
        let file = File::create(path)
            .map_err(|e| format!("failed to create {}: {e}", path.display()))?;
        let mut writer = BufWriter::with_capacity(1 << 20, file);
        writer.write_all(&build_header(base_seconds, sample_interval))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer,
            rows_written: 0,
            row: [0u8; ROW_SIZE],
        })
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    pub fn finalize(mut self) -> Result<PathBuf, DynError> {
        self.writer.flush()?;
        {
            let file = self.writer.get_mut();
            file.seek(SeekFrom::Start(ROWS_OFFSET))?;
            file.write_all(&self.rows_written.to_le_bytes())?;
            file.flush()?;
        }
        Ok(self.path)
    }
}

impl RecordSink for MergedRecordWriter {
    fn push(&mut self, sample: &MergedSample) -> Result<(), DynError> {
        let row = &mut self.row;
        write_f64_le(row, 0, sample.timestamp);
        for (c, v) in sample.channels.iter().enumerate() {
            row[8 + 4 * c..12 + 4 * c].copy_from_slice(&v.to_le_bytes());
        }
        let tail = 8 + 4 * NUM_CHANNELS;
        row[tail..tail + 4].copy_from_slice(&sample.current.to_le_bytes());
        row[tail + 4..tail + 8].copy_from_slice(&sample.gain_scale.to_le_bytes());
        self.writer.write_all(row)?;
        self.rows_written += 1;
        Ok(())
    }
}

pub struct MergedRecordReader {
    reader: BufReader<File>,
    header: MergedHeader,
    row: [u8; ROW_SIZE],
}

impl MergedRecordReader {
    pub fn open(path: &Path) -> Result<Self, DynError> {
        let file = File::open(path)
            .map_err(|e| format!("failed to open {}: {e}", path.display()))?;
        let mut reader = BufReader::with_capacity(1 << 20, file);
        let mut head = [0u8; HEADER_SIZE];
        reader.read_exact(&mut head)?;
        if &head[0..4] != MAGIC {
            return Err(format!("{} is not a merged record file", path.display()).into());
        }
        let version = le_u32(&head, 4);
        if version != VERSION {
            return Err(format!("unsupported merged record version {version}").into());
        }
        if le_u32(&head, 8) as usize != NUM_CHANNELS {
            return Err("merged record channel count mismatch".into());
        }
        let header = MergedHeader {
            base_seconds: i64::from_le_bytes(le_8(&head, 16)),
            sample_interval: f64::from_le_bytes(le_8(&head, 24)),
            rows: u64::from_le_bytes(le_8(&head, ROWS_OFFSET as usize)),
        };
        Ok(Self {
            reader,
            header,
            row: [0u8; ROW_SIZE],
        })
    }

    pub fn header(&self) -> &MergedHeader {
        &self.header
    }

    pub fn next_row(&mut self) -> Result<Option<MergedSample>, DynError> {
        match self.reader.read_exact(&mut self.row) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let row = &self.row;
        let mut channels = [0f32; NUM_CHANNELS];
        for (c, v) in channels.iter_mut().enumerate() {
            *v = le_f32(row, 8 + 4 * c);
        }
        let tail = 8 + 4 * NUM_CHANNELS;
        Ok(Some(MergedSample {
            timestamp: f64::from_le_bytes(le_8(row, 0)),
            channels,
            current: le_f32(row, tail),
            gain_scale: le_f32(row, tail + 4),
        }))
    }
}

pub fn write_spectra_table(path: &Path, spectra: &SpectralAccumulator) -> Result<(), DynError> {
    let mut w = BufWriter::new(File::create(path)?);
    write!(w, "# freq_hz")?;
    for name in CHANNEL_NAMES.iter() {
        write!(w, " {name}")?;
    }
    for name in CHANNEL_NAMES.iter() {
        write!(w, " n_{name}")?;
    }
    writeln!(w)?;
    let grid = spectra.grid();
    for k in 0..grid.bins {
        write!(w, "{:.6}", grid.frequency(k))?;
        for c in 0..NUM_CHANNELS {
            write!(w, " {:.9e}", spectra.channel(c).values()[k])?;
        }
        for c in 0..NUM_CHANNELS {
            write!(w, " {}", spectra.channel(c).counts()[k])?;
        }
        writeln!(w)?;
    }
    w.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("ac_serial_{}_{name}", std::process::id()))
    }

    fn row(t: f64, v: f32) -> MergedSample {
        let mut channels = [0f32; NUM_CHANNELS];
        for (c, x) in channels.iter_mut().enumerate() {
            *x = v + c as f32;
        }
        MergedSample {
            timestamp: t,
            channels,
            current: 42.0,
            gain_scale: 1e8,
        }
    }

    #[test]
    fn header_and_rows_survive_a_write_read_cycle() {
        let path = temp_path("merged.acs");
        let mut writer = MergedRecordWriter::create(&path, 1_700_000_000, 6.4e-5).unwrap();
        for k in 0..5 {
            writer.push(&row(k as f64 * 0.5, k as f32)).unwrap();
        }
        assert_eq!(writer.rows_written(), 5);
        writer.finalize().unwrap();

        let len = std::fs::metadata(&path).unwrap().len() as usize;
        assert_eq!(len, HEADER_SIZE + 5 * ROW_SIZE);

        let mut reader = MergedRecordReader::open(&path).unwrap();
        assert_eq!(
            *reader.header(),
            MergedHeader {
                base_seconds: 1_700_000_000,
                sample_interval: 6.4e-5,
                rows: 5
            }
        );
        let mut seen = Vec::new();
        while let Some(r) = reader.next_row().unwrap() {
            seen.push(r);
        }
        assert_eq!(seen.len(), 5);
        assert_eq!(seen[3], row(1.5, 3.0));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn rejects_foreign_files() {
        let path = temp_path("foreign.acs");
        std::fs::write(&path, vec![0u8; HEADER_SIZE]).unwrap();
        assert!(MergedRecordReader::open(&path).is_err());
        std::fs::remove_file(&path).ok();
    }
}
