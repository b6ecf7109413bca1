use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::block::{BlockSource, ChannelBlock, BLOCK_LEN, CHANNEL_TREES, NUM_CHANNELS};
use crate::utils::{advise_file_sequential, DynError};

const SECONDS_OFFSET: usize = 0;
const NANOSECONDS_OFFSET: usize = 8;
const SAMPLES_OFFSET: usize = 16;
const CURRENT_OFFSET: usize = SAMPLES_OFFSET + BLOCK_LEN * 4;
const GAIN_OFFSET: usize = CURRENT_OFFSET + 4;
/// Packed little-endian record: i64 sec, i64 nsec, f32 x 8192, f32 current, i16 gain.
pub const RECORD_BYTES: usize = GAIN_OFFSET + 2;

pub fn tree_file_name(tree: &str) -> String {
    format!("{}.raw", tree.replace(':', "_"))
}

pub fn resolve_data_dir_paths(dir: &Path) -> Result<Vec<PathBuf>, DynError> {
    let mut out = Vec::with_capacity(NUM_CHANNELS);
    for tree in CHANNEL_TREES.iter() {
        let path = dir.join(tree_file_name(tree));
        if !path.is_file() {
            return Err(format!("channel {} not found at {}", tree, path.display()).into());
        }
        out.push(path);
    }
    Ok(out)
}

fn read_i64_le(buf: &[u8], offset: usize) -> i64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[offset..offset + 8]);
    i64::from_le_bytes(b)
}

fn read_f32_le(buf: &[u8], offset: usize) -> f32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[offset..offset + 4]);
    f32::from_le_bytes(b)
}

fn decode_record(buf: &[u8]) -> Result<ChannelBlock, DynError> {
    if buf.len() != RECORD_BYTES {
        return Err(format!("record must be {RECORD_BYTES} bytes, got {}", buf.len()).into());
    }
    let samples = buf[SAMPLES_OFFSET..CURRENT_OFFSET]
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    ChannelBlock::new(
        read_i64_le(buf, SECONDS_OFFSET),
        read_i64_le(buf, NANOSECONDS_OFFSET),
        samples,
        read_f32_le(buf, CURRENT_OFFSET),
        i16::from_le_bytes([buf[GAIN_OFFSET], buf[GAIN_OFFSET + 1]]),
    )
}

#[cfg(test)]
pub fn encode_record(block: &ChannelBlock) -> Vec<u8> {
    let mut out = Vec::with_capacity(RECORD_BYTES);
    out.extend_from_slice(&block.seconds.to_le_bytes());
    out.extend_from_slice(&block.nanoseconds.to_le_bytes());
    for x in block.samples() {
        out.extend_from_slice(&x.to_le_bytes());
    }
    out.extend_from_slice(&block.current.to_le_bytes());
    out.extend_from_slice(&block.gain.to_le_bytes());
    out
}

pub struct RawChannelFile {
    path: PathBuf,
    reader: BufReader<File>,
    blocks: usize,
    buffer: Vec<u8>,
    cached: Option<(usize, ChannelBlock)>,
    // Reader offset after the last good read; `None` after a failed one.
    position: Option<u64>,
}

impl RawChannelFile {
    pub fn open(path: &Path) -> Result<Self, DynError> {
        let file = File::open(path)
            .map_err(|e| format!("failed to open {}: {e}", path.display()))?;
        advise_file_sequential(&file);
        let len = file.metadata()?.len() as usize;
        let blocks = len / RECORD_BYTES;
        if len % RECORD_BYTES != 0 {
            debug!(
                "[input] {}: ignoring {} trailing bytes",
                path.display(),
                len % RECORD_BYTES
            );
        }
        Ok(Self {
            path: path.to_path_buf(),
            reader: BufReader::with_capacity(RECORD_BYTES * 4, file),
            blocks,
            buffer: vec![0u8; RECORD_BYTES],
            cached: None,
            position: Some(0),
        })
    }

    pub fn len(&self) -> usize {
        self.blocks
    }

    pub fn read(&mut self, index: usize) -> Result<ChannelBlock, DynError> {
        if let Some((cached_index, block)) = &self.cached {
            if *cached_index == index {
                return Ok(block.clone());
            }
        }
        if index >= self.blocks {
            return Err(format!(
                "block {index} out of range for {} ({} blocks)",
                self.path.display(),
                self.blocks
            )
            .into());
        }
        let target = (index * RECORD_BYTES) as u64;
        // seek_relative keeps the buffer when the target is already loaded.
        match self.position.take() {
            Some(pos) if pos == target => {}
            Some(pos) => self.reader.seek_relative(target as i64 - pos as i64)?,
            None => {
                self.reader.seek(SeekFrom::Start(target))?;
            }
        }
        self.reader.read_exact(&mut self.buffer)?;
        self.position = Some(target + RECORD_BYTES as u64);
        let block = decode_record(&self.buffer)?;
        self.cached = Some((index, block.clone()));
        Ok(block)
    }
}

pub struct RawBlockSource {
    channels: Vec<RawChannelFile>,
}

impl RawBlockSource {
    pub fn open(paths: &[PathBuf]) -> Result<Self, DynError> {
        if paths.len() != NUM_CHANNELS {
            return Err(format!(
                "expected {NUM_CHANNELS} channel inputs, got {}",
                paths.len()
            )
            .into());
        }
        let channels = paths
            .iter()
            .map(|p| RawChannelFile::open(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { channels })
    }
}

impl BlockSource for RawBlockSource {
    fn channel_len(&self, channel: usize) -> usize {
        self.channels.get(channel).map_or(0, RawChannelFile::len)
    }

    fn read_block(&mut self, channel: usize, index: usize) -> Result<ChannelBlock, DynError> {
        self.channels
            .get_mut(channel)
            .ok_or_else(|| DynError::from(format!("no channel {channel}")))?
            .read(index)
    }
}
