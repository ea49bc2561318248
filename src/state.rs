//! Persisted State Module
//!
//! The little-endian, versioned state stream a plugin host stores and
//! restores around sessions. Version 0 streams end after the preload
//! size; loaders substitute defaults for the tuning fields.

use crate::config;

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

/// Newest state layout version written by `store`.
pub const CURRENT_STATE_VERSION: u64 = 1;

/// State (de)serialization failures.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("state stream i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state version {0} is newer than this engine supports")]
    UnsupportedVersion(u64),

    #[error("state stream holds invalid text")]
    InvalidString,
}

/// Everything the host persists about an engine instance.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedState {
    pub sfz_file_path: String,
    pub volume: f32,
    pub num_voices: i32,
    pub oversampling_log2: i32,
    pub preload_size: i32,

    // Version 1 fields
    pub scala_file_path: String,
    pub scala_root_key: i32,
    pub tuning_frequency: f32,
    pub stretched_tuning: f32,
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            sfz_file_path: String::new(),
            volume: 0.0,
            num_voices: config::DEFAULT_NUM_VOICES as i32,
            oversampling_log2: 0,
            preload_size: config::DEFAULT_PRELOAD_SIZE as i32,
            scala_file_path: String::new(),
            scala_root_key: 60,
            tuning_frequency: 440.0,
            stretched_tuning: 0.0,
        }
    }
}

impl PersistedState {
    /// Writes the current-version layout.
    pub fn store(&self, writer: &mut impl Write) -> Result<(), StateError> {
        writer.write_u64::<LittleEndian>(CURRENT_STATE_VERSION)?;
        write_string(writer, &self.sfz_file_path)?;
        writer.write_f32::<LittleEndian>(self.volume)?;
        writer.write_i32::<LittleEndian>(self.num_voices)?;
        writer.write_i32::<LittleEndian>(self.oversampling_log2)?;
        writer.write_i32::<LittleEndian>(self.preload_size)?;
        write_string(writer, &self.scala_file_path)?;
        writer.write_i32::<LittleEndian>(self.scala_root_key)?;
        writer.write_f32::<LittleEndian>(self.tuning_frequency)?;
        writer.write_f32::<LittleEndian>(self.stretched_tuning)?;
        Ok(())
    }

    /// Reads any supported layout version.
    pub fn load(reader: &mut impl Read) -> Result<Self, StateError> {
        let version = reader.read_u64::<LittleEndian>()?;
        if version > CURRENT_STATE_VERSION {
            return Err(StateError::UnsupportedVersion(version));
        }

        let mut state = Self {
            sfz_file_path: read_string(reader)?,
            volume: reader.read_f32::<LittleEndian>()?,
            num_voices: reader.read_i32::<LittleEndian>()?,
            oversampling_log2: reader.read_i32::<LittleEndian>()?,
            preload_size: reader.read_i32::<LittleEndian>()?,
            ..Self::default()
        };

        if version >= 1 {
            state.scala_file_path = read_string(reader)?;
            state.scala_root_key = reader.read_i32::<LittleEndian>()?;
            state.tuning_frequency = reader.read_f32::<LittleEndian>()?;
            state.stretched_tuning = reader.read_f32::<LittleEndian>()?;
        }

        Ok(state)
    }
}

fn write_string(writer: &mut impl Write, text: &str) -> Result<(), StateError> {
    writer.write_u32::<LittleEndian>(text.len() as u32)?;
    writer.write_all(text.as_bytes())?;
    Ok(())
}

fn read_string(reader: &mut impl Read) -> Result<String, StateError> {
    let length = reader.read_u32::<LittleEndian>()? as usize;
    let mut bytes = vec![0u8; length];
    reader.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|_| StateError::InvalidString)
}
