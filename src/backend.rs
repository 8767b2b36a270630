//! Lifecycle contract shared by all acquisition backends.

use std::path::PathBuf;

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Uninitialized,
    Initialized,
    /// An acquisition has been triggered and its result not yet collected.
    Armed,
}

/// What `init` ended up talking to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Link {
    /// The hardware accepted the configuration handshake.
    Real,
    /// The hardware was unreachable; a [`crate::DummyInstrument`] serves all further calls.
    Simulated,
}

/// The lifecycle every backend follows: `init`, then any number of `run`/`get_data` pairs,
/// then `close`. At most one acquisition is outstanding at a time.
pub trait Backend {
    fn name(&self) -> &str;

    fn state(&self) -> ConnectionState;

    /// Connect and configure the instrument.
    ///
    /// Unreachable hardware is not an error: the backend falls back to a simulated instrument
    /// and reports this through the returned [`Link`].
    fn init(&mut self) -> Result<Link>;

    /// Trigger one acquisition.
    fn run(&mut self) -> Result<()>;

    /// Wait for the triggered acquisition and store it into buffer `index`.
    fn get_data(&mut self, index: usize) -> Result<&[f64]>;

    /// Persist all buffers under `basename` followed by a backend-chosen filename.
    fn save_data(&mut self, basename: &str, binary: bool) -> Result<PathBuf>;

    fn close(&mut self) -> Result<()>;
}

/// A fixed number of spectrum slots, addressed by caller-chosen index.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferSet {
    slots: Vec<Vec<f64>>,
}

impl BufferSet {
    pub fn new(count: usize, channels: usize) -> BufferSet {
        BufferSet { slots: vec![vec![0.0; channels]; count] }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn check_index(&self, index: usize) -> Result<()> {
        if index < self.slots.len() {
            Ok(())
        } else {
            Err(Error::precondition(format!(
                "buffer index {} out of range 0..{}", index, self.slots.len())))
        }
    }

    pub fn get(&self, index: usize) -> Result<&[f64]> {
        self.check_index(index)?;
        Ok(&self.slots[index])
    }

    /// Replace the contents of a slot. The new vector may differ in length from the old one.
    pub fn replace(&mut self, index: usize, data: Vec<f64>) -> Result<&[f64]> {
        self.check_index(index)?;
        self.slots[index] = data;
        Ok(&self.slots[index])
    }

    pub fn as_slice(&self) -> &[Vec<f64>] {
        &self.slots
    }
}
