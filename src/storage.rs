//! Persistence of buffer sets.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
    /// Bit-exact `bincode` encoding of the vectors.
    #[default]
    Binary,
    /// One space-delimited row of decimal values per vector.
    Text,
}

impl Format {
    pub fn from_binary(binary: bool) -> Format {
        if binary { Format::Binary } else { Format::Text }
    }
}

pub trait DataSink {
    fn save(&self, path: &Path, vectors: &[Vec<f64>], format: Format) -> Result<()>;
}

/// Writes buffer sets to the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileStore;

impl DataSink for FileStore {
    fn save(&self, path: &Path, vectors: &[Vec<f64>], format: Format) -> Result<()> {
        log::debug!("saving {} vectors to {} ({:?})", vectors.len(), path.display(), format);
        let mut writer = BufWriter::new(File::create(path)?);
        match format {
            Format::Binary => {
                bincode::serialize_into(&mut writer, vectors)?;
            }
            Format::Text => {
                let mut writer = csv::WriterBuilder::new()
                    .delimiter(b' ')
                    .has_headers(false)
                    .flexible(true)
                    .from_writer(&mut writer);
                for vector in vectors {
                    writer.write_record(vector.iter().map(|value| format!("{:.18e}", value)))?;
                }
                writer.flush()?;
            }
        }
        writer.flush()?;
        Ok(())
    }
}

/// Read back a file written by [`FileStore`].
pub fn load(path: &Path, format: Format) -> Result<Vec<Vec<f64>>> {
    let reader = BufReader::new(File::open(path)?);
    match format {
        Format::Binary => Ok(bincode::deserialize_from(reader)?),
        Format::Text => {
            let mut reader = csv::ReaderBuilder::new()
                .delimiter(b' ')
                .has_headers(false)
                .flexible(true)
                .from_reader(reader);
            let mut vectors = Vec::new();
            for record in reader.records() {
                let vector = record?.iter()
                    .filter(|field| !field.is_empty())
                    .map(|field| field.parse::<f64>().map_err(|error|
                        Error::protocol(format!("bad value {:?} in {}: {}", field, path.display(), error))))
                    .collect::<Result<Vec<f64>>>()?;
                vectors.push(vector);
            }
            Ok(vectors)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample() -> Vec<Vec<f64>> {
        vec![
            vec![0.1, 0.2, 0.3],
            vec![-1.0e-12, 6.02214076e23, f64::MIN_POSITIVE],
            vec![1.0, 2.0],
            vec![],
        ]
    }

    #[test]
    fn test_binary_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spectra");
        FileStore.save(&path, &sample(), Format::Binary).unwrap();
        let loaded = load(&path, Format::Binary).unwrap();
        assert_eq!(loaded.len(), 4);
        for (loaded, expected) in loaded.iter().zip(sample()) {
            let loaded: Vec<u64> = loaded.iter().map(|v| v.to_bits()).collect();
            let expected: Vec<u64> = expected.iter().map(|v| v.to_bits()).collect();
            assert_eq!(loaded, expected);
        }
    }

    #[test]
    fn test_text_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spectra.txt");
        let vectors = &sample()[..3];
        FileStore.save(&path, vectors, Format::Text).unwrap();
        let loaded = load(&path, Format::Text).unwrap();
        assert_eq!(loaded.len(), 3);
        for (loaded, expected) in loaded.iter().zip(vectors) {
            assert_eq!(loaded.len(), expected.len());
            for (a, b) in loaded.iter().zip(expected) {
                assert!((a - b).abs() <= b.abs() * 1e-15, "{} != {}", a, b);
            }
        }
    }

    #[test]
    fn test_text_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spectra.txt");
        FileStore.save(&path, &[vec![1.0, 0.5]], Format::Text).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "1.000000000000000000e0 5.000000000000000000e-1\n");
    }

    #[test]
    fn test_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("spectra");
        assert!(matches!(FileStore.save(&path, &sample(), Format::Binary), Err(Error::Io(_))));
    }
}
