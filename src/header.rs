//! Binary framing of the FFT spectrometer data stream.
//!
//! Every spectrum is preceded by a fixed 64-byte header in the native byte order of the
//! spectrometer host. The payload that follows is a flat array of `f32` samples, one per
//! channel of every enabled sub-band.

use bytemuck::{Pod, Zeroable};

use crate::{Error, Result};

pub const HEADER_LEN: usize = 64;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct Header {
    pub tag: [u8; 4],
    pub backend: [u8; 4],
    /// Length of the whole frame, header included.
    pub total_len: u32,
    pub integration: [u8; 8],
    /// Acquisition time as ASCII, padded with spaces or NULs.
    pub timestamp: [u8; 28],
    pub words: [u32; 4],
}

const _: () = assert!(std::mem::size_of::<Header>() == HEADER_LEN);

impl Header {
    pub fn decode(bytes: &[u8; HEADER_LEN]) -> Header {
        bytemuck::pod_read_unaligned(bytes)
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        bytemuck::cast(*self)
    }

    /// Number of payload bytes following the header, or 0 if the frame is header-only.
    pub fn payload_len(&self) -> usize {
        (self.total_len as usize).saturating_sub(HEADER_LEN)
    }

    pub fn label(&self) -> String {
        String::from_utf8_lossy(&self.timestamp)
            .trim_matches(|c: char| c == '\0' || c.is_whitespace())
            .to_owned()
    }

    pub fn decode_payload(&self, bytes: &[u8]) -> Result<Vec<f32>> {
        if bytes.len() != self.payload_len() {
            return Err(Error::protocol(format!(
                "payload is {} bytes, header declares {}", bytes.len(), self.payload_len())))
        }
        if bytes.len() % 4 != 0 {
            return Err(Error::protocol(format!(
                "payload length {} is not a whole number of samples", bytes.len())))
        }
        Ok(bytemuck::pod_collect_to_vec(bytes))
    }
}

#[cfg(test)]
pub(crate) fn frame(timestamp: &str, samples: &[f32]) -> Vec<u8> {
    let mut header = Header::zeroed();
    header.tag.copy_from_slice(b"FFTS");
    header.backend.copy_from_slice(b"AFFT");
    header.total_len = (HEADER_LEN + samples.len() * 4) as u32;
    header.timestamp[..timestamp.len()].copy_from_slice(timestamp.as_bytes());
    let mut frame = header.encode().to_vec();
    frame.extend_from_slice(bytemuck::cast_slice(samples));
    frame
}
