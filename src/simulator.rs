//! Software stand-in for an unreachable spectrometer.

use std::thread::sleep;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::{Error, Result};

const BASELINE: f64 = 100.0;
const LINE_AMPLITUDE: f64 = 50.0;

#[derive(Debug, Clone)]
pub struct DummyInstrument {
    channels: usize,
    integration_time: Duration,
    armed_at: Option<Instant>,
}

impl Default for DummyInstrument {
    fn default() -> Self {
        DummyInstrument::with_channels(8192, Duration::from_millis(1000))
    }
}

impl DummyInstrument {
    pub fn with_channels(channels: usize, integration_time: Duration) -> DummyInstrument {
        DummyInstrument { channels, integration_time, armed_at: None }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn is_armed(&self) -> bool {
        self.armed_at.is_some()
    }

    pub fn arm(&mut self) {
        log::debug!("simulated acquisition of {} channels started", self.channels);
        self.armed_at = Some(Instant::now());
    }

    /// Wait out the integration time and return a synthetic spectrum with its timestamp label.
    ///
    /// The spectrum is a flat baseline with one Gaussian line at mid-band and uniform noise.
    pub fn acquire(&mut self) -> Result<(Vec<f64>, String)> {
        let armed_at = self.armed_at.take()
            .ok_or_else(|| Error::precondition("simulated instrument was not armed"))?;
        sleep(self.integration_time.saturating_sub(armed_at.elapsed()));

        let center = self.channels as f64 / 2.0;
        let width = (self.channels as f64 / 50.0).max(1.0);
        let mut rng = rand::thread_rng();
        let spectrum = (0..self.channels)
            .map(|channel| {
                let offset = (channel as f64 - center) / width;
                BASELINE + LINE_AMPLITUDE * (-0.5 * offset * offset).exp() + rng.gen_range(-1.0..1.0)
            })
            .collect();
        let label = chrono::Local::now().format("%Y%m%d%H%M%S%.6f").to_string();
        Ok((spectrum, label))
    }
}
