//! Wire-level configuration of the backends, fixed at construction.

use std::time::Duration;

use crate::{Error, Result};

/// Longest integration the FFT spectrometer firmware accepts.
pub const MAX_INTEGRATION_TIME: Duration = Duration::from_millis(5000);

#[derive(Debug, Clone, PartialEq)]
pub struct SpectrometerConfiguration {
    pub name: String,
    pub host: String,
    /// Port of the TCP data stream carrying headers and spectra.
    pub tcp_port: u16,
    /// Port of the UDP command channel.
    pub udp_port: u16,
    /// Channel count of each sub-band, in band order.
    pub channels: Vec<usize>,
    /// Must be a whole number of milliseconds, at most [`MAX_INTEGRATION_TIME`].
    pub integration_time: Duration,
    pub blank_time: Duration,
    pub buffer_count: usize,
    /// Delay after each configuration command.
    pub command_settle: Duration,
    /// Delay after `configure`, which reprograms the FPGA.
    pub configure_settle: Duration,
    /// Delay after `calADC` while the ADCs calibrate.
    pub calibration_settle: Duration,
}

impl Default for SpectrometerConfiguration {
    fn default() -> Self {
        Self {
            name: "AFFTS".to_owned(),
            host: "localhost".to_owned(),
            tcp_port: 25144,
            udp_port: 16210,
            channels: vec![8192, 8192],
            integration_time: Duration::from_millis(1000),
            blank_time: Duration::from_millis(1),
            buffer_count: 4,
            command_settle: Duration::from_millis(100),
            configure_settle: Duration::from_millis(300),
            calibration_settle: Duration::from_secs(3),
        }
    }
}

impl SpectrometerConfiguration {
    pub fn validate(&self) -> Result<()> {
        if self.integration_time > MAX_INTEGRATION_TIME {
            return Err(Error::Configuration(format!(
                "integration time {:?} exceeds the maximum of {:?}",
                self.integration_time, MAX_INTEGRATION_TIME)))
        }
        if self.integration_time.as_micros() % 1000 != 0 {
            return Err(Error::Configuration(format!(
                "integration time {:?} is not a whole number of milliseconds",
                self.integration_time)))
        }
        if self.channels.is_empty() {
            return Err(Error::Configuration("at least one sub-band is required".to_owned()))
        }
        if self.buffer_count == 0 {
            return Err(Error::Configuration("at least one data buffer is required".to_owned()))
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstrumentConfiguration {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub channels: usize,
    pub integration_time: Duration,
    pub buffer_count: usize,
    /// Bound on each blocking command reply; `None` waits forever.
    pub reply_timeout: Option<Duration>,
}

impl Default for InstrumentConfiguration {
    fn default() -> Self {
        Self {
            name: "rcts104".to_owned(),
            host: "sofia4".to_owned(),
            port: 1788,
            channels: 7504,
            integration_time: Duration::from_millis(1000),
            buffer_count: 4,
            reply_timeout: Some(Duration::from_secs(10)),
        }
    }
}

impl InstrumentConfiguration {
    pub fn validate(&self) -> Result<()> {
        if self.integration_time.is_zero() {
            return Err(Error::Configuration("integration time must be positive".to_owned()))
        }
        if self.buffer_count == 0 {
            return Err(Error::Configuration("at least one data buffer is required".to_owned()))
        }
        if self.reply_timeout.is_some_and(|timeout| timeout.is_zero()) {
            return Err(Error::Configuration("reply timeout must be positive".to_owned()))
        }
        Ok(())
    }
}
