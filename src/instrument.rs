//! Client for the CTS instrument controller.
//!
//! The controller speaks a line-oriented text protocol over a single TCP connection. On
//! connect it greets with `connected to <host> on <stream>`; every configuration command is
//! answered with a single reply. After `cts run` the controller stays silent for roughly one
//! integration time and then sends a reply containing `read {`, the raw per-channel counts as
//! a brace-delimited list, and the number of accumulation `cycles`.

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use regex::bytes::Regex;

use crate::{Error, Result};
use crate::backend::{Backend, BufferSet, ConnectionState, Link};
use crate::config::InstrumentConfiguration;
use crate::simulator::DummyInstrument;
use crate::storage::{DataSink, FileStore, Format};

/// Largest reply accepted to a greeting or a configuration command.
const REPLY_LEN: usize = 1024;
const DATA_CHUNK_LEN: usize = 65536;
const DATA_MARKER: &[u8] = b"read {";

static GREETING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?-u)connected to (.+?) on (.+)$").unwrap());
static COUNTS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([0-9\s]+)\}").unwrap());
static CYCLES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"cycles\s+([0-9]+)").unwrap());

fn parse_greeting(greeting: &[u8]) -> Result<(String, String)> {
    let captures = GREETING.captures(greeting.trim_ascii_end())
        .ok_or_else(|| Error::protocol(format!(
            "unexpected greeting {:?}", String::from_utf8_lossy(greeting))))?;
    let hostname = String::from_utf8_lossy(&captures[1]).into_owned();
    let stream = String::from_utf8_lossy(&captures[2]).into_owned();
    Ok((hostname, stream))
}

/// Extract the spectrum from a data reply: raw counts divided by the number of cycles.
pub fn parse_reply(reply: &[u8]) -> Result<Vec<f64>> {
    let counts = COUNTS.captures(reply)
        .ok_or_else(|| Error::protocol("no channel counts in reply"))?;
    let cycles = CYCLES.captures_iter(reply).last()
        .ok_or_else(|| Error::protocol("no cycle count in reply"))?;
    let cycles = parse_integer(&cycles[1])?;
    if cycles == 0 {
        return Err(Error::protocol("reply reports zero cycles"))
    }
    counts[1]
        .split(|byte| byte.is_ascii_whitespace())
        .filter(|count| !count.is_empty())
        .map(|count| -> Result<f64> { Ok(parse_integer(count)? as f64 / cycles as f64) })
        .collect()
}

fn parse_integer(digits: &[u8]) -> Result<u64> {
    std::str::from_utf8(digits).ok()
        .and_then(|digits| digits.parse().ok())
        .ok_or_else(|| Error::protocol(format!(
            "bad integer {:?} in reply", String::from_utf8_lossy(digits))))
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}

/// Send one command and return the single read that answers it.
fn exchange(stream: &mut TcpStream, timeout: Option<Duration>, command: &str) -> Result<Vec<u8>> {
    log::debug!("exchange({:?})", command);
    stream.set_read_timeout(timeout)?;
    stream.write_all(format!("{}\n", command).as_bytes())?;
    let mut reply = vec![0u8; REPLY_LEN];
    let len = stream.read(&mut reply)?;
    reply.truncate(len);
    log::trace!("exchange() reply = {:?}", String::from_utf8_lossy(&reply));
    Ok(reply)
}

/// Accumulate data until the reply marker arrives or `window` has elapsed.
fn collect_reply(stream: &mut TcpStream, window: Duration) -> Result<Vec<u8>> {
    let started = Instant::now();
    let mut reply = Vec::new();
    let mut chunk = vec![0u8; DATA_CHUNK_LEN];
    while !contains(&reply, DATA_MARKER) {
        let remaining = window.saturating_sub(started.elapsed());
        if remaining.is_zero() { break }
        stream.set_read_timeout(Some(remaining))?;
        match stream.read(&mut chunk) {
            Ok(0) => {
                log::warn!("connection closed while waiting for data");
                break
            }
            Ok(len) => {
                log::trace!("collect_reply() += {} bytes", len);
                reply.extend_from_slice(&chunk[..len]);
            }
            Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
            Err(error) if matches!(error.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => break,
            Err(error) => return Err(error.into()),
        }
    }
    if contains(&reply, DATA_MARKER) {
        Ok(reply)
    } else {
        log::warn!("no data within {:?} ({} bytes received)", window, reply.len());
        Err(Error::Timeout(window))
    }
}

#[derive(Debug)]
enum Transport {
    Real(TcpStream),
    Simulated(DummyInstrument),
}

#[derive(Debug)]
struct Session {
    transport: Transport,
    buffers: BufferSet,
    armed: bool,
    hostname: String,
    stream: String,
}

#[derive(Debug)]
pub struct InstrumentBackend<S: DataSink = FileStore> {
    config: InstrumentConfiguration,
    sink: S,
    session: Option<Session>,
}

impl InstrumentBackend<FileStore> {
    pub fn new(config: InstrumentConfiguration) -> Result<InstrumentBackend<FileStore>> {
        InstrumentBackend::with_sink(config, FileStore)
    }
}

impl<S: DataSink> InstrumentBackend<S> {
    pub fn with_sink(config: InstrumentConfiguration, sink: S) -> Result<InstrumentBackend<S>> {
        config.validate()?;
        Ok(InstrumentBackend { config, sink, session: None })
    }

    pub fn config(&self) -> &InstrumentConfiguration {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn state(&self) -> ConnectionState {
        match &self.session {
            None => ConnectionState::Uninitialized,
            Some(session) if session.armed => ConnectionState::Armed,
            Some(_) => ConnectionState::Initialized,
        }
    }

    /// Host name the controller announced in its greeting.
    pub fn hostname(&self) -> Option<&str> {
        self.session.as_ref().map(|session| session.hostname.as_str())
    }

    /// Data stream the controller announced in its greeting.
    pub fn stream(&self) -> Option<&str> {
        self.session.as_ref().map(|session| session.stream.as_str())
    }

    pub fn buffers(&self) -> Option<&[Vec<f64>]> {
        self.session.as_ref().map(|session| session.buffers.as_slice())
    }

    pub fn data(&self, index: usize) -> Result<&[f64]> {
        let session = self.session.as_ref()
            .ok_or_else(|| Error::precondition("no data exists for an uninitialized CTS"))?;
        session.buffers.get(index)
    }

    fn connect(&self) -> Result<(TcpStream, String, String)> {
        let addr = (self.config.host.as_str(), self.config.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound,
                format!("cannot resolve {}", self.config.host)))?;
        log::debug!("connecting to {} at {}", self.config.name, addr);
        let mut stream = TcpStream::connect(addr)?;
        stream.set_read_timeout(self.config.reply_timeout)?;

        let mut greeting = vec![0u8; REPLY_LEN];
        let len = stream.read(&mut greeting)?;
        greeting.truncate(len);
        if greeting.is_empty() {
            return Err(Error::protocol(format!(
                "no greeting from {}:{}", self.config.host, self.config.port)))
        }
        let (hostname, data_stream) = parse_greeting(&greeting)?;
        log::debug!("greeted by {} on {}", hostname, data_stream);

        let timeout = self.config.reply_timeout;
        exchange(&mut stream, timeout, &format!("cts config datafile {}", data_stream))?;
        exchange(&mut stream, timeout, "cts init time 1.0")?;
        exchange(&mut stream, timeout,
            &format!("cts init time {:.4}", self.config.integration_time.as_secs_f64()))?;
        Ok((stream, hostname, data_stream))
    }

    /// Connect to the controller and configure the integration time.
    ///
    /// Any failure along the way, including a malformed greeting, makes the backend fall back
    /// to a simulated instrument; this is reported as `Link::Simulated`.
    pub fn init(&mut self) -> Result<Link> {
        if self.session.is_some() {
            return Err(Error::precondition("cannot init an initialized CTS"))
        }

        let buffers = BufferSet::new(self.config.buffer_count, self.config.channels);
        let session = match self.connect() {
            Ok((stream, hostname, data_stream)) => Session {
                transport: Transport::Real(stream),
                buffers,
                armed: false,
                hostname,
                stream: data_stream,
            },
            Err(error) => {
                log::warn!("cannot connect to {} at {}:{}: {}; using a simulated spectrometer",
                    self.config.name, self.config.host, self.config.port, error);
                let dummy = DummyInstrument::with_channels(
                    self.config.channels, self.config.integration_time);
                Session {
                    transport: Transport::Simulated(dummy),
                    buffers,
                    armed: false,
                    hostname: self.config.host.clone(),
                    stream: String::new(),
                }
            }
        };
        let link = match session.transport {
            Transport::Real(_) => Link::Real,
            Transport::Simulated(_) => Link::Simulated,
        };
        self.session = Some(session);
        log::info!("{} initialized ({:?})", self.config.name, link);
        Ok(link)
    }

    /// Send a raw command and return the controller's reply.
    pub fn send_cmd(&mut self, command: &str) -> Result<Vec<u8>> {
        let session = self.session.as_mut()
            .ok_or_else(|| Error::precondition("must first initialize the CTS"))?;
        if session.armed {
            return Err(Error::precondition("cannot send commands while an acquisition is running"))
        }
        match &mut session.transport {
            Transport::Real(stream) =>
                exchange(stream, self.config.reply_timeout, command),
            Transport::Simulated(_) =>
                Err(Error::precondition("a simulated CTS does not accept raw commands")),
        }
    }

    pub fn run(&mut self) -> Result<()> {
        let session = self.session.as_mut()
            .ok_or_else(|| Error::precondition("must first initialize the CTS"))?;
        if session.armed {
            return Err(Error::precondition("cannot run again before collecting data with get_data"))
        }
        match &mut session.transport {
            Transport::Real(stream) => {
                log::debug!("run()");
                stream.write_all(b"cts run\n")?;
            }
            Transport::Simulated(dummy) =>
                dummy.arm(),
        }
        session.armed = true;
        Ok(())
    }

    /// Wait up to twice the integration time for the spectrum and store it into buffer `index`.
    pub fn get_data(&mut self, index: usize) -> Result<&[f64]> {
        let session = self.session.as_mut()
            .ok_or_else(|| Error::precondition("must first initialize the CTS"))?;
        session.buffers.check_index(index)?;
        if !session.armed {
            return Err(Error::precondition("cannot download without first running the CTS"))
        }

        let window = self.config.integration_time * 2;
        let result = match &mut session.transport {
            Transport::Real(stream) =>
                collect_reply(stream, window).and_then(|reply| parse_reply(&reply)),
            Transport::Simulated(dummy) =>
                dummy.acquire().map(|(spectrum, _label)| spectrum),
        };
        session.armed = false;
        session.buffers.replace(index, result?)
    }

    /// Write all buffers to `basename` followed by `file`, or by the controller host name and
    /// the current time if no file name is given. Returns the file name used.
    pub fn save_data(&mut self, basename: &str, file: Option<&str>, binary: bool) -> Result<String> {
        let session = self.session.as_ref()
            .ok_or_else(|| Error::precondition("no data exists for an uninitialized CTS"))?;
        let filename = match file {
            Some(file) => file.to_owned(),
            None => format!("{}{}",
                session.hostname, chrono::Local::now().format("-%Y%m%d%H%M%S-%6f")),
        };
        let path = PathBuf::from(format!("{}{}", basename, filename));
        self.sink.save(&path, session.buffers.as_slice(), Format::from_binary(binary))?;
        log::info!("saved {} spectra to {}", session.buffers.len(), path.display());
        Ok(filename)
    }

    pub fn close(&mut self) -> Result<()> {
        let session = self.session.take()
            .ok_or_else(|| Error::precondition("cannot close an uninitialized CTS"))?;
        log::info!("closing {}", self.config.name);
        drop(session);
        Ok(())
    }
}

impl<S: DataSink> Backend for InstrumentBackend<S> {
    fn name(&self) -> &str {
        InstrumentBackend::name(self)
    }

    fn state(&self) -> ConnectionState {
        InstrumentBackend::state(self)
    }

    fn init(&mut self) -> Result<Link> {
        InstrumentBackend::init(self)
    }

    fn run(&mut self) -> Result<()> {
        InstrumentBackend::run(self)
    }

    fn get_data(&mut self, index: usize) -> Result<&[f64]> {
        InstrumentBackend::get_data(self, index)
    }

    fn save_data(&mut self, basename: &str, binary: bool) -> Result<PathBuf> {
        let filename = InstrumentBackend::save_data(self, basename, None, binary)?;
        Ok(PathBuf::from(format!("{}{}", basename, filename)))
    }

    fn close(&mut self) -> Result<()> {
        InstrumentBackend::close(self)
    }
}
