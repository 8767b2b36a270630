//! Client for the FFT spectrometer.
//!
//! The spectrometer is configured with space-terminated ASCII commands sent as UDP datagrams,
//! none of which are acknowledged; the only way to give the firmware time to act on a command
//! is to wait before sending the next one. Spectra come back over a separate TCP stream as
//! binary frames (see [`crate::Header`]).

use std::io::{self, Read};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::path::PathBuf;
use std::thread::sleep;
use std::time::Duration;

use crate::{Error, Result};
use crate::backend::{Backend, BufferSet, ConnectionState, Link};
use crate::config::SpectrometerConfiguration;
use crate::header::{Header, HEADER_LEN};
use crate::simulator::DummyInstrument;
use crate::storage::{DataSink, FileStore, Format};

const NAMESPACE: &str = "AFFTS";

/// Frames may exceed the configured channel layout by this factor before being rejected.
const PAYLOAD_SLACK: usize = 2;

fn command(body: &str) -> String {
    format!("{}:{} ", NAMESPACE, body)
}

/// Configuration commands in the order the firmware expects them, each with the delay that
/// must follow it.
fn handshake(config: &SpectrometerConfiguration) -> Vec<(String, Duration)> {
    let settle = config.command_settle;
    let mut commands = vec![
        (command("cmdMode INTERNAL"), settle),
        (command(&format!("cmdSynctime {}", config.integration_time.as_micros())), settle),
        (command(&format!("cmdBlanktime {}", config.blank_time.as_micros())), settle),
    ];
    for (band, channels) in config.channels.iter().enumerate() {
        commands.push((command(&format!("Band{}:cmdNumspecchan {}", band + 1, channels)), settle));
    }
    let sections = vec!["1"; config.channels.len()].join(" ");
    commands.push((command(&format!("cmdUsedsections {}", sections)), settle));
    commands.push((command("configure"), config.configure_settle));
    commands.push((command("calADC"), Duration::ZERO));
    commands
}

#[derive(Debug)]
enum Transport {
    Real {
        stream: TcpStream,
        socket: UdpSocket,
        command_addr: SocketAddr,
    },
    Simulated(DummyInstrument),
}

#[derive(Debug)]
struct Session {
    transport: Transport,
    buffers: BufferSet,
    armed: bool,
}

#[derive(Debug)]
pub struct SpectrometerBackend<S: DataSink = FileStore> {
    config: SpectrometerConfiguration,
    sink: S,
    session: Option<Session>,
    label: String,
}

impl SpectrometerBackend<FileStore> {
    pub fn new(config: SpectrometerConfiguration) -> Result<SpectrometerBackend<FileStore>> {
        SpectrometerBackend::with_sink(config, FileStore)
    }
}

impl<S: DataSink> SpectrometerBackend<S> {
    pub fn with_sink(config: SpectrometerConfiguration, sink: S) -> Result<SpectrometerBackend<S>> {
        config.validate()?;
        Ok(SpectrometerBackend { config, sink, session: None, label: String::new() })
    }

    pub fn config(&self) -> &SpectrometerConfiguration {
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

    /// Label of the most recent spectrum that has not been saved yet.
    pub fn label(&self) -> Option<&str> {
        if self.label.is_empty() { None } else { Some(&self.label) }
    }

    pub fn buffers(&self) -> Option<&[Vec<f64>]> {
        self.session.as_ref().map(|session| session.buffers.as_slice())
    }

    pub fn data(&self, index: usize) -> Result<&[f64]> {
        let session = self.session.as_ref()
            .ok_or_else(|| Error::precondition("no data exists for an uninitialized spectrometer"))?;
        session.buffers.get(index)
    }

    fn connect(&self) -> io::Result<(TcpStream, UdpSocket, SocketAddr)> {
        let data_addr = (self.config.host.as_str(), self.config.tcp_port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound,
                format!("cannot resolve {}", self.config.host)))?;
        log::debug!("connecting to {} data stream at {}", self.config.name, data_addr);
        let stream = TcpStream::connect(data_addr)?;

        let command_addr = SocketAddr::new(data_addr.ip(), self.config.udp_port);
        let local_ip = match command_addr.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let socket = UdpSocket::bind(SocketAddr::new(local_ip, 0))?;
        for (command, settle) in handshake(&self.config) {
            send_command(&socket, command_addr, &command)?;
            sleep(settle);
        }
        Ok((stream, socket, command_addr))
    }

    /// Connect, configure, and calibrate the spectrometer.
    ///
    /// If the spectrometer cannot be reached, a simulated instrument is used instead and
    /// `Link::Simulated` is returned.
    pub fn init(&mut self) -> Result<Link> {
        if self.session.is_some() {
            return Err(Error::precondition("cannot init an initialized spectrometer"))
        }

        let buffers = BufferSet::new(self.config.buffer_count, self.config.channels[0]);
        let (transport, link) = match self.connect() {
            Ok((stream, socket, command_addr)) => {
                // ADC calibration runs in the background after `calADC`
                sleep(self.config.calibration_settle);
                (Transport::Real { stream, socket, command_addr }, Link::Real)
            }
            Err(error) => {
                log::warn!("cannot reach {} at {}: {}; using a simulated spectrometer",
                    self.config.name, self.config.host, error);
                let dummy = DummyInstrument::with_channels(
                    self.config.channels[0], self.config.integration_time);
                (Transport::Simulated(dummy), Link::Simulated)
            }
        };
        self.session = Some(Session { transport, buffers, armed: false });
        log::info!("{} initialized ({:?})", self.config.name, link);
        Ok(link)
    }

    pub fn run(&mut self) -> Result<()> {
        let session = self.session.as_mut()
            .ok_or_else(|| Error::precondition("cannot run an uninitialized spectrometer"))?;
        if session.armed {
            return Err(Error::precondition("cannot run again before collecting data with get_data"))
        }
        match &mut session.transport {
            Transport::Real { socket, command_addr, .. } =>
                send_command(socket, *command_addr, &command("dump 1"))?,
            Transport::Simulated(dummy) =>
                dummy.arm(),
        }
        session.armed = true;
        Ok(())
    }

    /// Block until the triggered spectrum arrives and store it into buffer `index`.
    ///
    /// The buffer takes the length declared by the frame header, which need not match the
    /// configured channel count. A header-only frame leaves the buffer untouched.
    pub fn get_data(&mut self, index: usize) -> Result<&[f64]> {
        let session = self.session.as_mut()
            .ok_or_else(|| Error::precondition("cannot get data from an uninitialized spectrometer"))?;
        session.buffers.check_index(index)?;
        if !session.armed {
            return Err(Error::precondition("cannot get data before running the spectrometer"))
        }

        let result = match &mut session.transport {
            Transport::Real { stream, .. } => read_frame(stream, max_payload_len(&self.config)),
            Transport::Simulated(dummy) => dummy.acquire().map(Some),
        };
        session.armed = false;
        match result? {
            Some((spectrum, label)) => {
                self.label = label;
                session.buffers.replace(index, spectrum)
            }
            None => session.buffers.get(index),
        }
    }

    /// Write all buffers to `basename` followed by the label of the last spectrum.
    ///
    /// The label is consumed, so saving again requires another `get_data` first.
    pub fn save_data(&mut self, basename: &str, binary: bool) -> Result<PathBuf> {
        let session = self.session.as_ref()
            .ok_or_else(|| Error::precondition("no data exists for an uninitialized spectrometer"))?;
        if self.label.is_empty() {
            return Err(Error::precondition("must collect data with get_data before saving"))
        }
        let path = PathBuf::from(format!("{}{}", basename, self.label));
        self.sink.save(&path, session.buffers.as_slice(), Format::from_binary(binary))?;
        log::info!("saved {} spectra to {}", session.buffers.len(), path.display());
        self.label.clear();
        Ok(path)
    }

    /// Disconnect from the data stream and stop the spectrometer.
    pub fn close(&mut self) -> Result<()> {
        let session = self.session.take()
            .ok_or_else(|| Error::precondition("cannot close an uninitialized spectrometer"))?;
        log::info!("closing {}", self.config.name);
        match session.transport {
            Transport::Real { stream, socket, command_addr } => {
                drop(stream);
                send_command(&socket, command_addr, &command("stop"))?;
            }
            Transport::Simulated(_) => (),
        }
        Ok(())
    }
}

fn send_command(socket: &UdpSocket, addr: SocketAddr, command: &str) -> io::Result<()> {
    log::debug!("send_command({:?})", command);
    socket.send_to(command.as_bytes(), addr)?;
    Ok(())
}

fn max_payload_len(config: &SpectrometerConfiguration) -> usize {
    4 * config.channels.iter().sum::<usize>() * PAYLOAD_SLACK
}

fn read_frame(stream: &mut TcpStream, max_payload_len: usize) -> Result<Option<(Vec<f64>, String)>> {
    let mut bytes = [0u8; HEADER_LEN];
    stream.read_exact(&mut bytes)?;
    let header = Header::decode(&bytes);
    log::debug!("read_frame() header = {:?}", header);
    if header.payload_len() == 0 {
        return Ok(None)
    }
    if header.payload_len() > max_payload_len {
        return Err(Error::protocol(format!(
            "frame declares {} payload bytes, at most {} expected",
            header.payload_len(), max_payload_len)))
    }
    let mut payload = vec![0u8; header.payload_len()];
    stream.read_exact(&mut payload)?;
    log::trace!("read_frame() payload = {} bytes", payload.len());
    let samples = header.decode_payload(&payload)?;
    Ok(Some((samples.into_iter().map(f64::from).collect(), header.label())))
}

impl<S: DataSink> Backend for SpectrometerBackend<S> {
    fn name(&self) -> &str {
        SpectrometerBackend::name(self)
    }

    fn state(&self) -> ConnectionState {
        SpectrometerBackend::state(self)
    }

    fn init(&mut self) -> Result<Link> {
        SpectrometerBackend::init(self)
    }

    fn run(&mut self) -> Result<()> {
        SpectrometerBackend::run(self)
    }

    fn get_data(&mut self, index: usize) -> Result<&[f64]> {
        SpectrometerBackend::get_data(self, index)
    }

    fn save_data(&mut self, basename: &str, binary: bool) -> Result<PathBuf> {
        SpectrometerBackend::save_data(self, basename, binary)
    }

    fn close(&mut self) -> Result<()> {
        SpectrometerBackend::close(self)
    }
}

#[cfg(test)]
mod test {
    use std::io::Write;
    use std::net::TcpListener;
    use std::thread::{self, JoinHandle};

    use super::*;
    use crate::header::frame;
    use crate::storage::load;

    /// Plays the spectrometer for `sessions` consecutive connections, answering each `dump`
    /// with the next frame. Returns every command received.
    fn spawn_fake(sessions: usize, frames: Vec<Vec<u8>>) -> (u16, u16, JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        let tcp_port = listener.local_addr().unwrap().port();
        let udp_port = socket.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let mut commands = Vec::new();
            let mut frames = frames.into_iter();
            for _ in 0..sessions {
                let (mut stream, _) = listener.accept().unwrap();
                let mut buf = [0u8; 1024];
                while let Ok((len, _)) = socket.recv_from(&mut buf) {
                    let command = String::from_utf8_lossy(&buf[..len]).into_owned();
                    if command == "AFFTS:dump 1 " {
                        if let Some(frame) = frames.next() {
                            stream.write_all(&frame).unwrap();
                        }
                    }
                    let stop = command == "AFFTS:stop ";
                    commands.push(command);
                    if stop { break }
                }
            }
            commands
        });
        (tcp_port, udp_port, handle)
    }

    fn config(tcp_port: u16, udp_port: u16) -> SpectrometerConfiguration {
        SpectrometerConfiguration {
            host: "127.0.0.1".to_owned(),
            tcp_port,
            udp_port,
            channels: vec![4, 2],
            integration_time: Duration::from_millis(10),
            blank_time: Duration::from_millis(1),
            buffer_count: 4,
            command_settle: Duration::ZERO,
            configure_settle: Duration::ZERO,
            calibration_settle: Duration::ZERO,
            ..Default::default()
        }
    }

    fn refused_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn test_handshake_commands() {
        let config = SpectrometerConfiguration::default();
        let commands: Vec<String> = handshake(&config).into_iter().map(|(c, _)| c).collect();
        assert_eq!(commands, [
            "AFFTS:cmdMode INTERNAL ",
            "AFFTS:cmdSynctime 1000000 ",
            "AFFTS:cmdBlanktime 1000 ",
            "AFFTS:Band1:cmdNumspecchan 8192 ",
            "AFFTS:Band2:cmdNumspecchan 8192 ",
            "AFFTS:cmdUsedsections 1 1 ",
            "AFFTS:configure ",
            "AFFTS:calADC ",
        ]);
        let settles: Vec<Duration> = handshake(&config).into_iter().map(|(_, s)| s).collect();
        assert_eq!(settles[0], Duration::from_millis(100));
        assert_eq!(settles[6], Duration::from_millis(300));
    }

    #[test]
    fn test_lifecycle_commands() {
        let (tcp_port, udp_port, fake) = spawn_fake(1, vec![]);
        let mut backend = SpectrometerBackend::new(config(tcp_port, udp_port)).unwrap();
        assert_eq!(backend.state(), ConnectionState::Uninitialized);
        assert_eq!(backend.init().unwrap(), Link::Real);
        assert_eq!(backend.state(), ConnectionState::Initialized);
        assert_eq!(backend.buffers().unwrap(), &[vec![0.0; 4], vec![0.0; 4], vec![0.0; 4], vec![0.0; 4]]);
        backend.close().unwrap();
        assert_eq!(backend.state(), ConnectionState::Uninitialized);
        assert!(backend.buffers().is_none());
        assert_eq!(fake.join().unwrap(), [
            "AFFTS:cmdMode INTERNAL ",
            "AFFTS:cmdSynctime 10000 ",
            "AFFTS:cmdBlanktime 1000 ",
            "AFFTS:Band1:cmdNumspecchan 4 ",
            "AFFTS:Band2:cmdNumspecchan 2 ",
            "AFFTS:cmdUsedsections 1 1 ",
            "AFFTS:configure ",
            "AFFTS:calADC ",
            "AFFTS:stop ",
        ]);
    }

    #[test]
    fn test_get_data_decodes_frame() {
        let samples = [1.0, -2.5, 3.25, 1e-3, 7.0, 8.0];
        let (tcp_port, udp_port, fake) = spawn_fake(1, vec![frame("20181116120000", &samples)]);
        let mut backend = SpectrometerBackend::new(config(tcp_port, udp_port)).unwrap();
        backend.init().unwrap();
        backend.run().unwrap();
        assert_eq!(backend.state(), ConnectionState::Armed);
        let expected: Vec<f64> = samples.iter().map(|&s| s as f64).collect();
        assert_eq!(backend.get_data(2).unwrap(), &expected[..]);
        assert_eq!(backend.state(), ConnectionState::Initialized);
        assert_eq!(backend.data(2).unwrap(), &expected[..]);
        assert_eq!(backend.data(0).unwrap(), &[0.0; 4]);
        assert_eq!(backend.label(), Some("20181116120000"));
        backend.close().unwrap();
        let commands = fake.join().unwrap();
        assert_eq!(commands[commands.len() - 2], "AFFTS:dump 1 ");
    }

    #[test]
    fn test_header_only_frame() {
        let (tcp_port, udp_port, fake) = spawn_fake(1, vec![frame("20181116120000", &[])]);
        let mut backend = SpectrometerBackend::new(config(tcp_port, udp_port)).unwrap();
        backend.init().unwrap();
        backend.run().unwrap();
        assert_eq!(backend.get_data(1).unwrap(), &[0.0; 4]);
        assert_eq!(backend.state(), ConnectionState::Initialized);
        assert_eq!(backend.label(), None);
        backend.close().unwrap();
        fake.join().unwrap();
    }

    #[test]
    fn test_lifecycle_preconditions() {
        let (tcp_port, udp_port, fake) = spawn_fake(1, vec![frame("t", &[1.0])]);
        let mut backend = SpectrometerBackend::new(config(tcp_port, udp_port)).unwrap();
        assert!(backend.run().unwrap_err().is_precondition());
        assert!(backend.get_data(0).unwrap_err().is_precondition());
        assert!(backend.close().unwrap_err().is_precondition());
        assert!(backend.save_data("/tmp/x", true).unwrap_err().is_precondition());

        backend.init().unwrap();
        assert!(backend.init().unwrap_err().is_precondition());
        assert!(backend.get_data(0).unwrap_err().is_precondition());
        backend.run().unwrap();
        assert!(backend.run().unwrap_err().is_precondition());
        assert!(backend.get_data(4).unwrap_err().is_precondition());
        assert_eq!(backend.state(), ConnectionState::Armed);
        backend.get_data(3).unwrap();
        backend.close().unwrap();
        fake.join().unwrap();
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut oversized = frame("20181116120000", &[1.0]);
        oversized[8..12].copy_from_slice(&u32::MAX.to_ne_bytes());
        let (tcp_port, udp_port, fake) = spawn_fake(1, vec![oversized]);
        let mut backend = SpectrometerBackend::new(config(tcp_port, udp_port)).unwrap();
        backend.init().unwrap();
        backend.run().unwrap();
        assert!(backend.get_data(0).unwrap_err().is_protocol());
        assert_eq!(backend.state(), ConnectionState::Initialized);
        assert_eq!(backend.data(0).unwrap(), &[0.0; 4]);
        assert_eq!(backend.label(), None);
        backend.close().unwrap();
        fake.join().unwrap();
    }

    #[test]
    fn test_max_payload_len() {
        assert_eq!(max_payload_len(&config(0, 0)), 4 * 6 * PAYLOAD_SLACK);
    }

    #[test]
    fn test_save_consumes_label() {
        let dir = tempfile::tempdir().unwrap();
        let basename = format!("{}/FW", dir.path().display());
        let (tcp_port, udp_port, fake) = spawn_fake(1, vec![frame("20181116120000", &[0.5, 1.5])]);
        let mut backend = SpectrometerBackend::new(config(tcp_port, udp_port)).unwrap();
        backend.init().unwrap();
        assert!(backend.save_data(&basename, true).unwrap_err().is_precondition());
        backend.run().unwrap();
        backend.get_data(0).unwrap();

        let path = backend.save_data(&basename, true).unwrap();
        assert_eq!(path, dir.path().join("FW20181116120000"));
        assert!(backend.save_data(&basename, true).unwrap_err().is_precondition());

        let saved = load(&path, Format::Binary).unwrap();
        assert_eq!(saved, [vec![0.5, 1.5], vec![0.0; 4], vec![0.0; 4], vec![0.0; 4]]);
        backend.close().unwrap();
        fake.join().unwrap();
    }

    #[test]
    fn test_reinit_after_close() {
        let (tcp_port, udp_port, fake) = spawn_fake(2, vec![]);
        let mut backend = SpectrometerBackend::new(config(tcp_port, udp_port)).unwrap();
        assert_eq!(backend.init().unwrap(), Link::Real);
        backend.close().unwrap();
        assert_eq!(backend.init().unwrap(), Link::Real);
        assert_eq!(backend.state(), ConnectionState::Initialized);
        backend.close().unwrap();
        let commands = fake.join().unwrap();
        assert_eq!(commands.iter().filter(|c| *c == "AFFTS:stop ").count(), 2);
    }

    #[test]
    fn test_fallback_serves_data() {
        let port = refused_port();
        let mut backend = SpectrometerBackend::new(config(port, port)).unwrap();
        assert_eq!(backend.init().unwrap(), Link::Simulated);
        assert_eq!(backend.state(), ConnectionState::Initialized);
        backend.run().unwrap();
        assert!(backend.run().unwrap_err().is_precondition());
        assert_eq!(backend.get_data(1).unwrap().len(), 4);
        assert!(backend.label().is_some());

        let dir = tempfile::tempdir().unwrap();
        let basename = format!("{}/FW", dir.path().display());
        let path = backend.save_data(&basename, false).unwrap();
        assert_eq!(load(&path, Format::Text).unwrap().len(), 4);
        backend.close().unwrap();
        assert_eq!(backend.init().unwrap(), Link::Simulated);
        backend.close().unwrap();
    }

    #[test]
    fn test_invalid_configuration() {
        let config = SpectrometerConfiguration {
            integration_time: Duration::from_millis(6000),
            ..Default::default()
        };
        assert!(matches!(SpectrometerBackend::new(config), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_backend_trait_object() {
        let port = refused_port();
        let mut backend: Box<dyn Backend> =
            Box::new(SpectrometerBackend::new(config(port, port)).unwrap());
        assert_eq!(backend.name(), "AFFTS");
        assert_eq!(backend.init().unwrap(), Link::Simulated);
        backend.run().unwrap();
        assert_eq!(backend.get_data(0).unwrap().len(), 4);
        assert_eq!(backend.state(), ConnectionState::Initialized);
        backend.close().unwrap();
    }
}
