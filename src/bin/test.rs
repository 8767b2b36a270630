use radiometer::{
    Backend, Link,
    InstrumentBackend, InstrumentConfiguration,
    SpectrometerBackend, SpectrometerConfiguration,
};

const BASENAME: &str = "test-";

fn acquire(backend: &mut dyn Backend) -> radiometer::Result<()> {
    if backend.init()? == Link::Simulated {
        println!("{} is unreachable, acquiring from a simulated instrument", backend.name());
    }
    backend.run()?;
    let spectrum = backend.get_data(0)?;
    println!("got {} channels, first 8: {:.3?}", spectrum.len(), &spectrum[..spectrum.len().min(8)]);
    let path = backend.save_data(BASENAME, true)?;
    println!("saved to {}", path.display());
    backend.close()
}

fn main() -> radiometer::Result<()> {
    env_logger::init();
    let mut args = std::env::args().skip(1);
    let kind = args.next();
    let host = args.next();
    match kind.as_deref() {
        Some("ffts") | None => {
            let mut config = SpectrometerConfiguration::default();
            if let Some(host) = host { config.host = host }
            acquire(&mut SpectrometerBackend::new(config)?)
        }
        Some("cts") => {
            let mut config = InstrumentConfiguration::default();
            if let Some(host) = host { config.host = host }
            acquire(&mut InstrumentBackend::new(config)?)
        }
        Some(other) => {
            eprintln!("unknown instrument {:?}; usage: radiometer-test [ffts|cts] [host]", other);
            std::process::exit(2)
        }
    }
}
