#![doc = include_str!("../README.md")]
#![warn(clippy::pedantic)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc // TODO
)]

/*!
# Example

```no_run
use embedded_io_adapters::std::FromStd;
use simba_ssl::{module, Context, Protocol, ResourceSlots, Session, SocketMode};
use std::net::TcpListener;

static SLOTS: ResourceSlots = ResourceSlots::new();

fn main() -> Result<(), simba_ssl::Error> {
    module::initialize()?;

    let cert = std::fs::read("server-cert.pem").unwrap();
    let key = std::fs::read("server-key.pem").unwrap();

    let mut context = Context::init(&SLOTS, Protocol::Tls)?;
    context.load_cert_chain(&cert, Some(&key))?;

    let listener = TcpListener::bind("0.0.0.0:4433").unwrap();
    let (stream, _) = listener.accept().unwrap();
    let mut socket = FromStd::new(stream);

    {
        let mut session = Session::open(&context, &mut socket, SocketMode::Server, None)?;
        let mut buf = [0; 64];
        let n = session.read(&mut buf)?;
        session.write(&buf[..n])?;
        session.close()?;
    }

    context.deinit()
}
```
*/

// This mod MUST go first, so that the others see its macros.
pub(crate) mod fmt;

pub mod context;
pub mod module;
pub mod pki;
pub mod rng;
pub mod session;
pub mod slots;
mod transport;

pub use context::{Context, Protocol, VerifyMode};
pub use pki::ParseError;
pub use session::{Session, SocketMode};
pub use slots::{ResourceSlots, Slot, SlotAllocator, SlotKind, SlotPool};

pub use rustls;

/// Errors reported by the adapter.
///
/// `InvalidArgument` means the API was used wrong (uninitialized module, stale
/// handle, wrong state). Everything else is a runtime failure.
#[derive(Debug, Clone)]
pub enum Error {
    /// Precondition violation.
    InvalidArgument,
    /// All slots of the requested kind are in use.
    Busy,
    /// The entropy source could not seed the random generator.
    Seed,
    /// Certificate or private key could not be decoded.
    Parse(ParseError),
    /// Failure reported by the TLS engine.
    Tls(rustls::Error),
    /// Failure reported by the socket.
    Io(embedded_io::ErrorKind),
}

impl Error {
    /// The caller violated an API precondition.
    pub fn is_precondition(&self) -> bool {
        matches!(self, Self::InvalidArgument)
    }

    /// No slot was free; the caller may retry later or reject the connection.
    pub fn is_resource_exhaustion(&self) -> bool {
        matches!(self, Self::Busy)
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::InvalidArgument => write!(f, "Invalid argument"),
            Self::Busy => write!(f, "No free slot"),
            Self::Seed => write!(f, "Random generator seeding failed"),
            Self::Parse(e) => write!(f, "Parse error: {e}"),
            Self::Tls(e) => write!(f, "TLS error: {e}"),
            Self::Io(e) => write!(f, "IO error: {e:?}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Tls(e) => Some(e),
            Self::Parse(e) => Some(e),
            _ => None,
        }
    }
}

impl embedded_io::Error for Error {
    fn kind(&self) -> embedded_io::ErrorKind {
        if let Self::Io(k) = self {
            *k
        } else {
            error!("TLS error: {:?}", self);
            embedded_io::ErrorKind::Other
        }
    }
}

impl From<ParseError> for Error {
    fn from(e: ParseError) -> Self {
        Self::Parse(e)
    }
}

impl From<rustls::Error> for Error {
    fn from(e: rustls::Error) -> Self {
        Self::Tls(e)
    }
}

/// The engine reports TLS failures through `std::io` as `InvalidData` errors
/// carrying the `rustls::Error`; unwrap those so callers see the engine code.
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        if let Some(tls) = e
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<rustls::Error>())
        {
            return Self::Tls(tls.clone());
        }
        Self::Io(transport::from_std_kind(e.kind()))
    }
}

pub type Result<T> = core::result::Result<T, Error>;
