//! Binds the caller's socket to the engine's transport.
//!
//! The engine pulls and pushes TLS records through `std::io::Read` and
//! `std::io::Write`; sockets handed to this crate speak `embedded_io`. The
//! shim forwards each call unchanged and only converts the error kind.

use embedded_io::Error as _;
use embedded_io::ErrorKind;
use std::io;

pub(crate) struct Transport<'s, S> {
    socket: &'s mut S,
}

impl<'s, S> Transport<'s, S> {
    pub(crate) fn new(socket: &'s mut S) -> Self {
        Self { socket }
    }
}

impl<S: embedded_io::Read> io::Read for Transport<'_, S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.socket
            .read(buf)
            .map_err(|e| io::Error::from(to_std_kind(e.kind())))
    }
}

impl<S: embedded_io::Write> io::Write for Transport<'_, S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.socket
            .write(buf)
            .map_err(|e| io::Error::from(to_std_kind(e.kind())))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.socket
            .flush()
            .map_err(|e| io::Error::from(to_std_kind(e.kind())))
    }
}

pub(crate) fn to_std_kind(kind: ErrorKind) -> io::ErrorKind {
    match kind {
        ErrorKind::NotFound => io::ErrorKind::NotFound,
        ErrorKind::PermissionDenied => io::ErrorKind::PermissionDenied,
        ErrorKind::ConnectionRefused => io::ErrorKind::ConnectionRefused,
        ErrorKind::ConnectionReset => io::ErrorKind::ConnectionReset,
        ErrorKind::ConnectionAborted => io::ErrorKind::ConnectionAborted,
        ErrorKind::NotConnected => io::ErrorKind::NotConnected,
        ErrorKind::AddrInUse => io::ErrorKind::AddrInUse,
        ErrorKind::AddrNotAvailable => io::ErrorKind::AddrNotAvailable,
        ErrorKind::BrokenPipe => io::ErrorKind::BrokenPipe,
        ErrorKind::AlreadyExists => io::ErrorKind::AlreadyExists,
        ErrorKind::InvalidInput => io::ErrorKind::InvalidInput,
        ErrorKind::InvalidData => io::ErrorKind::InvalidData,
        ErrorKind::TimedOut => io::ErrorKind::TimedOut,
        ErrorKind::Interrupted => io::ErrorKind::Interrupted,
        ErrorKind::Unsupported => io::ErrorKind::Unsupported,
        _ => io::ErrorKind::Other,
    }
}

pub(crate) fn from_std_kind(kind: io::ErrorKind) -> ErrorKind {
    match kind {
        io::ErrorKind::NotFound => ErrorKind::NotFound,
        io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
        io::ErrorKind::ConnectionRefused => ErrorKind::ConnectionRefused,
        io::ErrorKind::ConnectionReset => ErrorKind::ConnectionReset,
        // The engine reports a peer that vanished without close-notify as EOF.
        io::ErrorKind::ConnectionAborted | io::ErrorKind::UnexpectedEof => {
            ErrorKind::ConnectionAborted
        }
        io::ErrorKind::NotConnected => ErrorKind::NotConnected,
        io::ErrorKind::AddrInUse => ErrorKind::AddrInUse,
        io::ErrorKind::AddrNotAvailable => ErrorKind::AddrNotAvailable,
        io::ErrorKind::BrokenPipe => ErrorKind::BrokenPipe,
        io::ErrorKind::AlreadyExists => ErrorKind::AlreadyExists,
        io::ErrorKind::InvalidInput => ErrorKind::InvalidInput,
        io::ErrorKind::InvalidData => ErrorKind::InvalidData,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ErrorKind::TimedOut,
        io::ErrorKind::Interrupted => ErrorKind::Interrupted,
        io::ErrorKind::Unsupported => ErrorKind::Unsupported,
        _ => ErrorKind::Other,
    }
}
