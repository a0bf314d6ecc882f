use std::io::{self, Read as _, Write as _};

use embedded_io::{ErrorType, Read, Write};
use rustls::{CipherSuite, Connection, ProtocolVersion};

use crate::context::Context;
use crate::slots::Slot;
use crate::transport::Transport;
use crate::{module, Error, Result};

/// Which side of the handshake a session plays.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SocketMode {
    Client,
    Server,
}

/// A TLS session over a caller-owned socket.
///
/// The session occupies one session slot from the pool of the context it was
/// opened from. All socket I/O is blocking and happens inside [`open`],
/// [`read`], [`write`] and [`close`].
///
/// [`open`]: Session::open
/// [`read`]: Session::read
/// [`write`]: Session::write
/// [`close`]: Session::close
pub struct Session<'c, S>
where
    S: Read + Write + 'c,
{
    context: &'c Context<'c>,
    socket: &'c mut S,
    slot: Option<Slot>,
    conn: Option<Connection>,
    mode: SocketMode,
    server_hostname: Option<String>,
}

impl<'c, S> Session<'c, S>
where
    S: Read + Write + 'c,
{
    /// Open a session on `socket` and run the handshake to completion.
    ///
    /// A client must name the server it expects in `server_hostname`; a
    /// server ignores it. If the handshake fails the slot is returned to the
    /// pool and the engine error is reported.
    pub fn open(
        context: &'c Context<'c>,
        socket: &'c mut S,
        mode: SocketMode,
        server_hostname: Option<&str>,
    ) -> Result<Self> {
        if !module::is_initialized() || !context.is_configured() {
            warn!("Session opened without an initialized module and context");
            return Err(Error::InvalidArgument);
        }
        if mode == SocketMode::Client && server_hostname.is_none() {
            warn!("Client session without server hostname");
            return Err(Error::InvalidArgument);
        }

        let slot = context.slots().acquire_session_slot()?;
        // From here on, dropping `session` gives the slot back.
        let mut session = Self {
            context,
            socket,
            slot: Some(slot),
            conn: None,
            mode,
            server_hostname: server_hostname.map(str::to_owned),
        };
        session.conn = Some(context.connection(mode, server_hostname)?);

        if let Err(e) = session.handshake() {
            warn!("Handshake failed: {:?}", e);
            session.conn = None;
            return Err(e);
        }

        info!(
            "Session open as {:?}, {:?} {:?}",
            mode,
            session.protocol_version(),
            session.cipher()
        );
        Ok(session)
    }

    fn handshake(&mut self) -> Result<()> {
        let conn = self.conn.as_mut().ok_or(Error::InvalidArgument)?;
        let mut transport = Transport::new(&mut *self.socket);
        while conn.is_handshaking() {
            let (rd, wr) = conn.complete_io(&mut transport)?;
            trace!("Handshake progress: {} bytes in, {} bytes out", rd, wr);
        }
        while conn.wants_write() {
            conn.write_tls(&mut transport)?;
        }
        Ok(())
    }

    /// Read decrypted application data into `buf`, blocking until at least
    /// one byte is available.
    ///
    /// Returns `Ok(0)` for an empty `buf` and after the peer sent
    /// close-notify.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let conn = self.conn.as_mut().ok_or_else(|| {
            warn!("Read on a closed session");
            Error::InvalidArgument
        })?;
        if buf.is_empty() {
            return Ok(0);
        }

        let mut transport = Transport::new(&mut *self.socket);
        loop {
            match conn.reader().read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e.into()),
            }
            let (rd, wr) = conn.complete_io(&mut transport)?;
            if rd == 0 && wr == 0 && !conn.wants_read() {
                // No progress and the engine wants no more input.
                return conn.reader().read(buf).map_err(Error::from);
            }
        }
    }

    /// Encrypt `buf` and send it. Blocks until the records are handed to the
    /// socket.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let conn = self.conn.as_mut().ok_or_else(|| {
            warn!("Write on a closed session");
            Error::InvalidArgument
        })?;
        let n = conn.writer().write(buf)?;
        let mut transport = Transport::new(&mut *self.socket);
        while conn.wants_write() {
            if conn.write_tls(&mut transport)? == 0 {
                return Err(Error::Io(embedded_io::ErrorKind::Other));
            }
        }
        Ok(n)
    }

    /// Push any pending records and flush the socket.
    pub fn flush(&mut self) -> Result<()> {
        let conn = self.conn.as_mut().ok_or(Error::InvalidArgument)?;
        let mut transport = Transport::new(&mut *self.socket);
        while conn.wants_write() {
            if conn.write_tls(&mut transport)? == 0 {
                return Err(Error::Io(embedded_io::ErrorKind::Other));
            }
        }
        transport.flush()?;
        Ok(())
    }

    /// Send close-notify, free the engine state and give the slot back.
    ///
    /// Delivery of close-notify is best effort. The socket stays open and
    /// belongs to the caller.
    pub fn close(&mut self) -> Result<()> {
        let Some(mut conn) = self.conn.take() else {
            warn!("Close on a closed session");
            return Err(Error::InvalidArgument);
        };

        conn.send_close_notify();
        let mut transport = Transport::new(&mut *self.socket);
        while conn.wants_write() {
            match conn.write_tls(&mut transport) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!("close-notify not delivered: {:?}", e);
                    break;
                }
            }
        }
        drop(conn);
        self.release_slot();
        debug!("Session closed");
        Ok(())
    }

    /// Number of decrypted bytes ready to be read without blocking.
    ///
    /// Always 0: buffered plaintext is not reported yet.
    pub fn size(&self) -> usize {
        0
    }

    pub fn is_open(&self) -> bool {
        self.conn.is_some()
    }

    pub fn mode(&self) -> SocketMode {
        self.mode
    }

    pub fn context(&self) -> &'c Context<'c> {
        self.context
    }

    /// Negotiated cipher suite, once the handshake is done.
    pub fn cipher(&self) -> Option<CipherSuite> {
        self.conn
            .as_ref()?
            .negotiated_cipher_suite()
            .map(|suite| suite.suite())
    }

    pub fn protocol_version(&self) -> Option<ProtocolVersion> {
        self.conn.as_ref()?.protocol_version()
    }

    /// The hostname a client session verified the server against, or the
    /// SNI name a server session received.
    pub fn server_hostname(&self) -> Option<&str> {
        match self.conn.as_ref()? {
            Connection::Server(conn) => conn.server_name(),
            Connection::Client(_) => self.server_hostname.as_deref(),
        }
    }

    fn release_slot(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.context.slots().release_session_slot(slot);
        }
    }
}

impl<'c, S> Drop for Session<'c, S>
where
    S: Read + Write + 'c,
{
    fn drop(&mut self) {
        if self.conn.is_some() {
            let _ = self.close();
        }
        self.release_slot();
    }
}

impl<'c, S> core::fmt::Debug for Session<'c, S>
where
    S: Read + Write + 'c,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Session")
            .field("slot", &self.slot)
            .field("mode", &self.mode)
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

impl<'c, S> ErrorType for Session<'c, S>
where
    S: Read + Write + 'c,
{
    type Error = Error;
}

impl<'c, S> Read for Session<'c, S>
where
    S: Read + Write + 'c,
{
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Session::read(self, buf)
    }
}

impl<'c, S> Write for Session<'c, S>
where
    S: Read + Write + 'c,
{
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        Session::write(self, buf)
    }

    fn flush(&mut self) -> Result<()> {
        Session::flush(self)
    }
}
