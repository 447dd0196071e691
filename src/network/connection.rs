//! Connection handling dengan buffered non-blocking I/O
//!
//! Satu `Connection` dimiliki oleh satu worker engine. Read dilakukan ke
//! scratch buffer milik worker; write yang belum terkirim disimpan di
//! write buffer sampai socket writable lagi.

use std::io::{self, Read, Write};
use std::net::Shutdown;

use bytes::{Buf, BytesMut};
use mio::net::TcpStream;

use crate::config::EngineConfig;

/// Hasil satu kali read
#[derive(Debug)]
pub(crate) enum ReadOutcome {
    Data(usize),
    WouldBlock,
    Eof,
}

/// Buffered connection wrapper
pub(crate) struct Connection {
    stream: TcpStream,
    write_buffer: BytesMut,
    max_pending_write: usize,
}

impl Connection {
    pub fn new(stream: TcpStream, config: &EngineConfig) -> Self {
        Self {
            stream,
            write_buffer: BytesMut::with_capacity(config.write_buffer_size),
            max_pending_write: config.max_pending_write,
        }
    }

    #[inline]
    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    #[inline]
    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    /// Read satu chunk dari socket
    #[inline]
    pub fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<ReadOutcome> {
        loop {
            match self.stream.read(buf) {
                Ok(0) => return Ok(ReadOutcome::Eof),
                Ok(n) => return Ok(ReadOutcome::Data(n)),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(ReadOutcome::WouldBlock)
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Queue data lalu coba flush.
    ///
    /// Returns `false` jika data dibuang karena write buffer sudah melewati
    /// batas (peer tidak membaca).
    pub fn queue_write(&mut self, data: &[u8]) -> io::Result<bool> {
        if self.write_buffer.len() + data.len() > self.max_pending_write {
            self.flush_write_buffer()?;
            if self.write_buffer.len() + data.len() > self.max_pending_write {
                return Ok(false);
            }
        }

        self.write_buffer.extend_from_slice(data);
        self.flush_write_buffer()?;
        Ok(true)
    }

    /// Flush write buffer ke socket sampai habis atau WouldBlock
    pub fn flush_write_buffer(&mut self) -> io::Result<()> {
        while !self.write_buffer.is_empty() {
            match self.stream.write(&self.write_buffer) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "Failed to write to socket",
                    ));
                }
                Ok(n) => self.write_buffer.advance(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Bytes pending in write buffer
    #[inline(always)]
    pub fn write_pending(&self) -> usize {
        self.write_buffer.len()
    }

    /// Half-close kedua arah. `NotConnected` diabaikan (peer sudah pergi).
    pub fn shutdown(&self) -> io::Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Err(ref e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}

/// Terapkan opsi socket dari config: TCP_NODELAY dan ukuran buffer kernel
pub(crate) fn configure_socket(stream: &TcpStream, config: &EngineConfig) -> io::Result<()> {
    if config.nodelay {
        stream.set_nodelay(true)?;
    }

    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        let fd = stream.as_raw_fd();
        if let Some(size) = config.recv_buffer_size {
            set_buffer_size(fd, libc::SO_RCVBUF, size)?;
        }
        if let Some(size) = config.send_buffer_size {
            set_buffer_size(fd, libc::SO_SNDBUF, size)?;
        }
    }

    Ok(())
}

#[cfg(unix)]
fn set_buffer_size(fd: libc::c_int, option: libc::c_int, size: usize) -> io::Result<()> {
    let optval = libc::c_int::try_from(size).unwrap_or(libc::c_int::MAX);
    // SAFETY: fd milik stream yang masih hidup, optval hidup selama panggilan
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            option,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}
