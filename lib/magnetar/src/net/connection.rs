use crate::commands::buffer;
use crate::commands::buffer::Buffer;
use crate::errors::{Error, Result};
use crate::net::host::Host;
use byteorder::{BigEndian, ByteOrder};
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

/// Decoded 8-byte proto header.
#[derive(Debug, Copy, Clone)]
pub struct ProtoHeader {
    pub version: u8,
    pub msg_type: u8,
    pub size: usize,
}

/// One TCP stream to one node, carrying at most one in-flight request. The
/// command holding it owns it exclusively; it is returned to the pool only
/// when no unread bytes remain on the wire.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    pub buffer: Buffer,
    last_used: Instant,
}

impl Connection {
    /// Establish a stream to the host. A zero timeout blocks indefinitely.
    pub fn connect(host: &Host, timeout: Duration) -> Result<Connection> {
        let addr = host
            .address()
            .to_socket_addrs()
            .map_err(|err| Error::new(crate::errors::ErrorKind::Connection(err.kind(), err.to_string())))?
            .next()
            .ok_or_else(|| Error::invalid_argument(format!("unresolvable host {}", host)))?;

        let stream = if timeout > Duration::from_secs(0) {
            TcpStream::connect_timeout(&addr, timeout)?
        } else {
            TcpStream::connect(&addr)?
        };
        stream.set_nodelay(true)?;

        Ok(Connection {
            stream,
            buffer: Buffer::new(),
            last_used: Instant::now(),
        })
    }

    /// Apply the per-attempt socket deadline to both directions. Zero means
    /// no deadline.
    pub fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        let timeout = if timeout > Duration::from_secs(0) {
            Some(timeout)
        } else {
            None
        };
        self.stream.set_read_timeout(timeout)?;
        self.stream.set_write_timeout(timeout)?;
        Ok(())
    }

    /// Push the built request frame onto the wire.
    pub fn flush(&mut self) -> Result<()> {
        self.stream.write_all(self.buffer.frame())?;
        self.last_used = Instant::now();
        Ok(())
    }

    fn read_proto_header(&mut self) -> Result<ProtoHeader> {
        let mut head = [0u8; 8];
        self.stream.read_exact(&mut head)?;
        let raw = BigEndian::read_u64(&head);
        Ok(ProtoHeader {
            version: (raw >> 56) as u8,
            msg_type: (raw >> 48) as u8,
            size: (raw & 0x0000_FFFF_FFFF_FFFF) as usize,
        })
    }

    /// Read one whole response message into the buffer, transparently
    /// unwrapping the compressed envelope, and leave the cursor at the
    /// message start. Returns the payload size.
    pub fn read_message(&mut self) -> Result<usize> {
        let header = self.read_proto_header()?;
        if header.version != buffer::PROTO_VERSION {
            return Err(Error::parse(format!(
                "unsupported protocol version {}",
                header.version
            )));
        }

        match header.msg_type {
            buffer::PROTO_TYPE_COMPRESSED => {
                if header.size > buffer::MAX_BUFFER_SIZE || header.size < 8 {
                    return Err(Error::parse(format!(
                        "invalid compressed message size {}",
                        header.size
                    )));
                }
                let mut body = vec![0u8; header.size];
                self.stream.read_exact(&mut body)?;
                let expected = BigEndian::read_u64(&body[..8]) as usize;
                let inflated = buffer::inflate(&body[8..], expected)?;
                self.buffer.data_buffer = inflated;
                self.buffer.reset_offset();
                self.last_used = Instant::now();
                Ok(expected)
            }
            buffer::PROTO_TYPE_AS_MSG
            | buffer::PROTO_TYPE_ADMIN
            | buffer::PROTO_TYPE_INFO => {
                self.buffer.resize_buffer(header.size)?;
                self.stream.read_exact(&mut self.buffer.data_buffer[..header.size])?;
                self.buffer.reset_offset();
                self.last_used = Instant::now();
                Ok(header.size)
            }
            msg_type => Err(Error::parse(format!("unknown proto type {}", msg_type))),
        }
    }

    /// Read a message that must carry at least a full record header.
    pub fn read_record_message(&mut self) -> Result<usize> {
        let size = self.read_message()?;
        if size < buffer::MSG_REMAINING_HEADER_SIZE {
            return Err(Error::parse(format!("short message of {} bytes", size)));
        }
        Ok(size)
    }

    /// True when the connection idled in the pool beyond its lifetime.
    #[inline]
    pub fn idle_expired(&self, idle_timeout: Duration) -> bool {
        idle_timeout > Duration::from_secs(0) && self.last_used.elapsed() > idle_timeout
    }

    /// Hard-close both directions. Errors are moot by this point.
    pub fn close(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}
