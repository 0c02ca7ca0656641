//! A framed message stream over one blocking TCP connection.  Each message is preceded by a
//! one-byte header length, an [rpc_pb::Frame] carrying the body size and crc32c, and then the
//! body itself.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use biometrics::{Collector, Counter};
use buffertk::{stack_pack, Packable, Unpackable};
use zerror_core::ErrorCore;

use rpc_pb::Frame;

use super::{ClientOptions, Wire};

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static CONNECT: Counter = Counter::new("busywire.channel.connect");
static MESSAGES_SENT: Counter = Counter::new("busywire.channel.messages_sent");
static MESSAGES_RECV: Counter = Counter::new("busywire.channel.messages_recv");
static RECV_ERRORS: Counter = Counter::new("busywire.channel.recv.errors");
static SEND_ERRORS: Counter = Counter::new("busywire.channel.send.errors");

pub fn register_biometrics(collector: &Collector) {
    collector.register_counter(&CONNECT);
    collector.register_counter(&MESSAGES_SENT);
    collector.register_counter(&MESSAGES_RECV);
    collector.register_counter(&RECV_ERRORS);
    collector.register_counter(&SEND_ERRORS);
}

/////////////////////////////////////////////// frame //////////////////////////////////////////////

/// Prepend the frame to `body` and return the bytes to put on the wire.
pub fn frame_message(body: &[u8]) -> Vec<u8> {
    let frame = Frame::from_buffer(body);
    let frame_sz = frame.pack_sz();
    assert!(frame_sz < 256);
    let mut buf = Vec::with_capacity(1 + frame_sz + body.len());
    buf.push(frame_sz as u8);
    stack_pack(frame).append_to_vec(&mut buf);
    buf.extend_from_slice(body);
    buf
}

/// Read one framed message from `reader`.
pub fn read_framed<R: Read>(reader: &mut R) -> Result<Vec<u8>, rpc_pb::Error> {
    let mut frame_sz = [0u8; 1];
    reader.read_exact(&mut frame_sz)?;
    let mut header = vec![0u8; frame_sz[0] as usize];
    reader.read_exact(&mut header)?;
    let (frame, _) = Frame::unpack(&header)?;
    if frame.size > rpc_pb::MAX_BODY_SIZE as u64 {
        return Err(rpc_pb::Error::TransportFailure {
            core: ErrorCore::default(),
            what: format!("frame of {} bytes exceeds the body limit", frame.size),
        });
    }
    let mut body = vec![0u8; frame.size as usize];
    reader.read_exact(&mut body)?;
    if crc32c::crc32c(&body) != frame.crc32c {
        return Err(rpc_pb::Error::TransportFailure {
            core: ErrorCore::default(),
            what: "crc32c failed".to_string(),
        });
    }
    Ok(body)
}

////////////////////////////////////////////// Channel /////////////////////////////////////////////

/// A message channel over one TCP stream.
pub struct Channel {
    stream: TcpStream,
}

impl Channel {
    /// Dial `target` and configure timeouts from the options.
    pub fn connect(target: &str, options: &ClientOptions) -> Result<Channel, rpc_pb::Error> {
        CONNECT.click();
        let mut addrs = target.to_socket_addrs()?;
        let addr = addrs.next().ok_or_else(|| rpc_pb::Error::TransportFailure {
            core: ErrorCore::default(),
            what: format!("could not resolve {}", target),
        })?;
        let stream = if options.connect_timeout_ms > 0 {
            TcpStream::connect_timeout(&addr, Duration::from_millis(options.connect_timeout_ms))?
        } else {
            TcpStream::connect(addr)?
        };
        if options.call_timeout_ms > 0 {
            let timeout = Some(Duration::from_millis(options.call_timeout_ms));
            stream.set_read_timeout(timeout)?;
            stream.set_write_timeout(timeout)?;
        }
        Self::from_stream(stream)
    }

    /// Adopt an established stream.
    pub fn from_stream(stream: TcpStream) -> Result<Channel, rpc_pb::Error> {
        stream.set_nodelay(true)?;
        Ok(Channel { stream })
    }
}

impl Wire for Channel {
    fn send(&mut self, body: &[u8]) -> Result<(), rpc_pb::Error> {
        let buf = frame_message(body);
        if let Err(err) = self.stream.write_all(&buf) {
            SEND_ERRORS.click();
            return Err(err.into());
        }
        MESSAGES_SENT.click();
        Ok(())
    }

    fn recv(&mut self) -> Result<Vec<u8>, rpc_pb::Error> {
        match read_framed(&mut self.stream) {
            Ok(body) => {
                MESSAGES_RECV.click();
                Ok(body)
            }
            Err(err) => {
                RECV_ERRORS.click();
                Err(err)
            }
        }
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let body = b"the quick brown fox";
        let buf = frame_message(body);
        let mut reader = std::io::Cursor::new(buf);
        let unframed = read_framed(&mut reader).unwrap();
        assert_eq!(body.as_slice(), unframed.as_slice());
    }

    #[test]
    fn frame_corruption_detected() {
        let body = b"the quick brown fox";
        let mut buf = frame_message(body);
        let idx = buf.len() - 1;
        buf[idx] ^= 0xff;
        let mut reader = std::io::Cursor::new(buf);
        assert!(read_framed(&mut reader).is_err());
    }

    #[test]
    fn frame_empty_message() {
        let buf = frame_message(&[]);
        let mut reader = std::io::Cursor::new(buf);
        let unframed = read_framed(&mut reader).unwrap();
        assert!(unframed.is_empty());
    }
}
