use std::io::{self, Read, Write};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use crc::{CRC_16_XMODEM, Crc};
use miette::Diagnostic;
use thiserror::Error;

use super::{ReceiveError, SMP_TRANSFER_BUFFER_SIZE, SendError, Transport};

/// Marker of the first frame of a packet
const FRAME_START: [u8; 2] = [0x06, 0x09];
/// Marker of all continuation frames of a packet
const FRAME_CONT: [u8; 2] = [0x04, 0x14];

/// Maximum size of one console frame, including markers and newline
const MAX_FRAME_SIZE: usize = 127;
/// Raw bytes that fit into one frame after base64 expansion
const RAW_BYTES_PER_FRAME: usize = (MAX_FRAME_SIZE - 3) / 4 * 3;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// Failed to open a serial port
#[derive(Error, Debug, Diagnostic)]
#[error("failed to open serial port")]
#[diagnostic(code(mcumgr_upgrader::transport::serial::open))]
pub struct SerialOpenError(#[from] serialport::Error);

/// The [SMP console transport](https://docs.zephyrproject.org/latest/services/device_mgmt/smp_transport.html#uart-serial-and-console).
///
/// Packets are chunked into newline-terminated frames of at most 127 bytes.
/// Each frame starts with a two-byte marker and carries a base64 encoded
/// piece of `length ‖ data ‖ crc16`, where the CRC is CRC-16/XMODEM over the
/// data only. Console output interleaved between frames is skipped.
pub struct SerialTransport<T> {
    io: T,
    pending: Vec<u8>,
}

impl SerialTransport<Box<dyn serialport::SerialPort>> {
    /// Opens a serial port and wraps it into a transport.
    pub fn open(path: impl AsRef<str>, baud_rate: u32) -> Result<Self, SerialOpenError> {
        let port = serialport::new(path.as_ref(), baud_rate)
            .timeout(DEFAULT_TIMEOUT)
            .open()?;
        Ok(Self::new(port))
    }
}

impl<T: Read + Write> SerialTransport<T> {
    /// Creates a transport over an already opened channel.
    pub fn new(io: T) -> Self {
        Self {
            io,
            pending: Vec::new(),
        }
    }

    /// Reads one newline-terminated line, without the newline.
    fn read_line(&mut self) -> Result<Vec<u8>, ReceiveError> {
        loop {
            if let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
                line.pop();
                return Ok(line);
            }

            let mut chunk = [0u8; 512];
            let read = self.io.read(&mut chunk)?;
            if read == 0 {
                return Err(ReceiveError::TransportError(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "serial channel closed",
                )));
            }
            self.pending.extend_from_slice(&chunk[..read]);
        }
    }
}

impl<T: Read + Write> Transport for SerialTransport<T> {
    fn send_raw_frame(&mut self, header: [u8; 8], data: &[u8]) -> Result<(), SendError> {
        let total: u16 = (header.len() + data.len() + 2)
            .try_into()
            .map_err(|_| SendError::DataTooBig)?;

        let mut packet = Vec::with_capacity(header.len() + data.len() + 4);
        packet.extend_from_slice(&total.to_be_bytes());
        packet.extend_from_slice(&header);
        packet.extend_from_slice(data);
        let crc = CRC16.checksum(&packet[2..]);
        packet.extend_from_slice(&crc.to_be_bytes());

        for (i, chunk) in packet.chunks(RAW_BYTES_PER_FRAME).enumerate() {
            let marker = if i == 0 { FRAME_START } else { FRAME_CONT };
            self.io.write_all(&marker)?;
            self.io.write_all(BASE64.encode(chunk).as_bytes())?;
            self.io.write_all(b"\n")?;
        }
        self.io.flush()?;

        Ok(())
    }

    fn recv_raw_frame<'a>(
        &mut self,
        buffer: &'a mut [u8; SMP_TRANSFER_BUFFER_SIZE],
    ) -> Result<&'a [u8], ReceiveError> {
        // Skip everything up to the next packet start; the console is shared
        // with the device's log output.
        let mut packet = loop {
            let line = self.read_line()?;
            if line.len() >= 2 && line[..2] == FRAME_START {
                break BASE64.decode(&line[2..])?;
            }
            log::trace!("skipping non-SMP console line ({} bytes)", line.len());
        };

        if packet.len() < 2 {
            return Err(ReceiveError::UnexpectedResponse);
        }
        // length field counts data + crc
        let total = u16::from_be_bytes([packet[0], packet[1]]) as usize;
        if total < 2 {
            return Err(ReceiveError::UnexpectedResponse);
        }

        while packet.len() < total + 2 {
            let line = self.read_line()?;
            if line.len() < 2 || line[..2] != FRAME_CONT {
                return Err(ReceiveError::UnexpectedResponse);
            }
            packet.extend(BASE64.decode(&line[2..])?);
        }
        if packet.len() != total + 2 {
            return Err(ReceiveError::UnexpectedResponse);
        }

        let (data, crc_bytes) = packet[2..].split_at(total - 2);
        let expected_crc = u16::from_be_bytes([crc_bytes[0], crc_bytes[1]]);
        if CRC16.checksum(data) != expected_crc {
            return Err(ReceiveError::ChecksumMismatch);
        }

        buffer[..data.len()].copy_from_slice(data);
        Ok(&buffer[..data.len()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Loopback {
        data: Vec<u8>,
        read_pos: usize,
    }

    impl Write for Loopback {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.data.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Read for Loopback {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let available = &self.data[self.read_pos..];
            let n = available.len().min(buf.len());
            buf[..n].copy_from_slice(&available[..n]);
            self.read_pos += n;
            Ok(n)
        }
    }

    const HEADER: [u8; 8] = [1, 0, 0, 4, 0, 1, 42, 1];

    #[test]
    fn roundtrip_single_frame() {
        let mut transport = SerialTransport::new(Loopback::default());
        transport.send_raw_frame(HEADER, &[0xAA, 0xBB, 0xCC, 0xDD]).unwrap();

        let mut buffer = [0u8; SMP_TRANSFER_BUFFER_SIZE];
        let frame = transport.recv_raw_frame(&mut buffer).unwrap();
        assert_eq!(&frame[..8], &HEADER);
        assert_eq!(&frame[8..], &[0xAA, 0xBB, 0xCC, 0xDD]);
    }

    #[test]
    fn roundtrip_multi_frame() {
        let data: Vec<u8> = (0..=255u8).cycle().take(400).collect();

        let mut transport = SerialTransport::new(Loopback::default());
        transport.send_raw_frame(HEADER, &data).unwrap();

        // 412 raw bytes need five 93-byte frames
        let lines = transport.io.data.split(|&b| b == b'\n').count() - 1;
        assert_eq!(lines, 5);
        for line in transport.io.data.split(|&b| b == b'\n') {
            assert!(line.len() <= MAX_FRAME_SIZE);
        }

        let mut buffer = [0u8; SMP_TRANSFER_BUFFER_SIZE];
        let frame = transport.recv_raw_frame(&mut buffer).unwrap();
        assert_eq!(&frame[..8], &HEADER);
        assert_eq!(&frame[8..], data.as_slice());
    }

    #[test]
    fn skips_console_noise() {
        let mut transport = SerialTransport::new(Loopback::default());
        transport.io.data.extend_from_slice(b"[00:00:01.000] <inf> app: booted\n");
        transport.send_raw_frame(HEADER, &[1, 2, 3]).unwrap();

        let mut buffer = [0u8; SMP_TRANSFER_BUFFER_SIZE];
        let frame = transport.recv_raw_frame(&mut buffer).unwrap();
        assert_eq!(&frame[8..], &[1, 2, 3]);
    }

    #[test]
    fn detects_corruption() {
        let mut transport = SerialTransport::new(Loopback::default());
        transport.send_raw_frame(HEADER, &[1, 2, 3]).unwrap();

        // flip one base64 character well inside the payload
        let target = 12;
        transport.io.data[target] = if transport.io.data[target] == b'A' {
            b'B'
        } else {
            b'A'
        };

        let mut buffer = [0u8; SMP_TRANSFER_BUFFER_SIZE];
        let result = transport.recv_raw_frame(&mut buffer);
        assert!(matches!(result, Err(ReceiveError::ChecksumMismatch)));
    }

    #[test]
    fn closed_channel_is_an_error() {
        let mut transport = SerialTransport::new(Loopback::default());
        let mut buffer = [0u8; SMP_TRANSFER_BUFFER_SIZE];
        assert!(matches!(
            transport.recv_raw_frame(&mut buffer),
            Err(ReceiveError::TransportError(_))
        ));
    }
}
