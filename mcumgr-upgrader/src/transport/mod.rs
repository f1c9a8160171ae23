use std::io;

use miette::Diagnostic;
use thiserror::Error;

mod serial;
pub use serial::SerialTransport;

#[derive(Debug, PartialEq, Clone, Copy)]
struct SmpHeader {
    ver: u8,
    op: u8,
    flags: u8,
    data_length: u16,
    group_id: u16,
    sequence_num: u8,
    command_id: u8,
}

impl SmpHeader {
    fn from_bytes(data: [u8; SMP_HEADER_SIZE]) -> Self {
        Self {
            ver: (data[0] >> 3) & 0b11,
            op: data[0] & 0b111,
            flags: data[1],
            data_length: u16::from_be_bytes([data[2], data[3]]),
            group_id: u16::from_be_bytes([data[4], data[5]]),
            sequence_num: data[6],
            command_id: data[7],
        }
    }
    fn to_bytes(self) -> [u8; SMP_HEADER_SIZE] {
        let [length_0, length_1] = self.data_length.to_be_bytes();
        let [group_id_0, group_id_1] = self.group_id.to_be_bytes();
        [
            ((self.ver & 0b11) << 3) | (self.op & 0b111),
            self.flags,
            length_0,
            length_1,
            group_id_0,
            group_id_1,
            self.sequence_num,
            self.command_id,
        ]
    }
}

const SMP_HEADER_SIZE: usize = 8;

/// Size of the buffer used for frame transfers.
///
/// No SMP frame can exceed this, the header length field is 16 bit.
pub const SMP_TRANSFER_BUFFER_SIZE: usize = u16::MAX as usize;

mod smp_op {
    pub(super) const READ: u8 = 0;
    pub(super) const READ_RSP: u8 = 1;
    pub(super) const WRITE: u8 = 2;
    pub(super) const WRITE_RSP: u8 = 3;
}

/// Errors that can happen while sending an SMP frame
#[derive(Error, Debug, Diagnostic)]
pub enum SendError {
    /// An I/O error on the underlying channel
    #[error("transport error")]
    #[diagnostic(code(mcumgr_upgrader::transport::send::transport))]
    TransportError(#[from] io::Error),
    /// The frame payload does not fit into the 16 bit length field
    #[error("given data slice was too big")]
    #[diagnostic(code(mcumgr_upgrader::transport::send::too_big))]
    DataTooBig,
}

/// Errors that can happen while receiving an SMP frame
#[derive(Error, Debug, Diagnostic)]
pub enum ReceiveError {
    /// An I/O error on the underlying channel
    #[error("transport error")]
    #[diagnostic(code(mcumgr_upgrader::transport::recv::transport))]
    TransportError(#[from] io::Error),
    /// The received frame does not match the request
    #[error("received unexpected response")]
    #[diagnostic(code(mcumgr_upgrader::transport::recv::unexpected))]
    UnexpectedResponse,
    /// The received frame is not valid base64
    #[error("received frame with invalid base64 encoding")]
    #[diagnostic(code(mcumgr_upgrader::transport::recv::base64))]
    Base64DecodeError(#[from] base64::DecodeError),
    /// The received frame failed its checksum
    #[error("received frame with invalid checksum")]
    #[diagnostic(code(mcumgr_upgrader::transport::recv::checksum))]
    ChecksumMismatch,
}

/// A channel that can carry SMP frames.
///
/// Implementors only provide raw frame delivery; request/response matching
/// happens in the provided methods and in
/// [`Connection`](crate::connection::Connection).
pub trait Transport {
    /// Sends a single raw frame.
    fn send_raw_frame(
        &mut self,
        header: [u8; SMP_HEADER_SIZE],
        data: &[u8],
    ) -> Result<(), SendError>;

    /// Receives a single raw frame into `buffer`.
    fn recv_raw_frame<'a>(
        &mut self,
        buffer: &'a mut [u8; SMP_TRANSFER_BUFFER_SIZE],
    ) -> Result<&'a [u8], ReceiveError>;

    /// Sends an SMP request frame.
    fn send_frame(
        &mut self,
        write_operation: bool,
        sequence_num: u8,
        group_id: u16,
        command_id: u8,
        data: &[u8],
    ) -> Result<(), SendError> {
        let header = SmpHeader {
            ver: 0b01,
            op: if write_operation {
                smp_op::WRITE
            } else {
                smp_op::READ
            },
            flags: 0,
            data_length: data.len().try_into().map_err(|_| SendError::DataTooBig)?,
            group_id,
            sequence_num,
            command_id,
        };

        self.send_raw_frame(header.to_bytes(), data)
    }

    /// Receives the SMP response frame matching the given request header.
    fn receive_frame<'a>(
        &mut self,
        buffer: &'a mut [u8; SMP_TRANSFER_BUFFER_SIZE],
        write_operation: bool,
        sequence_num: u8,
        group_id: u16,
        command_id: u8,
    ) -> Result<&'a [u8], ReceiveError> {
        let data_size = loop {
            let frame = self.recv_raw_frame(buffer)?;

            let (header_data, data) = frame
                .split_first_chunk::<SMP_HEADER_SIZE>()
                .ok_or(ReceiveError::UnexpectedResponse)?;

            let header = SmpHeader::from_bytes(*header_data);

            let expected_op = if write_operation {
                smp_op::WRITE_RSP
            } else {
                smp_op::READ_RSP
            };

            // Frames with a foreign sequence number are not an error, they
            // belong to an abandoned exchange and are skipped silently.
            if header.sequence_num != sequence_num {
                continue;
            }

            if (header.group_id != group_id)
                || (header.command_id != command_id)
                || (header.op != expected_op)
                || (usize::from(header.data_length) != data.len())
            {
                return Err(ReceiveError::UnexpectedResponse);
            }

            break data.len();
        };

        Ok(&buffer[SMP_HEADER_SIZE..SMP_HEADER_SIZE + data_size])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let header = SmpHeader {
            ver: 0b01,
            op: smp_op::WRITE,
            flags: 0,
            data_length: 517,
            group_id: 63,
            sequence_num: 42,
            command_id: 1,
        };

        assert_eq!(SmpHeader::from_bytes(header.to_bytes()), header);
    }

    #[test]
    fn header_layout() {
        let header = SmpHeader {
            ver: 0b01,
            op: smp_op::READ,
            flags: 0,
            data_length: 0x0102,
            group_id: 0x0304,
            sequence_num: 5,
            command_id: 6,
        };

        assert_eq!(
            header.to_bytes(),
            [0b0000_1000, 0, 0x01, 0x02, 0x03, 0x04, 5, 6]
        );
    }
}
