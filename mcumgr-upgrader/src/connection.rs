use std::{io::Cursor, marker::PhantomData};

use crate::{
    commands::{ErrResponse, ErrResponseV2, McuMgrCommand},
    smp_errors::DeviceError,
    transport::{ReceiveError, SMP_TRANSFER_BUFFER_SIZE, SendError, Transport},
};

use miette::Diagnostic;
use thiserror::Error;

/// An SMP protocol layer connection to a device.
///
/// Pairs requests with responses by sequence number and decodes the SMP
/// error map before handing out the typed response.
pub struct Connection {
    transport: Box<dyn Transport + Send>,
    next_seqnum: u8,
    transport_buffer: Box<[u8; SMP_TRANSFER_BUFFER_SIZE]>,
}

/// Errors that can happen on SMP protocol level
#[derive(Error, Debug, Diagnostic)]
pub enum ExecuteError {
    /// An error happened on SMP transport level while sending a request
    #[error("sending failed")]
    #[diagnostic(code(mcumgr_upgrader::connection::execute::send))]
    SendFailed(#[from] SendError),
    /// An error happened on SMP transport level while receiving a response
    #[error("receiving failed")]
    #[diagnostic(code(mcumgr_upgrader::connection::execute::receive))]
    ReceiveFailed(#[from] ReceiveError),
    /// An error happened while CBOR encoding the request payload
    #[error("cbor encoding failed")]
    #[diagnostic(code(mcumgr_upgrader::connection::execute::encode))]
    EncodeFailed,
    /// An error happened while CBOR decoding the response payload
    #[error("cbor decoding failed")]
    #[diagnostic(code(mcumgr_upgrader::connection::execute::decode))]
    DecodeFailed,
    /// The device returned an SMP error
    #[error("device returned error {0}")]
    #[diagnostic(code(mcumgr_upgrader::connection::execute::device_error))]
    ErrorResponse(DeviceError),
}

impl ExecuteError {
    /// The SMP v1 return code the device answered with, if any.
    pub fn device_rc(&self) -> Option<i32> {
        match self {
            ExecuteError::ErrorResponse(device_error) => device_error.v1_rc(),
            _ => None,
        }
    }
}

/// Receipt for a request sent through [`Connection::send_request`].
///
/// Carries everything needed to match and decode the response later, so
/// multiple requests can be in flight at once.
pub struct PendingResponse<T> {
    write_operation: bool,
    group_id: u16,
    command_id: u8,
    sequence_num: u8,
    _response: PhantomData<fn() -> T>,
}

impl Connection {
    /// Creates a new SMP connection over the given transport.
    pub fn new<T: Transport + Send + 'static>(transport: T) -> Self {
        Self {
            transport: Box::new(transport),
            next_seqnum: rand::random(),
            transport_buffer: Box::new([0; SMP_TRANSFER_BUFFER_SIZE]),
        }
    }

    /// Sends a request without waiting for its response.
    pub fn send_request<R: McuMgrCommand>(
        &mut self,
        request: &R,
    ) -> Result<PendingResponse<R::Response>, ExecuteError> {
        let mut cursor = Cursor::new(self.transport_buffer.as_mut_slice());
        ciborium::into_writer(request, &mut cursor).map_err(|_| ExecuteError::EncodeFailed)?;
        let data_size = cursor.position() as usize;
        let data = &self.transport_buffer[..data_size];

        log::debug!(
            "TX data: {}",
            data.iter().map(|e| format!("{e:02x}")).collect::<String>()
        );

        let sequence_num = self.next_seqnum;
        self.next_seqnum = self.next_seqnum.wrapping_add(1);

        self.transport.send_frame(
            R::WRITE_OPERATION,
            sequence_num,
            R::GROUP_ID,
            R::COMMAND_ID,
            data,
        )?;

        Ok(PendingResponse {
            write_operation: R::WRITE_OPERATION,
            group_id: R::GROUP_ID,
            command_id: R::COMMAND_ID,
            sequence_num,
            _response: PhantomData,
        })
    }

    /// Receives and decodes the response for a previously sent request.
    pub fn receive_response<T: for<'a> serde::Deserialize<'a>>(
        &mut self,
        pending: &PendingResponse<T>,
    ) -> Result<T, ExecuteError> {
        let response = self.transport.receive_frame(
            &mut self.transport_buffer,
            pending.write_operation,
            pending.sequence_num,
            pending.group_id,
            pending.command_id,
        )?;

        log::debug!(
            "RX data: {}",
            response
                .iter()
                .map(|e| format!("{e:02x}"))
                .collect::<String>()
        );

        let err: ErrResponse =
            ciborium::from_reader(Cursor::new(response)).map_err(|_| ExecuteError::DecodeFailed)?;

        if let Some(ErrResponseV2 { rc, group }) = err.err {
            return Err(ExecuteError::ErrorResponse(DeviceError::V2 { group, rc }));
        }

        // Some firmware includes "rc": 0 in successful responses.
        if let Some(rc) = err.rc {
            if rc != 0 {
                return Err(ExecuteError::ErrorResponse(DeviceError::V1 { rc }));
            }
        }

        let decoded_response: T =
            ciborium::from_reader(Cursor::new(response)).map_err(|_| ExecuteError::DecodeFailed)?;

        Ok(decoded_response)
    }

    /// Executes a given CBOR based SMP command.
    pub fn execute_command<R: McuMgrCommand>(
        &mut self,
        request: &R,
    ) -> Result<R::Response, ExecuteError> {
        let pending = self.send_request(request)?;
        self.receive_response(&pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::os::{McuMgrParameters, McuMgrParametersResponse};
    use ciborium::cbor;

    /// A transport that answers every request with a canned CBOR payload,
    /// echoing the request's header fields.
    struct CannedTransport {
        response: Vec<u8>,
        last_header: Option<[u8; 8]>,
    }

    impl CannedTransport {
        fn new(value: ciborium::Value) -> Self {
            let mut response = vec![];
            ciborium::into_writer(&value, &mut response).unwrap();
            Self {
                response,
                last_header: None,
            }
        }
    }

    impl Transport for CannedTransport {
        fn send_raw_frame(&mut self, header: [u8; 8], _data: &[u8]) -> Result<(), SendError> {
            self.last_header = Some(header);
            Ok(())
        }

        fn recv_raw_frame<'a>(
            &mut self,
            buffer: &'a mut [u8; SMP_TRANSFER_BUFFER_SIZE],
        ) -> Result<&'a [u8], ReceiveError> {
            let header = self.last_header.expect("request must be sent first");
            let mut frame = vec![
                header[0] | 1, // response op
                header[1],
                0,
                0,
                header[4],
                header[5],
                header[6],
                header[7],
            ];
            let [len_0, len_1] = (self.response.len() as u16).to_be_bytes();
            frame[2] = len_0;
            frame[3] = len_1;
            frame.extend_from_slice(&self.response);

            buffer[..frame.len()].copy_from_slice(&frame);
            Ok(&buffer[..frame.len()])
        }
    }

    #[test]
    fn decodes_typed_response() {
        let mut connection = Connection::new(CannedTransport::new(
            cbor!({"buf_size" => 2048, "buf_count" => 4}).unwrap(),
        ));

        let response = connection.execute_command(&McuMgrParameters).unwrap();
        assert_eq!(
            response,
            McuMgrParametersResponse {
                buf_size: 2048,
                buf_count: 4
            }
        );
    }

    #[test]
    fn decodes_v1_error() {
        let mut connection =
            Connection::new(CannedTransport::new(cbor!({"rc" => 8}).unwrap()));

        let result = connection.execute_command(&McuMgrParameters);
        assert!(matches!(
            result,
            Err(ExecuteError::ErrorResponse(DeviceError::V1 { rc: 8 }))
        ));
    }

    #[test]
    fn rc_zero_is_success() {
        let mut connection = Connection::new(CannedTransport::new(
            cbor!({"rc" => 0, "buf_size" => 512, "buf_count" => 2}).unwrap(),
        ));

        let response = connection.execute_command(&McuMgrParameters).unwrap();
        assert_eq!(response.buf_size, 512);
    }

    #[test]
    fn decodes_v2_error() {
        let mut connection = Connection::new(CannedTransport::new(
            cbor!({"err" => {"group" => 1, "rc" => 3}}).unwrap(),
        ));

        let result = connection.execute_command(&McuMgrParameters);
        assert!(matches!(
            result,
            Err(ExecuteError::ErrorResponse(DeviceError::V2 {
                group: 1,
                rc: 3
            }))
        ));
    }
}
