/// [Zephyr basic management](https://docs.zephyrproject.org/latest/services/device_mgmt/smp_groups/smp_group_63.html) group commands
pub mod basic;
/// [Application/software image management](https://docs.zephyrproject.org/latest/services/device_mgmt/smp_groups/smp_group_1.html) group commands
pub mod image;
/// [Default/OS management](https://docs.zephyrproject.org/latest/services/device_mgmt/smp_groups/smp_group_0.html) group commands
pub mod os;

mod macros;
use macros::impl_mcumgr_command;

use serde::{Deserialize, Serialize};

/// SMP version 2 group based error message
#[derive(Debug, Deserialize, Eq, PartialEq)]
pub struct ErrResponseV2 {
    /// group of the group-based error code
    pub group: u16,
    /// contains the index of the group-based error code
    pub rc: i32,
}

/// [SMP error message](https://docs.zephyrproject.org/latest/services/device_mgmt/smp_protocol.html#minimal-response-smp-data)
#[derive(Debug, Deserialize, Eq, PartialEq)]
pub struct ErrResponse {
    /// SMP version 1 error code
    pub rc: Option<i32>,
    /// SMP version 1 error string
    pub rsn: Option<String>,
    /// SMP version 2 error message
    pub err: Option<ErrResponseV2>,
}

/// An MCUmgr command that can be executed through [`Connection::execute_command`](crate::connection::Connection::execute_command).
pub trait McuMgrCommand: Serialize {
    /// the response type of the command
    type Response: for<'a> Deserialize<'a>;
    /// whether this command is a read or write operation
    const WRITE_OPERATION: bool;
    /// the group ID of the command
    const GROUP_ID: u16;
    /// the command ID
    const COMMAND_ID: u8;
}

/// Checks if a value is the default value
fn is_default<T: Default + PartialEq>(val: &T) -> bool {
    val == &T::default()
}

/// A writer that only counts the bytes written to it.
///
/// Used to compute CBOR encoding overheads without allocating.
pub(crate) struct CountingWriter {
    pub(crate) bytes_written: usize,
}

impl CountingWriter {
    pub(crate) fn new() -> Self {
        Self { bytes_written: 0 }
    }
}

impl std::io::Write for CountingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.bytes_written += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

pub(crate) fn data_too_large_error() -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::InvalidInput,
        "frame size too small to carry an upload chunk",
    )
}

impl_mcumgr_command!((write, MGMT_GROUP_ID_OS, 5): os::SystemReset => os::SystemResetResponse);
impl_mcumgr_command!((read,  MGMT_GROUP_ID_OS, 6): os::McuMgrParameters => os::McuMgrParametersResponse);

impl_mcumgr_command!((read,  MGMT_GROUP_ID_IMAGE, 0): image::GetImageState => image::ImageStateResponse);
impl_mcumgr_command!((write, MGMT_GROUP_ID_IMAGE, 0): image::SetImageState<'_> => image::ImageStateResponse);
impl_mcumgr_command!((write, MGMT_GROUP_ID_IMAGE, 1): image::ImageUpload<'_, '_> => image::ImageUploadResponse);

impl_mcumgr_command!((write, ZEPHYR_MGMT_GRP_BASIC, 0): basic::EraseAppSettings => basic::EraseAppSettingsResponse);

#[cfg(test)]
mod tests {
    use super::*;
    use ciborium::cbor;

    #[test]
    fn decode_error_none() {
        let mut cbor_data = vec![];
        ciborium::into_writer(
            &cbor!({
                "foo" => 42,
            })
            .unwrap(),
            &mut cbor_data,
        )
        .unwrap();
        let err: ErrResponse = ciborium::from_reader(cbor_data.as_slice()).unwrap();
        assert_eq!(
            err,
            ErrResponse {
                rc: None,
                rsn: None,
                err: None,
            }
        );
    }

    #[test]
    fn decode_error_v1() {
        let mut cbor_data = vec![];
        ciborium::into_writer(
            &cbor!({
                "rc" => 8,
            })
            .unwrap(),
            &mut cbor_data,
        )
        .unwrap();
        let err: ErrResponse = ciborium::from_reader(cbor_data.as_slice()).unwrap();
        assert_eq!(
            err,
            ErrResponse {
                rc: Some(8),
                rsn: None,
                err: None,
            }
        );
    }

    #[test]
    fn decode_error_v1_with_msg() {
        let mut cbor_data = vec![];
        ciborium::into_writer(
            &cbor!({
                "rc" => 1,
                "rsn" => "no can do",
            })
            .unwrap(),
            &mut cbor_data,
        )
        .unwrap();
        let err: ErrResponse = ciborium::from_reader(cbor_data.as_slice()).unwrap();
        assert_eq!(
            err,
            ErrResponse {
                rc: Some(1),
                rsn: Some("no can do".to_string()),
                err: None,
            }
        );
    }

    #[test]
    fn decode_error_v2() {
        let mut cbor_data = vec![];
        ciborium::into_writer(
            &cbor!({
                "err" => {
                    "group" => 1,
                    "rc" => 3,
                }
            })
            .unwrap(),
            &mut cbor_data,
        )
        .unwrap();
        let err: ErrResponse = ciborium::from_reader(cbor_data.as_slice()).unwrap();
        assert_eq!(
            err,
            ErrResponse {
                rc: None,
                rsn: None,
                err: Some(ErrResponseV2 { group: 1, rc: 3 })
            }
        );
    }

    #[test]
    fn is_default() {
        assert!(super::is_default(&0));
        assert!(!super::is_default(&5));
    }
}
