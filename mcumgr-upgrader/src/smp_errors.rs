use strum_macros::{Display, FromRepr};

use crate::McuMgrGroup;

/// Errors the device can respond with when trying to execute an SMP command.
///
/// More information can be found [here](https://docs.zephyrproject.org/latest/services/device_mgmt/smp_protocol.html#minimal-response-smp-data).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DeviceError {
    /// MCUmgr SMP v1 error codes
    V1 {
        /// Error code
        rc: i32,
    },
    /// MCUmgr SMP v2 error codes
    V2 {
        /// Group id
        group: u16,
        /// Group based error code
        rc: i32,
    },
}

fn v2_err_to_string(group: u16, rc: i32) -> Option<String> {
    match McuMgrGroup::from_repr(group)? {
        McuMgrGroup::MGMT_GROUP_ID_OS => OsMgmtErrCode::from_repr(rc).map(|x| x.to_string()),
        McuMgrGroup::MGMT_GROUP_ID_IMAGE => ImgMgmtErrCode::from_repr(rc).map(|x| x.to_string()),
        McuMgrGroup::ZEPHYR_MGMT_GRP_BASIC => {
            BasicMgmtErrCode::from_repr(rc).map(|x| x.to_string())
        }
        _ => None,
    }
}

impl std::fmt::Display for DeviceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceError::V1 { rc } => {
                write!(f, "{}", McuMgrErr::err_to_string(*rc))
            }
            DeviceError::V2 { group, rc } => match v2_err_to_string(*group, *rc) {
                Some(msg) => f.write_str(&msg),
                None => write!(f, "group={group},rc={rc}"),
            },
        }
    }
}

impl DeviceError {
    /// The raw SMP v1 return code, if this is a v1 error.
    pub fn v1_rc(&self) -> Option<i32> {
        match self {
            DeviceError::V1 { rc } => Some(*rc),
            DeviceError::V2 { .. } => None,
        }
    }
}

/// See [`enum mcumgr_err_t`](https://docs.zephyrproject.org/latest/doxygen/html/mgmt__defines_8h.html).
#[derive(FromRepr, Display, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(i32)]
#[allow(non_camel_case_types)]
pub enum McuMgrErr {
    /** No error (success). */
    MGMT_ERR_EOK = 0,

    /** Unknown error. */
    MGMT_ERR_EUNKNOWN,

    /** Insufficient memory (likely not enough space for CBOR object). */
    MGMT_ERR_ENOMEM,

    /** Error in input value. */
    MGMT_ERR_EINVAL,

    /** Operation timed out. */
    MGMT_ERR_ETIMEOUT,

    /** No such file/entry. */
    MGMT_ERR_ENOENT,

    /** Current state disallows command. */
    MGMT_ERR_EBADSTATE,

    /** Response too large. */
    MGMT_ERR_EMSGSIZE,

    /** Command not supported. */
    MGMT_ERR_ENOTSUP,

    /** Corrupt */
    MGMT_ERR_ECORRUPT,

    /** Command blocked by processing of other command */
    MGMT_ERR_EBUSY,

    /** Access to specific function, command or resource denied */
    MGMT_ERR_EACCESSDENIED,

    /** Requested SMP MCUmgr protocol version is not supported (too old) */
    MGMT_ERR_UNSUPPORTED_TOO_OLD,

    /** Requested SMP MCUmgr protocol version is not supported (too new) */
    MGMT_ERR_UNSUPPORTED_TOO_NEW,

    /** User errors defined from 256 onwards */
    MGMT_ERR_EPERUSER = 256,
}

impl McuMgrErr {
    /// Converts a raw error code to a string
    pub fn err_to_string(err: i32) -> String {
        const PERUSER: McuMgrErr = McuMgrErr::MGMT_ERR_EPERUSER;
        if err < PERUSER as i32 {
            if let Some(err_enum) = Self::from_repr(err) {
                format!("{err_enum}")
            } else {
                format!("MGMT_ERR_UNKNOWN({err})")
            }
        } else {
            format!("{PERUSER}({err})")
        }
    }
}

/// See `enum img_mgmt_err_code_t`.
#[derive(FromRepr, Display, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(i32)]
#[allow(non_camel_case_types)]
pub enum ImgMgmtErrCode {
    /** No error, this is implied if there is no ret value in the response */
    IMG_MGMT_ERR_OK = 0,

    /** Unknown error occurred. */
    IMG_MGMT_ERR_UNKNOWN,

    /** Failed to query flash area configuration. */
    IMG_MGMT_ERR_FLASH_CONFIG_QUERY_FAIL,

    /** There is no image in the slot. */
    IMG_MGMT_ERR_NO_IMAGE,

    /** The image in the slot has no TLVs (tag, length, value). */
    IMG_MGMT_ERR_NO_TLVS,

    /** The image in the slot has an invalid TLV type and/or length. */
    IMG_MGMT_ERR_INVALID_TLV,

    /** The image in the slot has multiple hash TLVs, which is invalid. */
    IMG_MGMT_ERR_TLV_MULTIPLE_HASHES_FOUND,

    /** The image in the slot has an invalid TLV size. */
    IMG_MGMT_ERR_TLV_INVALID_SIZE,

    /** The image in the slot does not have a hash TLV, which is required.  */
    IMG_MGMT_ERR_HASH_NOT_FOUND,

    /** There is no free slot to place the image. */
    IMG_MGMT_ERR_NO_FREE_SLOT,

    /** Flash area opening failed. */
    IMG_MGMT_ERR_FLASH_OPEN_FAILED,

    /** Flash area reading failed. */
    IMG_MGMT_ERR_FLASH_READ_FAILED,

    /** Flash area writing failed. */
    IMG_MGMT_ERR_FLASH_WRITE_FAILED,

    /** Flash area erase failed. */
    IMG_MGMT_ERR_FLASH_ERASE_FAILED,

    /** The provided slot is not valid. */
    IMG_MGMT_ERR_INVALID_SLOT,

    /** Insufficient heap memory (malloc failed). */
    IMG_MGMT_ERR_NO_FREE_MEMORY,

    /** The flash context is already set. */
    IMG_MGMT_ERR_FLASH_CONTEXT_ALREADY_SET,

    /** The flash context is not set. */
    IMG_MGMT_ERR_FLASH_CONTEXT_NOT_SET,

    /** The device for the flash area is NULL. */
    IMG_MGMT_ERR_FLASH_AREA_DEVICE_NULL,

    /** The offset for a page number is invalid. */
    IMG_MGMT_ERR_INVALID_PAGE_OFFSET,

    /** The offset parameter was not provided and is required. */
    IMG_MGMT_ERR_INVALID_OFFSET,

    /** The length parameter was not provided and is required. */
    IMG_MGMT_ERR_INVALID_LENGTH,

    /** The image length is smaller than the size of an image header. */
    IMG_MGMT_ERR_INVALID_IMAGE_HEADER,

    /** The image header magic value does not match the expected value. */
    IMG_MGMT_ERR_INVALID_IMAGE_HEADER_MAGIC,

    /** The hash parameter provided is not valid. */
    IMG_MGMT_ERR_INVALID_HASH,

    /** The image load address does not match the address of the flash area. */
    IMG_MGMT_ERR_INVALID_FLASH_ADDRESS,

    /** Failed to get version of currently running application. */
    IMG_MGMT_ERR_VERSION_GET_FAILED,

    /** The currently running application is newer than the version being uploaded. */
    IMG_MGMT_ERR_CURRENT_VERSION_IS_NEWER,

    /** There is already an image operating pending. */
    IMG_MGMT_ERR_IMAGE_ALREADY_PENDING,

    /** The image vector table is invalid. */
    IMG_MGMT_ERR_INVALID_IMAGE_VECTOR_TABLE,

    /** The image it too large to fit. */
    IMG_MGMT_ERR_INVALID_IMAGE_TOO_LARGE,

    /** The amount of data sent is larger than the provided image size. */
    IMG_MGMT_ERR_INVALID_IMAGE_DATA_OVERRUN,

    /** Confirmation of image has been denied */
    IMG_MGMT_ERR_IMAGE_CONFIRMATION_DENIED,

    /** Setting test to active slot is not allowed */
    IMG_MGMT_ERR_IMAGE_SETTING_TEST_TO_ACTIVE_DENIED,

    /** Current active slot for image cannot be determined */
    IMG_MGMT_ERR_ACTIVE_SLOT_NOT_KNOWN,
}

/// See `enum os_mgmt_err_code_t`.
#[derive(FromRepr, Display, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(i32)]
#[allow(non_camel_case_types)]
pub enum OsMgmtErrCode {
    /** No error, this is implied if there is no ret value in the response */
    OS_MGMT_ERR_OK = 0,

    /** Unknown error occurred. */
    OS_MGMT_ERR_UNKNOWN,

    /** The provided format value is not valid. */
    OS_MGMT_ERR_INVALID_FORMAT,

    /** Query was not recognized. */
    OS_MGMT_ERR_QUERY_YIELDS_NO_ANSWER,

    /** RTC is not set */
    OS_MGMT_ERR_RTC_NOT_SET,

    /** RTC command failed */
    OS_MGMT_ERR_RTC_COMMAND_FAILED,

    /** Query was recognized but there is no valid value for the response. */
    OS_MGMT_ERR_QUERY_RESPONSE_VALUE_NOT_VALID,
}

/// See `enum zephyr_basic_group_err_code_t`.
#[derive(FromRepr, Display, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(i32)]
#[allow(non_camel_case_types)]
pub enum BasicMgmtErrCode {
    /** No error, this is implied if there is no ret value in the response */
    ZEPHYRBASIC_MGMT_ERR_OK = 0,

    /** Unknown error occurred. */
    ZEPHYRBASIC_MGMT_ERR_UNKNOWN,

    /** Opening of the flash area has failed. */
    ZEPHYRBASIC_MGMT_ERR_FLASH_OPEN_FAILED,

    /** Querying the flash area parameters has failed. */
    ZEPHYRBASIC_MGMT_ERR_FLASH_CONFIG_QUERY_FAIL,

    /** Erasing the flash area has failed. */
    ZEPHYRBASIC_MGMT_ERR_FLASH_ERASE_FAILED,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v1_display() {
        assert_eq!(
            DeviceError::V1 { rc: 8 }.to_string(),
            "MGMT_ERR_ENOTSUP"
        );
        assert_eq!(
            DeviceError::V1 { rc: 300 }.to_string(),
            "MGMT_ERR_EPERUSER(300)"
        );
        assert_eq!(
            DeviceError::V1 { rc: -1 }.to_string(),
            "MGMT_ERR_UNKNOWN(-1)"
        );
    }

    #[test]
    fn v2_display() {
        assert_eq!(
            DeviceError::V2 { group: 1, rc: 3 }.to_string(),
            "IMG_MGMT_ERR_NO_IMAGE"
        );
        assert_eq!(
            DeviceError::V2 { group: 63, rc: 4 }.to_string(),
            "ZEPHYRBASIC_MGMT_ERR_FLASH_ERASE_FAILED"
        );
        assert_eq!(
            DeviceError::V2 { group: 9, rc: 1 }.to_string(),
            "group=9,rc=1"
        );
    }

    #[test]
    fn v1_rc_accessor() {
        assert_eq!(DeviceError::V1 { rc: 5 }.v1_rc(), Some(5));
        assert_eq!(DeviceError::V2 { group: 0, rc: 5 }.v1_rc(), None);
    }
}
