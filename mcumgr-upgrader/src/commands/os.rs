use serde::{Deserialize, Serialize};

use super::{
    is_default,
    macros::{impl_deserialize_from_empty_map, impl_serialize_as_empty_map},
};

/// [MCUmgr Parameters](https://docs.zephyrproject.org/latest/services/device_mgmt/smp_groups/smp_group_0.html#mcumgr-parameters) command
///
/// Older firmware does not know this command and answers with
/// `MGMT_ERR_ENOTSUP`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct McuMgrParameters;
impl_serialize_as_empty_map!(McuMgrParameters);

/// Response for the [`McuMgrParameters`] command
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct McuMgrParametersResponse {
    /// Single SMP buffer size, this includes SMP header and CBOR payload
    pub buf_size: u32,
    /// Number of SMP buffers supported
    pub buf_count: u32,
}

/// [System Reset](https://docs.zephyrproject.org/latest/services/device_mgmt/smp_groups/smp_group_0.html#system-reset) command
#[derive(Clone, Debug, Serialize, Eq, PartialEq)]
pub struct SystemReset {
    /// Forces reset even if the device is busy
    #[serde(skip_serializing_if = "is_default")]
    pub force: bool,
    /// Boot mode
    ///
    /// - 0: Normal boot
    /// - 1: Bootloader recovery mode
    ///
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boot_mode: Option<u8>,
}

/// Response for the [`SystemReset`] command
#[derive(Clone, Default, Debug, Eq, PartialEq)]
pub struct SystemResetResponse;
impl_deserialize_from_empty_map!(SystemResetResponse);
