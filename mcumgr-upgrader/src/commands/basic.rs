use crate::commands::macros::{impl_deserialize_from_empty_map, impl_serialize_as_empty_map};

/// [Erase Storage](https://docs.zephyrproject.org/latest/services/device_mgmt/smp_groups/smp_group_63.html#erase-storage-command) command
///
/// Wipes the application settings partition so the incoming firmware does
/// not inherit a stale settings schema. Devices without a storage partition
/// answer with a non-zero return code, which callers may treat as benign.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EraseAppSettings;
impl_serialize_as_empty_map!(EraseAppSettings);

/// Response for the [`EraseAppSettings`] command
#[derive(Clone, Default, Debug, Eq, PartialEq)]
pub struct EraseAppSettingsResponse;
impl_deserialize_from_empty_map!(EraseAppSettingsResponse);

#[cfg(test)]
mod tests {
    use super::super::macros::command_encode_decode_test;
    use super::*;
    use ciborium::cbor;

    command_encode_decode_test! {
        erase_app_settings,
        (2, 63, 0),
        EraseAppSettings,
        cbor!({}),
        cbor!({}),
        EraseAppSettingsResponse,
    }
}
