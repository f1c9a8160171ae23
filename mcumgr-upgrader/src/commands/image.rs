use serde::{Deserialize, Serialize};

use crate::commands::{CountingWriter, data_too_large_error, macros::impl_serialize_as_empty_map};

/// The reported state of one image slot
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct SlotState {
    /// image number (the core, on multi-core devices)
    #[serde(default)]
    pub image: u32,
    /// slot number within the image; 0 is the slot the device runs from,
    /// 1 is the staging slot
    pub slot: u32,
    /// string representing the image version, as set with `imgtool`
    pub version: String,
    /// hash from the MCUboot TLV section
    ///
    /// This is the hash MCUboot uses for signature verification, not a hash
    /// of the file as a whole.
    pub hash: Option<[u8; 32]>,
    /// true if the image has the bootable flag set
    #[serde(default)]
    pub bootable: bool,
    /// true if the image is set for the next swap
    #[serde(default)]
    pub pending: bool,
    /// true if the image has been confirmed
    #[serde(default)]
    pub confirmed: bool,
    /// true if the image is the currently active application
    #[serde(default)]
    pub active: bool,
    /// true if the image stays in the primary slot after the next boot
    #[serde(default)]
    pub permanent: bool,
}

/// [Get Image State](https://docs.zephyrproject.org/latest/services/device_mgmt/smp_groups/smp_group_1.html#get-state-of-images-request) command
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GetImageState;
impl_serialize_as_empty_map!(GetImageState);

/// Response for the [`GetImageState`] and [`SetImageState`] commands
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct ImageStateResponse {
    /// List of all slots and their state
    pub images: Vec<SlotState>,
    // splitStatus is not decoded, Zephyr does not use it
}

/// [Set Image State](https://docs.zephyrproject.org/latest/services/device_mgmt/smp_groups/smp_group_1.html#set-state-of-image-request) command
///
/// With `confirm == false` this marks the image with the given hash for a
/// test boot (reverted on the next reset unless confirmed). With
/// `confirm == true` it makes the image permanent; the hash may then be
/// omitted to confirm whatever is currently running.
#[derive(Clone, Debug, Serialize, Eq, PartialEq)]
pub struct SetImageState<'a> {
    /// hash from the MCUboot TLV section of the target image
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(with = "serde_bytes")]
    pub hash: Option<&'a [u8; 32]>,
    /// confirm instead of test
    pub confirm: bool,
}

/// [Image Upload](https://docs.zephyrproject.org/latest/services/device_mgmt/smp_groups/smp_group_1.html#image-upload) command
///
/// One chunk of an image upload session. `image`, `len` and `sha` are only
/// carried by the chunk with `off == 0`.
#[derive(Clone, Debug, Serialize, Eq, PartialEq)]
pub struct ImageUpload<'a, 'b> {
    /// image number; absent means 0
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<u32>,
    /// total length of the image
    #[serde(skip_serializing_if = "Option::is_none")]
    pub len: Option<u64>,
    /// offset of the chunk this request carries
    pub off: u64,
    /// SHA256 over the whole file, identifying the upload session
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(with = "serde_bytes")]
    pub sha: Option<&'a [u8; 32]>,
    /// image data to write at the given offset
    #[serde(with = "serde_bytes")]
    pub data: &'b [u8],
    /// reject the upload if it is not a version upgrade
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upgrade: Option<bool>,
}

/// Response for the [`ImageUpload`] command
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct ImageUploadResponse {
    /// offset the device expects next
    pub off: u64,
    /// whether the uploaded data matched the session SHA256, reported with
    /// the final chunk
    pub r#match: Option<bool>,
}

/// Computes how many data bytes an [`ImageUpload`] chunk may carry so that
/// the encoded request fits into `smp_frame_size` bytes.
///
/// The computation assumes worst-case CBOR overhead (all optional fields
/// present, maximum integer widths), so the result is valid for every chunk
/// of a session.
pub fn upload_chunk_capacity(smp_frame_size: usize) -> std::io::Result<usize> {
    const MGMT_HDR_SIZE: usize = 8; // SMP header

    let mut size_counter = CountingWriter::new();
    ciborium::into_writer(
        &ImageUpload {
            image: Some(u32::MAX),
            len: Some(u64::MAX),
            off: u64::MAX,
            sha: Some(&[42; 32]),
            data: &[0u8],
            upgrade: Some(true),
        },
        &mut size_counter,
    )
    .map_err(|_| data_too_large_error())?;

    let size_with_one_byte = size_counter.bytes_written;
    let size_without_data = size_with_one_byte - 1;

    let estimated_data_size = smp_frame_size
        .checked_sub(MGMT_HDR_SIZE)
        .ok_or_else(data_too_large_error)?
        .checked_sub(size_without_data)
        .ok_or_else(data_too_large_error)?;

    let data_length_bytes: usize = if estimated_data_size == 0 {
        return Err(data_too_large_error());
    } else if estimated_data_size <= u8::MAX as usize {
        1
    } else if estimated_data_size <= u16::MAX as usize {
        2
    } else if estimated_data_size <= u32::MAX as usize {
        4
    } else {
        8
    };

    // the data length entry shrinks the available space again
    let actual_data_size = estimated_data_size
        .checked_sub(data_length_bytes)
        .ok_or_else(data_too_large_error)?;

    if actual_data_size == 0 {
        return Err(data_too_large_error());
    }

    Ok(actual_data_size)
}

#[cfg(test)]
mod tests {
    use super::super::macros::command_encode_decode_test;
    use super::*;
    use ciborium::cbor;

    command_encode_decode_test! {
        get_image_state,
        (0, 1, 0),
        GetImageState,
        cbor!({}),
        cbor!({
            "images" => [
                {
                    "image" => 1,
                    "slot" => 0,
                    "version" => "2.0.1",
                    "hash" => ciborium::Value::Bytes(vec![7; 32]),
                    "bootable" => true,
                    "pending" => false,
                    "confirmed" => true,
                    "active" => true,
                    "permanent" => false,
                },
                {
                    "slot" => 1,
                    "version" => "2.1.0",
                },
            ],
            "splitStatus" => 0,
        }),
        ImageStateResponse {
            images: vec![
                SlotState {
                    image: 1,
                    slot: 0,
                    version: "2.0.1".to_string(),
                    hash: Some([7; 32]),
                    bootable: true,
                    pending: false,
                    confirmed: true,
                    active: true,
                    permanent: false,
                },
                SlotState {
                    image: 0,
                    slot: 1,
                    version: "2.1.0".to_string(),
                    hash: None,
                    bootable: false,
                    pending: false,
                    confirmed: false,
                    active: false,
                    permanent: false,
                },
            ],
        },
    }

    command_encode_decode_test! {
        set_image_state_test,
        (2, 1, 0),
        SetImageState {
            hash: Some(&[3; 32]),
            confirm: false,
        },
        cbor!({
            "hash" => ciborium::Value::Bytes(vec![3; 32]),
            "confirm" => false,
        }),
        cbor!({
            "images" => [],
        }),
        ImageStateResponse { images: vec![] },
    }

    command_encode_decode_test! {
        set_image_state_confirm_running,
        (2, 1, 0),
        SetImageState {
            hash: None,
            confirm: true,
        },
        cbor!({
            "confirm" => true,
        }),
        cbor!({
            "images" => [],
        }),
        ImageStateResponse { images: vec![] },
    }

    command_encode_decode_test! {
        image_upload_first_chunk,
        (2, 1, 1),
        ImageUpload {
            image: Some(1),
            len: Some(4096),
            off: 0,
            sha: Some(&[9; 32]),
            data: &[1, 2, 3, 4],
            upgrade: None,
        },
        cbor!({
            "image" => 1,
            "len" => 4096,
            "off" => 0,
            "sha" => ciborium::Value::Bytes(vec![9; 32]),
            "data" => ciborium::Value::Bytes(vec![1, 2, 3, 4]),
        }),
        cbor!({
            "off" => 4,
        }),
        ImageUploadResponse {
            off: 4,
            r#match: None,
        },
    }

    command_encode_decode_test! {
        image_upload_last_chunk,
        (2, 1, 1),
        ImageUpload {
            image: None,
            len: None,
            off: 4090,
            sha: None,
            data: &[5, 6, 7, 8, 9, 10],
            upgrade: None,
        },
        cbor!({
            "off" => 4090,
            "data" => ciborium::Value::Bytes(vec![5, 6, 7, 8, 9, 10]),
        }),
        cbor!({
            "off" => 4096,
            "match" => true,
        }),
        ImageUploadResponse {
            off: 4096,
            r#match: Some(true),
        },
    }

    #[test]
    fn upload_chunk_capacity_fills_the_frame() {
        for smp_frame_size in 120..4096 {
            let smp_payload_size = smp_frame_size - 8 /* SMP header */;

            let capacity = super::upload_chunk_capacity(smp_frame_size).unwrap();

            let chunk = ImageUpload {
                image: Some(u32::MAX),
                len: Some(u64::MAX),
                off: u64::MAX,
                sha: Some(&[u8::MAX; 32]),
                data: &vec![0; capacity],
                upgrade: Some(true),
            };

            let mut cbor_data = vec![];
            ciborium::into_writer(&chunk, &mut cbor_data).unwrap();

            assert!(
                smp_payload_size - 2 <= cbor_data.len() && cbor_data.len() <= smp_payload_size,
                "failed at frame size {}: actual={}, max={}",
                smp_frame_size,
                cbor_data.len(),
                smp_payload_size,
            );
        }
    }

    #[test]
    fn upload_chunk_capacity_rejects_tiny_frames() {
        for smp_frame_size in 0..100 {
            assert!(super::upload_chunk_capacity(smp_frame_size).is_err());
        }
    }
}
