//! Helper macros for command definitions.

/// Implements [`serde::Serialize`] for a request without payload fields.
///
/// SMP expects such requests to carry an empty CBOR map.
macro_rules! impl_serialize_as_empty_map {
    ($name:ty) => {
        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                use serde::ser::SerializeMap;
                serializer.serialize_map(Some(0))?.end()
            }
        }
    };
}
pub(crate) use impl_serialize_as_empty_map;

/// Implements [`serde::Deserialize`] for a response without payload fields.
///
/// Accepts any map and discards its entries; devices are allowed to add
/// fields we do not know about.
macro_rules! impl_deserialize_from_empty_map {
    ($name:ty) => {
        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                struct MapVisitor;

                impl<'de> serde::de::Visitor<'de> for MapVisitor {
                    type Value = $name;

                    fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                        f.write_str("a map")
                    }

                    fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
                    where
                        A: serde::de::MapAccess<'de>,
                    {
                        while map
                            .next_entry::<serde::de::IgnoredAny, serde::de::IgnoredAny>()?
                            .is_some()
                        {}
                        Ok(<$name>::default())
                    }
                }

                deserializer.deserialize_map(MapVisitor)
            }
        }
    };
}
pub(crate) use impl_deserialize_from_empty_map;

/// Registers a request/response pair as an MCUmgr command.
macro_rules! impl_mcumgr_command {
    ((read, $group:ident, $command:literal): $request:ty => $response:ty) => {
        impl crate::commands::McuMgrCommand for $request {
            type Response = $response;
            const WRITE_OPERATION: bool = false;
            const GROUP_ID: u16 = crate::McuMgrGroup::$group as u16;
            const COMMAND_ID: u8 = $command;
        }
    };
    ((write, $group:ident, $command:literal): $request:ty => $response:ty) => {
        impl crate::commands::McuMgrCommand for $request {
            type Response = $response;
            const WRITE_OPERATION: bool = true;
            const GROUP_ID: u16 = crate::McuMgrGroup::$group as u16;
            const COMMAND_ID: u8 = $command;
        }
    };
}
pub(crate) use impl_mcumgr_command;

/// Generates a test that checks a command's header constants, its CBOR
/// encoding and the decoding of a device response.
#[cfg(test)]
macro_rules! command_encode_decode_test {
    (
        $name:ident,
        ($op:expr, $group:expr, $command:expr),
        $request:expr,
        $request_cbor:expr,
        $response_cbor:expr,
        $response:expr $(,)?
    ) => {
        #[test]
        fn $name() {
            use crate::commands::McuMgrCommand;

            fn header_of<C: McuMgrCommand>(_: &C) -> (u8, u16, u8) {
                (
                    if C::WRITE_OPERATION { 2 } else { 0 },
                    C::GROUP_ID,
                    C::COMMAND_ID,
                )
            }

            fn decode_response_of<C: McuMgrCommand>(_: &C, data: &[u8]) -> C::Response {
                ciborium::from_reader(data).expect("response must decode")
            }

            let request = $request;
            assert_eq!(header_of(&request), ($op, $group, $command));

            let mut encoded = vec![];
            ciborium::into_writer(&request, &mut encoded).unwrap();
            let encoded_value: ciborium::Value =
                ciborium::from_reader(encoded.as_slice()).unwrap();
            assert_eq!(encoded_value, $request_cbor.unwrap());

            let mut response_data = vec![];
            ciborium::into_writer(&$response_cbor.unwrap(), &mut response_data).unwrap();
            let decoded = decode_response_of(&request, response_data.as_slice());
            assert_eq!(decoded, $response);
        }
    };
}
#[cfg(test)]
pub(crate) use command_encode_decode_test;
