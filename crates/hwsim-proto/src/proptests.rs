#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use prost::Message;

    use crate::frame::{decode_request, decode_response};
    use crate::v1::{GetAddressesRequestV1, KvRecordV1, SignRequestV1};

    prop_compose! {
        fn any_sign_request()(
            data in any::<Vec<u8>>(),
            path in prop::collection::vec(any::<u32>(), 0..6),
            schema in 0..2i32,
            curve in 0..2i32,
            encoding in 0..3i32,
            hash_type in 0..3i32,
        ) -> SignRequestV1 {
            SignRequestV1 { data, path, schema, curve, encoding, hash_type }
        }
    }

    proptest! {
        #[test]
        fn test_sign_request_survives_encoding(req in any_sign_request()) {
            let bytes = req.encode_to_vec();
            let decoded = SignRequestV1::decode(bytes.as_slice()).unwrap();
            prop_assert_eq!(decoded, req);
        }

        #[test]
        fn test_frame_decoding_never_panics(data in any::<Vec<u8>>()) {
            let _ = decode_request(&data);
            let _ = decode_response(&data);
        }

        #[test]
        fn test_body_decoding_never_panics(data in any::<Vec<u8>>()) {
            let _ = GetAddressesRequestV1::decode(data.as_slice());
            let _ = KvRecordV1::decode(data.as_slice());
        }
    }
}
