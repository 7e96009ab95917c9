#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use crate::address::derive_address;
    use crate::channel::{decrypt, encrypt, ChannelError};
    use crate::hd::{DerivationPath, HARDENED_OFFSET};
    use crate::keys::SharedSecret;
    use crate::transcript::Transcript;

    proptest! {
        #[test]
        fn test_transcript_determinism(
            tag1 in any::<u32>(),
            data1 in any::<Vec<u8>>(),
            tag2 in any::<u32>(),
            data2 in any::<Vec<u8>>()
        ) {
            let mut t1 = Transcript::new("test");
            t1.append_bytes(tag1, &data1).append_bytes(tag2, &data2);
            let mut t2 = Transcript::new("test");
            t2.append_bytes(tag1, &data1).append_bytes(tag2, &data2);

            prop_assert_eq!(t1.finalize(), t2.finalize());
        }

        #[test]
        fn test_channel_round_trip(
            key in any::<[u8; 32]>(),
            plaintext in prop::collection::vec(any::<u8>(), 0..2048)
        ) {
            let key = SharedSecret::from_bytes(key);
            let env = encrypt(&plaintext, &key).unwrap();
            prop_assert_eq!(decrypt(&env, &key).unwrap(), plaintext);
        }

        #[test]
        fn test_any_bit_flip_is_detected(
            key in any::<[u8; 32]>(),
            plaintext in prop::collection::vec(any::<u8>(), 0..256),
            bit in any::<prop::sample::Index>()
        ) {
            let key = SharedSecret::from_bytes(key);
            let mut env = encrypt(&plaintext, &key).unwrap();
            let i = bit.index(env.len() * 8);
            env[i / 8] ^= 1 << (i % 8);

            match decrypt(&env, &key) {
                Err(ChannelError::ChecksumMismatch) | Err(ChannelError::DecryptionFailed) => {}
                other => prop_assert!(false, "bit flip at {} not detected: {:?}", i, other),
            }
        }

        #[test]
        fn test_address_derivation_is_pure(
            seed in prop::collection::vec(any::<u8>(), 16..=64),
            account in 0u32..1000,
            index in 0u32..1000
        ) {
            let path = DerivationPath::new(vec![
                44 + HARDENED_OFFSET,
                60 + HARDENED_OFFSET,
                account + HARDENED_OFFSET,
                0,
                index,
            ]);
            prop_assert_eq!(derive_address(&path, &seed), derive_address(&path, &seed));
        }
    }
}
