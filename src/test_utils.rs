//! Fixtures shared by the unit tests.

/// Helpers shared across test modules.
pub mod serde {
    use std::fmt::Debug;

    /// Assert that a value survives a serde_json round-trip using structural equality.
    pub fn assert_round_trip_eq<T>(value: &T) -> T
    where
        T: ::serde::Serialize + ::serde::de::DeserializeOwned + PartialEq + Debug,
    {
        let json = serde_json::to_string(value)
            .expect("serialization should succeed during round-trip testing");
        let restored: T = serde_json::from_str(&json)
            .expect("deserialization should succeed during round-trip testing");
        assert_eq!(restored, *value, "serde_json round-trip altered the value");
        restored
    }

    /// Assert that serde_json emits the same payload before and after round-tripping.
    pub fn assert_round_trip_json<T>(value: &T)
    where
        T: ::serde::Serialize + ::serde::de::DeserializeOwned,
    {
        let json = serde_json::to_value(value)
            .expect("serialization to value should succeed during round-trip testing");
        let restored: T = serde_json::from_value(json.clone())
            .expect("deserialization from value should succeed during round-trip testing");
        let json_after = serde_json::to_value(restored)
            .expect("re-serialization should succeed during round-trip testing");
        assert_eq!(
            json_after, json,
            "serde_json round-trip altered the payload"
        );
    }
}

/// Key pairs generated once per test binary from fixed seeds.
pub mod keys {
    use std::sync::Arc;

    use once_cell::sync::Lazy;
    use rand::{rngs::StdRng, SeedableRng};

    use crate::elgamal::{generate_keypair, KeyGenParams, PrivateKey, PublicKey};

    pub type KeyPair = (Arc<PublicKey>, Arc<PrivateKey>);

    fn seeded_keypair(bits: u64, seed: u64) -> KeyPair {
        let mut rng = StdRng::seed_from_u64(seed);
        let (pk, sk) = generate_keypair(&KeyGenParams::new(bits), &mut rng)
            .expect("fixture key generation should succeed");
        (Arc::new(pk), Arc::new(sk))
    }

    static SMALL: Lazy<KeyPair> = Lazy::new(|| seeded_keypair(128, 0x5eed_0001));
    static OTHER_SMALL: Lazy<KeyPair> = Lazy::new(|| seeded_keypair(128, 0x5eed_0002));
    static STANDARD: Lazy<KeyPair> = Lazy::new(|| seeded_keypair(256, 0x5eed_0003));

    /// 128-bit keys, fast enough for most tests.
    pub fn small_keys() -> KeyPair {
        SMALL.clone()
    }

    /// A second unrelated 128-bit key pair.
    pub fn other_small_keys() -> KeyPair {
        OTHER_SMALL.clone()
    }

    pub fn standard_keys() -> KeyPair {
        STANDARD.clone()
    }
}
