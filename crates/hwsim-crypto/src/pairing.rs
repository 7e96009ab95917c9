use k256::ecdsa::signature::{Signer, Verifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};

use crate::transcript::{tags, Transcript};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PairingError {
    #[error("invalid client public key")]
    InvalidPublicKey,
    #[error("malformed signature")]
    MalformedSignature,
    #[error("signature does not match transcript")]
    BadSignature,
}

/// Canonical bytes the client signs to finalize pairing:
/// client_pub || device_ephemeral_pub || app_name || pairing_secret
pub fn pairing_transcript_v1(
    client_pub: &[u8],
    device_ephemeral_pub: &[u8],
    app_name: &str,
    pairing_secret: &str,
) -> Vec<u8> {
    let mut t = Transcript::new("hwsim_pair_v1");

    // Tags are fixed and MUST NOT change once released.
    t.append_bytes(tags::CLIENT_PUB, client_pub);
    t.append_bytes(tags::DEVICE_PUB, device_ephemeral_pub);
    t.append_str(tags::APP_NAME, app_name);
    t.append_str(tags::SECRET, pairing_secret);

    t.as_bytes().to_vec()
}

/// Client side: ECDSA/secp256k1 over SHA-256 of the transcript, as `r || s`.
pub fn sign_pairing_transcript(client: &SigningKey, transcript: &[u8]) -> [u8; 64] {
    let sig: Signature = client.sign(transcript);
    sig.to_bytes().into()
}

/// Device side: check the client's signature with its SEC1 public key.
pub fn verify_pairing_signature(
    client_pub: &[u8],
    transcript: &[u8],
    signature: &[u8],
) -> Result<(), PairingError> {
    let vk = VerifyingKey::from_sec1_bytes(client_pub).map_err(|_| PairingError::InvalidPublicKey)?;
    let sig = Signature::from_slice(signature).map_err(|_| PairingError::MalformedSignature)?;
    vk.verify(transcript, &sig).map_err(|_| PairingError::BadSignature)
}
