//! ECIES over secp256k1 for dealer-part share encryption.
//!
//! Wire format: `ephemeral pubkey (33, compressed SEC1) || nonce (12)
//! || AES-256-GCM ciphertext`. The symmetric key is HKDF-SHA256 over
//! the ECDH shared secret.

use {
  crate::keys::Signer,
  aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm,
    Key,
    Nonce,
  },
  hkdf::Hkdf,
  k256::ecdh::EphemeralSecret,
  rand::{rngs::OsRng, RngCore},
  sha2::Sha256,
  thiserror::Error,
};

const HKDF_INFO: &[u8] = b"dealer-share-ecies-v1";
const NONCE_LEN: usize = 12;
const PUBKEY_LEN: usize = 33;

#[derive(Debug, Error)]
pub enum Error {
  #[error("ciphertext too short or malformed")]
  Malformed,

  #[error("not a valid secp256k1 point")]
  Point,

  #[error("aead failure")]
  Aead,
}

pub fn encrypt(peer_sec1: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, Error> {
  let peer =
    k256::PublicKey::from_sec1_bytes(peer_sec1).map_err(|_| Error::Point)?;
  let ephemeral = EphemeralSecret::random(&mut OsRng);
  let ephemeral_pub = ephemeral.public_key();
  let shared = ephemeral.diffie_hellman(&peer);

  let key = derive_key(shared.raw_secret_bytes().as_slice());
  let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
  let mut nonce = [0u8; NONCE_LEN];
  OsRng.fill_bytes(&mut nonce);
  let ciphertext = cipher
    .encrypt(Nonce::from_slice(&nonce), plaintext)
    .map_err(|_| Error::Aead)?;

  let mut out = Vec::with_capacity(PUBKEY_LEN + NONCE_LEN + ciphertext.len());
  out.extend_from_slice(
    ephemeral_pub.to_sec1_bytes().as_ref(),
  );
  out.extend_from_slice(&nonce);
  out.extend_from_slice(&ciphertext);
  Ok(out)
}

pub fn decrypt(signer: &Signer, data: &[u8]) -> Result<Vec<u8>, Error> {
  if data.len() < PUBKEY_LEN + NONCE_LEN {
    return Err(Error::Malformed);
  }
  let (ephemeral, rest) = data.split_at(PUBKEY_LEN);
  let (nonce, ciphertext) = rest.split_at(NONCE_LEN);

  let shared = signer.shared_secret(ephemeral).map_err(|_| Error::Point)?;
  let key = derive_key(&shared);
  let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
  cipher
    .decrypt(Nonce::from_slice(nonce), ciphertext)
    .map_err(|_| Error::Aead)
}

fn derive_key(shared: &[u8]) -> [u8; 32] {
  let hkdf = Hkdf::<Sha256>::new(None, shared);
  let mut key = [0u8; 32];
  hkdf.expand(HKDF_INFO, &mut key).unwrap();
  key
}

#[cfg(test)]
mod test {
  use {
    super::{decrypt, encrypt},
    crate::keys::Signer,
  };

  fn signer() -> Signer {
    "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318"
      .parse()
      .unwrap()
  }

  #[test]
  fn roundtrip() {
    let signer = signer();
    let peer = signer.public();
    let sealed = encrypt(peer.as_bytes(), b"share bytes").unwrap();
    assert_eq!(decrypt(&signer, &sealed).unwrap(), b"share bytes");
  }

  #[test]
  fn wrong_recipient_fails() {
    let signer = signer();
    let other: Signer =
      "2222222222222222222222222222222222222222222222222222222222222222"
        .parse()
        .unwrap();
    let sealed = encrypt(other.public().as_bytes(), b"share bytes").unwrap();
    assert!(decrypt(&signer, &sealed).is_err());
  }

  #[test]
  fn tampered_ciphertext_fails() {
    let signer = signer();
    let mut sealed = encrypt(signer.public().as_bytes(), b"share").unwrap();
    let last = sealed.len() - 1;
    sealed[last] ^= 0x01;
    assert!(decrypt(&signer, &sealed).is_err());
  }
}
