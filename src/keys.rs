use {
  k256::ecdsa::{
    signature::{Signer as _, Verifier as _},
    Signature,
    SigningKey,
    VerifyingKey,
  },
  serde::{de, Deserialize, Deserializer, Serialize},
  std::{
    fmt::{Debug, Display, Formatter},
    path::Path,
    str::FromStr,
  },
  thiserror::Error,
};

/// Identity of a network participant.
///
/// This is a compressed secp256k1 public key, the same key type used
/// by participant accounts on the chain. Its canonical textual form is
/// lowercase hex of the 33 SEC1 bytes and that form is used everywhere
/// a participant is referenced in queries or messages.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pubkey([u8; 33]);

impl Pubkey {
  pub fn as_bytes(&self) -> &[u8; 33] {
    &self.0
  }

  /// Verifies an ECDSA signature produced by the holder of the
  /// corresponding secret key over an arbitrary message.
  pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
    let key = match VerifyingKey::from_sec1_bytes(&self.0) {
      Ok(key) => key,
      Err(_) => return false,
    };
    let signature = match Signature::from_slice(signature) {
      Ok(signature) => signature,
      Err(_) => return false,
    };
    key.verify(message, &signature).is_ok()
  }
}

impl Display for Pubkey {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", hex::encode(self.0))
  }
}

impl Debug for Pubkey {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "Pubkey({})", hex::encode(self.0))
  }
}

impl From<Pubkey> for String {
  fn from(pk: Pubkey) -> Self {
    hex::encode(pk.0)
  }
}

impl From<&VerifyingKey> for Pubkey {
  fn from(key: &VerifyingKey) -> Self {
    let point = key.to_encoded_point(true);
    Self(point.as_bytes().try_into().unwrap())
  }
}

#[derive(Debug, Error)]
pub enum KeyError {
  #[error("invalid hex encoding: {0}")]
  Hex(#[from] hex::FromHexError),

  #[error("expected {expected} bytes, got {actual}")]
  Length { expected: usize, actual: usize },

  #[error("not a valid secp256k1 key: {0}")]
  Ecdsa(#[from] k256::ecdsa::Error),

  #[error("not a valid secp256k1 point")]
  Point,

  #[error(transparent)]
  Io(#[from] std::io::Error),
}

impl FromStr for Pubkey {
  type Err = KeyError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let bytes = hex::decode(s.trim())?;
    let bytes: [u8; 33] =
      bytes.try_into().map_err(|b: Vec<u8>| KeyError::Length {
        expected: 33,
        actual: b.len(),
      })?;
    // round-trip through the curve type to reject off-curve points
    VerifyingKey::from_sec1_bytes(&bytes)?;
    Ok(Self(bytes))
  }
}

impl Serialize for Pubkey {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: serde::Serializer,
  {
    serializer.serialize_str(&hex::encode(self.0))
  }
}

impl<'de> Deserialize<'de> for Pubkey {
  fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
  where
    D: Deserializer<'de>,
  {
    let s = String::deserialize(deserializer)?;
    s.parse().map_err(|e| de::Error::custom(format!("{e}")))
  }
}

/// The participant's signing identity.
///
/// All chain-bound messages and all deterministic derivations (epoch
/// seeds in particular) are signed with this key. Signing uses RFC 6979
/// deterministic nonces, so signing the same message twice yields the
/// same signature, which the seed derivation relies on.
pub struct Signer(SigningKey);

impl Signer {
  pub fn public(&self) -> Pubkey {
    Pubkey::from(self.0.verifying_key())
  }

  pub fn sign(&self, message: &[u8]) -> [u8; 64] {
    let signature: Signature = self.0.sign(message);
    let mut out = [0u8; 64];
    out.copy_from_slice(&signature.to_bytes());
    out
  }

  /// ECDH shared secret with a peer's compressed SEC1 key. Used by the
  /// share-encryption layer of the key-generation protocol.
  pub fn shared_secret(&self, peer_sec1: &[u8]) -> Result<[u8; 32], KeyError> {
    let peer =
      k256::PublicKey::from_sec1_bytes(peer_sec1).map_err(|_| KeyError::Point)?;
    let shared = k256::ecdh::diffie_hellman(
      self.0.as_nonzero_scalar(),
      peer.as_affine(),
    );
    Ok(shared.raw_secret_bytes()[..].try_into().unwrap())
  }

  /// Loads the signing key from a file-backed keyring directory. The
  /// key material is a hex-encoded 32-byte scalar stored in
  /// `<dir>/<name>.key`.
  pub fn from_keyring(dir: &Path, name: &str) -> Result<Self, KeyError> {
    let path = dir.join(format!("{name}.key"));
    let contents = std::fs::read_to_string(path)?;
    contents.parse()
  }
}

impl Clone for Signer {
  fn clone(&self) -> Self {
    Self(self.0.clone())
  }
}

impl Debug for Signer {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.debug_tuple("Signer").field(&self.public()).finish()
  }
}

impl Display for Signer {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "Signer({})", self.public())
  }
}

impl FromStr for Signer {
  type Err = KeyError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let bytes = hex::decode(s.trim())?;
    Ok(Self(SigningKey::from_slice(&bytes)?))
  }
}

impl TryFrom<&[u8]> for Signer {
  type Error = KeyError;

  fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
    Ok(Self(SigningKey::from_slice(value)?))
  }
}

#[cfg(test)]
mod test {
  use super::{Pubkey, Signer};

  #[test]
  fn sign_is_deterministic() {
    let signer: Signer =
      "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318"
        .parse()
        .unwrap();
    let a = signer.sign(b"epoch-42");
    let b = signer.sign(b"epoch-42");
    assert_eq!(a, b);
    assert_ne!(a, signer.sign(b"epoch-43"));
  }

  #[test]
  fn pubkey_roundtrip_and_verify() {
    let signer: Signer =
      "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318"
        .parse()
        .unwrap();
    let pk = signer.public();
    let parsed: Pubkey = pk.to_string().parse().unwrap();
    assert_eq!(pk, parsed);

    let sig = signer.sign(b"hello");
    assert!(pk.verify(b"hello", &sig));
    assert!(!pk.verify(b"other", &sig));
  }
}
