//! Thin safe wrappers over the blst BLS12-381 primitives.
//!
//! Convention follows the chain: secret shares and polynomial
//! coefficients are Fr scalars (32-byte big-endian on the wire),
//! public commitments and the group key live in G2 (96-byte
//! compressed), signatures in G1 (48-byte compressed).

use {
  blst::{
    blst_bendian_from_scalar,
    blst_fr,
    blst_fr_add,
    blst_fr_from_scalar,
    blst_fr_from_uint64,
    blst_fr_mul,
    blst_p1,
    blst_p1_add_or_double,
    blst_p1_compress,
    blst_p1_generator,
    blst_p1_mult,
    blst_p2,
    blst_p2_add_or_double,
    blst_p2_compress,
    blst_p2_generator,
    blst_p2_mult,
    blst_scalar,
    blst_scalar_fr_check,
    blst_scalar_from_bendian,
    blst_scalar_from_fr,
  },
  rand::RngCore,
};

/// An element of the BLS12-381 scalar field Fr.
#[derive(Clone, Copy, Default)]
pub struct Scalar(blst_fr);

impl Scalar {
  pub fn zero() -> Self {
    Self::default()
  }

  pub fn from_u64(value: u64) -> Self {
    let limbs = [value, 0, 0, 0];
    let mut fr = blst_fr::default();
    unsafe { blst_fr_from_uint64(&mut fr, limbs.as_ptr()) };
    Self(fr)
  }

  /// Interprets 32 big-endian bytes as a scalar; fails on values
  /// outside the field order.
  pub fn from_bytes(bytes: &[u8; 32]) -> Option<Self> {
    let mut scalar = blst_scalar::default();
    unsafe { blst_scalar_from_bendian(&mut scalar, bytes.as_ptr()) };
    if !unsafe { blst_scalar_fr_check(&scalar) } {
      return None;
    }
    let mut fr = blst_fr::default();
    unsafe { blst_fr_from_scalar(&mut fr, &scalar) };
    Some(Self(fr))
  }

  /// Uniform random field element from OS entropy, for polynomial
  /// coefficients.
  pub fn random() -> Self {
    let mut rng = rand::rngs::OsRng;
    loop {
      let mut bytes = [0u8; 32];
      rng.fill_bytes(&mut bytes);
      if let Some(scalar) = Self::from_bytes(&bytes) {
        return scalar;
      }
    }
  }

  pub fn to_bytes(&self) -> [u8; 32] {
    let mut scalar = blst_scalar::default();
    unsafe { blst_scalar_from_fr(&mut scalar, &self.0) };
    let mut bytes = [0u8; 32];
    unsafe { blst_bendian_from_scalar(bytes.as_mut_ptr(), &scalar) };
    bytes
  }

  pub fn add(&self, other: &Self) -> Self {
    let mut out = blst_fr::default();
    unsafe { blst_fr_add(&mut out, &self.0, &other.0) };
    Self(out)
  }

  pub fn mul(&self, other: &Self) -> Self {
    let mut out = blst_fr::default();
    unsafe { blst_fr_mul(&mut out, &self.0, &other.0) };
    Self(out)
  }

  fn le_bytes(&self) -> [u8; 32] {
    let mut scalar = blst_scalar::default();
    unsafe { blst_scalar_from_fr(&mut scalar, &self.0) };
    scalar.b
  }
}

/// Evaluates a polynomial given by its coefficients (constant term
/// first) at `x`, by Horner's rule in Fr.
pub fn eval_poly(coefficients: &[Scalar], x: &Scalar) -> Scalar {
  let mut acc = Scalar::zero();
  for coefficient in coefficients.iter().rev() {
    acc = acc.mul(x).add(coefficient);
  }
  acc
}

#[derive(Clone, Copy)]
pub struct G1(blst_p1);

impl G1 {
  pub fn generator() -> Self {
    Self(unsafe { *blst_p1_generator() })
  }

  pub fn mul(&self, scalar: &Scalar) -> Self {
    let bytes = scalar.le_bytes();
    let mut out = blst_p1::default();
    unsafe { blst_p1_mult(&mut out, &self.0, bytes.as_ptr(), 255) };
    Self(out)
  }

  pub fn add(&self, other: &Self) -> Self {
    let mut out = blst_p1::default();
    unsafe { blst_p1_add_or_double(&mut out, &self.0, &other.0) };
    Self(out)
  }

  pub fn compress(&self) -> [u8; 48] {
    let mut out = [0u8; 48];
    unsafe { blst_p1_compress(out.as_mut_ptr(), &self.0) };
    out
  }
}

#[derive(Clone, Copy)]
pub struct G2(blst_p2);

impl G2 {
  pub fn generator() -> Self {
    Self(unsafe { *blst_p2_generator() })
  }

  pub fn mul(&self, scalar: &Scalar) -> Self {
    let bytes = scalar.le_bytes();
    let mut out = blst_p2::default();
    unsafe { blst_p2_mult(&mut out, &self.0, bytes.as_ptr(), 255) };
    Self(out)
  }

  pub fn add(&self, other: &Self) -> Self {
    let mut out = blst_p2::default();
    unsafe { blst_p2_add_or_double(&mut out, &self.0, &other.0) };
    Self(out)
  }

  pub fn compress(&self) -> [u8; 96] {
    let mut out = [0u8; 96];
    unsafe { blst_p2_compress(out.as_mut_ptr(), &self.0) };
    out
  }
}
