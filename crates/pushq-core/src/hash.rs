//! Stable hashing of scalars for hash-based join tables.

use blake3::Hasher;

use crate::types::{kind_order, Scalar};

/// Hash a scalar consistently with [`Scalar::compare`]: values that compare
/// equal hash equal. Numbers are hashed through a canonical `f64`.
pub fn hash_scalar(s: &Scalar) -> u64 {
    let mut h = Hasher::new();
    update_scalar(&mut h, s);
    finish_u64(&h)
}

fn update_scalar(h: &mut Hasher, s: &Scalar) {
    h.update(&[kind_order(s)]);
    match s {
        Scalar::Null => {}
        Scalar::Bool(b) => {
            h.update(&[*b as u8]);
        }
        Scalar::I32(_) | Scalar::I64(_) | Scalar::F32(_) | Scalar::F64(_) => {
            let v = s.as_f64().unwrap_or(f64::NAN);
            let canon = if v.is_nan() {
                f64::NAN.to_bits()
            } else if v == 0.0 {
                0u64
            } else {
                v.to_bits()
            };
            h.update(&canon.to_le_bytes());
        }
        Scalar::Str(v) => {
            h.update(&(v.len() as u64).to_le_bytes());
            h.update(v.as_bytes());
        }
        Scalar::Bin(v) => {
            h.update(&(v.len() as u64).to_le_bytes());
            h.update(v);
        }
    }
}

fn finish_u64(h: &Hasher) -> u64 {
    let out = h.finalize();
    let mut b = [0u8; 8];
    b.copy_from_slice(&out.as_bytes()[..8]);
    u64::from_le_bytes(b)
}
