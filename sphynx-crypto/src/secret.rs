use subtle::ConstantTimeEq;
use zeroize::Zeroize;

/// A fixed-size secret byte string that is wiped from memory on drop and compares in
/// constant time. Used for shared secrets, session keys, and PSKs throughout the
/// handshake and transport so that none of that material lingers in freed memory or
/// leaks through timing side channels on comparison.
#[derive(Clone)]
pub struct Secret<const N: usize>([u8; N]);

impl<const N: usize> Secret<N> {
    #[inline]
    pub fn new(b: [u8; N]) -> Self {
        Self(b)
    }

    #[inline]
    pub fn zero() -> Self {
        Self([0u8; N])
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; N] {
        &self.0
    }

    #[inline]
    pub fn first_n<const M: usize>(&self) -> [u8; M] {
        debug_assert!(M <= N);
        let mut out = [0u8; M];
        out.copy_from_slice(&self.0[..M]);
        out
    }
}

impl<const N: usize> PartialEq for Secret<N> {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}
impl<const N: usize> Eq for Secret<N> {}

impl<const N: usize> Drop for Secret<N> {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl<const N: usize> std::fmt::Debug for Secret<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(..)")
    }
}
