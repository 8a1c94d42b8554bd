//! Hilbert ordering of the patch lattice
//!
//! Keys are computed with Skilling's transpose algorithm
//! (AIP Conf. Proc. 707, 381 (2004)) on the smallest power-of-two cube
//! enclosing the lattice; lattice points are then numbered in key order,
//! which gives a bijection onto `0..n` for any lattice shape.

/// Hilbert key of `coords` on a cube of side `2^bits`.
pub fn hilbert_key(coords: &[u32], bits: u32) -> u64 {
    let n = coords.len();
    if bits == 0 || n == 0 {
        return 0;
    }
    if n == 1 {
        return coords[0] as u64;
    }

    let mut x = coords.to_vec();
    let m = 1u32 << (bits - 1);

    // inverse undo
    let mut q = m;
    while q > 1 {
        let p = q - 1;
        for i in 0..n {
            if x[i] & q != 0 {
                x[0] ^= p;
            } else {
                let t = (x[0] ^ x[i]) & p;
                x[0] ^= t;
                x[i] ^= t;
            }
        }
        q >>= 1;
    }

    // Gray encode
    for i in 1..n {
        x[i] ^= x[i-1];
    }
    let mut t = 0;
    let mut q = m;
    while q > 1 {
        if x[n-1] & q != 0 {
            t ^= q - 1;
        }
        q >>= 1;
    }
    for v in x.iter_mut() {
        *v ^= t;
    }

    // interleave the transposed bits, most significant first
    let mut key = 0u64;
    for b in (0..bits).rev() {
        for v in x.iter() {
            key = (key << 1) | (((v >> b) & 1) as u64);
        }
    }
    key
}

/// Numbering of a lattice of `shape[0] × shape[1] × shape[2]` points.
#[derive(Clone, Debug)]
pub struct CurveOrder {
    shape: [usize; 3],
    coords_of: Vec<[usize; 3]>,
    index_of: Vec<usize>,
}

impl CurveOrder {
    /// Orders the lattice along a Hilbert curve over its first `ndim` axes.
    pub fn hilbert(shape: [usize; 3], ndim: usize) -> Self {
        let longest = shape[..ndim].iter().copied().max().unwrap_or(1);
        let bits = (longest as f64).log2().ceil() as u32;

        let mut coords_of: Vec<[usize; 3]> = Vec::with_capacity(shape.iter().product());
        for k in 0..shape[2] {
            for j in 0..shape[1] {
                for i in 0..shape[0] {
                    coords_of.push([i, j, k]);
                }
            }
        }

        coords_of.sort_by_key(|c| {
            let c: Vec<u32> = c[..ndim].iter().map(|&v| v as u32).collect();
            hilbert_key(&c, bits)
        });

        let mut index_of = vec![0; coords_of.len()];
        for (index, c) in coords_of.iter().enumerate() {
            index_of[Self::linear(shape, *c)] = index;
        }

        CurveOrder {shape, coords_of, index_of}
    }

    fn linear(shape: [usize; 3], c: [usize; 3]) -> usize {
        c[0] + shape[0] * (c[1] + shape[1] * c[2])
    }

    pub fn len(&self) -> usize {
        self.coords_of.len()
    }

    pub fn coords_of(&self, index: usize) -> [usize; 3] {
        self.coords_of[index]
    }

    pub fn index_of(&self, coords: [usize; 3]) -> usize {
        self.index_of[Self::linear(self.shape, coords)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adjacent(a: [usize; 3], b: [usize; 3]) -> bool {
        let d: usize = (0..3).map(|i| if a[i] > b[i] {a[i] - b[i]} else {b[i] - a[i]}).sum();
        d == 1
    }

    #[test]
    fn curve_is_continuous_on_power_of_two_lattice() {
        for &(shape, ndim) in &[([8, 8, 1], 2), ([4, 4, 4], 3), ([16, 1, 1], 1)] {
            let curve = CurveOrder::hilbert(shape, ndim);
            for i in 1..curve.len() {
                assert!(
                    adjacent(curve.coords_of(i-1), curve.coords_of(i)),
                    "{:?} and {:?} are not neighbours", curve.coords_of(i-1), curve.coords_of(i)
                );
            }
        }
    }

    #[test]
    fn numbering_is_a_bijection() {
        let shape = [6, 3, 5];
        let curve = CurveOrder::hilbert(shape, 3);
        assert_eq!(curve.len(), 90);
        let mut seen = vec![false; 90];
        for k in 0..5 {
            for j in 0..3 {
                for i in 0..6 {
                    let index = curve.index_of([i, j, k]);
                    assert!(!seen[index]);
                    seen[index] = true;
                    assert_eq!(curve.coords_of(index), [i, j, k]);
                }
            }
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn single_patch() {
        let curve = CurveOrder::hilbert([1, 1, 1], 2);
        assert_eq!(curve.len(), 1);
        assert_eq!(curve.index_of([0, 0, 0]), 0);
    }
}
