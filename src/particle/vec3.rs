//! Three-vector arithmetic for the particle pusher

use std::ops::{Add, Div, Mul};

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Add for Vec3 {
    type Output = Vec3;
    fn add(self, other: Vec3) -> Vec3 {
        Vec3 {x: self.x + other.x, y: self.y + other.y, z: self.z + other.z}
    }
}

/// Dot product.
impl Mul for Vec3 {
    type Output = f64;
    fn mul(self, other: Vec3) -> f64 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }
}

impl Mul<f64> for Vec3 {
    type Output = Vec3;
    fn mul(self, a: f64) -> Vec3 {
        Vec3 {x: a * self.x, y: a * self.y, z: a * self.z}
    }
}

impl Mul<Vec3> for f64 {
    type Output = Vec3;
    fn mul(self, v: Vec3) -> Vec3 {
        v * self
    }
}

impl Div<f64> for Vec3 {
    type Output = Vec3;
    fn div(self, a: f64) -> Vec3 {
        Vec3 {x: self.x / a, y: self.y / a, z: self.z / a}
    }
}

impl From<[f64; 3]> for Vec3 {
    fn from(a: [f64; 3]) -> Vec3 {
        Vec3 {x: a[0], y: a[1], z: a[2]}
    }
}

impl From<Vec3> for [f64; 3] {
    fn from(v: Vec3) -> [f64; 3] {
        [v.x, v.y, v.z]
    }
}

impl Vec3 {
    pub fn cross(self, other: Vec3) -> Vec3 {
        Vec3 {
            x: self.y * other.z - self.z * other.y,
            y: self.z * other.x - self.x * other.z,
            z: self.x * other.y - self.y * other.x,
        }
    }

    pub fn norm_sqr(self) -> f64 {
        self * self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cross_is_orthogonal() {
        let a = Vec3::from([1.0, 2.0, -0.5]);
        let b = Vec3::from([-3.0, 0.25, 4.0]);
        let c = a.cross(b);
        assert!((c * a).abs() < 1.0e-12);
        assert!((c * b).abs() < 1.0e-12);
        // |a x b|^2 = |a|^2 |b|^2 - (a.b)^2
        let err = (c.norm_sqr() - (a.norm_sqr() * b.norm_sqr() - (a * b).powi(2))).abs();
        assert!(err < 1.0e-12);
        let v: [f64; 3] = (2.0 * a / 4.0).into();
        assert_eq!(v, [0.5, 1.0, -0.25]);
    }
}
