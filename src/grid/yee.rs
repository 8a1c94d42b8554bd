use ndarray::prelude::*;

use crate::constants::*;
use crate::grid::FieldSet;

/// Advances the electric and magnetic fields by `dt`, using
/// the currents stored on the grid.
///
/// Derivatives are taken along the first `ndim` axes only. The outermost
/// layer of nodes is left stale and must be refreshed from the neighbouring
/// grids before the next call.
pub fn advance(fields: &mut FieldSet, dt: f64, dx: &[f64; 3], ndim: usize) {
    advance_b(fields, 0.5 * dt, dx, ndim);
    advance_e(fields, dt, dx, ndim);
    advance_b(fields, 0.5 * dt, dx, ndim);
}

/// Advance the magnetic field components in time,
/// dB/dt = - curl E, using forward differences.
fn advance_b(fields: &mut FieldSet, dt: f64, dx: &[f64; 3], ndim: usize) {
    let shape = fields.shape();
    let end = |a: usize| if a < ndim {shape[a] - 1} else {shape[a]};
    let e = &fields.e;
    let b = &mut fields.b;

    for i in 0..end(0) {
        for j in 0..end(1) {
            for k in 0..end(2) {
                let here = [i, j, k];
                let d = |f: &Array3<f64>, axis: usize| -> f64 {
                    if axis >= ndim {
                        return 0.0;
                    }
                    let mut next = here;
                    next[axis] += 1;
                    (f[next] - f[here]) / dx[axis]
                };
                let curl = [
                    d(&e[2], 1) - d(&e[1], 2),
                    d(&e[0], 2) - d(&e[2], 0),
                    d(&e[1], 0) - d(&e[0], 1),
                ];
                for c in 0..3 {
                    b[c][here] -= dt * curl[c];
                }
            }
        }
    }
}

/// Advance the electric field components in time,
/// dE/dt = c^2 curl B - j / e_0, using backward differences.
fn advance_e(fields: &mut FieldSet, dt: f64, dx: &[f64; 3], ndim: usize) {
    let shape = fields.shape();
    let start = |a: usize| if a < ndim {1} else {0};
    let b = &fields.b;
    let jj = &fields.j;
    let e = &mut fields.e;

    for i in start(0)..shape[0] {
        for j in start(1)..shape[1] {
            for k in start(2)..shape[2] {
                let here = [i, j, k];
                let d = |f: &Array3<f64>, axis: usize| -> f64 {
                    if axis >= ndim {
                        return 0.0;
                    }
                    let mut prev = here;
                    prev[axis] -= 1;
                    (f[here] - f[prev]) / dx[axis]
                };
                let curl = [
                    d(&b[2], 1) - d(&b[1], 2),
                    d(&b[0], 2) - d(&b[2], 0),
                    d(&b[1], 0) - d(&b[0], 1),
                ];
                for c in 0..3 {
                    e[c][here] += dt * SPEED_OF_LIGHT_SQD * curl[c] - dt * jj[c][here] / VACUUM_PERMITTIVITY;
                }
            }
        }
    }
}

/*------------------------------------------------------------------------------------

  All components are stored at the same nodes, but the differencing makes the grid
  behave as if B were offset by half a cell in the positive direction: B at node i
  is updated from E at nodes i and i+1, E at node i from B at nodes i-1 and i.

  Call in this order:
    - push particles, deposit currents, sum currents across patches
    - half B advance
    - full E advance
    - half B advance
    - copy fields into neighbouring ghost cells

  Each advance invalidates one more layer of nodes at the edge of the array. The
  three advances together spoil at most two layers on either side, so the
  interior is exact only with at least two ghost cells per side.

------------------------------------------------------------------------------------*/

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::Component;

    #[test]
    fn plane_wave_propagates_at_c() {
        let n = 400;
        let dx = 1.0e-7;
        let dt = 0.5 * dx / SPEED_OF_LIGHT;
        let mut f = FieldSet::new([n, 1, 1], [2, 0, 0]);
        let x0 = 100.0 * dx;
        let width = 10.0 * dx;
        let pulse = |x: f64| (-(x - x0).powi(2) / width.powi(2)).exp();

        for i in 0..(n + 4) {
            let x = (i as f64) * dx;
            f.component_mut(Component::Ey)[[i, 0, 0]] = pulse(x);
            f.component_mut(Component::Bz)[[i, 0, 0]] = pulse(x + 0.5 * dx) / SPEED_OF_LIGHT;
        }

        let steps = 200;
        for _ in 0..steps {
            advance(&mut f, dt, &[dx, 1.0, 1.0], 1);
        }

        let ey = f.component(Component::Ey);
        let peak = (0..(n + 4))
            .max_by(|&a, &b| ey[[a, 0, 0]].partial_cmp(&ey[[b, 0, 0]]).unwrap())
            .unwrap();
        let expected = 100 + steps / 2;
        println!("peak at {}, expected {}, height {}", peak, expected, ey[[peak, 0, 0]]);
        assert!((peak as isize - expected as isize).abs() <= 1);
        assert!((ey[[peak, 0, 0]] - 1.0).abs() < 0.05);
    }

    #[test]
    fn current_drives_electric_field() {
        let mut f = FieldSet::new([4, 4, 1], [2, 2, 0]);
        let j0 = 1.0e3;
        let dt = 1.0e-15;
        f.component_mut(Component::Jz).fill(j0);
        advance(&mut f, dt, &[1.0e-6, 1.0e-6, 1.0], 2);
        let ez = f.component(Component::Ez)[[3, 3, 0]];
        let target = -dt * j0 / VACUUM_PERMITTIVITY;
        assert!(((ez - target) / target).abs() < 1.0e-9);
    }
}
