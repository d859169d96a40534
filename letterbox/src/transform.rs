use crate::common::*;

/// A 2×3 affine transform on `[x, y]` points.
///
/// The matrix follows the OpenCV layout: a point `[x, y]` maps to
/// `[m00 x + m01 y + m02, m10 x + m11 y + m12]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AffineTransform<T> {
    matrix: [[T; 3]; 2],
}

impl<T> AffineTransform<T>
where
    T: Float,
{
    pub fn identity() -> Self {
        let zero = T::zero();
        let one = T::one();
        Self {
            matrix: [[one, zero, zero], [zero, one, zero]],
        }
    }

    pub fn from_matrix(matrix: [[T; 3]; 2]) -> Self {
        Self { matrix }
    }

    /// Solves the unique affine map sending three source points to three
    /// destination points.
    pub fn from_points(src: [[T; 2]; 3], dst: [[T; 2]; 3]) -> Result<Self> {
        let one = T::one();
        let [[x0, y0], [x1, y1], [x2, y2]] = src;
        let det = det3([[x0, y0, one], [x1, y1, one], [x2, y2, one]]);
        ensure!(
            det.abs() > T::epsilon(),
            "source points are collinear, the affine transform is degenerate"
        );

        let solve_row = |u: [T; 3]| -> [T; 3] {
            let [u0, u1, u2] = u;
            let a = det3([[u0, y0, one], [u1, y1, one], [u2, y2, one]]) / det;
            let b = det3([[x0, u0, one], [x1, u1, one], [x2, u2, one]]) / det;
            let c = det3([[x0, y0, u0], [x1, y1, u1], [x2, y2, u2]]) / det;
            [a, b, c]
        };

        let [[u0, v0], [u1, v1], [u2, v2]] = dst;
        let row_x = solve_row([u0, u1, u2]);
        let row_y = solve_row([v0, v1, v2]);

        Ok(Self {
            matrix: [row_x, row_y],
        })
    }

    pub fn matrix(&self) -> [[T; 3]; 2] {
        self.matrix
    }

    pub fn apply(&self, point: [T; 2]) -> [T; 2] {
        let [x, y] = point;
        let [[a, b, c], [d, e, f]] = self.matrix;
        [a * x + b * y + c, d * x + e * y + f]
    }

    pub fn inverse(&self) -> Result<Self> {
        let [[a, b, c], [d, e, f]] = self.matrix;
        let det = a * e - b * d;
        ensure!(
            det.abs() > T::epsilon(),
            "the affine transform is singular and cannot be inverted"
        );

        let ia = e / det;
        let ib = -b / det;
        let id = -d / det;
        let ie = a / det;
        let ic = -(ia * c + ib * f);
        let if_ = -(id * c + ie * f);

        Ok(Self {
            matrix: [[ia, ib, ic], [id, ie, if_]],
        })
    }

    pub fn try_cast<V>(&self) -> Option<AffineTransform<V>>
    where
        V: Float,
    {
        let [[a, b, c], [d, e, f]] = self.matrix;
        Some(AffineTransform {
            matrix: [
                [V::from(a)?, V::from(b)?, V::from(c)?],
                [V::from(d)?, V::from(e)?, V::from(f)?],
            ],
        })
    }
}

/// Composes two transforms. `lhs * rhs` applies `rhs` first.
impl<T> Mul<&AffineTransform<T>> for &AffineTransform<T>
where
    T: Float,
{
    type Output = AffineTransform<T>;

    fn mul(self, rhs: &AffineTransform<T>) -> Self::Output {
        let [[a, b, c], [d, e, f]] = self.matrix;
        let [[ra, rb, rc], [rd, re, rf]] = rhs.matrix;

        AffineTransform {
            matrix: [
                [a * ra + b * rd, a * rb + b * re, a * rc + b * rf + c],
                [d * ra + e * rd, d * rb + e * re, d * rc + e * rf + f],
            ],
        }
    }
}

fn det3<T>(m: [[T; 3]; 3]) -> T
where
    T: Float,
{
    let [[a, b, c], [d, e, f], [g, h, i]] = m;
    a * (e * i - f * h) - b * (d * i - f * g) + c * (d * h - e * g)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn assert_transform_eq(lhs: &AffineTransform<f64>, rhs: &AffineTransform<f64>) {
        lhs.matrix()
            .iter()
            .flatten()
            .zip(rhs.matrix().iter().flatten())
            .for_each(|(l, r)| assert_abs_diff_eq!(l, r, epsilon = 1e-9));
    }

    #[test]
    fn solve_from_points() -> Result<()> {
        let transform = AffineTransform::from_points(
            [[0.0, 0.0], [10.0, 0.0], [0.0, 5.0]],
            [[1.0, 2.0], [21.0, 2.0], [1.0, 12.0]],
        )?;
        let expect = AffineTransform::from_matrix([[2.0, 0.0, 1.0], [0.0, 2.0, 2.0]]);
        assert_transform_eq(&transform, &expect);
        Ok(())
    }

    #[test]
    fn reject_collinear_points() {
        let result = AffineTransform::from_points(
            [[0.0, 0.0], [1.0, 1.0], [2.0, 2.0]],
            [[0.0, 0.0], [1.0, 0.0], [0.0, 1.0]],
        );
        assert!(result.is_err());
    }

    #[test]
    fn transform_inverse() -> Result<()> {
        let orig = AffineTransform::from_matrix([[2.0, 0.5, 1.0], [-0.25, 3.0, 4.0]]);
        assert_transform_eq(&orig.inverse()?.inverse()?, &orig);
        assert_transform_eq(&(&orig * &orig.inverse()?), &AffineTransform::identity());
        Ok(())
    }

    #[test]
    fn compose_applies_rhs_first() {
        let scale = AffineTransform::from_matrix([[2.0, 0.0, 0.0], [0.0, 2.0, 0.0]]);
        let shift = AffineTransform::from_matrix([[1.0, 0.0, 3.0], [0.0, 1.0, -1.0]]);
        let [x, y] = (&scale * &shift).apply([1.0, 1.0]);
        assert_abs_diff_eq!(x, 8.0);
        assert_abs_diff_eq!(y, 0.0);
    }
}
