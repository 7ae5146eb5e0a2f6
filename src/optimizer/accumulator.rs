//! Dense accumulator for the damped normal equations `H δ = b`.

use nalgebra::{Cholesky, DMatrix, DVector};

/// Collects `H = Jᵀ W J` and `b = Jᵀ W r` block by block, then solves the
/// damped system.
#[derive(Debug, Clone)]
pub struct DenseAccumulator {
    h: DMatrix<f64>,
    b: DVector<f64>,
}

impl DenseAccumulator {
    pub fn new(size: usize) -> Self {
        Self {
            h: DMatrix::zeros(size, size),
            b: DVector::zeros(size),
        }
    }

    pub fn reset(&mut self, size: usize) {
        self.h = DMatrix::zeros(size, size);
        self.b = DVector::zeros(size);
    }

    /// Add a dense block at `(row, col)`.
    pub fn add_h(&mut self, row: usize, col: usize, block: &DMatrix<f64>) {
        let mut view = self.h.view_mut((row, col), (block.nrows(), block.ncols()));
        view += block;
    }

    pub fn add_b(&mut self, row: usize, block: &DVector<f64>) {
        let mut view = self.b.rows_mut(row, block.nrows());
        view += block;
    }

    pub fn h(&self) -> &DMatrix<f64> {
        &self.h
    }

    pub fn h_mut(&mut self) -> &mut DMatrix<f64> {
        &mut self.h
    }

    pub fn b(&self) -> &DVector<f64> {
        &self.b
    }

    pub fn b_mut(&mut self) -> &mut DVector<f64> {
        &mut self.b
    }

    pub fn h_diagonal(&self) -> DVector<f64> {
        self.h.diagonal()
    }

    /// Solve `(H + diag(damping)) δ = b` by Cholesky factorization.
    ///
    /// Returns `None` when the damped matrix is not positive definite; the
    /// driver treats that as a degenerate (rejected) step.
    pub fn solve(&self, damping: Option<&DVector<f64>>) -> Option<DVector<f64>> {
        let mut damped = self.h.clone();
        if let Some(d) = damping {
            assert_eq!(d.len(), damped.nrows(), "damping size mismatch");
            for i in 0..d.len() {
                damped[(i, i)] += d[i];
            }
        }

        let chol = Cholesky::new(damped)?;
        let solution = chol.solve(&self.b);
        solution.iter().all(|v| v.is_finite()).then_some(solution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_solve_recovers_known_solution() {
        // H = JᵀJ for J = I scaled, b = Jᵀ r.
        let mut accum = DenseAccumulator::new(3);
        let h = DMatrix::from_diagonal(&DVector::from_vec(vec![4.0, 9.0, 16.0]));
        let b = DVector::from_vec(vec![8.0, 27.0, 32.0]);
        accum.add_h(0, 0, &h);
        accum.add_b(0, &b);

        let x = accum.solve(None).unwrap();
        assert_relative_eq!(x[0], 2.0, epsilon = 1e-12);
        assert_relative_eq!(x[1], 3.0, epsilon = 1e-12);
        assert_relative_eq!(x[2], 2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_damping_floors_singular_system() {
        // Rank-deficient H becomes solvable once the damping diagonal lands.
        let mut accum = DenseAccumulator::new(2);
        let h = DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.0, 0.0]);
        accum.add_h(0, 0, &h);
        accum.add_b(0, &DVector::from_vec(vec![1.0, 0.0]));

        assert!(accum.solve(None).is_none());

        let damping = DVector::from_vec(vec![1e-6, 1e-6]);
        let x = accum.solve(Some(&damping)).unwrap();
        assert!(x.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_block_accumulation_is_additive() {
        let mut accum = DenseAccumulator::new(4);
        let block = DMatrix::from_element(2, 2, 1.5);
        accum.add_h(1, 1, &block);
        accum.add_h(1, 1, &block);

        assert_relative_eq!(accum.h()[(1, 1)], 3.0, epsilon = 1e-15);
        assert_relative_eq!(accum.h()[(2, 2)], 3.0, epsilon = 1e-15);
        assert_relative_eq!(accum.h()[(0, 0)], 0.0, epsilon = 1e-15);
    }
}
