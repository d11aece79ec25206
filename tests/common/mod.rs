#![allow(dead_code)]

use rand::Rng;
use tilemul::Matrix;

/// Random matrix with i.i.d. values in [-1, 1)
pub fn random_matrix(rows: usize, cols: usize) -> Matrix {
    let mut rng = rand::thread_rng();
    let data = (0..rows * cols).map(|_| rng.gen_range(-1.0..1.0)).collect();
    Matrix::from_vec(data, rows, cols).unwrap()
}

/// Assert two matrices agree elementwise within an absolute tolerance
pub fn assert_matrix_close(actual: &Matrix, expected: &Matrix, tolerance: f64) {
    assert_eq!(actual.rows, expected.rows);
    assert_eq!(actual.cols, expected.cols);
    for (idx, (a, e)) in actual.data.iter().zip(expected.data.iter()).enumerate() {
        assert!(
            (a - e).abs() <= tolerance,
            "cell ({}, {}) differs: {} vs {}",
            idx / actual.cols,
            idx % actual.cols,
            a,
            e
        );
    }
}
