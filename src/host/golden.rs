//! Software reference convolution.
//!
//! Output pixel `(r, c)` is the low byte of
//! `Σ kernel[i][j] * subject[r - h + i][c - h + j]` with signed kernel bytes
//! and `h = dim / 2`. Pixels within `h` of any edge are zero.

/// One output pixel that differs from the reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mismatch {
    pub row: usize,
    pub col: usize,
    pub expected: u8,
    pub actual: u8,
}

/// Convolve a `rows` x `cols` subject with a `dim` x `dim` kernel.
pub fn convolve(subject: &[u8], rows: usize, cols: usize, kernel: &[u8], dim: usize) -> Vec<u8> {
    let h = dim / 2;
    let mut out = vec![0u8; rows * cols];
    if rows < dim || cols < dim {
        return out;
    }

    for r in h..rows - h {
        for c in h..cols - h {
            let mut sum = 0i32;
            for i in 0..dim {
                let line = (r - h + i) * cols + (c - h);
                for j in 0..dim {
                    sum += kernel[i * dim + j] as i8 as i32 * subject[line + j] as i32;
                }
            }
            out[r * cols + c] = sum as u8;
        }
    }
    out
}

/// Positions where `actual` differs from `expected`.
pub fn compare(expected: &[u8], actual: &[u8], cols: usize) -> Vec<Mismatch> {
    expected
        .iter()
        .zip(actual)
        .enumerate()
        .filter(|(_, (e, a))| e != a)
        .map(|(i, (&expected, &actual))| Mismatch {
            row: i / cols,
            col: i % cols,
            expected,
            actual,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_kernel() {
        let subject: Vec<u8> = (0..25).collect();
        let out = convolve(&subject, 5, 5, &[0, 0, 0, 0, 1, 0, 0, 0, 0], 3);
        assert_eq!(out[6], 6);
        assert_eq!(out[12], 12);
        assert_eq!(out[0], 0);
        assert_eq!(out[4], 0);
        assert_eq!(out[24], 0);
    }

    #[test]
    fn test_sobel_on_flat_image_is_zero() {
        let sobel = [0x01, 0x00, 0xFF, 0x02, 0x00, 0xFE, 0x01, 0x00, 0xFF];
        let out = convolve(&[0x10; 64], 8, 8, &sobel, 3);
        assert!(out.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_low_byte_of_signed_sum() {
        // 9 * (-1 * 200) = -1800 -> 0xF8
        let out = convolve(&[200; 9], 3, 3, &[0xFF; 9], 3);
        assert_eq!(out[4], (-1800i32) as u8);
    }

    #[test]
    fn test_compare_reports_positions() {
        let mismatches = compare(&[1, 2, 3, 4], &[1, 0, 3, 5], 2);
        assert_eq!(
            mismatches,
            vec![
                Mismatch { row: 0, col: 1, expected: 2, actual: 0 },
                Mismatch { row: 1, col: 1, expected: 4, actual: 5 },
            ]
        );
    }
}
