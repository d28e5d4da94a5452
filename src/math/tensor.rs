use serde::{Serialize, Deserialize};

use crate::error::{Error, Result};
use crate::math::matrix::Matrix;

/// A dense `channels x height x width` feature map stored channel-major.
///
/// Images enter the network as 3-channel tensors; every backbone stage
/// consumes and produces one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
    pub data: Vec<f64>,
}

impl Tensor {
    pub fn zeros(channels: usize, height: usize, width: usize) -> Tensor {
        Tensor {
            channels,
            height,
            width,
            data: vec![0.0; channels * height * width],
        }
    }

    /// Wraps a flat buffer, checking it matches the requested shape.
    pub fn from_data(channels: usize, height: usize, width: usize, data: Vec<f64>) -> Result<Tensor> {
        if data.len() != channels * height * width {
            return Err(Error::shape(
                format!("{}x{}x{} = {} values", channels, height, width, channels * height * width),
                format!("{} values", data.len()),
            ));
        }
        Ok(Tensor { channels, height, width, data })
    }

    pub fn shape(&self) -> (usize, usize, usize) {
        (self.channels, self.height, self.width)
    }

    /// Number of spatial positions (`height * width`).
    pub fn area(&self) -> usize {
        self.height * self.width
    }

    #[inline]
    pub fn index(&self, c: usize, y: usize, x: usize) -> usize {
        (c * self.height + y) * self.width + x
    }

    #[inline]
    pub fn get(&self, c: usize, y: usize, x: usize) -> f64 {
        self.data[self.index(c, y, x)]
    }

    #[inline]
    pub fn set(&mut self, c: usize, y: usize, x: usize, value: f64) {
        let i = self.index(c, y, x);
        self.data[i] = value;
    }

    /// The `height * width` values of one channel.
    pub fn plane(&self, c: usize) -> &[f64] {
        let n = self.area();
        &self.data[c * n..(c + 1) * n]
    }

    pub fn map<F>(&self, functor: F) -> Tensor
    where
        F: Fn(f64) -> f64,
    {
        Tensor {
            channels: self.channels,
            height: self.height,
            width: self.width,
            data: self.data.iter().map(|&x| functor(x)).collect(),
        }
    }

    /// Element-wise sum, used where a residual block merges its two paths.
    pub fn add_assign(&mut self, other: &Tensor) {
        assert_eq!(self.shape(), other.shape(), "tensor shapes differ");
        for (a, b) in self.data.iter_mut().zip(other.data.iter()) {
            *a += b;
        }
    }

    /// `channels x (height * width)` view as a matrix.
    pub fn to_matrix(&self) -> Matrix {
        Matrix::from_flat(self.channels, self.area(), &self.data)
    }

    /// Inverse of [`Tensor::to_matrix`].
    pub fn from_matrix(m: &Matrix, height: usize, width: usize) -> Tensor {
        assert_eq!(m.cols, height * width, "matrix width does not match spatial size");
        Tensor {
            channels: m.rows,
            height,
            width,
            data: m.to_flat(),
        }
    }

    /// Bilinear resampling with half-pixel centres, the convention used by
    /// common image libraries when scaling photographs.
    pub fn resize_bilinear(&self, height: usize, width: usize) -> Tensor {
        if height == self.height && width == self.width {
            return self.clone();
        }
        let mut out = Tensor::zeros(self.channels, height, width);
        if self.height == 0 || self.width == 0 {
            return out;
        }
        let sy = self.height as f64 / height as f64;
        let sx = self.width as f64 / width as f64;
        for y in 0..height {
            let fy = ((y as f64 + 0.5) * sy - 0.5).clamp(0.0, (self.height - 1) as f64);
            let y0 = fy.floor() as usize;
            let y1 = (y0 + 1).min(self.height - 1);
            let wy = fy - y0 as f64;
            for x in 0..width {
                let fx = ((x as f64 + 0.5) * sx - 0.5).clamp(0.0, (self.width - 1) as f64);
                let x0 = fx.floor() as usize;
                let x1 = (x0 + 1).min(self.width - 1);
                let wx = fx - x0 as f64;
                for c in 0..self.channels {
                    let top = self.get(c, y0, x0) * (1.0 - wx) + self.get(c, y0, x1) * wx;
                    let bottom = self.get(c, y1, x0) * (1.0 - wx) + self.get(c, y1, x1) * wx;
                    out.set(c, y, x, top * (1.0 - wy) + bottom * wy);
                }
            }
        }
        out
    }

    /// Samples channel `c` at a fractional position; outside the map reads 0.
    pub fn sample_bilinear(&self, c: usize, fy: f64, fx: f64) -> f64 {
        if fy < -1.0 || fx < -1.0 || fy > self.height as f64 || fx > self.width as f64 {
            return 0.0;
        }
        let y0 = fy.floor();
        let x0 = fx.floor();
        let wy = fy - y0;
        let wx = fx - x0;
        let read = |y: f64, x: f64| -> f64 {
            if y < 0.0 || x < 0.0 || y >= self.height as f64 || x >= self.width as f64 {
                0.0
            } else {
                self.get(c, y as usize, x as usize)
            }
        };
        let top = read(y0, x0) * (1.0 - wx) + read(y0, x0 + 1.0) * wx;
        let bottom = read(y0 + 1.0, x0) * (1.0 - wx) + read(y0 + 1.0, x0 + 1.0) * wx;
        top * (1.0 - wy) + bottom * wy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_data_checks_shape() {
        assert!(Tensor::from_data(2, 2, 2, vec![0.0; 8]).is_ok());
        assert!(matches!(
            Tensor::from_data(2, 2, 2, vec![0.0; 7]),
            Err(Error::Shape { .. })
        ));
    }

    #[test]
    fn test_index_is_channel_major() {
        let t = Tensor::from_data(2, 2, 3, (0..12).map(|v| v as f64).collect()).unwrap();
        assert_eq!(t.get(1, 0, 0), 6.0);
        assert_eq!(t.get(0, 1, 2), 5.0);
        assert_eq!(t.plane(1), &[6.0, 7.0, 8.0, 9.0, 10.0, 11.0]);
    }

    #[test]
    fn test_matrix_view_round_trip() {
        let t = Tensor::from_data(2, 2, 2, (0..8).map(|v| v as f64).collect()).unwrap();
        let m = t.to_matrix();
        assert_eq!(m.rows, 2);
        assert_eq!(m.cols, 4);
        assert_eq!(Tensor::from_matrix(&m, 2, 2), t);
    }

    #[test]
    fn test_resize_constant_stays_constant() {
        let t = Tensor::from_data(1, 3, 3, vec![0.25; 9]).unwrap();
        let r = t.resize_bilinear(7, 5);
        assert_eq!(r.shape(), (1, 7, 5));
        assert!(r.data.iter().all(|&v| (v - 0.25).abs() < 1e-12));
    }

    #[test]
    fn test_resize_upsample_interpolates() {
        let t = Tensor::from_data(1, 1, 2, vec![0.0, 1.0]).unwrap();
        let r = t.resize_bilinear(1, 4);
        assert_eq!(r.data, vec![0.0, 0.25, 0.75, 1.0]);
    }
}
