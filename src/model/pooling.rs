use candle_core::{Result, Tensor, D};

/// Temporal statistics pooling: concatenated mean and standard deviation over
/// the last (time) axis.
///
/// `(B, C, T)` → `(B, 2C)`. The variance is the unbiased estimate, so `T`
/// must be at least 2.
pub fn statistics_pooling(x: &Tensor) -> Result<Tensor> {
    let mean = x.mean(D::Minus1)?;
    let std = (x.var(D::Minus1)? + 1e-8)?.sqrt()?;
    Tensor::cat(&[&mean, &std], 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_mean_and_std() {
        let x = Tensor::new(&[[[1f32, 3.], [2., 2.]]], &Device::Cpu).unwrap();
        let pooled = statistics_pooling(&x).unwrap();
        assert_eq!(pooled.dims(), &[1, 4]);
        let v: Vec<f32> = pooled.flatten_all().unwrap().to_vec1().unwrap();
        assert!((v[0] - 2.0).abs() < 1e-6);
        assert!((v[1] - 2.0).abs() < 1e-6);
        // unbiased variance of [1, 3] is 2
        assert!((v[2] - 2f32.sqrt()).abs() < 1e-4);
        assert!(v[3].abs() < 1e-3);
    }
}
