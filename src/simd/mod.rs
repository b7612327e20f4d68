//! Vectorized predicate kernels for the dense restriction paths.
//!
//! AVX2 is detected once at startup; every kernel falls back to an
//! unrolled scalar loop elsewhere.

pub mod filter;

use once_cell::sync::Lazy;

pub static HAS_AVX2: Lazy<bool> = Lazy::new(|| {
    #[cfg(target_arch = "x86_64")]
    {
        std::arch::is_x86_feature_detected!("avx2")
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        false
    }
});

pub use filter::{
    run_and_skip, run_dense, run_sparse, BetweenKernel, Eq2Kernel, EqKernel, GtKernel, Kernel,
    LtKernel,
};
