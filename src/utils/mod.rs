//! Shared infrastructure: worker pool and sampling.

pub mod sampler;
pub mod thread_pool;

pub use sampler::FixedRatioSampler;
pub use thread_pool::ThreadPool;
