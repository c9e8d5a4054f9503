//! GPU resource management: size-bucketed buffer pooling (C2).

pub mod pool;

pub use pool::{BufferPool, BufferPoolError, PooledBuffer};
