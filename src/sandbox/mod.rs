//! 沙箱执行池：常驻 Python worker 进程、逐行 JSON 线协议、超时与自愈替换

pub mod pool;
pub mod protocol;
pub mod worker;

pub use pool::{PoolOptions, PoolStats, PythonPool, DEFAULT_POOL_SIZE};
pub use protocol::{JobStatus, WorkerRequest, WorkerResponse};
