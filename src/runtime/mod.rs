pub mod manager;

use std::sync::Arc;

use tokio::runtime::{Builder, Runtime};

pub type RuntimeRef = Arc<Runtime>;

pub fn create_runtime(pool_size: usize, name: &str) -> RuntimeRef {
    let runtime = Builder::new_multi_thread()
        .worker_threads(pool_size)
        .thread_name(format!("pool-{}", name))
        .enable_all()
        .build()
        .unwrap_or_else(|e| panic!("Errors on creating the runtime of [{}]. {:?}", name, e));
    Arc::new(runtime)
}
