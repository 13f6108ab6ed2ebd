pub mod agent;
pub mod config;
pub mod error;
pub mod model;
pub mod pipeline;
pub mod plane;
pub mod pool;
pub mod propagate;
pub mod scheduler;
pub mod server;
pub mod shutdown;
pub mod status;
