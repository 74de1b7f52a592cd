pub mod engine;
pub mod local;
pub mod pool;
pub mod room;

pub use engine::{MediaEngine, MediaRouter, MediaWorker};
pub use local::LocalMediaEngine;
pub use pool::{recommended_worker_count, WorkerPool};
pub use room::{VoiceJoinInfo, VoiceRoom};
