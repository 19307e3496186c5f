pub mod config;
pub mod scheduler;
mod server;
mod sink;

pub use scheduler::{run_backup, scheduler_loop};
pub use server::{add_paths, build_router, AppState};
pub use sink::{Notice, StatusBoard, StatusSnapshot};
