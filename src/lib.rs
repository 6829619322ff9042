pub mod api;
pub mod audio;
pub mod config;
pub mod face;
pub mod live;
pub mod media;
pub mod sampler;
pub mod session;
pub mod stt;
pub mod submit;

mod logging;

pub use logging::{init_debug_log_file, log_debug, log_file_path};
pub use session::{ControllerState, RecordingController};
