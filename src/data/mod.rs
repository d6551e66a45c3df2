pub mod bar_buffer;
pub mod bar_store;

pub use bar_buffer::ClosedBarBuffer;
pub use bar_store::{BarCommitter, JsonlBarStore};
