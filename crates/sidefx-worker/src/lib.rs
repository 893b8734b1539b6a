pub mod errors;
pub mod handler;
pub mod scheduler;

pub use errors::HandlerFailure;
pub use handler::{handle_command, HandlerContext};
pub use scheduler::schedule_after_failure;
