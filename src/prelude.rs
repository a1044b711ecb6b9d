pub use crate::config::RuntimeConfig;
pub use crate::error::PipeError;
pub use crate::logger::LoggerConfig;
pub use crate::pipe::PipeValue;
pub use crate::{
    Pipe, blocked, enter_scope, exit_scope, kill_all, killed, open, select, send, sync,
    truncate_all, truncated,
};
