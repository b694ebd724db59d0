pub mod approval;
pub mod job;
pub mod payload;
pub mod task;
pub mod workflow;

pub use approval::*;
pub use job::*;
pub use payload::*;
pub use task::*;
pub use workflow::*;
